use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};

use s3_tar::{
    config::{
        ArchiveConfig, DEFAULT_CACHE_SIZE, DEFAULT_MAX_RETRIES, DEFAULT_PART_SIZE_MULTIPLIER,
        DEFAULT_STORAGE_CLASS,
    },
    planner::ArchivePlanner,
    size::parse_size,
    store::s3::S3Store,
};

const LOG_LEVEL_VAR: &str = "S3_TAR_LOG_LEVEL";

/// Tar (and compress) objects in an S3 bucket into archives in S3
#[derive(Debug, Parser)]
#[clap(name = "s3-tar", version)]
pub struct App {
    /// bucket the files are read from
    #[clap(long)]
    source_bucket: String,
    /// prefix of the objects to archive
    #[clap(long)]
    folder: String,
    /// key of the output archive; must end in .tar, .tar.gz or .tar.bz2
    #[clap(long)]
    filename: String,
    /// bucket the archive is written to (defaults to the source bucket)
    #[clap(long)]
    target_bucket: Option<String>,
    /// split the output into archives of at least this size, e.g. 2GB
    #[clap(long)]
    min_filesize: Option<String>,
    /// store each object's metadata in a .metadata.json entry next to it
    #[clap(long)]
    save_metadata: bool,
    /// delete the source objects once the archive is written
    #[clap(long)]
    remove: bool,
    /// keep the paths of the objects below the folder
    #[clap(long)]
    preserve_paths: bool,
    /// allow several objects with the same name in the archive
    #[clap(long)]
    allow_dups: bool,
    /// number of objects fetched ahead of the upload
    #[clap(long, default_value_t = DEFAULT_CACHE_SIZE)]
    cache_size: usize,
    /// maximum attempts for each S3 request
    #[clap(long, default_value_t = DEFAULT_MAX_RETRIES)]
    s3_max_retries: u32,
    /// upload parts of this many times the 5MB minimum
    #[clap(long, default_value_t = DEFAULT_PART_SIZE_MULTIPLIER)]
    part_size_multiplier: u64,
    /// storage class of the created archives
    #[clap(long, default_value = DEFAULT_STORAGE_CLASS)]
    storage_class: String,
}

impl App {
    fn config(&self) -> Result<ArchiveConfig> {
        let mut config = ArchiveConfig::new(&self.source_bucket, &self.filename);
        config.target_bucket = self.target_bucket.clone();
        config.min_file_size = match &self.min_filesize {
            Some(size) => Some(parse_size(size)? as u64),
            None => None,
        };
        config.cache_size = self.cache_size;
        config.allow_dups = self.allow_dups;
        config.save_metadata = self.save_metadata;
        config.remove_keys = self.remove;
        config.part_size_multiplier = self.part_size_multiplier;
        config.max_retries = self.s3_max_retries;
        config.storage_class = self.storage_class.clone();
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::new().filter_or(LOG_LEVEL_VAR, "info")).init();

    let args = App::parse();
    let config = args.config()?;

    let store = Arc::new(S3Store::connect(2 * config.cache_size, config.max_retries).await);
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")?
            .progress_chars("##-"),
    );

    let mut planner = ArchivePlanner::new(store, config)?.with_progress(bar.clone());
    planner
        .add_files(&args.folder, "", args.preserve_paths)
        .await
        .with_context(|| format!("collecting objects below {}", args.folder))?;

    let summary = planner.run().await?;
    bar.finish_and_clear();

    for archive in &summary.archives {
        println!("{archive}");
    }
    if summary.deleted > 0 {
        log::info!("Removed {} source objects", summary.deleted);
    }
    Ok(())
}
