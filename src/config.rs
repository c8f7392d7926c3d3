//! Options controlling an archive run, and the output naming derived from them.

use crate::{
    encoder::ArchiveMode,
    error::{Error, Result},
    MIN_PART_SIZE,
};

pub const DEFAULT_CACHE_SIZE: usize = 5;
pub const DEFAULT_PART_SIZE_MULTIPLIER: u64 = 10;
pub const DEFAULT_MAX_RETRIES: u32 = 4;
pub const DEFAULT_STORAGE_CLASS: &str = "STANDARD";

/// Everything that can be configured about an archive run.
///
/// Created with [`ArchiveConfig::new`], which fills in the defaults; adjust the public fields
/// before handing it to [`ArchivePlanner::new`](crate::planner::ArchivePlanner::new).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveConfig {
    pub source_bucket: String,
    /// Key of the output archive.  Its extension selects the format.
    pub target_key: String,
    /// Defaults to the source bucket.
    pub target_bucket: Option<String>,
    /// Split the output into several archives of at least this many bytes each.
    pub min_file_size: Option<u64>,
    /// Number of fetched objects held in memory, and the number of concurrent downloads.
    pub cache_size: usize,
    pub allow_dups: bool,
    /// Store each object's user metadata in a `<member>.metadata.json` entry.
    pub save_metadata: bool,
    /// Delete the source objects once every archive has been written.
    pub remove_keys: bool,
    /// Parts are uploaded once they reach this many times the minimum part size.
    pub part_size_multiplier: u64,
    pub max_retries: u32,
    pub storage_class: String,
}

impl ArchiveConfig {
    pub fn new(source_bucket: impl Into<String>, target_key: impl Into<String>) -> Self {
        Self {
            source_bucket: source_bucket.into(),
            target_key: target_key.into(),
            target_bucket: None,
            min_file_size: None,
            cache_size: DEFAULT_CACHE_SIZE,
            allow_dups: false,
            save_metadata: false,
            remove_keys: false,
            part_size_multiplier: DEFAULT_PART_SIZE_MULTIPLIER,
            max_retries: DEFAULT_MAX_RETRIES,
            storage_class: DEFAULT_STORAGE_CLASS.to_string(),
        }
    }

    pub fn target_bucket(&self) -> &str {
        self.target_bucket.as_deref().unwrap_or(&self.source_bucket)
    }

    /// The size at which an assembled part is uploaded.
    pub fn part_size(&self) -> u64 {
        MIN_PART_SIZE.saturating_mul(self.part_size_multiplier)
    }

    /// Checks the configuration and derives the output descriptor from it.
    pub fn validate(&self) -> Result<ArchiveOutput> {
        if self.source_bucket.is_empty() {
            return Err(Error::Configuration("source bucket must be set".into()));
        }
        if self.cache_size == 0 {
            return Err(Error::Configuration("cache size must be 1 or larger".into()));
        }
        if self.max_retries == 0 {
            return Err(Error::Configuration(
                "s3 max retries must be 1 or larger".into(),
            ));
        }
        if self.part_size_multiplier == 0 {
            return Err(Error::Configuration(
                "part size multiplier must be 1 or larger".into(),
            ));
        }
        ArchiveOutput::new(&self.target_key, self.min_file_size.is_some())
    }
}

/// Where the output goes and what format it has.  Fixed for the lifetime of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveOutput {
    target_key: String,
    mode: ArchiveMode,
    numbered: bool,
}

impl ArchiveOutput {
    /// `numbered` outputs get a `-N` suffix before the extension, because the number of
    /// archives is not known in advance.
    pub fn new(target_key: &str, numbered: bool) -> Result<Self> {
        let mode = [ArchiveMode::Plain, ArchiveMode::Gzip, ArchiveMode::Bzip2]
            .into_iter()
            .find(|mode| target_key.ends_with(mode.extension()))
            .ok_or_else(|| {
                Error::Configuration(format!("invalid file extension: {target_key}"))
            })?;

        Ok(Self {
            target_key: target_key.to_string(),
            mode,
            numbered,
        })
    }

    pub fn mode(&self) -> ArchiveMode {
        self.mode
    }

    pub fn content_type(&self) -> &'static str {
        self.mode.content_type()
    }

    /// The key of output archive number `file_number` (counting from 1).
    pub fn path_for(&self, file_number: usize) -> String {
        if !self.numbered {
            return self.target_key.clone();
        }
        let extension = self.mode.extension();
        let stem = &self.target_key[..self.target_key.len() - extension.len()];
        format!("{stem}-{file_number}{extension}")
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_extensions() {
        let cases = [
            ("my-data.tar", ArchiveMode::Plain, "application/x-tar"),
            ("dir/my-data.tar.gz", ArchiveMode::Gzip, "application/gzip"),
            ("my-data.tar.bz2", ArchiveMode::Bzip2, "application/x-bzip2"),
        ];
        for (key, mode, content_type) in cases {
            let output = ArchiveOutput::new(key, false).unwrap();
            assert_eq!(output.mode(), mode);
            assert_eq!(output.content_type(), content_type);
            assert_eq!(output.path_for(1), key);
            assert_eq!(output.path_for(7), key);
        }
    }

    #[test]
    fn test_bad_extension() {
        for key in ["my-data.zip", "my-data.tgz", "my-data.tar.xz", "tar"] {
            assert!(matches!(
                ArchiveOutput::new(key, false),
                Err(Error::Configuration(_))
            ));
        }
    }

    #[test]
    fn test_numbered_names() {
        let output = ArchiveOutput::new("backups/my.data.tar.gz", true).unwrap();
        assert_eq!(output.path_for(1), "backups/my.data-1.tar.gz");
        assert_eq!(output.path_for(12), "backups/my.data-12.tar.gz");

        let output = ArchiveOutput::new("out.tar", true).unwrap();
        assert_eq!(output.path_for(3), "out-3.tar");
    }

    #[test]
    fn test_defaults() {
        let config = ArchiveConfig::new("source", "out.tar");
        assert_eq!(config.target_bucket(), "source");
        assert_eq!(config.cache_size, 5);
        assert_eq!(config.max_retries, 4);
        assert_eq!(config.part_size(), 10 * MIN_PART_SIZE);
        assert_eq!(config.storage_class, "STANDARD");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let base = ArchiveConfig::new("source", "out.tar");

        let mut config = base.clone();
        config.cache_size = 0;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        let mut config = base.clone();
        config.max_retries = 0;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        let mut config = base.clone();
        config.part_size_multiplier = 0;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        let mut config = base;
        config.target_bucket = Some("elsewhere".into());
        assert_eq!(config.target_bucket(), "elsewhere");
    }
}
