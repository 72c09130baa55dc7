//! Run configuration: data-set descriptions and engine tuning knobs.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Smallest data-set id published so far.
pub const MIN_DATA_SET: u32 = 1;
/// Largest data-set id published so far.
pub const MAX_DATA_SET: u32 = 12;

/// Cookie the canonical deployment requires before serving files.
pub const REQUIRED_COOKIE: &str = "justiceGovAgeVerified=true";

/// User agent sent with every request.
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Width of the numeric part of a key.
pub const KEY_DIGITS: usize = 8;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("data set must be between {MIN_DATA_SET} and {MAX_DATA_SET}, got {0}")]
    DataSetOutOfRange(u32),
    #[error("enumeration range is inverted: first_id {first} > last_id {last}")]
    InvertedRange { first: u64, last: u64 },
    #[error("concurrency must be between 1 and 10000, got {0}")]
    ConcurrencyOutOfRange(usize),
    #[error("enumeration bounds are not configured for this data set")]
    MissingRange,
    #[error("base URL is not valid: {0}")]
    BadBaseUrl(String),
}

/// A namespace of keys sharing a listing URL, a file URL base, and
/// enumeration bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSetConfig {
    /// Data-set number (9, 11, ...).
    pub id: u32,
    /// Human-readable name.
    pub name: String,
    /// Base URL for index pages. Page 0 is the base URL itself,
    /// page n >= 1 appends `?page=n`.
    pub base_url: String,
    /// Base URL for files; a key's URL is `file_url_base + key + ".pdf"`.
    pub file_url_base: String,
    /// Prefix of every key in this set (e.g. "EFTA").
    pub key_prefix: String,
    /// First integer id for enumeration, when known.
    pub first_id: Option<u64>,
    /// Last integer id for enumeration, when known.
    pub last_id: Option<u64>,
    /// Highest page index, used as a fallback when probing fails.
    pub max_page_index: Option<u32>,
}

impl DataSetConfig {
    /// Build the canonical configuration for a published data set.
    ///
    /// Page count is probed at runtime; enumeration bounds are only
    /// pre-filled for sets where the id range has been mapped.
    pub fn for_data_set(id: u32) -> Result<Self, ConfigError> {
        if !(MIN_DATA_SET..=MAX_DATA_SET).contains(&id) {
            return Err(ConfigError::DataSetOutOfRange(id));
        }
        let mut config = Self {
            id,
            name: format!("Data Set {id}"),
            base_url: format!(
                "https://www.justice.gov/epstein/doj-disclosures/data-set-{id}-files"
            ),
            file_url_base: format!("https://www.justice.gov/epstein/files/DataSet%20{id}/"),
            key_prefix: "EFTA".to_string(),
            first_id: None,
            last_id: None,
            max_page_index: None,
        };
        // Known id range for set 11; ranges grow over time and can be
        // overridden from the command line.
        if id == 11 {
            config.first_id = Some(2_205_655);
            config.last_id = Some(2_730_262);
        }
        Ok(config)
    }

    /// Validate cross-field constraints before a run starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_DATA_SET..=MAX_DATA_SET).contains(&self.id) {
            return Err(ConfigError::DataSetOutOfRange(self.id));
        }
        if let (Some(first), Some(last)) = (self.first_id, self.last_id) {
            if first > last {
                return Err(ConfigError::InvertedRange { first, last });
            }
        }
        url::Url::parse(&self.base_url)
            .map_err(|e| ConfigError::BadBaseUrl(format!("{}: {e}", self.base_url)))?;
        Ok(())
    }

    /// Format an integer id as a full key (`EFTA` + zero-padded digits).
    pub fn format_key(&self, id: u64) -> String {
        format!("{}{:0width$}", self.key_prefix, id, width = KEY_DIGITS)
    }

    /// URL of an index page.
    pub fn page_url(&self, page_number: u32) -> String {
        if page_number == 0 {
            self.base_url.clone()
        } else {
            format!("{}?page={page_number}", self.base_url)
        }
    }

    /// Download URL for a key.
    pub fn file_url(&self, key: &str) -> String {
        format!("{}{key}.pdf", self.file_url_base)
    }

    /// Scheme and host used to absolutize relative hrefs on index pages.
    pub fn site_root(&self) -> String {
        match url::Url::parse(&self.base_url) {
            Ok(parsed) => match parsed.host_str() {
                Some(host) => format!("{}://{host}", parsed.scheme()),
                None => self.base_url.clone(),
            },
            Err(_) => self.base_url.clone(),
        }
    }
}

/// Tuning knobs for a run. Field defaults match the canonical deployment.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Work-store database path.
    pub db_path: PathBuf,
    /// Root directory for downloaded files.
    pub storage_root: PathBuf,
    /// Admission-control cap for simultaneous downloads. Adjustable at
    /// runtime through the controller.
    pub max_concurrent_downloads: usize,
    /// Number of index pages scraped at a time.
    pub max_concurrent_scrapes: usize,
    /// Failed items retry until they accumulate this many attempts.
    pub max_retries: u32,
    /// Per-file download timeout.
    pub download_timeout: Duration,
    /// Index-page fetch timeout.
    pub page_timeout: Duration,
    /// Literal Cookie header value. Takes precedence over `cookie_file`.
    pub cookie: Option<String>,
    /// Netscape-format cookie file.
    pub cookie_file: Option<PathBuf>,
    /// Re-download files that already exist on disk.
    pub overwrite_existing: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("corpusgrab.db"),
            storage_root: PathBuf::from("downloads"),
            max_concurrent_downloads: 1000,
            max_concurrent_scrapes: 30,
            max_retries: 3,
            download_timeout: Duration::from_secs(300),
            page_timeout: Duration::from_secs(60),
            cookie: None,
            cookie_file: None,
            overwrite_existing: false,
        }
    }
}

impl EngineSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_downloads == 0 || self.max_concurrent_downloads > 10_000 {
            return Err(ConfigError::ConcurrencyOutOfRange(
                self.max_concurrent_downloads,
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_data_set_builds_canonical_urls() {
        let config = DataSetConfig::for_data_set(11).unwrap();
        assert_eq!(
            config.base_url,
            "https://www.justice.gov/epstein/doj-disclosures/data-set-11-files"
        );
        assert_eq!(
            config.file_url_base,
            "https://www.justice.gov/epstein/files/DataSet%2011/"
        );
        assert_eq!(config.first_id, Some(2_205_655));
        assert_eq!(config.last_id, Some(2_730_262));
    }

    #[test]
    fn test_for_data_set_rejects_out_of_range() {
        assert!(DataSetConfig::for_data_set(0).is_err());
        assert!(DataSetConfig::for_data_set(13).is_err());
    }

    #[test]
    fn test_format_key_pads_to_eight_digits() {
        let config = DataSetConfig::for_data_set(11).unwrap();
        assert_eq!(config.format_key(2_205_655), "EFTA02205655");
        assert_eq!(config.format_key(7), "EFTA00000007");
    }

    #[test]
    fn test_page_url() {
        let config = DataSetConfig::for_data_set(9).unwrap();
        assert_eq!(config.page_url(0), config.base_url);
        assert_eq!(config.page_url(3), format!("{}?page=3", config.base_url));
    }

    #[test]
    fn test_file_url_preserves_encoded_space() {
        let config = DataSetConfig::for_data_set(11).unwrap();
        assert_eq!(
            config.file_url("EFTA02205655"),
            "https://www.justice.gov/epstein/files/DataSet%2011/EFTA02205655.pdf"
        );
    }

    #[test]
    fn test_site_root() {
        let config = DataSetConfig::for_data_set(11).unwrap();
        assert_eq!(config.site_root(), "https://www.justice.gov");
    }

    #[test]
    fn test_validate_rejects_inverted_range() {
        let mut config = DataSetConfig::for_data_set(11).unwrap();
        config.first_id = Some(100);
        config.last_id = Some(50);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvertedRange { .. })
        ));
    }

    #[test]
    fn test_settings_validate_concurrency() {
        let mut settings = EngineSettings::default();
        assert!(settings.validate().is_ok());
        settings.max_concurrent_downloads = 0;
        assert!(settings.validate().is_err());
        settings.max_concurrent_downloads = 20_000;
        assert!(settings.validate().is_err());
    }
}
