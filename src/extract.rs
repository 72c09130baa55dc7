//! Extraction of file links from index-page HTML.
//!
//! Pure text processing: no I/O, deterministic, restartable. Anchors are
//! matched with a regex rather than a DOM parse because the listing pages
//! are machine-generated and the link shape is fixed.

use regex::{Regex, RegexBuilder};

use crate::config::DataSetConfig;

/// A key and its absolute download URL, as found on an index page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedLink {
    pub key: String,
    pub url: String,
}

/// Compiled matcher for one data set's file links.
pub struct LinkExtractor {
    link_regex: Regex,
    key_regex: Regex,
    key_prefix: String,
    site_root: String,
}

impl LinkExtractor {
    pub fn new(config: &DataSetConfig) -> Result<Self, regex::Error> {
        let prefix = regex::escape(&config.key_prefix);
        // Match href="...DataSet%20N/<prefix>12345678.pdf" or the
        // space-separated folder form. The trailing slash keeps set 1
        // from matching inside "DataSet 11".
        let link_pattern = format!(
            r#"href\s*=\s*["']([^"']*DataSet(?:%20|\s){id}/[^"']*{prefix}\d{{8}}\.pdf)["']"#,
            id = config.id,
        );
        let link_regex = RegexBuilder::new(&link_pattern)
            .case_insensitive(true)
            .build()?;
        let key_regex = RegexBuilder::new(&format!(r"{prefix}(\d{{8}})"))
            .case_insensitive(true)
            .build()?;

        Ok(Self {
            link_regex,
            key_regex,
            key_prefix: config.key_prefix.clone(),
            site_root: config.site_root(),
        })
    }

    /// Extract all of this data set's file links from HTML, deduplicated
    /// by key and ordered by key. The first observation of a key wins.
    pub fn extract(&self, html: &str) -> Vec<ExtractedLink> {
        let mut by_key = std::collections::BTreeMap::new();

        for capture in self.link_regex.captures_iter(html) {
            let href = &capture[1];
            let Some(key) = self.key_from(href) else {
                continue;
            };
            let url = self.absolutize(href);
            by_key.entry(key).or_insert(url);
        }

        by_key
            .into_iter()
            .map(|(key, url)| ExtractedLink { key, url })
            .collect()
    }

    /// Canonical key for a URL or filename, when one is present.
    pub fn key_from(&self, text: &str) -> Option<String> {
        self.key_regex
            .captures(text)
            .map(|c| format!("{}{}", self.key_prefix, &c[1]))
    }

    /// Whether a string is exactly `prefix + 8 digits`.
    pub fn is_valid_key(&self, key: &str) -> bool {
        key.strip_prefix(&self.key_prefix)
            .map(|digits| digits.len() == 8 && digits.bytes().all(|b| b.is_ascii_digit()))
            .unwrap_or(false)
    }

    /// Resolve an href against the site root. `%20` is preserved so the
    /// resulting URL fetches as-is.
    fn absolutize(&self, href: &str) -> String {
        let lowered = href.to_ascii_lowercase();
        if lowered.starts_with("http://") || lowered.starts_with("https://") {
            href.to_string()
        } else if href.starts_with('/') {
            format!("{}{href}", self.site_root)
        } else {
            format!("{}/{href}", self.site_root)
        }
    }
}
