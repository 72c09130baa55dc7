//! Cookie handling for authenticated fetches.
//!
//! The canonical deployment only needs a single age-verification cookie,
//! but operators often export a full browser session as a Netscape-format
//! `cookies.txt`; this module parses that format and renders a `Cookie:`
//! header for a given URL.

use std::path::Path;

use chrono::Utc;

/// One cookie with the attributes that matter for header rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    pub secure: bool,
    /// Unix expiry; 0 means a session cookie that never expires here.
    pub expires: i64,
}

impl Cookie {
    /// Whether this cookie applies to a request host.
    ///
    /// Exact match, or suffix match on a dot boundary (`.justice.gov`
    /// and `justice.gov` both match `www.justice.gov`).
    pub fn matches(&self, host: &str, secure_request: bool, now: i64) -> bool {
        if self.expires != 0 && self.expires < now {
            return false;
        }
        if self.secure && !secure_request {
            return false;
        }
        let domain = self.domain.trim_start_matches('.');
        if host == domain {
            return true;
        }
        host.strip_suffix(domain)
            .map(|head| head.ends_with('.'))
            .unwrap_or(false)
    }

    pub fn to_header_fragment(&self) -> String {
        format!("{}={}", self.name, self.value)
    }
}

/// A set of cookies loaded from a Netscape-format file.
#[derive(Debug, Clone, Default)]
pub struct CookieJar {
    cookies: Vec<Cookie>,
}

impl CookieJar {
    /// Load a Netscape `cookies.txt` file.
    pub fn from_netscape_file(path: &Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::parse_netscape(&text))
    }

    /// Parse Netscape cookie-file text: seven tab-separated fields per
    /// line, `#` comments skipped, the `#HttpOnly_` domain prefix
    /// tolerated. Malformed lines are dropped silently.
    pub fn parse_netscape(text: &str) -> Self {
        let mut cookies = Vec::new();
        for line in text.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            let line = if let Some(rest) = line.strip_prefix("#HttpOnly_") {
                rest
            } else if line.starts_with('#') {
                continue;
            } else {
                line
            };

            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() != 7 {
                continue;
            }
            let expires = fields[4].parse::<i64>().unwrap_or(0);
            cookies.push(Cookie {
                domain: fields[0].to_string(),
                // fields[1] is the include-subdomains flag; domain
                // suffix matching already covers it.
                path: fields[2].to_string(),
                secure: fields[3].eq_ignore_ascii_case("TRUE"),
                expires,
                name: fields[5].to_string(),
                value: fields[6].to_string(),
            });
        }
        Self { cookies }
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Render the `Cookie:` header value for a URL, or `None` when no
    /// cookie applies.
    pub fn header_for_url(&self, url: &str) -> Option<String> {
        let parsed = url::Url::parse(url).ok()?;
        let host = parsed.host_str()?;
        let secure = parsed.scheme() == "https";
        let now = Utc::now().timestamp();

        let header = self
            .cookies
            .iter()
            .filter(|c| c.matches(host, secure, now))
            .map(Cookie::to_header_fragment)
            .collect::<Vec<_>>()
            .join("; ");

        if header.is_empty() {
            None
        } else {
            Some(header)
        }
    }
}
