//! Public suffix table used to compute a host's registrable domain

use std::collections::HashSet;
use std::path::Path;

const BUILTIN_SUFFIXES: &[&str] = &[
    "com", "net", "org", "edu", "gov", "mil", "int", "info", "biz", "name", "pro", "io", "dev",
    "app", "xyz", "me", "tv", "cc", "co", "ai", "cloud", "online", "site", "tech", "uk", "co.uk",
    "org.uk", "ac.uk", "gov.uk", "me.uk", "ltd.uk", "plc.uk", "net.uk", "de", "fr", "nl", "be",
    "ch", "at", "it", "es", "se", "no", "dk", "fi", "pl", "cz", "eu", "ru", "ua", "jp", "co.jp",
    "ne.jp", "or.jp", "ac.jp", "cn", "com.cn", "net.cn", "org.cn", "hk", "com.hk", "org.hk",
    "tw", "com.tw", "org.tw", "idv.tw", "kr", "co.kr", "sg", "com.sg", "au", "com.au", "net.au",
    "org.au", "nz", "co.nz", "org.nz", "ca", "us", "br", "com.br", "in", "co.in", "za", "co.za",
    "mx", "com.mx", "ar", "com.ar",
];

/// Set of known public suffixes
#[derive(Debug, Clone)]
pub struct TldMap {
    suffixes: HashSet<String>,
}

impl Default for TldMap {
    fn default() -> Self {
        Self::builtin()
    }
}

impl TldMap {
    pub fn builtin() -> Self {
        Self::from_suffixes(BUILTIN_SUFFIXES.iter().copied())
    }

    pub fn from_suffixes<I, S>(suffixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            suffixes: suffixes
                .into_iter()
                .map(|s| s.as_ref().trim().trim_start_matches('.').to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    /// Load a public-suffix style list: one suffix per line, `//` comments ignored
    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_suffixes(
            content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with("//"))
                // Wildcard and exception rules are matched as plain suffixes
                .map(|l| l.trim_start_matches("*.").trim_start_matches('!')),
        ))
    }

    pub fn contains(&self, suffix: &str) -> bool {
        self.suffixes.contains(suffix)
    }

    pub fn len(&self) -> usize {
        self.suffixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.suffixes.is_empty()
    }

    /// Registrable domain of `host`: the longest known suffix plus one label.
    ///
    /// `a.b.example.co.uk` yields `example.co.uk`. Returns `None` when no
    /// suffix matches or the host is itself a suffix.
    pub fn top_level_domain(&self, host: &str) -> Option<String> {
        let host = host.trim_end_matches('.').to_lowercase();
        let labels: Vec<&str> = host.split('.').collect();

        // Scanning from the left finds the longest suffix first
        for i in 1..labels.len() {
            if self.contains(&labels[i..].join(".")) {
                return Some(labels[i - 1..].join("."));
            }
        }
        None
    }
}
