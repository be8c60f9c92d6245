//! Endpoint list loading and result export

use crate::proxy::models::{ProxyKind, ProxyResult, ResultSetExt};
use crate::proxy::probe::HostPort;
use crate::Result;
use anyhow::anyhow;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// `scheme://host:port` with an optional trailing slash
static URL_FORMAT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?i)(https?|socks[45])://([^/\s]+?)/?$").expect("Invalid proxy URL regex")
});

/// IPv4 `ip:port` embedded in arbitrary text
static IP_PORT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(\d{1,3}(?:\.\d{1,3}){3}):(\d{1,5})\b").expect("Invalid IP:PORT regex")
});

/// One line of an endpoint list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEntry {
    /// Normalized `host:port`
    pub endpoint: String,
    /// Kind given by a `scheme://` prefix, if any
    pub kind: Option<ProxyKind>,
}

/// How live results are written out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExportFormat {
    /// `host:port` per line
    #[default]
    Plain,
    /// `kind://host:port` per line
    WithKind,
    /// JSON array of full results
    Json,
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExportFormat::Plain => "plain",
            ExportFormat::WithKind => "with-kind",
            ExportFormat::Json => "json",
        };
        f.write_str(s)
    }
}

impl FromStr for ExportFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "plain" => Ok(ExportFormat::Plain),
            "with-kind" | "with-type" => Ok(ExportFormat::WithKind),
            "json" => Ok(ExportFormat::Json),
            _ => Err(anyhow!(
                "Invalid export format: {}. Use: plain, with-kind, json",
                s
            )),
        }
    }
}

/// Parser for endpoint lists
pub struct ProxyParser;

impl ProxyParser {
    /// Parse a single line
    ///
    /// Supports `host:port`, `[v6]:port` and `scheme://host:port` where the
    /// scheme is one of http, https, socks4, socks5. Blank lines and `#`
    /// comments yield `None`.
    pub fn parse_line(line: &str) -> Option<ProxyEntry> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        if let Some(caps) = URL_FORMAT.captures(line) {
            let kind = caps[1].parse::<ProxyKind>().ok()?;
            let address = HostPort::parse(&caps[2]).ok()?;
            return Some(ProxyEntry {
                endpoint: address.to_string(),
                kind: Some(kind),
            });
        }

        let address = HostPort::parse(line).ok()?;
        Some(ProxyEntry {
            endpoint: address.to_string(),
            kind: None,
        })
    }

    /// Parse many lines, dropping duplicates while keeping first-seen order.
    ///
    /// Lines that are not endpoints themselves are scanned for embedded
    /// IPv4 `ip:port` pairs, so pasted tables and logs work too.
    pub fn parse_string(content: &str) -> Vec<ProxyEntry> {
        let mut seen = HashSet::new();
        let mut entries = Vec::new();

        for line in content.lines() {
            let parsed = match Self::parse_line(line) {
                Some(entry) => vec![entry],
                None if line.trim_start().starts_with('#') => Vec::new(),
                None => Self::extract_embedded(line),
            };
            for entry in parsed {
                if seen.insert(entry.endpoint.clone()) {
                    entries.push(entry);
                }
            }
        }

        entries
    }

    fn extract_embedded(line: &str) -> Vec<ProxyEntry> {
        IP_PORT_REGEX
            .captures_iter(line)
            .filter_map(|cap| {
                let host = cap.get(1)?.as_str();
                let port: u16 = cap.get(2)?.as_str().parse().ok()?;
                if port == 0 || host.split('.').any(|octet| octet.parse::<u8>().is_err()) {
                    return None;
                }
                Some(ProxyEntry {
                    endpoint: format!("{}:{}", host, port),
                    kind: None,
                })
            })
            .collect()
    }

    /// Parse endpoints from a file
    pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<Vec<ProxyEntry>> {
        let content = fs::read_to_string(path)?;
        Ok(Self::parse_string(&content))
    }

    /// Endpoint strings of a parsed list
    pub fn endpoints(entries: &[ProxyEntry]) -> Vec<String> {
        entries.iter().map(|e| e.endpoint.clone()).collect()
    }

    /// The kind every entry declares, if they all declare the same one
    pub fn common_kind(entries: &[ProxyEntry]) -> Option<ProxyKind> {
        let first = entries.first()?.kind?;
        entries
            .iter()
            .all(|e| e.kind == Some(first))
            .then_some(first)
    }

    /// Render the live results in `format`
    pub fn export(results: &[ProxyResult], format: ExportFormat) -> Result<String> {
        let content = match format {
            ExportFormat::Plain => results.live_endpoints().join("\n"),
            ExportFormat::WithKind => results.live_endpoints_with_kind().join("\n"),
            ExportFormat::Json => {
                let live: Vec<&ProxyResult> = results.iter().filter(|r| r.is_live()).collect();
                serde_json::to_string_pretty(&live)?
            }
        };
        Ok(content)
    }

    /// Write the live results to `path`
    pub fn save_to_file<P: AsRef<Path>>(results: &[ProxyResult], path: P, format: ExportFormat) -> Result<()> {
        let content = Self::export(results, format)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Write plain endpoints, one per line
    pub fn save_endpoints<P: AsRef<Path>>(endpoints: &[String], path: P) -> Result<()> {
        fs::write(path, endpoints.join("\n"))?;
        Ok(())
    }
}
