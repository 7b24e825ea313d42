//! CDN line management
//!
//! Tracks the redundant delivery endpoints of one logical source, which one
//! is current, and which have failed during this session. Readers snapshot
//! the current line before each request, so a switch only affects requests
//! issued after it.

use crate::{transport::parse_uri, Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

/// One delivery endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CdnLine {
    pub index: usize,
    pub endpoint: String,
    /// Access token appended to requests (empty = none)
    pub token: String,
    /// Timestamp that goes with the token
    pub token_timestamp: i64,
}

impl CdnLine {
    /// URL to request, carrying the token when one is set
    pub fn request_url(&self) -> Result<Url> {
        let mut url = parse_uri(&self.endpoint)?;
        if !self.token.is_empty() && matches!(url.scheme(), "http" | "https") {
            url.query_pairs_mut()
                .append_pair("token", &self.token)
                .append_pair("ts", &self.token_timestamp.to_string());
        }
        Ok(url)
    }
}

/// Endpoints of a logical CDN source, in line order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdnSource {
    pub lines: Vec<String>,
}

impl From<&str> for CdnSource {
    fn from(src: &str) -> Self {
        Self { lines: vec![src.to_string()] }
    }
}

impl From<String> for CdnSource {
    fn from(src: String) -> Self {
        Self { lines: vec![src] }
    }
}

impl From<Vec<String>> for CdnSource {
    fn from(lines: Vec<String>) -> Self {
        Self { lines }
    }
}

/// Why the current line changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineSwitchReason {
    Manual,
    AutoFailover,
}

/// Line table and failover policy for one source
#[derive(Debug, Clone)]
pub struct CdnLineManager {
    lines: Vec<CdnLine>,
    current: usize,
    unreachable: Vec<bool>,
    auto_switch: bool,
}

impl CdnLineManager {
    pub fn new(endpoints: Vec<String>, auto_switch: bool) -> Self {
        let lines: Vec<CdnLine> = endpoints
            .into_iter()
            .enumerate()
            .map(|(index, endpoint)| CdnLine {
                index,
                endpoint,
                token: String::new(),
                token_timestamp: 0,
            })
            .collect();
        let unreachable = vec![false; lines.len()];
        Self {
            lines,
            current: 0,
            unreachable,
            auto_switch,
        }
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    pub fn lines(&self) -> &[CdnLine] {
        &self.lines
    }

    /// Index of the current line, `None` when there are no lines
    pub fn current_index(&self) -> Option<usize> {
        (!self.lines.is_empty()).then_some(self.current)
    }

    pub fn current_line(&self) -> Option<&CdnLine> {
        self.lines.get(self.current)
    }

    pub fn is_unreachable(&self, index: usize) -> bool {
        self.unreachable.get(index).copied().unwrap_or(false)
    }

    pub fn auto_switch(&self) -> bool {
        self.auto_switch
    }

    pub fn set_auto_switch(&mut self, enable: bool) {
        self.auto_switch = enable;
    }

    /// Make `index` current for subsequent reads; returns the previous index
    pub fn switch_to(&mut self, index: usize) -> Result<usize> {
        if index >= self.lines.len() {
            return Err(Error::IndexOutOfRange {
                index,
                count: self.lines.len(),
            });
        }
        let previous = self.current;
        self.current = index;
        info!(from = previous, to = index, "CDN line switched");
        Ok(previous)
    }

    /// Update token and timestamp of the current line only
    pub fn renew_token(&mut self, token: impl Into<String>, ts: i64) -> Result<usize> {
        let current = self.current;
        let line = self
            .lines
            .get_mut(current)
            .ok_or_else(|| Error::InvalidArgument("source has no CDN lines".into()))?;
        line.token = token.into();
        line.token_timestamp = ts;
        debug!(line = current, ts, "CDN token renewed");
        Ok(current)
    }

    /// Record a transport failure on `failed`.
    ///
    /// With auto-switch armed and `failed` still current, advances
    /// round-robin to the next line not marked unreachable. When every line
    /// is marked, the marks are cleared and the next line in order is used.
    /// Returns the new current index when it changed.
    pub fn report_failure(&mut self, failed: usize) -> Option<usize> {
        let count = self.lines.len();
        if failed >= count {
            return None;
        }
        self.unreachable[failed] = true;

        if !self.auto_switch || failed != self.current {
            return None;
        }

        let next = (1..=count)
            .map(|step| (self.current + step) % count)
            .find(|&i| !self.unreachable[i]);
        let next = match next {
            Some(i) => i,
            None => {
                warn!(lines = count, "All CDN lines failed, clearing marks");
                self.unreachable.iter_mut().for_each(|m| *m = false);
                (self.current + 1) % count
            }
        };

        if next == self.current {
            return None;
        }
        info!(from = self.current, to = next, "CDN failover");
        self.current = next;
        Some(next)
    }
}
