//! Running shell table: matches requests to tenants by host and URL prefix.
//!
//! Readers load an immutable snapshot through `ArcSwap`, so matching never
//! takes a lock and never observes a half-updated table.

use std::sync::Arc;

use arc_swap::ArcSwap;
use shellhost_core::{normalize_host, RequestHead, ShellSettings, TenantId, TenantResolver};

/// How a shell's host binding matched the request host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum HostMatch {
    Exact,
    Wildcard,
    Any,
}

#[derive(Debug)]
struct ShellEntry {
    settings: Arc<ShellSettings>,
    /// Normalized host, or the suffix (with leading dot) for `*.domain`.
    host: Option<HostPattern>,
    prefix: Option<String>,
}

#[derive(Debug)]
enum HostPattern {
    Exact(String),
    Wildcard(String),
}

impl ShellEntry {
    fn new(settings: Arc<ShellSettings>) -> Self {
        let host = settings
            .request_url_host
            .as_deref()
            .and_then(|h| match h.trim().strip_prefix("*.") {
                Some(domain) => normalize_host(domain).map(|d| HostPattern::Wildcard(format!(".{d}"))),
                None => normalize_host(h).map(HostPattern::Exact),
            });
        let prefix = settings
            .request_url_prefix
            .as_deref()
            .map(|p| p.trim_matches('/').to_ascii_lowercase())
            .filter(|p| !p.is_empty());
        Self {
            settings,
            host,
            prefix,
        }
    }

    fn host_match(&self, host: Option<&str>) -> Option<HostMatch> {
        match (&self.host, host) {
            (None, _) => Some(HostMatch::Any),
            (Some(HostPattern::Exact(expected)), Some(host)) if expected == host => {
                Some(HostMatch::Exact)
            }
            (Some(HostPattern::Wildcard(suffix)), Some(host)) if host.ends_with(suffix.as_str()) => {
                Some(HostMatch::Wildcard)
            }
            _ => None,
        }
    }

    fn prefix_matches(&self, segment: Option<&str>) -> bool {
        match (&self.prefix, segment) {
            (None, _) => true,
            (Some(prefix), Some(segment)) => prefix.eq_ignore_ascii_case(segment),
            (Some(_), None) => false,
        }
    }

    /// Lower is more specific. Within a host class, a prefix match wins.
    fn rank(&self, host: Option<&str>, segment: Option<&str>) -> Option<(HostMatch, bool)> {
        let host_match = self.host_match(host)?;
        if !self.prefix_matches(segment) {
            return None;
        }
        Some((host_match, self.prefix.is_none()))
    }
}

/// Table of running shells, used as the default [`TenantResolver`].
///
/// Matching order, most specific first:
/// 1. exact host with a matching prefix, then exact host without prefix
/// 2. wildcard host (`*.example.com`) with a matching prefix, then without
/// 3. any host with a matching prefix
/// 4. the fallback shell (no host, no prefix)
///
/// Ties go to the shell registered first.
#[derive(Debug)]
pub struct RunningShellTable {
    entries: ArcSwap<Vec<ShellEntry>>,
}

impl RunningShellTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Replaces the table contents with the given running shells.
    pub fn replace_all(&self, shells: impl IntoIterator<Item = Arc<ShellSettings>>) {
        let entries = shells
            .into_iter()
            .filter(|s| s.is_running())
            .map(ShellEntry::new)
            .collect();
        self.entries.store(Arc::new(entries));
    }

    /// Adds or replaces a single shell.
    pub fn upsert(&self, settings: Arc<ShellSettings>) {
        self.entries.rcu(|current| {
            let mut next: Vec<ShellEntry> = current
                .iter()
                .filter(|e| e.settings.name != settings.name)
                .map(|e| ShellEntry::new(Arc::clone(&e.settings)))
                .collect();
            if settings.is_running() {
                next.push(ShellEntry::new(Arc::clone(&settings)));
            }
            next
        });
    }

    /// Removes a shell. Returns true if it was present.
    pub fn remove(&self, tenant: &TenantId) -> bool {
        let mut removed = false;
        self.entries.rcu(|current| {
            removed = current.iter().any(|e| &e.settings.name == tenant);
            current
                .iter()
                .filter(|e| &e.settings.name != tenant)
                .map(|e| ShellEntry::new(Arc::clone(&e.settings)))
                .collect::<Vec<_>>()
        });
        removed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }
}

impl Default for RunningShellTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TenantResolver for RunningShellTable {
    fn resolve(&self, head: &RequestHead<'_>) -> Option<Arc<ShellSettings>> {
        let host = head.normalized_host();
        let segment = head.first_segment();
        let entries = self.entries.load();

        entries
            .iter()
            .filter_map(|entry| entry.rank(host.as_deref(), segment).map(|rank| (rank, entry)))
            .min_by_key(|(rank, _)| *rank)
            .map(|(_, entry)| Arc::clone(&entry.settings))
    }
}
