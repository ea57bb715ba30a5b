/// The slice of an inbound request that tenant resolution looks at.
///
/// Borrowed from the transport's request so matching never allocates.
#[derive(Debug, Clone, Copy)]
pub struct RequestHead<'a> {
    /// Value of the `Host` header (or URI authority), possibly with a port.
    pub host: Option<&'a str>,
    /// Request path, starting with `/`.
    pub path: &'a str,
}

impl<'a> RequestHead<'a> {
    #[must_use]
    pub fn new(host: Option<&'a str>, path: &'a str) -> Self {
        Self { host, path }
    }

    /// Host lowercased with any `:port` suffix removed. Empty hosts yield `None`.
    #[must_use]
    pub fn normalized_host(&self) -> Option<String> {
        self.host.and_then(normalize_host)
    }

    /// First non-empty path segment, if any.
    #[must_use]
    pub fn first_segment(&self) -> Option<&'a str> {
        self.path.split('/').find(|s| !s.is_empty())
    }
}

/// Lowercases a host and strips a trailing `:port`.
///
/// Bracketed IPv6 literals keep their brackets; only a port after the closing
/// bracket is removed.
#[must_use]
pub fn normalize_host(host: &str) -> Option<String> {
    let host = host.trim();
    let without_port = if let Some(rest) = host.strip_prefix('[') {
        match rest.find(']') {
            Some(end) => &host[..end + 2],
            None => host,
        }
    } else {
        match host.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
            _ => host,
        }
    };
    if without_port.is_empty() {
        None
    } else {
        Some(without_port.to_ascii_lowercase())
    }
}
