/// A compiled route path pattern.
///
/// `/api/products/**` matches `/api/products` and everything below it at a
/// segment boundary, so `/api/productsX` does not match. `/**` matches every
/// path. A pattern without `**` matches exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathPattern {
    Exact(String),
    /// Base path without the trailing `/**`; empty for the catch-all.
    Prefix(String),
}

impl PathPattern {
    pub fn parse(pattern: &str) -> Self {
        if let Some(base) = pattern.strip_suffix("/**") {
            return PathPattern::Prefix(base.trim_end_matches('/').to_string());
        }
        if pattern.len() > 1 {
            PathPattern::Exact(pattern.trim_end_matches('/').to_string())
        } else {
            PathPattern::Exact(pattern.to_string())
        }
    }

    /// `path` must not carry a query string.
    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathPattern::Exact(p) => {
                path == p || (path.len() > 1 && path.trim_end_matches('/') == p)
            }
            PathPattern::Prefix(base) => {
                base.is_empty()
                    || (path.starts_with(base.as_str())
                        && (path.len() == base.len() || path.as_bytes()[base.len()] == b'/'))
            }
        }
    }

    /// Number of literal characters; the longer literal wins among matches.
    pub fn literal_len(&self) -> usize {
        match self {
            PathPattern::Exact(p) | PathPattern::Prefix(p) => p.len(),
        }
    }

    pub fn is_prefix(&self) -> bool {
        matches!(self, PathPattern::Prefix(_))
    }
}
