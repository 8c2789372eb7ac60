use crate::config::RetryFilterConfig;
use http::Method;
use std::time::Duration;

/// Bounded reissue of a proxied call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, the first call included.
    pub max_attempts: u32,
    pub statuses: Vec<u16>,
    /// Empty means every method may be reissued.
    pub methods: Vec<Method>,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &RetryFilterConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            statuses: cfg.statuses.clone(),
            methods: cfg
                .methods
                .iter()
                .filter_map(|m| Method::from_bytes(m.to_ascii_uppercase().as_bytes()).ok())
                .collect(),
            backoff: cfg.backoff,
        }
    }

    /// Attempts allowed for a request with `method`.
    pub fn attempts_for(&self, method: &Method) -> u32 {
        if self.methods.is_empty() || self.methods.contains(method) {
            self.max_attempts
        } else {
            1
        }
    }

    pub fn retries_status(&self, status: u16) -> bool {
        self.statuses.contains(&status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_retry_get_only() {
        let policy = RetryPolicy::from_config(&RetryFilterConfig::default());
        assert_eq!(policy.attempts_for(&Method::GET), 3);
        assert_eq!(policy.attempts_for(&Method::POST), 1);
        assert!(policy.retries_status(503));
        assert!(!policy.retries_status(504));
    }

    #[test]
    fn test_empty_methods_retries_all() {
        let policy = RetryPolicy::from_config(&RetryFilterConfig {
            methods: vec![],
            ..Default::default()
        });
        assert_eq!(policy.attempts_for(&Method::POST), 3);
        assert_eq!(policy.attempts_for(&Method::DELETE), 3);
    }

    #[test]
    fn test_methods_case_insensitive() {
        let policy = RetryPolicy::from_config(&RetryFilterConfig {
            methods: vec!["get".into(), "put".into()],
            max_attempts: 2,
            ..Default::default()
        });
        assert_eq!(policy.attempts_for(&Method::PUT), 2);
        assert_eq!(policy.attempts_for(&Method::PATCH), 1);
    }
}
