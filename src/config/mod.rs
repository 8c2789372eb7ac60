pub mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use anyhow::Result;
use std::collections::HashSet;
use std::path::Path;

impl GatewayConfig {
    /// Load configuration from a file (if it exists), then apply `BASTION_*`
    /// environment overrides and validate. A missing file yields the
    /// built-in defaults so the gateway can start with zero configuration.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: GatewayConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            GatewayConfig::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok());

        config.validate()?;
        tracing::info!(
            routes = config.routes.len(),
            discovery = ?config.discovery.kind,
            "loaded gateway configuration"
        );
        Ok(config)
    }

    /// Apply overrides for infrastructure settings. Routes and resilience
    /// policy only come from the config file.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("BASTION_LISTEN") {
            self.server.listen = v;
        }
        if let Some(v) = lookup("BASTION_ADMIN_LISTEN") {
            self.server.admin_listen = v;
        }
        if let Some(v) = lookup("BASTION_DISCOVERY_TYPE") {
            match v.as_str() {
                "static" => self.discovery.kind = DiscoveryKind::Static,
                "consul" => self.discovery.kind = DiscoveryKind::Consul,
                other => tracing::warn!("config: ignoring unknown BASTION_DISCOVERY_TYPE={}", other),
            }
        }
        if let Some(v) = lookup("BASTION_CONSUL_ADDRESS") {
            self.discovery.consul.address = v;
        }
        if let Some(v) = lookup("BASTION_CONSUL_DATACENTER") {
            self.discovery.consul.datacenter = Some(v);
        }
        if let Some(v) = lookup("BASTION_CONSUL_TOKEN") {
            self.discovery.consul.token = Some(v);
        }
        if let Some(v) = lookup("BASTION_CONSUL_POLL_INTERVAL") {
            if let Ok(d) = humantime::parse_duration(&v) {
                self.discovery.consul.poll_interval = d;
            }
        }
        if let Some(v) = lookup("BASTION_RATE_LIMIT_ENABLED") {
            self.rate_limit.enabled = v == "true" || v == "1";
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_breaker("circuit_breaker", &self.circuit_breaker)?;

        if self.rate_limit.max_requests == 0 {
            anyhow::bail!("rate_limit.max_requests must be at least 1");
        }
        if self.rate_limit.window.is_zero() {
            anyhow::bail!("rate_limit.window must be greater than zero");
        }
        if self.upstream.timeout.is_zero() {
            anyhow::bail!("upstream.timeout must be greater than zero");
        }
        if self.upstream.max_body_bytes == 0 {
            anyhow::bail!("upstream.max_body_bytes must be at least 1");
        }

        for (label, name) in [
            ("marker.request_header", &self.marker.request_header),
            ("marker.response_header", &self.marker.response_header),
        ] {
            if !name.is_empty() && http::HeaderName::from_bytes(name.as_bytes()).is_err() {
                anyhow::bail!("{label} '{name}' is not a valid header name");
            }
        }
        if http::HeaderValue::from_str(&self.marker.value).is_err() {
            anyhow::bail!("marker.value is not a valid header value");
        }

        for svc in &self.discovery.services {
            if svc.name.is_empty() {
                anyhow::bail!("discovery service entry has an empty name");
            }
            for addr in &svc.addresses {
                if !is_host_port(addr) {
                    anyhow::bail!(
                        "discovery service '{}' has invalid address '{}', expected host:port",
                        svc.name, addr
                    );
                }
            }
        }

        let mut fallback_paths: HashSet<&str> = HashSet::new();
        if !self.fallback.path.starts_with('/') {
            anyhow::bail!("fallback.path '{}' must start with '/'", self.fallback.path);
        }
        fallback_paths.insert(self.fallback.path.as_str());

        let mut ids: HashSet<&str> = HashSet::new();
        for route in &self.routes {
            if route.id.is_empty() {
                anyhow::bail!("route with path '{}' has empty id", route.path);
            }
            if !ids.insert(route.id.as_str()) {
                anyhow::bail!("duplicate route id '{}'", route.id);
            }
            if !route.path.starts_with('/') {
                anyhow::bail!("route '{}' path '{}' must start with '/'", route.id, route.path);
            }
            if route.max_body_bytes == Some(0) {
                anyhow::bail!("route '{}': max_body_bytes must be at least 1", route.id);
            }

            let direct = if let Some(service) = route.uri.strip_prefix("lb://") {
                if service.is_empty() || service.contains('/') {
                    anyhow::bail!("route '{}' has invalid service uri '{}'", route.id, route.uri);
                }
                false
            } else if route.uri.starts_with("http://") || route.uri.starts_with("https://") {
                let uri: http::Uri = route
                    .uri
                    .parse()
                    .map_err(|e| anyhow::anyhow!("route '{}' has invalid uri: {e}", route.id))?;
                if uri.authority().is_none() {
                    anyhow::bail!("route '{}' uri '{}' has no host", route.id, route.uri);
                }
                true
            } else {
                anyhow::bail!(
                    "route '{}' uri '{}' must use lb://, http:// or https://",
                    route.id, route.uri
                );
            };

            let mut breakers = 0;
            let mut retries = 0;
            for filter in &route.filters {
                match filter {
                    FilterConfig::CircuitBreaker(cb) => {
                        breakers += 1;
                        let merged = self.circuit_breaker.merged(cb);
                        validate_breaker(&format!("route '{}' circuit_breaker", route.id), &merged)?;
                    }
                    FilterConfig::Retry(r) => {
                        retries += 1;
                        if r.max_attempts == 0 {
                            anyhow::bail!("route '{}': retry max_attempts must be at least 1", route.id);
                        }
                        for m in &r.methods {
                            if http::Method::from_bytes(m.as_bytes()).is_err() {
                                anyhow::bail!("route '{}': invalid retry method '{}'", route.id, m);
                            }
                        }
                    }
                    FilterConfig::RequestHeader(h) | FilterConfig::ResponseHeader(h) => {
                        if http::HeaderName::from_bytes(h.name.as_bytes()).is_err() {
                            anyhow::bail!("route '{}': invalid header name '{}'", route.id, h.name);
                        }
                    }
                    FilterConfig::DedupeResponseHeader(d) => {
                        if d.name.split_whitespace().next().is_none() {
                            anyhow::bail!("route '{}': dedupe filter names no headers", route.id);
                        }
                    }
                }
            }
            if breakers > 1 || retries > 1 {
                anyhow::bail!(
                    "route '{}' declares more than one circuit_breaker or retry filter",
                    route.id
                );
            }
            if direct && (breakers > 0 || retries > 0) {
                anyhow::bail!(
                    "route '{}' dials a fixed address and cannot carry circuit_breaker or retry filters",
                    route.id
                );
            }

            if let Some(ref fb) = route.fallback {
                if let Some(ref p) = fb.path {
                    if !p.starts_with('/') {
                        anyhow::bail!("route '{}': fallback path '{}' must start with '/'", route.id, p);
                    }
                    if !fallback_paths.insert(p.as_str()) {
                        anyhow::bail!("route '{}': fallback path '{}' is already in use", route.id, p);
                    }
                }
            }
        }
        Ok(())
    }
}

fn validate_breaker(label: &str, cb: &CircuitBreakerConfig) -> Result<()> {
    if cb.sliding_window_size == 0 {
        anyhow::bail!("{label}: sliding_window_size must be at least 1");
    }
    if !(cb.failure_rate_threshold > 0.0 && cb.failure_rate_threshold <= 100.0) {
        anyhow::bail!(
            "{label}: failure_rate_threshold {} must be in (0, 100]",
            cb.failure_rate_threshold
        );
    }
    if cb.permitted_half_open_calls == 0 {
        anyhow::bail!("{label}: permitted_half_open_calls must be at least 1");
    }
    Ok(())
}

fn is_host_port(addr: &str) -> bool {
    match addr.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}
