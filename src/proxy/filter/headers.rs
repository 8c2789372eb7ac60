use crate::config::{DedupeFilterConfig, DedupeStrategy, HeaderAction, HeaderFilterConfig, MarkerConfig};
use http::{HeaderMap, HeaderName, HeaderValue};

/// A pre-compiled header transform operation for O(1) dispatch at request time.
#[derive(Debug, Clone)]
pub struct HeaderOp {
    pub name: HeaderName,
    pub value: HeaderValue,
    pub action: HeaderAction,
}

impl HeaderOp {
    pub fn compile(cfg: &HeaderFilterConfig) -> anyhow::Result<Self> {
        let name = HeaderName::from_bytes(cfg.name.as_bytes())
            .map_err(|e| anyhow::anyhow!("invalid header name '{}': {e}", cfg.name))?;
        let value = match HeaderValue::from_str(&cfg.value) {
            Ok(v) => v,
            Err(_) if cfg.action == HeaderAction::Remove => HeaderValue::from_static(""),
            Err(e) => anyhow::bail!("invalid value for header '{}': {e}", cfg.name),
        };
        Ok(Self {
            name,
            value,
            action: cfg.action,
        })
    }

    pub fn apply(&self, headers: &mut HeaderMap) {
        match self.action {
            HeaderAction::Set => {
                headers.insert(self.name.clone(), self.value.clone());
            }
            HeaderAction::Add => {
                headers.append(self.name.clone(), self.value.clone());
            }
            HeaderAction::Remove => {
                headers.remove(&self.name);
            }
        }
    }
}

/// Collapses repeated response headers, typically CORS headers set by both
/// the gateway and the backend.
#[derive(Debug, Clone)]
pub struct DedupeRule {
    pub names: Vec<HeaderName>,
    pub strategy: DedupeStrategy,
}

impl DedupeRule {
    pub fn compile(cfg: &DedupeFilterConfig) -> anyhow::Result<Self> {
        let names = cfg
            .name
            .split_whitespace()
            .map(|n| {
                HeaderName::from_bytes(n.as_bytes())
                    .map_err(|e| anyhow::anyhow!("invalid header name '{n}': {e}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self {
            names,
            strategy: cfg.strategy,
        })
    }

    pub fn apply(&self, headers: &mut HeaderMap) {
        for name in &self.names {
            let values: Vec<HeaderValue> = headers.get_all(name).iter().cloned().collect();
            if values.len() < 2 {
                continue;
            }
            let kept: Vec<HeaderValue> = match self.strategy {
                DedupeStrategy::RetainFirst => values.into_iter().take(1).collect(),
                DedupeStrategy::RetainLast => values.into_iter().last().into_iter().collect(),
                DedupeStrategy::RetainUnique => {
                    let mut unique: Vec<HeaderValue> = Vec::with_capacity(values.len());
                    for v in values {
                        if !unique.contains(&v) {
                            unique.push(v);
                        }
                    }
                    unique
                }
            };
            headers.remove(name);
            for v in kept {
                headers.append(name.clone(), v);
            }
        }
    }
}

/// Audit headers stamped on forwarded requests and proxied responses.
#[derive(Debug, Clone)]
pub struct GatewayMarkers {
    request: Option<HeaderName>,
    response: Option<HeaderName>,
    value: HeaderValue,
}

impl GatewayMarkers {
    pub fn from_config(cfg: &MarkerConfig) -> anyhow::Result<Self> {
        let parse = |name: &str| -> anyhow::Result<Option<HeaderName>> {
            if name.is_empty() {
                return Ok(None);
            }
            HeaderName::from_bytes(name.as_bytes())
                .map(Some)
                .map_err(|e| anyhow::anyhow!("invalid marker header '{name}': {e}"))
        };
        Ok(Self {
            request: parse(&cfg.request_header)?,
            response: parse(&cfg.response_header)?,
            value: HeaderValue::from_str(&cfg.value)
                .map_err(|e| anyhow::anyhow!("invalid marker value: {e}"))?,
        })
    }

    pub fn mark_request(&self, headers: &mut HeaderMap) {
        if let Some(ref name) = self.request {
            headers.insert(name.clone(), self.value.clone());
        }
    }

    pub fn mark_response(&self, headers: &mut HeaderMap) {
        if let Some(ref name) = self.response {
            headers.insert(name.clone(), self.value.clone());
        }
    }
}
