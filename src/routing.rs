//! Capability → backend resolution.
//!
//! The map is inverted once at startup from the configured
//! `backend → capabilities` sets. Each backend id doubles as its own
//! capability so generic calls can address a backend directly. Overlapping
//! capability keys across backends are a configuration error, caught at
//! boot.

use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::Backend;
use crate::protocol::CallTarget;

pub struct CapabilityRouter {
    map: HashMap<String, String>,
}

impl CapabilityRouter {
    /// Invert the backend capability sets into a lookup table, rejecting
    /// duplicate keys.
    pub fn build(backends: &HashMap<String, Arc<Backend>>) -> anyhow::Result<Self> {
        let mut map: HashMap<String, String> = HashMap::new();

        let mut insert = |key: &str, backend_id: &str| -> anyhow::Result<()> {
            if let Some(existing) = map.insert(key.to_string(), backend_id.to_string()) {
                if existing != backend_id {
                    anyhow::bail!(
                        "capability '{key}' is declared by both '{existing}' and '{backend_id}'"
                    );
                }
            }
            Ok(())
        };

        for (id, backend) in backends {
            insert(id, id)?;
            for capability in &backend.capabilities {
                insert(capability, id)?;
            }
        }

        Ok(Self { map })
    }

    /// The backend implementing a call's capability key, if any.
    pub fn resolve(&self, target: &CallTarget) -> Option<&str> {
        self.map.get(target.capability()).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendPool;
    use crate::config::BackendEntry;
    use std::time::Duration;

    fn entry(url: &str, capabilities: &[&str]) -> BackendEntry {
        BackendEntry {
            url: url.to_string(),
            capabilities: capabilities.iter().map(|s| s.to_string()).collect(),
            description: None,
            health_check_interval_ms: None,
            requires_auth: None,
            max_retries: None,
            max_connections: None,
            extra: HashMap::new(),
        }
    }

    fn build_router(entries: HashMap<String, BackendEntry>) -> anyhow::Result<CapabilityRouter> {
        let pool = BackendPool::from_config(
            &entries,
            reqwest::Client::new(),
            Duration::from_secs(15),
        )?;
        CapabilityRouter::build(pool.backends())
    }

    #[test]
    fn resolves_tool_names_resource_uris_and_methods() {
        let router = build_router(HashMap::from([
            (
                "linear".to_string(),
                entry("http://127.0.0.1:1", &["linear_get_teams", "tools/list"]),
            ),
            (
                "docs".to_string(),
                entry("http://127.0.0.1:2", &["docs://readme"]),
            ),
        ]))
        .unwrap();

        assert_eq!(
            router.resolve(&CallTarget::ToolsCall {
                name: "linear_get_teams".to_string()
            }),
            Some("linear")
        );
        assert_eq!(
            router.resolve(&CallTarget::ResourcesRead {
                uri: "docs://readme".to_string()
            }),
            Some("docs")
        );
        assert_eq!(
            router.resolve(&CallTarget::Generic {
                method: "tools/list".to_string()
            }),
            Some("linear")
        );
    }

    #[test]
    fn backend_id_is_its_own_capability() {
        let router = build_router(HashMap::from([(
            "linear".to_string(),
            entry("http://127.0.0.1:1", &["linear_get_teams"]),
        )]))
        .unwrap();

        assert_eq!(
            router.resolve(&CallTarget::Generic {
                method: "linear".to_string()
            }),
            Some("linear")
        );
    }

    #[test]
    fn unknown_capability_resolves_to_nothing() {
        let router = build_router(HashMap::from([(
            "linear".to_string(),
            entry("http://127.0.0.1:1", &["linear_get_teams"]),
        )]))
        .unwrap();

        assert_eq!(
            router.resolve(&CallTarget::ToolsCall {
                name: "nonexistent_tool".to_string()
            }),
            None
        );
    }

    #[test]
    fn duplicate_capabilities_across_backends_fail_the_build() {
        let result = build_router(HashMap::from([
            (
                "a".to_string(),
                entry("http://127.0.0.1:1", &["shared_tool"]),
            ),
            (
                "b".to_string(),
                entry("http://127.0.0.1:2", &["shared_tool"]),
            ),
        ]));
        assert!(result.is_err());
    }
}
