//! Component health registry.
//!
//! Components register named check results; the health endpoints render a
//! sanitized view (component names and up/down only; no connection
//! strings, no error internals).

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Instant;

use serde_json::{json, Value};

/// One component's latest health reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentHealth {
    Up,
    Degraded,
    Down,
}

impl ComponentHealth {
    fn as_str(&self) -> &'static str {
        match self {
            ComponentHealth::Up => "up",
            ComponentHealth::Degraded => "degraded",
            ComponentHealth::Down => "down",
        }
    }
}

/// Registry of component checks.
pub struct HealthRegistry {
    started_at: Instant,
    components: RwLock<HashMap<&'static str, ComponentHealth>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            components: RwLock::new(HashMap::new()),
        }
    }

    /// Record a component reading.
    pub fn set(&self, component: &'static str, health: ComponentHealth) {
        self.components
            .write()
            .expect("health registry lock poisoned")
            .insert(component, health);
    }

    /// All components healthy (or none registered yet).
    pub fn all_up(&self) -> bool {
        self.components
            .read()
            .expect("health registry lock poisoned")
            .values()
            .all(|h| *h == ComponentHealth::Up)
    }

    /// Sanitized snapshot for the health endpoints.
    pub fn snapshot(&self) -> Value {
        let components: HashMap<&'static str, &'static str> = self
            .components
            .read()
            .expect("health registry lock poisoned")
            .iter()
            .map(|(name, health)| (*name, health.as_str()))
            .collect();
        json!({
            "status": if self.all_up() { "ok" } else { "degraded" },
            "uptime_seconds": self.started_at.elapsed().as_secs(),
            "components": components,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_registry_is_up() {
        let registry = HealthRegistry::new();
        assert!(registry.all_up());
        assert_eq!(registry.snapshot()["status"], "ok");
    }

    #[test]
    fn test_down_component_degrades_status() {
        let registry = HealthRegistry::new();
        registry.set("kv", ComponentHealth::Up);
        registry.set("llm", ComponentHealth::Down);
        assert!(!registry.all_up());
        let snapshot = registry.snapshot();
        assert_eq!(snapshot["status"], "degraded");
        assert_eq!(snapshot["components"]["llm"], "down");
    }

    #[test]
    fn test_snapshot_contains_no_secrets() {
        let registry = HealthRegistry::new();
        registry.set("kv", ComponentHealth::Up);
        let rendered = registry.snapshot().to_string();
        // Only names and states, nothing resembling a connection string.
        assert!(!rendered.contains("://"));
    }
}
