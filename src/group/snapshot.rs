//! Diff baseline for local configuration

use std::collections::HashMap;

use crate::local::Properties;

/// Last observed value of every local configuration key.
///
/// Never persisted; rebuilt from the local configuration at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigSnapshot {
    values: HashMap<String, String>,
}

impl ConfigSnapshot {
    /// Create an empty snapshot
    pub fn new() -> Self {
        Self::default()
    }

    /// Last observed value of `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Whether `value` equals the last observed value of `key`
    pub fn is_unchanged(&self, key: &str, value: &str) -> bool {
        self.get(key) == Some(value)
    }

    /// Record `value` as the last observed value of `key`
    pub fn record(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }

    /// Replace the baseline with `properties`
    pub fn reset(&mut self, properties: &Properties) {
        self.values = properties
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_reset() {
        let mut snapshot = ConfigSnapshot::new();
        assert!(snapshot.is_empty());
        assert!(!snapshot.is_unchanged("groups", "default"));

        snapshot.record("groups", "default");
        assert!(snapshot.is_unchanged("groups", "default"));
        assert!(!snapshot.is_unchanged("groups", "default,ops"));

        let mut props = Properties::new();
        props.insert("ops.timeout".to_string(), "5".to_string());
        snapshot.reset(&props);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get("groups"), None);
        assert_eq!(snapshot.get("ops.timeout"), Some("5"));
    }
}
