use crate::error::DevdError;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Applies a new value for one config section to the live configuration.
pub type ApplyFn<T> = fn(&mut T, &Value) -> Result<(), DevdError>;

/// Named config sections that can be read and changed at runtime.
///
/// Paths are `/`-separated, starting with the section name
/// (`lan/enable`, `client/poll_interval`).
pub struct ConfigRegistry<T> {
    sections: BTreeMap<String, ApplyFn<T>>,
}

impl<T> Default for ConfigRegistry<T> {
    fn default() -> Self {
        Self { sections: BTreeMap::new() }
    }
}

impl<T: Serialize> ConfigRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, section: &str, apply: ApplyFn<T>) {
        self.sections.insert(section.to_string(), apply);
    }

    pub fn is_registered(&self, section: &str) -> bool {
        self.sections.contains_key(section)
    }

    pub fn get(&self, target: &T, path: &str) -> Option<Value> {
        let tree = serde_json::to_value(target).ok()?;
        let pointer = format!("/{}", path.trim_matches('/'));
        tree.pointer(&pointer).cloned()
    }

    /// Replaces the value at `path` and hands the updated section to its apply function.
    pub fn set(&self, target: &mut T, path: &str, value: Value) -> Result<(), DevdError> {
        let path = path.trim_matches('/');
        let (section, rest) = match path.split_once('/') {
            Some((section, rest)) => (section, Some(rest)),
            None => (path, None),
        };
        let apply = self
            .sections
            .get(section)
            .ok_or_else(|| DevdError::config(format!("unknown section {section}")))?;
        let mut tree = serde_json::to_value(&*target)
            .map_err(|err| DevdError::config(err.to_string()))?;
        let slot = tree
            .get_mut(section)
            .ok_or_else(|| DevdError::config(format!("no section {section}")))?;
        match rest {
            None => *slot = merge(slot.clone(), value),
            Some(rest) => {
                let pointer = format!("/{rest}");
                let leaf = slot
                    .pointer_mut(&pointer)
                    .ok_or_else(|| DevdError::config(format!("unknown path {path}")))?;
                *leaf = value;
            }
        }
        apply(target, slot)
    }
}

fn merge(base: Value, update: Value) -> Value {
    match (base, update) {
        (Value::Object(mut base), Value::Object(update)) => {
            for (key, value) in update {
                let merged = match base.remove(&key) {
                    Some(old) => merge(old, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Object(base)
        }
        (_, update) => update,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DevdConfig, LanConfig};
    use serde_json::json;

    fn apply_lan(config: &mut DevdConfig, value: &Value) -> Result<(), DevdError> {
        config.lan = serde_json::from_value::<LanConfig>(value.clone())
            .map_err(|err| DevdError::config(err.to_string()))?;
        Ok(())
    }

    #[test]
    fn set_merges_partial_section_and_applies() {
        let mut config = DevdConfig::default();
        let mut registry = ConfigRegistry::new();
        registry.register("lan", apply_lan);

        registry
            .set(&mut config, "lan", json!({"enable": true, "key": "secret"}))
            .expect("set lan");
        assert!(config.lan.enable);
        assert_eq!(config.lan.key, "secret");
        assert_eq!(config.lan.keep_alive, 30);

        registry.set(&mut config, "lan/key_id", json!(7)).expect("set key id");
        assert_eq!(registry.get(&config, "lan/key_id"), Some(json!(7)));
    }

    #[test]
    fn unknown_section_or_bad_value_is_rejected() {
        let mut config = DevdConfig::default();
        let mut registry = ConfigRegistry::new();
        registry.register("lan", apply_lan);

        assert!(registry.set(&mut config, "client/poll_interval", json!(5)).is_err());
        assert!(registry.set(&mut config, "lan/enable", json!("yes")).is_err());
        assert!(!config.lan.enable);
    }
}
