//! Layered configuration for DuckMesh.
//!
//! Config is YAML, merged in layer order (base -> env -> overrides), then
//! canonicalized to JSON and hashed so a deployment can prove exactly which
//! settings a process booted with. `CoreConfig` is the typed view the
//! pipeline crates consume.

use anyhow::{Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;

mod core;

pub use crate::core::CoreConfig;

/// Load + merge YAML files in order, then canonicalize to JSON and hash.
/// Later files override earlier files via deep-merge.
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());

    for p in paths {
        let s = fs::read_to_string(p).with_context(|| format!("read config: {p}"))?;
        let yaml_val: serde_yaml::Value =
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml: {p}"))?;
        let json_val = serde_json::to_value(yaml_val).context("yaml->json conversion failed")?;
        deep_merge(&mut merged, json_val);
    }

    let canonical = canonicalize_json(&merged);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let hash = hex::encode(hasher.finalize());

    Ok(LoadedConfig {
        config_json: serde_json::from_str(&canonical).context("canonical json parse failed")?,
        canonical_json: canonical,
        config_hash: hash,
    })
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_json: Value,
    pub canonical_json: String,
    pub config_hash: String,
}

impl LoadedConfig {
    /// Typed core settings from the `/core` subtree, env overrides applied.
    pub fn core(&self) -> CoreConfig {
        CoreConfig::from_value(&self.config_json).with_env_overrides()
    }
}

/// Deep-merge: objects merge recursively; arrays replaced; scalars overwritten.
fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        dst_map.insert(k, v);
                    }
                }
            }
        }
        (dst_slot, src_val) => {
            *dst_slot = src_val;
        }
    }
}

/// Canonicalize JSON by sorting all object keys recursively and emitting
/// compact JSON.
fn canonicalize_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn later_layers_override_earlier_ones() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.yaml");
        let over = dir.path().join("over.yaml");
        writeln!(
            fs::File::create(&base).unwrap(),
            "core:\n  max_batch_rows: 64\n  lease_seconds: 30"
        )
        .unwrap();
        writeln!(fs::File::create(&over).unwrap(), "core:\n  lease_seconds: 5").unwrap();

        let loaded =
            load_layered_yaml(&[base.to_str().unwrap(), over.to_str().unwrap()]).unwrap();
        let core = CoreConfig::from_value(&loaded.config_json);
        assert_eq!(core.max_batch_rows, 64);
        assert_eq!(core.lease_seconds, 5);
    }

    #[test]
    fn hash_is_stable_under_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.yaml");
        let b = dir.path().join("b.yaml");
        writeln!(fs::File::create(&a).unwrap(), "x: 1\ny: 2").unwrap();
        writeln!(fs::File::create(&b).unwrap(), "y: 2\nx: 1").unwrap();

        let ha = load_layered_yaml(&[a.to_str().unwrap()]).unwrap().config_hash;
        let hb = load_layered_yaml(&[b.to_str().unwrap()]).unwrap().config_hash;
        assert_eq!(ha, hb);
    }
}
