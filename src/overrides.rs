use serde_json::Value;
use std::collections::HashMap;
use tracing::info;

pub const OVERRIDE_PREFIX: &str = "FLAG_OVERRIDE_";

/// Operator-forced flag values, outranking every stored definition.
#[derive(Debug, Clone, Default)]
pub struct FlagOverrides {
    values: HashMap<String, Value>,
}

impl FlagOverrides {
    /// Collect `FLAG_OVERRIDE_<KEY>` variables from the process environment.
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// `FLAG_OVERRIDE_NEW_CHECKOUT=true` overrides `new-checkout` with `true`.
    /// Values that are not valid JSON are taken as plain strings.
    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Self {
        let values: HashMap<String, Value> = vars
            .into_iter()
            .filter_map(|(name, raw)| {
                let suffix = name.strip_prefix(OVERRIDE_PREFIX)?;
                if suffix.is_empty() {
                    return None;
                }
                let key = suffix.to_ascii_lowercase().replace('_', "-");
                let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
                Some((key, value))
            })
            .collect();

        for key in values.keys() {
            info!(flag_key = %key, "flag override active");
        }
        Self { values }
    }

    pub fn from_pairs<K: Into<String>>(pairs: impl IntoIterator<Item = (K, Value)>) -> Self {
        Self {
            values: pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
