//! Request-scoped overrides: environment variables and config merging.
//!
//! [`EnvGuard`] captures the prior value of every key it sets and restores
//! it when dropped, so success, error, and interrupt paths all leave the
//! process environment exactly as they found it.

use std::collections::HashMap;
use std::ffi::OsString;

use serde_json::Value;

use crate::request::{ENV_VAR_PREFIX, FORCE_COLOR_ENV_VAR};

/// Scoped environment overrides.
///
/// Restoration happens in reverse application order on drop, so a key set
/// twice ends up back at its original value.
pub struct EnvGuard {
    saved: Vec<(String, Option<OsString>)>,
}

impl EnvGuard {
    /// Apply `vars` to the process environment, remembering prior values.
    pub fn apply<I>(vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut saved = Vec::new();
        for (key, value) in vars {
            saved.push((key.clone(), std::env::var_os(&key)));
            // Callers only touch the environment from the single-threaded
            // setup phase of a child execution.
            unsafe { std::env::set_var(&key, &value) };
        }
        EnvGuard { saved }
    }

    /// The standard override set for one request: the client's prefixed
    /// env vars plus the forced-color flag.
    pub fn for_request(env_vars: &HashMap<String, String>) -> Self {
        let mut vars: Vec<(String, String)> = env_vars
            .iter()
            .filter(|(key, _)| key.starts_with(ENV_VAR_PREFIX))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        vars.sort();
        vars.push((FORCE_COLOR_ENV_VAR.to_string(), "1".to_string()));
        EnvGuard::apply(vars)
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, previous) in self.saved.drain(..).rev() {
            match previous {
                Some(value) => unsafe { std::env::set_var(&key, value) },
                None => unsafe { std::env::remove_var(&key) },
            }
        }
    }
}

/// Merge client config overrides over the server's base config.
///
/// Keys on the deny-list are stripped from the overrides before merging,
/// with a warning per stripped key. Deny-list entries are dot-separated
/// paths into the nested map.
pub fn merge_config_overrides(base: &Value, overrides: &Value, deny_keys: &[String]) -> Value {
    let mut overrides = overrides.clone();
    for key in deny_keys {
        let path: Vec<&str> = key.split('.').collect();
        if strip_nested(&mut overrides, &path) {
            tracing::warn!(
                key,
                "Client-specified config override is not allowed and was ignored"
            );
        }
    }
    let mut merged = base.clone();
    deep_merge(&mut merged, &overrides);
    merged
}

fn strip_nested(value: &mut Value, path: &[&str]) -> bool {
    let Value::Object(map) = value else {
        return false;
    };
    match path {
        [] => false,
        [leaf] => map.remove(*leaf).is_some(),
        [head, rest @ ..] => map
            .get_mut(*head)
            .map(|child| strip_nested(child, rest))
            .unwrap_or(false),
    }
}

fn deep_merge(base: &mut Value, overrides: &Value) {
    match (base, overrides) {
        (Value::Object(base_map), Value::Object(override_map)) => {
            for (key, value) in override_map {
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overrides) => {
            if !overrides.is_null() {
                *base = overrides.clone();
            }
        }
    }
}
