//! Typed key-value configuration registry.
//!
//! Modules declare the options they understand with [`lookup`], which returns
//! a shared [`ConfigVar`] handle. Values can be read and updated at runtime;
//! interested parties subscribe to changes with
//! [`ConfigVar::add_listener`]. [`load_yaml`] applies a YAML document to every
//! registered variable, flattening nested mappings into `.`-joined keys, so
//!
//! ```yaml
//! tcp:
//!   connect:
//!     timeout: 200
//! ```
//!
//! sets the variable registered as `tcp.connect.timeout`.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

type Listener<T> = Arc<dyn Fn(&T, &T) + Send + Sync>;

/// A single named configuration value of type `T`.
///
/// Cheap to share; every call to [`lookup`] with the same name returns the
/// same instance.
pub struct ConfigVar<T> {
    name: String,
    description: String,
    value: RwLock<T>,
    listeners: RwLock<Vec<(u64, Listener<T>)>>,
    next_listener_key: AtomicU64,
}

impl<T> ConfigVar<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn get(&self) -> T {
        self.value.read().expect("config lock poisoned").clone()
    }

    /// Store a new value. Listeners run on the calling thread, with the old
    /// and the new value, only if the value actually changed.
    pub fn set(&self, new: T) {
        let old = {
            let mut value = self.value.write().expect("config lock poisoned");
            if *value == new {
                return;
            }
            std::mem::replace(&mut *value, new.clone())
        };
        let listeners = self.listeners.read().expect("config lock poisoned");
        for (_, listener) in listeners.iter() {
            listener(&old, &new);
        }
    }

    /// Subscribe to value changes. Returns a key for [`remove_listener`].
    pub fn add_listener(&self, f: impl Fn(&T, &T) + Send + Sync + 'static) -> u64 {
        let key = self.next_listener_key.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .expect("config lock poisoned")
            .push((key, Arc::new(f)));
        key
    }

    pub fn remove_listener(&self, key: u64) {
        self.listeners
            .write()
            .expect("config lock poisoned")
            .retain(|(k, _)| *k != key);
    }
}

/// Object-safe face of [`ConfigVar`] kept in the registry.
trait ConfigVarBase: Send + Sync {
    fn load_yaml(&self, value: &serde_yaml::Value) -> Result<()>;
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T> ConfigVarBase for ConfigVar<T>
where
    T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn load_yaml(&self, value: &serde_yaml::Value) -> Result<()> {
        let parsed: T = serde_yaml::from_value(value.clone())?;
        self.set(parsed);
        Ok(())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

static REGISTRY: Lazy<RwLock<HashMap<String, Arc<dyn ConfigVarBase>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '_')
}

/// Find the variable `name`, registering it with `default` on first use.
///
/// # Panics
///
/// Panics if `name` contains characters outside `[a-z0-9._]` or if the
/// variable was previously registered with a different type. Both are
/// programming errors.
pub fn lookup<T>(name: &str, default: T, description: &str) -> Arc<ConfigVar<T>>
where
    T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    assert!(valid_name(name), "invalid config variable name: {}", name);
    let mut registry = REGISTRY.write().expect("config lock poisoned");
    if let Some(base) = registry.get(name) {
        return base
            .clone()
            .as_any()
            .downcast::<ConfigVar<T>>()
            .unwrap_or_else(|_| {
                panic!("config variable {} registered with a different type", name)
            });
    }
    let var = Arc::new(ConfigVar {
        name: name.to_string(),
        description: description.to_string(),
        value: RwLock::new(default),
        listeners: RwLock::new(Vec::new()),
        next_listener_key: AtomicU64::new(0),
    });
    registry.insert(name.to_string(), var.clone());
    var
}

/// Find the variable `name` if it was registered with type `T`.
pub fn get_var<T>(name: &str) -> Option<Arc<ConfigVar<T>>>
where
    T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let registry = REGISTRY.read().expect("config lock poisoned");
    let base = registry.get(name)?;
    base.clone().as_any().downcast::<ConfigVar<T>>().ok()
}

/// Apply a YAML document to the registry.
///
/// Unknown keys are ignored so one file can configure several subsystems; a
/// key that names a registered variable but fails to parse as its type is an
/// error.
pub fn load_yaml(source: &str) -> Result<()> {
    let root: serde_yaml::Value = serde_yaml::from_str(source)?;
    let mut flat = Vec::new();
    flatten("", &root, &mut flat);
    let registry = REGISTRY.read().expect("config lock poisoned");
    for (key, value) in flat {
        if let Some(var) = registry.get(&key) {
            var.load_yaml(value).map_err(|e| {
                Error::config(key.clone(), format!("failed to apply value: {}", e))
            })?;
            log::info!(target: "filament::config", "config {} updated from file", key);
        }
    }
    Ok(())
}

fn flatten<'a>(prefix: &str, value: &'a serde_yaml::Value, out: &mut Vec<(String, &'a serde_yaml::Value)>) {
    if !prefix.is_empty() {
        out.push((prefix.to_string(), value));
    }
    if let serde_yaml::Value::Mapping(map) = value {
        for (k, v) in map {
            if let serde_yaml::Value::String(k) = k {
                let key = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{}.{}", prefix, k)
                };
                flatten(&key, v, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    #[test]
    fn lookup_returns_same_instance() {
        let a = lookup::<u32>("test.lookup.same", 7, "test");
        let b = lookup::<u32>("test.lookup.same", 99, "test");
        assert_eq!(b.get(), 7);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    #[should_panic]
    fn lookup_rejects_bad_name() {
        let _ = lookup::<u32>("Bad Name!", 0, "test");
    }

    #[test]
    fn listeners_fire_on_change_only() {
        static FIRED: AtomicI64 = AtomicI64::new(0);
        let var = lookup::<i64>("test.listener.fire", 1, "test");
        var.add_listener(|old, new| {
            FIRED.store(old * 100 + new, Ordering::SeqCst);
        });
        var.set(1);
        assert_eq!(FIRED.load(Ordering::SeqCst), 0);
        var.set(2);
        assert_eq!(FIRED.load(Ordering::SeqCst), 102);
    }

    #[test]
    fn yaml_applies_nested_keys() {
        let var = lookup::<i32>("test.yaml.nested.timeout", 5000, "test");
        load_yaml("test:\n  yaml:\n    nested:\n      timeout: 250\n").unwrap();
        assert_eq!(var.get(), 250);
    }

    #[test]
    fn yaml_ignores_unknown_keys() {
        load_yaml("nobody:\n  registered: this\n").unwrap();
    }
}
