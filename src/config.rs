//! Node configuration values and the canonical serialization used to derive
//! content signatures.
//!
//! Config in this crate is a `serde_json::Value`-shaped tree with three
//! extra leaf variants a plain JSON value can't express: a direct file
//! dependency ([`ConfigValue::FileRef`]), a reference to another node's
//! output ([`ConfigValue::NodeRef`]), and a named hook standing in for a
//! closure ([`ConfigValue::Hook`]) since config must stay serializable and
//! hashable.

use std::{collections::BTreeMap, fmt::Write, sync::Arc};

use camino::Utf8Path;
use camino::Utf8PathBuf;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::hash::ContentHash;

/// A node configuration value.
///
/// Ordinary JSON shapes (null/bool/number/string/array/map) plus the three
/// domain-specific leaves described above.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ConfigValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(Vec<ConfigValue>),
    Map(BTreeMap<String, ConfigValue>),
    /// A direct file dependency: invalidates the owning node's cache entry
    /// when the file's content changes, without being an `Input`.
    FileRef(Utf8PathBuf),
    /// A reference to another node's output, optionally filtered by a glob.
    NodeRef {
        producer: String,
        output: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        glob: Option<String>,
    },
    /// A named hook, resolved at run time through a [`HookRegistry`].
    Hook(String),
}

impl ConfigValue {
    /// Build a [`ConfigValue::Map`] from an iterator of key/value pairs.
    pub fn map(entries: impl IntoIterator<Item = (impl Into<String>, ConfigValue)>) -> Self {
        Self::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// True if this value is [`ConfigValue::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, ConfigValue::Null)
    }

    /// Look up a key if this value is a [`ConfigValue::Map`].
    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        match self {
            ConfigValue::Map(map) => map.get(key),
            _ => None,
        }
    }

    /// Render this value as a string the way it would appear inside a
    /// config value's own canonical string (e.g. a bare string config
    /// value serializes as its JSON-quoted form).
    pub fn canonical_string(&self) -> String {
        let mut out = String::new();
        write_canonical(self, &mut out);
        out
    }

    /// Walk the config tree, invoking `visit` on every [`ConfigValue::FileRef`]
    /// found.
    pub fn walk_file_refs<'a>(&'a self, visit: &mut impl FnMut(&'a Utf8Path)) {
        match self {
            ConfigValue::FileRef(path) => visit(path),
            ConfigValue::Array(items) => items.iter().for_each(|v| v.walk_file_refs(visit)),
            ConfigValue::Map(map) => map.values().for_each(|v| v.walk_file_refs(visit)),
            _ => {}
        }
    }

    /// Walk the config tree, invoking `visit` on every [`ConfigValue::NodeRef`]
    /// found.
    pub fn walk_node_refs<'a>(&'a self, visit: &mut impl FnMut(&'a str, &'a str, Option<&'a str>)) {
        match self {
            ConfigValue::NodeRef {
                producer,
                output,
                glob,
            } => visit(producer, output, glob.as_deref()),
            ConfigValue::Array(items) => items.iter().for_each(|v| v.walk_node_refs(visit)),
            ConfigValue::Map(map) => map.values().for_each(|v| v.walk_node_refs(visit)),
            _ => {}
        }
    }
}

/// Append `value`'s canonical string form to `out`.
///
/// - Map keys are sorted ascending (guaranteed already by `BTreeMap`); keys
///   whose value is `Null` are dropped entirely.
/// - Arrays serialize element-wise, in order.
/// - `FileRef` serializes as the literal `FileRef(<path>)`; the producer's
///   content is not interpolated, only its path.
/// - `NodeRef` serializes as `from(<producer>:<output>[:<glob>])`.
/// - `Hook` serializes as `Hook(<id>)`.
fn write_canonical(value: &ConfigValue, out: &mut String) {
    match value {
        ConfigValue::Null => out.push_str("null"),
        ConfigValue::Bool(b) => write!(out, "{b}").unwrap(),
        ConfigValue::Number(n) => write!(out, "{n}").unwrap(),
        ConfigValue::String(s) => write!(out, "{s:?}").unwrap(),
        ConfigValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        ConfigValue::Map(map) => {
            out.push('{');
            let mut first = true;
            for (key, value) in map {
                if value.is_null() {
                    continue;
                }
                if !first {
                    out.push(',');
                }
                first = false;
                write!(out, "{key:?}:").unwrap();
                write_canonical(value, out);
            }
            out.push('}');
        }
        ConfigValue::FileRef(path) => write!(out, "FileRef({path})").unwrap(),
        ConfigValue::NodeRef {
            producer,
            output,
            glob,
        } => match glob {
            Some(glob) => write!(out, "from({producer}:{output}:{glob})").unwrap(),
            None => write!(out, "from({producer}:{output})").unwrap(),
        },
        ConfigValue::Hook(id) => write!(out, "Hook({id})").unwrap(),
    }
}

/// Compute a node's content signature: `<nodeTypeTag>-<first 8 hex chars of
/// sha256(canonical config string)>`.
///
/// Two nodes of the same type with configs that serialize to the same
/// canonical string share a content signature, and therefore share cache
/// entries, regardless of the node's `name`.
pub fn content_signature(node_type_tag: &str, config: &ConfigValue) -> String {
    let canonical = config.canonical_string();
    let hash = ContentHash::of(canonical.as_bytes());
    format!("{node_type_tag}-{}", hash.short())
}

/// Resolves [`ConfigValue::Hook`] identifiers to the path-rewriting
/// function they name.
///
/// A systems language has no first-class stringifiable closures, so a
/// per-item transform that would be a callback in a dynamic config
/// language is instead a named entry in this registry, looked up by the
/// identifier carried in the config value. Two hooks with the same
/// identifier are therefore indistinguishable to the cache, by
/// construction.
#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: Arc<DashMap<String, Arc<dyn Fn(&Utf8Path) -> Utf8PathBuf + Send + Sync>>>,
}

impl HookRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook under `id`, overwriting any previous registration.
    pub fn register(
        &self,
        id: impl Into<String>,
        hook: impl Fn(&Utf8Path) -> Utf8PathBuf + Send + Sync + 'static,
    ) {
        self.hooks.insert(id.into(), Arc::new(hook));
    }

    /// Resolve and invoke the hook named `id` on `input`.
    ///
    /// Errors if no hook is registered under that identifier.
    pub fn resolve(&self, id: &str, input: &Utf8Path) -> color_eyre::Result<Utf8PathBuf> {
        self.hooks
            .get(id)
            .map(|hook| hook(input))
            .ok_or_else(|| color_eyre::eyre::eyre!("no hook registered under id {id:?}"))
    }
}
