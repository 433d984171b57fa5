//! Parameter names, nested/flat document conversion, and environment keys.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::{Map, Value};

use crate::error::{Result, ThetaError};

/// The ordered tuple of string components naming a tensor inside a nested
/// checkpoint, e.g. `("layers", "3", "weight")`.
///
/// Ordering is lexicographic over components, which is what makes metadata
/// serialization deterministic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ParamName(Vec<String>);

impl ParamName {
    pub fn new<I, S>(components: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(components.into_iter().map(Into::into).collect())
    }

    /// Split a `/`-joined path into components.
    pub fn from_path(path: &str) -> Self {
        Self(path.split('/').map(str::to_string).collect())
    }

    pub fn components(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for ParamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

impl From<&str> for ParamName {
    fn from(path: &str) -> Self {
        Self::from_path(path)
    }
}

/// Flatten a nested JSON object into `ParamName -> leaf` pairs.
///
/// `is_leaf` decides where recursion stops; everything it accepts becomes a
/// value in the flat map.
pub fn flatten(value: &Value, is_leaf: &dyn Fn(&Value) -> bool) -> BTreeMap<ParamName, Value> {
    fn walk(
        value: &Value,
        prefix: &mut Vec<String>,
        is_leaf: &dyn Fn(&Value) -> bool,
        out: &mut BTreeMap<ParamName, Value>,
    ) {
        match value {
            Value::Object(map) if !is_leaf(value) => {
                for (k, v) in map {
                    prefix.push(k.clone());
                    walk(v, prefix, is_leaf, out);
                    prefix.pop();
                }
            }
            leaf => {
                out.insert(ParamName(prefix.clone()), leaf.clone());
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(value, &mut Vec::new(), is_leaf, &mut out);
    out
}

/// Rebuild the nested JSON object from a flat map.
///
/// Fails when one name is a prefix of another (a leaf and a subtree would
/// collide at the same key) or when a name repeats.
pub fn unflatten(flat: &BTreeMap<ParamName, Value>) -> Result<Value> {
    enum Node {
        Leaf(Value),
        Branch(BTreeMap<String, Node>),
    }

    fn to_value(node: Node) -> Value {
        match node {
            Node::Leaf(v) => v,
            Node::Branch(children) => Value::Object(
                children
                    .into_iter()
                    .map(|(k, v)| (k, to_value(v)))
                    .collect::<Map<String, Value>>(),
            ),
        }
    }

    let mut root: BTreeMap<String, Node> = BTreeMap::new();
    for (name, leaf) in flat {
        let components = name.components();
        if components.is_empty() {
            return Err(ThetaError::metadata_decode(
                None,
                None,
                "empty parameter name",
            ));
        }
        let collision = || {
            ThetaError::metadata_decode(
                None,
                Some(&name.to_string()),
                "parameter name collides with another parameter",
            )
        };
        let mut cursor = &mut root;
        for component in &components[..components.len() - 1] {
            let entry = cursor
                .entry(component.clone())
                .or_insert_with(|| Node::Branch(BTreeMap::new()));
            cursor = match entry {
                Node::Branch(children) => children,
                Node::Leaf(_) => return Err(collision()),
            };
        }
        match cursor.entry(components.last().unwrap().clone()) {
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(Node::Leaf(leaf.clone()));
            }
            std::collections::btree_map::Entry::Occupied(_) => return Err(collision()),
        }
    }
    Ok(to_value(Node::Branch(root)))
}

/// Environment variable names understood by every git-theta process.
pub mod env {
    pub const UPDATE_TYPE: &str = "GIT_THETA_UPDATE_TYPE";
    pub const UPDATE_DATA_PATH: &str = "GIT_THETA_UPDATE_DATA_PATH";
    pub const CHECKPOINT_TYPE: &str = "GIT_THETA_CHECKPOINT_TYPE";
    pub const PARAMETER_ATOL: &str = "GIT_THETA_PARAMETER_ATOL";
    pub const PARAMETER_RTOL: &str = "GIT_THETA_PARAMETER_RTOL";
    pub const LSH_SIGNATURE_SIZE: &str = "GIT_THETA_LSH_SIGNATURE_SIZE";
    pub const LSH_THRESHOLD: &str = "GIT_THETA_LSH_THRESHOLD";
    pub const LSH_POOL_SIZE: &str = "GIT_THETA_LSH_POOL_SIZE";
    pub const MAX_CONCURRENCY: &str = "GIT_THETA_MAX_CONCURRENCY";
    pub const LOW_MEMORY: &str = "GIT_THETA_LOW_MEMORY";
    pub const MANUAL_MERGE: &str = "GIT_THETA_MANUAL_MERGE";
    pub const LOG_LEVEL: &str = "GIT_THETA_LOG_LEVEL";

    /// Read a variable, treating the empty string as unset.
    pub fn var(name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.is_empty())
    }

    /// Read and parse a variable. A present-but-unparsable value is a
    /// configuration error, not a silent default.
    pub fn parsed<T: std::str::FromStr>(name: &str) -> crate::Result<Option<T>> {
        match var(name) {
            None => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|_| {
                crate::ThetaError::config(format!("invalid value {raw:?} for {name}"))
            }),
        }
    }

    /// Boolean variables: unset/empty/`0`/`false` are false.
    pub fn flag(name: &str) -> bool {
        var(name)
            .map(|v| !matches!(v.as_str(), "0" | "false" | "False"))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn param_name_ordering_is_lexicographic() {
        let a = ParamName::from_path("a");
        let bc = ParamName::from_path("b/c");
        let bd = ParamName::from_path("b/d");
        assert!(a < bc && bc < bd);
    }

    #[test]
    fn flatten_unflatten_round_trip() {
        let doc = json!({
            "a": {"x": 1},
            "b": {"c": {"x": 2}, "d": {"x": 3}},
        });
        let is_leaf = |v: &Value| v.get("x").is_some();
        let flat = flatten(&doc, &is_leaf);
        assert_eq!(
            flat.keys().map(ToString::to_string).collect::<Vec<_>>(),
            vec!["a", "b/c", "b/d"]
        );
        assert_eq!(unflatten(&flat).unwrap(), doc);
    }

    #[test]
    fn unflatten_rejects_leaf_subtree_collision() {
        let mut flat = BTreeMap::new();
        flat.insert(ParamName::from_path("a"), json!({"x": 1}));
        flat.insert(ParamName::from_path("a/b"), json!({"x": 2}));
        assert!(unflatten(&flat).is_err());
    }

    #[test]
    fn env_parsed_rejects_garbage() {
        std::env::set_var("GIT_THETA_TEST_PARSED", "not-a-number");
        assert!(env::parsed::<f64>("GIT_THETA_TEST_PARSED").is_err());
        std::env::set_var("GIT_THETA_TEST_PARSED", "1.5");
        assert_eq!(
            env::parsed::<f64>("GIT_THETA_TEST_PARSED").unwrap(),
            Some(1.5)
        );
        std::env::remove_var("GIT_THETA_TEST_PARSED");
    }
}
