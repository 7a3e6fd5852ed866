//! Pytrees: nested containers with a canonical flatten/unflatten pair.
//!
//! Every transformation is defined on a flat list of leaves; pytrees let
//! user code pass arbitrarily nested state through without ad-hoc
//! unpacking. Node kinds are tuple-like lists, string-keyed maps (flattened
//! in ascending key order), and custom kinds added through the open
//! registry. Leaves are [`Value`]s.

use crate::error::{Result, TraceError};
use crate::trace::Value;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};

/// A nested container of values.
#[derive(Debug, Clone)]
pub enum Tree {
    Leaf(Value),
    List(Vec<Tree>),
    Dict(BTreeMap<String, Tree>),
    /// A registered custom node: an opaque tag, node metadata, and children.
    Custom {
        tag: String,
        meta: String,
        children: Vec<Tree>,
    },
}

impl Tree {
    pub fn leaf(v: Value) -> Tree {
        Tree::Leaf(v)
    }

    pub fn list(children: Vec<Tree>) -> Tree {
        Tree::List(children)
    }

    /// The leaf payload, when this tree is a single leaf.
    pub fn as_leaf(&self) -> Option<&Value> {
        match self {
            Tree::Leaf(v) => Some(v),
            _ => None,
        }
    }

    /// Unwrap a single-leaf tree.
    pub fn into_leaf(self) -> Result<Value> {
        match self {
            Tree::Leaf(v) => Ok(v),
            other => Err(TraceError::PytreeStructureMismatch(format!(
                "expected a leaf, got {}",
                other.node_name()
            ))),
        }
    }

    fn node_name(&self) -> &'static str {
        match self {
            Tree::Leaf(_) => "leaf",
            Tree::List(_) => "list",
            Tree::Dict(_) => "dict",
            Tree::Custom { .. } => "custom node",
        }
    }
}

/// The shape of a pytree with its leaves removed. Two treedefs compare
/// equal iff they were built from identical node kinds and child treedefs
/// in the same positions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TreeDef {
    Leaf,
    List(Vec<TreeDef>),
    /// Keys in ascending lexicographic order.
    Dict(Vec<(String, TreeDef)>),
    Custom {
        tag: String,
        meta: String,
        children: Vec<TreeDef>,
    },
}

impl TreeDef {
    /// Number of leaves under this treedef.
    pub fn leaf_count(&self) -> usize {
        match self {
            TreeDef::Leaf => 1,
            TreeDef::List(cs) => cs.iter().map(TreeDef::leaf_count).sum(),
            TreeDef::Dict(cs) => cs.iter().map(|(_, c)| c.leaf_count()).sum(),
            TreeDef::Custom { children, .. } => {
                children.iter().map(TreeDef::leaf_count).sum()
            }
        }
    }
}

/// Hooks for a custom pytree node kind.
#[derive(Debug, Clone, Copy)]
pub struct PytreeNodeDef {
    /// Split a custom node into (children, metadata).
    pub flatten: fn(&[Tree], &str) -> (Vec<Tree>, String),
    /// Rebuild a custom node from metadata and children.
    pub unflatten: fn(&str, Vec<Tree>) -> Tree,
}

thread_local! {
    static NODE_REGISTRY: RefCell<HashMap<String, PytreeNodeDef>> =
        RefCell::new(HashMap::new());
}

/// Register a custom node kind. Registration is append-only: a tag that is
/// already present keeps its original definition.
pub fn register_pytree_node(tag: &str, def: PytreeNodeDef) {
    NODE_REGISTRY.with(|reg| {
        reg.borrow_mut().entry(tag.to_string()).or_insert(def);
    });
}

fn node_def(tag: &str) -> Result<PytreeNodeDef> {
    NODE_REGISTRY.with(|reg| {
        reg.borrow().get(tag).copied().ok_or_else(|| {
            TraceError::PytreeStructureMismatch(format!(
                "unregistered pytree node kind '{tag}'"
            ))
        })
    })
}

/// Split a tree into its leaves and structure.
pub fn flatten(tree: &Tree) -> Result<(Vec<Value>, TreeDef)> {
    let mut leaves = Vec::new();
    let def = flatten_into(tree, &mut leaves)?;
    Ok((leaves, def))
}

fn flatten_into(tree: &Tree, leaves: &mut Vec<Value>) -> Result<TreeDef> {
    match tree {
        Tree::Leaf(v) => {
            leaves.push(v.clone());
            Ok(TreeDef::Leaf)
        }
        Tree::List(cs) => {
            let defs = cs
                .iter()
                .map(|c| flatten_into(c, leaves))
                .collect::<Result<Vec<_>>>()?;
            Ok(TreeDef::List(defs))
        }
        Tree::Dict(map) => {
            // BTreeMap iteration is already in ascending key order.
            let mut defs = Vec::with_capacity(map.len());
            for (k, c) in map {
                defs.push((k.clone(), flatten_into(c, leaves)?));
            }
            Ok(TreeDef::Dict(defs))
        }
        Tree::Custom {
            tag,
            meta,
            children,
        } => {
            let def = node_def(tag)?;
            let (children, meta) = (def.flatten)(children, meta);
            let defs = children
                .iter()
                .map(|c| flatten_into(c, leaves))
                .collect::<Result<Vec<_>>>()?;
            Ok(TreeDef::Custom {
                tag: tag.clone(),
                meta,
                children: defs,
            })
        }
    }
}

/// Rebuild a tree isomorphic to `def` from a flat list of leaves. Fails
/// when the leaf count disagrees with the treedef.
pub fn unflatten(def: &TreeDef, leaves: &[Value]) -> Result<Tree> {
    if leaves.len() != def.leaf_count() {
        return Err(TraceError::PytreeStructureMismatch(format!(
            "treedef wants {} leaves, got {}",
            def.leaf_count(),
            leaves.len()
        )));
    }
    let mut it = leaves.iter();
    let tree = unflatten_from(def, &mut it)?;
    Ok(tree)
}

fn unflatten_from<'a>(
    def: &TreeDef,
    leaves: &mut impl Iterator<Item = &'a Value>,
) -> Result<Tree> {
    match def {
        TreeDef::Leaf => {
            let v = leaves.next().ok_or_else(|| {
                TraceError::PytreeStructureMismatch("ran out of leaves".into())
            })?;
            Ok(Tree::Leaf(v.clone()))
        }
        TreeDef::List(cs) => Ok(Tree::List(
            cs.iter()
                .map(|c| unflatten_from(c, leaves))
                .collect::<Result<Vec<_>>>()?,
        )),
        TreeDef::Dict(cs) => {
            let mut map = BTreeMap::new();
            for (k, c) in cs {
                map.insert(k.clone(), unflatten_from(c, leaves)?);
            }
            Ok(Tree::Dict(map))
        }
        TreeDef::Custom {
            tag,
            meta,
            children,
        } => {
            let ndef = node_def(tag)?;
            let cs = children
                .iter()
                .map(|c| unflatten_from(c, leaves))
                .collect::<Result<Vec<_>>>()?;
            Ok((ndef.unflatten)(meta, cs))
        }
    }
}

/// Pointwise map over the leaves of one tree.
pub fn tree_map(f: &mut dyn FnMut(&Value) -> Result<Value>, tree: &Tree) -> Result<Tree> {
    let (leaves, def) = flatten(tree)?;
    let mapped = leaves.iter().map(|v| f(v)).collect::<Result<Vec<_>>>()?;
    unflatten(&def, &mapped)
}

/// Pointwise map over two trees of identical structure.
pub fn tree_map2(
    f: &mut dyn FnMut(&Value, &Value) -> Result<Value>,
    a: &Tree,
    b: &Tree,
) -> Result<Tree> {
    let (la, da) = flatten(a)?;
    let (lb, db) = flatten(b)?;
    if da != db {
        return Err(TraceError::PytreeStructureMismatch(
            "map over trees of different structure".into(),
        ));
    }
    let mapped = la
        .iter()
        .zip(&lb)
        .map(|(x, y)| f(x, y))
        .collect::<Result<Vec<_>>>()?;
    unflatten(&da, &mapped)
}

/// Total structural equality of tree shapes.
pub fn structure_eq(a: &Tree, b: &Tree) -> Result<bool> {
    Ok(flatten(a)?.1 == flatten(b)?.1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::ArrayValue;
    use crate::dtype::DType;
    use std::rc::Rc;

    fn leaf(v: f64) -> Tree {
        Tree::Leaf(Value::Concrete(Rc::new(ArrayValue::from_scalar(
            v,
            DType::F64,
        ))))
    }

    fn leaf_value(t: &Tree) -> f64 {
        t.as_leaf()
            .and_then(|v| v.as_concrete())
            .unwrap()
            .scalar_f64()
            .unwrap()
    }

    #[test]
    fn flatten_unflatten_round_trips() {
        let mut map = BTreeMap::new();
        map.insert("b".to_string(), leaf(2.0));
        map.insert("a".to_string(), leaf(1.0));
        let tree = Tree::List(vec![Tree::Dict(map), leaf(3.0)]);

        let (leaves, def) = flatten(&tree).unwrap();
        assert_eq!(def.leaf_count(), 3);
        // Dict keys flatten in ascending order regardless of insertion order.
        let vals: Vec<f64> = leaves
            .iter()
            .map(|v| v.as_concrete().unwrap().scalar_f64().unwrap())
            .collect();
        assert_eq!(vals, vec![1.0, 2.0, 3.0]);

        let rebuilt = unflatten(&def, &leaves).unwrap();
        assert!(structure_eq(&tree, &rebuilt).unwrap());
    }

    #[test]
    fn unflatten_checks_leaf_count() {
        let tree = Tree::List(vec![leaf(1.0), leaf(2.0)]);
        let (leaves, def) = flatten(&tree).unwrap();
        assert!(unflatten(&def, &leaves[..1]).is_err());
    }

    #[test]
    fn map2_requires_identical_structure() {
        let a = Tree::List(vec![leaf(1.0), leaf(2.0)]);
        let b = Tree::List(vec![leaf(3.0)]);
        let mut add = |_: &Value, y: &Value| Ok(y.clone());
        assert!(matches!(
            tree_map2(&mut add, &a, &b),
            Err(TraceError::PytreeStructureMismatch(_))
        ));
    }

    #[test]
    fn custom_nodes_participate_through_the_registry() {
        fn flat(children: &[Tree], meta: &str) -> (Vec<Tree>, String) {
            (children.to_vec(), meta.to_string())
        }
        fn unflat(meta: &str, children: Vec<Tree>) -> Tree {
            Tree::Custom {
                tag: "pair".into(),
                meta: meta.to_string(),
                children,
            }
        }
        register_pytree_node(
            "pair",
            PytreeNodeDef {
                flatten: flat,
                unflatten: unflat,
            },
        );

        let tree = Tree::Custom {
            tag: "pair".into(),
            meta: "m".into(),
            children: vec![leaf(4.0), leaf(5.0)],
        };
        let (leaves, def) = flatten(&tree).unwrap();
        assert_eq!(leaves.len(), 2);
        let rebuilt = unflatten(&def, &leaves).unwrap();
        assert_eq!(leaf_value(&leaf(4.0)), 4.0);
        assert!(structure_eq(&tree, &rebuilt).unwrap());
    }

    #[test]
    fn unknown_custom_tag_is_an_error() {
        let tree = Tree::Custom {
            tag: "nope".into(),
            meta: String::new(),
            children: vec![],
        };
        assert!(matches!(
            flatten(&tree),
            Err(TraceError::PytreeStructureMismatch(_))
        ));
    }
}
