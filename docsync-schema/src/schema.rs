//! Schema types (spec §3.1): Scalar, Struct, Array, Union, Lazy, TreeNode, Tree.
//!
//! Recursive schemas are handled two different ways depending on which kind
//! of recursion is needed:
//!
//! - `Struct`/`Array` self-reference (e.g. "a comment has replies: an array
//!   of comments") goes through [`Lazy`], a closure memoized behind a
//!   `OnceLock` the first time it's resolved, per §9 Design Notes.
//! - `TreeNode` children reference other node kinds *by type tag*, looked up
//!   in the owning [`Tree`]'s registry at apply/validate time. Because the
//!   reference is a string, not a value, it never needs to be lazily built:
//!   the whole node-kind registry can be constructed up front even when node
//!   kinds allow each other (or themselves) as children. This is simpler
//!   than arena-indexed handles for the common case and is the Open
//!   Question resolution recorded in DESIGN.md.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use crate::value::Value;

#[derive(Clone)]
pub enum Schema {
    String,
    Number,
    Boolean,
    Literal(Value),
    Struct(Arc<BTreeMap<String, Schema>>),
    Array(Arc<Schema>),
    Union(Arc<UnionSchema>),
    Tree(Arc<TreeSchema>),
    Lazy(LazySchema),
}

impl Schema {
    pub fn struct_of(fields: impl IntoIterator<Item = (&'static str, Schema)>) -> Schema {
        Schema::Struct(Arc::new(fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect()))
    }

    pub fn array(element: Schema) -> Schema {
        Schema::Array(Arc::new(element))
    }

    /// Follow `Lazy` indirection until a concrete (non-`Lazy`) schema is
    /// reached. Every other variant is already concrete.
    pub fn resolved(&self) -> Schema {
        match self {
            Schema::Lazy(l) => l.resolve().resolved(),
            other => other.clone(),
        }
    }
}

pub struct UnionSchema {
    pub discriminator: String,
    pub variants: BTreeMap<String, Schema>,
}

#[derive(Clone)]
pub struct TreeNodeSchema {
    pub type_tag: String,
    /// Must resolve to `Schema::Struct`.
    pub data: Schema,
    pub allowed_children: Vec<String>,
}

pub struct TreeSchema {
    pub root_tag: String,
    pub nodes: BTreeMap<String, TreeNodeSchema>,
}

impl TreeSchema {
    pub fn node(&self, type_tag: &str) -> Option<&TreeNodeSchema> {
        self.nodes.get(type_tag)
    }

    pub fn root(&self) -> &TreeNodeSchema {
        self.nodes.get(&self.root_tag).expect("tree schema root_tag must be registered")
    }

    pub fn allows_child(&self, parent_tag: &str, child_tag: &str) -> bool {
        self.nodes
            .get(parent_tag)
            .map(|n| n.allowed_children.iter().any(|t| t == child_tag))
            .unwrap_or(false)
    }
}

pub struct TreeSchemaBuilder {
    root_tag: Option<String>,
    nodes: BTreeMap<String, TreeNodeSchema>,
}

impl TreeSchemaBuilder {
    pub fn new() -> Self {
        TreeSchemaBuilder { root_tag: None, nodes: BTreeMap::new() }
    }

    pub fn node(mut self, type_tag: &str, data: Schema, allowed_children: &[&str]) -> Self {
        self.nodes.insert(
            type_tag.to_string(),
            TreeNodeSchema {
                type_tag: type_tag.to_string(),
                data,
                allowed_children: allowed_children.iter().map(|s| s.to_string()).collect(),
            },
        );
        self
    }

    pub fn root(mut self, type_tag: &str) -> Self {
        self.root_tag = Some(type_tag.to_string());
        self
    }

    pub fn build(self) -> TreeSchema {
        let root_tag = self.root_tag.expect("TreeSchemaBuilder::build called without root()");
        assert!(
            self.nodes.contains_key(&root_tag),
            "tree schema root tag {root_tag:?} was never registered via node()"
        );
        TreeSchema { root_tag, nodes: self.nodes }
    }
}

impl Default for TreeSchemaBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct LazySchema(Arc<LazyInner>);

struct LazyInner {
    factory: Box<dyn Fn() -> Schema + Send + Sync>,
    resolved: OnceLock<Schema>,
}

impl LazySchema {
    pub fn new(factory: impl Fn() -> Schema + Send + Sync + 'static) -> Self {
        LazySchema(Arc::new(LazyInner { factory: Box::new(factory), resolved: OnceLock::new() }))
    }

    pub fn resolve(&self) -> &Schema {
        self.0.resolved.get_or_init(|| (self.0.factory)())
    }
}
