//! Mutation proxy / builder layer (spec §4.1.5, §9 Design Notes).
//!
//! The spec's dynamic-proxy pattern becomes a plain builder here: a `Proxy`
//! holds a schema and a path, and exposes only the mutators that schema
//! variant actually supports. Every mutator emits exactly one [`Operation`]
//! through the ambient [`ProxyEnv`] and, where it needs to read current
//! state (to compute a fresh fractional position, or to resolve which union
//! variant is active), reads back through the same environment — proxies
//! hold no state of their own.

use crate::fractional;
use crate::op::{Operation, OperationPath};
use crate::schema::Schema;
use crate::value::Value;

/// Sink + read-back surface a `Proxy` needs. Implemented by the owning
/// `Document` (see `docsync-doc`), which records emitted ops into its
/// buffer and immediately applies them so later reads in the same
/// transaction see earlier writes.
pub trait ProxyEnv {
    fn emit(&self, op: Operation);
    fn read(&self, path: &OperationPath) -> Value;
    /// A fresh globally-unique id for a new array entry or tree node.
    fn fresh_id(&self) -> String;
}

pub struct Proxy<'a> {
    schema: Schema,
    path: OperationPath,
    env: &'a dyn ProxyEnv,
}

impl<'a> Proxy<'a> {
    pub fn new(schema: Schema, path: OperationPath, env: &'a dyn ProxyEnv) -> Self {
        Proxy { schema: schema.resolved(), path, env }
    }

    pub fn path(&self) -> &OperationPath {
        &self.path
    }

    pub fn get(&self) -> Value {
        self.env.read(&self.path)
    }

    fn emit(&self, kind: &str, payload: Value) {
        self.env.emit(Operation::new(kind, self.path.clone(), payload));
    }

    fn child(&self, schema: Schema, token: impl Into<String>) -> Proxy<'a> {
        Proxy::new(schema, self.path.joined(token), self.env)
    }

    /// Whole-state setter for any primitive (`<kind>.set`).
    pub fn set(&self, value: impl Into<Value>) {
        let value = value.into();
        match &self.schema {
            Schema::String => self.emit("string.set", value),
            Schema::Number => self.emit("number.set", value),
            Schema::Boolean => self.emit("boolean.set", value),
            Schema::Literal(_) => self.emit("literal.set", value),
            Schema::Struct(_) => self.emit("struct.set", value),
            Schema::Array(_) => self.emit("array.set", value),
            Schema::Union(_) => self.emit("union.set", value),
            Schema::Tree(_) => self.emit("tree.set", value),
            Schema::Lazy(_) => unreachable!("schema is resolved in Proxy::new"),
        }
    }

    /// Struct field access. Panics if `name` is not a declared field —
    /// field names come from generated/static schema bindings, not user
    /// input, so an unknown field is a programming error, not a runtime one.
    pub fn field(&self, name: &str) -> Proxy<'a> {
        match &self.schema {
            Schema::Struct(fields) => {
                let field_schema = fields
                    .get(name)
                    .unwrap_or_else(|| panic!("struct schema has no field {name:?}"))
                    .clone();
                self.child(field_schema, name.to_string())
            }
            Schema::Union(u) => {
                // Transparent: routing into a union goes straight to the
                // active variant's fields without consuming a path token.
                let tag = self.get().get(&u.discriminator).and_then(|v| v.as_str()).map(str::to_string);
                let tag = tag.unwrap_or_else(|| panic!("union state missing discriminator {:?}", u.discriminator));
                let variant = u
                    .variants
                    .get(&tag)
                    .unwrap_or_else(|| panic!("union has no variant {tag:?}"))
                    .clone();
                Proxy::new(variant, self.path.clone(), self.env).field(name)
            }
            other => panic!("field() called on non-struct/union schema {}", schema_name(other)),
        }
    }

    /// Switch (or confirm) the active union variant, supplying the whole
    /// variant payload including its discriminator field.
    pub fn as_variant(&self, payload: Value) {
        match &self.schema {
            Schema::Union(_) => self.emit("union.set", payload),
            other => panic!("as_variant() called on non-union schema {}", schema_name(other)),
        }
    }

    fn array_element_schema(&self) -> Schema {
        match &self.schema {
            Schema::Array(element) => (**element).clone(),
            other => panic!("array operation called on non-array schema {}", schema_name(other)),
        }
    }

    fn array_entries(&self) -> Vec<Value> {
        self.get().as_array().map(<[Value]>::to_vec).unwrap_or_default()
    }

    /// Append a value to the end of the array, returning the fresh entry id.
    pub fn push(&self, value: impl Into<Value>) -> String {
        self.array_element_schema();
        let entries = self.array_entries();
        let last_pos = entries.last().and_then(|e| e.get("pos")).and_then(Value::as_str).map(str::to_string);
        let pos = fractional::after(last_pos.as_deref());
        let id = self.env.fresh_id();
        self.emit(
            "array.insert",
            Value::Object(
                [
                    ("id".to_string(), Value::String(id.clone())),
                    ("pos".to_string(), Value::String(pos)),
                    ("value".to_string(), value.into()),
                ]
                .into_iter()
                .collect(),
            ),
        );
        id
    }

    /// Insert a value so it lands at `index` in the materialized order,
    /// returning the fresh entry id.
    pub fn insert_at(&self, index: usize, value: impl Into<Value>) -> String {
        self.array_element_schema();
        let entries = self.array_entries();
        let before = if index == 0 { None } else { entries.get(index - 1).and_then(|e| e.get("pos")).and_then(Value::as_str) };
        let after = entries.get(index).and_then(|e| e.get("pos")).and_then(Value::as_str);
        let pos = fractional::between(before, after);
        let id = self.env.fresh_id();
        self.emit(
            "array.insert",
            Value::Object(
                [
                    ("id".to_string(), Value::String(id.clone())),
                    ("pos".to_string(), Value::String(pos)),
                    ("value".to_string(), value.into()),
                ]
                .into_iter()
                .collect(),
            ),
        );
        id
    }

    pub fn remove(&self, id: &str) {
        self.emit("array.remove", Value::Object([("id".to_string(), Value::String(id.to_string()))].into_iter().collect()));
    }

    /// Move the entry `id` so it lands at `index` in the materialized order.
    pub fn move_to(&self, id: &str, index: usize) {
        let entries: Vec<Value> = self.array_entries().into_iter().filter(|e| e.get("id").and_then(Value::as_str) != Some(id)).collect();
        let before = if index == 0 { None } else { entries.get(index - 1).and_then(|e| e.get("pos")).and_then(Value::as_str) };
        let after = entries.get(index).and_then(|e| e.get("pos")).and_then(Value::as_str);
        let pos = fractional::between(before, after);
        self.emit(
            "array.move",
            Value::Object(
                [("id".to_string(), Value::String(id.to_string())), ("pos".to_string(), Value::String(pos))]
                    .into_iter()
                    .collect(),
            ),
        );
    }

    /// A proxy addressing array entry `id`'s value (or tree node `id`'s data).
    pub fn at(&self, id: &str) -> Proxy<'a> {
        match &self.schema {
            Schema::Array(element) => self.child((**element).clone(), id.to_string()),
            Schema::Tree(tree) => {
                let nodes = self.get();
                let node = nodes
                    .as_array()
                    .and_then(|ns| ns.iter().find(|n| n.get("id").and_then(Value::as_str) == Some(id)))
                    .unwrap_or_else(|| panic!("tree has no node {id:?}"));
                let type_tag = node.get("type").and_then(Value::as_str).unwrap_or_default();
                let node_def = tree.node(type_tag).unwrap_or_else(|| panic!("tree schema has no node kind {type_tag:?}"));
                self.child(node_def.data.clone(), id.to_string())
            }
            other => panic!("at() called on non-array/tree schema {}", schema_name(other)),
        }
    }

    /// Insert a new tree node. `node` must be `{id, type, parentId, data}`;
    /// `id` may be omitted (a fresh one is generated).
    pub fn insert_child(&self, type_tag: &str, parent_id: &str, data: Value) -> String {
        match &self.schema {
            Schema::Tree(_) => {}
            other => panic!("insert_child() called on non-tree schema {}", schema_name(other)),
        }
        let id = self.env.fresh_id();
        let node = Value::Object(
            [
                ("id".to_string(), Value::String(id.clone())),
                ("type".to_string(), Value::String(type_tag.to_string())),
                ("parentId".to_string(), Value::String(parent_id.to_string())),
                ("data".to_string(), data),
            ]
            .into_iter()
            .collect(),
        );
        self.emit("tree.insert", node);
        id
    }

    pub fn remove_node(&self, id: &str) {
        self.emit("tree.remove", Value::Object([("id".to_string(), Value::String(id.to_string()))].into_iter().collect()));
    }

    pub fn move_node(&self, id: &str, new_parent_id: &str, pos: impl Into<String>) {
        self.emit(
            "tree.move",
            Value::Object(
                [
                    ("id".to_string(), Value::String(id.to_string())),
                    ("parentId".to_string(), Value::String(new_parent_id.to_string())),
                    ("pos".to_string(), Value::String(pos.into())),
                ]
                .into_iter()
                .collect(),
            ),
        );
    }
}

fn schema_name(schema: &Schema) -> &'static str {
    match schema {
        Schema::String => "String",
        Schema::Number => "Number",
        Schema::Boolean => "Boolean",
        Schema::Literal(_) => "Literal",
        Schema::Struct(_) => "Struct",
        Schema::Array(_) => "Array",
        Schema::Union(_) => "Union",
        Schema::Tree(_) => "Tree",
        Schema::Lazy(_) => "Lazy",
    }
}
