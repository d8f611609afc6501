//! `apply_operation` (spec §4.1.2) and `initial_state`.

use docsync_base::{err_kind, ErrorKind, Result};

use crate::op::Operation;
use crate::schema::Schema;
use crate::value::Value;

fn validation(msg: impl Into<std::borrow::Cow<'static, str>>) -> docsync_base::Error {
    err_kind(ErrorKind::Validation, msg)
}

/// The schema's default state: empty struct/array, first-declared union
/// variant, a freshly-minted single root node for a tree.
pub fn initial_state(schema: &Schema) -> Value {
    match schema {
        Schema::String => Value::String(String::new()),
        Schema::Number => Value::Number(0.0),
        Schema::Boolean => Value::Bool(false),
        Schema::Literal(l) => l.clone(),
        Schema::Struct(_) => Value::object(),
        Schema::Array(_) => Value::Array(Vec::new()),
        Schema::Union(u) => {
            let (tag, variant) = u
                .variants
                .iter()
                .next()
                .expect("union schema must declare at least one variant");
            let mut state = struct_initial_object(variant);
            state.insert(u.discriminator.clone(), Value::String(tag.clone()));
            Value::Object(state)
        }
        Schema::Tree(t) => {
            let root = t.root();
            let data = initial_state(&root.data);
            let mut node = std::collections::BTreeMap::new();
            node.insert("id".to_string(), Value::String("root".to_string()));
            node.insert("type".to_string(), Value::String(root.type_tag.clone()));
            node.insert("parentId".to_string(), Value::Null);
            node.insert("pos".to_string(), Value::String(String::new()));
            node.insert("data".to_string(), data);
            Value::Array(vec![Value::Object(node)])
        }
        Schema::Lazy(l) => initial_state(l.resolve()),
    }
}

fn struct_initial_object(schema: &Schema) -> std::collections::BTreeMap<String, Value> {
    match initial_state(&schema.resolved()) {
        Value::Object(o) => o,
        _ => std::collections::BTreeMap::new(),
    }
}

fn expect_object(v: &Value) -> Result<&std::collections::BTreeMap<String, Value>> {
    v.as_object().ok_or_else(|| validation("expected object state"))
}

fn expect_array(v: &Value) -> Result<&[Value]> {
    v.as_array().ok_or_else(|| validation("expected array state"))
}

fn sort_entries_by_pos(entries: &mut [Value]) {
    entries.sort_by(|a, b| {
        let pa = a.get("pos").and_then(Value::as_str).unwrap_or("");
        let pb = b.get("pos").and_then(Value::as_str).unwrap_or("");
        pa.cmp(pb)
    });
}

/// Apply one operation to `state`, returning the new state. Never mutates
/// `state` in place (callers that want atomic multi-op application roll
/// back by discarding the partially-built result on error).
pub fn apply_operation(schema: &Schema, state: &Value, op: &Operation) -> Result<Value> {
    match schema {
        Schema::Lazy(l) => apply_operation(l.resolve(), state, op),
        Schema::String | Schema::Number | Schema::Boolean => {
            apply_scalar(schema, state, op)
        }
        Schema::Literal(l) => apply_literal(l, state, op),
        Schema::Struct(fields) => apply_struct(fields, state, op),
        Schema::Array(element) => apply_array(element, state, op),
        Schema::Union(u) => apply_union(u, state, op),
        Schema::Tree(t) => apply_tree(t, state, op),
    }
}

fn apply_scalar(schema: &Schema, _state: &Value, op: &Operation) -> Result<Value> {
    if !op.path.is_empty() {
        return Err(validation(format!("scalar primitive cannot route path {:?}", op.path)));
    }
    let expected_kind = match schema {
        Schema::String => "string.set",
        Schema::Number => "number.set",
        Schema::Boolean => "boolean.set",
        _ => unreachable!(),
    };
    if op.kind != expected_kind {
        return Err(validation(format!("expected op kind {expected_kind:?}, got {:?}", op.kind)));
    }
    let ok = match schema {
        Schema::String => matches!(op.payload, Value::String(_)),
        Schema::Number => matches!(op.payload, Value::Number(_)),
        Schema::Boolean => matches!(op.payload, Value::Bool(_)),
        _ => unreachable!(),
    };
    if !ok {
        return Err(validation(format!("payload does not match scalar type for {expected_kind}")));
    }
    Ok(op.payload.clone())
}

fn apply_literal(literal: &Value, _state: &Value, op: &Operation) -> Result<Value> {
    if !op.path.is_empty() {
        return Err(validation("literal primitive cannot route path"));
    }
    if op.kind != "literal.set" {
        return Err(validation(format!("expected op kind \"literal.set\", got {:?}", op.kind)));
    }
    if &op.payload != literal {
        return Err(validation("literal.set payload does not equal declared literal"));
    }
    Ok(literal.clone())
}

fn apply_struct(
    fields: &std::collections::BTreeMap<String, Schema>,
    state: &Value,
    op: &Operation,
) -> Result<Value> {
    if op.path.is_empty() {
        if op.kind != "struct.set" {
            return Err(validation(format!("expected op kind \"struct.set\", got {:?}", op.kind)));
        }
        let obj = op.payload.as_object().ok_or_else(|| validation("struct.set payload must be an object"))?;
        for key in obj.keys() {
            if !fields.contains_key(key) {
                return Err(validation(format!("struct.set payload has unknown field {key:?}")));
            }
        }
        return Ok(op.payload.clone());
    }
    let (field_name, rest) = op.path.split_first().expect("non-empty path has a first token");
    let field_schema = fields
        .get(field_name)
        .ok_or_else(|| validation(format!("unknown struct field {field_name:?}")))?;
    let current = state.get(field_name).cloned().unwrap_or_else(|| initial_state(field_schema));
    let child_op = Operation { kind: op.kind.clone(), path: rest, payload: op.payload.clone() };
    let new_child = apply_operation(field_schema, &current, &child_op)?;
    let mut obj = expect_object(state)?.clone();
    obj.insert(field_name.to_string(), new_child);
    Ok(Value::Object(obj))
}

fn apply_array(element: &Schema, state: &Value, op: &Operation) -> Result<Value> {
    if op.path.is_empty() {
        match op.kind.as_str() {
            "array.set" => {
                expect_array(&op.payload)?;
                return Ok(op.payload.clone());
            }
            "array.insert" => {
                let id = op
                    .payload
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| validation("array.insert payload missing id"))?
                    .to_string();
                let pos = op
                    .payload
                    .get("pos")
                    .and_then(Value::as_str)
                    .ok_or_else(|| validation("array.insert payload missing pos"))?
                    .to_string();
                let value = op
                    .payload
                    .get("value")
                    .cloned()
                    .ok_or_else(|| validation("array.insert payload missing value"))?;
                let mut entries = expect_array(state)?.to_vec();
                if entries.iter().any(|e| e.get("id").and_then(Value::as_str) == Some(id.as_str())) {
                    return Err(validation(format!("array already has entry id {id:?}")));
                }
                if entries.iter().any(|e| e.get("pos").and_then(Value::as_str) == Some(pos.as_str())) {
                    return Err(validation(format!("array already has entry at pos {pos:?}")));
                }
                let mut entry = std::collections::BTreeMap::new();
                entry.insert("id".to_string(), Value::String(id));
                entry.insert("pos".to_string(), Value::String(pos));
                entry.insert("value".to_string(), value);
                entries.push(Value::Object(entry));
                sort_entries_by_pos(&mut entries);
                return Ok(Value::Array(entries));
            }
            "array.remove" => {
                let id = op
                    .payload
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| validation("array.remove payload missing id"))?;
                let mut entries = expect_array(state)?.to_vec();
                let before = entries.len();
                entries.retain(|e| e.get("id").and_then(Value::as_str) != Some(id));
                if entries.len() == before {
                    return Err(validation(format!("array.remove: unknown id {id:?}")));
                }
                return Ok(Value::Array(entries));
            }
            "array.move" => {
                let id = op
                    .payload
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| validation("array.move payload missing id"))?;
                let pos = op
                    .payload
                    .get("pos")
                    .and_then(Value::as_str)
                    .ok_or_else(|| validation("array.move payload missing pos"))?;
                let mut entries = expect_array(state)?.to_vec();
                let idx = entries
                    .iter()
                    .position(|e| e.get("id").and_then(Value::as_str) == Some(id))
                    .ok_or_else(|| validation(format!("array.move: unknown id {id:?}")))?;
                if let Value::Object(o) = &mut entries[idx] {
                    o.insert("pos".to_string(), Value::String(pos.to_string()));
                }
                sort_entries_by_pos(&mut entries);
                return Ok(Value::Array(entries));
            }
            other => return Err(validation(format!("unknown array op kind {other:?}"))),
        }
    }
    let (id, rest) = op.path.split_first().expect("non-empty path has a first token");
    let mut entries = expect_array(state)?.to_vec();
    let idx = entries
        .iter()
        .position(|e| e.get("id").and_then(Value::as_str) == Some(id))
        .ok_or_else(|| validation(format!("unknown array entry id {id:?}")))?;
    let current_value = entries[idx].get("value").cloned().unwrap_or_else(|| initial_state(element));
    let child_op = Operation { kind: op.kind.clone(), path: rest, payload: op.payload.clone() };
    let new_value = apply_operation(element, &current_value, &child_op)?;
    if let Value::Object(o) = &mut entries[idx] {
        o.insert("value".to_string(), new_value);
    }
    Ok(Value::Array(entries))
}

fn active_variant<'a>(
    union: &'a crate::schema::UnionSchema,
    state: &Value,
) -> Result<(&'a str, &'a Schema)> {
    let tag = state
        .get(&union.discriminator)
        .and_then(Value::as_str)
        .ok_or_else(|| validation("union state missing discriminator field"))?;
    union
        .variants
        .iter()
        .find(|(t, _)| t.as_str() == tag)
        .map(|(t, s)| (t.as_str(), s))
        .ok_or_else(|| validation(format!("union state has unknown active variant tag {tag:?}")))
}

fn apply_union(union: &crate::schema::UnionSchema, state: &Value, op: &Operation) -> Result<Value> {
    if op.path.is_empty() && op.kind == "union.set" {
        let obj = op.payload.as_object().ok_or_else(|| validation("union.set payload must be an object"))?;
        let tag = obj
            .get(&union.discriminator)
            .and_then(Value::as_str)
            .ok_or_else(|| validation("union.set payload missing discriminator field"))?;
        if !union.variants.contains_key(tag) {
            return Err(validation(format!("union.set payload has unknown discriminator tag {tag:?}")));
        }
        return Ok(op.payload.clone());
    }
    let (_, variant) = active_variant(union, state)?;
    apply_operation(variant, state, op)
}

fn apply_tree(tree: &crate::schema::TreeSchema, state: &Value, op: &Operation) -> Result<Value> {
    if op.path.is_empty() {
        match op.kind.as_str() {
            "tree.set" => {
                expect_array(&op.payload)?;
                return Ok(op.payload.clone());
            }
            "tree.insert" => {
                let node = op.payload.clone();
                let node_obj = node.as_object().ok_or_else(|| validation("tree.insert payload must be an object"))?;
                let id = node_obj
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| validation("tree.insert payload missing id"))?
                    .to_string();
                let type_tag = node_obj
                    .get("type")
                    .and_then(Value::as_str)
                    .ok_or_else(|| validation("tree.insert payload missing type"))?
                    .to_string();
                let parent_id = node_obj.get("parentId").cloned().unwrap_or(Value::Null);
                let mut nodes = expect_array(state)?.to_vec();
                if nodes.iter().any(|n| n.get("id").and_then(Value::as_str) == Some(id.as_str())) {
                    return Err(validation(format!("tree already has node id {id:?}")));
                }
                let parent_id_str = parent_id.as_str().ok_or_else(|| validation("tree.insert requires a non-root parentId"))?;
                let parent = nodes
                    .iter()
                    .find(|n| n.get("id").and_then(Value::as_str) == Some(parent_id_str))
                    .ok_or_else(|| validation(format!("tree.insert: unknown parent id {parent_id_str:?}")))?;
                let parent_tag = parent.get("type").and_then(Value::as_str).unwrap_or_default();
                if !tree.allows_child(parent_tag, &type_tag) {
                    return Err(validation(format!(
                        "tree schema does not allow {type_tag:?} under {parent_tag:?}"
                    )));
                }
                nodes.push(node);
                return Ok(Value::Array(nodes));
            }
            "tree.remove" => {
                let id = op
                    .payload
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| validation("tree.remove payload missing id"))?;
                if id == "root" {
                    return Err(validation("cannot remove the tree root node"));
                }
                let mut nodes = expect_array(state)?.to_vec();
                let mut removed: std::collections::HashSet<String> = std::collections::HashSet::new();
                removed.insert(id.to_string());
                loop {
                    let mut grew = false;
                    for n in &nodes {
                        let nid = n.get("id").and_then(Value::as_str).unwrap_or_default();
                        let parent = n.get("parentId").and_then(Value::as_str);
                        if let Some(parent) = parent {
                            if removed.contains(parent) && !removed.contains(nid) {
                                removed.insert(nid.to_string());
                                grew = true;
                            }
                        }
                    }
                    if !grew {
                        break;
                    }
                }
                nodes.retain(|n| {
                    let nid = n.get("id").and_then(Value::as_str).unwrap_or_default();
                    !removed.contains(nid)
                });
                return Ok(Value::Array(nodes));
            }
            "tree.move" => {
                let id = op
                    .payload
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| validation("tree.move payload missing id"))?
                    .to_string();
                if id == "root" {
                    return Err(validation("cannot move the tree root node"));
                }
                let new_parent_id = op
                    .payload
                    .get("parentId")
                    .and_then(Value::as_str)
                    .ok_or_else(|| validation("tree.move payload missing parentId"))?
                    .to_string();
                let pos = op
                    .payload
                    .get("pos")
                    .and_then(Value::as_str)
                    .ok_or_else(|| validation("tree.move payload missing pos"))?
                    .to_string();
                let mut nodes = expect_array(state)?.to_vec();
                if !nodes.iter().any(|n| n.get("id").and_then(Value::as_str) == Some(new_parent_id.as_str())) {
                    return Err(validation(format!("tree.move: unknown parent id {new_parent_id:?}")));
                }
                if is_ancestor_or_self(&nodes, &new_parent_id, &id) {
                    return Err(validation("tree.move would create a cycle"));
                }
                let parent_tag = nodes
                    .iter()
                    .find(|n| n.get("id").and_then(Value::as_str) == Some(new_parent_id.as_str()))
                    .and_then(|n| n.get("type"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let idx = nodes
                    .iter()
                    .position(|n| n.get("id").and_then(Value::as_str) == Some(id.as_str()))
                    .ok_or_else(|| validation(format!("tree.move: unknown node id {id:?}")))?;
                let child_tag = nodes[idx].get("type").and_then(Value::as_str).unwrap_or_default().to_string();
                if !tree.allows_child(&parent_tag, &child_tag) {
                    return Err(validation(format!(
                        "tree schema does not allow {child_tag:?} under {parent_tag:?}"
                    )));
                }
                if let Value::Object(o) = &mut nodes[idx] {
                    o.insert("parentId".to_string(), Value::String(new_parent_id));
                    o.insert("pos".to_string(), Value::String(pos));
                }
                return Ok(Value::Array(nodes));
            }
            other => return Err(validation(format!("unknown tree op kind {other:?}"))),
        }
    }
    let (id, rest) = op.path.split_first().expect("non-empty path has a first token");
    let nodes = expect_array(state)?.to_vec();
    let idx = nodes
        .iter()
        .position(|n| n.get("id").and_then(Value::as_str) == Some(id))
        .ok_or_else(|| validation(format!("unknown tree node id {id:?}")))?;
    let type_tag = nodes[idx].get("type").and_then(Value::as_str).unwrap_or_default().to_string();
    let node_def = tree
        .node(&type_tag)
        .ok_or_else(|| validation(format!("tree schema has no node kind {type_tag:?}")))?;
    let current_data = nodes[idx].get("data").cloned().unwrap_or_else(|| initial_state(&node_def.data));
    let child_op = Operation { kind: op.kind.clone(), path: rest, payload: op.payload.clone() };
    let new_data = apply_operation(&node_def.data, &current_data, &child_op)?;
    let mut nodes = nodes;
    if let Value::Object(o) = &mut nodes[idx] {
        o.insert("data".to_string(), new_data);
    }
    Ok(Value::Array(nodes))
}

fn is_ancestor_or_self(nodes: &[Value], candidate_ancestor: &str, id: &str) -> bool {
    let mut cur = candidate_ancestor.to_string();
    loop {
        if cur == id {
            return true;
        }
        let parent = nodes
            .iter()
            .find(|n| n.get("id").and_then(Value::as_str) == Some(cur.as_str()))
            .and_then(|n| n.get("parentId"))
            .and_then(Value::as_str);
        match parent {
            Some(p) => cur = p.to_string(),
            None => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Schema, TreeSchemaBuilder, UnionSchema};

    fn folder_tree_schema() -> Schema {
        Schema::Tree(std::sync::Arc::new(
            TreeSchemaBuilder::new()
                .node("folder", Schema::struct_of([("name", Schema::String)]), &["folder"])
                .root("folder")
                .build(),
        ))
    }

    fn insert_op(id: &str, parent_id: &str, type_tag: &str) -> Operation {
        Operation::new(
            "tree.insert",
            OperationPath::root(),
            Value::Object(
                [
                    ("id".to_string(), Value::String(id.into())),
                    ("type".to_string(), Value::String(type_tag.into())),
                    ("parentId".to_string(), Value::String(parent_id.into())),
                    ("pos".to_string(), Value::String("a0".into())),
                    ("data".to_string(), Value::object()),
                ]
                .into_iter()
                .collect(),
            ),
        )
    }

    #[test]
    fn tree_remove_cascades_to_descendants() {
        let schema = folder_tree_schema();
        let mut state = initial_state(&schema);
        state = apply_operation(&schema, &state, &insert_op("child", "root", "folder")).unwrap();
        state = apply_operation(&schema, &state, &insert_op("grandchild", "child", "folder")).unwrap();
        assert_eq!(state.as_array().unwrap().len(), 3);

        let remove = Operation::new(
            "tree.remove",
            OperationPath::root(),
            Value::Object([("id".to_string(), Value::String("child".into()))].into_iter().collect()),
        );
        let after_remove = apply_operation(&schema, &state, &remove).unwrap();
        let ids: Vec<&str> = after_remove.as_array().unwrap().iter().map(|n| n.get("id").unwrap().as_str().unwrap()).collect();
        assert_eq!(ids, vec!["root"]);
    }

    #[test]
    fn tree_move_into_own_descendant_is_rejected() {
        let schema = folder_tree_schema();
        let mut state = initial_state(&schema);
        state = apply_operation(&schema, &state, &insert_op("child", "root", "folder")).unwrap();
        state = apply_operation(&schema, &state, &insert_op("grandchild", "child", "folder")).unwrap();

        let cyclic_move = Operation::new(
            "tree.move",
            OperationPath::root(),
            Value::Object(
                [
                    ("id".to_string(), Value::String("child".into())),
                    ("parentId".to_string(), Value::String("grandchild".into())),
                    ("pos".to_string(), Value::String("a0".into())),
                ]
                .into_iter()
                .collect(),
            ),
        );
        let err = apply_operation(&schema, &state, &cyclic_move).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    fn shape_union_schema() -> Schema {
        Schema::Union(std::sync::Arc::new(UnionSchema {
            discriminator: "kind".to_string(),
            variants: [
                ("circle".to_string(), Schema::struct_of([("kind", Schema::Literal(Value::from("circle"))), ("radius", Schema::Number)])),
                ("square".to_string(), Schema::struct_of([("kind", Schema::Literal(Value::from("square"))), ("side", Schema::Number)])),
            ]
            .into_iter()
            .collect(),
        }))
    }

    #[test]
    fn union_set_switches_variant_and_routes_child_ops_into_it() {
        let schema = shape_union_schema();
        let circle_payload = Value::Object(
            [("kind".to_string(), Value::from("circle")), ("radius".to_string(), Value::from(1.0))]
                .into_iter()
                .collect(),
        );
        let set = Operation::new("union.set", OperationPath::root(), circle_payload);
        let state = apply_operation(&schema, &initial_state(&schema), &set).unwrap();
        assert_eq!(state.get("kind").unwrap().as_str(), Some("circle"));

        let grow = Operation::new("number.set", OperationPath(vec!["radius".into()]), Value::from(5.0));
        let state = apply_operation(&schema, &state, &grow).unwrap();
        assert_eq!(state.get("radius").unwrap().as_f64(), Some(5.0));
    }

    #[test]
    fn union_set_with_unknown_discriminator_fails() {
        let schema = shape_union_schema();
        let bogus = Operation::new("union.set", OperationPath::root(), Value::Object([("kind".to_string(), Value::from("triangle"))].into_iter().collect()));
        assert!(apply_operation(&schema, &initial_state(&schema), &bogus).is_err());
    }
}
