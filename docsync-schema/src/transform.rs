//! `transform_operation` (spec §4.1.4): OT rules 1-8.

use crate::op::Operation;

/// Result of transforming a client operation against an already-applied
/// server operation.
#[derive(Clone, Debug, PartialEq)]
pub enum Transformed {
    Transformed(Operation),
    Noop,
    /// Reserved; current rules never produce it (spec §9 Open Questions).
    Conflict,
}

fn is_setter(kind: &str) -> bool {
    kind.ends_with(".set")
}

/// Transform `client_op` against `server_op`, which has already been
/// applied to the shared ancestor state. Pure function of the two
/// operations; does not need the schema because every rule only inspects
/// paths, kinds, and payload shape, not field types.
pub fn transform_operation(client_op: &Operation, server_op: &Operation) -> Transformed {
    // Rule 6: two moves of the same id — client wins, unconditionally, even
    // though the paths are identical and both are setters (checked before
    // rule 2 so it isn't shadowed by it).
    if client_op.kind.ends_with("move") && server_op.kind.ends_with("move") && client_op.path == server_op.path {
        return Transformed::Transformed(client_op.clone());
    }

    // Rule 4/7: server removed an array entry or tree node that the
    // client's op descends into (or targets exactly).
    if (server_op.kind == "array.remove" || server_op.kind == "tree.remove") && !server_op.path.is_empty() {
        // server_op.path is the array/tree's own path; the removed id is in
        // the payload.
        if let Some(id) = server_op.payload.get("id").and_then(crate::value::Value::as_str) {
            if client_op.descends_through(&server_op.path, id) {
                return Transformed::Noop;
            }
        }
    }
    // array.remove / tree.remove can also be invoked at path == [] when the
    // whole array/tree lives at the document root; the removed-id logic is
    // the same, just anchored at the empty path.
    if (server_op.kind == "array.remove" || server_op.kind == "tree.remove") && server_op.path.is_empty() {
        if let Some(id) = server_op.payload.get("id").and_then(crate::value::Value::as_str) {
            if client_op.descends_through(&server_op.path, id) {
                return Transformed::Noop;
            }
        }
    }

    // Rule 1: disjoint paths pass through unchanged.
    if !client_op.path.is_prefix_of(&server_op.path)
        && !server_op.path.is_prefix_of(&client_op.path)
    {
        return Transformed::Transformed(client_op.clone());
    }

    // Rule 2: identical path, both setters — client wins.
    if client_op.path == server_op.path && is_setter(&client_op.kind) && is_setter(&server_op.kind) {
        return Transformed::Transformed(client_op.clone());
    }

    // Rule 5: two inserts into the same array/tree (same path, both
    // inserts) — both pass, fractional indices disambiguate order.
    if client_op.path == server_op.path
        && (client_op.kind == "array.insert" || client_op.kind == "tree.insert")
        && client_op.kind == server_op.kind
    {
        return Transformed::Transformed(client_op.clone());
    }

    // Rule 3: server replaced an ancestor of the client's path via `set` —
    // client op still proceeds (server validates on re-application).
    if server_op.path.is_prefix_of(&client_op.path) && is_setter(&server_op.kind) {
        return Transformed::Transformed(client_op.clone());
    }

    // Rule 8: struct/union child op vs. parent `set` — child proceeds.
    if client_op.path.is_prefix_of(&server_op.path) || server_op.path.is_prefix_of(&client_op.path) {
        return Transformed::Transformed(client_op.clone());
    }

    Transformed::Transformed(client_op.clone())
}

/// Transform a whole pending client transaction's ops against every op of
/// an already-applied server transaction, in order (spec §4.3.2). Each
/// server op is folded over the current client op list in turn, so an
/// earlier server op in the same transaction can affect whether a later
/// one still finds anything to kill.
pub fn transform_transaction_ops(client_ops: &[Operation], server_ops: &[Operation]) -> Vec<Operation> {
    let mut current = client_ops.to_vec();
    for server_op in server_ops {
        current = transform_ops(&current, server_op);
    }
    current
}

/// Fold `transform_operation` over every operation in a transaction,
/// short-circuiting to `Noop`/dropping ops that any server op kills. A
/// transaction rebases to `None` (the whole transaction is dropped) only
/// when every one of its ops becomes `Noop`; spec §4.3.2/§8.1 invariant 7
/// describe rebase at the transaction level, but the laws (rules 1-8) are
/// stated per-operation, so this combinator is the bridge between the two.
pub fn transform_ops(client_ops: &[Operation], server_op: &Operation) -> Vec<Operation> {
    client_ops
        .iter()
        .filter_map(|op| match transform_operation(op, server_op) {
            Transformed::Transformed(op) => Some(op),
            Transformed::Noop => None,
            Transformed::Conflict => Some(op.clone()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::OperationPath;
    use crate::value::Value;

    #[test]
    fn tree_remove_kills_client_op_on_removed_node() {
        let server_remove = Operation::new(
            "tree.remove",
            OperationPath::root(),
            Value::Object([("id".to_string(), Value::String("child".into()))].into_iter().collect()),
        );
        let client_rename = Operation::new(
            "string.set",
            OperationPath(vec!["child".into(), "name".into()]),
            Value::from("renamed"),
        );
        assert_eq!(transform_operation(&client_rename, &server_remove), Transformed::Noop);
    }

    #[test]
    fn tree_remove_leaves_unrelated_client_op_untouched() {
        let server_remove = Operation::new(
            "tree.remove",
            OperationPath::root(),
            Value::Object([("id".to_string(), Value::String("child".into()))].into_iter().collect()),
        );
        let client_rename = Operation::new(
            "string.set",
            OperationPath(vec!["sibling".into(), "name".into()]),
            Value::from("renamed"),
        );
        assert_eq!(
            transform_operation(&client_rename, &server_remove),
            Transformed::Transformed(client_rename.clone())
        );
    }

    #[test]
    fn union_child_op_proceeds_when_server_resets_parent() {
        // Server replaces the whole union (a setter at the union's own,
        // ancestor, path); the client's in-flight child-field op still
        // proceeds per rule 3, letting the server re-validate it on replay.
        let server_set = Operation::new(
            "union.set",
            OperationPath::root(),
            Value::Object([("kind".to_string(), Value::from("square"))].into_iter().collect()),
        );
        let client_child_op = Operation::new("number.set", OperationPath(vec!["radius".into()]), Value::from(3.0));
        assert_eq!(
            transform_operation(&client_child_op, &server_set),
            Transformed::Transformed(client_child_op.clone())
        );
    }
}
