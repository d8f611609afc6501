//! The primitive algebra: schema types, operation application, OT rules,
//! fractional indexing, and the mutation-proxy layer (spec §3.1, §4.1).

mod apply;
mod fractional;
mod op;
mod proxy;
mod schema;
mod transform;
mod value;

pub use apply::{apply_operation, initial_state};
pub use fractional::{after, before, between};
pub use op::{Operation, OperationPath};
pub use proxy::{Proxy, ProxyEnv};
pub use schema::{LazySchema, Schema, TreeNodeSchema, TreeSchema, TreeSchemaBuilder, UnionSchema};
pub use transform::{transform_operation, transform_ops, transform_transaction_ops, Transformed};
pub use value::Value;

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn title_count_schema() -> Schema {
        Schema::struct_of([("title", Schema::String), ("count", Schema::Number)])
    }

    #[test]
    fn scenario_optimistic_ack() {
        let schema = title_count_schema();
        let state = initial_state(&schema);
        let op = Operation::new("string.set", OperationPath(vec!["title".into()]), Value::from("Hi"));
        let next = apply_operation(&schema, &state, &op).unwrap();
        assert_eq!(next.get("title").unwrap().as_str(), Some("Hi"));
    }

    #[test]
    fn scenario_foreign_rebase() {
        // Client sends title="client"; before ACK the server broadcasts an
        // unrelated count=100. transform_operation must pass the client op
        // through unchanged (disjoint paths).
        let client_op = Operation::new("string.set", OperationPath(vec!["title".into()]), Value::from("client"));
        let server_op = Operation::new("number.set", OperationPath(vec!["count".into()]), Value::from(100.0));
        match transform_operation(&client_op, &server_op) {
            Transformed::Transformed(op) => assert_eq!(op, client_op),
            other => panic!("expected Transformed, got {other:?}"),
        }
    }

    #[test]
    fn scenario_array_remove_kills_descendant_set() {
        let element = Schema::String;
        let schema = Schema::array(element);
        let mut state = initial_state(&schema);
        let insert = Operation::new(
            "array.insert",
            OperationPath::root(),
            Value::Object(
                [
                    ("id".to_string(), Value::String("a".into())),
                    ("pos".to_string(), Value::String("a0".into())),
                    ("value".to_string(), Value::String("x".into())),
                ]
                .into_iter()
                .collect(),
            ),
        );
        state = apply_operation(&schema, &state, &insert).unwrap();

        let client_op = Operation::new("string.set", OperationPath(vec!["a".into()]), Value::from("x2"));
        let server_op = Operation::new(
            "array.remove",
            OperationPath::root(),
            Value::Object([("id".to_string(), Value::String("a".into()))].into_iter().collect()),
        );

        assert_eq!(transform_operation(&client_op, &server_op), Transformed::Noop);
        let after_remove = apply_operation(&schema, &state, &server_op).unwrap();
        assert_eq!(after_remove.as_array().unwrap().len(), 0);
    }

    struct TestEnv {
        state: RefCell<Value>,
        schema: Schema,
        emitted: RefCell<Vec<Operation>>,
        next_id: RefCell<u64>,
    }

    impl ProxyEnv for TestEnv {
        fn emit(&self, op: Operation) {
            let mut state = self.state.borrow_mut();
            *state = apply_operation(&self.schema, &state, &op).unwrap();
            self.emitted.borrow_mut().push(op);
        }

        fn read(&self, path: &OperationPath) -> Value {
            let mut cur = self.state.borrow().clone();
            for tok in &path.0 {
                cur = cur.get(tok).cloned().unwrap_or(Value::Null);
            }
            cur
        }

        fn fresh_id(&self) -> String {
            let mut n = self.next_id.borrow_mut();
            *n += 1;
            format!("id{}", *n)
        }
    }

    #[test]
    fn proxy_struct_field_set_is_visible_immediately() {
        let schema = title_count_schema();
        let env = TestEnv {
            state: RefCell::new(initial_state(&schema)),
            schema: schema.clone(),
            emitted: RefCell::new(Vec::new()),
            next_id: RefCell::new(0),
        };
        let root = Proxy::new(schema, OperationPath::root(), &env);
        root.field("title").set("hello");
        assert_eq!(root.field("title").get().as_str(), Some("hello"));
        assert_eq!(env.emitted.borrow().len(), 1);
    }

    #[test]
    fn proxy_array_push_then_insert_at_orders_entries() {
        let schema = Schema::array(Schema::String);
        let env = TestEnv {
            state: RefCell::new(initial_state(&schema)),
            schema: schema.clone(),
            emitted: RefCell::new(Vec::new()),
            next_id: RefCell::new(0),
        };
        let root = Proxy::new(schema, OperationPath::root(), &env);
        let first = root.push("a");
        let second = root.push("c");
        root.insert_at(1, "b");
        let entries = root.get();
        let values: Vec<&str> = entries.as_array().unwrap().iter().map(|e| e.get("value").unwrap().as_str().unwrap()).collect();
        assert_eq!(values, vec!["a", "b", "c"]);
        assert_ne!(first, second);
    }
}
