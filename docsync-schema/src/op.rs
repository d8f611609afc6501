//! Operation shape (spec §4.1.1).

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// An ordered sequence of string tokens locating an operation's target. The
/// root path is empty.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationPath(pub Vec<String>);

impl OperationPath {
    pub fn root() -> Self {
        OperationPath(Vec::new())
    }

    pub fn single(token: impl Into<String>) -> Self {
        OperationPath(vec![token.into()])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn first(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// Pop the first token, returning it along with the remaining path.
    pub fn split_first(&self) -> Option<(&str, OperationPath)> {
        let (first, rest) = self.0.split_first()?;
        Some((first.as_str(), OperationPath(rest.to_vec())))
    }

    pub fn pushed_front(&self, token: impl Into<String>) -> OperationPath {
        let mut v = Vec::with_capacity(self.0.len() + 1);
        v.push(token.into());
        v.extend(self.0.iter().cloned());
        OperationPath(v)
    }

    /// A new path with `token` appended at the end.
    pub fn joined(&self, token: impl Into<String>) -> OperationPath {
        let mut v = self.0.clone();
        v.push(token.into());
        OperationPath(v)
    }

    /// `self` is a prefix of `other` iff `other`'s tokens begin with `self`'s.
    pub fn is_prefix_of(&self, other: &OperationPath) -> bool {
        other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
    }
}

impl From<Vec<String>> for OperationPath {
    fn from(v: Vec<String>) -> Self {
        OperationPath(v)
    }
}

/// One atomic state change: `{kind, path, payload}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: String,
    pub path: OperationPath,
    pub payload: Value,
}

impl Operation {
    pub fn new(kind: impl Into<String>, path: OperationPath, payload: Value) -> Self {
        Operation { kind: kind.into(), path, payload }
    }

    /// Does this operation's path descend through the entry/node `id`
    /// located at `path`? Used for rules 4 and 7 of OT (array/tree removal
    /// killing a descendant client op).
    pub fn descends_through(&self, path: &OperationPath, id: &str) -> bool {
        let through = path.joined(id);
        through.is_prefix_of(&self.path)
    }
}
