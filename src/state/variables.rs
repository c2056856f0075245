// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Scoped variables.
//!
//! Every element instance owns a variable scope keyed by its instance key.
//! Lookups walk from a scope outwards to the process instance.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::journal::TxMap;
use crate::expr::Document;

#[derive(Debug, Clone, PartialEq)]
pub struct VariableChange {
    pub scope_key: i64,
    pub name: String,
    pub value: Value,
    pub created: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableState {
    documents: TxMap<i64, Document>,
    parents: TxMap<i64, i64>,
}

impl VariableState {
    pub fn create_scope(&mut self, key: i64, parent: Option<i64>) {
        if !self.documents.contains_key(&key) {
            self.documents.insert(key, Document::new());
        }
        if let Some(parent) = parent {
            self.parents.insert(key, parent);
        }
    }

    pub fn remove_scope(&mut self, key: i64) {
        self.documents.remove(&key);
        self.parents.remove(&key);
    }

    pub fn has_scope(&self, key: i64) -> bool {
        self.documents.contains_key(&key)
    }

    pub fn parent(&self, key: i64) -> Option<i64> {
        self.parents.get(&key).copied()
    }

    pub fn local(&self, key: i64) -> Option<&Document> {
        self.documents.get(&key)
    }

    /// Scope chain from `key` outwards.
    fn chain(&self, key: i64) -> Vec<i64> {
        let mut chain = vec![key];
        let mut current = key;
        while let Some(parent) = self.parent(current) {
            chain.push(parent);
            current = parent;
        }
        chain
    }

    pub fn get(&self, scope: i64, name: &str) -> Option<&Value> {
        self.chain(scope)
            .into_iter()
            .find_map(|key| self.documents.get(&key).and_then(|d| d.get(name)))
    }

    /// Everything visible from `scope`, inner scopes shadowing outer ones.
    pub fn collect(&self, scope: i64) -> Document {
        let mut result = Document::new();
        for key in self.chain(scope).into_iter().rev() {
            if let Some(document) = self.documents.get(&key) {
                result.merge(document);
            }
        }
        result
    }

    pub fn set_local(&mut self, scope: i64, name: &str, value: Value) -> Option<VariableChange> {
        if !self.documents.contains_key(&scope) {
            self.documents.insert(scope, Document::new());
        }
        let document = self.documents.get_mut(&scope)?;
        let created = match document.get(name) {
            Some(existing) if *existing == value => return None,
            Some(_) => false,
            None => true,
        };
        document.insert(name, value.clone());
        Some(VariableChange {
            scope_key: scope,
            name: name.to_string(),
            value,
            created,
        })
    }

    pub fn set_local_document(&mut self, scope: i64, document: &Document) -> Vec<VariableChange> {
        document
            .iter()
            .filter_map(|(name, value)| self.set_local(scope, name, value.clone()))
            .collect()
    }

    /// Writes each variable at the nearest scope (from `scope` outwards) that
    /// already defines it, or at the outermost scope otherwise.
    pub fn propagate(&mut self, scope: i64, document: &Document) -> Vec<VariableChange> {
        let chain = self.chain(scope);
        let Some(&root) = chain.last() else {
            return Vec::new();
        };
        let mut changes = Vec::new();
        for (name, value) in document.iter() {
            let target = chain
                .iter()
                .copied()
                .find(|key| self.documents.get(key).is_some_and(|d| d.get(name).is_some()))
                .unwrap_or(root);
            if let Some(change) = self.set_local(target, name, value.clone()) {
                changes.push(change);
            }
        }
        changes
    }

    pub fn commit(&mut self) {
        self.documents.commit();
        self.parents.commit();
    }

    pub fn rollback(&mut self) {
        self.documents.rollback();
        self.parents.rollback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        Document::from_value(value).unwrap()
    }

    #[test]
    fn test_lookup_walks_outwards() {
        let mut vars = VariableState::default();
        vars.create_scope(1, None);
        vars.create_scope(2, Some(1));
        vars.set_local_document(1, &doc(json!({"a": 1, "b": 1})));
        vars.set_local(2, "b", json!(2));

        assert_eq!(vars.get(2, "a"), Some(&json!(1)));
        assert_eq!(vars.get(2, "b"), Some(&json!(2)));
        assert_eq!(vars.get(1, "b"), Some(&json!(1)));
        assert_eq!(vars.collect(2).to_value(), json!({"a": 1, "b": 2}));
    }

    #[test]
    fn test_propagate_targets_defining_scope() {
        let mut vars = VariableState::default();
        vars.create_scope(1, None);
        vars.create_scope(2, Some(1));
        vars.create_scope(3, Some(2));
        vars.set_local(2, "x", json!(0));

        let changes = vars.propagate(3, &doc(json!({"x": 5, "y": 6})));
        assert_eq!(changes.len(), 2);
        assert_eq!(vars.local(2).unwrap().get("x"), Some(&json!(5)));
        assert_eq!(vars.local(1).unwrap().get("y"), Some(&json!(6)));
        assert!(vars.local(3).unwrap().is_empty());
        assert!(!changes[0].created);
        assert!(changes[1].created);
    }

    #[test]
    fn test_unchanged_values_are_not_reported() {
        let mut vars = VariableState::default();
        vars.create_scope(1, None);
        assert!(vars.set_local(1, "a", json!(1)).is_some());
        assert!(vars.set_local(1, "a", json!(1)).is_none());
    }
}
