// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Deployed processes.
//!
//! The model text is part of the state; compiled processes are a cache that
//! is rebuilt after a snapshot is restored.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use super::journal::TxMap;
use crate::bpmn::{compile_json, ExecutableProcess};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployedProcess {
    pub key: i64,
    pub bpmn_process_id: String,
    pub version: i32,
    pub resource_name: String,
    pub resource: String,
    /// blake3 of `resource`, hex encoded.
    pub digest: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessState {
    definitions: TxMap<i64, DeployedProcess>,
    versions: TxMap<(String, i32), i64>,
    latest: TxMap<String, i64>,
    #[serde(skip)]
    compiled: FxHashMap<i64, Arc<ExecutableProcess>>,
}

impl PartialEq for ProcessState {
    fn eq(&self, other: &Self) -> bool {
        self.definitions == other.definitions && self.latest == other.latest
    }
}

pub fn resource_digest(resource: &str) -> String {
    blake3::hash(resource.as_bytes()).to_hex().to_string()
}

impl ProcessState {
    pub fn put(&mut self, process: DeployedProcess, compiled: Arc<ExecutableProcess>) {
        let key = process.key;
        self.versions
            .insert((process.bpmn_process_id.clone(), process.version), key);
        self.latest.insert(process.bpmn_process_id.clone(), key);
        self.definitions.insert(key, process);
        self.compiled.insert(key, compiled);
    }

    pub fn get(&self, key: i64) -> Option<&DeployedProcess> {
        self.definitions.get(&key)
    }

    pub fn latest_by_id(&self, bpmn_process_id: &str) -> Option<&DeployedProcess> {
        let key = self.latest.get(&bpmn_process_id.to_string())?;
        self.definitions.get(key)
    }

    pub fn by_id_and_version(&self, bpmn_process_id: &str, version: i32) -> Option<&DeployedProcess> {
        let key = self.versions.get(&(bpmn_process_id.to_string(), version))?;
        self.definitions.get(key)
    }

    pub fn executable(&self, key: i64) -> Option<Arc<ExecutableProcess>> {
        self.compiled.get(&key).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeployedProcess> {
        self.definitions.values()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Recompiles every stored model.
    pub fn rebuild(&mut self) -> Result<()> {
        self.compiled.clear();
        for process in self.definitions.values() {
            let compiled = compile_json(&process.resource)?;
            self.compiled.insert(process.key, Arc::new(compiled));
        }
        Ok(())
    }

    pub fn commit(&mut self) {
        self.definitions.commit();
        self.versions.commit();
        self.latest.commit();
    }

    pub fn rollback(&mut self) {
        self.definitions.rollback();
        self.versions.rollback();
        self.latest.rollback();
        let definitions = &self.definitions;
        self.compiled.retain(|key, _| definitions.contains_key(key));
    }
}
