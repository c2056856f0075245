// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use serde::{Deserialize, Serialize};

use super::journal::{TxMap, TxSet};
use crate::record::{IncidentRecord, ProcessInstanceIntent, ProcessInstanceRecord, NO_KEY};

/// The lifecycle event whose processing raised an incident. Resolving the
/// incident writes it again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedEvent {
    pub key: i64,
    pub intent: ProcessInstanceIntent,
    pub value: ProcessInstanceRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub key: i64,
    pub record: IncidentRecord,
    pub failed_event: Option<FailedEvent>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IncidentState {
    incidents: TxMap<i64, Incident>,
    by_element: TxSet<(i64, i64)>,
    by_job: TxMap<i64, i64>,
}

impl IncidentState {
    pub fn create(&mut self, incident: Incident) {
        self.by_element
            .add((incident.record.element_instance_key, incident.key));
        if incident.record.job_key != NO_KEY {
            self.by_job.insert(incident.record.job_key, incident.key);
        }
        self.incidents.insert(incident.key, incident);
    }

    pub fn get(&self, key: i64) -> Option<&Incident> {
        self.incidents.get(&key)
    }

    pub fn remove(&mut self, key: i64) -> Option<Incident> {
        let incident = self.incidents.remove(&key)?;
        self.by_element
            .remove(&(incident.record.element_instance_key, key));
        if incident.record.job_key != NO_KEY {
            self.by_job.remove(&incident.record.job_key);
        }
        Some(incident)
    }

    pub fn of_element(&self, element_instance_key: i64) -> Vec<i64> {
        self.by_element
            .range((element_instance_key, i64::MIN)..=(element_instance_key, i64::MAX))
            .map(|((_, key), _)| *key)
            .collect()
    }

    pub fn of_job(&self, job_key: i64) -> Option<i64> {
        self.by_job.get(&job_key).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Incident> {
        self.incidents.values()
    }

    pub fn len(&self) -> usize {
        self.incidents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.incidents.is_empty()
    }

    pub fn commit(&mut self) {
        self.incidents.commit();
        self.by_element.commit();
        self.by_job.commit();
    }

    pub fn rollback(&mut self) {
        self.incidents.rollback();
        self.by_element.rollback();
        self.by_job.rollback();
    }
}
