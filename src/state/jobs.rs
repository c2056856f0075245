// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use serde::{Deserialize, Serialize};

use super::journal::{TxMap, TxSet};
use crate::record::{JobRecord, NO_KEY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Activatable,
    Activated,
    /// Out of retries, waiting on an incident.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub key: i64,
    pub status: JobStatus,
    pub record: JobRecord,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    jobs: TxMap<i64, Job>,
    activatable: TxSet<(String, i64)>,
    deadlines: TxSet<(i64, i64)>,
}

impl JobState {
    pub fn get(&self, key: i64) -> Option<&Job> {
        self.jobs.get(&key)
    }

    pub fn create(&mut self, key: i64, record: JobRecord) {
        self.activatable.add((record.job_type.clone(), key));
        self.jobs.insert(
            key,
            Job {
                key,
                status: JobStatus::Activatable,
                record,
            },
        );
    }

    fn unindex(&mut self, job: &Job) {
        self.activatable.remove(&(job.record.job_type.clone(), job.key));
        if job.record.deadline != NO_KEY {
            self.deadlines.remove(&(job.record.deadline, job.key));
        }
    }

    pub fn remove(&mut self, key: i64) -> Option<Job> {
        let job = self.jobs.remove(&key)?;
        self.unindex(&job);
        Some(job)
    }

    /// Applies `update` and re-derives the indices from the result.
    fn update(&mut self, key: i64, update: impl FnOnce(&mut Job)) -> Option<&Job> {
        let mut job = self.jobs.get(&key)?.clone();
        self.unindex(&job);
        update(&mut job);
        match job.status {
            JobStatus::Activatable => self.activatable.add((job.record.job_type.clone(), key)),
            JobStatus::Activated => self.deadlines.add((job.record.deadline, key)),
            JobStatus::Failed => {}
        }
        self.jobs.insert(key, job);
        self.jobs.get(&key)
    }

    pub fn activate(&mut self, key: i64, worker: &str, deadline: i64) -> Option<&Job> {
        self.update(key, |job| {
            job.status = JobStatus::Activated;
            job.record.worker = worker.to_string();
            job.record.deadline = deadline;
        })
    }

    pub fn make_activatable(&mut self, key: i64) -> Option<&Job> {
        self.update(key, |job| {
            job.status = JobStatus::Activatable;
            job.record.worker.clear();
            job.record.deadline = NO_KEY;
        })
    }

    pub fn fail(&mut self, key: i64, retries: i32, error_message: &str) -> Option<&Job> {
        self.update(key, |job| {
            job.record.retries = retries;
            job.record.error_message = error_message.to_string();
            job.record.worker.clear();
            job.record.deadline = NO_KEY;
            job.status = if retries > 0 {
                JobStatus::Activatable
            } else {
                JobStatus::Failed
            };
        })
    }

    pub fn set_retries(&mut self, key: i64, retries: i32) -> Option<&Job> {
        self.update(key, |job| job.record.retries = retries)
    }

    /// Activatable jobs of `job_type`, oldest first.
    pub fn activatable(&self, job_type: &str, max: usize) -> Vec<i64> {
        self.activatable
            .range((job_type.to_string(), i64::MIN)..=(job_type.to_string(), i64::MAX))
            .take(max)
            .map(|((_, key), _)| *key)
            .collect()
    }

    /// Activated jobs whose deadline is at or before `now`.
    pub fn timed_out(&self, now: i64) -> Vec<i64> {
        self.deadlines
            .range((i64::MIN, i64::MIN)..=(now, i64::MAX))
            .map(|((_, key), _)| *key)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn commit(&mut self) {
        self.jobs.commit();
        self.activatable.commit();
        self.deadlines.commit();
    }

    pub fn rollback(&mut self) {
        self.jobs.rollback();
        self.activatable.rollback();
        self.deadlines.rollback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(job_type: &str) -> JobRecord {
        JobRecord {
            job_type: job_type.into(),
            retries: 3,
            ..JobRecord::default()
        }
    }

    #[test]
    fn test_activation_indices() {
        let mut jobs = JobState::default();
        jobs.create(1, job("pay"));
        jobs.create(2, job("pay"));
        jobs.create(3, job("ship"));
        assert_eq!(jobs.activatable("pay", 10), vec![1, 2]);

        jobs.activate(1, "w1", 500);
        assert_eq!(jobs.activatable("pay", 10), vec![2]);
        assert_eq!(jobs.timed_out(499), Vec::<i64>::new());
        assert_eq!(jobs.timed_out(500), vec![1]);

        jobs.make_activatable(1);
        assert!(jobs.timed_out(1000).is_empty());
        assert_eq!(jobs.activatable("pay", 1), vec![1]);
    }

    #[test]
    fn test_fail_without_retries() {
        let mut jobs = JobState::default();
        jobs.create(1, job("pay"));
        jobs.activate(1, "w", 10);
        let failed = jobs.fail(1, 0, "boom").unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(jobs.activatable("pay", 10).is_empty());
        assert!(jobs.timed_out(100).is_empty());

        jobs.set_retries(1, 2);
        jobs.make_activatable(1);
        assert_eq!(jobs.activatable("pay", 10), vec![1]);
    }
}
