// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use serde::{Deserialize, Serialize};

use super::journal::{TxMap, TxSet};
use crate::record::TimerRecord;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimerState {
    timers: TxMap<i64, TimerRecord>,
    due: TxSet<(i64, i64)>,
    by_element: TxSet<(i64, i64)>,
}

impl TimerState {
    pub fn create(&mut self, key: i64, timer: TimerRecord) {
        self.due.add((timer.due_date, key));
        self.by_element.add((timer.element_instance_key, key));
        self.timers.insert(key, timer);
    }

    pub fn get(&self, key: i64) -> Option<&TimerRecord> {
        self.timers.get(&key)
    }

    pub fn remove(&mut self, key: i64) -> Option<TimerRecord> {
        let timer = self.timers.remove(&key)?;
        self.due.remove(&(timer.due_date, key));
        self.by_element.remove(&(timer.element_instance_key, key));
        Some(timer)
    }

    /// Timers owned by an element instance; `-1` lists timer start events.
    pub fn of_element(&self, element_instance_key: i64) -> Vec<i64> {
        self.by_element
            .range((element_instance_key, i64::MIN)..=(element_instance_key, i64::MAX))
            .map(|((_, key), _)| *key)
            .collect()
    }

    /// Keys of timers due at or before `now`, earliest first.
    pub fn due(&self, now: i64) -> Vec<i64> {
        self.due
            .range((i64::MIN, i64::MIN)..=(now, i64::MAX))
            .map(|((_, key), _)| *key)
            .collect()
    }

    pub fn next_due_date(&self) -> Option<i64> {
        self.due.keys().next().map(|(due, _)| *due)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&i64, &TimerRecord)> {
        self.timers.iter()
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn commit(&mut self) {
        self.timers.commit();
        self.due.commit();
        self.by_element.commit();
    }

    pub fn rollback(&mut self) {
        self.timers.rollback();
        self.due.rollback();
        self.by_element.rollback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timer(element_instance_key: i64, due_date: i64) -> TimerRecord {
        TimerRecord {
            element_instance_key,
            process_instance_key: 1,
            process_definition_key: 1,
            target_element_id: "t".into(),
            due_date,
        }
    }

    #[test]
    fn test_due_order() {
        let mut timers = TimerState::default();
        timers.create(1, timer(10, 300));
        timers.create(2, timer(10, 100));
        timers.create(3, timer(11, 200));

        assert_eq!(timers.next_due_date(), Some(100));
        assert_eq!(timers.due(250), vec![2, 3]);
        assert_eq!(timers.of_element(10), vec![1, 2]);

        timers.remove(2);
        assert_eq!(timers.due(250), vec![3]);
        assert_eq!(timers.of_element(10), vec![1]);
    }
}
