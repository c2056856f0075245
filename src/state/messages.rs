// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Message subscriptions and buffered messages.
//!
//! A published message with a time-to-live stays buffered until its
//! deadline and is correlated to subscriptions opened in the meantime, at
//! most once per process instance. Start subscriptions belong to the latest
//! version of a process with message start events; they outlive any single
//! instance.

use serde::{Deserialize, Serialize};

use super::journal::{TxMap, TxSet};
use crate::record::{MessageRecord, MessageSubscriptionRecord};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageState {
    subscriptions: TxMap<i64, MessageSubscriptionRecord>,
    by_correlation: TxSet<(String, String, i64)>,
    by_element: TxSet<(i64, i64)>,
    messages: TxMap<i64, MessageRecord>,
    message_index: TxSet<(String, String, i64)>,
    deadlines: TxSet<(i64, i64)>,
    correlated: TxSet<(i64, i64)>,
    start_subscriptions: TxMap<i64, MessageSubscriptionRecord>,
    /// (message name, subscription key)
    start_by_name: TxSet<(String, i64)>,
    /// (bpmn process id, subscription key)
    start_by_process: TxSet<(String, i64)>,
}

impl MessageState {
    pub fn open_subscription(&mut self, key: i64, subscription: MessageSubscriptionRecord) {
        self.by_correlation.add((
            subscription.message_name.clone(),
            subscription.correlation_key.clone(),
            key,
        ));
        self.by_element
            .add((subscription.element_instance_key, key));
        self.subscriptions.insert(key, subscription);
    }

    pub fn subscription(&self, key: i64) -> Option<&MessageSubscriptionRecord> {
        self.subscriptions.get(&key)
    }

    pub fn close_subscription(&mut self, key: i64) -> Option<MessageSubscriptionRecord> {
        let subscription = self.subscriptions.remove(&key)?;
        self.by_correlation.remove(&(
            subscription.message_name.clone(),
            subscription.correlation_key.clone(),
            key,
        ));
        self.by_element
            .remove(&(subscription.element_instance_key, key));
        Some(subscription)
    }

    pub fn subscriptions_for(&self, name: &str, correlation_key: &str) -> Vec<i64> {
        let (name, correlation_key) = (name.to_string(), correlation_key.to_string());
        self.by_correlation
            .range((name.clone(), correlation_key.clone(), i64::MIN)..=(name, correlation_key, i64::MAX))
            .map(|((_, _, key), _)| *key)
            .collect()
    }

    pub fn subscriptions_of_element(&self, element_instance_key: i64) -> Vec<i64> {
        self.by_element
            .range((element_instance_key, i64::MIN)..=(element_instance_key, i64::MAX))
            .map(|((_, key), _)| *key)
            .collect()
    }

    pub fn open_start_subscription(&mut self, key: i64, subscription: MessageSubscriptionRecord) {
        self.start_by_name
            .add((subscription.message_name.clone(), key));
        self.start_by_process
            .add((subscription.bpmn_process_id.clone(), key));
        self.start_subscriptions.insert(key, subscription);
    }

    /// Closes the start subscriptions of a process id and returns them.
    pub fn close_start_subscriptions(&mut self, bpmn_process_id: &str) -> Vec<(i64, MessageSubscriptionRecord)> {
        let id = bpmn_process_id.to_string();
        let keys: Vec<i64> = self
            .start_by_process
            .range((id.clone(), i64::MIN)..=(id, i64::MAX))
            .map(|((_, key), _)| *key)
            .collect();
        let mut closed = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(subscription) = self.start_subscriptions.remove(&key) else {
                continue;
            };
            self.start_by_name
                .remove(&(subscription.message_name.clone(), key));
            self.start_by_process
                .remove(&(subscription.bpmn_process_id.clone(), key));
            closed.push((key, subscription));
        }
        closed
    }

    /// Start subscriptions for a message name, oldest first.
    pub fn start_subscriptions_for(&self, name: &str) -> Vec<(i64, MessageSubscriptionRecord)> {
        let name = name.to_string();
        self.start_by_name
            .range((name.clone(), i64::MIN)..=(name, i64::MAX))
            .filter_map(|((_, key), _)| self.start_subscriptions.get(key).map(|s| (*key, s.clone())))
            .collect()
    }

    pub fn buffer(&mut self, key: i64, message: MessageRecord) {
        self.message_index
            .add((message.name.clone(), message.correlation_key.clone(), key));
        self.deadlines.add((message.deadline, key));
        self.messages.insert(key, message);
    }

    pub fn message(&self, key: i64) -> Option<&MessageRecord> {
        self.messages.get(&key)
    }

    pub fn remove_message(&mut self, key: i64) -> Option<MessageRecord> {
        let message = self.messages.remove(&key)?;
        self.message_index
            .remove(&(message.name.clone(), message.correlation_key.clone(), key));
        self.deadlines.remove(&(message.deadline, key));
        self.forget_correlations(key);
        Some(message)
    }

    /// Drops the at-most-once bookkeeping of a message.
    pub fn forget_correlations(&mut self, message_key: i64) {
        let correlated: Vec<(i64, i64)> = self
            .correlated
            .range((message_key, i64::MIN)..=(message_key, i64::MAX))
            .map(|(k, _)| *k)
            .collect();
        for entry in correlated {
            self.correlated.remove(&entry);
        }
    }

    /// Buffered messages still alive at `now`, oldest first.
    pub fn buffered(&self, name: &str, correlation_key: &str, now: i64) -> Vec<i64> {
        let (name, correlation_key) = (name.to_string(), correlation_key.to_string());
        self.message_index
            .range((name.clone(), correlation_key.clone(), i64::MIN)..=(name, correlation_key, i64::MAX))
            .map(|((_, _, key), _)| *key)
            .filter(|key| self.messages.get(key).is_some_and(|m| m.deadline > now))
            .collect()
    }

    pub fn has_message_id(&self, name: &str, correlation_key: &str, message_id: &str, now: i64) -> bool {
        !message_id.is_empty()
            && self
                .buffered(name, correlation_key, now)
                .iter()
                .filter_map(|key| self.messages.get(key))
                .any(|m| m.message_id == message_id)
    }

    /// Messages whose deadline is at or before `now`.
    pub fn expired(&self, now: i64) -> Vec<i64> {
        self.deadlines
            .range((i64::MIN, i64::MIN)..=(now, i64::MAX))
            .map(|((_, key), _)| *key)
            .collect()
    }

    pub fn mark_correlated(&mut self, message_key: i64, process_instance_key: i64) {
        self.correlated.add((message_key, process_instance_key));
    }

    pub fn is_correlated(&self, message_key: i64, process_instance_key: i64) -> bool {
        self.correlated.contains_key(&(message_key, process_instance_key))
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len() + self.start_subscriptions.len()
    }

    pub fn buffered_count(&self) -> usize {
        self.messages.len()
    }

    pub fn commit(&mut self) {
        self.subscriptions.commit();
        self.by_correlation.commit();
        self.by_element.commit();
        self.messages.commit();
        self.message_index.commit();
        self.deadlines.commit();
        self.correlated.commit();
        self.start_subscriptions.commit();
        self.start_by_name.commit();
        self.start_by_process.commit();
    }

    pub fn rollback(&mut self) {
        self.subscriptions.rollback();
        self.by_correlation.rollback();
        self.by_element.rollback();
        self.messages.rollback();
        self.message_index.rollback();
        self.deadlines.rollback();
        self.correlated.rollback();
        self.start_subscriptions.rollback();
        self.start_by_name.rollback();
        self.start_by_process.rollback();
    }
}
