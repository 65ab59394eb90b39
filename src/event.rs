//! Event kinds and match history.
//!
//! Every payload entering the engine is wrapped into one of three tagged
//! kinds before it reaches the decider: plain observations (`simple`),
//! engine-derived occurrences (`complex`) and action outcomes (`action`).
//! The serde tag is the wire discriminator for run history records.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{CepError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    Simple(EventData),
    Complex(EventData),
    Action(EventData),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    pub event_id: String,
    pub timestamp: u64,
    #[serde(default)]
    pub payload: Value,
}

impl Event {
    pub fn simple(event_id: &str, timestamp: u64, payload: Value) -> Result<Self> {
        Ok(Event::Simple(EventData::new(event_id, timestamp, payload)?))
    }

    pub fn complex(event_id: &str, timestamp: u64, payload: Value) -> Result<Self> {
        Ok(Event::Complex(EventData::new(event_id, timestamp, payload)?))
    }

    pub fn action(event_id: &str, timestamp: u64, payload: Value) -> Result<Self> {
        Ok(Event::Action(EventData::new(event_id, timestamp, payload)?))
    }

    pub fn data(&self) -> &EventData {
        match self {
            Event::Simple(d) | Event::Complex(d) | Event::Action(d) => d,
        }
    }

    pub fn event_id(&self) -> &str {
        &self.data().event_id
    }

    pub fn timestamp(&self) -> u64 {
        self.data().timestamp
    }

    pub fn payload(&self) -> &Value {
        &self.data().payload
    }
}

impl EventData {
    fn new(event_id: &str, timestamp: u64, payload: Value) -> Result<Self> {
        if event_id.is_empty() {
            return Err(CepError::Configuration("empty event_id".to_string()));
        }
        if timestamp == 0 {
            return Err(CepError::Configuration(format!(
                "event {} has zero timestamp",
                event_id
            )));
        }
        Ok(Self {
            event_id: event_id.to_string(),
            timestamp,
            payload,
        })
    }
}

/// Accumulated match evidence of one run: group name to the ordered list
/// of events matched under that group. Read-only from the predicate side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct History {
    groups: BTreeMap<String, Vec<Event>>,
}

impl History {
    pub fn append(&mut self, group: &str, event: Event) {
        self.groups.entry(group.to_string()).or_default().push(event);
    }

    /// Events matched under `group`, insertion-ordered. Empty if the
    /// group has not matched yet.
    pub fn get(&self, group: &str) -> &[Event] {
        self.groups.get(group).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn groups(&self) -> impl Iterator<Item = (&str, &[Event])> {
        self.groups.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn event_count(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }
}
