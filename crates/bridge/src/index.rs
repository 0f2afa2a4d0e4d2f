//! Topic to entity index

use std::collections::{BTreeSet, HashMap};

/// Entities subscribed on each exact topic of one connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicIndex {
    topics: HashMap<String, BTreeSet<String>>,
}

impl TopicIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entity under a topic
    pub fn insert(&mut self, topic: impl Into<String>, entity_id: impl Into<String>) {
        self.topics.entry(topic.into()).or_default().insert(entity_id.into());
    }

    /// Entities subscribed on `topic`
    pub fn entities(&self, topic: &str) -> Option<&BTreeSet<String>> {
        self.topics.get(topic)
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.topics.keys().map(String::as_str)
    }

    pub fn contains_topic(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    /// Whether any topic routes to `entity_id`
    pub fn contains_entity(&self, entity_id: &str) -> bool {
        self.topics.values().any(|ids| ids.contains(entity_id))
    }

    /// Number of topics
    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}
