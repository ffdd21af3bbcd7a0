use std::collections::{HashMap, VecDeque};
use std::num::NonZeroU16;

use bytestring::ByteString;

/// Outbound topic-alias registry (v5).
///
/// Maps topics to aliases in `1..=max` with least-recently-used replacement
/// once every slot is taken. Sized from the broker's `topic_alias_maximum`
/// CONNACK property, so it is rebuilt on every successful connect.
pub struct TopicAliasSend {
    max: u16,
    by_topic: HashMap<ByteString, NonZeroU16>,
    by_alias: Vec<Option<ByteString>>,
    // front = least recently used
    recency: VecDeque<NonZeroU16>,
}

impl TopicAliasSend {
    pub fn new(max: u16) -> Self {
        Self {
            max,
            by_topic: HashMap::new(),
            by_alias: vec![None; max as usize + 1],
            recency: VecDeque::new(),
        }
    }

    #[inline]
    pub fn max(&self) -> u16 {
        self.max
    }

    #[inline]
    fn touch(&mut self, alias: NonZeroU16) {
        if let Some(pos) = self.recency.iter().position(|a| *a == alias) {
            self.recency.remove(pos);
        }
        self.recency.push_back(alias);
    }

    /// Register `topic -> alias`, evicting whatever previously occupied the
    /// slot. Fails when `alias` is outside `1..=max`.
    pub fn put(&mut self, topic: ByteString, alias: NonZeroU16) -> bool {
        if alias.get() > self.max {
            return false;
        }
        if let Some(old) = self.by_alias[alias.get() as usize].take() {
            self.by_topic.remove(&old);
        }
        if let Some(old_alias) = self.by_topic.remove(&topic) {
            self.by_alias[old_alias.get() as usize] = None;
        }
        self.by_alias[alias.get() as usize] = Some(topic.clone());
        self.by_topic.insert(topic, alias);
        self.touch(alias);
        true
    }

    pub fn alias_by_topic(&mut self, topic: &str) -> Option<NonZeroU16> {
        let alias = *self.by_topic.get(topic)?;
        self.touch(alias);
        Some(alias)
    }

    pub fn topic_by_alias(&self, alias: NonZeroU16) -> Option<ByteString> {
        self.by_alias.get(alias.get() as usize)?.clone()
    }

    /// The alias slot to (re)use next: an unassigned slot while any remain,
    /// afterwards the least-recently-used one.
    pub fn lru_alias(&self) -> Option<NonZeroU16> {
        if self.max == 0 {
            return None;
        }
        if (self.by_topic.len() as u16) < self.max {
            for i in 1..=self.max {
                if self.by_alias[i as usize].is_none() {
                    return NonZeroU16::new(i);
                }
            }
        }
        self.recency.front().copied()
    }
}

/// Inbound topic-alias registry (v5), populated from PUBLISHes that carry
/// both a topic and an alias. Cleared when the transport closes.
pub struct TopicAliasRecv {
    max: u16,
    topics: Vec<Option<ByteString>>,
}

impl TopicAliasRecv {
    pub fn new(max: u16) -> Self {
        Self { max, topics: vec![None; max as usize + 1] }
    }

    #[inline]
    pub fn max(&self) -> u16 {
        self.max
    }

    pub fn put(&mut self, topic: ByteString, alias: NonZeroU16) -> bool {
        if alias.get() > self.max {
            return false;
        }
        self.topics[alias.get() as usize] = Some(topic);
        true
    }

    pub fn get(&self, alias: NonZeroU16) -> Option<ByteString> {
        if alias.get() > self.max {
            return None;
        }
        self.topics[alias.get() as usize].clone()
    }

    #[inline]
    pub fn in_range(&self, alias: NonZeroU16) -> bool {
        alias.get() <= self.max
    }

    pub fn clear(&mut self) {
        self.topics.iter_mut().for_each(|t| *t = None);
    }
}
