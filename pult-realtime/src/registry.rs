//! Topic → channel map. At most one channel exists per topic.

use std::collections::HashMap;

use crate::channel::Channel;

#[derive(Default)]
pub(crate) struct Registry {
    channels: HashMap<String, Channel>,
}

impl Registry {
    pub(crate) fn get(&self, topic: &str) -> Option<Channel> {
        self.channels.get(topic).cloned()
    }

    /// Return the channel for `topic`, creating it with `create` if absent.
    /// The flag is `true` when a new channel was created.
    pub(crate) fn get_or_insert_with(
        &mut self,
        topic: &str,
        create: impl FnOnce() -> Channel,
    ) -> (Channel, bool) {
        if let Some(existing) = self.channels.get(topic) {
            return (existing.clone(), false);
        }
        let channel = create();
        self.channels.insert(topic.to_string(), channel.clone());
        (channel, true)
    }

    pub(crate) fn remove(&mut self, topic: &str) -> Option<Channel> {
        self.channels.remove(topic)
    }

    /// Remove `channel` only if it is still the registered instance for its topic.
    pub(crate) fn remove_instance(&mut self, channel: &Channel) -> bool {
        if self.channels.get(channel.topic()) == Some(channel) {
            self.channels.remove(channel.topic());
            true
        } else {
            false
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub(crate) fn channels(&self) -> Vec<Channel> {
        self.channels.values().cloned().collect()
    }

    pub(crate) fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.channels.keys().cloned().collect();
        topics.sort();
        topics
    }
}
