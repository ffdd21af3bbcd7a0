use std::collections::VecDeque;

use crate::inflight::PublishReply;
use crate::packet::Packet;

/// A packet accepted while no connection was available.
///
/// Only QoS 0 publishes and non-publish packets land here; QoS >= 1
/// publishes go straight to the outgoing store instead.
pub(crate) struct OfflineEntry {
    pub packet: Packet,
    /// Completion fired once the packet is written (QoS 0 publishes).
    pub write_reply: Option<PublishReply>,
}

/// Packets waiting for the next successful CONNACK, drained in order before
/// the store replay begins.
#[derive(Default)]
pub(crate) struct OfflineQueue {
    inner: VecDeque<OfflineEntry>,
}

impl OfflineQueue {
    pub(crate) fn push(&mut self, entry: OfflineEntry) {
        self.inner.push_back(entry);
    }

    pub(crate) fn pop_front(&mut self) -> Option<OfflineEntry> {
        self.inner.pop_front()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmqtt_codec::v3;

    #[test]
    fn fifo_order() {
        let mut q = OfflineQueue::default();
        q.push(OfflineEntry { packet: Packet::V3(v3::Packet::PingRequest), write_reply: None });
        q.push(OfflineEntry { packet: Packet::V3(v3::Packet::Disconnect), write_reply: None });
        assert_eq!(q.len(), 2);
        assert!(matches!(q.pop_front().unwrap().packet, Packet::V3(v3::Packet::PingRequest)));
        assert!(matches!(q.pop_front().unwrap().packet, Packet::V3(v3::Packet::Disconnect)));
        assert!(q.is_empty());
    }
}
