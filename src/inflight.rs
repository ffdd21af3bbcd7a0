use std::num::NonZeroU16;

use rust_box::dequemap::DequeBTreeMap as DequeMap;
use tokio::sync::oneshot;

use crate::error::ClientError;
use crate::packet::Packet;
use crate::types::Granted;

pub(crate) type PublishReply = oneshot::Sender<Result<Option<Packet>, ClientError>>;
pub(crate) type SubscribeReply = oneshot::Sender<Result<Vec<Granted>, ClientError>>;

/// Completion channel of an operation awaiting its terminal ack.
pub(crate) enum Reply {
    Publish(PublishReply),
    Subscribe(SubscribeReply),
    Unsubscribe(PublishReply),
}

impl Reply {
    pub(crate) fn fail(self, err: ClientError) {
        match self {
            Reply::Publish(tx) | Reply::Unsubscribe(tx) => {
                let _ = tx.send(Err(err));
            }
            Reply::Subscribe(tx) => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

pub(crate) struct InflightEntry {
    /// Volatile entries (SUBSCRIBE/UNSUBSCRIBE acks) are cancelled when the
    /// transport closes; non-volatile ones (QoS >= 1 publishes) survive for
    /// replay.
    pub volatile: bool,
    pub reply: Option<Reply>,
}

/// Operations on the wire awaiting acknowledgment, in send order.
#[derive(Default)]
pub(crate) struct Inflight {
    entries: DequeMap<u16, InflightEntry>,
}

impl Inflight {
    pub(crate) fn insert(&mut self, id: NonZeroU16, entry: InflightEntry) -> Option<InflightEntry> {
        self.entries.insert(id.get(), entry)
    }

    pub(crate) fn remove(&mut self, id: NonZeroU16) -> Option<InflightEntry> {
        self.entries.remove(&id.get())
    }

    #[inline]
    pub(crate) fn contains(&self, id: NonZeroU16) -> bool {
        self.entries.contains_key(&id.get())
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cancel every entry, firing its completion with `err`.
    pub(crate) fn flush_all(&mut self, err: ClientError) {
        while let Some((_, entry)) = self.entries.pop_front() {
            if let Some(reply) = entry.reply {
                reply.fail(err.clone());
            }
        }
    }

    /// Cancel volatile entries only, leaving publishes for replay.
    pub(crate) fn flush_volatile(&mut self, err: ClientError) {
        let volatile: Vec<u16> =
            self.entries.iter().filter(|(_, e)| e.volatile).map(|(id, _)| *id).collect();
        for id in volatile {
            if let Some(entry) = self.entries.remove(&id) {
                if let Some(reply) = entry.reply {
                    reply.fail(err.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(v: u16) -> NonZeroU16 {
        NonZeroU16::new(v).unwrap()
    }

    fn entry(volatile: bool) -> (InflightEntry, oneshot::Receiver<Result<Option<Packet>, ClientError>>)
    {
        let (tx, rx) = oneshot::channel();
        (InflightEntry { volatile, reply: Some(Reply::Publish(tx)) }, rx)
    }

    #[tokio::test]
    async fn flush_volatile_keeps_publishes() {
        let mut inflight = Inflight::default();
        let (sub, mut sub_rx) = entry(true);
        let (publish, mut publish_rx) = entry(false);
        inflight.insert(id(1), sub);
        inflight.insert(id(2), publish);

        inflight.flush_volatile(ClientError::ConnectionClosed);

        assert!(matches!(sub_rx.try_recv(), Ok(Err(ClientError::ConnectionClosed))));
        assert!(publish_rx.try_recv().is_err());
        assert!(!inflight.contains(id(1)));
        assert!(inflight.contains(id(2)));
        assert_eq!(inflight.len(), 1);
    }

    #[tokio::test]
    async fn flush_all_fires_everything() {
        let mut inflight = Inflight::default();
        let (a, mut a_rx) = entry(true);
        let (b, mut b_rx) = entry(false);
        inflight.insert(id(1), a);
        inflight.insert(id(2), b);

        inflight.flush_all(ClientError::ConnectionClosed);

        assert!(inflight.is_empty());
        assert!(matches!(a_rx.try_recv(), Ok(Err(_))));
        assert!(matches!(b_rx.try_recv(), Ok(Err(_))));
    }
}
