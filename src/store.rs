use std::num::NonZeroU16;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use rmqtt_codec::types::Publish;
use rust_box::dequemap::DequeBTreeMap as DequeMap;
use tokio::sync::RwLock;

use crate::Result;

/// A message persisted while its delivery is unacknowledged.
///
/// The engine only ever persists two shapes: an outbound or inbound PUBLISH,
/// and the PUBREL that replaces a QoS 2 PUBLISH once PUBREC arrives.
#[derive(Debug, Clone)]
pub enum StoredMessage {
    Publish(Publish),
    Release { packet_id: NonZeroU16 },
}

impl StoredMessage {
    #[inline]
    pub fn packet_id(&self) -> Option<NonZeroU16> {
        match self {
            StoredMessage::Publish(p) => p.packet_id,
            StoredMessage::Release { packet_id } => Some(*packet_id),
        }
    }
}

/// Durable mapping `packet id -> message` backing at-least-once and
/// exactly-once delivery across reconnects.
#[async_trait]
pub trait Store: Sync + Send {
    /// Insert, replacing any prior entry with the same packet id.
    async fn put(&self, msg: StoredMessage) -> Result<()>;

    async fn get(&self, packet_id: NonZeroU16) -> Result<Option<StoredMessage>>;

    async fn del(&self, packet_id: NonZeroU16) -> Result<Option<StoredMessage>>;

    /// A restartable sequence over the stored messages in put-order.
    fn stream(&self) -> Box<dyn StoreStream>;

    async fn close(&self) -> Result<()>;
}

/// Cursor over a [`Store`]'s contents in put-order.
///
/// A completed pass yields each live message at most once. [`restart`] begins
/// a fresh pass that also observes messages added after the cursor was
/// created; dropping the cursor abandons it.
///
/// [`restart`]: StoreStream::restart
#[async_trait]
pub trait StoreStream: Send {
    async fn next(&mut self) -> Result<Option<StoredMessage>>;

    fn restart(&mut self);
}

#[async_trait]
impl<S: Store + ?Sized> Store for Arc<S> {
    async fn put(&self, msg: StoredMessage) -> Result<()> {
        (**self).put(msg).await
    }

    async fn get(&self, packet_id: NonZeroU16) -> Result<Option<StoredMessage>> {
        (**self).get(packet_id).await
    }

    async fn del(&self, packet_id: NonZeroU16) -> Result<Option<StoredMessage>> {
        (**self).del(packet_id).await
    }

    fn stream(&self) -> Box<dyn StoreStream> {
        (**self).stream()
    }

    async fn close(&self) -> Result<()> {
        (**self).close().await
    }
}

type Entries = Arc<RwLock<DequeMap<u16, StoredMessage>>>;

/// Process-local [`Store`] backend.
pub struct MemoryStore {
    entries: Entries,
    closed: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self { entries: Arc::new(RwLock::new(DequeMap::default())), closed: AtomicBool::new(false) }
    }

    #[inline]
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            Err(anyhow!("store is closed"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put(&self, msg: StoredMessage) -> Result<()> {
        self.ensure_open()?;
        let id = msg.packet_id().ok_or_else(|| anyhow!("message without packet id"))?;
        self.entries.write().await.insert(id.get(), msg);
        Ok(())
    }

    async fn get(&self, packet_id: NonZeroU16) -> Result<Option<StoredMessage>> {
        self.ensure_open()?;
        Ok(self.entries.read().await.get(&packet_id.get()).cloned())
    }

    async fn del(&self, packet_id: NonZeroU16) -> Result<Option<StoredMessage>> {
        self.ensure_open()?;
        Ok(self.entries.write().await.remove(&packet_id.get()))
    }

    fn stream(&self) -> Box<dyn StoreStream> {
        Box::new(MemoryStoreStream { entries: self.entries.clone(), snapshot: None, pos: 0 })
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        *self.entries.write().await = DequeMap::default();
        Ok(())
    }
}

struct MemoryStoreStream {
    entries: Entries,
    snapshot: Option<Vec<StoredMessage>>,
    pos: usize,
}

#[async_trait]
impl StoreStream for MemoryStoreStream {
    async fn next(&mut self) -> Result<Option<StoredMessage>> {
        if self.snapshot.is_none() {
            self.snapshot =
                Some(self.entries.read().await.iter().map(|(_, m)| m.clone()).collect());
        }
        let snapshot = self.snapshot.as_ref().expect("snapshot");
        let msg = snapshot.get(self.pos).cloned();
        if msg.is_some() {
            self.pos += 1;
        }
        Ok(msg)
    }

    fn restart(&mut self) {
        self.snapshot = None;
        self.pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use bytestring::ByteString;
    use rmqtt_codec::types::QoS;

    fn publish(id: u16) -> StoredMessage {
        StoredMessage::Publish(Publish {
            dup: false,
            retain: false,
            qos: QoS::AtLeastOnce,
            topic: ByteString::from_static("t"),
            packet_id: NonZeroU16::new(id),
            payload: Bytes::from_static(b"m"),
            properties: None,
            delay_interval: None,
            create_time: None,
        })
    }

    fn id(v: u16) -> NonZeroU16 {
        NonZeroU16::new(v).unwrap()
    }

    #[tokio::test]
    async fn put_get_del() {
        let store = MemoryStore::new();
        store.put(publish(1)).await.unwrap();
        assert!(store.get(id(1)).await.unwrap().is_some());
        assert!(store.del(id(1)).await.unwrap().is_some());
        assert!(store.get(id(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_overwrites_same_id_in_place() {
        let store = MemoryStore::new();
        store.put(publish(1)).await.unwrap();
        store.put(publish(2)).await.unwrap();
        store.put(StoredMessage::Release { packet_id: id(1) }).await.unwrap();

        let mut s = store.stream();
        // the replaced entry keeps its original position
        assert!(matches!(s.next().await.unwrap(), Some(StoredMessage::Release { .. })));
        assert!(matches!(s.next().await.unwrap(), Some(StoredMessage::Publish(_))));
        assert!(s.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stream_restart_observes_new_entries() {
        let store = MemoryStore::new();
        store.put(publish(1)).await.unwrap();

        let mut s = store.stream();
        assert!(s.next().await.unwrap().is_some());
        assert!(s.next().await.unwrap().is_none());

        store.put(publish(2)).await.unwrap();
        s.restart();
        let first = s.next().await.unwrap().unwrap();
        let second = s.next().await.unwrap().unwrap();
        assert_eq!(first.packet_id(), Some(id(1)));
        assert_eq!(second.packet_id(), Some(id(2)));
        assert!(s.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn closed_store_rejects_operations() {
        let store = MemoryStore::new();
        store.close().await.unwrap();
        assert!(store.put(publish(1)).await.is_err());
        assert!(store.get(id(1)).await.is_err());
    }
}
