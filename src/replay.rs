use std::num::NonZeroU16;

use crate::error::ClientError;
use crate::inflight::InflightEntry;
use crate::packet::Packet;
use crate::session::{Exit, SessionState};
use crate::store::{StoredMessage, StoreStream};
use crate::stream::MqttStream;
use crate::types::Event;

/// One pass over the outgoing store after CONNACK.
///
/// Stored messages go out strictly one at a time: the next store read is not
/// requested until the previous message's terminal ack arrived. While the
/// pass runs, the session holds `store_processing` and defers every new user
/// operation.
pub(crate) struct Replay {
    stream: Box<dyn StoreStream>,
    /// The id whose terminal ack drives the next store read.
    awaiting: Option<NonZeroU16>,
    /// Set once a completed pass re-opened the stream to look for messages
    /// persisted mid-replay; cleared whenever something new is sent.
    rescanned: bool,
}

impl Replay {
    fn new(stream: Box<dyn StoreStream>) -> Self {
        Self { stream, awaiting: None, rescanned: false }
    }
}

impl SessionState {
    pub(crate) async fn start_replay(&mut self, sink: &mut MqttStream) -> Result<(), Exit> {
        self.store_processing = true;
        self.replay = Some(Replay::new(self.outgoing.stream()));
        self.advance_replay(sink).await
    }

    /// Called for every terminal ack; lets the replay move on once the
    /// message it was waiting for completed.
    pub(crate) async fn replay_complete(
        &mut self,
        sink: &mut MqttStream,
        id: NonZeroU16,
    ) -> Result<(), Exit> {
        if let Some(acked) = self.replayed.get_mut(&id.get()) {
            *acked = true;
        }
        let advance = match self.replay.as_ref() {
            Some(replay) => replay.awaiting.is_none() || replay.awaiting == Some(id),
            None => false,
        };
        if advance {
            if let Some(replay) = self.replay.as_mut() {
                replay.awaiting = None;
            }
            self.advance_replay(sink).await?;
        }
        Ok(())
    }

    async fn advance_replay(&mut self, sink: &mut MqttStream) -> Result<(), Exit> {
        loop {
            let Some(replay) = self.replay.as_mut() else {
                return Ok(());
            };
            let next = match replay.stream.next().await {
                Ok(next) => next,
                Err(e) => {
                    log::error!("{} outgoing store replay failed: {:?}", self.client_id, e);
                    self.replay = None;
                    self.store_processing = false;
                    self.flush_pending(ClientError::ConnectionClosed);
                    self.emit(Event::Error(ClientError::store(e)));
                    return Ok(());
                }
            };

            match next {
                Some(msg) => {
                    let Some(id) = msg.packet_id() else {
                        continue;
                    };
                    if self.replay_skip.contains(&id.get())
                        || self.replayed.contains_key(&id.get())
                    {
                        continue;
                    }
                    self.replayed.insert(id.get(), false);
                    if !self.mid.register(id) {
                        // a newer operation owns this id now
                        log::debug!("{} skipping replay of in-use id {}", self.client_id, id);
                        self.replayed.insert(id.get(), true);
                        continue;
                    }
                    if !self.inflight.contains(id) {
                        self.inflight.insert(id, InflightEntry { volatile: false, reply: None });
                    }

                    let packet = match msg {
                        StoredMessage::Publish(mut publish) => {
                            publish.dup = true;
                            self.replay_publish_packet(publish)
                        }
                        StoredMessage::Release { packet_id } => self.pubrel_packet(packet_id),
                    };
                    if let Some(replay) = self.replay.as_mut() {
                        replay.awaiting = Some(id);
                        replay.rescanned = false;
                    }
                    log::debug!("{} replaying packet id {}", self.client_id, id);
                    self.send_packet(Some(&mut *sink), packet, None).await?;
                    return Ok(());
                }
                None => {
                    let all_acked = self.replayed.values().all(|acked| *acked);
                    let replay = match self.replay.as_mut() {
                        Some(replay) => replay,
                        None => return Ok(()),
                    };
                    if all_acked && replay.rescanned {
                        return self.finish_replay(sink).await;
                    }
                    replay.rescanned = true;
                    replay.stream.restart();
                    if !all_acked {
                        // outstanding acks re-enter through replay_complete
                        return Ok(());
                    }
                }
            }
        }
    }

    /// The store drained and every replayed message completed: release the
    /// interlock, run deferred operations, announce the connection.
    async fn finish_replay(&mut self, sink: &mut MqttStream) -> Result<(), Exit> {
        log::debug!("{} store replay complete ({} messages)", self.client_id, self.replayed.len());
        self.replay = None;
        self.store_processing = false;
        self.drive_pending(Some(&mut *sink)).await?;
        if let Some(connack) = self.connack.clone() {
            self.emit(Event::Connect(connack));
        }
        self.resubscribe(sink).await?;
        self.first_connection = false;
        Ok(())
    }

    #[inline]
    fn replay_publish_packet(&self, publish: rmqtt_codec::types::Publish) -> Packet {
        if self.opts.is_v5() {
            Packet::V5(rmqtt_codec::v5::Packet::Publish(Box::new(publish)))
        } else {
            Packet::V3(rmqtt_codec::v3::Packet::Publish(Box::new(publish)))
        }
    }
}
