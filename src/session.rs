use std::collections::{HashMap, HashSet, VecDeque};
use std::num::{NonZeroU16, NonZeroU32};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use bytestring::ByteString;
use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender};
use futures::StreamExt;
use rmqtt_codec::types::{Publish, QoS};
use rmqtt_codec::v5::{
    Auth, AuthReasonCode, Disconnect, DisconnectReasonCode, PublishAck, PublishAck2,
    PublishAckReason, SubscribeAckReason, UserProperties,
};
use rmqtt_codec::{v3, v5};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::alias::{TopicAliasRecv, TopicAliasSend};
use crate::error::ClientError;
use crate::hook::{AckPolicy, AuthHandler, MessageHandler};
use crate::inflight::{Inflight, InflightEntry, PublishReply, Reply, SubscribeReply};
use crate::options::{generate_client_id, ConnectOptions};
use crate::packet::Packet;
use crate::packet_id::{DefaultPacketIdProvider, PacketIdProvider};
use crate::queue::{OfflineEntry, OfflineQueue};
use crate::replay::Replay;
use crate::store::{MemoryStore, Store, StoredMessage};
use crate::stream::MqttStream;
use crate::transport::Transport;
use crate::types::{
    Event, Granted, Message, PublishOptions, SubscribeOptions, Subscription, UnsubscribeOptions,
};

const END_GRACE: Duration = Duration::from_millis(10);

pub(crate) type EndReply = oneshot::Sender<Result<(), ClientError>>;

pub(crate) enum Command {
    Publish {
        topic: ByteString,
        payload: Bytes,
        opts: PublishOptions,
        reply: PublishReply,
    },
    Subscribe {
        subs: Vec<Subscription>,
        opts: SubscribeOptions,
        reply: SubscribeReply,
    },
    Unsubscribe {
        topics: Vec<ByteString>,
        opts: UnsubscribeOptions,
        reply: PublishReply,
    },
    Reconnect,
    End {
        force: bool,
        reply: EndReply,
    },
    RemoveOutgoing {
        packet_id: NonZeroU16,
    },
    LastId {
        reply: oneshot::Sender<Option<NonZeroU16>>,
    },
}

/// A user operation deferred behind the store replay or packet-id pressure.
pub(crate) enum Operation {
    Publish {
        publish: Publish,
        reply: Option<PublishReply>,
    },
    Subscribe {
        subs: Vec<Subscription>,
        opts: SubscribeOptions,
        reply: Option<SubscribeReply>,
    },
    Unsubscribe {
        topics: Vec<ByteString>,
        opts: UnsubscribeOptions,
        reply: Option<PublishReply>,
    },
}

impl Operation {
    fn fail(self, err: ClientError) {
        match self {
            Operation::Publish { reply: Some(tx), .. } => {
                let _ = tx.send(Err(err));
            }
            Operation::Subscribe { reply: Some(tx), .. } => {
                let _ = tx.send(Err(err));
            }
            Operation::Unsubscribe { reply: Some(tx), .. } => {
                let _ = tx.send(Err(err));
            }
            _ => {}
        }
    }
}

pub(crate) enum Admitted {
    Yes,
    Requeue(Operation),
}

/// Why the connected event loop stopped.
pub(crate) enum Exit {
    /// Transport failed; the reconnect machinery decides what happens next.
    Closed,
    /// Session shutdown was requested.
    Ended,
}

enum Cycle {
    Lost,
    Ended,
}

enum OfflineNext {
    Retry,
    Ended,
}

struct ResubEntry {
    opts: v5::SubscriptionOptions,
    id: Option<NonZeroU32>,
    user_properties: UserProperties,
}

pub(crate) struct SessionState {
    pub(crate) opts: ConnectOptions,
    pub(crate) client_id: ByteString,
    transport: Box<dyn Transport>,
    events: UnboundedSender<Event>,
    cmd_rx: UnboundedReceiver<Command>,

    pub(crate) mid: Box<dyn PacketIdProvider>,
    pub(crate) inflight: Inflight,
    offline: OfflineQueue,
    pub(crate) pending: VecDeque<Operation>,
    pub(crate) outgoing: Box<dyn Store>,
    incoming: Box<dyn Store>,

    /// Replay interlock: while set, user operations queue in `pending`.
    pub(crate) store_processing: bool,
    pub(crate) replay: Option<Replay>,
    /// Ids the replay sent this session, and whether their terminal ack
    /// arrived.
    pub(crate) replayed: HashMap<u16, bool>,
    /// Ids the replay must not send again (drained from the offline queue).
    pub(crate) replay_skip: HashSet<u16>,

    resubs: HashMap<ByteString, ResubEntry>,
    sub_topics: HashMap<u16, Vec<ByteString>>,

    alias_send: Option<TopicAliasSend>,
    alias_recv: Option<TopicAliasRecv>,

    message_handler: Option<Arc<dyn MessageHandler>>,
    auth_handler: Option<Arc<dyn AuthHandler>>,
    ack_policy: Option<Arc<dyn AckPolicy>>,

    pub(crate) connected: bool,
    disconnecting: bool,
    reconnecting: bool,
    pub(crate) first_connection: bool,
    force_reconnect: bool,
    reconnect_on_end: bool,
    end_force: bool,
    end_replies: Vec<EndReply>,

    pub(crate) session_present: bool,
    pub(crate) connack: Option<Packet>,
    keep_alive: u16,
    ping_resp: bool,
    next_ping_at: Instant,
}

impl SessionState {
    pub(crate) fn new(
        transport: Box<dyn Transport>,
        mut opts: ConnectOptions,
        cmd_rx: UnboundedReceiver<Command>,
        events: UnboundedSender<Event>,
    ) -> Self {
        let client_id = opts.client_id.clone().unwrap_or_else(generate_client_id);
        let mid = opts
            .packet_id_provider
            .take()
            .unwrap_or_else(|| Box::new(DefaultPacketIdProvider::new()));
        let outgoing = opts.outgoing_store.take().unwrap_or_else(|| Box::new(MemoryStore::new()));
        let incoming = opts.incoming_store.take().unwrap_or_else(|| Box::new(MemoryStore::new()));
        let message_handler = opts.message_handler.take();
        let auth_handler = opts.auth_handler.take();
        let ack_policy = opts.ack_policy.take();
        let alias_recv =
            (opts.topic_alias_maximum > 0).then(|| TopicAliasRecv::new(opts.topic_alias_maximum));
        let keep_alive = opts.keepalive;
        Self {
            opts,
            client_id,
            transport,
            events,
            cmd_rx,
            mid,
            inflight: Inflight::default(),
            offline: OfflineQueue::default(),
            pending: VecDeque::new(),
            outgoing,
            incoming,
            store_processing: false,
            replay: None,
            replayed: HashMap::new(),
            replay_skip: HashSet::new(),
            resubs: HashMap::new(),
            sub_topics: HashMap::new(),
            alias_send: None,
            alias_recv,
            message_handler,
            auth_handler,
            ack_policy,
            connected: false,
            disconnecting: false,
            reconnecting: false,
            first_connection: true,
            force_reconnect: false,
            reconnect_on_end: false,
            end_force: false,
            end_replies: Vec::new(),
            session_present: false,
            connack: None,
            keep_alive,
            ping_resp: true,
            next_ping_at: Instant::now(),
        }
    }

    #[inline]
    pub(crate) fn emit(&self, ev: Event) {
        let _ = self.events.unbounded_send(ev);
    }

    #[inline]
    fn is_v5(&self) -> bool {
        self.opts.is_v5()
    }

    pub(crate) async fn run(mut self) {
        loop {
            match self.connection_cycle().await {
                Cycle::Ended => {
                    self.on_close();
                    if self.reconnect_on_end {
                        log::debug!("{} reconnecting after end", self.client_id);
                        self.emit(Event::End);
                        for tx in self.end_replies.drain(..) {
                            let _ = tx.send(Ok(()));
                        }
                        self.disconnecting = false;
                        self.end_force = false;
                        self.reconnect_on_end = false;
                        continue;
                    }
                    break;
                }
                Cycle::Lost => {
                    self.on_close();
                    if self.disconnecting {
                        break;
                    }
                    match self.offline_phase().await {
                        OfflineNext::Retry => continue,
                        OfflineNext::Ended => break,
                    }
                }
            }
        }

        // answer whatever is still queued behind the shutdown
        while let Ok(Some(cmd)) = self.cmd_rx.try_next() {
            match cmd {
                Command::End { reply, .. } => {
                    let _ = reply.send(Ok(()));
                }
                Command::Publish { reply, .. } => {
                    let _ = reply.send(Err(ClientError::Disconnecting));
                }
                Command::Subscribe { reply, .. } => {
                    let _ = reply.send(Err(ClientError::Disconnecting));
                }
                Command::Unsubscribe { reply, .. } => {
                    let _ = reply.send(Err(ClientError::Disconnecting));
                }
                Command::LastId { reply } => {
                    let _ = reply.send(self.mid.last_allocated());
                }
                Command::Reconnect | Command::RemoveOutgoing { .. } => {}
            }
        }

        if self.end_force && self.opts.reconnect_period.is_zero() && self.opts.clean {
            self.inflight.flush_all(ClientError::ConnectionClosed);
        }
        self.mid.clear();
        if let Err(e) = self.outgoing.close().await {
            log::warn!("{} closing outgoing store failed: {:?}", self.client_id, e);
        }
        if let Err(e) = self.incoming.close().await {
            log::warn!("{} closing incoming store failed: {:?}", self.client_id, e);
        }
        self.emit(Event::End);
        for tx in self.end_replies.drain(..) {
            let _ = tx.send(Ok(()));
        }
    }

    async fn connection_cycle(&mut self) -> Cycle {
        let attempt =
            tokio::time::timeout(self.opts.connect_timeout, self.open_stream()).await;
        let (mut sink, connack) = match attempt {
            Err(_) => {
                log::warn!("{} no CONNACK within connect timeout", self.client_id);
                self.emit(Event::Error(ClientError::ConnectTimeout));
                return Cycle::Lost;
            }
            Ok(Err(e)) => {
                match e.downcast_ref::<std::io::Error>() {
                    Some(ioe) if reportable(ioe) => {
                        self.emit(Event::Error(ClientError::transport(ioe)))
                    }
                    _ => log::warn!("{} connect failed: {:?}", self.client_id, e),
                }
                return Cycle::Lost;
            }
            Ok(Ok(v)) => v,
        };

        if let Err(code) = self.process_connack(&mut sink, &connack) {
            self.emit(Event::Error(ClientError::Reason { code }));
            return Cycle::Lost;
        }

        if self.drain_offline(&mut sink).await.is_err() {
            return Cycle::Lost;
        }
        match self.start_replay(&mut sink).await {
            Err(Exit::Closed) => return Cycle::Lost,
            Err(Exit::Ended) => {
                self.end_cleanup(&mut sink).await;
                return Cycle::Ended;
            }
            Ok(()) => {}
        }

        match self.run_loop(&mut sink).await {
            Exit::Ended => {
                self.end_cleanup(&mut sink).await;
                Cycle::Ended
            }
            Exit::Closed => Cycle::Lost,
        }
    }

    /// Opens the transport and performs the CONNECT/CONNACK (and v5 enhanced
    /// auth) exchange. Runs under `connect_timeout`.
    async fn open_stream(&mut self) -> crate::Result<(MqttStream, Packet)> {
        let io = self.transport.connect().await?;
        let max_in = self.opts.properties.maximum_packet_size.map(|n| n.get()).unwrap_or(0);
        let mut sink = if self.is_v5() {
            MqttStream::v5(io, max_in, 0)
        } else {
            MqttStream::v3(io, max_in)
        };

        let connect = self.opts.build_connect(&self.client_id);
        self.emit(Event::PacketSend(connect.clone()));
        sink.send(connect).await?;

        loop {
            match sink.next().await {
                Some(Ok(
                    p @ (Packet::V3(v3::Packet::ConnectAck(_))
                    | Packet::V5(v5::Packet::ConnectAck(_))),
                )) => {
                    self.emit(Event::PacketReceive(p.clone()));
                    return Ok((sink, p));
                }
                Some(Ok(Packet::V5(v5::Packet::Auth(auth)))) => {
                    self.emit(Event::PacketReceive(Packet::V5(v5::Packet::Auth(auth.clone()))));
                    if let Some(out) = self.auth_response(&auth).await {
                        let packet = Packet::V5(v5::Packet::Auth(out));
                        self.emit(Event::PacketSend(packet.clone()));
                        sink.send(packet).await?;
                    }
                }
                Some(Ok(p)) => {
                    return Err(anyhow::anyhow!("unexpected packet before CONNACK: {:?}", p))
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Err(anyhow::anyhow!("connection closed before CONNACK")),
            }
        }
    }

    /// Applies a successful CONNACK to the session, or returns the refusal
    /// reason code.
    fn process_connack(&mut self, sink: &mut MqttStream, connack: &Packet) -> Result<(), u8> {
        self.keep_alive = self.opts.keepalive;
        match connack {
            Packet::V3(v3::Packet::ConnectAck(ack)) => {
                let code = u8::from(ack.return_code);
                if code != 0 {
                    return Err(code);
                }
                self.session_present = ack.session_present;
            }
            Packet::V5(v5::Packet::ConnectAck(ack)) => {
                let code = u8::from(ack.reason_code);
                if code != 0 {
                    return Err(code);
                }
                self.session_present = ack.session_present;
                if let Some(ka) = ack.server_keepalive_sec {
                    self.keep_alive = ka;
                }
                self.alias_send =
                    (ack.topic_alias_max > 0).then(|| TopicAliasSend::new(ack.topic_alias_max));
                if let Some(size) = ack.max_packet_size {
                    sink.set_max_outbound_size(size);
                }
                if let Some(cid) = &ack.assigned_client_id {
                    self.client_id = cid.clone();
                }
            }
            _ => return Err(128),
        }

        log::debug!(
            "{} connected, session_present: {}, keep_alive: {}s",
            self.client_id,
            self.session_present,
            self.keep_alive
        );
        self.connected = true;
        self.reconnecting = false;
        self.ping_resp = true;
        self.next_ping_at = Instant::now() + self.keepalive_interval();
        self.mid.clear();
        self.replayed.clear();
        self.replay_skip.clear();
        self.connack = Some(connack.clone());
        Ok(())
    }

    #[inline]
    fn keepalive_interval(&self) -> Duration {
        if self.keep_alive == 0 {
            Duration::from_secs(u32::MAX as u64)
        } else {
            Duration::from_secs(self.keep_alive as u64)
        }
    }

    /// Flushes the offline queue, reserving its packet ids so the replay
    /// does not send them twice.
    async fn drain_offline(&mut self, sink: &mut MqttStream) -> Result<(), Exit> {
        while let Some(entry) = self.offline.pop_front() {
            if let Some(id) = entry.packet.packet_id() {
                self.mid.register(id);
                self.replay_skip.insert(id.get());
            }
            self.send_packet(Some(&mut *sink), entry.packet, entry.write_reply).await?;
        }
        Ok(())
    }

    async fn run_loop(&mut self, sink: &mut MqttStream) -> Exit {
        let keepalive_enabled = self.keep_alive > 0;
        let keepalive_delay = tokio::time::sleep_until(self.next_ping_at);
        tokio::pin!(keepalive_delay);

        loop {
            keepalive_delay.as_mut().reset(self.next_ping_at);

            tokio::select! {
                _ = &mut keepalive_delay, if keepalive_enabled => {
                    if self.ping_resp {
                        self.ping_resp = false;
                        let ping = if self.is_v5() {
                            Packet::V5(v5::Packet::PingRequest)
                        } else {
                            Packet::V3(v3::Packet::PingRequest)
                        };
                        if let Err(e) = self.wire_send(sink, ping).await {
                            log::warn!("{} ping failed: {}", self.client_id, e);
                            return Exit::Closed;
                        }
                        self.next_ping_at = Instant::now() + self.keepalive_interval();
                    } else {
                        log::warn!("{} no PINGRESP before next keep-alive tick", self.client_id);
                        self.emit(Event::Error(ClientError::KeepAliveTimeout));
                        return Exit::Closed;
                    }
                }

                cmd = self.cmd_rx.next() => {
                    match cmd {
                        Some(cmd) => {
                            if let Err(exit) = self.handle_command(Some(&mut *sink), cmd).await {
                                return exit;
                            }
                        }
                        None => {
                            // every client handle dropped
                            self.disconnecting = true;
                            return Exit::Ended;
                        }
                    }
                }

                pkt = sink.next() => {
                    match pkt {
                        Some(Ok(packet)) => {
                            if let Err(exit) = self.handle_packet(sink, packet).await {
                                return exit;
                            }
                        }
                        Some(Err(ClientError::PacketTooLarge)) => {
                            self.emit(Event::Error(ClientError::PacketTooLarge));
                            if self.is_v5() {
                                let disc = Packet::V5(v5::Packet::Disconnect(Disconnect::new(
                                    DisconnectReasonCode::PacketTooLarge,
                                )));
                                let _ = self.wire_send(sink, disc).await;
                            }
                            self.disconnecting = true;
                            self.end_force = true;
                            return Exit::Ended;
                        }
                        Some(Err(e @ ClientError::Transport(_))) => {
                            // reconnect owns recovery
                            log::warn!("{} read failed: {}", self.client_id, e);
                            return Exit::Closed;
                        }
                        Some(Err(e)) => {
                            self.emit(Event::Error(e));
                            return Exit::Closed;
                        }
                        None => {
                            log::debug!("{} connection closed by peer", self.client_id);
                            return Exit::Closed;
                        }
                    }
                }
            }
        }
    }

    /// Waits out the reconnect period (or indefinitely when auto-reconnect
    /// is off), still serving commands through the offline paths.
    async fn offline_phase(&mut self) -> OfflineNext {
        if self.force_reconnect {
            self.force_reconnect = false;
            self.emit(Event::Reconnect);
            return OfflineNext::Retry;
        }
        let auto = !self.opts.reconnect_period.is_zero();
        if auto && !self.reconnecting {
            self.emit(Event::Offline);
            self.reconnecting = true;
        }

        let retry_delay = tokio::time::sleep(if auto {
            self.opts.reconnect_period
        } else {
            Duration::from_secs(u32::MAX as u64)
        });
        tokio::pin!(retry_delay);

        loop {
            tokio::select! {
                _ = &mut retry_delay, if auto => {
                    self.emit(Event::Reconnect);
                    return OfflineNext::Retry;
                }
                cmd = self.cmd_rx.next() => {
                    match cmd {
                        None => {
                            self.disconnecting = true;
                            return OfflineNext::Ended;
                        }
                        Some(Command::Reconnect) => {
                            self.emit(Event::Reconnect);
                            return OfflineNext::Retry;
                        }
                        Some(Command::End { force, reply }) => {
                            if self.disconnecting {
                                let _ = reply.send(Ok(()));
                                continue;
                            }
                            self.disconnecting = true;
                            self.end_force = force;
                            self.end_replies.push(reply);
                            return OfflineNext::Ended;
                        }
                        Some(cmd) => {
                            if self.handle_command(None, cmd).await.is_err() {
                                return OfflineNext::Ended;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Transport went away: cancel volatile acks, abandon any replay in
    /// progress and forget per-connection alias state.
    fn on_close(&mut self) {
        self.connected = false;
        self.alias_send = None;
        if let Some(reg) = self.alias_recv.as_mut() {
            reg.clear();
        }
        self.inflight.flush_volatile(ClientError::ConnectionClosed);
        if self.replay.is_some() {
            self.replay = None;
            self.store_processing = false;
            self.flush_pending(ClientError::ConnectionClosed);
        }
        self.emit(Event::Closed);
    }

    async fn end_cleanup(&mut self, sink: &mut MqttStream) {
        if !self.end_force {
            tokio::time::sleep(END_GRACE).await;
            if self.connected {
                let disc = if self.is_v5() {
                    Packet::V5(v5::Packet::Disconnect(Disconnect::new(
                        DisconnectReasonCode::NormalDisconnection,
                    )))
                } else {
                    Packet::V3(v3::Packet::Disconnect)
                };
                let _ = self.wire_send(sink, disc).await;
                let _ = sink.close().await;
            }
        }
        self.connected = false;
    }

    pub(crate) fn flush_pending(&mut self, err: ClientError) {
        while let Some(op) = self.pending.pop_front() {
            op.fail(err.clone());
        }
    }

    async fn handle_command(
        &mut self,
        sink: Option<&mut MqttStream>,
        cmd: Command,
    ) -> Result<(), Exit> {
        match cmd {
            Command::Publish { topic, payload, opts, reply } => {
                if self.disconnecting {
                    let _ = reply.send(Err(ClientError::Disconnecting));
                    return Ok(());
                }
                let publish = self.build_publish(topic, payload, &opts);
                self.admit(sink, Operation::Publish { publish, reply: Some(reply) }).await
            }
            Command::Subscribe { subs, opts, reply } => {
                if self.disconnecting {
                    let _ = reply.send(Err(ClientError::Disconnecting));
                    return Ok(());
                }
                self.admit(sink, Operation::Subscribe { subs, opts, reply: Some(reply) }).await
            }
            Command::Unsubscribe { topics, opts, reply } => {
                if self.disconnecting {
                    let _ = reply.send(Err(ClientError::Disconnecting));
                    return Ok(());
                }
                self.admit(sink, Operation::Unsubscribe { topics, opts, reply: Some(reply) }).await
            }
            Command::End { force, reply } => {
                if self.disconnecting {
                    let _ = reply.send(Ok(()));
                    return Ok(());
                }
                self.disconnecting = true;
                self.end_force = force;
                self.end_replies.push(reply);
                if force || self.inflight.is_empty() {
                    return Err(Exit::Ended);
                }
                // wait for in-flight acks; the final one triggers shutdown
                Ok(())
            }
            Command::Reconnect => {
                if self.disconnecting {
                    self.reconnect_on_end = true;
                    Ok(())
                } else {
                    self.force_reconnect = true;
                    Err(Exit::Closed)
                }
            }
            Command::RemoveOutgoing { packet_id } => {
                self.remove_outgoing(packet_id).await;
                Ok(())
            }
            Command::LastId { reply } => {
                let _ = reply.send(self.mid.last_allocated());
                Ok(())
            }
        }
    }

    /// Entry gate for user operations: defers behind the replay interlock,
    /// otherwise admits immediately, re-queueing on id exhaustion.
    async fn admit(&mut self, sink: Option<&mut MqttStream>, op: Operation) -> Result<(), Exit> {
        if self.store_processing || !self.pending.is_empty() {
            self.pending.push_back(op);
            return Ok(());
        }
        match self.try_op(sink, op).await? {
            Admitted::Yes => Ok(()),
            Admitted::Requeue(op) => {
                self.pending.push_back(op);
                Ok(())
            }
        }
    }

    /// Re-admits deferred operations in order, stopping at the first that
    /// still cannot be admitted.
    pub(crate) async fn drive_pending(
        &mut self,
        mut sink: Option<&mut MqttStream>,
    ) -> Result<(), Exit> {
        while !self.store_processing {
            let Some(op) = self.pending.pop_front() else {
                break;
            };
            match self.try_op(sink.as_deref_mut(), op).await? {
                Admitted::Yes => continue,
                Admitted::Requeue(op) => {
                    self.pending.push_front(op);
                    break;
                }
            }
        }
        Ok(())
    }

    async fn try_op(
        &mut self,
        sink: Option<&mut MqttStream>,
        op: Operation,
    ) -> Result<Admitted, Exit> {
        match op {
            Operation::Publish { publish, reply } => self.try_publish(sink, publish, reply).await,
            Operation::Subscribe { subs, opts, reply } => {
                self.try_subscribe(sink, subs, opts, reply).await
            }
            Operation::Unsubscribe { topics, opts, reply } => {
                self.try_unsubscribe(sink, topics, opts, reply).await
            }
        }
    }

    fn build_publish(&self, topic: ByteString, payload: Bytes, opts: &PublishOptions) -> Publish {
        Publish {
            dup: opts.dup,
            retain: opts.retain,
            qos: opts.qos,
            topic,
            packet_id: None,
            payload,
            properties: if self.is_v5() {
                Some(opts.properties.clone().unwrap_or_default())
            } else {
                None
            },
            delay_interval: None,
            create_time: None,
        }
    }

    #[inline]
    fn publish_packet(&self, publish: Publish) -> Packet {
        if self.is_v5() {
            Packet::V5(v5::Packet::Publish(Box::new(publish)))
        } else {
            Packet::V3(v3::Packet::Publish(Box::new(publish)))
        }
    }

    #[inline]
    pub(crate) fn pubrel_packet(&self, packet_id: NonZeroU16) -> Packet {
        if self.is_v5() {
            Packet::V5(v5::Packet::PublishRelease(PublishAck2 {
                packet_id,
                ..Default::default()
            }))
        } else {
            Packet::V3(v3::Packet::PublishRelease { packet_id })
        }
    }

    async fn try_publish(
        &mut self,
        sink: Option<&mut MqttStream>,
        mut publish: Publish,
        reply: Option<PublishReply>,
    ) -> Result<Admitted, Exit> {
        if publish.qos == QoS::AtMostOnce {
            if self.connected && self.is_v5() {
                if let Err(e) = self.apply_topic_alias(&mut publish) {
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(e));
                    }
                    return Ok(Admitted::Yes);
                }
            }
            let packet = self.publish_packet(publish);
            self.send_packet(sink, packet, reply).await?;
            return Ok(Admitted::Yes);
        }

        let Some(id) = self.mid.allocate() else {
            log::debug!("{} packet id space exhausted, deferring publish", self.client_id);
            return Ok(Admitted::Requeue(Operation::Publish { publish, reply }));
        };
        if self.connected && self.is_v5() {
            if let Err(e) = self.apply_topic_alias(&mut publish) {
                self.mid.deallocate(id);
                if let Some(reply) = reply {
                    let _ = reply.send(Err(e));
                }
                return Ok(Admitted::Yes);
            }
        }
        publish.packet_id = Some(id);
        self.inflight.insert(id, InflightEntry { volatile: false, reply: reply.map(Reply::Publish) });
        let packet = self.publish_packet(publish);
        self.send_packet(sink, packet, None).await?;
        Ok(Admitted::Yes)
    }

    async fn try_subscribe(
        &mut self,
        sink: Option<&mut MqttStream>,
        subs: Vec<Subscription>,
        opts: SubscribeOptions,
        reply: Option<SubscribeReply>,
    ) -> Result<Admitted, Exit> {
        let effective: Vec<Subscription> = subs
            .into_iter()
            .filter(|s| {
                opts.resubscribe
                    || match self.resubs.get(&s.topic_filter) {
                        Some(e) => e.opts.qos < s.opts.qos,
                        None => true,
                    }
            })
            .collect();
        if effective.is_empty() {
            if let Some(reply) = reply {
                let _ = reply.send(Ok(Vec::new()));
            }
            return Ok(Admitted::Yes);
        }

        let Some(id) = self.mid.allocate() else {
            log::debug!("{} packet id space exhausted, deferring subscribe", self.client_id);
            return Ok(Admitted::Requeue(Operation::Subscribe {
                subs: effective,
                opts,
                reply,
            }));
        };

        for s in &effective {
            self.resubs.insert(
                s.topic_filter.clone(),
                ResubEntry {
                    opts: s.opts,
                    id: opts.id,
                    user_properties: opts.user_properties.clone(),
                },
            );
        }
        self.sub_topics
            .insert(id.get(), effective.iter().map(|s| s.topic_filter.clone()).collect());
        self.inflight
            .insert(id, InflightEntry { volatile: true, reply: reply.map(Reply::Subscribe) });

        let packet = if self.is_v5() {
            Packet::V5(v5::Packet::Subscribe(v5::Subscribe {
                packet_id: id,
                id: opts.id,
                user_properties: opts.user_properties,
                topic_filters: effective
                    .iter()
                    .map(|s| (s.topic_filter.clone(), s.opts))
                    .collect(),
            }))
        } else {
            Packet::V3(v3::Packet::Subscribe {
                packet_id: id,
                topic_filters: effective
                    .iter()
                    .map(|s| (s.topic_filter.clone(), s.opts.qos))
                    .collect(),
            })
        };
        self.send_packet(sink, packet, None).await?;
        Ok(Admitted::Yes)
    }

    async fn try_unsubscribe(
        &mut self,
        sink: Option<&mut MqttStream>,
        topics: Vec<ByteString>,
        opts: UnsubscribeOptions,
        reply: Option<PublishReply>,
    ) -> Result<Admitted, Exit> {
        let Some(id) = self.mid.allocate() else {
            log::debug!("{} packet id space exhausted, deferring unsubscribe", self.client_id);
            return Ok(Admitted::Requeue(Operation::Unsubscribe { topics, opts, reply }));
        };
        for t in &topics {
            self.resubs.remove(t);
        }
        self.inflight
            .insert(id, InflightEntry { volatile: true, reply: reply.map(Reply::Unsubscribe) });
        let packet = if self.is_v5() {
            Packet::V5(v5::Packet::Unsubscribe(v5::Unsubscribe {
                packet_id: id,
                user_properties: opts.user_properties,
                topic_filters: topics,
            }))
        } else {
            Packet::V3(v3::Packet::Unsubscribe { packet_id: id, topic_filters: topics })
        };
        self.send_packet(sink, packet, None).await?;
        Ok(Admitted::Yes)
    }

    async fn remove_outgoing(&mut self, packet_id: NonZeroU16) {
        if let Some(entry) = self.inflight.remove(packet_id) {
            if let Some(reply) = entry.reply {
                reply.fail(ClientError::MessageRemoved);
            }
        }
        if let Err(e) = self.outgoing.del(packet_id).await {
            log::warn!("{} outgoing store del failed: {:?}", self.client_id, e);
        }
        self.mid.deallocate(packet_id);
    }

    /// Unified send path. Disconnected sessions divert to the offline queue
    /// or the outgoing store; PUBREL and QoS >= 1 publishes are persisted
    /// before hitting the wire.
    pub(crate) async fn send_packet(
        &mut self,
        sink: Option<&mut MqttStream>,
        packet: Packet,
        write_reply: Option<PublishReply>,
    ) -> Result<(), Exit> {
        let sink = match sink {
            Some(sink) if self.connected => sink,
            _ => return self.store_packet(packet, write_reply).await,
        };

        let needs_store = packet.is_release()
            || matches!(packet.publish_qos(), Some(QoS::AtLeastOnce | QoS::ExactlyOnce));
        if needs_store {
            let id = packet.packet_id();
            match self.stored_clone(&packet) {
                Ok(stored) => {
                    if let Err(e) = self.outgoing.put(stored).await {
                        log::warn!("{} outgoing store put failed: {:?}", self.client_id, e);
                        if let Some(id) = id {
                            self.fail_inflight(id, ClientError::store(e));
                        }
                        return Ok(());
                    }
                }
                Err(e) => {
                    if let Some(id) = id {
                        self.fail_inflight(id, e);
                    }
                    return Ok(());
                }
            }
        }

        if let Err(e) = self.wire_send(sink, packet).await {
            log::warn!("{} write failed: {}", self.client_id, e);
            return Err(Exit::Closed);
        }
        if let Some(reply) = write_reply {
            let _ = reply.send(Ok(None));
        }
        Ok(())
    }

    /// Offline variant of the send path.
    async fn store_packet(
        &mut self,
        packet: Packet,
        write_reply: Option<PublishReply>,
    ) -> Result<(), Exit> {
        if let Some(publish) = packet.publish() {
            if publish.qos == QoS::AtMostOnce {
                if self.opts.queue_qos0 {
                    self.offline.push(OfflineEntry { packet, write_reply });
                } else if let Some(reply) = write_reply {
                    let _ = reply.send(Err(ClientError::NotConnected));
                }
                return Ok(());
            }
            let id = packet.packet_id();
            match self.stored_clone(&packet) {
                Ok(stored) => {
                    if let Err(e) = self.outgoing.put(stored).await {
                        log::warn!("{} outgoing store put failed: {:?}", self.client_id, e);
                        if let Some(id) = id {
                            self.fail_inflight(id, ClientError::store(e));
                        }
                    }
                }
                Err(e) => {
                    if let Some(id) = id {
                        self.fail_inflight(id, e);
                    }
                }
            }
            return Ok(());
        }
        if packet.is_release() {
            if let Some(packet_id) = packet.packet_id() {
                if let Err(e) = self.outgoing.put(StoredMessage::Release { packet_id }).await {
                    log::warn!("{} outgoing store put failed: {:?}", self.client_id, e);
                }
            }
            return Ok(());
        }
        self.offline.push(OfflineEntry { packet, write_reply });
        Ok(())
    }

    /// The persisted copy of an outbound packet: full topic restored, alias
    /// dropped so replay never reuses one the broker has forgotten.
    fn stored_clone(&self, packet: &Packet) -> Result<StoredMessage, ClientError> {
        if let Some(publish) = packet.publish() {
            let mut clone = publish.clone();
            if let Some(props) = clone.properties.as_mut() {
                if clone.topic.is_empty() {
                    let alias = props.topic_alias.ok_or(ClientError::UnregisteredTopicAlias)?;
                    clone.topic = self
                        .alias_send
                        .as_ref()
                        .and_then(|reg| reg.topic_by_alias(alias))
                        .ok_or(ClientError::UnregisteredTopicAlias)?;
                }
                props.topic_alias = None;
            }
            Ok(StoredMessage::Publish(clone))
        } else if let Some(packet_id) = packet.packet_id() {
            Ok(StoredMessage::Release { packet_id })
        } else {
            Err(ClientError::protocol("packet cannot be persisted"))
        }
    }

    fn fail_inflight(&mut self, id: NonZeroU16, err: ClientError) {
        if let Some(entry) = self.inflight.remove(id) {
            if let Some(reply) = entry.reply {
                reply.fail(err);
            }
        }
        self.mid.deallocate(id);
    }

    async fn wire_send(&mut self, sink: &mut MqttStream, packet: Packet) -> Result<(), ClientError> {
        self.emit(Event::PacketSend(packet.clone()));
        sink.send(packet).await?;
        if self.opts.reschedule_pings && self.keep_alive > 0 {
            self.next_ping_at = Instant::now() + self.keepalive_interval();
        }
        Ok(())
    }

    fn apply_topic_alias(&mut self, publish: &mut Publish) -> Result<(), ClientError> {
        let supplied = publish.properties.as_ref().and_then(|p| p.topic_alias);
        if let Some(alias) = supplied {
            let Some(reg) = self.alias_send.as_mut() else {
                return Err(ClientError::SendTopicAliasOutOfRange);
            };
            if !publish.topic.is_empty() && !reg.put(publish.topic.clone(), alias) {
                return Err(ClientError::SendTopicAliasOutOfRange);
            }
            // empty topic: the caller is reusing an already-registered alias
            return Ok(());
        }
        if publish.topic.is_empty() {
            return Ok(());
        }
        let Some(reg) = self.alias_send.as_mut() else {
            return Ok(());
        };
        if self.opts.auto_assign_topic_alias {
            if let Some(alias) = reg.alias_by_topic(&publish.topic) {
                publish.topic = ByteString::default();
                publish.properties.get_or_insert_with(Default::default).topic_alias = Some(alias);
            } else if let Some(alias) = reg.lru_alias() {
                reg.put(publish.topic.clone(), alias);
                // first use keeps the topic so the broker learns the mapping
                publish.properties.get_or_insert_with(Default::default).topic_alias = Some(alias);
            }
        } else if self.opts.auto_use_topic_alias {
            if let Some(alias) = reg.alias_by_topic(&publish.topic) {
                publish.topic = ByteString::default();
                publish.properties.get_or_insert_with(Default::default).topic_alias = Some(alias);
            }
        }
        Ok(())
    }

    async fn handle_packet(&mut self, sink: &mut MqttStream, packet: Packet) -> Result<(), Exit> {
        self.emit(Event::PacketReceive(packet.clone()));
        match packet {
            Packet::V3(v3::Packet::Publish(publish)) => {
                self.handle_publish(sink, *publish, false).await
            }
            Packet::V5(v5::Packet::Publish(publish)) => {
                self.handle_publish(sink, *publish, true).await
            }

            Packet::V3(v3::Packet::PublishAck { packet_id }) => {
                self.ack_terminal(sink, packet_id, 0, Packet::V3(v3::Packet::PublishAck { packet_id }))
                    .await
            }
            Packet::V5(v5::Packet::PublishAck(ack)) => {
                let code = u8::from(ack.reason_code);
                let id = ack.packet_id;
                self.ack_terminal(sink, id, code, Packet::V5(v5::Packet::PublishAck(ack))).await
            }

            Packet::V3(v3::Packet::PublishReceived { packet_id }) => {
                self.handle_pubrec(sink, packet_id, 0).await
            }
            Packet::V5(v5::Packet::PublishReceived(ack)) => {
                let code = u8::from(ack.reason_code);
                self.handle_pubrec(sink, ack.packet_id, code).await
            }

            Packet::V3(v3::Packet::PublishRelease { packet_id }) => {
                self.handle_pubrel(sink, packet_id).await
            }
            Packet::V5(v5::Packet::PublishRelease(ack2)) => {
                self.handle_pubrel(sink, ack2.packet_id).await
            }

            Packet::V3(v3::Packet::PublishComplete { packet_id }) => {
                self.ack_terminal(
                    sink,
                    packet_id,
                    0,
                    Packet::V3(v3::Packet::PublishComplete { packet_id }),
                )
                .await
            }
            Packet::V5(v5::Packet::PublishComplete(ack2)) => {
                let code = u8::from(ack2.reason_code);
                let id = ack2.packet_id;
                self.ack_terminal(sink, id, code, Packet::V5(v5::Packet::PublishComplete(ack2)))
                    .await
            }

            p @ (Packet::V3(v3::Packet::SubscribeAck { .. })
            | Packet::V5(v5::Packet::SubscribeAck(_))) => self.handle_suback(sink, p).await,

            p @ (Packet::V3(v3::Packet::UnsubscribeAck { .. })
            | Packet::V5(v5::Packet::UnsubscribeAck(_))) => self.handle_unsuback(sink, p).await,

            Packet::V3(v3::Packet::PingResponse) | Packet::V5(v5::Packet::PingResponse) => {
                self.ping_resp = true;
                Ok(())
            }

            Packet::V5(v5::Packet::Disconnect(d)) => {
                log::debug!("{} broker disconnect: {:?}", self.client_id, d.reason_code);
                self.emit(Event::Disconnected(Box::new(d)));
                Ok(())
            }

            Packet::V5(v5::Packet::Auth(auth)) => {
                if let Some(out) = self.auth_response(&auth).await {
                    self.send_packet(Some(sink), Packet::V5(v5::Packet::Auth(out)), None).await?;
                }
                Ok(())
            }

            p => {
                log::warn!("{} unexpected packet: {:?}", self.client_id, p);
                Ok(())
            }
        }
    }

    async fn auth_response(&mut self, auth: &Auth) -> Option<Auth> {
        let out = if let Some(handler) = self.auth_handler.clone() {
            match handler.handle(auth).await {
                Ok(out) => out,
                Err(e) => {
                    self.emit(Event::Error(ClientError::protocol(e)));
                    return None;
                }
            }
        } else {
            None
        };
        if auth.reason_code == AuthReasonCode::ContinueAuth {
            out.or_else(|| self.opts.auth_packet.clone())
        } else {
            None
        }
    }

    /// v5 alias resolution for an inbound PUBLISH. Returns `false` when the
    /// packet must be dropped (an error event was emitted).
    fn resolve_recv_alias(&mut self, publish: &mut Publish) -> bool {
        let Some(alias) = publish.properties.as_ref().and_then(|p| p.topic_alias) else {
            return true;
        };
        let Some(reg) = self.alias_recv.as_mut() else {
            self.emit(Event::Error(ClientError::RecvTopicAliasOutOfRange));
            return false;
        };
        if publish.topic.is_empty() {
            if !reg.in_range(alias) {
                self.emit(Event::Error(ClientError::RecvTopicAliasOutOfRange));
                return false;
            }
            match reg.get(alias) {
                Some(topic) => {
                    publish.topic = topic;
                    true
                }
                None => {
                    self.emit(Event::Error(ClientError::RecvUnregisteredTopicAlias));
                    false
                }
            }
        } else if reg.put(publish.topic.clone(), alias) {
            true
        } else {
            self.emit(Event::Error(ClientError::RecvTopicAliasOutOfRange));
            false
        }
    }

    async fn ack_reason(&mut self, publish: &Publish) -> Option<PublishAckReason> {
        if !self.is_v5() {
            return Some(PublishAckReason::Success);
        }
        match self.ack_policy.clone() {
            Some(policy) => match policy.handle(publish).await {
                Ok(rc) => Some(rc),
                Err(e) => {
                    self.emit(Event::Error(ClientError::protocol(e)));
                    None
                }
            },
            None => Some(PublishAckReason::Success),
        }
    }

    async fn deliver(&mut self, publish: Publish) {
        let msg =
            Message { topic: publish.topic.clone(), payload: publish.payload.clone(), publish };
        self.emit(Event::Message(msg.clone()));
        if let Some(handler) = self.message_handler.clone() {
            if let Err(e) = handler.handle(&msg.publish).await {
                log::warn!("{} message handler failed: {:?}", self.client_id, e);
                self.emit(Event::Error(ClientError::protocol(e)));
            }
        }
    }

    async fn handle_publish(
        &mut self,
        sink: &mut MqttStream,
        mut publish: Publish,
        is_v5: bool,
    ) -> Result<(), Exit> {
        if is_v5 && !self.resolve_recv_alias(&mut publish) {
            return Ok(());
        }
        match publish.qos {
            QoS::AtMostOnce => {
                self.deliver(publish).await;
                Ok(())
            }
            QoS::AtLeastOnce => {
                let Some(packet_id) = publish.packet_id else {
                    self.emit(Event::Error(ClientError::protocol("QoS 1 publish without id")));
                    return Ok(());
                };
                let Some(rc) = self.ack_reason(&publish).await else {
                    return Ok(());
                };
                if rc == PublishAckReason::Success {
                    self.deliver(publish).await;
                }
                let ack = if is_v5 {
                    Packet::V5(v5::Packet::PublishAck(PublishAck {
                        packet_id,
                        reason_code: rc,
                        ..Default::default()
                    }))
                } else {
                    Packet::V3(v3::Packet::PublishAck { packet_id })
                };
                self.send_packet(Some(sink), ack, None).await
            }
            QoS::ExactlyOnce => {
                let Some(packet_id) = publish.packet_id else {
                    self.emit(Event::Error(ClientError::protocol("QoS 2 publish without id")));
                    return Ok(());
                };
                let Some(rc) = self.ack_reason(&publish).await else {
                    return Ok(());
                };
                if rc == PublishAckReason::Success {
                    if let Err(e) = self.incoming.put(StoredMessage::Publish(publish)).await {
                        log::warn!("{} incoming store put failed: {:?}", self.client_id, e);
                        self.emit(Event::Error(ClientError::store(e)));
                        return Ok(());
                    }
                }
                let rec = if is_v5 {
                    Packet::V5(v5::Packet::PublishReceived(PublishAck {
                        packet_id,
                        reason_code: rc,
                        ..Default::default()
                    }))
                } else {
                    Packet::V3(v3::Packet::PublishReceived { packet_id })
                };
                self.send_packet(Some(sink), rec, None).await
            }
        }
    }

    async fn handle_pubrel(
        &mut self,
        sink: &mut MqttStream,
        packet_id: NonZeroU16,
    ) -> Result<(), Exit> {
        match self.incoming.get(packet_id).await {
            Ok(Some(StoredMessage::Publish(publish))) => {
                self.deliver(publish).await;
                if let Err(e) = self.incoming.del(packet_id).await {
                    log::warn!("{} incoming store del failed: {:?}", self.client_id, e);
                }
            }
            // not stored: the broker is re-delivering a completed exchange
            Ok(_) => {}
            Err(e) => {
                log::warn!("{} incoming store get failed: {:?}", self.client_id, e);
            }
        }
        let comp = if self.is_v5() {
            Packet::V5(v5::Packet::PublishComplete(PublishAck2 {
                packet_id,
                ..Default::default()
            }))
        } else {
            Packet::V3(v3::Packet::PublishComplete { packet_id })
        };
        self.send_packet(Some(sink), comp, None).await
    }

    /// PUBACK and PUBCOMP: the terminal ack of an outbound QoS 1/2 publish.
    async fn ack_terminal(
        &mut self,
        sink: &mut MqttStream,
        id: NonZeroU16,
        code: u8,
        packet: Packet,
    ) -> Result<(), Exit> {
        match self.inflight.remove(id) {
            Some(entry) => {
                let failed = code > 0 && code != 16;
                match entry.reply {
                    Some(Reply::Publish(tx)) => {
                        let _ = tx.send(if failed {
                            Err(ClientError::Reason { code })
                        } else {
                            Ok(Some(packet))
                        });
                    }
                    Some(other) => other.fail(ClientError::protocol("mismatched ack")),
                    None => {}
                }
            }
            None => {
                log::debug!("{} ack for unknown packet id {}", self.client_id, id);
            }
        }
        if let Err(e) = self.outgoing.del(id).await {
            log::warn!("{} outgoing store del failed: {:?}", self.client_id, e);
        }
        self.mid.deallocate(id);
        self.replay_complete(sink, id).await?;
        self.drive_pending(Some(sink)).await?;
        self.check_outgoing_empty()
    }

    async fn handle_pubrec(
        &mut self,
        sink: &mut MqttStream,
        packet_id: NonZeroU16,
        code: u8,
    ) -> Result<(), Exit> {
        if code > 0 && code != 16 {
            // a failed PUBREC terminates the exchange
            if let Some(entry) = self.inflight.remove(packet_id) {
                if let Some(reply) = entry.reply {
                    reply.fail(ClientError::Reason { code });
                }
            }
            if let Err(e) = self.outgoing.del(packet_id).await {
                log::warn!("{} outgoing store del failed: {:?}", self.client_id, e);
            }
            self.mid.deallocate(packet_id);
            self.replay_complete(sink, packet_id).await?;
            self.drive_pending(Some(sink)).await?;
            return self.check_outgoing_empty();
        }
        let pubrel = self.pubrel_packet(packet_id);
        self.send_packet(Some(sink), pubrel, None).await
    }

    async fn handle_suback(&mut self, sink: &mut MqttStream, packet: Packet) -> Result<(), Exit> {
        let Some(id) = packet.packet_id() else {
            return Ok(());
        };
        let entry = self.inflight.remove(id);
        self.mid.deallocate(id);
        let topics = self.sub_topics.remove(&id.get()).unwrap_or_default();

        let codes: Vec<SubscribeAckReason> = match &packet {
            Packet::V3(v3::Packet::SubscribeAck { status, .. }) => status
                .iter()
                .map(|s| match s {
                    v3::SubscribeReturnCode::Success(QoS::AtMostOnce) => {
                        SubscribeAckReason::GrantedQos0
                    }
                    v3::SubscribeReturnCode::Success(QoS::AtLeastOnce) => {
                        SubscribeAckReason::GrantedQos1
                    }
                    v3::SubscribeReturnCode::Success(QoS::ExactlyOnce) => {
                        SubscribeAckReason::GrantedQos2
                    }
                    v3::SubscribeReturnCode::Failure => SubscribeAckReason::UnspecifiedError,
                })
                .collect(),
            Packet::V5(v5::Packet::SubscribeAck(ack)) => ack.status.clone(),
            _ => Vec::new(),
        };

        let mut granted = Vec::with_capacity(topics.len());
        for (i, topic) in topics.into_iter().enumerate() {
            let reason = codes.get(i).copied().unwrap_or(SubscribeAckReason::UnspecifiedError);
            if u8::from(reason) >= 0x80 {
                self.resubs.remove(&topic);
            } else if let Some(entry) = self.resubs.get_mut(&topic) {
                entry.opts.qos = match reason {
                    SubscribeAckReason::GrantedQos1 => QoS::AtLeastOnce,
                    SubscribeAckReason::GrantedQos2 => QoS::ExactlyOnce,
                    _ => QoS::AtMostOnce,
                };
            }
            granted.push(Granted { topic_filter: topic, reason });
        }

        match entry.and_then(|e| e.reply) {
            Some(Reply::Subscribe(tx)) => {
                let _ = tx.send(Ok(granted));
            }
            Some(other) => other.fail(ClientError::protocol("mismatched ack")),
            None => {}
        }
        self.drive_pending(Some(sink)).await?;
        self.check_outgoing_empty()
    }

    async fn handle_unsuback(&mut self, sink: &mut MqttStream, packet: Packet) -> Result<(), Exit> {
        let Some(id) = packet.packet_id() else {
            return Ok(());
        };
        let entry = self.inflight.remove(id);
        self.mid.deallocate(id);
        match entry.and_then(|e| e.reply) {
            Some(Reply::Unsubscribe(tx)) => {
                let _ = tx.send(Ok(Some(packet)));
            }
            Some(other) => other.fail(ClientError::protocol("mismatched ack")),
            None => {}
        }
        self.drive_pending(Some(sink)).await?;
        self.check_outgoing_empty()
    }

    fn check_outgoing_empty(&mut self) -> Result<(), Exit> {
        if self.disconnecting && self.inflight.is_empty() {
            self.emit(Event::OutgoingEmpty);
            return Err(Exit::Ended);
        }
        Ok(())
    }

    /// Replays tracked subscriptions after the broker lost session state.
    pub(crate) async fn resubscribe(&mut self, sink: &mut MqttStream) -> Result<(), Exit> {
        let lost_state = self.opts.clean || (self.is_v5() && !self.session_present);
        if self.first_connection
            || !self.opts.resubscribe
            || !lost_state
            || self.resubs.is_empty()
        {
            return Ok(());
        }
        log::debug!("{} resubscribing {} topics", self.client_id, self.resubs.len());

        if self.is_v5() {
            // one request per filter keeps per-subscription properties intact
            let entries: Vec<(ByteString, v5::SubscriptionOptions, Option<NonZeroU32>, UserProperties)> =
                self.resubs
                    .iter()
                    .map(|(t, e)| (t.clone(), e.opts, e.id, e.user_properties.clone()))
                    .collect();
            for (topic, sub_opts, sub_id, user_properties) in entries {
                let op = Operation::Subscribe {
                    subs: vec![Subscription { topic_filter: topic, opts: sub_opts }],
                    opts: SubscribeOptions { resubscribe: true, id: sub_id, user_properties },
                    reply: None,
                };
                match self.try_op(Some(&mut *sink), op).await? {
                    Admitted::Yes => {}
                    Admitted::Requeue(op) => self.pending.push_back(op),
                }
            }
        } else {
            let subs: Vec<Subscription> = self
                .resubs
                .iter()
                .map(|(t, e)| Subscription { topic_filter: t.clone(), opts: e.opts })
                .collect();
            let op = Operation::Subscribe {
                subs,
                opts: SubscribeOptions { resubscribe: true, ..Default::default() },
                reply: None,
            };
            match self.try_op(Some(&mut *sink), op).await? {
                Admitted::Yes => {}
                Admitted::Requeue(op) => self.pending.push_back(op),
            }
        }
        Ok(())
    }
}

#[inline]
fn reportable(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::AddrInUse
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::NotFound
    )
}
