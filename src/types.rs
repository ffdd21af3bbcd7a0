use std::num::NonZeroU32;

use bytes::Bytes;
use bytestring::ByteString;
use rmqtt_codec::types::{Publish, QoS};
use rmqtt_codec::v5::{
    PublishProperties, SubscribeAckReason, SubscriptionOptions, UserProperties,
};
use rmqtt_codec::v5::Disconnect;

use crate::error::ClientError;
use crate::packet::Packet;

/// An application message delivered by the broker.
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: ByteString,
    pub payload: Bytes,
    /// The PUBLISH packet the message arrived in, alias already resolved.
    pub publish: Publish,
}

/// Session lifecycle notifications, received from the channel returned by
/// [`Client::connect`](crate::client::Client::connect).
#[derive(Debug, Clone)]
pub enum Event {
    /// CONNACK accepted and the outgoing store finished replaying.
    Connect(Packet),
    /// A reconnect attempt is starting.
    Reconnect,
    /// The session went offline and the reconnect timer was armed.
    Offline,
    /// The transport closed.
    Closed,
    /// The broker sent DISCONNECT (v5). The session does not close itself.
    Disconnected(Box<Disconnect>),
    /// The session terminated and both stores were closed.
    End,
    Error(ClientError),
    Message(Message),
    PacketSend(Packet),
    PacketReceive(Packet),
    /// All in-flight operations completed while the session was ending.
    OutgoingEmpty,
}

/// Per-publish options.
#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    /// v5 properties; the topic-alias field is managed by the session when
    /// `auto_assign_topic_alias` / `auto_use_topic_alias` are enabled.
    pub properties: Option<PublishProperties>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self { qos: QoS::AtMostOnce, retain: false, dup: false, properties: None }
    }
}

impl PublishOptions {
    pub fn qos(qos: QoS) -> Self {
        Self { qos, ..Default::default() }
    }

    pub fn retain(mut self) -> Self {
        self.retain = true;
        self
    }

    pub fn properties(mut self, properties: PublishProperties) -> Self {
        self.properties = Some(properties);
        self
    }
}

/// One topic filter of a subscribe request.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub topic_filter: ByteString,
    pub opts: SubscriptionOptions,
}

impl Subscription {
    pub fn new<T: Into<ByteString>>(topic_filter: T, qos: QoS) -> Self {
        Self {
            topic_filter: topic_filter.into(),
            opts: SubscriptionOptions { qos, ..Default::default() },
        }
    }

    pub fn opts(mut self, opts: SubscriptionOptions) -> Self {
        self.opts = opts;
        self
    }
}

/// Options applying to a whole subscribe request.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Send the request even for filters already granted at an equal or
    /// higher QoS.
    pub resubscribe: bool,
    /// v5 subscription identifier.
    pub id: Option<NonZeroU32>,
    /// v5 user properties.
    pub user_properties: UserProperties,
}

/// Options applying to a whole unsubscribe request.
#[derive(Debug, Clone, Default)]
pub struct UnsubscribeOptions {
    /// v5 user properties.
    pub user_properties: UserProperties,
}

/// One entry of a SUBACK, matched back to the requested filter.
#[derive(Debug, Clone)]
pub struct Granted {
    pub topic_filter: ByteString,
    pub reason: SubscribeAckReason,
}

impl Granted {
    /// Whether the broker refused this filter.
    #[inline]
    pub fn is_failure(&self) -> bool {
        u8::from(self.reason) >= 0x80
    }
}
