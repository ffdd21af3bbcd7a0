use std::num::{NonZeroU16, NonZeroU32};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use bytestring::ByteString;
use rmqtt_codec::types::{Protocol, QoS, MQTT_LEVEL_31, MQTT_LEVEL_311, MQTT_LEVEL_5};
use rmqtt_codec::v5::{Auth, UserProperties};
use rmqtt_codec::{v3, v5};

use crate::hook::{AckPolicy, AuthHandler, MessageHandler};
use crate::packet::Packet;
use crate::packet_id::PacketIdProvider;
use crate::store::Store;

/// Will message published by the broker when the session dies uncleanly.
#[derive(Debug, Clone)]
pub struct LastWill {
    pub topic: ByteString,
    pub message: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// v5 CONNECT properties.
#[derive(Debug, Clone, Default)]
pub struct ConnectProperties {
    pub session_expiry_interval: Option<u32>,
    pub receive_maximum: Option<NonZeroU16>,
    /// Largest packet this client accepts; oversized inbound packets abort
    /// the session with reason code 149.
    pub maximum_packet_size: Option<NonZeroU32>,
    pub user_properties: UserProperties,
    pub authentication_method: Option<ByteString>,
    pub authentication_data: Option<Bytes>,
}

/// Session configuration.
///
/// Built with the `with_*` methods; unset fields keep the defaults listed on
/// each entry. Stores, handlers and the packet-id provider are handed to the
/// session task when [`Client::connect`](crate::client::Client::connect)
/// spawns it.
pub struct ConnectOptions {
    /// Keep-alive interval in seconds; 0 disables pings. Default 60.
    pub keepalive: u16,
    /// Reset the keep-alive deadline on every outbound packet. Default true.
    pub reschedule_pings: bool,
    /// Protocol level: 3 (MQTT 3.1), 4 (MQTT 3.1.1), 5 (MQTT 5.0). Default 4.
    pub protocol_version: u8,
    /// Delay between reconnect attempts; zero disables auto-reconnect.
    /// Default 1s.
    pub reconnect_period: Duration,
    /// Hard deadline for transport setup plus the CONNECT/CONNACK exchange.
    /// Default 30s.
    pub connect_timeout: Duration,
    /// Ask the broker to discard prior session state. Default true.
    pub clean: bool,
    /// Replay tracked subscriptions after a reconnect that lost session
    /// state. Default true.
    pub resubscribe: bool,
    /// Queue QoS 0 publishes issued while offline. Default true.
    pub queue_qos0: bool,
    /// Client identifier; generated when absent.
    pub client_id: Option<ByteString>,
    pub username: Option<ByteString>,
    pub password: Option<Bytes>,
    pub last_will: Option<LastWill>,
    /// Capacity announced for inbound topic aliases (v5). Default 0.
    pub topic_alias_maximum: u16,
    /// Assign aliases to outbound topics automatically (v5). Default false.
    pub auto_assign_topic_alias: bool,
    /// Substitute an alias only when the topic is already registered (v5).
    /// Default false.
    pub auto_use_topic_alias: bool,
    /// v5 CONNECT properties.
    pub properties: ConnectProperties,
    /// AUTH packet sent when the broker starts enhanced authentication and
    /// no [`AuthHandler`] produces one.
    pub auth_packet: Option<Auth>,

    pub(crate) message_handler: Option<Arc<dyn MessageHandler>>,
    pub(crate) auth_handler: Option<Arc<dyn AuthHandler>>,
    pub(crate) ack_policy: Option<Arc<dyn AckPolicy>>,
    pub(crate) packet_id_provider: Option<Box<dyn PacketIdProvider>>,
    pub(crate) incoming_store: Option<Box<dyn Store>>,
    pub(crate) outgoing_store: Option<Box<dyn Store>>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self {
            keepalive: 60,
            reschedule_pings: true,
            protocol_version: MQTT_LEVEL_311,
            reconnect_period: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(30),
            clean: true,
            resubscribe: true,
            queue_qos0: true,
            client_id: None,
            username: None,
            password: None,
            last_will: None,
            topic_alias_maximum: 0,
            auto_assign_topic_alias: false,
            auto_use_topic_alias: false,
            properties: ConnectProperties::default(),
            auth_packet: None,
            message_handler: None,
            auth_handler: None,
            ack_policy: None,
            packet_id_provider: None,
            incoming_store: None,
            outgoing_store: None,
        }
    }

    pub fn keepalive(mut self, secs: u16) -> Self {
        self.keepalive = secs;
        self
    }

    pub fn reschedule_pings(mut self, on: bool) -> Self {
        self.reschedule_pings = on;
        self
    }

    pub fn protocol_version(mut self, level: u8) -> Self {
        self.protocol_version = level;
        self
    }

    pub fn reconnect_period(mut self, period: Duration) -> Self {
        self.reconnect_period = period;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn clean(mut self, clean: bool) -> Self {
        self.clean = clean;
        self
    }

    pub fn resubscribe(mut self, on: bool) -> Self {
        self.resubscribe = on;
        self
    }

    pub fn queue_qos0(mut self, on: bool) -> Self {
        self.queue_qos0 = on;
        self
    }

    pub fn client_id<T: Into<ByteString>>(mut self, client_id: T) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn credentials<U: Into<ByteString>>(mut self, username: U, password: Option<Bytes>) -> Self {
        self.username = Some(username.into());
        self.password = password;
        self
    }

    pub fn last_will(mut self, will: LastWill) -> Self {
        self.last_will = Some(will);
        self
    }

    pub fn topic_alias_maximum(mut self, max: u16) -> Self {
        self.topic_alias_maximum = max;
        self
    }

    pub fn auto_assign_topic_alias(mut self, on: bool) -> Self {
        self.auto_assign_topic_alias = on;
        self
    }

    pub fn auto_use_topic_alias(mut self, on: bool) -> Self {
        self.auto_use_topic_alias = on;
        self
    }

    pub fn properties(mut self, properties: ConnectProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn auth_packet(mut self, auth: Auth) -> Self {
        self.auth_packet = Some(auth);
        self
    }

    pub fn message_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.message_handler = Some(handler);
        self
    }

    pub fn auth_handler(mut self, handler: Arc<dyn AuthHandler>) -> Self {
        self.auth_handler = Some(handler);
        self
    }

    pub fn ack_policy(mut self, policy: Arc<dyn AckPolicy>) -> Self {
        self.ack_policy = Some(policy);
        self
    }

    pub fn packet_id_provider(mut self, provider: Box<dyn PacketIdProvider>) -> Self {
        self.packet_id_provider = Some(provider);
        self
    }

    pub fn incoming_store(mut self, store: Box<dyn Store>) -> Self {
        self.incoming_store = Some(store);
        self
    }

    pub fn outgoing_store(mut self, store: Box<dyn Store>) -> Self {
        self.outgoing_store = Some(store);
        self
    }

    #[inline]
    pub fn is_v5(&self) -> bool {
        self.protocol_version == MQTT_LEVEL_5
    }

    /// Builds the CONNECT packet for the configured protocol level.
    pub(crate) fn build_connect(&self, client_id: &ByteString) -> Packet {
        if self.is_v5() {
            Packet::V5(v5::Packet::Connect(Box::new(v5::Connect {
                clean_start: self.clean,
                keep_alive: self.keepalive,
                session_expiry_interval_secs: self
                    .properties
                    .session_expiry_interval
                    .unwrap_or_default(),
                auth_method: self.properties.authentication_method.clone(),
                auth_data: self.properties.authentication_data.clone(),
                request_problem_info: true,
                request_response_info: false,
                receive_max: self.properties.receive_maximum,
                topic_alias_max: self.topic_alias_maximum,
                user_properties: self.properties.user_properties.clone(),
                max_packet_size: self.properties.maximum_packet_size,
                last_will: self.last_will.as_ref().map(|w| v5::LastWill {
                    qos: w.qos,
                    retain: w.retain,
                    topic: w.topic.clone(),
                    message: w.message.clone(),
                    will_delay_interval_sec: None,
                    correlation_data: None,
                    message_expiry_interval: None,
                    content_type: None,
                    user_properties: Vec::new(),
                    is_utf8_payload: None,
                    response_topic: None,
                }),
                client_id: client_id.clone(),
                username: self.username.clone(),
                password: self.password.clone(),
            })))
        } else {
            Packet::V3(v3::Packet::Connect(Box::new(v3::Connect {
                protocol: Protocol(self.protocol_version),
                clean_session: self.clean,
                keep_alive: self.keepalive,
                last_will: self.last_will.as_ref().map(|w| v3::LastWill {
                    qos: w.qos,
                    retain: w.retain,
                    topic: w.topic.clone(),
                    message: w.message.clone(),
                }),
                client_id: client_id.clone(),
                username: self.username.clone(),
                password: self.password.clone(),
            })))
        }
    }
}

/// Generated identifier for sessions configured without one; the broker
/// assigns final identity.
pub(crate) fn generate_client_id() -> ByteString {
    format!("rmqttc_{:08x}", rand::random::<u32>()).into()
}

pub(crate) fn valid_protocol_version(level: u8) -> bool {
    matches!(level, MQTT_LEVEL_31 | MQTT_LEVEL_311 | MQTT_LEVEL_5)
}
