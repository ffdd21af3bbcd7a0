use std::num::NonZeroU16;

use rmqtt_codec::types::{Publish, QoS};
use rmqtt_codec::{v3, v5, MqttPacket};

/// A protocol packet of either supported protocol generation.
///
/// The session machine operates on this type; conversion to and from the
/// codec's [`MqttPacket`] happens at the framed-stream boundary.
#[derive(Debug, Clone)]
pub enum Packet {
    V3(v3::Packet),
    V5(v5::Packet),
}

impl Packet {
    /// The packet identifier carried by this packet, if its type has one.
    #[inline]
    pub fn packet_id(&self) -> Option<NonZeroU16> {
        match self {
            Packet::V3(p) => match p {
                v3::Packet::Publish(publish) => publish.packet_id,
                v3::Packet::PublishAck { packet_id }
                | v3::Packet::PublishReceived { packet_id }
                | v3::Packet::PublishRelease { packet_id }
                | v3::Packet::PublishComplete { packet_id }
                | v3::Packet::Subscribe { packet_id, .. }
                | v3::Packet::SubscribeAck { packet_id, .. }
                | v3::Packet::Unsubscribe { packet_id, .. }
                | v3::Packet::UnsubscribeAck { packet_id } => Some(*packet_id),
                _ => None,
            },
            Packet::V5(p) => match p {
                v5::Packet::Publish(publish) => publish.packet_id,
                v5::Packet::PublishAck(ack) | v5::Packet::PublishReceived(ack) => {
                    Some(ack.packet_id)
                }
                v5::Packet::PublishRelease(ack2) | v5::Packet::PublishComplete(ack2) => {
                    Some(ack2.packet_id)
                }
                v5::Packet::Subscribe(sub) => Some(sub.packet_id),
                v5::Packet::SubscribeAck(ack) => Some(ack.packet_id),
                v5::Packet::Unsubscribe(unsub) => Some(unsub.packet_id),
                v5::Packet::UnsubscribeAck(unack) => Some(unack.packet_id),
                _ => None,
            },
        }
    }

    #[inline]
    pub fn publish(&self) -> Option<&Publish> {
        match self {
            Packet::V3(v3::Packet::Publish(publish)) => Some(publish),
            Packet::V5(v5::Packet::Publish(publish)) => Some(publish),
            _ => None,
        }
    }

    #[inline]
    pub fn is_publish(&self) -> bool {
        self.publish().is_some()
    }

    /// QoS of an outbound PUBLISH, `None` for every other packet type.
    #[inline]
    pub fn publish_qos(&self) -> Option<QoS> {
        self.publish().map(|p| p.qos)
    }

    #[inline]
    pub(crate) fn is_release(&self) -> bool {
        matches!(
            self,
            Packet::V3(v3::Packet::PublishRelease { .. }) | Packet::V5(v5::Packet::PublishRelease(_))
        )
    }

    #[inline]
    pub(crate) fn is_auth(&self) -> bool {
        matches!(self, Packet::V5(v5::Packet::Auth(_)))
    }
}

impl From<Packet> for MqttPacket {
    #[inline]
    fn from(p: Packet) -> Self {
        match p {
            Packet::V3(p) => MqttPacket::V3(p),
            Packet::V5(p) => MqttPacket::V5(p),
        }
    }
}

impl From<v3::Packet> for Packet {
    #[inline]
    fn from(p: v3::Packet) -> Self {
        Packet::V3(p)
    }
}

impl From<v5::Packet> for Packet {
    #[inline]
    fn from(p: v5::Packet) -> Self {
        Packet::V5(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use bytestring::ByteString;

    fn publish(packet_id: Option<NonZeroU16>) -> Publish {
        Publish {
            dup: false,
            retain: false,
            qos: QoS::AtLeastOnce,
            topic: ByteString::from_static("t"),
            packet_id,
            payload: Bytes::from_static(b"x"),
            properties: None,
            delay_interval: None,
            create_time: None,
        }
    }

    #[test]
    fn packet_id_extraction() {
        let id = NonZeroU16::new(7).unwrap();
        let p = Packet::V3(v3::Packet::Publish(Box::new(publish(Some(id)))));
        assert_eq!(p.packet_id(), Some(id));
        assert!(p.is_publish());

        let p = Packet::V5(v5::Packet::PublishAck(v5::PublishAck {
            packet_id: id,
            ..Default::default()
        }));
        assert_eq!(p.packet_id(), Some(id));
        assert!(!p.is_publish());

        let p = Packet::V3(v3::Packet::PingRequest);
        assert_eq!(p.packet_id(), None);
    }
}
