use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{SinkExt, Stream};
use rmqtt_codec::error::{DecodeError, EncodeError};
use rmqtt_codec::v3::Codec as CodecV3;
use rmqtt_codec::v5::Codec as CodecV5;
use rmqtt_codec::{MqttCodec, MqttPacket};
use tokio_util::codec::Framed;

use crate::error::ClientError;
use crate::packet::Packet;
use crate::transport::AsyncStream;

/// The framed wire connection for one transport lifetime.
///
/// Writes apply the transport's backpressure (a send completes once the frame
/// is flushed); reads yield packets in strict wire order.
pub(crate) struct MqttStream {
    io: Framed<Box<dyn AsyncStream>, MqttCodec>,
}

impl MqttStream {
    pub(crate) fn v3(io: Box<dyn AsyncStream>, max_packet_size: u32) -> Self {
        Self { io: Framed::new(io, MqttCodec::V3(CodecV3::new(max_packet_size))) }
    }

    pub(crate) fn v5(io: Box<dyn AsyncStream>, max_in_size: u32, max_out_size: u32) -> Self {
        Self { io: Framed::new(io, MqttCodec::V5(CodecV5::new(max_in_size, max_out_size))) }
    }

    /// Adopt the peer's maximum packet size (v5 CONNACK property).
    pub(crate) fn set_max_outbound_size(&mut self, size: u32) {
        if let MqttCodec::V5(codec) = self.io.codec_mut() {
            codec.set_max_outbound_size(size);
        }
    }

    pub(crate) async fn send(&mut self, packet: Packet) -> Result<(), ClientError> {
        self.io.send(packet.into()).await.map_err(|e| match e {
            EncodeError::OverMaxPacketSize => ClientError::PacketTooLarge,
            EncodeError::Io(e) => ClientError::Transport(e),
            e => ClientError::protocol(e),
        })
    }

    /// Flush and shut down the write side.
    pub(crate) async fn close(&mut self) -> Result<(), ClientError> {
        self.io.close().await.map_err(ClientError::transport)
    }
}

impl Stream for MqttStream {
    type Item = Result<Packet, ClientError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let next = Pin::new(&mut self.io).poll_next(cx);
        Poll::Ready(match futures::ready!(next) {
            Some(Ok((MqttPacket::V3(packet), _))) => Some(Ok(Packet::V3(packet))),
            Some(Ok((MqttPacket::V5(packet), _))) => Some(Ok(Packet::V5(packet))),
            Some(Ok((MqttPacket::Version(_), _))) => {
                Some(Err(ClientError::protocol(DecodeError::UnsupportedPacketType)))
            }
            Some(Err(DecodeError::MaxSizeExceeded)) => Some(Err(ClientError::PacketTooLarge)),
            Some(Err(DecodeError::Io(e))) => Some(Err(ClientError::Transport(e))),
            Some(Err(e)) => Some(Err(ClientError::protocol(e))),
            None => None,
        })
    }
}
