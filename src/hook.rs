use async_trait::async_trait;
use rmqtt_codec::types::Publish;
use rmqtt_codec::v5::{Auth, PublishAckReason};

use crate::Result;

/// Inbound delivery hook.
///
/// The session does not read the next packet off the wire until this returns,
/// so a slow handler applies backpressure to the broker. Errors are reported
/// through the session's error event; delivery acknowledgment proceeds.
#[async_trait]
pub trait MessageHandler: Sync + Send {
    async fn handle(&self, publish: &Publish) -> Result<()>;
}

/// v5 enhanced-authentication exchange.
///
/// Called for every inbound AUTH packet. Returning a packet while the broker
/// asked to continue authentication (reason code 24) sends it back; returning
/// `None` ends the exchange.
#[async_trait]
pub trait AuthHandler: Sync + Send {
    async fn handle(&self, auth: &Auth) -> Result<Option<Auth>>;
}

/// Acknowledgment policy for inbound QoS 1/2 publishes (v5 only).
///
/// The returned reason code goes out in PUBACK or PUBREC; anything other than
/// [`PublishAckReason::Success`] suppresses delivery to the application.
#[async_trait]
pub trait AckPolicy: Sync + Send {
    async fn handle(&self, publish: &Publish) -> Result<PublishAckReason>;
}

/// Default policy: acknowledge everything with success.
pub struct AcceptAll;

#[async_trait]
impl AckPolicy for AcceptAll {
    async fn handle(&self, _publish: &Publish) -> Result<PublishAckReason> {
        Ok(PublishAckReason::Success)
    }
}
