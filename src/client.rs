use std::future::Future;
use std::num::NonZeroU16;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use bytestring::ByteString;
use futures::channel::mpsc::{unbounded, UnboundedReceiver};
use tokio::sync::oneshot;

use crate::error::ClientError;
use crate::options::{valid_protocol_version, ConnectOptions};
use crate::packet::Packet;
use crate::session::{Command, SessionState};
use crate::transport::Transport;
use crate::types::{
    Event, Granted, PublishOptions, SubscribeOptions, Subscription, UnsubscribeOptions,
};
use crate::Result;

/// Handle to a running session.
///
/// Cheap to clone; all handles feed the same session task. Operations return
/// a [`Completion`] resolving at the operation's terminal acknowledgment
/// (QoS 0 publishes complete once written). Dropping a `Completion` makes the
/// operation fire-and-forget.
#[derive(Clone)]
pub struct Client {
    cmd_tx: futures::channel::mpsc::UnboundedSender<Command>,
}

/// Future resolving when the session finishes an operation.
pub struct Completion<T>(oneshot::Receiver<std::result::Result<T, ClientError>>);

impl<T> Future for Completion<T> {
    type Output = std::result::Result<T, ClientError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx).map(|r| match r {
            Ok(v) => v,
            Err(_) => Err(ClientError::ConnectionClosed),
        })
    }
}

impl Client {
    /// Spawns the session task and starts connecting immediately.
    ///
    /// Returns the handle and the event channel. The channel is unbounded;
    /// dropping it simply discards events.
    pub fn connect<T>(
        transport: T,
        opts: ConnectOptions,
    ) -> Result<(Client, UnboundedReceiver<Event>)>
    where
        T: Transport + 'static,
    {
        if !valid_protocol_version(opts.protocol_version) {
            return Err(anyhow::anyhow!(
                "unsupported protocol version: {}",
                opts.protocol_version
            ));
        }
        let (cmd_tx, cmd_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let state = SessionState::new(Box::new(transport), opts, cmd_rx, event_tx);
        tokio::spawn(state.run());
        Ok((Client { cmd_tx }, event_rx))
    }

    pub fn publish<T, P>(
        &self,
        topic: T,
        payload: P,
        opts: PublishOptions,
    ) -> Result<Completion<Option<Packet>>>
    where
        T: Into<ByteString>,
        P: Into<Bytes>,
    {
        let topic = topic.into();
        validate_publish_topic(&topic, &opts)?;
        let (reply, rx) = oneshot::channel();
        self.send(Command::Publish { topic, payload: payload.into(), opts, reply })?;
        Ok(Completion(rx))
    }

    pub fn subscribe(
        &self,
        subs: Vec<Subscription>,
        opts: SubscribeOptions,
    ) -> Result<Completion<Vec<Granted>>> {
        for s in &subs {
            validate_topic_filter(&s.topic_filter)?;
        }
        let (reply, rx) = oneshot::channel();
        self.send(Command::Subscribe { subs, opts, reply })?;
        Ok(Completion(rx))
    }

    pub fn unsubscribe<T>(
        &self,
        topics: Vec<T>,
        opts: UnsubscribeOptions,
    ) -> Result<Completion<Option<Packet>>>
    where
        T: Into<ByteString>,
    {
        let topics: Vec<ByteString> = topics.into_iter().map(Into::into).collect();
        for t in &topics {
            validate_topic_filter(t)?;
        }
        let (reply, rx) = oneshot::channel();
        self.send(Command::Unsubscribe { topics, opts, reply })?;
        Ok(Completion(rx))
    }

    /// Shuts the session down. With `force` false, in-flight operations get
    /// to finish first; with `force` true they are abandoned.
    ///
    /// Calling `end` again while a shutdown is in progress completes
    /// immediately.
    pub fn end(&self, force: bool) -> Result<Completion<()>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::End { force, reply })?;
        Ok(Completion(rx))
    }

    /// Forces a new connection attempt. While an `end` is in progress, the
    /// reconnect happens once the shutdown finishes.
    pub fn reconnect(&self) -> Result<()> {
        self.send(Command::Reconnect)
    }

    /// Abandons an outbound QoS >= 1 publish: its completion fires with
    /// [`ClientError::MessageRemoved`] and the stored copy is dropped.
    pub fn remove_outgoing_message(&self, packet_id: NonZeroU16) -> Result<()> {
        self.send(Command::RemoveOutgoing { packet_id })
    }

    /// The most recently allocated packet identifier, if any.
    pub async fn last_packet_id(&self) -> Option<NonZeroU16> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::LastId { reply }).ok()?;
        rx.await.ok().flatten()
    }

    #[inline]
    fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx
            .unbounded_send(cmd)
            .map_err(|_| ClientError::ConnectionClosed.into())
    }
}

fn validate_publish_topic(topic: &ByteString, opts: &PublishOptions) -> Result<()> {
    let aliased = opts.properties.as_ref().and_then(|p| p.topic_alias).is_some();
    if topic.is_empty() && !aliased {
        return Err(ClientError::InvalidTopic(topic.clone()).into());
    }
    if topic.contains(['#', '+']) || topic.contains('\0') {
        return Err(ClientError::InvalidTopic(topic.clone()).into());
    }
    Ok(())
}

fn validate_topic_filter(filter: &ByteString) -> Result<()> {
    if filter.is_empty() || filter.contains('\0') {
        return Err(ClientError::InvalidTopic(filter.clone()).into());
    }
    let segments: Vec<&str> = filter.split('/').collect();
    for (i, seg) in segments.iter().enumerate() {
        if seg.contains('#') && (*seg != "#" || i + 1 != segments.len()) {
            return Err(ClientError::InvalidTopic(filter.clone()).into());
        }
        if seg.contains('+') && *seg != "+" {
            return Err(ClientError::InvalidTopic(filter.clone()).into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmqtt_codec::types::QoS;

    #[test]
    fn publish_topic_validation() {
        let opts = PublishOptions::default();
        assert!(validate_publish_topic(&"a/b".into(), &opts).is_ok());
        assert!(validate_publish_topic(&"".into(), &opts).is_err());
        assert!(validate_publish_topic(&"a/+/b".into(), &opts).is_err());
        assert!(validate_publish_topic(&"a/#".into(), &opts).is_err());

        let aliased = PublishOptions {
            properties: Some(rmqtt_codec::v5::PublishProperties {
                topic_alias: NonZeroU16::new(1),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(validate_publish_topic(&"".into(), &aliased).is_ok());
    }

    #[test]
    fn filter_validation() {
        assert!(validate_topic_filter(&"a/b/#".into()).is_ok());
        assert!(validate_topic_filter(&"a/+/c".into()).is_ok());
        assert!(validate_topic_filter(&"#".into()).is_ok());
        assert!(validate_topic_filter(&"a/#/b".into()).is_err());
        assert!(validate_topic_filter(&"a/b#".into()).is_err());
        assert!(validate_topic_filter(&"a/b+".into()).is_err());
        assert!(validate_topic_filter(&"".into()).is_err());
    }

    #[test]
    fn subscription_builder() {
        let s = Subscription::new("t/1", QoS::AtLeastOnce);
        assert_eq!(s.topic_filter, "t/1");
        assert_eq!(s.opts.qos, QoS::AtLeastOnce);
    }
}
