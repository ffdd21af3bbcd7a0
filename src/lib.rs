#![deny(unsafe_code)]

//! Asynchronous MQTT client session engine.
//!
//! Speaks MQTT 3.1, 3.1.1 and 5.0 over any ordered byte stream supplied by a
//! [`transport::Transport`]. The crate owns the session state machine: QoS 0/1/2
//! delivery on both directions, packet-identifier allocation, persistence of
//! unacknowledged messages with replay after reconnect, topic-alias compression
//! (v5), keep-alive pings and automatic reconnection.
//!
//! # Example
//! ```rust,no_run
//! use rmqtt_client::{Client, ConnectOptions, Event, PublishOptions, Subscription};
//! use rmqtt_client::transport::TcpTransport;
//! use rmqtt_client::codec::types::QoS;
//!
//! #[tokio::main]
//! async fn main() -> rmqtt_client::Result<()> {
//!     let transport = TcpTransport::new("127.0.0.1:1883");
//!     let (client, mut events) = Client::connect(transport, ConnectOptions::new())?;
//!
//!     client.subscribe(vec![Subscription::new("sensors/#", QoS::AtLeastOnce)], Default::default())?;
//!     client.publish("sensors/a", "23.5", PublishOptions::qos(QoS::AtLeastOnce))?.await?;
//!
//!     while let Some(ev) = futures::StreamExt::next(&mut events).await {
//!         if let Event::Message(msg) = ev {
//!             println!("{}: {:?}", msg.topic, msg.payload);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod alias;
pub mod client;
pub mod error;
pub mod hook;
pub mod options;
pub mod packet;
pub mod packet_id;
pub mod store;
pub mod transport;
pub mod types;

mod inflight;
mod queue;
mod replay;
mod session;
mod stream;

pub use client::{Client, Completion};
pub use error::ClientError;
pub use options::{ConnectOptions, ConnectProperties, LastWill};
pub use packet::Packet;
pub use types::{
    Event, Granted, Message, PublishOptions, SubscribeOptions, Subscription, UnsubscribeOptions,
};

pub use rmqtt_codec as codec;

pub type Error = anyhow::Error;
pub type Result<T> = anyhow::Result<T, Error>;
