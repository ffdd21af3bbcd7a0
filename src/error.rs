use bytestring::ByteString;

/// Errors surfaced by the client, either through an operation's completion or
/// through [`Event::Error`](crate::types::Event::Error).
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// The session is shutting down; no new operations are accepted.
    #[error("client disconnecting")]
    Disconnecting,
    /// The operation could not be queued while offline.
    #[error("no connection to broker")]
    NotConnected,
    /// The transport closed before the operation completed.
    #[error("connection closed")]
    ConnectionClosed,
    /// No CONNACK arrived within `connect_timeout`.
    #[error("connect timed out")]
    ConnectTimeout,
    /// No PINGRESP arrived before the next keep-alive tick.
    #[error("keep-alive timed out")]
    KeepAliveTimeout,
    /// The operation was cancelled via `remove_outgoing_message`.
    #[error("message removed")]
    MessageRemoved,
    #[error("invalid topic: {0:?}")]
    InvalidTopic(ByteString),
    #[error("sending topic alias out of range")]
    SendTopicAliasOutOfRange,
    #[error("unregistered topic alias")]
    UnregisteredTopicAlias,
    #[error("received topic alias out of range")]
    RecvTopicAliasOutOfRange,
    #[error("received unregistered topic alias")]
    RecvUnregisteredTopicAlias,
    /// The peer answered with a non-success reason code.
    #[error("{}", reason_text(*.code))]
    Reason { code: u8 },
    /// An inbound packet exceeded the negotiated maximum packet size.
    #[error("packet exceeds maximum size")]
    PacketTooLarge,
    #[error("transport error: {0}")]
    Transport(ByteString),
    #[error("store error: {0}")]
    Store(ByteString),
    #[error("protocol error: {0}")]
    Protocol(ByteString),
}

impl ClientError {
    /// The protocol reason code attached to this error, if any.
    #[inline]
    pub fn code(&self) -> Option<u8> {
        match self {
            ClientError::Reason { code } => Some(*code),
            _ => None,
        }
    }

    #[inline]
    pub(crate) fn transport(e: impl ToString) -> Self {
        ClientError::Transport(e.to_string().into())
    }

    #[inline]
    pub(crate) fn store(e: impl ToString) -> Self {
        ClientError::Store(e.to_string().into())
    }

    #[inline]
    pub(crate) fn protocol(e: impl ToString) -> Self {
        ClientError::Protocol(e.to_string().into())
    }
}

/// Human-readable text for CONNACK return codes (3.1.1) and v5 reason codes.
pub fn reason_text(code: u8) -> &'static str {
    match code {
        0 => "Success",
        1 => "Connection refused: Unacceptable protocol version",
        2 => "Connection refused: Identifier rejected",
        3 => "Connection refused: Server unavailable",
        4 => "Connection refused: Bad username or password",
        5 => "Connection refused: Not authorized",
        16 => "No matching subscribers",
        17 => "No subscription existed",
        24 => "Continue authentication",
        25 => "Re-authenticate",
        128 => "Unspecified error",
        129 => "Malformed Packet",
        130 => "Protocol Error",
        131 => "Implementation specific error",
        132 => "Unsupported Protocol Version",
        133 => "Client Identifier not valid",
        134 => "Bad User Name or Password",
        135 => "Not authorized",
        136 => "Server unavailable",
        137 => "Server busy",
        138 => "Banned",
        139 => "Server shutting down",
        140 => "Bad authentication method",
        141 => "Keep Alive timeout",
        142 => "Session taken over",
        143 => "Topic Filter invalid",
        144 => "Topic Name invalid",
        145 => "Packet Identifier in use",
        146 => "Packet Identifier not found",
        147 => "Receive Maximum exceeded",
        148 => "Topic Alias invalid",
        149 => "Packet too large",
        150 => "Message rate too high",
        151 => "Quota exceeded",
        152 => "Administrative action",
        153 => "Payload format invalid",
        154 => "Retain not supported",
        155 => "QoS not supported",
        156 => "Use another server",
        157 => "Server moved",
        158 => "Shared Subscriptions not supported",
        159 => "Connection rate exceeded",
        160 => "Maximum connect time",
        161 => "Subscription Identifiers not supported",
        162 => "Wildcard Subscriptions not supported",
        _ => "Unknown reason",
    }
}
