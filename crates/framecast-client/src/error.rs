use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("client is not connected")]
    NotConnected,

    #[error("gave up after {attempts} connection attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("invalid reconnect policy: {0}")]
    InvalidPolicy(String),

    #[error("send queue is full")]
    QueueFull,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("link closed")]
    Closed,
}
