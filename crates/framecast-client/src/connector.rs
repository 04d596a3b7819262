//! Pluggable transports. The client speaks text frames; a [`Connector`]
//! turns a URL into a [`Transport`] carrying them.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::error::ClientError;

pub type TextSink = Pin<Box<dyn Sink<String, Error = ClientError> + Send>>;
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, ClientError>> + Send>>;

/// One established link. The stream ending, or yielding an error, means the
/// link is gone.
pub struct Transport {
    pub sink: TextSink,
    pub stream: TextStream,
}

impl Transport {
    pub fn new<S, R>(sink: S, stream: R) -> Self
    where
        S: Sink<String, Error = ClientError> + Send + 'static,
        R: Stream<Item = Result<String, ClientError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Transport, ClientError>;
}

/// WebSocket transport over `tokio-tungstenite`.
#[derive(Clone, Copy, Debug, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Transport, ClientError> {
        let (socket, _) = connect_async(url)
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let (sink, stream) = socket.split();

        let sink = sink
            .sink_map_err(|e| ClientError::Transport(e.to_string()))
            .with(|text: String| future::ready(Ok::<_, ClientError>(Message::Text(text.into()))));

        let stream = stream.filter_map(|frame| {
            future::ready(match frame {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(data)) => String::from_utf8(data.to_vec()).ok().map(Ok),
                Ok(Message::Close(_)) => Some(Err(ClientError::Closed)),
                // tungstenite answers transport pings on its own
                Ok(_) => None,
                Err(e) => Some(Err(ClientError::Transport(e.to_string()))),
            })
        });

        Ok(Transport::new(sink, stream))
    }
}
