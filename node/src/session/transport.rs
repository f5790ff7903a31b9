use async_trait::async_trait;
use futures::future;
use futures::{Sink, SinkExt, Stream, StreamExt};
use log::debug;
use reqwest::Url;
use std::pin::Pin;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use super::SessionError;

pub type FrameSink = Pin<Box<dyn Sink<String, Error = SessionError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, SessionError>> + Send>>;

/// An open connection, already split into its write and read halves.
pub struct Link {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, url: &str) -> Result<Link, SessionError>;
}

/// `<base>/websocket?userId=<id>&version=<v>`
pub fn endpoint_url(base: &str, user_id: &str, version: &str) -> Result<String, SessionError> {
    let raw = format!("{}/websocket", base.trim_end_matches('/'));
    let url = Url::parse_with_params(&raw, &[("userId", user_id), ("version", version)])
        .map_err(|e| SessionError::InvalidUrl(format!("{}: {}", raw, e)))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url.into()),
        other => Err(SessionError::InvalidUrl(format!("unsupported scheme '{}'", other))),
    }
}

/// WebSocket connector over tokio-tungstenite
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &str) -> Result<Link, SessionError> {
        let (ws, response) = connect_async(url)
            .await
            .map_err(|e| SessionError::Connect(e.to_string()))?;
        debug!("WebSocket handshake complete (HTTP {})", response.status());

        let (write, read) = ws.split();

        let sink = write
            .sink_map_err(|e| SessionError::Send(e.to_string()))
            .with(|text: String| future::ready(Ok::<_, SessionError>(Message::Text(text))));

        let stream = read.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => Some(Ok(text)),
                    Err(_) => {
                        debug!("Dropping non UTF-8 binary frame");
                        None
                    }
                },
                Ok(Message::Close(frame)) => Some(Err(SessionError::Closed(describe_close(frame)))),
                Ok(_) => None,
                Err(e) => Some(Err(SessionError::Receive(e.to_string()))),
            })
        });

        Ok(Link {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

fn describe_close(frame: Option<CloseFrame<'static>>) -> String {
    match frame {
        Some(frame) if frame.reason.is_empty() => format!("code {}", frame.code),
        Some(frame) => format!("code {} ({})", frame.code, frame.reason),
        None => "no close frame".to_string(),
    }
}
