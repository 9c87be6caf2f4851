//! Transport boundary. The engine only pushes tokens and lifecycle events;
//! what carries them (terminal, websocket) lives outside the crate.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::conversation::ResponseType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The user ended the session.
    Ended,
    /// The clock ran out.
    TimedOut,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Token(String),
    StreamComplete(ResponseType),
    Error(String),
    Closed(CloseReason),
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send_token(&self, token: &str) -> Result<()>;

    async fn stream_complete(&self, _response_type: ResponseType) -> Result<()> {
        Ok(())
    }

    async fn notify_error(&self, _message: &str) -> Result<()> {
        Ok(())
    }

    async fn notify_close(&self, reason: CloseReason) -> Result<()>;
}

/// Sink backed by an unbounded channel.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn push(&self, event: SessionEvent) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|_| anyhow!("session event receiver dropped"))
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn send_token(&self, token: &str) -> Result<()> {
        self.push(SessionEvent::Token(token.to_string()))
    }

    async fn stream_complete(&self, response_type: ResponseType) -> Result<()> {
        self.push(SessionEvent::StreamComplete(response_type))
    }

    async fn notify_error(&self, message: &str) -> Result<()> {
        self.push(SessionEvent::Error(message.to_string()))
    }

    async fn notify_close(&self, reason: CloseReason) -> Result<()> {
        self.push(SessionEvent::Closed(reason))
    }
}

/// Push `text` word by word, then mark the stream complete.
pub async fn stream_message(
    sink: &dyn EventSink,
    text: &str,
    response_type: ResponseType,
) -> Result<()> {
    for word in text.split_whitespace() {
        sink.send_token(&format!("{word} ")).await?;
    }
    sink.stream_complete(response_type).await
}
