// MIT License - Copyright (c) 2021 TJForc
// Message channel between the bridge and the gateway

pub mod line;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::BridgeConfig;
use crate::error::Result;
use crate::message::Message;

pub use line::{LineConnector, LineTransport};

/// Request/response exchange with the gateway plus its push stream.
///
/// Implementations allow one request in flight at a time. Pushes may arrive
/// while a request is outstanding and are delivered on the stream returned
/// by [`PanelTransport::take_push_stream`].
#[async_trait]
pub trait PanelTransport: Send + Sync {
    /// Send a request and wait for the matching response.
    ///
    /// A `return.error` response is still a response: it comes back as
    /// `Ok`. `Err` means the exchange itself failed.
    async fn send(&self, request: Message) -> Result<Message>;

    /// Keep the channel alive. No-op for transports without heartbeats.
    async fn heartbeat(&self) -> Result<()>;

    /// Hand out the push stream. Only the first caller gets it.
    fn take_push_stream(&self) -> Option<mpsc::Receiver<Message>>;

    fn is_connected(&self) -> bool;

    async fn close(&self);
}

/// Opens transports to the gateway on behalf of the bring-up sequence.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self, config: &BridgeConfig) -> Result<Arc<dyn PanelTransport>>;
}
