// MIT License - Copyright (c) 2021 TJForc
// Newline-delimited JSON transport to the gateway

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::error::{AtsError, Result};
use crate::message::Message;
use crate::protocol::push_ack;
use crate::transport::{PanelTransport, TransportConnector};

const PUSH_CAPACITY: usize = 64;

/// One line on the wire. A response carries the id of the request (or push)
/// it answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Request { id: u64, message: Message },
    Response { id: u64, message: Message },
    Push { id: u64, message: Message },
    Heartbeat,
}

type PendingSlot = Arc<Mutex<Option<(u64, oneshot::Sender<Message>)>>>;

/// JSON lines over TCP. One request in flight; responses are routed to the
/// waiting caller by id and pushes to the push stream, each push acknowledged
/// with `return.bool`.
pub struct LineTransport {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    /// Id and sender of the single outstanding request
    pending: PendingSlot,
    /// Last request id handed out
    next_id: AtomicU64,
    /// Serializes requests
    send_lock: Mutex<()>,
    connected: Arc<AtomicBool>,
    push_rx: std::sync::Mutex<Option<mpsc::Receiver<Message>>>,
    request_timeout: Duration,
    reader_handle: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl LineTransport {
    pub async fn connect(addr: &str, request_timeout: Duration) -> Result<Self> {
        info!("Connecting to gateway at {}", addr);
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            error!("Gateway connect failed: {}", e);
            AtsError::Io(e)
        })?;
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();

        let writer = Arc::new(Mutex::new(writer));
        let pending: PendingSlot = Arc::new(Mutex::new(None));
        let connected = Arc::new(AtomicBool::new(true));
        let (push_tx, push_rx) = mpsc::channel(PUSH_CAPACITY);

        let reader_handle = spawn_reader_task(
            reader,
            writer.clone(),
            pending.clone(),
            connected.clone(),
            push_tx,
        );

        debug!("Gateway transport ready");
        Ok(Self {
            writer,
            pending,
            next_id: AtomicU64::new(0),
            send_lock: Mutex::new(()),
            connected,
            push_rx: std::sync::Mutex::new(Some(push_rx)),
            request_timeout,
            reader_handle: std::sync::Mutex::new(Some(reader_handle)),
        })
    }

    async fn write_frame(&self, frame: &Frame) -> Result<()> {
        write_frame(&self.writer, frame).await.inspect_err(|_| {
            self.connected.store(false, Ordering::SeqCst);
        })
    }
}

async fn write_frame(writer: &Mutex<OwnedWriteHalf>, frame: &Frame) -> Result<()> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    let mut writer = writer.lock().await;
    writer.write_all(line.as_bytes()).await.map_err(|e| {
        error!("Failed to write frame: {}", e);
        AtsError::Io(e)
    })?;
    writer.flush().await?;
    Ok(())
}

#[async_trait]
impl PanelTransport for LineTransport {
    async fn send(&self, request: Message) -> Result<Message> {
        let _in_flight = self.send_lock.lock().await;
        if !self.connected.load(Ordering::SeqCst) {
            return Err(AtsError::Disconnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        *self.pending.lock().await = Some((id, tx));

        let name = request.name.clone();
        let frame = Frame::Request {
            id,
            message: request,
        };
        if let Err(e) = self.write_frame(&frame).await {
            self.pending.lock().await.take();
            return Err(e);
        }

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(AtsError::ChannelClosed),
            Err(_) => {
                self.pending.lock().await.take();
                debug!("Request timeout: {} (id {})", name, id);
                Err(AtsError::Timeout { request: name })
            }
        }
    }

    async fn heartbeat(&self) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(AtsError::Disconnected);
        }
        self.write_frame(&Frame::Heartbeat).await
    }

    fn take_push_stream(&self) -> Option<mpsc::Receiver<Message>> {
        self.push_rx.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let handle = self
            .reader_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(h) = handle {
            h.abort();
        }
        let _ = self.writer.lock().await.shutdown().await;
        self.pending.lock().await.take();
    }
}

impl Drop for LineTransport {
    fn drop(&mut self) {
        if let Some(h) = self
            .reader_handle
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            h.abort();
        }
    }
}

/// Spawn the reader task that routes incoming frames.
fn spawn_reader_task(
    reader: OwnedReadHalf,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    pending: PendingSlot,
    connected: Arc<AtomicBool>,
    push_tx: mpsc::Sender<Message>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Frame>(&line) {
                        Ok(frame) => route_frame(frame, &writer, &pending, &push_tx).await,
                        Err(e) => warn!("Discarding malformed frame: {} ({})", line, e),
                    }
                }
                Ok(None) => {
                    debug!("Reader: gateway closed the connection");
                    break;
                }
                Err(e) => {
                    error!("Reader: read error: {}", e);
                    break;
                }
            }
        }
        connected.store(false, Ordering::SeqCst);
        // Wake the waiting caller with ChannelClosed
        pending.lock().await.take();
    })
}

async fn route_frame(
    frame: Frame,
    writer: &Mutex<OwnedWriteHalf>,
    pending: &PendingSlot,
    push_tx: &mpsc::Sender<Message>,
) {
    match frame {
        Frame::Response { id, message } => {
            let mut slot = pending.lock().await;
            match slot.take() {
                Some((expected, tx)) if expected == id => {
                    let _ = tx.send(message);
                }
                Some(other) => {
                    warn!(
                        "Discarding stale response {} ({}), waiting for {}",
                        id, message.name, other.0
                    );
                    *slot = Some(other);
                }
                None => warn!("Unsolicited response from gateway: {} ({})", id, message.name),
            }
        }
        Frame::Push { id, message } => {
            debug!("Push from gateway: {}", message.name);
            let ack = Frame::Response {
                id,
                message: push_ack(),
            };
            if let Err(e) = write_frame(writer, &ack).await {
                warn!("Failed to acknowledge push: {}", e);
            }
            match push_tx.try_send(message) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(m)) => {
                    warn!("Push stream full, dropping {}", m.name)
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        Frame::Heartbeat => debug!("Gateway heartbeat"),
        Frame::Request { message, .. } => {
            debug!("Ignoring request from gateway: {}", message.name)
        }
    }
}

/// Connects [`LineTransport`]s to `gateway_host:gateway_port`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineConnector;

#[async_trait]
impl TransportConnector for LineConnector {
    async fn connect(&self, config: &BridgeConfig) -> Result<Arc<dyn PanelTransport>> {
        let transport = LineTransport::connect(
            &config.gateway_address(),
            Duration::from_millis(config.request_timeout_ms),
        )
        .await?;
        Ok(Arc::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    async fn write_line(stream: &mut OwnedWriteHalf, frame: &Frame) {
        let mut line = serde_json::to_string(frame).unwrap();
        line.push('\n');
        stream.write_all(line.as_bytes()).await.unwrap();
    }

    fn response(id: u64, name: &str) -> Frame {
        Frame::Response {
            id,
            message: Message::new(name),
        }
    }

    #[test]
    fn test_frame_shape() {
        let json = serde_json::to_string(&Frame::Heartbeat).unwrap();
        assert_eq!(json, r#"{"type":"heartbeat"}"#);
        let frame: Frame = serde_json::from_str(
            r#"{"type":"push","id":7,"message":{"name":"msg.error","properties":[]}}"#,
        )
        .unwrap();
        assert_eq!(
            frame,
            Frame::Push {
                id: 7,
                message: Message::new("msg.error")
            }
        );
    }

    #[tokio::test]
    async fn test_request_response_with_interleaved_push() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let gateway = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();

            let line = lines.next_line().await.unwrap().unwrap();
            let frame: Frame = serde_json::from_str(&line).unwrap();
            assert_eq!(
                frame,
                Frame::Request {
                    id: 1,
                    message: Message::new("is.Alive")
                }
            );

            let push = Frame::Push {
                id: 900,
                message: Message::new("msgCOS.ALL"),
            };
            write_line(&mut write, &push).await;
            let ack = lines.next_line().await.unwrap().unwrap();
            let ack: Frame = serde_json::from_str(&ack).unwrap();
            assert_eq!(
                ack,
                Frame::Response {
                    id: 900,
                    message: push_ack()
                }
            );

            write_line(&mut write, &response(1, "return.void")).await;
        });

        let transport = LineTransport::connect(&addr, Duration::from_secs(5)).await.unwrap();
        let mut pushes = transport.take_push_stream().unwrap();
        assert!(transport.take_push_stream().is_none());

        let response = transport.send(Message::new("is.Alive")).await.unwrap();
        assert_eq!(response.name, "return.void");
        let push = pushes.recv().await.unwrap();
        assert_eq!(push.name, "msgCOS.ALL");
        gateway.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let _gateway = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let transport = LineTransport::connect(&addr, Duration::from_millis(50)).await.unwrap();
        let err = transport.send(Message::new("is.Alive")).await.unwrap_err();
        assert!(matches!(err, AtsError::Timeout { ref request } if request == "is.Alive"));
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_late_response_is_not_delivered_to_next_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let gateway = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();

            // First request is left unanswered until the second one arrives
            let _first = lines.next_line().await.unwrap().unwrap();
            let second = lines.next_line().await.unwrap().unwrap();
            let second: Frame = serde_json::from_str(&second).unwrap();
            assert!(matches!(second, Frame::Request { id: 2, .. }));

            write_line(&mut write, &response(1, "return.stale")).await;
            write_line(&mut write, &response(2, "return.void")).await;
        });

        let transport = LineTransport::connect(&addr, Duration::from_millis(100)).await.unwrap();
        let err = transport.send(Message::new("getSTAT.ZONE")).await.unwrap_err();
        assert!(matches!(err, AtsError::Timeout { .. }));

        let reply = transport.send(Message::new("device.disconnect")).await.unwrap();
        assert_eq!(reply.name, "return.void");
        gateway.await.unwrap();
    }

    #[tokio::test]
    async fn test_gateway_close_disconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let gateway = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, _write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            let _ = lines.next_line().await;
        });

        let transport = LineTransport::connect(&addr, Duration::from_secs(5)).await.unwrap();
        let err = transport.send(Message::new("is.Alive")).await.unwrap_err();
        assert!(matches!(err, AtsError::ChannelClosed));
        gateway.await.unwrap();
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.send(Message::new("is.Alive")).await,
            Err(AtsError::Disconnected)
        ));
    }
}
