// MIT License - Copyright (c) 2021 TJForc
// Panel bridge: shared state, request plumbing and error policy

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::constants::{FATAL_ERROR_MARKERS, LOGOUT_CLEARS_SESSION_MARKERS};
use crate::error::{AtsError, Result};
use crate::event::{event_channel, EventReceiver, EventSender, PanelEvent};
use crate::gateway::{ExternalGateway, GatewayProcess};
use crate::listener::{ListenerId, ListenerRegistry, PanelStatusListener};
use crate::message::Message;
use crate::protocol::Request;
use crate::state::{ConnectionSnapshot, ConnectionState};
use crate::transport::{LineConnector, PanelTransport, TransportConnector};

/// Whether an error text means the gateway lost its link to the panel.
pub fn is_fatal_error(text: &str) -> bool {
    FATAL_ERROR_MARKERS.iter().any(|marker| text.contains(marker))
}

pub(crate) struct PanelInner {
    pub config: BridgeConfig,
    pub gateway: Arc<dyn GatewayProcess>,
    pub connector: Arc<dyn TransportConnector>,
    pub transport: RwLock<Option<Arc<dyn PanelTransport>>>,
    pub state: ConnectionState,
    pub listeners: ListenerRegistry,
    pub events: EventSender,
    /// Held while a fatal error is being handled
    pub handling_error: AtomicBool,
    /// At most one control session at a time
    pub session_lock: Mutex<()>,
    /// At most one bring-up pass at a time
    pub bring_up_lock: Mutex<()>,
    pub tasks: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
    pub push_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    pub shutting_down: AtomicBool,
}

/// Bridge to one ATS Advanced panel behind its gateway.
///
/// Cheap to clone; all clones share the same connection.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use ats_advanced_bridge::{AtsPanel, BridgeConfig, Area};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = BridgeConfig::builder()
///         .panel_host("192.168.0.100")
///         .user_pin("1234")
///         .build();
///
///     let panel = AtsPanel::with_external_gateway(config);
///     panel.register_listener(Arc::new(Area::new(1)));
///
///     let mut events = panel.subscribe();
///     tokio::spawn(async move {
///         while let Ok(event) = events.recv().await {
///             println!("Event: {:?}", event);
///         }
///     });
///
///     panel.start();
///     tokio::signal::ctrl_c().await?;
///     panel.shutdown().await;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct AtsPanel {
    pub(crate) inner: Arc<PanelInner>,
}

impl AtsPanel {
    pub fn new(
        config: BridgeConfig,
        gateway: Arc<dyn GatewayProcess>,
        connector: Arc<dyn TransportConnector>,
    ) -> Self {
        let (events, _) = event_channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(PanelInner {
                config,
                gateway,
                connector,
                transport: RwLock::new(None),
                state: ConnectionState::new(),
                listeners: ListenerRegistry::new(),
                events,
                handling_error: AtomicBool::new(false),
                session_lock: Mutex::new(()),
                bring_up_lock: Mutex::new(()),
                tasks: std::sync::Mutex::new(Vec::new()),
                push_task: std::sync::Mutex::new(None),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Bridge that launches the gateway as a child process and talks to it
    /// over the line transport.
    pub fn with_external_gateway(config: BridgeConfig) -> Self {
        let gateway = Arc::new(ExternalGateway::new(config.gateway.clone(), config.gateway_port));
        Self::new(config, gateway, Arc::new(LineConnector))
    }

    pub(crate) fn downgrade(&self) -> Weak<PanelInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<PanelInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Subscribe to panel events.
    pub fn subscribe(&self) -> EventReceiver {
        self.inner.events.subscribe()
    }

    pub(crate) fn emit(&self, event: PanelEvent) {
        let _ = self.inner.events.send(event);
    }

    pub fn is_online(&self) -> bool {
        self.inner.state.is_online()
    }

    pub fn connection(&self) -> ConnectionSnapshot {
        self.inner.state.snapshot()
    }

    /// Last error text reported by the panel or the transport.
    pub fn last_error(&self) -> Option<String> {
        self.inner.state.last_error()
    }

    pub fn register_listener(&self, listener: Arc<dyn PanelStatusListener>) -> ListenerId {
        self.inner.listeners.register(listener)
    }

    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.unregister(id)
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    pub(crate) fn transport(&self) -> Option<Arc<dyn PanelTransport>> {
        self.inner
            .transport
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn install_transport(&self, transport: Arc<dyn PanelTransport>) {
        *self.inner.transport.write().unwrap_or_else(|e| e.into_inner()) = Some(transport);
    }

    fn take_transport(&self) -> Option<Arc<dyn PanelTransport>> {
        self.inner
            .transport
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    // --- Request plumbing ---

    /// Send a request. A `return.error` response becomes
    /// [`AtsError::Panel`]. No error policy is applied.
    pub(crate) async fn exchange(&self, request: Request) -> Result<Message> {
        let transport = self.transport().ok_or(AtsError::Disconnected)?;
        let message = request.to_message();
        debug!("Sending {}", message);
        let response = transport.send(message).await?;
        debug!("Received {}", response);
        if response.is_error() {
            return Err(AtsError::Panel(response.error_text()));
        }
        Ok(response)
    }

    /// Send a request and run the error policy on failure. Nothing is run
    /// when the connection is already torn down.
    pub(crate) async fn call(&self, request: Request) -> Result<Message> {
        match self.exchange(request).await {
            Ok(response) => Ok(response),
            Err(AtsError::Disconnected) if self.transport().is_none() => Err(AtsError::Disconnected),
            Err(e) => {
                self.recover(&e).await;
                Err(e)
            }
        }
    }

    /// Run the error policy for `err`. Transport faults are always fatal.
    pub(crate) async fn recover(&self, err: &AtsError) -> bool {
        self.apply_error_policy(&err.panel_text(), err.is_transport())
            .await
    }

    /// Run the error policy for an error text reported by the panel.
    ///
    /// Texts matching a fatal marker force a logout and a full disconnect.
    /// Returns whether a disconnect was forced. Errors arriving while a
    /// disconnect is in progress are ignored.
    pub async fn handle_error(&self, text: &str) -> bool {
        self.apply_error_policy(text, false).await
    }

    async fn apply_error_policy(&self, text: &str, force_fatal: bool) -> bool {
        if self.inner.handling_error.load(Ordering::SeqCst) {
            debug!("Ignoring error raised during recovery: {}", text);
            return false;
        }
        self.inner.state.set_last_error(text);

        if !force_fatal && !is_fatal_error(text) {
            warn!("Panel reported an error: {}", text);
            return false;
        }
        let Some(_recovering) = RecoveryGuard::acquire(&self.inner.handling_error) else {
            return false;
        };

        error!("Lost the connection to the panel: {}", text);
        if let Err(e) = self.send_logout().await {
            debug!("Logout during recovery failed: {}", e);
        }
        self.connection_lost().await;
        true
    }

    /// Log the user out of the panel and tear the connection down.
    ///
    /// An error after which the panel session is gone anyway still tears
    /// down; any other error leaves the connection as it is. Does not apply
    /// the error policy.
    pub async fn logout(&self) -> Result<()> {
        match self.send_logout().await {
            Ok(()) => {
                self.connection_lost().await;
                Ok(())
            }
            Err(e) => {
                let text = e.panel_text();
                if LOGOUT_CLEARS_SESSION_MARKERS
                    .iter()
                    .any(|marker| text.contains(marker))
                {
                    self.connection_lost().await;
                }
                Err(e)
            }
        }
    }

    /// Send `device.disconnect` only. Callers follow up with
    /// [`AtsPanel::connection_lost`].
    pub(crate) async fn send_logout(&self) -> Result<()> {
        info!("Logging out of the panel");
        self.exchange(Request::Logout).await.map(|_| ())
    }

    /// Tear the connection down: drop the transport, clear every gate, go
    /// offline, then notify listeners in registration order.
    ///
    /// The push pump may be the caller, so it is left to notice the new
    /// generation and stop by itself.
    pub(crate) async fn connection_lost(&self) {
        if let Some(transport) = self.take_transport() {
            transport.close().await;
        }

        let was_online = self.inner.state.is_online();
        self.inner.state.reset_all();
        info!("Connection to the panel is down");
        if was_online {
            self.emit(PanelEvent::BridgeStatus { online: false });
        }

        for listener in self.inner.listeners.snapshot() {
            listener.on_bridge_disconnected(self).await;
        }
    }
}

/// Holds the recovery flag; releases it when dropped, including when the
/// recovering task is aborted.
struct RecoveryGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> RecoveryGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for RecoveryGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}
