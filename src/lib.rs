// MIT License - Copyright (c) 2021 TJForc
// Control-session engine for ATS Advanced alarm panels
//
//! # ats-advanced-bridge
//!
//! Drives an ATS Advanced alarm panel through the ATS gateway process:
//! bring-up of the panel connection, arming and disarming areas through
//! remote control sessions, change-of-state reconciliation for zones and
//! areas, and monitor log ingestion.
//!
//! The gateway speaks the panel's native protocol and exposes it as named
//! request/response messages ([`Message`]). Everything in this crate is
//! expressed in terms of those messages, so the transport behind
//! [`PanelTransport`] can be swapped.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use ats_advanced_bridge::{AtsPanel, BridgeConfig, Area, Zone};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = BridgeConfig::builder()
//!         .panel_host("192.168.0.100")
//!         .user_pin("1234")
//!         .build();
//!
//!     let panel = AtsPanel::with_external_gateway(config);
//!     let area = Arc::new(Area::new(1));
//!     panel.register_listener(area.clone());
//!     panel.register_listener(Arc::new(Zone::new(3)));
//!
//!     let mut events = panel.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     panel.start();
//!     // ... once online:
//!     panel.set_area(1).await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     panel.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod constants;
pub mod devices;
pub mod error;
pub mod event;
pub mod gateway;
pub mod listener;
pub mod message;
pub mod monitor;
pub mod panel;
pub mod protocol;
pub mod reconcile;
pub mod sequencer;
pub mod session;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use config::{BridgeConfig, BridgeConfigBuilder, GatewayConfig, PollPolicy, TransportMode};
pub use constants::{Channel, ControlSessionState, ObjectClass};
pub use devices::area::{Area, AreaStatusFlags};
pub use devices::zone::{Zone, ZoneStatusFlags};
pub use devices::DeviceCommand;
pub use error::{AtsError, Result};
pub use event::{EventReceiver, PanelEvent};
pub use gateway::{ExternalGateway, GatewayProcess};
pub use listener::{ListenerId, PanelStatusListener};
pub use message::{Message, Property, Value};
pub use monitor::MonitorEntry;
pub use panel::AtsPanel;
pub use protocol::Request;
pub use reconcile::DiscoveredObject;
pub use state::{ConnectionSnapshot, Gates};
pub use transport::{PanelTransport, TransportConnector};
