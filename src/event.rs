// MIT License - Copyright (c) 2021 TJForc
// Panel events broadcast to subscribers

use crate::constants::{Channel, ObjectClass};
use crate::devices::{area::AreaStatusFlags, zone::ZoneStatusFlags};

/// All events that can be emitted by the panel.
///
/// Users subscribe via `panel.subscribe()` to receive a
/// `tokio::sync::broadcast::Receiver<PanelEvent>`.
#[derive(Debug, Clone, PartialEq)]
pub enum PanelEvent {
    /// Bridge went online (all bring-up gates set) or offline
    BridgeStatus { online: bool },
    /// A zone or area followed the bridge online or offline
    DeviceStatus {
        class: ObjectClass,
        number: u32,
        online: bool,
    },
    /// Value published on a zone or area channel
    ChannelUpdate {
        class: ObjectClass,
        number: u32,
        channel: Channel,
        on: bool,
    },
    ZoneStatusChanged {
        zone_id: u32,
        old_status: ZoneStatusFlags,
        new_status: ZoneStatusFlags,
        changed: ZoneStatusFlags,
    },
    AreaStatusChanged {
        area_id: u32,
        old_status: AreaStatusFlags,
        new_status: AreaStatusFlags,
        changed: AreaStatusFlags,
    },
    /// Latest monitor line, formatted
    Monitor { text: String },
    /// Name fetched from the panel for an entity without a configured name
    NameResolved {
        class: ObjectClass,
        number: u32,
        name: String,
    },
}

/// Type alias for the broadcast sender.
pub type EventSender = tokio::sync::broadcast::Sender<PanelEvent>;

/// Type alias for the broadcast receiver.
pub type EventReceiver = tokio::sync::broadcast::Receiver<PanelEvent>;

/// Create a new event channel with the given capacity.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    tokio::sync::broadcast::channel(capacity)
}
