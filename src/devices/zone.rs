// MIT License - Copyright (c) 2021 TJForc
// Zone status flags and zone entity

use async_trait::async_trait;
use bitflags::bitflags;
use tracing::{debug, warn};

use crate::constants::{Channel, ObjectClass};
use crate::devices::{channel_update, latches_entity, DeviceCommand, EntityCell};
use crate::error::Result;
use crate::event::PanelEvent;
use crate::listener::PanelStatusListener;
use crate::panel::AtsPanel;

bitflags! {
    /// Zone status flags reported by `returnSTAT.ZONE`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ZoneStatusFlags: u32 {
        const ACTIVE     = 1 << 0;
        const TAMPER     = 1 << 1;
        /// Anti-mask
        const AM         = 1 << 2;
        const BATT_FAIL  = 1 << 3;
        const FAULT      = 1 << 4;
        const DIRTY      = 1 << 5;
        /// Supervision short
        const SV_SHORT   = 1 << 6;
        /// Supervision long
        const SV_LONG    = 1 << 7;
        const INHIBIT    = 1 << 8;
        const ISOLATE    = 1 << 9;
        const SOAK       = 1 << 10;
        const SET        = 1 << 11;
        const ALARM      = 1 << 12;
        const LEARNED    = 1 << 13;
        const PRELEARNED = 1 << 14;
        const HELD_OPEN  = 1 << 15;
        /// Invalid walk test
        const INV_WT     = 1 << 16;
    }
}

/// Wire names of the zone flags.
const ZONE_FLAG_NAMES: [(&str, ZoneStatusFlags); 17] = [
    ("ZNEV_ACTIVE", ZoneStatusFlags::ACTIVE),
    ("ZNEV_TAMPER", ZoneStatusFlags::TAMPER),
    ("ZNEV_AM", ZoneStatusFlags::AM),
    ("ZNEV_BATTFAIL", ZoneStatusFlags::BATT_FAIL),
    ("ZNEV_FAULT", ZoneStatusFlags::FAULT),
    ("ZNEV_DIRTY", ZoneStatusFlags::DIRTY),
    ("ZNEV_SVSHORT", ZoneStatusFlags::SV_SHORT),
    ("ZNEV_SVLONG", ZoneStatusFlags::SV_LONG),
    ("ZNEV_INHIBIT", ZoneStatusFlags::INHIBIT),
    ("ZNEV_ISOLATE", ZoneStatusFlags::ISOLATE),
    ("ZNEV_SOAK", ZoneStatusFlags::SOAK),
    ("ZNEV_SET", ZoneStatusFlags::SET),
    ("ZNEV_ALARM", ZoneStatusFlags::ALARM),
    ("ZNEV_LEARNED", ZoneStatusFlags::LEARNED),
    ("ZNEV_PRELEARNED", ZoneStatusFlags::PRELEARNED),
    ("ZNEV_HELDOPEN", ZoneStatusFlags::HELD_OPEN),
    ("ZNEV_INVWT", ZoneStatusFlags::INV_WT),
];

impl ZoneStatusFlags {
    /// Build flags from the ids of true properties. Unknown ids are skipped.
    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        names
            .into_iter()
            .filter_map(|name| {
                ZONE_FLAG_NAMES
                    .iter()
                    .find(|(n, _)| *n == name)
                    .map(|(_, flag)| *flag)
            })
            .fold(Self::empty(), |acc, flag| acc | flag)
    }

    /// Wire names of the set flags, in table order.
    pub fn names(&self) -> Vec<&'static str> {
        ZONE_FLAG_NAMES
            .iter()
            .filter(|(_, flag)| self.contains(*flag))
            .map(|(name, _)| *name)
            .collect()
    }
}

/// Channels a zone publishes and the flag behind each.
const ZONE_CHANNELS: [(Channel, ZoneStatusFlags); 2] = [
    (Channel::Active, ZoneStatusFlags::ACTIVE),
    (Channel::Alarm, ZoneStatusFlags::ALARM),
];

/// A zone mirrored from the panel.
#[derive(Debug)]
pub struct Zone {
    number: u32,
    cell: EntityCell<ZoneStatusFlags>,
}

impl Zone {
    pub fn new(number: u32) -> Self {
        Self {
            number,
            cell: EntityCell::new(None, ZoneStatusFlags::empty()),
        }
    }

    /// Zone with a configured name; it will not be looked up on the panel.
    pub fn with_name(number: u32, name: impl Into<String>) -> Self {
        Self {
            number,
            cell: EntityCell::new(Some(name.into()), ZoneStatusFlags::empty()),
        }
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn name(&self) -> Option<String> {
        self.cell.with(|s| s.name.clone())
    }

    fn label(&self) -> String {
        self.name().unwrap_or_else(|| self.number.to_string())
    }

    pub fn is_online(&self) -> bool {
        self.cell.with(|s| s.online)
    }

    /// The panel refused a status fetch; further refreshes are skipped.
    pub fn in_error(&self) -> bool {
        self.cell.with(|s| s.in_error)
    }

    pub fn status(&self) -> ZoneStatusFlags {
        self.cell.with(|s| s.last)
    }

    pub fn previous_status(&self) -> ZoneStatusFlags {
        self.cell.with(|s| s.previous)
    }

    pub fn is_active(&self) -> bool {
        self.status().contains(ZoneStatusFlags::ACTIVE)
    }

    pub fn is_alarm(&self) -> bool {
        self.status().contains(ZoneStatusFlags::ALARM)
    }

    /// Zones accept only `Refresh`; channel switches are ignored.
    pub async fn handle_command(&self, panel: &AtsPanel, command: DeviceCommand) -> Result<bool> {
        match command {
            DeviceCommand::Refresh => {
                self.refresh(panel).await;
                Ok(true)
            }
            DeviceCommand::Switch { channel, .. } => {
                debug!("Zone {} ignores commands on channel {}", self.number, channel);
                Ok(false)
            }
        }
    }

    /// Fetch the current flags and publish channel updates.
    pub async fn refresh(&self, panel: &AtsPanel) {
        let (online, in_error) = self.cell.with(|s| (s.online, s.in_error));
        if !online {
            return;
        }
        if in_error {
            warn!("Zone '{}' is in an error state, do you have access?", self.label());
            return;
        }
        match panel.zone_status(self.number).await {
            Ok(status) => self.apply_status(panel, status),
            Err(e) if latches_entity(&e) => {
                warn!("Unable to fetch status of zone '{}': {}", self.label(), e);
                self.cell.with(|s| s.in_error = true);
            }
            Err(e) => debug!("Skipped status of zone '{}': {}", self.label(), e),
        }
    }

    pub(crate) fn apply_status(&self, panel: &AtsPanel, status: ZoneStatusFlags) {
        let (old, new) = self.cell.push_status(status);
        debug!(
            "Zone '{}' has changed status from {:?} to {:?}",
            self.label(),
            old.names(),
            new.names()
        );
        if old != new {
            panel.emit(PanelEvent::ZoneStatusChanged {
                zone_id: self.number,
                old_status: old,
                new_status: new,
                changed: old ^ new,
            });
        }
        for (channel, flag) in ZONE_CHANNELS {
            if let Some(on) = channel_update(old.contains(flag), new.contains(flag)) {
                panel.emit(PanelEvent::ChannelUpdate {
                    class: ObjectClass::Zone,
                    number: self.number,
                    channel,
                    on,
                });
            }
        }
    }

    async fn update_name(&self, panel: &AtsPanel) {
        if self.name().is_some() {
            return;
        }
        match panel.names_chunk(ObjectClass::Zone, self.number).await {
            Ok(chunk) => {
                if let Some(name) = chunk.first_name() {
                    self.cell.with(|s| s.name = Some(name.to_string()));
                    panel.emit(PanelEvent::NameResolved {
                        class: ObjectClass::Zone,
                        number: self.number,
                        name: name.to_string(),
                    });
                }
            }
            Err(e) => debug!("No name for zone {}: {}", self.number, e),
        }
    }

    fn set_online(&self, panel: &AtsPanel, online: bool) {
        let changed = self.cell.with(|s| std::mem::replace(&mut s.online, online) != online);
        if changed {
            panel.emit(PanelEvent::DeviceStatus {
                class: ObjectClass::Zone,
                number: self.number,
                online,
            });
        }
    }
}

#[async_trait]
impl PanelStatusListener for Zone {
    async fn on_bridge_connected(&self, panel: &AtsPanel) {
        self.set_online(panel, true);
        self.update_name(panel).await;
        self.refresh(panel).await;
    }

    async fn on_bridge_disconnected(&self, panel: &AtsPanel) {
        self.set_online(panel, false);
    }

    fn object(&self) -> Option<(ObjectClass, u32)> {
        Some((ObjectClass::Zone, self.number))
    }

    async fn on_changed_status(&self, panel: &AtsPanel) {
        self.refresh(panel).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_names() {
        let flags = ZoneStatusFlags::from_names(["ZNEV_ACTIVE", "ZNEV_ALARM", "BOGUS"]);
        assert_eq!(flags, ZoneStatusFlags::ACTIVE | ZoneStatusFlags::ALARM);
        assert_eq!(flags.names(), vec!["ZNEV_ACTIVE", "ZNEV_ALARM"]);
        assert_eq!(ZoneStatusFlags::from_names([]), ZoneStatusFlags::empty());
    }

    #[test]
    fn test_flag_table_is_complete() {
        let all = ZONE_FLAG_NAMES
            .iter()
            .fold(ZoneStatusFlags::empty(), |acc, (_, f)| acc | *f);
        assert_eq!(all, ZoneStatusFlags::all());
    }

    #[test]
    fn test_new_zone_is_offline() {
        let zone = Zone::with_name(4, "Hall");
        assert_eq!(zone.number(), 4);
        assert_eq!(zone.name().as_deref(), Some("Hall"));
        assert!(!zone.is_online());
        assert!(!zone.in_error());
        assert!(zone.status().is_empty());
        assert_eq!(zone.object(), Some((ObjectClass::Zone, 4)));
    }
}
