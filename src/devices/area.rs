// MIT License - Copyright (c) 2021 TJForc
// Area status flags and area entity

use async_trait::async_trait;
use bitflags::bitflags;
use tracing::{debug, info, warn};

use crate::constants::{Channel, ObjectClass};
use crate::devices::{channel_update, latches_entity, DeviceCommand, EntityCell};
use crate::error::Result;
use crate::event::PanelEvent;
use crate::listener::PanelStatusListener;
use crate::panel::AtsPanel;

bitflags! {
    /// Area status flags reported by `returnSTAT.AREA`.
    ///
    /// Prefixes: `FS` full set, `PS` part set, `US` unset, `FTC` fail to
    /// communicate.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AreaStatusFlags: u128 {
        const FULLSET      = 1 << 0;
        const PARTSET      = 1 << 1;
        const UNSET        = 1 << 2;
        const ALARM        = 1 << 3;
        const FSALARM      = 1 << 4;
        const PSALARM      = 1 << 5;
        const USALARM      = 1 << 6;
        const FTCALARM     = 1 << 7;
        const FIREDOOR     = 1 << 8;
        const FSFIREDOOR   = 1 << 9;
        const PSFIREDOOR   = 1 << 10;
        const USFIREDOOR   = 1 << 11;
        const FTCFIREDOOR  = 1 << 12;
        const FIRE         = 1 << 13;
        const FSFIRE       = 1 << 14;
        const PSFIRE       = 1 << 15;
        const USFIRE       = 1 << 16;
        const FTCFIRE      = 1 << 17;
        const PANIC        = 1 << 18;
        const FSPANIC      = 1 << 19;
        const PSPANIC      = 1 << 20;
        const USPANIC      = 1 << 21;
        const FTCPANIC     = 1 << 22;
        const MEDICAL      = 1 << 23;
        const FSMEDICAL    = 1 << 24;
        const PSMEDICAL    = 1 << 25;
        const USMEDICAL    = 1 << 26;
        const FTCMEDICAL   = 1 << 27;
        const TECHNICAL    = 1 << 28;
        const FSTECHNICAL  = 1 << 29;
        const PSTECHNICAL  = 1 << 30;
        const USTECHNICAL  = 1 << 31;
        const FTCTECHNICAL = 1 << 32;
        const TAMPER       = 1 << 33;
        const FSTAMPER     = 1 << 34;
        const PSTAMPER     = 1 << 35;
        const USTAMPER     = 1 << 36;
        const FTCTAMPER    = 1 << 37;
        const DOORBELL     = 1 << 38;
        const PSDOORBELL   = 1 << 39;
        const USDOORBELL   = 1 << 40;
        const ZNACTIVE     = 1 << 41;
        const ZNINHIBIT    = 1 << 42;
        const ZNISOLATE    = 1 << 43;
        const ZNFAULT      = 1 << 44;
        const ZNAM         = 1 << 45;
        const ZNTAMPER     = 1 << 46;
        const RASTAMPER    = 1 << 47;
        const RASFAULT     = 1 << 48;
        const DGPTAMPER    = 1 << 49;
        const DGPFAULT     = 1 << 50;
        const DURESS       = 1 << 51;
        const FSDURESS     = 1 << 52;
        const PSDURESS     = 1 << 53;
        const USDURESS     = 1 << 54;
        const FTCDURESS    = 1 << 55;
        const CODETAMPER   = 1 << 56;
        const ENTRY        = 1 << 57;
        const EXIT         = 1 << 58;
        const EXITFAULT    = 1 << 59;
        const RTS          = 1 << 60;
        const SETOK        = 1 << 61;
        const SETFAULT     = 1 << 62;
        const UNSETOK      = 1 << 63;
        const ALARMACK     = 1 << 64;
        const FIRERESET    = 1 << 65;
        const WALK         = 1 << 66;
        const WALKZNACTV   = 1 << 67;
        const AALARM       = 1 << 68;
        const BALARM       = 1 << 69;
        const ISIREN       = 1 << 70;
        const ESIREN       = 1 << 71;
        const STROBE       = 1 << 72;
        const BUZZER       = 1 << 73;
        const AMRESET      = 1 << 74;
        const PARTSET2     = 1 << 75;
        const WARNING      = 1 << 76;
        const AUTOARM      = 1 << 77;
        const HAALARM      = 1 << 78;
        const HBALARM      = 1 << 79;
    }
}

/// Wire names of the area flags.
const AREA_FLAG_NAMES: [(&str, AreaStatusFlags); 80] = [
    ("AREV_FULLSET", AreaStatusFlags::FULLSET),
    ("AREV_PARTSET", AreaStatusFlags::PARTSET),
    ("AREV_UNSET", AreaStatusFlags::UNSET),
    ("AREV_ALARM", AreaStatusFlags::ALARM),
    ("AREV_FSALARM", AreaStatusFlags::FSALARM),
    ("AREV_PSALARM", AreaStatusFlags::PSALARM),
    ("AREV_USALARM", AreaStatusFlags::USALARM),
    ("AREV_FTCALARM", AreaStatusFlags::FTCALARM),
    ("AREV_FIREDOOR", AreaStatusFlags::FIREDOOR),
    ("AREV_FSFIREDOOR", AreaStatusFlags::FSFIREDOOR),
    ("AREV_PSFIREDOOR", AreaStatusFlags::PSFIREDOOR),
    ("AREV_USFIREDOOR", AreaStatusFlags::USFIREDOOR),
    ("AREV_FTCFIREDOOR", AreaStatusFlags::FTCFIREDOOR),
    ("AREV_FIRE", AreaStatusFlags::FIRE),
    ("AREV_FSFIRE", AreaStatusFlags::FSFIRE),
    ("AREV_PSFIRE", AreaStatusFlags::PSFIRE),
    ("AREV_USFIRE", AreaStatusFlags::USFIRE),
    ("AREV_FTCFIRE", AreaStatusFlags::FTCFIRE),
    ("AREV_PANIC", AreaStatusFlags::PANIC),
    ("AREV_FSPANIC", AreaStatusFlags::FSPANIC),
    ("AREV_PSPANIC", AreaStatusFlags::PSPANIC),
    ("AREV_USPANIC", AreaStatusFlags::USPANIC),
    ("AREV_FTCPANIC", AreaStatusFlags::FTCPANIC),
    ("AREV_MEDICAL", AreaStatusFlags::MEDICAL),
    ("AREV_FSMEDICAL", AreaStatusFlags::FSMEDICAL),
    ("AREV_PSMEDICAL", AreaStatusFlags::PSMEDICAL),
    ("AREV_USMEDICAL", AreaStatusFlags::USMEDICAL),
    ("AREV_FTCMEDICAL", AreaStatusFlags::FTCMEDICAL),
    ("AREV_TECHNICAL", AreaStatusFlags::TECHNICAL),
    ("AREV_FSTECHNICAL", AreaStatusFlags::FSTECHNICAL),
    ("AREV_PSTECHNICAL", AreaStatusFlags::PSTECHNICAL),
    ("AREV_USTECHNICAL", AreaStatusFlags::USTECHNICAL),
    ("AREV_FTCTECHNICAL", AreaStatusFlags::FTCTECHNICAL),
    ("AREV_TAMPER", AreaStatusFlags::TAMPER),
    ("AREV_FSTAMPER", AreaStatusFlags::FSTAMPER),
    ("AREV_PSTAMPER", AreaStatusFlags::PSTAMPER),
    ("AREV_USTAMPER", AreaStatusFlags::USTAMPER),
    ("AREV_FTCTAMPER", AreaStatusFlags::FTCTAMPER),
    ("AREV_DOORBELL", AreaStatusFlags::DOORBELL),
    ("AREV_PSDOORBELL", AreaStatusFlags::PSDOORBELL),
    ("AREV_USDOORBELL", AreaStatusFlags::USDOORBELL),
    ("AREV_ZNACTIVE", AreaStatusFlags::ZNACTIVE),
    ("AREV_ZNINHIBIT", AreaStatusFlags::ZNINHIBIT),
    ("AREV_ZNISOLATE", AreaStatusFlags::ZNISOLATE),
    ("AREV_ZNFAULT", AreaStatusFlags::ZNFAULT),
    ("AREV_ZNAM", AreaStatusFlags::ZNAM),
    ("AREV_ZNTAMPER", AreaStatusFlags::ZNTAMPER),
    ("AREV_RASTAMPER", AreaStatusFlags::RASTAMPER),
    ("AREV_RASFAULT", AreaStatusFlags::RASFAULT),
    ("AREV_DGPTAMPER", AreaStatusFlags::DGPTAMPER),
    ("AREV_DGPFAULT", AreaStatusFlags::DGPFAULT),
    ("AREV_DURESS", AreaStatusFlags::DURESS),
    ("AREV_FSDURESS", AreaStatusFlags::FSDURESS),
    ("AREV_PSDURESS", AreaStatusFlags::PSDURESS),
    ("AREV_USDURESS", AreaStatusFlags::USDURESS),
    ("AREV_FTCDURESS", AreaStatusFlags::FTCDURESS),
    ("AREV_CODETAMPER", AreaStatusFlags::CODETAMPER),
    ("AREV_ENTRY", AreaStatusFlags::ENTRY),
    ("AREV_EXIT", AreaStatusFlags::EXIT),
    ("AREV_EXITFAULT", AreaStatusFlags::EXITFAULT),
    ("AREV_RTS", AreaStatusFlags::RTS),
    ("AREV_SETOK", AreaStatusFlags::SETOK),
    ("AREV_SETFAULT", AreaStatusFlags::SETFAULT),
    ("AREV_UNSETOK", AreaStatusFlags::UNSETOK),
    ("AREV_ALARMACK", AreaStatusFlags::ALARMACK),
    ("AREV_FIRERESET", AreaStatusFlags::FIRERESET),
    ("AREV_WALK", AreaStatusFlags::WALK),
    ("AREV_WALKZNACTV", AreaStatusFlags::WALKZNACTV),
    ("AREV_AALARM", AreaStatusFlags::AALARM),
    ("AREV_BALARM", AreaStatusFlags::BALARM),
    ("AREV_ISIREN", AreaStatusFlags::ISIREN),
    ("AREV_ESIREN", AreaStatusFlags::ESIREN),
    ("AREV_STROBE", AreaStatusFlags::STROBE),
    ("AREV_BUZZER", AreaStatusFlags::BUZZER),
    ("AREV_AMRESET", AreaStatusFlags::AMRESET),
    ("AREV_PARTSET2", AreaStatusFlags::PARTSET2),
    ("AREV_WARNING", AreaStatusFlags::WARNING),
    ("AREV_AUTOARM", AreaStatusFlags::AUTOARM),
    ("AREV_HAALARM", AreaStatusFlags::HAALARM),
    ("AREV_HBALARM", AreaStatusFlags::HBALARM),
];

impl AreaStatusFlags {
    /// Build flags from the ids of true properties. Unknown ids are skipped.
    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        names
            .into_iter()
            .filter_map(|name| {
                AREA_FLAG_NAMES
                    .iter()
                    .find(|(n, _)| *n == name)
                    .map(|(_, flag)| *flag)
            })
            .fold(Self::empty(), |acc, flag| acc | flag)
    }

    /// Wire names of the set flags, in table order.
    pub fn names(&self) -> Vec<&'static str> {
        AREA_FLAG_NAMES
            .iter()
            .filter(|(_, flag)| self.contains(*flag))
            .map(|(name, _)| *name)
            .collect()
    }
}

/// Channels an area publishes and the flag behind each.
const AREA_CHANNELS: [(Channel, AreaStatusFlags); 3] = [
    (Channel::Set, AreaStatusFlags::FULLSET),
    (Channel::Alarm, AreaStatusFlags::ALARM),
    (Channel::Exit, AreaStatusFlags::EXIT),
];

/// An area mirrored from the panel.
#[derive(Debug)]
pub struct Area {
    number: u32,
    cell: EntityCell<AreaStatusFlags>,
}

impl Area {
    pub fn new(number: u32) -> Self {
        Self {
            number,
            cell: EntityCell::new(None, AreaStatusFlags::empty()),
        }
    }

    /// Area with a configured name; it will not be looked up on the panel.
    pub fn with_name(number: u32, name: impl Into<String>) -> Self {
        Self {
            number,
            cell: EntityCell::new(Some(name.into()), AreaStatusFlags::empty()),
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

    /// The panel refused a status fetch; further refreshes are skipped until
    /// the process restarts.
    pub fn in_error(&self) -> bool {
        self.cell.with(|s| s.in_error)
    }

    pub fn status(&self) -> AreaStatusFlags {
        self.cell.with(|s| s.last)
    }

    pub fn previous_status(&self) -> AreaStatusFlags {
        self.cell.with(|s| s.previous)
    }

    pub fn is_set(&self) -> bool {
        self.status().contains(AreaStatusFlags::FULLSET)
    }

    pub fn is_alarm(&self) -> bool {
        self.status().contains(AreaStatusFlags::ALARM)
    }

    pub fn is_exit(&self) -> bool {
        self.status().contains(AreaStatusFlags::EXIT)
    }

    /// `Refresh` republishes status. Switching the `set` channel arms (on)
    /// or disarms (off) the area, then refreshes. Returns whether the panel
    /// accepted the command.
    pub async fn handle_command(&self, panel: &AtsPanel, command: DeviceCommand) -> Result<bool> {
        match command {
            DeviceCommand::Refresh => {
                self.refresh(panel).await;
                Ok(true)
            }
            DeviceCommand::Switch {
                channel: Channel::Set,
                on,
            } => {
                info!("{} area '{}'", if on { "Setting" } else { "Unsetting" }, self.label());
                let outcome = if on {
                    panel.set_area(self.number).await
                } else {
                    panel.unset_area(self.number).await
                };
                self.refresh(panel).await;
                outcome
            }
            DeviceCommand::Switch { channel, .. } => {
                debug!("Area {} ignores commands on channel {}", self.number, channel);
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
            warn!("Area '{}' is in an error state, do you have access?", self.label());
            return;
        }
        match panel.area_status(self.number).await {
            Ok(status) => self.apply_status(panel, status),
            Err(e) if latches_entity(&e) => {
                warn!("Unable to fetch status of area '{}': {}", self.label(), e);
                self.cell.with(|s| s.in_error = true);
            }
            Err(e) => debug!("Skipped status of area '{}': {}", self.label(), e),
        }
    }

    pub(crate) fn apply_status(&self, panel: &AtsPanel, status: AreaStatusFlags) {
        let (old, new) = self.cell.push_status(status);
        debug!(
            "Area '{}' has changed status from {:?} to {:?}",
            self.label(),
            old.names(),
            new.names()
        );
        if old != new {
            panel.emit(PanelEvent::AreaStatusChanged {
                area_id: self.number,
                old_status: old,
                new_status: new,
                changed: old ^ new,
            });
        }
        for (channel, flag) in AREA_CHANNELS {
            if let Some(on) = channel_update(old.contains(flag), new.contains(flag)) {
                panel.emit(PanelEvent::ChannelUpdate {
                    class: ObjectClass::Area,
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
        match panel.names_chunk(ObjectClass::Area, self.number).await {
            Ok(chunk) => {
                if let Some(name) = chunk.first_name() {
                    self.cell.with(|s| s.name = Some(name.to_string()));
                    panel.emit(PanelEvent::NameResolved {
                        class: ObjectClass::Area,
                        number: self.number,
                        name: name.to_string(),
                    });
                }
            }
            Err(e) => debug!("No name for area {}: {}", self.number, e),
        }
    }

    fn set_online(&self, panel: &AtsPanel, online: bool) {
        let changed = self.cell.with(|s| std::mem::replace(&mut s.online, online) != online);
        if changed {
            debug!("Area '{}' is now {}", self.label(), if online { "online" } else { "offline" });
            panel.emit(PanelEvent::DeviceStatus {
                class: ObjectClass::Area,
                number: self.number,
                online,
            });
        }
    }
}

#[async_trait]
impl PanelStatusListener for Area {
    async fn on_bridge_connected(&self, panel: &AtsPanel) {
        self.set_online(panel, true);
        self.update_name(panel).await;
        self.refresh(panel).await;
    }

    async fn on_bridge_disconnected(&self, panel: &AtsPanel) {
        self.set_online(panel, false);
    }

    fn object(&self) -> Option<(ObjectClass, u32)> {
        Some((ObjectClass::Area, self.number))
    }

    async fn on_changed_status(&self, panel: &AtsPanel) {
        self.refresh(panel).await;
    }
}
