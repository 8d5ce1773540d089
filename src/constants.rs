// MIT License - Copyright (c) 2021 TJForc
// ATS Advanced panel constants

use std::fmt;

/// Highest zone number addressable on an ATS Advanced panel.
pub const MAX_NUMBER_ZONES: u32 = 368;
/// Highest area number addressable on an ATS Advanced panel.
pub const MAX_NUMBER_AREAS: u32 = 8;

/// Request and response message names exchanged with the gateway.
pub mod msg {
    // Bring-up
    pub const CONFIGURE_PANEL: &str = "configure.PANEL";
    pub const LOGIN: &str = "device.getConnect";
    pub const LOGOUT: &str = "device.disconnect";
    pub const START_MONITOR: &str = "start.MONITOR";
    pub const OPEN_LOG: &str = "open.LOG";
    pub const IS_ALIVE: &str = "is.Alive";
    pub const GET_PRIVILEGES: &str = "get.privileges";

    // Status and change of state
    pub const GET_STAT_ZONE: &str = "getSTAT.ZONE";
    pub const GET_STAT_AREA: &str = "getSTAT.AREA";
    pub const RETURN_STAT_ZONE: &str = "returnSTAT.ZONE";
    pub const RETURN_STAT_AREA: &str = "returnSTAT.AREA";
    pub const GET_COS_ZONE: &str = "getCOS.ZONE";
    pub const GET_COS_AREA: &str = "getCOS.AREA";
    pub const RETURN_COS_ZONE: &str = "returnCOS.ZONE";
    pub const RETURN_COS_AREA: &str = "returnCOS.AREA";
    pub const SELECT_ZONE_NAMES: &str = "select.ZoneNames";
    pub const SELECT_AREA_NAMES: &str = "select.AreaNames";
    pub const RETURN_ZONE_NAMES: &str = "return.ZoneNames";
    pub const RETURN_AREA_NAMES: &str = "return.AreaNames";
    pub const GET_LIVE_EVENTS: &str = "get.liveEvents";

    // Control sessions
    pub const CREATE_SET_SESSION: &str = "createCC.A_SET";
    pub const CREATE_UNSET_SESSION: &str = "createCC.A_UNSET";
    pub const SESSION_STATE: &str = "statusCC.SESSION";
    pub const SET_AREAS: &str = "fnCC.A_SET_SETAREAS";
    pub const GET_FAULTS: &str = "fnCC.A_SET_GETFAULT";
    pub const INHIBIT_FAULT: &str = "fnCC.A_SET_INHFAULT";
    pub const GET_ACTIVE: &str = "fnCC.A_SET_GETACTIVE";
    pub const INHIBIT_ACTIVE: &str = "fnCC.A_SET_INHACTIVE";
    pub const UNSET_AREAS: &str = "fnCC.A_UNSET_UNSETAREAS";
    pub const UNSET_SKIP: &str = "fnCC.A_UNSET_SKIP";
    pub const DESTROY_SESSION: &str = "destroyCC.SESSION";

    // Generic responses
    pub const RETURN_ERROR: &str = "return.error";
    pub const RETURN_VOID: &str = "return.void";
    pub const RETURN_BOOL: &str = "return.bool";
    pub const RETURN_SYSEVENT: &str = "return.sysevent";

    // Pushed by the gateway
    pub const PUSH_ERROR: &str = "msg.error";
    pub const PUSH_COS: &str = "msgCOS.ALL";
    pub const PUSH_MONITOR: &str = "msg.MONITOR";
}

/// Property identifiers used in message bodies.
pub mod prop {
    pub const OBJECT_ID: &str = "objectID";
    pub const RESULT: &str = "result";
    pub const SESSION_ID: &str = "sessionID";
    pub const STATE_ID: &str = "stateID";
    pub const NEXT: &str = "next";
    pub const EVENT_UNIQUE_ID: &str = "eventUniqueID";
    pub const BIT_SET: &str = "bitSet";
    pub const INDEX: &str = "index";
    pub const NAME: &str = "name";
    pub const AREA_ID: &str = "areaID";
    pub const USER_PIN: &str = "userPIN";

    pub const HOST_ADDRESS: &str = "hostaddress";
    pub const PORT: &str = "port";
    pub const PASSWORD: &str = "password";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const RETRIES: &str = "retries";
    pub const TIMEOUT: &str = "timeout";

    pub const APPOBJ_ZONE: &str = "APPOBJ_ZN";
    pub const APPOBJ_AREA: &str = "APPOBJ_AREA";

    pub const TIMESTAMP: &str = "timeStamp";
    pub const UNIQUE_ID: &str = "unique_id";
    pub const EVENT_ID: &str = "event_ID";
    pub const EVENT_SOURCE: &str = "event_source";
    pub const SOURCE_ID: &str = "source_ID";
    pub const AREA: &str = "Area";
    pub const EVENT_TEXT: &str = "event_text";
}

/// Capabilities requested at login, in the order the panel expects them.
pub const LOGIN_ACTIONS: [(&str, &str); 6] = [
    ("userAction_LOGREAD", "1"),
    ("userAction_CTRL", "1"),
    ("userAction_MONITOR", "1"),
    ("userAction_DIAG", "1"),
    ("userAction_UPLOAD", "0"),
    ("userAction_DOWNLOAD", "0"),
];

/// Event categories requested when paging live events.
pub const LIVE_EVENT_CATEGORIES: [&str; 11] = [
    "evCatFAULT",
    "evCatMAINS",
    "evCatACTZN",
    "evCatACT24H",
    "evCatACTLCD",
    "evCatACTDEV",
    "evCatALARMS_NCNF",
    "evCatFAULTS_CNF",
    "evCatWALK_REQ",
    "evCatWALK_OK",
    "evCatSYSTEM",
];

/// Error text substrings that mean the gateway lost its panel link.
pub const FATAL_ERROR_MARKERS: [&str; 4] = [
    "Connection refused",
    "The socket has been shut down",
    "Connection reset by peer",
    "Object reference not set to an instance of an object",
];

/// Logout errors after which the panel session is gone anyway.
pub const LOGOUT_CLEARS_SESSION_MARKERS: [&str; 2] = [
    "FAULT_NO_ACCESS",
    "Object reference not set to an instance of an object",
];

/// Reported when a set session is refused because areas are in another state.
pub const BUSY_AREAS_MARKER: &str = "FAULT_CC_BUSY_AREAS";

/// Kind of panel object addressed by index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectClass {
    Zone,
    Area,
}

impl ObjectClass {
    /// Highest valid 1-based index for this class.
    pub fn capacity(&self) -> u32 {
        match self {
            Self::Zone => MAX_NUMBER_ZONES,
            Self::Area => MAX_NUMBER_AREAS,
        }
    }

    pub fn status_request(&self) -> &'static str {
        match self {
            Self::Zone => msg::GET_STAT_ZONE,
            Self::Area => msg::GET_STAT_AREA,
        }
    }

    pub fn status_response(&self) -> &'static str {
        match self {
            Self::Zone => msg::RETURN_STAT_ZONE,
            Self::Area => msg::RETURN_STAT_AREA,
        }
    }

    pub fn changed_request(&self) -> &'static str {
        match self {
            Self::Zone => msg::GET_COS_ZONE,
            Self::Area => msg::GET_COS_AREA,
        }
    }

    pub fn changed_response(&self) -> &'static str {
        match self {
            Self::Zone => msg::RETURN_COS_ZONE,
            Self::Area => msg::RETURN_COS_AREA,
        }
    }

    pub fn names_request(&self) -> &'static str {
        match self {
            Self::Zone => msg::SELECT_ZONE_NAMES,
            Self::Area => msg::SELECT_AREA_NAMES,
        }
    }

    pub fn names_response(&self) -> &'static str {
        match self {
            Self::Zone => msg::RETURN_ZONE_NAMES,
            Self::Area => msg::RETURN_AREA_NAMES,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Zone => "zone",
            Self::Area => "area",
        }
    }
}

impl fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channels a zone or area publishes state on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Zone active
    Active,
    /// Zone or area in alarm
    Alarm,
    /// Area fully set
    Set,
    /// Area exit timer running
    Exit,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Alarm => "alarm",
            Self::Set => "set",
            Self::Exit => "exit",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote control-session states reported by `statusCC.SESSION`.
///
/// Codes outside the known table map to [`ControlSessionState::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlSessionState {
    Unknown,
    // Confirm alarms
    CcReady,
    CcCnfAlarms,
    CcConfirmed,
    // Unset
    UcReady,
    UcUnsetting,
    UcCnfAlarms,
    UcCnfFaults,
    UcUnset,
    // Full set
    FcReady,
    FcFaults,
    FcActiveStates,
    FcInhibited,
    FcSetting,
    FcSet,
    // Set, secondary codes
    ScFaults,
    ScActiveStates,
    ScSetting,
}

const SESSION_STATE_CODES: [(i64, ControlSessionState); 18] = [
    (0, ControlSessionState::Unknown),
    (256, ControlSessionState::CcReady),
    (257, ControlSessionState::CcCnfAlarms),
    (258, ControlSessionState::CcConfirmed),
    (768, ControlSessionState::UcReady),
    (769, ControlSessionState::UcUnsetting),
    (770, ControlSessionState::UcCnfAlarms),
    (771, ControlSessionState::UcCnfFaults),
    (772, ControlSessionState::UcUnset),
    (1280, ControlSessionState::FcReady),
    (1281, ControlSessionState::FcFaults),
    (1282, ControlSessionState::FcActiveStates),
    (1283, ControlSessionState::FcInhibited),
    (1284, ControlSessionState::FcSetting),
    (1285, ControlSessionState::FcSet),
    (63000, ControlSessionState::ScFaults),
    (63001, ControlSessionState::ScActiveStates),
    (63002, ControlSessionState::ScSetting),
];

impl ControlSessionState {
    pub fn from_code(code: i64) -> Self {
        SESSION_STATE_CODES
            .iter()
            .find(|(c, _)| *c == code)
            .map_or(Self::Unknown, |(_, state)| *state)
    }

    pub fn code(&self) -> i64 {
        SESSION_STATE_CODES
            .iter()
            .find(|(_, s)| s == self)
            .map_or(0, |(c, _)| *c)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "CSMS_UNKNOWN",
            Self::CcReady => "CSMS_CC_Ready",
            Self::CcCnfAlarms => "CSMS_CC_CnfAlarms",
            Self::CcConfirmed => "CSMS_CC_Confirmed",
            Self::UcReady => "CSMS_UC_Ready",
            Self::UcUnsetting => "CSMS_UC_Unsetting",
            Self::UcCnfAlarms => "CSMS_UC_CnfAlarms",
            Self::UcCnfFaults => "CSMS_UC_CnfFaults",
            Self::UcUnset => "CSMS_UC_Unset",
            Self::FcReady => "CSMS_FC_Ready",
            Self::FcFaults => "CSMS_FC_Faults",
            Self::FcActiveStates => "CSMS_FC_ActiveStates",
            Self::FcInhibited => "CSMS_FC_Inhibited",
            Self::FcSetting => "CSMS_FC_Setting",
            Self::FcSet => "CSMS_FC_Set",
            Self::ScFaults => "CSMS_SC_Faults",
            Self::ScActiveStates => "CSMS_SC_ActiveStates",
            Self::ScSetting => "CSMS_SC_Setting",
        }
    }

    /// Faults are blocking a set session.
    pub fn has_faults(&self) -> bool {
        matches!(self, Self::FcFaults | Self::ScFaults)
    }

    /// Active zones or devices are blocking a set session.
    pub fn has_active_states(&self) -> bool {
        matches!(self, Self::FcActiveStates | Self::ScActiveStates)
    }

    /// The panel accepted the set instruction.
    pub fn is_setting(&self) -> bool {
        matches!(self, Self::FcSetting | Self::FcSet | Self::ScSetting)
    }
}

impl fmt::Display for ControlSessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_state_from_code() {
        assert_eq!(ControlSessionState::from_code(1280), ControlSessionState::FcReady);
        assert_eq!(ControlSessionState::from_code(63000), ControlSessionState::ScFaults);
        assert_eq!(ControlSessionState::from_code(772), ControlSessionState::UcUnset);
        assert_eq!(ControlSessionState::from_code(9999), ControlSessionState::Unknown);
        assert_eq!(ControlSessionState::from_code(-1), ControlSessionState::Unknown);
    }

    #[test]
    fn test_session_state_code_roundtrip() {
        for (code, state) in SESSION_STATE_CODES {
            assert_eq!(state.code(), code);
            assert_eq!(ControlSessionState::from_code(code), state);
        }
    }

    #[test]
    fn test_setting_states() {
        assert!(ControlSessionState::FcSetting.is_setting());
        assert!(ControlSessionState::ScSetting.is_setting());
        assert!(!ControlSessionState::FcReady.is_setting());
        assert!(ControlSessionState::ScFaults.has_faults());
        assert!(ControlSessionState::FcActiveStates.has_active_states());
    }

    #[test]
    fn test_object_class_names() {
        assert_eq!(ObjectClass::Zone.status_request(), "getSTAT.ZONE");
        assert_eq!(ObjectClass::Area.changed_response(), "returnCOS.AREA");
        assert_eq!(ObjectClass::Area.names_request(), "select.AreaNames");
        assert_eq!(ObjectClass::Zone.capacity(), 368);
    }

    #[test]
    fn test_channel_names() {
        assert_eq!(Channel::Set.as_str(), "set");
        assert_eq!(Channel::Exit.to_string(), "exit");
    }
}
