// MIT License - Copyright (c) 2021 TJForc
// Request builders and response decoding for the ATS gateway protocol

use crate::constants::{
    msg, prop, ControlSessionState, ObjectClass, LIVE_EVENT_CATEGORIES, LOGIN_ACTIONS,
    MAX_NUMBER_AREAS,
};
use crate::error::{AtsError, Result};
use crate::message::Message;

/// Requests the bridge sends to the gateway.
///
/// # Bring-up
///
/// The bridge walks the panel through:
///
/// ```text
/// configure.PANEL, device.getConnect, start.MONITOR, (2s), open.LOG
/// ```
///
/// Every later request assumes that sequence succeeded. `device.disconnect`
/// undoes the login.
///
/// # Control sessions
///
/// Arming and disarming run inside a remote control session identified by
/// the integer the `createCC.*` call returns:
///
/// ```text
/// createCC.A_SET -> statusCC.SESSION -> fnCC.A_SET_SETAREAS -> statusCC.SESSION ... -> destroyCC.SESSION
/// createCC.A_UNSET -> statusCC.SESSION -> fnCC.A_UNSET_UNSETAREAS -> statusCC.SESSION ... -> destroyCC.SESSION
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Point the gateway at the panel. Response carries `result` = `"1"` on success.
    ConfigurePanel {
        host: String,
        port: u16,
        password: String,
        heartbeat_ms: u32,
        retries: u32,
        timeout_ms: u32,
    },
    /// Log in with a user PIN and the fixed capability set.
    Login { pin: String },
    Logout,
    /// Start pushing monitor lines. Succeeds only with `return.bool`.
    StartMonitor,
    OpenLog,
    /// Liveness check, answered with `return.void`.
    IsAlive,
    Privileges { area_id: u32 },
    /// Full flag status of one zone or area.
    Status { class: ObjectClass, index: u32 },
    /// Bitset of zones or areas changed since the last query.
    ChangedObjects { class: ObjectClass },
    /// Chunk of names starting at `index`.
    Names { class: ObjectClass, index: u32 },
    LiveEvents { next: bool },
    CreateSetSession { area: u32 },
    CreateUnsetSession { area: u32 },
    SessionState { session_id: i64 },
    SetAreas { session_id: i64 },
    GetFaults { session_id: i64, next: bool },
    InhibitFault { session_id: i64, event_id: i64 },
    GetActiveStates { session_id: i64, next: bool },
    InhibitActiveState { session_id: i64, event_id: i64 },
    UnsetAreas { session_id: i64 },
    /// Acknowledge alarms or faults while unsetting. The panel uses the same
    /// message for both.
    Skip { session_id: i64 },
    DestroySession { session_id: i64 },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConfigurePanel { .. } => msg::CONFIGURE_PANEL,
            Self::Login { .. } => msg::LOGIN,
            Self::Logout => msg::LOGOUT,
            Self::StartMonitor => msg::START_MONITOR,
            Self::OpenLog => msg::OPEN_LOG,
            Self::IsAlive => msg::IS_ALIVE,
            Self::Privileges { .. } => msg::GET_PRIVILEGES,
            Self::Status { class, .. } => class.status_request(),
            Self::ChangedObjects { class } => class.changed_request(),
            Self::Names { class, .. } => class.names_request(),
            Self::LiveEvents { .. } => msg::GET_LIVE_EVENTS,
            Self::CreateSetSession { .. } => msg::CREATE_SET_SESSION,
            Self::CreateUnsetSession { .. } => msg::CREATE_UNSET_SESSION,
            Self::SessionState { .. } => msg::SESSION_STATE,
            Self::SetAreas { .. } => msg::SET_AREAS,
            Self::GetFaults { .. } => msg::GET_FAULTS,
            Self::InhibitFault { .. } => msg::INHIBIT_FAULT,
            Self::GetActiveStates { .. } => msg::GET_ACTIVE,
            Self::InhibitActiveState { .. } => msg::INHIBIT_ACTIVE,
            Self::UnsetAreas { .. } => msg::UNSET_AREAS,
            Self::Skip { .. } => msg::UNSET_SKIP,
            Self::DestroySession { .. } => msg::DESTROY_SESSION,
        }
    }

    /// Build the wire message for this request.
    pub fn to_message(&self) -> Message {
        let m = Message::new(self.name());
        match self {
            Self::ConfigurePanel {
                host,
                port,
                password,
                heartbeat_ms,
                retries,
                timeout_ms,
            } => m
                .with(prop::HOST_ADDRESS, host.as_str())
                .with(prop::PORT, *port)
                .with(prop::PASSWORD, password.as_str())
                .with(prop::HEARTBEAT, *heartbeat_ms)
                .with(prop::RETRIES, *retries)
                .with(prop::TIMEOUT, *timeout_ms),
            Self::Login { pin } => LOGIN_ACTIONS
                .iter()
                .fold(m.with(prop::USER_PIN, pin.as_str()), |m, (id, v)| m.with(*id, *v)),
            Self::Logout | Self::StartMonitor | Self::OpenLog | Self::IsAlive => m,
            Self::ChangedObjects { .. } => m,
            Self::Privileges { area_id } => m.with(prop::AREA_ID, *area_id),
            Self::Status { index, .. } => m.with(prop::OBJECT_ID, *index),
            Self::Names { index, .. } => m.with(prop::INDEX, *index),
            Self::LiveEvents { next } => {
                let m = (1..=MAX_NUMBER_AREAS).fold(m, |m, i| m.with(format!("area.{i}"), true));
                LIVE_EVENT_CATEGORIES
                    .iter()
                    .fold(m, |m, cat| m.with(*cat, true))
                    .with(prop::NEXT, *next)
            }
            Self::CreateSetSession { area } | Self::CreateUnsetSession { area } => {
                area_slots(*area)
                    .into_iter()
                    .enumerate()
                    .fold(m, |m, (i, on)| m.with(format!("area.{}", i + 1), on))
            }
            Self::SessionState { session_id }
            | Self::SetAreas { session_id }
            | Self::UnsetAreas { session_id }
            | Self::Skip { session_id }
            | Self::DestroySession { session_id } => m.with(prop::SESSION_ID, *session_id),
            Self::GetFaults { session_id, next } | Self::GetActiveStates { session_id, next } => m
                .with(prop::SESSION_ID, *session_id)
                .with(prop::NEXT, *next),
            Self::InhibitFault {
                session_id,
                event_id,
            }
            | Self::InhibitActiveState {
                session_id,
                event_id,
            } => m
                .with(prop::SESSION_ID, *session_id)
                .with(prop::EVENT_UNIQUE_ID, *event_id),
        }
    }
}

/// Area selection mask for session creation: one boolean per area slot,
/// true only at `area`.
pub fn area_slots(area: u32) -> [bool; MAX_NUMBER_AREAS as usize] {
    let mut slots = [false; MAX_NUMBER_AREAS as usize];
    if (1..=MAX_NUMBER_AREAS).contains(&area) {
        slots[(area - 1) as usize] = true;
    }
    slots
}

/// Acknowledgement returned for every pushed message.
pub fn push_ack() -> Message {
    Message::new(msg::RETURN_BOOL).with(prop::RESULT, 1i64)
}

/// Decode a little-endian changed-object bitset into 1-based indices.
///
/// Bit `i` (byte `i / 8`, bit `i % 8`) set means object `i + 1` changed.
pub fn decode_bitset(bytes: &[u8]) -> Vec<u32> {
    let mut indices = Vec::new();
    for (byte_idx, byte) in bytes.iter().enumerate() {
        for bit in 0..8 {
            if byte & (1 << bit) != 0 {
                indices.push((byte_idx * 8 + bit) as u32 + 1);
            }
        }
    }
    indices
}

/// Inverse of [`decode_bitset`]. Index 0 is ignored.
pub fn encode_bitset(indices: &[u32]) -> Vec<u8> {
    let len = indices.iter().copied().max().map_or(0, |max| max.div_ceil(8) as usize);
    let mut bytes = vec![0u8; len];
    for &index in indices.iter().filter(|&&i| i > 0) {
        let bit = (index - 1) as usize;
        bytes[bit / 8] |= 1 << (bit % 8);
    }
    bytes
}

/// Indices reported by a `getCOS.*` response. `return.void` means nothing changed.
pub fn changed_indices(response: &Message, class: ObjectClass) -> Result<Vec<u32>> {
    if response.is(msg::RETURN_VOID) {
        return Ok(Vec::new());
    }
    if !response.is(class.changed_response()) {
        return Err(AtsError::UnexpectedResponse {
            request: class.changed_request().to_string(),
            response: response.name.clone(),
        });
    }
    match response.value(prop::BIT_SET) {
        Some(v) => Ok(decode_bitset(&v.as_bytes(prop::BIT_SET)?)),
        None => Ok(Vec::new()),
    }
}

/// Ids of the flags reported true by a `getSTAT.*` response. The echoed
/// `objectID` is skipped.
pub fn true_flags(response: &Message) -> Result<Vec<&str>> {
    let mut flags = Vec::new();
    for p in response.properties.iter().filter(|p| p.id != prop::OBJECT_ID) {
        if p.value.as_bool(&p.id)? {
            flags.push(p.id.as_str());
        }
    }
    Ok(flags)
}

/// Session id from a `createCC.*` response. Zero means the panel refused.
pub fn session_id(response: &Message) -> Result<i64> {
    response.require(prop::RESULT)?.as_int(prop::RESULT)
}

pub fn session_state(response: &Message) -> Result<ControlSessionState> {
    let code = response.require(prop::STATE_ID)?.as_int(prop::STATE_ID)?;
    Ok(ControlSessionState::from_code(code))
}

/// Event ids listed in a `return.sysevent` page.
pub fn event_ids(response: &Message) -> Result<Vec<i64>> {
    response
        .values(prop::EVENT_UNIQUE_ID)
        .map(|v| v.as_int(prop::EVENT_UNIQUE_ID))
        .collect()
}

/// One `return.ZoneNames` / `return.AreaNames` page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamesChunk {
    /// Index of the first name in the chunk
    pub start: u32,
    /// Names in index order; empty strings are unused slots
    pub names: Vec<String>,
    /// How far the next request should advance
    pub advance: u32,
}

impl NamesChunk {
    pub fn parse(response: &Message, class: ObjectClass) -> Result<Self> {
        if !response.is(class.names_response()) {
            return Err(AtsError::UnexpectedResponse {
                request: class.names_request().to_string(),
                response: response.name.clone(),
            });
        }
        let start = response.require(prop::INDEX)?.as_int(prop::INDEX)?;
        let names = response
            .values(prop::NAME)
            .map(|v| v.as_str(prop::NAME).map(str::to_string))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            start: u32::try_from(start).unwrap_or(0),
            names,
            advance: response.properties.len().saturating_sub(1) as u32,
        })
    }

    /// Non-empty names with their indices.
    pub fn named(&self) -> impl Iterator<Item = (u32, &str)> {
        self.names
            .iter()
            .enumerate()
            .filter(|(_, n)| !n.is_empty())
            .map(|(i, n)| (self.start + i as u32, n.as_str()))
    }

    /// Name at `start`, if non-empty.
    pub fn first_name(&self) -> Option<&str> {
        self.names.first().map(String::as_str).filter(|n| !n.is_empty())
    }
}
