// MIT License - Copyright (c) 2021 TJForc
// Bring-up gates and connection status

use std::sync::Mutex;

use bitflags::bitflags;

bitflags! {
    /// Readiness gates, in the order bring-up satisfies them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Gates: u8 {
        const GATEWAY_STARTED = 1 << 0;
        const TRANSPORT_READY = 1 << 1;
        const PANEL_CONNECTED = 1 << 2;
        const LOGGED_IN       = 1 << 3;
        const MONITOR_STARTED = 1 << 4;
        const LOGS_OPENED     = 1 << 5;
    }
}

/// Gates in bring-up order.
pub const GATE_ORDER: [Gates; 6] = [
    Gates::GATEWAY_STARTED,
    Gates::TRANSPORT_READY,
    Gates::PANEL_CONNECTED,
    Gates::LOGGED_IN,
    Gates::MONITOR_STARTED,
    Gates::LOGS_OPENED,
];

impl Gates {
    /// All gates strictly before `gate`.
    pub fn before(gate: Gates) -> Gates {
        GATE_ORDER
            .iter()
            .take_while(|g| **g != gate)
            .fold(Gates::empty(), |acc, g| acc | *g)
    }

    /// No later gate is set while an earlier one is clear.
    pub fn is_prefix(&self) -> bool {
        let mut seen_clear = false;
        for gate in GATE_ORDER {
            if self.contains(gate) {
                if seen_clear {
                    return false;
                }
            } else {
                seen_clear = true;
            }
        }
        true
    }

    pub fn label(gate: Gates) -> &'static str {
        match gate {
            g if g == Gates::GATEWAY_STARTED => "gateway process",
            g if g == Gates::TRANSPORT_READY => "transport",
            g if g == Gates::PANEL_CONNECTED => "panel connection",
            g if g == Gates::LOGGED_IN => "login",
            g if g == Gates::MONITOR_STARTED => "monitor",
            g if g == Gates::LOGS_OPENED => "logs",
            _ => "unknown",
        }
    }
}

/// Consistent copy of the connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub gates: Gates,
    pub online: bool,
    /// Bumped on every full reset; bring-up steps started under an older
    /// generation are discarded.
    pub generation: u64,
    pub last_error: Option<String>,
}

/// Shared gate flags, online status and last error, updated as one group.
#[derive(Debug)]
pub struct ConnectionState {
    inner: Mutex<ConnectionSnapshot>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ConnectionSnapshot {
                gates: Gates::empty(),
                online: false,
                generation: 0,
                last_error: None,
            }),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut ConnectionSnapshot) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.with(|s| s.clone())
    }

    pub fn has(&self, gate: Gates) -> bool {
        self.with(|s| s.gates.contains(gate))
    }

    pub fn is_online(&self) -> bool {
        self.with(|s| s.online)
    }

    pub fn generation(&self) -> u64 {
        self.with(|s| s.generation)
    }

    /// First gate not yet satisfied.
    pub fn next_gate(&self) -> Option<Gates> {
        self.with(|s| GATE_ORDER.into_iter().find(|g| !s.gates.contains(*g)))
    }

    /// Set `gate` if `generation` is still current and every earlier gate is
    /// set. Returns whether the gate was set.
    pub fn mark(&self, gate: Gates, generation: u64) -> bool {
        self.with(|s| {
            if s.generation != generation || !s.gates.contains(Gates::before(gate)) {
                return false;
            }
            s.gates |= gate;
            debug_assert!(s.gates.is_prefix(), "gates out of order: {:?}", s.gates);
            true
        })
    }

    /// Clear every gate and go offline. Returns the new generation.
    pub fn reset_all(&self) -> u64 {
        self.with(|s| {
            s.gates = Gates::empty();
            s.online = false;
            s.generation += 1;
            s.generation
        })
    }

    /// Go online if every gate is set under `generation`. Returns true only
    /// on the offline to online transition.
    pub fn mark_online(&self, generation: u64) -> bool {
        self.with(|s| {
            if s.generation != generation || s.gates != Gates::all() || s.online {
                return false;
            }
            s.online = true;
            true
        })
    }

    pub fn set_last_error(&self, error: impl Into<String>) {
        let error = error.into();
        self.with(|s| s.last_error = Some(error))
    }

    pub fn last_error(&self) -> Option<String> {
        self.with(|s| s.last_error.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_ranges() {
        assert_eq!(Gates::before(Gates::GATEWAY_STARTED), Gates::empty());
        assert_eq!(
            Gates::before(Gates::PANEL_CONNECTED),
            Gates::GATEWAY_STARTED | Gates::TRANSPORT_READY
        );
        assert_eq!(
            Gates::before(Gates::LOGS_OPENED),
            Gates::all() - Gates::LOGS_OPENED
        );
    }

    #[test]
    fn test_mark_requires_earlier_gates() {
        let state = ConnectionState::new();
        let generation = state.generation();
        assert!(!state.mark(Gates::TRANSPORT_READY, generation));
        assert!(state.mark(Gates::GATEWAY_STARTED, generation));
        assert!(state.mark(Gates::TRANSPORT_READY, generation));
        assert_eq!(state.next_gate(), Some(Gates::PANEL_CONNECTED));
        assert!(state.snapshot().gates.is_prefix());
    }

    #[test]
    fn test_stale_generation_is_discarded() {
        let state = ConnectionState::new();
        let old = state.generation();
        assert!(state.mark(Gates::GATEWAY_STARTED, old));
        let new = state.reset_all();
        assert!(!state.mark(Gates::GATEWAY_STARTED, old));
        assert!(state.mark(Gates::GATEWAY_STARTED, new));
    }

    #[test]
    fn test_online_only_with_all_gates() {
        let state = ConnectionState::new();
        let generation = state.generation();
        for gate in &GATE_ORDER[..5] {
            assert!(state.mark(*gate, generation));
        }
        assert!(!state.mark_online(generation));
        assert!(state.mark(Gates::LOGS_OPENED, generation));
        assert!(state.mark_online(generation));
        assert!(!state.mark_online(generation));
        assert!(state.is_online());

        let next = state.reset_all();
        let snap = state.snapshot();
        assert!(!snap.online);
        assert!(snap.gates.is_empty());
        assert_eq!(snap.generation, next);
        assert_eq!(state.next_gate(), Some(Gates::GATEWAY_STARTED));
    }

    #[test]
    fn test_prefix_check() {
        assert!(Gates::empty().is_prefix());
        assert!(Gates::all().is_prefix());
        assert!(!(Gates::GATEWAY_STARTED | Gates::LOGGED_IN).is_prefix());
    }

    #[test]
    fn test_last_error() {
        let state = ConnectionState::new();
        assert_eq!(state.last_error(), None);
        state.set_last_error("FAULT_CC_BUSY_AREAS");
        assert_eq!(state.last_error().as_deref(), Some("FAULT_CC_BUSY_AREAS"));
        state.reset_all();
        assert_eq!(state.last_error().as_deref(), Some("FAULT_CC_BUSY_AREAS"));
    }
}
