// MIT License - Copyright (c) 2021 TJForc
// Remote control sessions: setting and unsetting areas

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::PollPolicy;
use crate::constants::{msg, prop, ControlSessionState, BUSY_AREAS_MARKER, MAX_NUMBER_AREAS};
use crate::error::{AtsError, Result};
use crate::panel::AtsPanel;
use crate::protocol::{self, Request};

/// Outcome of a `createCC.*` call.
enum Created {
    Session(i64),
    /// The panel refused; carries the error text behind the refusal
    Refused(Option<String>),
}

/// Events that block a set session until inhibited.
#[derive(Debug, Clone, Copy)]
enum Blocker {
    Faults,
    ActiveStates,
}

impl Blocker {
    fn fetch(self, session_id: i64, next: bool) -> Request {
        match self {
            Self::Faults => Request::GetFaults { session_id, next },
            Self::ActiveStates => Request::GetActiveStates { session_id, next },
        }
    }

    fn inhibit(self, session_id: i64, event_id: i64) -> Request {
        match self {
            Self::Faults => Request::InhibitFault {
                session_id,
                event_id,
            },
            Self::ActiveStates => Request::InhibitActiveState {
                session_id,
                event_id,
            },
        }
    }
}

/// Poll pacing for one session.
struct Backoff<'a> {
    policy: &'a PollPolicy,
    session_id: i64,
    started: Instant,
    attempt: u32,
}

impl<'a> Backoff<'a> {
    fn new(policy: &'a PollPolicy, session_id: i64) -> Self {
        Self {
            policy,
            session_id,
            started: Instant::now(),
            attempt: 0,
        }
    }

    /// Sleep before the next poll, or give up once the attempt cap or the
    /// deadline is reached.
    async fn wait(&mut self, state: ControlSessionState) -> Result<()> {
        if self.attempt >= self.policy.max_attempts
            || self.started.elapsed() >= self.policy.deadline()
        {
            return Err(AtsError::SessionTimeout {
                session_id: self.session_id,
                state,
                attempts: self.attempt,
            });
        }
        sleep(self.policy.delay(self.attempt)).await;
        self.attempt += 1;
        Ok(())
    }
}

fn check_area(area: u32) -> Result<()> {
    if (1..=MAX_NUMBER_AREAS).contains(&area) {
        Ok(())
    } else {
        Err(AtsError::InvalidDeviceId {
            id: area,
            max: MAX_NUMBER_AREAS,
        })
    }
}

/// Refusals and malformed answers end the command with `false`; transport
/// faults, timeouts and going offline stay errors.
fn settle(area: u32, outcome: Result<bool>) -> Result<bool> {
    match outcome {
        Err(AtsError::Panel(text)) => {
            warn!("Panel rejected the request for area {}: {}", area, text);
            Ok(false)
        }
        Err(
            e @ (AtsError::SessionState { .. }
            | AtsError::UnexpectedResponse { .. }
            | AtsError::MissingProperty { .. }
            | AtsError::PropertyType { .. }),
        ) => {
            warn!("Control session for area {} failed: {}", area, e);
            Ok(false)
        }
        other => other,
    }
}

impl AtsPanel {
    /// Fully set (arm) `area`.
    ///
    /// If the panel refuses the session because the area is busy, the area
    /// is unset instead and `false` is returned.
    pub async fn set_area(&self, area: u32) -> Result<bool> {
        check_area(area)?;
        let _session = self.inner.session_lock.lock().await;
        self.ensure_online()?;
        info!("Setting area {}", area);
        let outcome = self.run_set(area).await;
        settle(area, outcome)
    }

    /// Unset (disarm) `area`.
    pub async fn unset_area(&self, area: u32) -> Result<bool> {
        check_area(area)?;
        let _session = self.inner.session_lock.lock().await;
        self.ensure_online()?;
        info!("Unsetting area {}", area);
        let outcome = self.run_unset(area).await;
        settle(area, outcome)
    }

    fn ensure_online(&self) -> Result<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(AtsError::Offline)
        }
    }

    async fn create_session(&self, request: Request) -> Result<Created> {
        match self.call(request).await {
            Ok(response) => match protocol::session_id(&response)? {
                0 => Ok(Created::Refused(self.last_error())),
                id => {
                    debug!("Created control session {}", id);
                    Ok(Created::Session(id))
                }
            },
            Err(AtsError::Panel(text)) => Ok(Created::Refused(Some(text))),
            Err(e) => Err(e),
        }
    }

    async fn session_state(&self, session_id: i64) -> Result<ControlSessionState> {
        let response = self.call(Request::SessionState { session_id }).await?;
        let state = protocol::session_state(&response)?;
        debug!("Control session {} is in state {}", session_id, state);
        Ok(state)
    }

    async fn expect_state(&self, session_id: i64, expected: ControlSessionState) -> Result<()> {
        let actual = self.session_state(session_id).await?;
        if actual == expected {
            Ok(())
        } else {
            Err(AtsError::SessionState {
                session_id,
                expected,
                actual,
            })
        }
    }

    async fn run_set(&self, area: u32) -> Result<bool> {
        let session_id = match self.create_session(Request::CreateSetSession { area }).await? {
            Created::Session(id) => id,
            Created::Refused(reason) => {
                if reason.as_deref().is_some_and(|r| r.contains(BUSY_AREAS_MARKER)) {
                    info!("Area {} is busy, unsetting it instead", area);
                    if let Err(e) = self.run_unset(area).await {
                        warn!("Unsetting busy area {} failed: {}", area, e);
                    }
                } else {
                    warn!("Panel refused to set area {}: {:?}", area, reason);
                }
                return Ok(false);
            }
        };

        self.expect_state(session_id, ControlSessionState::FcReady).await?;
        self.call(Request::SetAreas { session_id }).await?;

        let policy = self.inner.config.session_policy;
        let mut backoff = Backoff::new(&policy, session_id);
        loop {
            self.ensure_online()?;
            let state = self.session_state(session_id).await?;
            if state.is_setting() {
                break;
            }
            if state.has_faults() {
                self.inhibit_blockers(session_id, Blocker::Faults).await?;
            } else if state.has_active_states() {
                self.inhibit_blockers(session_id, Blocker::ActiveStates).await?;
            }
            backoff.wait(state).await?;
        }

        self.finish_session(session_id).await;
        info!("Area {} is setting", area);
        Ok(true)
    }

    async fn run_unset(&self, area: u32) -> Result<bool> {
        let session_id = match self.create_session(Request::CreateUnsetSession { area }).await? {
            Created::Session(id) => id,
            Created::Refused(reason) => {
                warn!("Panel refused to unset area {}: {:?}", area, reason);
                return Ok(false);
            }
        };

        self.expect_state(session_id, ControlSessionState::UcReady).await?;
        self.call(Request::UnsetAreas { session_id }).await?;

        let policy = self.inner.config.session_policy;
        let mut backoff = Backoff::new(&policy, session_id);
        loop {
            self.ensure_online()?;
            let state = self.session_state(session_id).await?;
            match state {
                ControlSessionState::UcUnsetting => backoff.wait(state).await?,
                ControlSessionState::UcCnfAlarms | ControlSessionState::UcCnfFaults => {
                    info!("Acknowledging {} for area {}", state, area);
                    self.call(Request::Skip { session_id }).await?;
                    backoff.wait(state).await?;
                }
                ControlSessionState::UcUnset => {
                    self.finish_session(session_id).await;
                    info!("Area {} is unset", area);
                    return Ok(true);
                }
                actual => {
                    return Err(AtsError::SessionState {
                        session_id,
                        expected: ControlSessionState::UcUnset,
                        actual,
                    });
                }
            }
        }
    }

    /// Page through the blocking events of a set session and inhibit each.
    /// Returns how many the panel accepted.
    async fn inhibit_blockers(&self, session_id: i64, blocker: Blocker) -> Result<usize> {
        let mut inhibited = 0;
        let mut next = false;
        for _ in 0..self.inner.config.session_policy.max_pages {
            let page = self.call(blocker.fetch(session_id, next)).await?;
            if !page.is(msg::RETURN_SYSEVENT) {
                break;
            }
            for event_id in protocol::event_ids(&page)? {
                match self.call(blocker.inhibit(session_id, event_id)).await {
                    Ok(response) => {
                        let accepted = response.value(prop::RESULT).is_some_and(|v| v.is_truthy());
                        debug!("Inhibit {:?} event {}: {}", blocker, event_id, accepted);
                        if accepted {
                            inhibited += 1;
                        }
                    }
                    Err(e) if e.is_transport() => return Err(e),
                    Err(e) => warn!("Unable to inhibit event {}: {}", event_id, e),
                }
            }
            next = true;
        }
        Ok(inhibited)
    }

    async fn finish_session(&self, session_id: i64) {
        if let Err(e) = self.call(Request::DestroySession { session_id }).await {
            warn!("Unable to destroy control session {}: {}", session_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_area() {
        assert!(check_area(1).is_ok());
        assert!(check_area(8).is_ok());
        assert!(matches!(
            check_area(0),
            Err(AtsError::InvalidDeviceId { id: 0, max: 8 })
        ));
        assert!(check_area(9).is_err());
    }

    #[test]
    fn test_settle_maps_refusals_to_false() {
        assert!(!settle(1, Err(AtsError::Panel("FAULT_NO_ACCESS".into()))).unwrap());
        assert!(!settle(
            1,
            Err(AtsError::SessionState {
                session_id: 3,
                expected: ControlSessionState::FcReady,
                actual: ControlSessionState::FcFaults,
            })
        )
        .unwrap());
        assert!(matches!(settle(1, Err(AtsError::Offline)), Err(AtsError::Offline)));
        assert!(settle(1, Ok(true)).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_gives_up_after_attempts() {
        let policy = PollPolicy {
            max_attempts: 3,
            initial_backoff_ms: 10,
            max_backoff_ms: 40,
            deadline_ms: 60_000,
            max_pages: 4,
        };
        let mut backoff = Backoff::new(&policy, 7);
        for _ in 0..3 {
            backoff.wait(ControlSessionState::UcUnsetting).await.unwrap();
        }
        match backoff.wait(ControlSessionState::UcUnsetting).await {
            Err(AtsError::SessionTimeout {
                session_id,
                state,
                attempts,
            }) => {
                assert_eq!(session_id, 7);
                assert_eq!(state, ControlSessionState::UcUnsetting);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected: {:?}", other.err()),
        }
    }
}
