// MIT License - Copyright (c) 2021 TJForc
// Push ingestion, monitor lines and live-event paging

use std::fmt;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::constants::{msg, prop};
use crate::error::Result;
use crate::event::PanelEvent;
use crate::message::Message;
use crate::panel::AtsPanel;
use crate::protocol::Request;
use crate::reconcile::flagged_classes;

/// One `msg.MONITOR` log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorEntry {
    pub timestamp: String,
    pub unique_id: i64,
    pub event_id: i64,
    pub event_source: i64,
    pub source_id: i64,
    /// Zero when the event is not tied to an area
    pub area: i64,
    pub text: String,
}

impl MonitorEntry {
    /// Missing fields default to zero or empty; a field of the wrong type
    /// is an error.
    pub fn parse(push: &Message) -> Result<Self> {
        let int = |id: &str| -> Result<i64> {
            push.value(id).map_or(Ok(0), |v| v.as_int(id))
        };
        Ok(Self {
            timestamp: push
                .value(prop::TIMESTAMP)
                .map(ToString::to_string)
                .unwrap_or_default(),
            unique_id: int(prop::UNIQUE_ID)?,
            event_id: int(prop::EVENT_ID)?,
            event_source: int(prop::EVENT_SOURCE)?,
            source_id: int(prop::SOURCE_ID)?,
            area: int(prop::AREA)?,
            text: match push.value(prop::EVENT_TEXT) {
                Some(v) => v.as_str(prop::EVENT_TEXT)?.to_string(),
                None => String::new(),
            },
        })
    }
}

impl fmt::Display for MonitorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: id {} : event type {} : source {} : sourceID {} : area {} : detail : {}",
            self.timestamp,
            self.unique_id,
            self.event_id,
            self.event_source,
            self.source_id,
            self.area,
            self.text
        )
    }
}

impl AtsPanel {
    /// Drain `rx` into [`AtsPanel::handle_push`] until the connection that
    /// produced it is torn down. The pump of an earlier connection is
    /// aborted and awaited, so it holds nothing once this returns. Must not
    /// be called from a pump task.
    pub(crate) async fn spawn_push_pump(&self, mut rx: mpsc::Receiver<Message>, generation: u64) {
        let weak = self.downgrade();
        let handle = tokio::spawn(async move {
            while let Some(push) = rx.recv().await {
                let Some(panel) = AtsPanel::upgrade(&weak) else {
                    break;
                };
                if panel.inner.state.generation() != generation {
                    debug!("Push stream belongs to a closed connection, stopping");
                    break;
                }
                panel.handle_push(push).await;
            }
            debug!("Push stream ended");
        });

        let previous = self
            .inner
            .push_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
            if let Err(e) = previous.await
                && !e.is_cancelled()
            {
                warn!("Previous push task failed: {}", e);
            }
        }
    }

    /// Route one pushed message. Unknown names are ignored.
    pub async fn handle_push(&self, push: Message) {
        debug!("Push {}", push);
        match push.name.as_str() {
            msg::PUSH_ERROR => {
                self.handle_error(&push.error_text()).await;
            }
            msg::PUSH_COS => {
                for class in flagged_classes(&push) {
                    if let Err(e) = self.update_changed(class).await {
                        warn!("Unable to update changed {}s: {}", class, e);
                    }
                }
            }
            msg::PUSH_MONITOR => match MonitorEntry::parse(&push) {
                Ok(entry) => {
                    let text = entry.to_string();
                    info!("Monitor: {}", text);
                    self.emit(PanelEvent::Monitor { text });
                }
                Err(e) => warn!("Ignoring malformed monitor entry: {}", e),
            },
            other => debug!("Ignoring push {}", other),
        }
    }

    /// Page through the live events. Used when the transport has no push
    /// stream. Returns the number of event pages read.
    pub async fn live_events(&self) -> Result<usize> {
        self.require_logged_in()?;
        let max_pages = self.inner.config.session_policy.max_pages;
        let mut pages = 0;
        let mut next = false;
        while pages < max_pages {
            let response = self.call(Request::LiveEvents { next }).await?;
            if !response.is(msg::RETURN_SYSEVENT) {
                return Ok(pages as usize);
            }
            debug!("Live event {}", response);
            pages += 1;
            next = true;
        }
        warn!("Stopped paging live events after {} pages", max_pages);
        Ok(pages as usize)
    }
}
