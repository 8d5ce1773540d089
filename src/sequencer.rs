// MIT License - Copyright (c) 2021 TJForc
// Bring-up sequence and periodic ticks

use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Weak;

use tokio::time::{interval, sleep, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::TransportMode;
use crate::constants::{msg, prop, ObjectClass};
use crate::error::{AtsError, Result};
use crate::event::PanelEvent;
use crate::panel::{AtsPanel, PanelInner};
use crate::protocol::Request;
use crate::state::Gates;

impl AtsPanel {
    /// Spawn the bring-up tick, the polling tick and the gateway exit
    /// watcher. Calling it again while they run does nothing.
    pub fn start(&self) {
        let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if !tasks.is_empty() {
            return;
        }
        self.inner.shutting_down.store(false, Ordering::SeqCst);

        let config = &self.inner.config;
        info!(
            "Starting bridge to panel {}:{} (gateway {})",
            config.panel_host,
            config.panel_port,
            config.gateway_address()
        );

        tasks.push(spawn_ticker(
            self.downgrade(),
            Duration::from_millis(config.connection_interval_ms),
            |panel| async move { panel.bring_up_tick().await },
        ));
        tasks.push(spawn_ticker(
            self.downgrade(),
            Duration::from_millis(config.polling_interval_ms),
            |panel| async move { panel.poll_tick().await },
        ));
        tasks.push(self.spawn_gateway_watcher());
    }

    /// Stop the ticks, log out, drop the connection and stop the gateway.
    pub async fn shutdown(&self) {
        info!("Shutting down the bridge");
        self.inner.shutting_down.store(true, Ordering::SeqCst);

        let tasks: Vec<_> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
        let push_task = self
            .inner
            .push_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = push_task {
            task.abort();
        }

        if self.inner.state.has(Gates::PANEL_CONNECTED)
            && let Err(e) = self.send_logout().await
        {
            warn!("Logout on shutdown failed: {}", e);
        }
        self.connection_lost().await;
        if let Err(e) = self.inner.gateway.stop().await {
            warn!("Failed to stop the gateway: {}", e);
        }
    }

    /// One pass of the bring-up sequence. Satisfies the unmet gates in
    /// order and goes online once all of them hold. Does nothing while
    /// online or while another pass is running.
    pub async fn bring_up_tick(&self) {
        let Ok(_pass) = self.inner.bring_up_lock.try_lock() else {
            return;
        };
        if self.is_online() || self.is_shutting_down() {
            return;
        }
        let generation = self.inner.state.generation();
        if let Some(gate) = self.inner.state.next_gate() {
            debug!("Bring-up: starting at {}", Gates::label(gate));
        }
        if let Err(e) = self.bring_up(generation).await {
            debug!("Bring-up pass ended early: {}", e);
        }
    }

    async fn bring_up(&self, generation: u64) -> Result<()> {
        let state = &self.inner.state;

        if !state.has(Gates::GATEWAY_STARTED) {
            self.inner.gateway.start().await.inspect_err(|e| {
                warn!("Unable to start the gateway: {}", e);
            })?;
            self.advance(Gates::GATEWAY_STARTED, generation)?;
        }

        if !state.has(Gates::TRANSPORT_READY) {
            self.open_transport(generation).await?;
            self.advance(Gates::TRANSPORT_READY, generation)?;
        }

        if !state.has(Gates::PANEL_CONNECTED) {
            self.configure_panel().await?;
            self.advance(Gates::PANEL_CONNECTED, generation)?;
        }

        if !state.has(Gates::LOGGED_IN) {
            if let Err(e) = self.login().await {
                warn!("Login failed: {}", e);
                state.set_last_error(e.panel_text());
                if let Err(e) = self.send_logout().await {
                    debug!("Logout after failed login: {}", e);
                }
                self.connection_lost().await;
                return Err(e);
            }
            self.advance(Gates::LOGGED_IN, generation)?;
        }

        if !state.has(Gates::MONITOR_STARTED) {
            self.start_monitor().await?;
            self.advance(Gates::MONITOR_STARTED, generation)?;
        }

        if !state.has(Gates::LOGS_OPENED) {
            sleep(Duration::from_millis(self.inner.config.logs_settle_delay_ms)).await;
            self.call(Request::OpenLog).await?;
            self.advance(Gates::LOGS_OPENED, generation)?;
        }

        if state.mark_online(generation) {
            info!("Bridge is online");
            self.emit(PanelEvent::BridgeStatus { online: true });
            for listener in self.inner.listeners.snapshot() {
                listener.on_bridge_connected(self).await;
            }
        }
        Ok(())
    }

    /// Record `gate` unless a disconnect happened since the pass started.
    fn advance(&self, gate: Gates, generation: u64) -> Result<()> {
        if self.inner.state.mark(gate, generation) {
            debug!("Bring-up: {} ready", Gates::label(gate));
            Ok(())
        } else {
            debug!("Bring-up: discarding {} from a stale pass", Gates::label(gate));
            Err(AtsError::Disconnected)
        }
    }

    async fn open_transport(&self, generation: u64) -> Result<()> {
        let transport = self
            .inner
            .connector
            .connect(&self.inner.config)
            .await
            .inspect_err(|e| warn!("Unable to reach the gateway: {}", e))?;

        if self.inner.state.generation() != generation {
            transport.close().await;
            return Err(AtsError::Disconnected);
        }
        if self.inner.config.mode == TransportMode::Push {
            match transport.take_push_stream() {
                Some(stream) => self.spawn_push_pump(stream, generation).await,
                None => warn!("Transport has no push stream; changes are seen on the polling tick only"),
            }
        }
        self.install_transport(transport);
        Ok(())
    }

    async fn configure_panel(&self) -> Result<()> {
        let config = &self.inner.config;
        info!(
            "Instructing the gateway to connect to {}:{}",
            config.panel_host, config.panel_port
        );
        let response = self
            .call(Request::ConfigurePanel {
                host: config.panel_host.clone(),
                port: config.panel_port,
                password: config.panel_password.clone(),
                heartbeat_ms: config.heartbeat_ms,
                retries: config.retries,
                timeout_ms: config.timeout_ms,
            })
            .await?;

        match response.value(prop::RESULT) {
            Some(result) if result.is_truthy() => Ok(()),
            other => {
                let text = other.map(ToString::to_string).unwrap_or_default();
                self.handle_error(&text).await;
                Err(AtsError::Panel(text))
            }
        }
    }

    async fn login(&self) -> Result<()> {
        debug!("Logging into the panel");
        self.exchange(Request::Login {
            pin: self.inner.config.user_pin.clone(),
        })
        .await?;
        Ok(())
    }

    async fn start_monitor(&self) -> Result<()> {
        let response = self.call(Request::StartMonitor).await?;
        if response.is(msg::RETURN_BOOL) {
            return Ok(());
        }
        self.handle_error(&response.error_text()).await;
        Err(AtsError::UnexpectedResponse {
            request: msg::START_MONITOR.to_string(),
            response: response.name,
        })
    }

    /// One polling pass: heartbeat (push mode) or live-event paging (poll
    /// mode), then change-of-state reconciliation. Only runs while online.
    pub async fn poll_tick(&self) {
        if !self.is_online() {
            return;
        }
        match self.inner.config.mode {
            TransportMode::Push => {
                if let Some(transport) = self.transport()
                    && let Err(e) = transport.heartbeat().await
                {
                    warn!("Heartbeat failed: {}", e);
                    self.recover(&e).await;
                    return;
                }
            }
            TransportMode::Poll => {
                if let Err(e) = self.live_events().await {
                    warn!("Live event poll failed: {}", e);
                }
            }
        }
        for class in [ObjectClass::Zone, ObjectClass::Area] {
            if !self.is_online() {
                return;
            }
            if let Err(e) = self.update_changed(class).await {
                warn!("Unable to update changed {}s: {}", class, e);
            }
        }
    }

    fn spawn_gateway_watcher(&self) -> tokio::task::JoinHandle<()> {
        let weak = self.downgrade();
        let mut running = self.inner.gateway.watch_running();
        tokio::spawn(async move {
            while running.changed().await.is_ok() {
                if *running.borrow_and_update() {
                    continue;
                }
                let Some(panel) = AtsPanel::upgrade(&weak) else {
                    break;
                };
                if panel.is_shutting_down() {
                    break;
                }
                if panel.inner.state.has(Gates::GATEWAY_STARTED) {
                    warn!("Gateway process exited");
                    panel.connection_lost().await;
                }
            }
        })
    }
}

/// Run `tick` every `period` for as long as the panel is alive.
fn spawn_ticker<F, Fut>(
    weak: Weak<PanelInner>,
    period: Duration,
    tick: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn(AtsPanel) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(panel) = AtsPanel::upgrade(&weak) else {
                break;
            };
            tick(panel).await;
        }
    })
}
