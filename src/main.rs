// MIT License - Copyright (c) 2021 TJForc
// MQTT bridge

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

use ats_advanced_bridge::{
    Area, AtsPanel, BridgeConfig, Channel, DeviceCommand, GatewayConfig, ObjectClass, PanelEvent,
    PollPolicy, TransportMode, Zone,
};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "ats2mqtt")]
#[command(about = "Bridge between an ATS Advanced alarm panel and MQTT")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Config {
    panel: PanelToml,
    #[serde(default)]
    gateway: GatewayToml,
    mqtt: MqttToml,
    #[serde(default)]
    zones: Vec<DeviceToml>,
    #[serde(default)]
    areas: Vec<DeviceToml>,
}

#[derive(Debug, Deserialize)]
struct PanelToml {
    host: String,
    #[serde(default = "default_panel_port")]
    port: u16,
    #[serde(default = "default_panel_password")]
    password: String,
    #[serde(default)]
    user_pin: String,
    #[serde(default = "default_heartbeat")]
    heartbeat_ms: u32,
    #[serde(default = "default_retries")]
    retries: u32,
    #[serde(default = "default_timeout")]
    timeout_ms: u32,
    /// "push" or "poll"
    #[serde(default = "default_mode")]
    mode: String,
    #[serde(default = "default_connection_interval")]
    connection_interval_ms: u64,
    #[serde(default = "default_polling_interval")]
    polling_interval_ms: u64,
    #[serde(default = "default_logs_settle_delay")]
    logs_settle_delay_ms: u64,
    #[serde(default = "default_request_timeout")]
    request_timeout_ms: u64,
    #[serde(default = "default_session_attempts")]
    session_max_attempts: u32,
    #[serde(default = "default_session_deadline")]
    session_deadline_ms: u64,
}

fn default_panel_port() -> u16 {
    32000
}
fn default_panel_password() -> String {
    "0000".to_string()
}
fn default_heartbeat() -> u32 {
    1000
}
fn default_retries() -> u32 {
    1
}
fn default_timeout() -> u32 {
    2000
}
fn default_mode() -> String {
    "push".to_string()
}
fn default_connection_interval() -> u64 {
    5000
}
fn default_polling_interval() -> u64 {
    300_000
}
fn default_logs_settle_delay() -> u64 {
    2000
}
fn default_request_timeout() -> u64 {
    10_000
}
fn default_session_attempts() -> u32 {
    60
}
fn default_session_deadline() -> u64 {
    60_000
}

#[derive(Debug, Deserialize)]
struct GatewayToml {
    #[serde(default = "default_gateway_host")]
    host: String,
    #[serde(default = "default_gateway_port")]
    port: u16,
    #[serde(default = "default_gateway_executable")]
    executable: String,
    #[serde(default = "default_gateway_args")]
    args: Vec<String>,
    #[serde(default = "default_gateway_driver")]
    driver: String,
    #[serde(default)]
    working_dir: Option<PathBuf>,
    #[serde(default)]
    ready_marker: Option<String>,
    #[serde(default = "default_ready_timeout")]
    ready_timeout_ms: u64,
    #[serde(default = "default_kill_stale")]
    kill_stale: bool,
}

impl Default for GatewayToml {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
            executable: default_gateway_executable(),
            args: default_gateway_args(),
            driver: default_gateway_driver(),
            working_dir: None,
            ready_marker: None,
            ready_timeout_ms: default_ready_timeout(),
            kill_stale: default_kill_stale(),
        }
    }
}

fn default_gateway_host() -> String {
    "127.0.0.1".to_string()
}
fn default_gateway_port() -> u16 {
    8080
}
fn default_gateway_executable() -> String {
    "mono".to_string()
}
fn default_gateway_args() -> Vec<String> {
    vec!["--debug".to_string(), "ATSAdvancedGateway.exe".to_string()]
}
fn default_gateway_driver() -> String {
    "ats.advanced.drv".to_string()
}
fn default_ready_timeout() -> u64 {
    30_000
}
fn default_kill_stale() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct MqttToml {
    url: String,
    #[serde(default = "default_client_id")]
    client_id: String,
    #[serde(default = "default_subscribe_topic")]
    subscribe_topic: String,
    #[serde(default = "default_publish_topic")]
    publish_topic: String,
    #[serde(default = "default_snapshot_interval")]
    snapshot_interval_secs: u64,
}

fn default_client_id() -> String {
    "ats-bridge".to_string()
}
fn default_subscribe_topic() -> String {
    "ats/cmd".to_string()
}
fn default_publish_topic() -> String {
    "ats".to_string()
}
fn default_snapshot_interval() -> u64 {
    60
}

/// A `[[zones]]` or `[[areas]]` entry. Without a name, the panel's name is used.
#[derive(Debug, Clone, Deserialize)]
struct DeviceToml {
    number: u32,
    #[serde(default)]
    name: Option<String>,
}

fn parse_mode(s: &str) -> Result<TransportMode> {
    match s.to_lowercase().as_str() {
        "push" => Ok(TransportMode::Push),
        "poll" => Ok(TransportMode::Poll),
        other => anyhow::bail!("Unknown transport mode: {other}"),
    }
}

fn build_bridge_config(config: &Config) -> Result<BridgeConfig> {
    let panel = &config.panel;
    let gateway = &config.gateway;
    let policy = PollPolicy {
        max_attempts: panel.session_max_attempts,
        deadline_ms: panel.session_deadline_ms,
        ..PollPolicy::default()
    };
    Ok(BridgeConfig::builder()
        .panel_host(&panel.host)
        .panel_port(panel.port)
        .panel_password(&panel.password)
        .user_pin(&panel.user_pin)
        .heartbeat_ms(panel.heartbeat_ms)
        .retries(panel.retries)
        .timeout_ms(panel.timeout_ms)
        .mode(parse_mode(&panel.mode)?)
        .connection_interval_ms(panel.connection_interval_ms)
        .polling_interval_ms(panel.polling_interval_ms)
        .logs_settle_delay_ms(panel.logs_settle_delay_ms)
        .request_timeout_ms(panel.request_timeout_ms)
        .session_policy(policy)
        .gateway_host(&gateway.host)
        .gateway_port(gateway.port)
        .gateway(GatewayConfig {
            executable: gateway.executable.clone(),
            args: gateway.args.clone(),
            driver: gateway.driver.clone(),
            working_dir: gateway.working_dir.clone(),
            ready_marker: gateway.ready_marker.clone(),
            ready_timeout_ms: gateway.ready_timeout_ms,
            kill_stale: gateway.kill_stale,
        })
        .build())
}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

/// Zones and areas mirrored for MQTT, registered as panel listeners.
#[derive(Clone, Default)]
struct Devices {
    zones: Vec<Arc<Zone>>,
    areas: Vec<Arc<Area>>,
}

impl Devices {
    fn from_config(config: &Config) -> Self {
        let zones = config
            .zones
            .iter()
            .map(|z| match &z.name {
                Some(name) => Zone::with_name(z.number, name),
                None => Zone::new(z.number),
            })
            .map(Arc::new)
            .collect();
        let areas = config
            .areas
            .iter()
            .map(|a| match &a.name {
                Some(name) => Area::with_name(a.number, name),
                None => Area::new(a.number),
            })
            .map(Arc::new)
            .collect();
        Self { zones, areas }
    }

    fn register(&self, panel: &AtsPanel) {
        for zone in &self.zones {
            panel.register_listener(zone.clone());
        }
        for area in &self.areas {
            panel.register_listener(area.clone());
        }
    }

    fn zone(&self, number: u32) -> Option<&Arc<Zone>> {
        self.zones.iter().find(|z| z.number() == number)
    }

    fn area(&self, number: u32) -> Option<&Arc<Area>> {
        self.areas.iter().find(|a| a.number() == number)
    }

    fn label(&self, class: ObjectClass, number: u32) -> String {
        let name = match class {
            ObjectClass::Zone => self.zone(number).and_then(|z| z.name()),
            ObjectClass::Area => self.area(number).and_then(|a| a.name()),
        };
        name.unwrap_or_else(|| format!("{class} {number}"))
    }
}

// ---------------------------------------------------------------------------
// MQTT JSON types
// ---------------------------------------------------------------------------

// Published messages share the flat {now, op, ...} structure

#[derive(Serialize)]
struct MqttSnapshot {
    now: u64,
    op: String,
    state: MqttSnapshotState,
}

#[derive(Serialize)]
struct MqttSnapshotState {
    online: bool,
    #[serde(rename = "lastError", skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
    areas: Vec<MqttAreaState>,
    zones: Vec<MqttZoneState>,
}

#[derive(Serialize)]
struct MqttZoneState {
    id: u32,
    name: String,
    online: bool,
    active: bool,
    alarm: bool,
    error: bool,
    flags: Vec<&'static str>,
}

#[derive(Serialize)]
struct MqttAreaState {
    id: u32,
    name: String,
    online: bool,
    set: bool,
    alarm: bool,
    exit: bool,
    error: bool,
    flags: Vec<&'static str>,
}

// Zone and area events: {now, op, zone|area} with an optional eventStr
#[derive(Serialize)]
struct MqttDeviceEvent {
    now: u64,
    op: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    zone: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    area: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "eventStr")]
    event_str: Option<String>,
}

#[derive(Serialize)]
struct MqttMonitorEvent {
    now: u64,
    op: String,
    text: String,
}

// CMD_ACK response
#[derive(Serialize)]
struct MqttCmdAck {
    now: u64,
    op: String,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    src: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct MqttSimpleEvent {
    now: u64,
    op: String,
}

#[derive(Serialize)]
struct MqttDiscovered {
    class: String,
    number: u32,
    name: String,
}

// Inbound command (subscribed)
#[derive(Deserialize)]
struct MqttCommand {
    op: String,
    #[serde(default)]
    #[allow(dead_code)]
    op_id: Option<String>,
    #[serde(default)]
    zone: Option<u32>,
    #[serde(default)]
    area: Option<u32>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn now_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

async fn publish_json(client: &AsyncClient, topic: &str, payload: &impl Serialize, retain: bool) {
    match serde_json::to_string(payload) {
        Ok(json) => {
            if let Err(e) = client.publish(topic, QoS::AtLeastOnce, retain, json).await {
                error!("Failed to publish to {topic}: {e}");
            }
        }
        Err(e) => error!("Failed to serialize MQTT payload: {e}"),
    }
}

async fn publish_device_event(
    client: &AsyncClient,
    topic: &str,
    op: &str,
    class: ObjectClass,
    number: u32,
    event_str: Option<String>,
) {
    let (zone, area) = match class {
        ObjectClass::Zone => (Some(number), None),
        ObjectClass::Area => (None, Some(number)),
    };
    let msg = MqttDeviceEvent {
        now: now_epoch_ms(),
        op: op.to_string(),
        zone,
        area,
        event_str,
    };
    publish_json(client, topic, &msg, false).await;
}

async fn publish_cmd_ack(
    client: &AsyncClient,
    topic: &str,
    success: bool,
    src: Option<serde_json::Value>,
    data: Option<serde_json::Value>,
) {
    let msg = MqttCmdAck {
        now: now_epoch_ms(),
        op: "CMD_ACK".to_string(),
        success,
        src,
        data,
    };
    publish_json(client, topic, &msg, false).await;
}

async fn publish_simple_event(client: &AsyncClient, topic: &str, op: &str) {
    let msg = MqttSimpleEvent {
        now: now_epoch_ms(),
        op: op.to_string(),
    };
    publish_json(client, topic, &msg, false).await;
}

fn build_snapshot(panel: &AtsPanel, devices: &Devices) -> MqttSnapshot {
    let zones = devices
        .zones
        .iter()
        .map(|z| MqttZoneState {
            id: z.number(),
            name: devices.label(ObjectClass::Zone, z.number()),
            online: z.is_online(),
            active: z.is_active(),
            alarm: z.is_alarm(),
            error: z.in_error(),
            flags: z.status().names(),
        })
        .collect();

    let areas = devices
        .areas
        .iter()
        .map(|a| MqttAreaState {
            id: a.number(),
            name: devices.label(ObjectClass::Area, a.number()),
            online: a.is_online(),
            set: a.is_set(),
            alarm: a.is_alarm(),
            exit: a.is_exit(),
            error: a.in_error(),
            flags: a.status().names(),
        })
        .collect();

    MqttSnapshot {
        now: now_epoch_ms(),
        op: "SNAPSHOT".to_string(),
        state: MqttSnapshotState {
            online: panel.is_online(),
            last_error: panel.last_error(),
            areas,
            zones,
        },
    }
}

async fn publish_snapshot(client: &AsyncClient, topic: &str, panel: &AtsPanel, devices: &Devices) {
    let snapshot = build_snapshot(panel, devices);
    publish_json(client, topic, &snapshot, true).await;
}

/// MQTT op for a channel update.
fn channel_op(class: ObjectClass, channel: Channel, on: bool) -> Option<&'static str> {
    let op = match (class, channel, on) {
        (ObjectClass::Zone, Channel::Active, true) => "ZONE_ACTIVE",
        (ObjectClass::Zone, Channel::Active, false) => "ZONE_INACTIVE",
        (ObjectClass::Zone, Channel::Alarm, true) => "ZONE_ALARM",
        (ObjectClass::Zone, Channel::Alarm, false) => "ZONE_STANDBY",
        (ObjectClass::Area, Channel::Set, true) => "AREA_SET",
        (ObjectClass::Area, Channel::Set, false) => "AREA_UNSET",
        (ObjectClass::Area, Channel::Alarm, true) => "AREA_ALARM",
        (ObjectClass::Area, Channel::Alarm, false) => "AREA_ALARM_STANDBY",
        (ObjectClass::Area, Channel::Exit, true) => "AREA_EXIT",
        (ObjectClass::Area, Channel::Exit, false) => "AREA_EXIT_END",
        _ => return None,
    };
    Some(op)
}

fn change_summary(set: Vec<&str>, unset: Vec<&str>) -> String {
    format!("set=[{}] unset=[{}]", set.join(","), unset.join(","))
}

// ---------------------------------------------------------------------------
// Panel event → MQTT
// ---------------------------------------------------------------------------

async fn handle_panel_event(
    event: PanelEvent,
    client: &AsyncClient,
    topic: &str,
    panel: &AtsPanel,
    devices: &Devices,
) {
    match event {
        PanelEvent::BridgeStatus { online: true } => {
            info!("Bridge online, publishing snapshot");
            publish_simple_event(client, topic, "BRIDGE_ONLINE").await;
            publish_snapshot(client, topic, panel, devices).await;
        }

        PanelEvent::BridgeStatus { online: false } => {
            warn!("Bridge offline, the panel will be retried in the background");
            publish_simple_event(client, topic, "BRIDGE_OFFLINE").await;
            publish_snapshot(client, topic, panel, devices).await;
        }

        PanelEvent::ChannelUpdate {
            class,
            number,
            channel,
            on,
        } => {
            if let Some(op) = channel_op(class, channel, on) {
                publish_device_event(client, topic, op, class, number, None).await;
            }
        }

        PanelEvent::ZoneStatusChanged {
            zone_id,
            new_status,
            changed,
            ..
        } => {
            let summary = change_summary(
                (changed & new_status).names(),
                (changed & !new_status).names(),
            );
            info!(
                "Zone {zone_id} ({}) changed: {summary}",
                devices.label(ObjectClass::Zone, zone_id)
            );
            publish_device_event(
                client,
                topic,
                "ZONE_STATUS_CHANGE",
                ObjectClass::Zone,
                zone_id,
                Some(summary),
            )
            .await;
        }

        PanelEvent::AreaStatusChanged {
            area_id,
            new_status,
            changed,
            ..
        } => {
            let summary = change_summary(
                (changed & new_status).names(),
                (changed & !new_status).names(),
            );
            info!(
                "Area {area_id} ({}) changed: {summary}",
                devices.label(ObjectClass::Area, area_id)
            );
            publish_device_event(
                client,
                topic,
                "AREA_STATUS_CHANGE",
                ObjectClass::Area,
                area_id,
                Some(summary),
            )
            .await;
        }

        PanelEvent::Monitor { text } => {
            let msg = MqttMonitorEvent {
                now: now_epoch_ms(),
                op: "MONITOR".to_string(),
                text,
            };
            publish_json(client, topic, &msg, true).await;
        }

        PanelEvent::NameResolved { class, number, name } => {
            info!("Panel name for {class} {number}: {name}");
        }

        PanelEvent::DeviceStatus { .. } => {}
    }
}

// ---------------------------------------------------------------------------
// MQTT command handler
// ---------------------------------------------------------------------------

/// Execute a panel command future and log the result. Returns `true` on success.
async fn exec_panel_cmd<E: std::fmt::Display>(
    op: &str,
    label: &str,
    fut: impl std::future::Future<Output = std::result::Result<bool, E>>,
) -> bool {
    match fut.await {
        Ok(true) => {
            info!("{op} {label}: success");
            true
        }
        Ok(false) => {
            warn!("{op} {label}: refused by the panel");
            false
        }
        Err(e) => {
            error!("{op} {label} failed: {e}");
            false
        }
    }
}

async fn handle_command(
    payload_str: &str,
    cmd: MqttCommand,
    client: &AsyncClient,
    topic: &str,
    panel: &AtsPanel,
    devices: &Devices,
) {
    // Echo the raw payload back as the CMD_ACK src field
    let src_json = serde_json::from_str::<serde_json::Value>(payload_str).ok();

    match cmd.op.as_str() {
        "SNAPSHOT" => {
            debug!("Command: SNAPSHOT");
            let snapshot = build_snapshot(panel, devices);
            let snapshot_value = serde_json::to_value(&snapshot).ok();
            publish_json(client, topic, &snapshot, true).await;
            publish_cmd_ack(client, topic, true, src_json, snapshot_value).await;
        }

        "PING" => {
            info!("Command: PING");
            let alive = panel.is_online() && panel.is_alive().await.unwrap_or(false);
            publish_cmd_ack(client, topic, alive, src_json, None).await;
        }

        "SET_AREA" | "UNSET_AREA" => {
            let op = cmd.op.as_str();
            let on = op == "SET_AREA";
            let Some(id) = cmd.area else {
                warn!("{op}: missing area");
                publish_cmd_ack(client, topic, false, src_json, None).await;
                return;
            };
            info!("Command: {op} area {id}");
            let label = format!("area {id}");
            let success = match devices.area(id) {
                Some(area) => {
                    let command = DeviceCommand::Switch {
                        channel: Channel::Set,
                        on,
                    };
                    exec_panel_cmd(op, &label, area.handle_command(panel, command)).await
                }
                None if on => exec_panel_cmd(op, &label, panel.set_area(id)).await,
                None => exec_panel_cmd(op, &label, panel.unset_area(id)).await,
            };
            publish_cmd_ack(client, topic, success, src_json, None).await;
        }

        "REFRESH" => {
            info!("Command: REFRESH");
            let success = match (cmd.zone, cmd.area) {
                (Some(id), _) => match devices.zone(id) {
                    Some(zone) => zone
                        .handle_command(panel, DeviceCommand::Refresh)
                        .await
                        .unwrap_or(false),
                    None => false,
                },
                (None, Some(id)) => match devices.area(id) {
                    Some(area) => area
                        .handle_command(panel, DeviceCommand::Refresh)
                        .await
                        .unwrap_or(false),
                    None => false,
                },
                (None, None) => {
                    for zone in &devices.zones {
                        zone.refresh(panel).await;
                    }
                    for area in &devices.areas {
                        area.refresh(panel).await;
                    }
                    true
                }
            };
            publish_snapshot(client, topic, panel, devices).await;
            publish_cmd_ack(client, topic, success, src_json, None).await;
        }

        "DISCOVER" => {
            info!("Command: DISCOVER");
            match panel.discover().await {
                Ok(found) => {
                    let data: Vec<MqttDiscovered> = found
                        .into_iter()
                        .map(|d| MqttDiscovered {
                            class: d.class.to_string(),
                            number: d.number,
                            name: d.name,
                        })
                        .collect();
                    let data = serde_json::to_value(&data).ok();
                    publish_cmd_ack(client, topic, true, src_json, data).await;
                }
                Err(e) => {
                    error!("DISCOVER failed: {e}");
                    publish_cmd_ack(client, topic, false, src_json, None).await;
                }
            }
        }

        other => {
            warn!("Unknown command: {other}");
            publish_cmd_ack(client, topic, false, src_json, None).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn load_config(path: &str) -> Result<Config> {
    let text = std::fs::read_to_string(path).context("Failed to read config file")?;
    toml::from_str(&text).context("Failed to parse config file")
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity (e.g. RUST_LOG=debug or RUST_LOG=ats_advanced_bridge=debug).
    // Default: info.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // systemd journal already adds timestamps, so omit them when running under systemd
    if std::env::var_os("JOURNAL_STREAM").is_some() {
        tracing_subscriber::fmt().without_time().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let cli = Cli::parse();
    let mut config = load_config(&cli.config)?;

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        let bridge_config = build_bridge_config(&config)?;
        let (mqtt_host, mqtt_port) = parse_mqtt_url(&config.mqtt.url)?;
        let publish_topic = config.mqtt.publish_topic.clone();
        let subscribe_topic = config.mqtt.subscribe_topic.clone();
        let snapshot_interval_secs = config.mqtt.snapshot_interval_secs.max(1);

        let panel = AtsPanel::with_external_gateway(bridge_config);
        let devices = Devices::from_config(&config);
        devices.register(&panel);
        let event_rx = panel.subscribe();
        panel.start();

        // Set up MQTT
        let mut mqtt_opts = MqttOptions::new(&config.mqtt.client_id, &mqtt_host, mqtt_port);
        mqtt_opts.set_keep_alive(Duration::from_secs(30));
        let (client, mut eventloop) = AsyncClient::new(mqtt_opts, 256);

        client
            .subscribe(&subscribe_topic, QoS::AtLeastOnce)
            .await
            .context("Failed to subscribe to MQTT topic")?;
        info!("MQTT: subscribed to {subscribe_topic}");

        // Task 1: panel events
        let panel_events = panel.clone();
        let client_events = client.clone();
        let topic_events = publish_topic.clone();
        let devices_events = devices.clone();
        let event_handle = tokio::spawn(async move {
            let mut rx = event_rx;
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        handle_panel_event(
                            event,
                            &client_events,
                            &topic_events,
                            &panel_events,
                            &devices_events,
                        )
                        .await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Event receiver lagged, missed {n} events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        info!("Event channel closed");
                        break;
                    }
                }
            }
        });

        // Task 2: MQTT event loop (receives messages, handles commands)
        let panel_cmds = panel.clone();
        let client_cmds = client.clone();
        let topic_cmds = publish_topic.clone();
        let devices_cmds = devices.clone();
        let sub_topic = subscribe_topic.clone();
        let mqtt_handle = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        // rumqttc does not resubscribe after a broker reconnect
                        info!("MQTT: connected, subscribing to {sub_topic}");
                        if let Err(e) = client_cmds.subscribe(&sub_topic, QoS::AtLeastOnce).await
                        {
                            error!("Failed to subscribe to {sub_topic}: {e}");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(msg))) => {
                        if msg.topic == sub_topic {
                            let payload = String::from_utf8_lossy(&msg.payload);
                            match serde_json::from_str::<MqttCommand>(&payload) {
                                Ok(cmd) => {
                                    if cmd.op == "SNAPSHOT" {
                                        debug!("MQTT command received: {payload}");
                                    } else {
                                        info!("MQTT command received: {payload}");
                                    }
                                    // Area commands can take a while; keep the event loop polling
                                    let panel = panel_cmds.clone();
                                    let client = client_cmds.clone();
                                    let topic = topic_cmds.clone();
                                    let devices = devices_cmds.clone();
                                    let payload = payload.into_owned();
                                    tokio::spawn(async move {
                                        handle_command(
                                            &payload, cmd, &client, &topic, &panel, &devices,
                                        )
                                        .await;
                                    });
                                }
                                Err(e) => {
                                    warn!("Failed to parse MQTT command: {e}");
                                }
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT event loop error: {e}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        // Task 3: snapshot timer
        let panel_snap = panel.clone();
        let client_snap = client.clone();
        let topic_snap = publish_topic.clone();
        let devices_snap = devices.clone();
        let snap_handle = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(snapshot_interval_secs));
            loop {
                ticker.tick().await;
                publish_snapshot(&client_snap, &topic_snap, &panel_snap, &devices_snap).await;
            }
        });

        info!("MQTT bridge running. Send SIGHUP to restart, SIGINT/SIGTERM to stop.");
        let restart = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down...");
                false
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                false
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading config and restarting connections...");
                true
            }
        };

        event_handle.abort();
        mqtt_handle.abort();
        snap_handle.abort();
        panel.shutdown().await;

        if !restart {
            break;
        }

        // Reload config from disk; keep previous config on failure
        info!("Reloading config from {}", cli.config);
        match load_config(&cli.config).and_then(|new_config| {
            build_bridge_config(&new_config)?;
            parse_mqtt_url(&new_config.mqtt.url)?;
            Ok(new_config)
        }) {
            Ok(new_config) => {
                config = new_config;
                info!("Config reloaded successfully");
            }
            Err(e) => warn!("Failed to reload config, keeping previous: {e:#}"),
        }

        info!("Reconnecting...");
    }

    info!("Shutdown complete");
    Ok(())
}

/// Parse an MQTT URL like "mqtt://host:port" into (host, port).
fn parse_mqtt_url(url: &str) -> Result<(String, u16)> {
    let stripped = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url);

    let (host, port_str) = stripped
        .rsplit_once(':')
        .context("MQTT URL must be in format mqtt://host:port")?;

    let port: u16 = port_str.parse().context("Invalid MQTT port number")?;

    Ok((host.to_string(), port))
}
