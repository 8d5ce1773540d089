// MIT License - Copyright (c) 2021 TJForc
// End-to-end bridge behaviour against a scripted gateway

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use tokio::sync::{mpsc, watch};

use ats_advanced_bridge::protocol::encode_bitset;
use ats_advanced_bridge::{
    Area, AtsError, AtsPanel, BridgeConfig, Channel, DeviceCommand, EventReceiver, Gates,
    GatewayProcess, Message, ObjectClass, PanelEvent, PanelStatusListener, PanelTransport,
    PollPolicy, Result, TransportConnector, TransportMode, Value, Zone,
};

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

type Handler = Box<dyn Fn(&Message) -> Message + Send + Sync>;

#[derive(Default)]
struct Script {
    /// One-shot replies, consumed in order, per request name
    queued: HashMap<String, VecDeque<Result<Message>>>,
    /// Replies computed from the request once the queue is empty
    handlers: HashMap<String, Handler>,
}

#[derive(Default)]
struct Shared {
    script: Mutex<Script>,
    sent: Mutex<Vec<Message>>,
    push_tx: Mutex<Option<mpsc::Sender<Message>>>,
    transports: Mutex<Vec<Arc<FakeTransport>>>,
    connects: AtomicUsize,
    heartbeats: AtomicUsize,
    refuse_connect: AtomicBool,
}

/// What a healthy gateway answers when nothing else is scripted.
fn default_reply(request: &Message) -> Message {
    let echo = |name: &str, id: &str| {
        let mut reply = Message::new(name);
        if let Some(v) = request.value(id) {
            reply = reply.with(id, v.clone());
        }
        reply
    };
    match request.name.as_str() {
        "configure.PANEL" => Message::new("return.bool").with("result", "1"),
        "device.getConnect" | "start.MONITOR" => Message::new("return.bool").with("result", true),
        "getSTAT.ZONE" => echo("returnSTAT.ZONE", "objectID"),
        "getSTAT.AREA" => echo("returnSTAT.AREA", "objectID"),
        "select.ZoneNames" => echo("return.ZoneNames", "index"),
        "select.AreaNames" => echo("return.AreaNames", "index"),
        "fnCC.A_SET_INHFAULT" | "fnCC.A_SET_INHACTIVE" => {
            Message::new("return.bool").with("result", true)
        }
        _ => Message::new("return.void"),
    }
}

struct FakeTransport {
    shared: Arc<Shared>,
    push_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    connected: AtomicBool,
}

#[async_trait]
impl PanelTransport for FakeTransport {
    async fn send(&self, request: Message) -> Result<Message> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(AtsError::Disconnected);
        }
        self.shared.sent.lock().unwrap().push(request.clone());
        let mut script = self.shared.script.lock().unwrap();
        if let Some(reply) = script
            .queued
            .get_mut(&request.name)
            .and_then(VecDeque::pop_front)
        {
            return reply;
        }
        if let Some(handler) = script.handlers.get(&request.name) {
            return Ok(handler(&request));
        }
        Ok(default_reply(&request))
    }

    async fn heartbeat(&self) -> Result<()> {
        self.shared.heartbeats.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn take_push_stream(&self) -> Option<mpsc::Receiver<Message>> {
        self.push_rx.lock().unwrap().take()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

struct FakeConnector {
    shared: Arc<Shared>,
}

#[async_trait]
impl TransportConnector for FakeConnector {
    async fn connect(&self, _config: &BridgeConfig) -> Result<Arc<dyn PanelTransport>> {
        if self.shared.refuse_connect.load(Ordering::SeqCst) {
            return Err(AtsError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "gateway not listening",
            )));
        }
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(16);
        *self.shared.push_tx.lock().unwrap() = Some(tx);
        let transport = Arc::new(FakeTransport {
            shared: self.shared.clone(),
            push_rx: Mutex::new(Some(rx)),
            connected: AtomicBool::new(true),
        });
        self.shared.transports.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}

struct FakeGateway {
    running: watch::Sender<bool>,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl FakeGateway {
    fn new() -> Self {
        let (running, _) = watch::channel(false);
        Self {
            running,
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        }
    }

    /// The process died on its own.
    fn exit(&self) {
        self.running.send_replace(false);
    }
}

#[async_trait]
impl GatewayProcess for FakeGateway {
    async fn start(&self) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.running.send_replace(true);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.running.send_replace(false);
        Ok(())
    }

    fn watch_running(&self) -> watch::Receiver<bool> {
        self.running.subscribe()
    }
}

#[derive(Default)]
struct Recorder {
    log: Mutex<Vec<&'static str>>,
}

impl Recorder {
    fn count(&self, what: &str) -> usize {
        self.log.lock().unwrap().iter().filter(|l| **l == what).count()
    }
}

#[async_trait]
impl PanelStatusListener for Recorder {
    async fn on_bridge_connected(&self, _panel: &AtsPanel) {
        self.log.lock().unwrap().push("connected");
    }

    async fn on_bridge_disconnected(&self, _panel: &AtsPanel) {
        self.log.lock().unwrap().push("disconnected");
    }
}

/// Takes its time reacting to a disconnect.
struct SlowListener {
    delay: Duration,
}

#[async_trait]
impl PanelStatusListener for SlowListener {
    async fn on_bridge_connected(&self, _panel: &AtsPanel) {}

    async fn on_bridge_disconnected(&self, _panel: &AtsPanel) {
        tokio::time::sleep(self.delay).await;
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    panel: AtsPanel,
    shared: Arc<Shared>,
    gateway: Arc<FakeGateway>,
}

impl Harness {
    fn new(mode: TransportMode) -> Self {
        let config = BridgeConfig::builder()
            .user_pin("1234")
            .mode(mode)
            .logs_settle_delay_ms(0)
            .connection_interval_ms(3_600_000)
            .polling_interval_ms(3_600_000)
            .session_policy(PollPolicy {
                max_attempts: 5,
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
                deadline_ms: 5_000,
                max_pages: 8,
            })
            .build();
        let shared = Arc::new(Shared::default());
        let gateway = Arc::new(FakeGateway::new());
        let panel = AtsPanel::new(
            config,
            gateway.clone(),
            Arc::new(FakeConnector {
                shared: shared.clone(),
            }),
        );
        Self {
            panel,
            shared,
            gateway,
        }
    }

    async fn online(mode: TransportMode) -> Self {
        let h = Self::new(mode);
        h.panel.bring_up_tick().await;
        assert!(h.panel.is_online());
        h
    }

    fn queue(&self, name: &str, reply: Result<Message>) {
        self.shared
            .script
            .lock()
            .unwrap()
            .queued
            .entry(name.to_string())
            .or_default()
            .push_back(reply);
    }

    fn handle(&self, name: &str, handler: impl Fn(&Message) -> Message + Send + Sync + 'static) {
        self.shared
            .script
            .lock()
            .unwrap()
            .handlers
            .insert(name.to_string(), Box::new(handler));
    }

    fn sent_names(&self) -> Vec<String> {
        self.shared
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.name.clone())
            .collect()
    }

    fn sent(&self, name: &str) -> Vec<Message> {
        self.shared
            .sent
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.name == name)
            .cloned()
            .collect()
    }

    fn clear_sent(&self) {
        self.shared.sent.lock().unwrap().clear();
    }

    async fn push(&self, message: Message) {
        let tx = self.shared.push_tx.lock().unwrap().clone();
        tx.expect("no push stream").send(message).await.unwrap();
    }
}

fn error(text: &str) -> Result<Message> {
    Ok(Message::new("return.error").with("error", text))
}

fn session(id: i64) -> Result<Message> {
    Ok(Message::new("return.int").with("result", id))
}

fn state(code: i64) -> Result<Message> {
    Ok(Message::new("return.int").with("stateID", code))
}

fn zone_status(zone: u32, flags: &[&str]) -> Result<Message> {
    let reply = Message::new("returnSTAT.ZONE")
        .with("objectID", zone)
        .with("ZNEV_TAMPER", false);
    Ok(flags.iter().fold(reply, |m, f| m.with(*f, true)))
}

fn int_prop(message: &Message, id: &str) -> i64 {
    message.require(id).unwrap().as_int(id).unwrap()
}

fn bool_prop(message: &Message, id: &str) -> bool {
    message.require(id).unwrap().as_bool(id).unwrap()
}

fn drain(rx: &mut EventReceiver) -> Vec<PanelEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn channel_values(events: &[PanelEvent], wanted: Channel) -> Vec<bool> {
    events
        .iter()
        .filter_map(|e| match e {
            PanelEvent::ChannelUpdate { channel, on, .. } if *channel == wanted => Some(*on),
            _ => None,
        })
        .collect()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

// ---------------------------------------------------------------------------
// Bring-up
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_bring_up_reaches_online_in_one_pass() {
    let h = Harness::new(TransportMode::Push);
    let recorder = Arc::new(Recorder::default());
    h.panel.register_listener(recorder.clone());
    let mut events = h.panel.subscribe();

    h.panel.bring_up_tick().await;

    assert!(h.panel.is_online());
    assert_eq!(h.panel.connection().gates, Gates::all());
    assert_eq!(
        h.sent_names(),
        vec!["configure.PANEL", "device.getConnect", "start.MONITOR", "open.LOG"]
    );
    assert_eq!(h.gateway.starts.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.count("connected"), 1);
    assert_eq!(drain(&mut events), vec![PanelEvent::BridgeStatus { online: true }]);

    let login = &h.sent("device.getConnect")[0];
    assert_eq!(login.value("userPIN"), Some(&Value::from("1234")));

    // Ticks while online do nothing
    h.panel.bring_up_tick().await;
    assert_eq!(h.sent_names().len(), 4);
}

#[tokio::test]
async fn test_bring_up_resumes_at_first_unmet_gate() {
    let h = Harness::new(TransportMode::Push);
    h.queue("start.MONITOR", error("FAULT_MONITOR_BUSY"));

    h.panel.bring_up_tick().await;

    assert!(!h.panel.is_online());
    let gates = h.panel.connection().gates;
    assert!(gates.contains(Gates::LOGGED_IN));
    assert!(!gates.contains(Gates::MONITOR_STARTED));
    assert!(!gates.contains(Gates::LOGS_OPENED));
    assert!(!h.sent_names().contains(&"open.LOG".to_string()));
    assert_eq!(h.panel.last_error().as_deref(), Some("FAULT_MONITOR_BUSY"));

    h.clear_sent();
    h.panel.bring_up_tick().await;

    assert!(h.panel.is_online());
    assert_eq!(h.sent_names(), vec!["start.MONITOR", "open.LOG"]);
    assert_eq!(h.shared.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unreachable_gateway_is_retried() {
    let h = Harness::new(TransportMode::Push);
    h.shared.refuse_connect.store(true, Ordering::SeqCst);

    h.panel.bring_up_tick().await;
    assert!(!h.panel.is_online());
    assert_eq!(h.panel.connection().gates, Gates::GATEWAY_STARTED);
    assert!(h.sent_names().is_empty());

    h.shared.refuse_connect.store(false, Ordering::SeqCst);
    h.panel.bring_up_tick().await;
    assert!(h.panel.is_online());
}

#[tokio::test]
async fn test_login_failure_forces_full_disconnect() {
    let h = Harness::new(TransportMode::Push);
    let recorder = Arc::new(Recorder::default());
    h.panel.register_listener(recorder.clone());
    h.queue("device.getConnect", error("FAULT_BAD_PIN"));

    h.panel.bring_up_tick().await;

    let snapshot = h.panel.connection();
    assert!(!snapshot.online);
    assert!(snapshot.gates.is_empty());
    assert_eq!(snapshot.last_error.as_deref(), Some("FAULT_BAD_PIN"));
    assert_eq!(h.sent("device.disconnect").len(), 1);
    assert_eq!(recorder.count("disconnected"), 1);
    assert!(!h.shared.transports.lock().unwrap()[0].is_connected());

    // The next pass starts from scratch
    h.panel.bring_up_tick().await;
    assert!(h.panel.is_online());
    assert_eq!(h.shared.connects.load(Ordering::SeqCst), 2);
    assert_eq!(h.sent("configure.PANEL").len(), 2);
}

// ---------------------------------------------------------------------------
// Error policy
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_fatal_error_runs_exactly_one_cycle() {
    let h = Harness::online(TransportMode::Push).await;
    let recorder = Arc::new(Recorder::default());
    h.panel.register_listener(recorder.clone());
    let mut events = h.panel.subscribe();
    h.queue("device.disconnect", error("Connection refused at host X"));

    assert!(h.panel.handle_error("Connection refused at host X").await);

    assert_eq!(h.sent("device.disconnect").len(), 1);
    assert_eq!(recorder.count("disconnected"), 1);
    assert!(!h.panel.is_online());
    assert!(h.panel.connection().gates.is_empty());
    assert_eq!(drain(&mut events), vec![PanelEvent::BridgeStatus { online: false }]);

    // Nothing left to tear down
    assert!(!h.panel.handle_error("FAULT_NO_ACCESS").await);
    assert_eq!(recorder.count("disconnected"), 1);
}

#[tokio::test]
async fn test_recovery_interrupted_by_reconnect_does_not_mute_errors() {
    let h = Harness::online(TransportMode::Push).await;
    h.panel.register_listener(Arc::new(SlowListener {
        delay: Duration::from_millis(300),
    }));

    // The push task is still inside the slow listener when the bridge
    // reconnects and replaces it
    h.push(Message::new("msg.error").with("error", "Connection refused at host X"))
        .await;
    wait_until(|| !h.panel.is_online()).await;
    h.panel.bring_up_tick().await;
    assert!(h.panel.is_online());

    assert!(h.panel.handle_error("Connection refused at host Y").await);
    assert!(!h.panel.is_online());
    assert_eq!(h.sent("device.disconnect").len(), 2);
}

#[tokio::test]
async fn test_logout_tears_the_connection_down() {
    let h = Harness::online(TransportMode::Push).await;
    let recorder = Arc::new(Recorder::default());
    h.panel.register_listener(recorder.clone());
    let mut events = h.panel.subscribe();
    let before = h.panel.connection().generation;

    h.panel.logout().await.unwrap();

    let connection = h.panel.connection();
    assert!(!connection.online);
    assert!(connection.gates.is_empty());
    assert!(connection.generation > before);
    assert_eq!(h.sent("device.disconnect").len(), 1);
    assert_eq!(recorder.count("disconnected"), 1);
    assert_eq!(drain(&mut events), vec![PanelEvent::BridgeStatus { online: false }]);

    h.panel.bring_up_tick().await;
    assert!(h.panel.is_online());
}

#[tokio::test]
async fn test_non_fatal_error_is_only_recorded() {
    let h = Harness::online(TransportMode::Push).await;

    assert!(!h.panel.handle_error("FAULT_CC_BUSY_AREAS").await);

    assert!(h.panel.is_online());
    assert_eq!(h.panel.last_error().as_deref(), Some("FAULT_CC_BUSY_AREAS"));
    assert!(h.sent("device.disconnect").is_empty());
}

#[tokio::test]
async fn test_transport_failure_forces_reconnect() {
    let h = Harness::online(TransportMode::Push).await;
    h.queue("getCOS.ZONE", Err(AtsError::Timeout {
        request: "getCOS.ZONE".to_string(),
    }));

    assert!(h.panel.update_changed_zones().await.is_err());

    assert!(!h.panel.is_online());
    assert_eq!(h.sent("device.disconnect").len(), 1);
}

// ---------------------------------------------------------------------------
// Control sessions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_arm_area_two_marks_only_its_slot() {
    let h = Harness::online(TransportMode::Push).await;
    h.queue("createCC.A_SET", session(17));
    h.queue("statusCC.SESSION", state(1280));
    h.queue("statusCC.SESSION", state(1284));

    assert!(h.panel.set_area(2).await.unwrap());

    let create = &h.sent("createCC.A_SET")[0];
    let slots: Vec<bool> = (1..=8)
        .map(|i| bool_prop(create, &format!("area.{i}")))
        .collect();
    assert_eq!(slots, [false, true, false, false, false, false, false, false]);

    let destroy = h.sent("destroyCC.SESSION");
    assert_eq!(destroy.len(), 1);
    assert_eq!(int_prop(&destroy[0], "sessionID"), 17);
    assert_eq!(h.sent("fnCC.A_SET_SETAREAS").len(), 1);
}

#[tokio::test]
async fn test_arm_inhibits_faults_and_active_zones() {
    let h = Harness::online(TransportMode::Push).await;
    h.queue("createCC.A_SET", session(4));
    for code in [1280, 1281, 1282, 1284] {
        h.queue("statusCC.SESSION", state(code));
    }
    h.queue(
        "fnCC.A_SET_GETFAULT",
        Ok(Message::new("return.sysevent")
            .with("eventUniqueID", 5i64)
            .with("eventUniqueID", 6i64)),
    );
    h.queue(
        "fnCC.A_SET_GETACTIVE",
        Ok(Message::new("return.sysevent").with("eventUniqueID", 9i64)),
    );

    assert!(h.panel.set_area(1).await.unwrap());

    let inhibited: Vec<i64> = h
        .sent("fnCC.A_SET_INHFAULT")
        .iter()
        .map(|m| int_prop(m, "eventUniqueID"))
        .collect();
    assert_eq!(inhibited, vec![5, 6]);
    let pages: Vec<bool> = h
        .sent("fnCC.A_SET_GETFAULT")
        .iter()
        .map(|m| bool_prop(m, "next"))
        .collect();
    assert_eq!(pages, vec![false, true]);
    assert_eq!(h.sent("fnCC.A_SET_INHACTIVE").len(), 1);
    assert_eq!(h.sent("destroyCC.SESSION").len(), 1);
}

#[tokio::test]
async fn test_arm_busy_area_falls_back_to_unset() {
    let h = Harness::online(TransportMode::Push).await;
    h.queue("createCC.A_SET", error("FAULT_CC_BUSY_AREAS"));
    h.queue("createCC.A_UNSET", session(21));
    h.queue("statusCC.SESSION", state(768));
    h.queue("statusCC.SESSION", state(772));

    assert!(!h.panel.set_area(3).await.unwrap());

    let names = h.sent_names();
    let after_create: Vec<&str> = names
        .iter()
        .skip_while(|n| *n != "createCC.A_SET")
        .map(String::as_str)
        .collect();
    assert_eq!(
        after_create,
        vec![
            "createCC.A_SET",
            "createCC.A_UNSET",
            "statusCC.SESSION",
            "fnCC.A_UNSET_UNSETAREAS",
            "statusCC.SESSION",
            "destroyCC.SESSION",
        ]
    );
    assert!(h.panel.is_online());
}

#[tokio::test]
async fn test_arm_refused_with_recorded_busy_error_unsets() {
    let h = Harness::online(TransportMode::Push).await;
    h.panel.handle_error("FAULT_CC_BUSY_AREAS").await;
    h.queue("createCC.A_SET", session(0));
    h.queue("createCC.A_UNSET", session(8));
    h.queue("statusCC.SESSION", state(768));
    h.queue("statusCC.SESSION", state(772));

    assert!(!h.panel.set_area(1).await.unwrap());
    assert_eq!(h.sent("createCC.A_UNSET").len(), 1);
}

#[tokio::test]
async fn test_arm_refused_without_busy_marker() {
    let h = Harness::online(TransportMode::Push).await;
    h.queue("createCC.A_SET", session(0));

    assert!(!h.panel.set_area(1).await.unwrap());
    assert!(h.sent("createCC.A_UNSET").is_empty());
    assert!(h.sent("statusCC.SESSION").is_empty());
}

#[tokio::test]
async fn test_arm_in_wrong_initial_state_fails() {
    let h = Harness::online(TransportMode::Push).await;
    h.queue("createCC.A_SET", session(3));
    h.queue("statusCC.SESSION", state(1281));

    assert!(!h.panel.set_area(1).await.unwrap());
    assert!(h.sent("fnCC.A_SET_SETAREAS").is_empty());
}

#[tokio::test]
async fn test_disarm_acknowledges_alarms_and_faults() {
    let h = Harness::online(TransportMode::Push).await;
    h.queue("createCC.A_UNSET", session(11));
    for code in [768, 769, 770, 771, 772] {
        h.queue("statusCC.SESSION", state(code));
    }

    assert!(h.panel.unset_area(1).await.unwrap());

    assert_eq!(h.sent("fnCC.A_UNSET_SKIP").len(), 2);
    assert_eq!(h.sent("destroyCC.SESSION").len(), 1);
}

#[tokio::test]
async fn test_disarm_gives_up_after_bounded_polls() {
    let h = Harness::online(TransportMode::Push).await;
    h.queue("createCC.A_UNSET", session(11));
    h.queue("statusCC.SESSION", state(768));
    h.handle("statusCC.SESSION", |_| {
        Message::new("return.int").with("stateID", 769i64)
    });

    match h.panel.unset_area(1).await {
        Err(AtsError::SessionTimeout {
            session_id,
            attempts,
            ..
        }) => {
            assert_eq!(session_id, 11);
            assert_eq!(attempts, 5);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(h.sent("destroyCC.SESSION").is_empty());
}

#[tokio::test]
async fn test_area_commands_need_an_online_bridge() {
    let h = Harness::new(TransportMode::Push);
    assert!(matches!(h.panel.set_area(1).await, Err(AtsError::Offline)));
    assert!(matches!(
        h.panel.unset_area(9).await,
        Err(AtsError::InvalidDeviceId { id: 9, max: 8 })
    ));
    assert!(h.sent_names().is_empty());
}

// ---------------------------------------------------------------------------
// Change-of-state reconciliation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_changed_bitset_refreshes_exactly_those_zones() {
    let h = Harness::new(TransportMode::Push);
    for number in [1, 3, 7, 40, 41] {
        h.panel.register_listener(Arc::new(Zone::new(number)));
    }
    h.panel.bring_up_tick().await;
    assert!(h.panel.is_online());
    h.clear_sent();

    h.queue(
        "getCOS.ZONE",
        Ok(Message::new("returnCOS.ZONE").with("bitSet", encode_bitset(&[3, 7, 40]))),
    );
    assert_eq!(h.panel.update_changed_zones().await.unwrap(), 3);

    let queried: Vec<i64> = h
        .sent("getSTAT.ZONE")
        .iter()
        .map(|m| int_prop(m, "objectID"))
        .collect();
    assert_eq!(queried, vec![3, 7, 40]);

    // Same bitset, base64 encoded
    h.clear_sent();
    let encoded = base64::engine::general_purpose::STANDARD.encode(encode_bitset(&[3, 7, 40]));
    h.queue(
        "getCOS.ZONE",
        Ok(Message::new("returnCOS.ZONE").with("bitSet", encoded)),
    );
    assert_eq!(h.panel.update_changed_zones().await.unwrap(), 3);
    assert_eq!(h.sent("getSTAT.ZONE").len(), 3);

    // Nothing changed
    h.clear_sent();
    assert_eq!(h.panel.update_changed_zones().await.unwrap(), 0);
    assert!(h.sent("getSTAT.ZONE").is_empty());
}

#[tokio::test]
async fn test_zone_alarm_edges() {
    let h = Harness::new(TransportMode::Push);
    let zone = Arc::new(Zone::new(5));
    h.panel.register_listener(zone.clone());
    h.panel.bring_up_tick().await;
    let mut events = h.panel.subscribe();

    let alarm_after = |flags: &'static [&'static str]| {
        h.queue("getSTAT.ZONE", zone_status(5, flags));
        let zone = zone.clone();
        let panel = h.panel.clone();
        async move {
            zone.refresh(&panel).await;
        }
    };

    alarm_after(&["ZNEV_ALARM"]).await;
    assert_eq!(channel_values(&drain(&mut events), Channel::Alarm), vec![true]);
    assert!(zone.is_alarm());

    alarm_after(&[]).await;
    let refreshed = drain(&mut events);
    assert_eq!(channel_values(&refreshed, Channel::Alarm), vec![false]);
    assert!(refreshed.iter().any(|e| matches!(
        e,
        PanelEvent::ZoneStatusChanged { zone_id: 5, .. }
    )));

    // Staying false may republish, but only the current value
    alarm_after(&[]).await;
    assert!(channel_values(&drain(&mut events), Channel::Alarm)
        .iter()
        .all(|on| !on));

    alarm_after(&["ZNEV_ALARM", "ZNEV_ACTIVE"]).await;
    let refreshed = drain(&mut events);
    assert_eq!(channel_values(&refreshed, Channel::Alarm), vec![true]);
    assert_eq!(channel_values(&refreshed, Channel::Active), vec![true]);

    // Staying true publishes nothing
    alarm_after(&["ZNEV_ALARM", "ZNEV_ACTIVE"]).await;
    assert!(channel_values(&drain(&mut events), Channel::Alarm).is_empty());
}

#[tokio::test]
async fn test_area_error_latch_stops_refreshes() {
    let h = Harness::new(TransportMode::Push);
    let area = Arc::new(Area::new(2));
    h.panel.register_listener(area.clone());
    h.queue("getSTAT.AREA", error("FAULT_NO_ACCESS"));

    h.panel.bring_up_tick().await;
    assert!(h.panel.is_online());
    assert!(area.is_online());
    assert!(area.in_error());

    h.clear_sent();
    area.refresh(&h.panel).await;
    assert!(h.sent("getSTAT.AREA").is_empty());
}

#[tokio::test]
async fn test_zone_recovers_from_transport_failure() {
    let h = Harness::new(TransportMode::Push);
    let zone = Arc::new(Zone::new(4));
    h.panel.register_listener(zone.clone());
    h.queue("getSTAT.ZONE", Err(AtsError::Timeout {
        request: "getSTAT.ZONE".to_string(),
    }));

    h.panel.bring_up_tick().await;
    assert!(!h.panel.is_online());
    assert!(!zone.in_error());

    h.panel.bring_up_tick().await;
    assert!(h.panel.is_online());
    assert!(zone.is_online());
    assert!(!zone.in_error());
    assert_eq!(h.sent("getSTAT.ZONE").len(), 2);
}

#[tokio::test]
async fn test_area_set_command_arms_then_refreshes() {
    let h = Harness::new(TransportMode::Push);
    let area = Arc::new(Area::new(1));
    h.panel.register_listener(area.clone());
    h.panel.bring_up_tick().await;
    let mut events = h.panel.subscribe();

    h.queue("createCC.A_SET", session(2));
    h.queue("statusCC.SESSION", state(1280));
    h.queue("statusCC.SESSION", state(1285));
    h.queue(
        "getSTAT.AREA",
        Ok(Message::new("returnSTAT.AREA")
            .with("objectID", 1u32)
            .with("AREV_FULLSET", true)),
    );

    let command = DeviceCommand::Switch {
        channel: Channel::Set,
        on: true,
    };
    assert!(area.handle_command(&h.panel, command).await.unwrap());
    assert!(area.is_set());
    assert_eq!(channel_values(&drain(&mut events), Channel::Set), vec![true]);
}

#[tokio::test]
async fn test_entities_follow_bridge_and_resolve_names() {
    let h = Harness::new(TransportMode::Push);
    let zone = Arc::new(Zone::new(2));
    let named = Arc::new(Zone::with_name(4, "Garage"));
    h.panel.register_listener(zone.clone());
    h.panel.register_listener(named.clone());
    h.queue(
        "select.ZoneNames",
        Ok(Message::new("return.ZoneNames")
            .with("index", 2u32)
            .with("name", "Hall")
            .with("name", "Kitchen")),
    );

    h.panel.bring_up_tick().await;

    assert!(zone.is_online());
    assert_eq!(zone.name().as_deref(), Some("Hall"));
    assert_eq!(named.name().as_deref(), Some("Garage"));
    // Configured names are not looked up
    assert_eq!(h.sent("select.ZoneNames").len(), 1);

    h.panel.handle_error("The socket has been shut down").await;
    assert!(!zone.is_online());
    assert!(!named.is_online());

    // Refreshing an offline zone is a no-op
    h.clear_sent();
    zone.refresh(&h.panel).await;
    assert!(h.sent_names().is_empty());
}

// ---------------------------------------------------------------------------
// Push ingestion and polling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_pushes_drive_reconciliation_monitor_and_errors() {
    let h = Harness::new(TransportMode::Push);
    h.panel.register_listener(Arc::new(Zone::new(3)));
    h.panel.bring_up_tick().await;
    let mut events = h.panel.subscribe();
    h.clear_sent();

    h.queue(
        "getCOS.ZONE",
        Ok(Message::new("returnCOS.ZONE").with("bitSet", encode_bitset(&[3]))),
    );
    h.push(Message::new("msg.UNKNOWN")).await;
    h.push(
        Message::new("msgCOS.ALL")
            .with("APPOBJ_ZN", true)
            .with("APPOBJ_AREA", false),
    )
    .await;
    wait_until(|| h.sent("getSTAT.ZONE").len() == 1).await;
    assert!(h.sent("getCOS.AREA").is_empty());

    h.push(
        Message::new("msg.MONITOR")
            .with("timeStamp", "2021-03-04T10:11:12")
            .with("unique_id", 812i64)
            .with("event_ID", 33i64)
            .with("event_source", 2i64)
            .with("source_ID", 3i64)
            .with("event_text", "Zone 3 active"),
    )
    .await;
    let text = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if let Ok(PanelEvent::Monitor { text }) = events.recv().await {
                return text;
            }
        }
    })
    .await
    .expect("no monitor line");
    assert!(text.starts_with("2021-03-04T10:11:12: id 812"));
    assert!(text.ends_with("Zone 3 active"));

    h.push(Message::new("msg.error").with("error", "read: Connection reset by peer"))
        .await;
    wait_until(|| !h.panel.is_online()).await;
    assert_eq!(h.sent("device.disconnect").len(), 1);
}

#[tokio::test]
async fn test_polling_tick_in_push_mode() {
    let h = Harness::online(TransportMode::Push).await;
    h.clear_sent();

    h.panel.poll_tick().await;

    assert_eq!(h.shared.heartbeats.load(Ordering::SeqCst), 1);
    assert_eq!(h.sent_names(), vec!["getCOS.ZONE", "getCOS.AREA"]);
}

#[tokio::test]
async fn test_polling_tick_in_poll_mode_pages_live_events() {
    let h = Harness::online(TransportMode::Poll).await;
    h.clear_sent();
    h.queue("get.liveEvents", Ok(Message::new("return.sysevent")));
    h.queue("get.liveEvents", Ok(Message::new("return.sysevent")));

    h.panel.poll_tick().await;

    let pages: Vec<bool> = h
        .sent("get.liveEvents")
        .iter()
        .map(|m| bool_prop(m, "next"))
        .collect();
    assert_eq!(pages, vec![false, true, true]);
    assert_eq!(h.shared.heartbeats.load(Ordering::SeqCst), 0);
    assert_eq!(h.sent("getCOS.ZONE").len(), 1);
    assert_eq!(h.sent("getCOS.AREA").len(), 1);
}

#[tokio::test]
async fn test_polling_tick_is_idle_while_offline() {
    let h = Harness::new(TransportMode::Poll);
    h.panel.poll_tick().await;
    assert!(h.sent_names().is_empty());
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_discover_pages_through_names() {
    let h = Harness::online(TransportMode::Push).await;
    h.handle("select.ZoneNames", |request| {
        let start = request.value("index").unwrap().as_int("index").unwrap();
        (start..start + 46).fold(
            Message::new("return.ZoneNames").with("index", start),
            |m, i| match i {
                1 => m.with("name", "Front door"),
                2 => m.with("name", "Hall"),
                200 => m.with("name", "Garage"),
                _ => m.with("name", ""),
            },
        )
    });
    h.handle("select.AreaNames", |_| {
        (2..=8).fold(
            Message::new("return.AreaNames")
                .with("index", 1i64)
                .with("name", "House"),
            |m, _| m.with("name", ""),
        )
    });

    let found = h.panel.discover().await.unwrap();

    let summary: Vec<(ObjectClass, u32, &str)> = found
        .iter()
        .map(|d| (d.class, d.number, d.name.as_str()))
        .collect();
    assert_eq!(
        summary,
        vec![
            (ObjectClass::Zone, 1, "Front door"),
            (ObjectClass::Zone, 2, "Hall"),
            (ObjectClass::Zone, 200, "Garage"),
            (ObjectClass::Area, 1, "House"),
        ]
    );
    assert_eq!(h.sent("select.ZoneNames").len(), 8);
    assert_eq!(h.sent("select.AreaNames").len(), 1);
}

#[tokio::test]
async fn test_liveness_and_privileges() {
    let h = Harness::online(TransportMode::Push).await;
    assert!(h.panel.is_alive().await.unwrap());

    h.handle("get.privileges", |request| {
        if request.value("areaID") == Some(&Value::Int(5)) {
            Message::new("return.error").with("error", "FAULT_NO_ACCESS")
        } else {
            Message::new("return.bool").with("result", true)
        }
    });
    let granted = h.panel.user_privileges().await.unwrap();
    assert_eq!(granted.len(), 9);
    assert!(!granted[5]);
    assert_eq!(granted.iter().filter(|g| **g).count(), 8);
    assert!(h.panel.is_online());
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_gateway_exit_takes_bridge_offline() {
    let h = Harness::new(TransportMode::Push);
    let recorder = Arc::new(Recorder::default());
    h.panel.register_listener(recorder.clone());

    h.panel.start();
    wait_until(|| h.panel.is_online()).await;

    h.gateway.exit();
    wait_until(|| !h.panel.is_online()).await;
    assert!(h.panel.connection().gates.is_empty());
    assert_eq!(recorder.count("disconnected"), 1);

    h.panel.shutdown().await;
    assert_eq!(h.gateway.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_shutdown_logs_out_and_stops_gateway() {
    let h = Harness::online(TransportMode::Push).await;
    let recorder = Arc::new(Recorder::default());
    h.panel.register_listener(recorder.clone());

    h.panel.shutdown().await;

    assert_eq!(h.sent("device.disconnect").len(), 1);
    assert!(!h.panel.is_online());
    assert_eq!(recorder.count("disconnected"), 1);
    assert_eq!(h.gateway.stops.load(Ordering::SeqCst), 1);
}
