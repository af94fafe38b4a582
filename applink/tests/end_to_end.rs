//! End-to-end scenarios over the full engine + manager wiring.
//!
//! An in-memory transport double stands in for the device link; worker
//! threads run for real, so assertions poll with a bounded wait.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;

use applink::config::{ManagerConfig, ProtocolConfig};
use applink::interfaces::{
    DeviceInfo, HmiHandler, MediaManager, PermissionCheck, PolicyHandler, Transport,
    TransportError,
};
use applink::manager::application::HmiLevel;
use applink::manager::ApplicationManager;
use applink::protocol::packet::{control_frame, FrameType, Packet, ServiceType, Version};
use applink::rpc::{self, FunctionId, RpcMessage, RpcMessageType, RpcValue};
use applink::session::{ConnectionId, ConnectionKey};
use applink::ProtocolEngine;

#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<(ConnectionId, Bytes)>>,
    disconnected: Mutex<Vec<ConnectionId>>,
}

impl Transport for RecordingTransport {
    fn send(&self, connection: ConnectionId, bytes: Bytes) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push((connection, bytes));
        Ok(())
    }

    fn disconnect(&self, connection: ConnectionId) {
        self.disconnected.lock().unwrap().push(connection);
    }

    fn force_disconnect(&self, connection: ConnectionId) {
        self.disconnected.lock().unwrap().push(connection);
    }
}

struct AllowAllPolicy;

impl PolicyHandler for AllowAllPolicy {
    fn check_permissions(
        &self,
        _policy_app_id: &str,
        _hmi_level: &str,
        _function: &str,
        _params: &[String],
    ) -> PermissionCheck {
        PermissionCheck::allowed()
    }

    fn default_hmi_level(&self, _policy_app_id: &str) -> Option<String> {
        Some("NONE".to_owned())
    }

    fn on_apps_search_started(&self) {}
    fn on_apps_search_completed(&self) {}
    fn add_application(&self, _mac_address: &str, _policy_app_id: &str) {}
    fn record_removal_for_bad_behavior(&self, _policy_app_id: &str) {}
    fn kms_changed(&self, _kilometers: i32) {}
}

#[derive(Default)]
struct RecordingHmi {
    messages: Mutex<Vec<RpcMessage>>,
}

impl HmiHandler for RecordingHmi {
    fn send(&self, message: RpcMessage) {
        self.messages.lock().unwrap().push(message);
    }
}

struct NullMedia;

impl MediaManager for NullMedia {
    fn start_microphone(&self, _key: ConnectionKey) {}
    fn stop_microphone(&self, _key: ConnectionKey) {}
    fn start_audio_streaming(&self, _key: ConnectionKey) {}
    fn stop_audio_streaming(&self, _key: ConnectionKey) {}
    fn start_video_streaming(&self, _key: ConnectionKey) {}
    fn stop_video_streaming(&self, _key: ConnectionKey) {}
}

struct Harness {
    engine: Arc<ProtocolEngine>,
    manager: Arc<ApplicationManager>,
    transport: Arc<RecordingTransport>,
    hmi: Arc<RecordingHmi>,
}

impl Harness {
    fn new(protocol: ProtocolConfig, manager_config: ManagerConfig) -> Self {
        let transport = Arc::new(RecordingTransport::default());
        let engine = ProtocolEngine::new(protocol, transport.clone(), None);
        let hmi = Arc::new(RecordingHmi::default());
        let manager = ApplicationManager::new(
            manager_config,
            Arc::clone(&engine),
            Arc::new(AllowAllPolicy),
            hmi.clone(),
            Arc::new(NullMedia),
        );
        engine.start();
        manager.start();
        Self {
            engine,
            manager,
            transport,
            hmi,
        }
    }

    fn connect(&self, connection: ConnectionId) {
        self.engine.on_connection_established(
            connection,
            DeviceInfo {
                handle: connection.as_u32(),
                name: format!("device-{connection}"),
                mac_address: "aa:bb:cc:dd".into(),
            },
        );
    }

    /// Opens an RPC session and waits for the StartServiceAck.
    fn open_session(&self, connection: ConnectionId) -> ConnectionKey {
        let before = self.sent_count();
        let start = Packet::control(
            Version::V3,
            ServiceType::Rpc,
            control_frame::START_SERVICE,
            0,
            0,
            Bytes::new(),
        );
        self.engine.on_bytes_received(connection, &start.serialize());
        assert!(
            wait_for(Duration::from_secs(2), || self.sent_count() > before),
            "no start service ack arrived"
        );
        let frames = self.sent_frames();
        let ack = frames[before..]
            .iter()
            .find(|p| p.frame_data == control_frame::START_SERVICE_ACK)
            .expect("start service ack");
        ConnectionKey::from_pair(connection, ack.session_id)
    }

    fn register(&self, key: ConnectionKey, app_name: &str) {
        let mut params = RpcValue::object();
        params.set("appID", app_name);
        params.set("appName", app_name);
        params.set("isMediaApplication", false);
        let request = RpcMessage {
            key,
            function_id: FunctionId::REGISTER_APP_INTERFACE,
            correlation_id: 1,
            message_type: RpcMessageType::Request,
            version: Version::V3,
            params,
            binary: None,
        };
        self.send_rpc(&request);
        assert!(
            wait_for(Duration::from_secs(2), || self.manager.is_registered(key)),
            "registration did not complete"
        );
    }

    /// Wraps an RPC message into a Single frame and feeds it inbound.
    fn send_rpc(&self, message: &RpcMessage) {
        let (connection, session_id) = message.key.pair();
        let packet = Packet {
            version: message.version,
            protected: false,
            frame_type: FrameType::Single,
            service: ServiceType::Rpc,
            frame_data: 0,
            session_id,
            message_id: 0,
            payload: rpc::encode_payload(message).unwrap(),
        };
        self.engine.on_bytes_received(connection, &packet.serialize());
    }

    fn sent_count(&self) -> usize {
        self.transport.sent.lock().unwrap().len()
    }

    fn sent_frames(&self) -> Vec<Packet> {
        self.transport
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, bytes)| Packet::deserialize(bytes, usize::MAX >> 1).unwrap().0)
            .collect()
    }

    /// Every decoded RPC message that reached the wire.
    fn mobile_rpc_messages(&self) -> Vec<RpcMessage> {
        self.transport
            .sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(connection, bytes)| {
                let (packet, _) = Packet::deserialize(bytes, usize::MAX >> 1).ok()?;
                if packet.frame_type != FrameType::Single || packet.service != ServiceType::Rpc {
                    return None;
                }
                rpc::decode_payload(
                    ConnectionKey::from_pair(*connection, packet.session_id),
                    packet.version,
                    &packet.payload,
                )
                .ok()
            })
            .collect()
    }

    fn shutdown(self) {
        self.manager.stop();
        self.engine.stop();
    }
}

fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

const CONN: ConnectionId = ConnectionId::new(7);

#[test]
fn start_service_ack_carries_head_unit_version() {
    let harness = Harness::new(
        ProtocolConfig {
            heart_beat_timeout: Some(Duration::from_secs(30)),
            enable_protocol_4: false,
            ..ProtocolConfig::default()
        },
        ManagerConfig::default(),
    );
    harness.connect(CONN);
    let key = harness.open_session(CONN);

    let frames = harness.sent_frames();
    let ack = frames
        .iter()
        .find(|p| p.frame_data == control_frame::START_SERVICE_ACK)
        .unwrap();
    assert_eq!(ack.version, Version::V3);
    assert_eq!(ack.service, ServiceType::Rpc);
    assert_eq!(ack.payload.len(), 4, "v2+ rpc ack carries the hash id");
    assert_eq!(key.pair().1, ack.session_id);

    harness.shutdown();
}

#[test]
fn single_frame_rpc_reaches_the_manager_and_is_answered() {
    let harness = Harness::new(ProtocolConfig::default(), ManagerConfig::default());
    harness.connect(CONN);
    let key = harness.open_session(CONN);
    harness.register(key, "echo-app");

    let messages = harness.mobile_rpc_messages();
    let response = messages
        .iter()
        .find(|m| {
            m.function_id == FunctionId::REGISTER_APP_INTERFACE
                && m.message_type == RpcMessageType::Response
        })
        .expect("register response");
    assert_eq!(response.key, key);
    assert_eq!(response.params.get("success").unwrap().as_bool(), Some(true));

    harness.shutdown();
}

#[test]
fn multi_frame_request_is_reassembled_once() {
    let harness = Harness::new(ProtocolConfig::default(), ManagerConfig::default());
    harness.connect(CONN);
    let key = harness.open_session(CONN);
    let (connection, session_id) = key.pair();

    // A registration padded into multi-frame territory.
    let mut params = RpcValue::object();
    params.set("appID", "bulk-app");
    params.set("appName", "bulk-app");
    params.set("padding", "x".repeat(4000));
    let request = RpcMessage {
        key,
        function_id: FunctionId::REGISTER_APP_INTERFACE,
        correlation_id: 1,
        message_type: RpcMessageType::Request,
        version: Version::V3,
        params,
        binary: None,
    };
    let payload = rpc::encode_payload(&request).unwrap();

    let chunk = 500usize;
    let total = payload.len();
    let count = total.div_ceil(chunk);
    let mut descriptor = Vec::new();
    descriptor.extend_from_slice(&(total as u32).to_be_bytes());
    descriptor.extend_from_slice(&(count as u32).to_be_bytes());
    let first = Packet {
        version: Version::V3,
        protected: false,
        frame_type: FrameType::First,
        service: ServiceType::Rpc,
        frame_data: 0,
        session_id,
        message_id: 1,
        payload: Bytes::from(descriptor),
    };
    harness.engine.on_bytes_received(connection, &first.serialize());

    for i in 0..count {
        let start = i * chunk;
        let end = usize::min(start + chunk, total);
        let is_last = i == count - 1;
        let packet = Packet {
            version: Version::V3,
            protected: false,
            frame_type: FrameType::Consecutive,
            service: ServiceType::Rpc,
            frame_data: if is_last { 0 } else { (i % 0x7F) as u8 + 1 },
            session_id,
            message_id: 1,
            payload: payload.slice(start..end),
        };
        harness.engine.on_bytes_received(connection, &packet.serialize());
    }

    assert!(
        wait_for(Duration::from_secs(2), || harness.manager.is_registered(key)),
        "reassembled registration did not land"
    );

    harness.shutdown();
}

#[test]
fn flood_of_requests_unregisters_the_app() {
    let harness = Harness::new(
        ProtocolConfig {
            message_frequency_time: Duration::from_secs(1),
            message_max_frequency: 10,
            ..ProtocolConfig::default()
        },
        ManagerConfig::default(),
    );
    harness.connect(CONN);
    let key = harness.open_session(CONN);
    harness.register(key, "flooder");

    // Drown the head unit; the meter counts every non-streaming data
    // frame, so the session start and registration already consumed a
    // few slots. The burst below trips it with margin.
    for correlation_id in 0..16 {
        let message = RpcMessage {
            key,
            function_id: FunctionId(13),
            correlation_id,
            message_type: RpcMessageType::Request,
            version: Version::V3,
            params: RpcValue::object(),
            binary: None,
        };
        harness.send_rpc(&message);
    }

    assert!(
        wait_for(Duration::from_secs(2), || !harness.manager.is_registered(key)),
        "flooding app was not unregistered"
    );
    assert!(wait_for(Duration::from_secs(2), || {
        harness.mobile_rpc_messages().iter().any(|m| {
            m.function_id == FunctionId::ON_APP_INTERFACE_UNREGISTERED
                && m.params.get("reason").and_then(RpcValue::as_str) == Some("TOO_MANY_REQUESTS")
        })
    }));

    harness.shutdown();
}

#[test]
fn unregister_request_closes_the_session() {
    let harness = Harness::new(ProtocolConfig::default(), ManagerConfig::default());
    harness.connect(CONN);
    let key = harness.open_session(CONN);
    harness.register(key, "leaver");

    let request = RpcMessage {
        key,
        function_id: FunctionId::UNREGISTER_APP_INTERFACE,
        correlation_id: 2,
        message_type: RpcMessageType::Request,
        version: Version::V3,
        params: RpcValue::object(),
        binary: None,
    };
    harness.send_rpc(&request);

    assert!(
        wait_for(Duration::from_secs(2), || !harness.manager.is_registered(key)),
        "app stayed registered"
    );
    // The final response flushes, then the engine winds the session down
    // and the connection with it.
    assert!(wait_for(Duration::from_secs(2), || {
        !harness.transport.disconnected.lock().unwrap().is_empty()
    }));
    let frames = harness.sent_frames();
    assert!(frames
        .iter()
        .any(|p| p.frame_data == control_frame::END_SERVICE && p.service == ServiceType::Rpc));

    harness.shutdown();
}

#[test]
fn requests_route_to_the_hmi_when_allowed() {
    let harness = Harness::new(ProtocolConfig::default(), ManagerConfig::default());
    harness.connect(CONN);
    let key = harness.open_session(CONN);
    harness.register(key, "router");

    let message = RpcMessage {
        key,
        function_id: FunctionId(13),
        correlation_id: 3,
        message_type: RpcMessageType::Request,
        version: Version::V3,
        params: RpcValue::object(),
        binary: None,
    };
    harness.send_rpc(&message);

    assert!(wait_for(Duration::from_secs(2), || {
        harness
            .hmi
            .messages
            .lock()
            .unwrap()
            .iter()
            .any(|m| m.function_id == FunctionId(13))
    }));

    // The HMI answer travels back to the mobile side.
    let mut params = RpcValue::object();
    params.set("success", true);
    params.set("resultCode", "SUCCESS");
    harness.manager.on_hmi_message(RpcMessage {
        key,
        function_id: FunctionId(13),
        correlation_id: 3,
        message_type: RpcMessageType::Response,
        version: Version::V3,
        params,
        binary: None,
    });
    assert!(wait_for(Duration::from_secs(2), || {
        harness.mobile_rpc_messages().iter().any(|m| {
            m.function_id == FunctionId(13) && m.message_type == RpcMessageType::Response
        })
    }));

    harness.shutdown();
}

#[test]
fn idle_session_expires_when_heartbeats_are_on() {
    let harness = Harness::new(
        ProtocolConfig {
            heart_beat_timeout: Some(Duration::from_millis(60)),
            ..ProtocolConfig::default()
        },
        ManagerConfig::default(),
    );
    harness.connect(CONN);
    let key = harness.open_session(CONN);
    harness.register(key, "sleeper");

    // Registration armed the per-session idle timer; silence kills it.
    assert!(
        wait_for(Duration::from_secs(2), || !harness.manager.is_registered(key)),
        "idle session survived"
    );
    assert!(wait_for(Duration::from_secs(2), || {
        !harness.transport.disconnected.lock().unwrap().is_empty()
    }));

    harness.shutdown();
}

#[test]
fn activation_promotes_to_full_on_the_wire() {
    let harness = Harness::new(ProtocolConfig::default(), ManagerConfig::default());
    harness.connect(CONN);
    let key = harness.open_session(CONN);
    harness.register(key, "front");

    harness.manager.activate_application(key).unwrap();
    assert_eq!(harness.manager.hmi_level_of(key), Some(HmiLevel::Full));

    assert!(wait_for(Duration::from_secs(2), || {
        harness.mobile_rpc_messages().iter().any(|m| {
            m.function_id == FunctionId::ON_HMI_STATUS
                && m.params.get("hmiLevel").and_then(RpcValue::as_str) == Some("FULL")
        })
    }));

    harness.shutdown();
}
