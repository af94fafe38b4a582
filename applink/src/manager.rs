//! Application manager: registration lifecycle, HMI-level arbitration,
//! request admission and mobile↔HMI routing.
//!
//! # Architecture
//!
//! Four pipeline workers (`from-mobile`, `to-mobile`, `from-hmi`,
//! `to-hmi`) plus a fifth draining microphone chunks, each on its own
//! thread behind a bounded queue. The application set lives in an arena
//! behind a read-write lock; the waiting-registration and forbidden sets
//! carry their own locks. Listeners and collaborators only ever see app
//! ids (connection keys), never references into the arena.

pub mod application;
pub mod arbitration;
pub mod registry;
pub mod requests;
mod timer;

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::JoinHandle;

use bytes::Bytes;

use crate::config::ManagerConfig;
use crate::engine::queue::{MessageQueue, QueueItem};
use crate::engine::ProtocolEngine;
use crate::interfaces::{
    HmiHandler, MediaManager, PolicyHandler, RawMessage, SessionEventSink,
};
use crate::manager::application::{
    ApiVersion, Application, AppTypes, AudioStreamingState, HmiLevel, SystemContext,
};
use crate::manager::arbitration::{ActivateError, StatusChange};
use crate::manager::registry::AppRegistry;
use crate::manager::requests::{AdmitResult, RequestController};
use crate::manager::timer::Watchdog;
use crate::protocol::packet::{ServiceType, Version};
use crate::rpc::{
    self, FunctionId, Member, ResultCode, RpcMessage, RpcMessageType, RpcValue, Schema,
    UnregisteredReason,
};
use crate::session::{ConnectionId, ConnectionKey};
use crate::trace::{debug, error, info, warn};

impl QueueItem for RawMessage {}
impl QueueItem for RpcMessage {}

/// A message headed for the mobile side, with its end-of-session flag.
struct OutgoingMobile {
    message: RpcMessage,
    is_final: bool,
}

impl QueueItem for OutgoingMobile {}

/// One microphone capture chunk awaiting the audio worker.
struct AudioChunk {
    key: ConnectionKey,
    data: Bytes,
}

impl QueueItem for AudioChunk {}

/// EndService bookkeeping per streamable service of an app.
#[derive(Debug, Clone, Copy, Default)]
struct ServiceStatus {
    end_sent: bool,
    end_ack: bool,
}

impl ServiceStatus {
    /// The teardown is settled when sent and ack agree.
    const fn settled(self) -> bool {
        self.end_sent == self.end_ack
    }
}

/// Owner of the registered-application set and the RPC routing fabric.
pub struct ApplicationManager {
    config: ManagerConfig,
    engine: Arc<ProtocolEngine>,
    policy: Arc<dyn PolicyHandler>,
    hmi: Arc<dyn HmiHandler>,
    media: Arc<dyn MediaManager>,

    registry: RwLock<AppRegistry>,
    /// Hashes of (policy app id, device name) pairs banned for bad behavior.
    forbidden: Mutex<HashSet<u64>>,
    requests: Arc<RequestController>,
    /// Process-wide correlation id source for HMI-originated requests.
    correlation_id: AtomicU32,
    /// Single-entry microphone ownership flag.
    audio_pass_thru: Mutex<Option<ConnectionKey>>,
    service_status: Mutex<HashMap<ConnectionKey, HashMap<ServiceType, ServiceStatus>>>,
    streaming_watchdog: Watchdog,
    navi_app_to_stop: Mutex<Option<ConnectionKey>>,
    low_voltage: AtomicBool,
    all_apps_allowed: AtomicBool,
    self_ref: Mutex<Weak<ApplicationManager>>,

    from_mobile: Arc<MessageQueue<RawMessage>>,
    to_mobile: Arc<MessageQueue<OutgoingMobile>>,
    from_hmi: Arc<MessageQueue<RpcMessage>>,
    to_hmi: Arc<MessageQueue<RpcMessage>>,
    audio_chunks: Arc<MessageQueue<AudioChunk>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ApplicationManager {
    #[must_use]
    pub fn new(
        config: ManagerConfig,
        engine: Arc<ProtocolEngine>,
        policy: Arc<dyn PolicyHandler>,
        hmi: Arc<dyn HmiHandler>,
        media: Arc<dyn MediaManager>,
    ) -> Arc<Self> {
        let requests = RequestController::new(&config);
        let queue_capacity = config.queue_capacity;
        let manager = Arc::new(Self {
            engine: Arc::clone(&engine),
            policy,
            hmi,
            media,
            registry: RwLock::new(AppRegistry::new()),
            forbidden: Mutex::new(HashSet::new()),
            requests,
            correlation_id: AtomicU32::new(0),
            audio_pass_thru: Mutex::new(None),
            service_status: Mutex::new(HashMap::new()),
            streaming_watchdog: Watchdog::new(),
            navi_app_to_stop: Mutex::new(None),
            low_voltage: AtomicBool::new(false),
            all_apps_allowed: AtomicBool::new(true),
            self_ref: Mutex::new(Weak::new()),
            from_mobile: Arc::new(MessageQueue::new(queue_capacity)),
            to_mobile: Arc::new(MessageQueue::new(queue_capacity)),
            from_hmi: Arc::new(MessageQueue::new(queue_capacity)),
            to_hmi: Arc::new(MessageQueue::new(queue_capacity)),
            audio_chunks: Arc::new(MessageQueue::new(queue_capacity)),
            workers: Mutex::new(Vec::new()),
            config,
        });

        *manager.self_ref.lock().expect("self ref poisoned") = Arc::downgrade(&manager);

        let sink: Arc<dyn SessionEventSink> = manager.clone();
        engine.set_sink(&sink);

        let weak = Arc::downgrade(&manager);
        manager
            .requests
            .set_timeout_handler(Box::new(move |key, correlation_id, function_id| {
                if let Some(manager) = weak.upgrade() {
                    manager.on_request_timeout(key, correlation_id, function_id);
                }
            }));

        manager
    }

    fn weak(&self) -> Weak<ApplicationManager> {
        self.self_ref.lock().expect("self ref poisoned").clone()
    }

    /// Spawns the pipeline workers and the request sweeper.
    pub fn start(self: &Arc<Self>) {
        self.requests.start();
        let mut workers = self.workers.lock().expect("workers poisoned");

        macro_rules! worker {
            ($name:literal, $queue:ident, $handler:ident) => {{
                let manager = Arc::clone(self);
                let queue = Arc::clone(&self.$queue);
                workers.push(
                    std::thread::Builder::new()
                        .name($name.into())
                        .spawn(move || {
                            while let Some(item) = queue.pop() {
                                manager.$handler(item);
                            }
                        })
                        .expect(concat!("failed to spawn ", $name)),
                );
            }};
        }

        worker!("applink-am-from-mobile", from_mobile, handle_mobile_message);
        worker!("applink-am-to-mobile", to_mobile, handle_outgoing_mobile);
        worker!("applink-am-from-hmi", from_hmi, handle_hmi_message);
        worker!("applink-am-to-hmi", to_hmi, handle_outgoing_hmi);
        worker!("applink-am-audio", audio_chunks, handle_audio_chunk);
    }

    /// Signals shutdown and joins every worker.
    pub fn stop(&self) {
        self.from_mobile.close();
        self.to_mobile.close();
        self.from_hmi.close();
        self.to_hmi.close();
        self.audio_chunks.close();
        self.streaming_watchdog.stop();
        self.requests.stop();
        for handle in self.workers.lock().expect("workers poisoned").drain(..) {
            let _ = handle.join();
        }
    }

    // ------------------------------------------------------------------
    // External entry points
    // ------------------------------------------------------------------

    /// Entry point for the HMI handler's inbound messages.
    pub fn on_hmi_message(&self, message: RpcMessage) {
        if self.from_hmi.push(message).is_some() {
            warn!("from-hmi queue overflow");
        }
    }

    /// Schedules a message toward the mobile side.
    pub fn send_message_to_mobile(&self, message: RpcMessage, is_final: bool) {
        if self.to_mobile.push(OutgoingMobile { message, is_final }).is_some() {
            warn!("to-mobile queue overflow");
        }
    }

    /// Schedules a message toward the HMI.
    pub fn send_message_to_hmi(&self, message: RpcMessage) {
        if self.to_hmi.push(message).is_some() {
            warn!("to-hmi queue overflow");
        }
    }

    /// User-driven app activation; moves the app to HMI Full.
    pub fn activate_application(&self, key: ConnectionKey) -> Result<(), ActivateError> {
        let changes =
            arbitration::activate(&mut self.registry.write().expect("registry poisoned"), key)?;
        self.apply_status_changes(changes);
        Ok(())
    }

    /// HMI-driven level assignment (deactivation, exit, phone call).
    pub fn change_hmi_level(&self, key: ConnectionKey, to: HmiLevel) {
        let change = arbitration::change_level(
            &mut self.registry.write().expect("registry poisoned"),
            key,
            to,
        );
        if let Some(change) = change {
            self.apply_status_changes(vec![change]);
        }
    }

    /// Allows or blocks all registrations, per user consent.
    pub fn set_all_apps_allowed(&self, allowed: bool) {
        self.all_apps_allowed.store(allowed, Ordering::Relaxed);
    }

    pub fn on_low_voltage(&self) {
        info!("low voltage: entering quiescent state");
        self.low_voltage.store(true, Ordering::Relaxed);
        self.requests.on_low_voltage();
    }

    pub fn on_wake_up(&self) {
        info!("wake up: resuming normal operation");
        self.low_voltage.store(false, Ordering::Relaxed);
        self.requests.on_wake_up();
    }

    #[must_use]
    pub fn is_low_voltage(&self) -> bool {
        self.low_voltage.load(Ordering::Relaxed)
    }

    /// Fresh correlation id for a head-unit-originated request.
    #[must_use]
    pub fn next_hmi_correlation_id(&self) -> u32 {
        self.correlation_id
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1)
    }

    // ------------------------------------------------------------------
    // Audio pass-through
    // ------------------------------------------------------------------

    /// Claims the microphone for `key` and starts capture. False when
    /// another session already holds it.
    pub fn start_audio_pass_thru(&self, key: ConnectionKey) -> bool {
        {
            let mut active = self.audio_pass_thru.lock().expect("pass-thru poisoned");
            if active.is_some() {
                return false;
            }
            *active = Some(key);
        }
        self.media.start_microphone(key);
        true
    }

    /// Releases the microphone; idempotent.
    pub fn stop_audio_pass_thru(&self, key: ConnectionKey) -> bool {
        let released = {
            let mut active = self.audio_pass_thru.lock().expect("pass-thru poisoned");
            if *active == Some(key) {
                *active = None;
                true
            } else {
                false
            }
        };
        if released {
            self.media.stop_microphone(key);
        }
        released
    }

    /// Accepts one captured chunk from the media layer.
    pub fn on_audio_chunk(&self, key: ConnectionKey, data: Bytes) {
        if *self.audio_pass_thru.lock().expect("pass-thru poisoned") != Some(key) {
            error!(key = %key, "audio chunk while pass-through is not active");
            return;
        }
        if self.audio_chunks.push(AudioChunk { key, data }).is_some() {
            warn!("audio queue overflow, chunk dropped");
        }
    }

    // ------------------------------------------------------------------
    // Snapshot accessors
    // ------------------------------------------------------------------

    #[must_use]
    pub fn is_registered(&self, key: ConnectionKey) -> bool {
        self.registry
            .read()
            .expect("registry poisoned")
            .get(key)
            .is_some()
    }

    #[must_use]
    pub fn hmi_level_of(&self, key: ConnectionKey) -> Option<HmiLevel> {
        self.registry
            .read()
            .expect("registry poisoned")
            .get(key)
            .map(|app| app.hmi_level)
    }

    #[must_use]
    pub fn audio_state_of(&self, key: ConnectionKey) -> Option<AudioStreamingState> {
        self.registry
            .read()
            .expect("registry poisoned")
            .get(key)
            .map(|app| app.audio_state)
    }

    // ------------------------------------------------------------------
    // Mobile pipeline
    // ------------------------------------------------------------------

    fn handle_mobile_message(&self, raw: RawMessage) {
        let message = match rpc::decode_payload(raw.key, raw.version, &raw.payload) {
            Ok(message) => message,
            Err(err) => {
                warn!(key = %raw.key, error = %err, "undecodable mobile payload dropped");
                return;
            }
        };

        // A v1 peer naming a function this head unit cannot resolve is
        // answered without dispatching.
        if raw.version == Version::V1 && message.function_id == FunctionId::UNKNOWN {
            warn!(key = %raw.key, "v1 message with unknown function id");
            self.send_message_to_mobile(
                RpcMessage::negative_response(
                    raw.key,
                    FunctionId::GENERIC_RESPONSE,
                    message.correlation_id,
                    Version::V1,
                    ResultCode::UnsupportedVersion,
                ),
                false,
            );
            return;
        }

        if raw.version >= Version::V2 {
            if let Err(err) = schema_for(message.function_id).validate(&message.params) {
                warn!(key = %raw.key, error = %err, "mobile message failed validation");
                if message.message_type == RpcMessageType::Request {
                    self.send_message_to_mobile(
                        RpcMessage::negative_response(
                            raw.key,
                            message.function_id,
                            message.correlation_id,
                            message.version,
                            ResultCode::InvalidData,
                        ),
                        false,
                    );
                }
                return;
            }
        }

        match message.message_type {
            RpcMessageType::Request => self.handle_mobile_request(message),
            RpcMessageType::Response | RpcMessageType::Notification => {
                self.send_message_to_hmi(message);
            }
        }
    }

    fn handle_mobile_request(&self, message: RpcMessage) {
        if self.is_low_voltage() {
            warn!("low voltage is active, mobile request dropped");
            return;
        }

        if message.function_id == FunctionId::REGISTER_APP_INTERFACE {
            self.register_application(&message);
            return;
        }

        let key = message.key;
        let app = self
            .registry
            .read()
            .expect("registry poisoned")
            .get(key)
            .cloned();
        let Some(app) = app else {
            self.send_message_to_mobile(
                RpcMessage::negative_response(
                    key,
                    message.function_id,
                    message.correlation_id,
                    message.version,
                    ResultCode::ApplicationNotRegistered,
                ),
                false,
            );
            return;
        };

        if message.function_id == FunctionId::UNREGISTER_APP_INTERFACE {
            let mut params = RpcValue::object();
            params.set("success", true);
            params.set("resultCode", ResultCode::Success.as_str());
            self.send_message_to_mobile(
                RpcMessage {
                    key,
                    function_id: FunctionId::UNREGISTER_APP_INTERFACE,
                    correlation_id: message.correlation_id,
                    message_type: RpcMessageType::Response,
                    version: app.protocol_version,
                    params,
                    binary: None,
                },
                true,
            );
            self.unregister_application(key, ResultCode::Success, false, false);
            return;
        }

        match self.requests.admit_mobile_request(
            key,
            message.correlation_id,
            message.function_id,
            app.hmi_level,
        ) {
            AdmitResult::Success => {}
            AdmitResult::TooManyPendingRequests => {
                self.send_message_to_mobile(
                    RpcMessage::negative_response(
                        key,
                        message.function_id,
                        message.correlation_id,
                        app.protocol_version,
                        ResultCode::TooManyPendingRequests,
                    ),
                    false,
                );
                return;
            }
            AdmitResult::TooManyRequests => {
                self.send_unregistered_notification(key, UnregisteredReason::TooManyRequests);
                self.unregister_application(key, ResultCode::TooManyPendingRequests, false, false);
                return;
            }
            AdmitResult::NoneLevelBurst => {
                self.send_unregistered_notification(
                    key,
                    UnregisteredReason::RequestWhileInNoneHmiLevel,
                );
                self.policy
                    .record_removal_for_bad_behavior(&app.policy_app_id);
                self.forbid_application(&app.policy_app_id, &app.device.name);
                self.unregister_application(key, ResultCode::InvalidEnum, false, false);
                return;
            }
        }

        let params = param_names(&message.params);
        let check = self.policy.check_permissions(
            &app.policy_app_id,
            app.hmi_level.as_str(),
            &message.function_id.policy_name(),
            &params,
        );
        if !check.is_allowed() {
            warn!(
                key = %key,
                function = %message.function_id.policy_name(),
                "request blocked by policies"
            );
            let code = match check.verdict {
                Some(crate::interfaces::PermissionVerdict::UserDisallowed) => {
                    ResultCode::UserDisallowed
                }
                _ => ResultCode::Disallowed,
            };
            self.requests.terminate_request(key, message.correlation_id);
            self.send_message_to_mobile(
                RpcMessage::negative_response(
                    key,
                    message.function_id,
                    message.correlation_id,
                    app.protocol_version,
                    code,
                ),
                false,
            );
            return;
        }

        self.send_message_to_hmi(message);
    }

    fn handle_outgoing_mobile(&self, outgoing: OutgoingMobile) {
        let OutgoingMobile {
            mut message,
            is_final,
        } = outgoing;
        let app = self
            .registry
            .read()
            .expect("registry poisoned")
            .get(message.key)
            .cloned();

        message.version = match &app {
            Some(app) => app.protocol_version,
            None if message.result_code_str() == Some("UNSUPPORTED_VERSION") => Version::V1,
            None => self
                .engine
                .protocol_version_of(message.key)
                .unwrap_or_else(|| self.engine.supported_version()),
        };

        match message.message_type {
            RpcMessageType::Response => {
                // The answer retires the pending request.
                self.requests
                    .terminate_request(message.key, message.correlation_id);
            }
            RpcMessageType::Notification => {
                // HMI-origin traffic is subject to policy.
                if let Some(app) = &app {
                    let check = self.policy.check_permissions(
                        &app.policy_app_id,
                        app.hmi_level.as_str(),
                        &message.function_id.policy_name(),
                        &param_names(&message.params),
                    );
                    if !check.is_allowed() {
                        debug!(
                            key = %message.key,
                            function = %message.function_id.policy_name(),
                            "notification dropped by policies"
                        );
                        return;
                    }
                }
            }
            RpcMessageType::Request => {}
        }

        if let Err(err) = schema_for(message.function_id).validate(&message.params) {
            warn!(key = %message.key, error = %err, "outbound message fails validation");
        }

        match rpc::encode_payload(&message) {
            Ok(payload) => {
                self.engine.send_message_to_mobile(
                    RawMessage {
                        key: message.key,
                        version: message.version,
                        service: ServiceType::Rpc,
                        payload,
                    },
                    is_final,
                );
            }
            Err(err) => error!(key = %message.key, error = %err, "payload encoding failed"),
        }
    }

    // ------------------------------------------------------------------
    // HMI pipeline
    // ------------------------------------------------------------------

    fn handle_hmi_message(&self, message: RpcMessage) {
        if self.is_low_voltage() {
            warn!("low voltage is active, hmi message dropped");
            return;
        }

        let mut message = message;
        if let Err(err) = schema_for(message.function_id).validate(&message.params) {
            match message.message_type {
                RpcMessageType::Notification | RpcMessageType::Request => {
                    warn!(error = %err, "invalid hmi message dropped");
                    return;
                }
                RpcMessageType::Response => {
                    // Surface a synthetic failure to whoever awaits it.
                    let mut params = RpcValue::object();
                    params.set("success", false);
                    params.set("resultCode", ResultCode::InvalidData.as_str());
                    params.set("info", "Received invalid data on HMI response");
                    message.params = params;
                }
            }
        }

        match message.message_type {
            RpcMessageType::Response => {
                if self.requests.terminate_hmi_request(message.correlation_id) {
                    // Answered a head-unit-originated request; consumed here.
                    debug!(correlation_id = message.correlation_id, "hmi request settled");
                } else {
                    self.send_message_to_mobile(message, false);
                }
            }
            RpcMessageType::Notification => self.send_message_to_mobile(message, false),
            RpcMessageType::Request => {
                debug!(
                    function = message.function_id.0,
                    "hmi request consumed without routing"
                );
            }
        }
    }

    fn handle_outgoing_hmi(&self, message: RpcMessage) {
        self.hmi.send(message);
    }

    fn handle_audio_chunk(&self, chunk: AudioChunk) {
        let version = self
            .registry
            .read()
            .expect("registry poisoned")
            .get(chunk.key)
            .map_or(Version::V2, |app| app.protocol_version);
        let mut notification = RpcMessage::notification(
            chunk.key,
            FunctionId::ON_AUDIO_PASS_THRU,
            version,
            RpcValue::object(),
        );
        notification.binary = Some(chunk.data);
        self.send_message_to_mobile(notification, false);
    }

    // ------------------------------------------------------------------
    // Registration lifecycle
    // ------------------------------------------------------------------

    fn register_application(&self, message: &RpcMessage) {
        self.policy.on_apps_search_started();
        let key = message.key;
        let reply_error = |code: ResultCode| {
            self.send_message_to_mobile(
                RpcMessage::negative_response(
                    key,
                    FunctionId::REGISTER_APP_INTERFACE,
                    message.correlation_id,
                    message.version,
                    code,
                ),
                false,
            );
        };

        if !self.all_apps_allowed.load(Ordering::Relaxed) {
            info!(key = %key, "registration refused: apps disabled by user");
            reply_error(ResultCode::Disallowed);
            return;
        }

        let (connection, _) = key.pair();
        let Some(device) = self.engine.device_info(connection) else {
            error!(key = %key, "registration failed: no connection data");
            reply_error(ResultCode::GenericError);
            return;
        };

        let params = &message.params;
        let Some(policy_app_id) = params.get("appID").and_then(RpcValue::as_str) else {
            reply_error(ResultCode::InvalidData);
            return;
        };
        let Some(name) = params.get("appName").and_then(RpcValue::as_str) else {
            reply_error(ResultCode::InvalidData);
            return;
        };

        if self.is_application_forbidden(policy_app_id, &device.name) {
            warn!(key = %key, app = policy_app_id, "registration refused: forbidden app");
            reply_error(ResultCode::Disallowed);
            return;
        }
        if self.is_registered(key) {
            reply_error(ResultCode::ApplicationRegisteredAlready);
            return;
        }

        let hmi_types: Vec<&str> = params
            .get("appHMIType")
            .and_then(RpcValue::as_array)
            .map(|items| items.iter().filter_map(RpcValue::as_str).collect())
            .unwrap_or_default();
        let types = AppTypes {
            is_media: params
                .get("isMediaApplication")
                .and_then(RpcValue::as_bool)
                .unwrap_or(false),
            is_navi: hmi_types.contains(&"NAVIGATION"),
            is_voice_communication: hmi_types.contains(&"COMMUNICATION"),
        };
        let api_version = params.get("syncMsgVersion").map_or_else(ApiVersion::default, |v| {
            ApiVersion {
                major: v.get("majorVersion").and_then(RpcValue::as_i64).unwrap_or(0),
                minor: v.get("minorVersion").and_then(RpcValue::as_i64).unwrap_or(0),
            }
        });

        // Session bookkeeping happens before the app becomes visible.
        self.engine.bind_protocol_version(key, message.version);
        if message.version >= Version::V3 && self.engine.heartbeat_supported() {
            self.engine.start_session_heartbeat(key);
        }
        self.policy.add_application(&device.mac_address, policy_app_id);
        let default_level = HmiLevel::from_policy_str(
            self.policy.default_hmi_level(policy_app_id).as_deref(),
        );

        {
            let mut registry = self.registry.write().expect("registry poisoned");
            let hmi_app_id = registry
                .take_waiting(policy_app_id)
                .map(|waiting| waiting.hmi_app_id)
                .or_else(|| registry.resumed_hmi_app_id(policy_app_id))
                .unwrap_or_else(|| registry.generate_hmi_app_id());
            registry.forget_resumed(policy_app_id);

            registry.insert(Application {
                app_id: key,
                hmi_app_id,
                policy_app_id: policy_app_id.to_owned(),
                name: name.to_owned(),
                device,
                language: params
                    .get("languageDesired")
                    .and_then(RpcValue::as_i64)
                    .unwrap_or(0),
                ui_language: params
                    .get("hmiDisplayLanguageDesired")
                    .and_then(RpcValue::as_i64)
                    .unwrap_or(0),
                api_version,
                protocol_version: message.version,
                grammar_id: rand::random(),
                types,
                hmi_level: default_level,
                audio_state: AudioStreamingState::NotAudible,
                system_context: SystemContext::Main,
                streaming_allowed: false,
            });
            info!(key = %key, app = policy_app_id, level = default_level.as_str(), "application registered");
        }

        let mut response_params = RpcValue::object();
        response_params.set("success", true);
        response_params.set("resultCode", ResultCode::Success.as_str());
        response_params.set("language", params.get("languageDesired").cloned().unwrap_or(RpcValue::Int(0)));
        self.send_message_to_mobile(
            RpcMessage {
                key,
                function_id: FunctionId::REGISTER_APP_INTERFACE,
                correlation_id: message.correlation_id,
                message_type: RpcMessageType::Response,
                version: message.version,
                params: response_params,
                binary: None,
            },
            false,
        );
        self.send_hmi_status_for(key);
        self.policy.on_apps_search_completed();
    }

    /// Removes an application and runs every teardown side effect.
    pub fn unregister_application(
        &self,
        key: ConnectionKey,
        reason: ResultCode,
        is_resuming: bool,
        is_unexpected_disconnect: bool,
    ) {
        let Some(app) = self
            .registry
            .write()
            .expect("registry poisoned")
            .remove(key)
        else {
            debug!(key = %key, "unregister for unknown application");
            return;
        };
        info!(
            key = %key,
            app = %app.policy_app_id,
            reason = reason.as_str(),
            is_resuming,
            is_unexpected_disconnect,
            "application unregistered"
        );

        if reason == ResultCode::TooManyPendingRequests {
            self.policy
                .record_removal_for_bad_behavior(&app.policy_app_id);
            self.forbid_application(&app.policy_app_id, &app.device.name);
        }

        {
            let mut registry = self.registry.write().expect("registry poisoned");
            if is_resuming {
                registry.save_for_resume(app.policy_app_id.clone(), app.hmi_app_id);
            } else {
                registry.forget_resumed(&app.policy_app_id);
            }
        }

        self.stop_audio_pass_thru(key);
        self.service_status
            .lock()
            .expect("service status poisoned")
            .remove(&key);
        {
            let mut to_stop = self.navi_app_to_stop.lock().expect("navi stop poisoned");
            if *to_stop == Some(key) {
                *to_stop = None;
                self.streaming_watchdog.stop();
            }
        }

        let mut params = RpcValue::object();
        params.set("appID", app.hmi_app_id);
        params.set("unexpectedDisconnect", is_unexpected_disconnect);
        self.send_message_to_hmi(RpcMessage::notification(
            key,
            FunctionId::ON_APP_INTERFACE_UNREGISTERED,
            app.protocol_version,
            params,
        ));

        self.requests.terminate_app_requests(key);
    }

    fn on_request_timeout(&self, key: ConnectionKey, correlation_id: u32, function_id: FunctionId) {
        let version = self
            .registry
            .read()
            .expect("registry poisoned")
            .get(key)
            .map_or(Version::V2, |app| app.protocol_version);
        self.send_message_to_mobile(
            RpcMessage::negative_response(
                key,
                function_id,
                correlation_id,
                version,
                ResultCode::TimedOut,
            ),
            false,
        );
    }

    // ------------------------------------------------------------------
    // HMI status / level transitions
    // ------------------------------------------------------------------

    fn apply_status_changes(&self, changes: Vec<StatusChange>) {
        for change in &changes {
            if change.from != change.to {
                self.on_hmi_level_changed(change.app_id, change.from, change.to);
            }
        }
        for change in changes {
            self.send_hmi_status_for(change.app_id);
        }
    }

    fn send_hmi_status_for(&self, key: ConnectionKey) {
        let app = self
            .registry
            .read()
            .expect("registry poisoned")
            .get(key)
            .cloned();
        let Some(app) = app else {
            return;
        };
        let mut params = RpcValue::object();
        params.set("hmiLevel", app.hmi_level.as_str());
        params.set("audioStreamingState", app.audio_state.as_str());
        params.set("systemContext", app.system_context.as_str());
        self.send_message_to_mobile(
            RpcMessage::notification(key, FunctionId::ON_HMI_STATUS, app.protocol_version, params),
            false,
        );
    }

    fn on_hmi_level_changed(&self, key: ConnectionKey, from: HmiLevel, to: HmiLevel) {
        let is_navi = self
            .registry
            .read()
            .expect("registry poisoned")
            .get(key)
            .map_or(false, |app| app.types.is_navi);
        if !is_navi {
            return;
        }

        if from.is_audible_tier() && !to.is_audible_tier() {
            self.forbid_streaming(key);
        } else if !from.is_audible_tier() && to.is_audible_tier() {
            debug!(key = %key, "streaming ability restored");
            if let Some(app) = self
                .registry
                .write()
                .expect("registry poisoned")
                .get_mut(key)
            {
                app.streaming_allowed = true;
            }
        }
    }

    /// Ends both streaming services and arms the teardown watchdog. If
    /// the acks do not arrive in time the app is force-unregistered.
    fn forbid_streaming(&self, key: ConnectionKey) {
        info!(key = %key, "ending streaming services");
        *self.navi_app_to_stop.lock().expect("navi stop poisoned") = Some(key);

        {
            let mut status = self.service_status.lock().expect("service status poisoned");
            let entry = status.entry(key).or_default();
            for service in [ServiceType::Video, ServiceType::Audio] {
                self.engine.send_end_service(key, service);
                entry.insert(
                    service,
                    ServiceStatus {
                        end_sent: true,
                        end_ack: false,
                    },
                );
            }
        }

        if let Some(app) = self
            .registry
            .write()
            .expect("registry poisoned")
            .get_mut(key)
        {
            app.streaming_allowed = false;
        }

        let weak = self.weak();
        self.streaming_watchdog
            .start(self.config.stop_streaming_timeout, move || {
                if let Some(manager) = weak.upgrade() {
                    manager.close_navi_app();
                }
            });
    }

    fn close_navi_app(&self) {
        let Some(key) = self.navi_app_to_stop.lock().expect("navi stop poisoned").take() else {
            return;
        };
        let acks_settled = self
            .service_status
            .lock()
            .expect("service status poisoned")
            .get(&key)
            .map_or(true, |statuses| statuses.values().all(|s| s.settled()));
        if acks_settled {
            debug!(key = %key, "streaming teardown acknowledged in time");
            return;
        }
        warn!(key = %key, "no end-service ack before timeout, unregistering");
        self.send_unregistered_notification(key, UnregisteredReason::ProtocolViolation);
        self.unregister_application(key, ResultCode::Aborted, false, false);
    }

    fn mark_end_ack(&self, key: ConnectionKey, service: ServiceType) {
        let mut status = self.service_status.lock().expect("service status poisoned");
        if let Some(statuses) = status.get_mut(&key) {
            if let Some(s) = statuses.get_mut(&service) {
                s.end_ack = true;
            }
        }
    }

    // ------------------------------------------------------------------
    // Forbidden set
    // ------------------------------------------------------------------

    fn forbid_application(&self, policy_app_id: &str, device_name: &str) {
        let digest = forbidden_hash(policy_app_id, device_name);
        debug!(app = policy_app_id, device = device_name, "forbidding application");
        self.forbidden
            .lock()
            .expect("forbidden poisoned")
            .insert(digest);
    }

    #[must_use]
    fn is_application_forbidden(&self, policy_app_id: &str, device_name: &str) -> bool {
        self.forbidden
            .lock()
            .expect("forbidden poisoned")
            .contains(&forbidden_hash(policy_app_id, device_name))
    }

    fn send_unregistered_notification(&self, key: ConnectionKey, reason: UnregisteredReason) {
        let version = self
            .registry
            .read()
            .expect("registry poisoned")
            .get(key)
            .map_or(Version::V2, |app| app.protocol_version);
        let mut params = RpcValue::object();
        params.set("reason", reason.as_str());
        self.send_message_to_mobile(
            RpcMessage::notification(
                key,
                FunctionId::ON_APP_INTERFACE_UNREGISTERED,
                version,
                params,
            ),
            true,
        );
    }
}

impl SessionEventSink for ApplicationManager {
    fn on_service_started(&self, key: ConnectionKey, service: ServiceType) -> bool {
        match service {
            ServiceType::Audio | ServiceType::Video => {
                let may_stream = self
                    .registry
                    .read()
                    .expect("registry poisoned")
                    .get(key)
                    .map_or(false, Application::may_stream);
                if !may_stream {
                    warn!(key = %key, service = ?service, "streaming refused");
                    return false;
                }
                match service {
                    ServiceType::Audio => self.media.start_audio_streaming(key),
                    _ => self.media.start_video_streaming(key),
                }
                true
            }
            _ => true,
        }
    }

    fn on_service_ended(&self, key: ConnectionKey, service: ServiceType) {
        match service {
            ServiceType::Rpc => {
                // Unexpected unless we asked for it; keep the app resumable.
                self.unregister_application(key, ResultCode::InvalidEnum, true, true);
            }
            ServiceType::Audio => {
                self.media.stop_audio_streaming(key);
                self.mark_end_ack(key, service);
            }
            ServiceType::Video => {
                self.media.stop_video_streaming(key);
                self.mark_end_ack(key, service);
            }
            _ => {}
        }
    }

    fn on_service_end_ack(&self, key: ConnectionKey, service: ServiceType) {
        if service.is_streaming() {
            self.mark_end_ack(key, service);
        }
    }

    fn on_message(&self, message: RawMessage) {
        match message.service {
            ServiceType::Rpc | ServiceType::Bulk => {
                if self.from_mobile.push(message).is_some() {
                    warn!("from-mobile queue overflow");
                }
            }
            _ => debug!(service = ?message.service, "message outside manager handling"),
        }
    }

    fn on_application_flood(&self, key: ConnectionKey) {
        warn!(key = %key, "unregistering flooding application");
        self.send_unregistered_notification(key, UnregisteredReason::TooManyRequests);
        self.unregister_application(key, ResultCode::TooManyPendingRequests, true, false);
    }

    fn on_malformed_message(&self, connection: ConnectionId) {
        warn!(connection = connection.as_u32(), "malformed traffic on connection");
        let keys: Vec<ConnectionKey> = self
            .registry
            .read()
            .expect("registry poisoned")
            .iter()
            .filter(|app| app.app_id.pair().0 == connection)
            .map(|app| app.app_id)
            .collect();
        for key in keys {
            self.send_unregistered_notification(key, UnregisteredReason::ProtocolViolation);
        }
    }
}

/// Top-level parameter names, as submitted to policy checks.
fn param_names(params: &RpcValue) -> Vec<String> {
    params
        .as_map()
        .map(|map| map.keys().cloned().collect())
        .unwrap_or_default()
}

fn forbidden_hash(policy_app_id: &str, device_name: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    policy_app_id.hash(&mut hasher);
    device_name.hash(&mut hasher);
    hasher.finish()
}

/// Parameter schema for the functions the core itself interprets.
/// Everything else is routed, not read.
pub(crate) fn schema_for(function_id: FunctionId) -> Schema {
    match function_id {
        FunctionId::REGISTER_APP_INTERFACE => Schema::map([
            ("appID", Member::required(Schema::string())),
            (
                "appName",
                Member::required(Schema::String {
                    max_length: Some(100),
                }),
            ),
            ("isMediaApplication", Member::optional(Schema::Bool)),
            ("languageDesired", Member::optional(Schema::int())),
            ("hmiDisplayLanguageDesired", Member::optional(Schema::int())),
            (
                "appHMIType",
                Member::optional(Schema::array_of(Schema::string())),
            ),
            (
                "syncMsgVersion",
                Member::optional(Schema::map([
                    ("majorVersion", Member::required(Schema::int())),
                    ("minorVersion", Member::required(Schema::int())),
                ])),
            ),
        ]),
        _ => Schema::Any,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use super::*;
    use crate::config::ProtocolConfig;
    use crate::interfaces::{
        DeviceInfo, PermissionCheck, PermissionVerdict, Transport, TransportError,
    };
    use crate::protocol::packet::{control_frame, FrameType, Packet};

    #[derive(Default)]
    struct TestTransport {
        sent: StdMutex<Vec<(ConnectionId, Bytes)>>,
        disconnected: StdMutex<Vec<ConnectionId>>,
    }

    impl Transport for TestTransport {
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

    struct TestPolicy {
        default_level: StdMutex<String>,
        deny_functions: StdMutex<Vec<String>>,
        bad_behavior_removals: StdMutex<Vec<String>>,
    }

    impl Default for TestPolicy {
        fn default() -> Self {
            Self {
                default_level: StdMutex::new("NONE".to_owned()),
                deny_functions: StdMutex::new(Vec::new()),
                bad_behavior_removals: StdMutex::new(Vec::new()),
            }
        }
    }

    impl PolicyHandler for TestPolicy {
        fn check_permissions(
            &self,
            _policy_app_id: &str,
            _hmi_level: &str,
            function: &str,
            _params: &[String],
        ) -> PermissionCheck {
            if self.deny_functions.lock().unwrap().iter().any(|f| f == function) {
                PermissionCheck {
                    verdict: Some(PermissionVerdict::Disallowed),
                    ..PermissionCheck::default()
                }
            } else {
                PermissionCheck::allowed()
            }
        }

        fn default_hmi_level(&self, _policy_app_id: &str) -> Option<String> {
            Some(self.default_level.lock().unwrap().clone())
        }

        fn on_apps_search_started(&self) {}
        fn on_apps_search_completed(&self) {}
        fn add_application(&self, _mac_address: &str, _policy_app_id: &str) {}

        fn record_removal_for_bad_behavior(&self, policy_app_id: &str) {
            self.bad_behavior_removals
                .lock()
                .unwrap()
                .push(policy_app_id.to_owned());
        }

        fn kms_changed(&self, _kilometers: i32) {}
    }

    #[derive(Default)]
    struct TestHmi {
        messages: StdMutex<Vec<RpcMessage>>,
    }

    impl HmiHandler for TestHmi {
        fn send(&self, message: RpcMessage) {
            self.messages.lock().unwrap().push(message);
        }
    }

    #[derive(Default)]
    struct TestMedia {
        calls: StdMutex<Vec<(&'static str, ConnectionKey)>>,
    }

    impl MediaManager for TestMedia {
        fn start_microphone(&self, key: ConnectionKey) {
            self.calls.lock().unwrap().push(("start_microphone", key));
        }
        fn stop_microphone(&self, key: ConnectionKey) {
            self.calls.lock().unwrap().push(("stop_microphone", key));
        }
        fn start_audio_streaming(&self, key: ConnectionKey) {
            self.calls.lock().unwrap().push(("start_audio_streaming", key));
        }
        fn stop_audio_streaming(&self, key: ConnectionKey) {
            self.calls.lock().unwrap().push(("stop_audio_streaming", key));
        }
        fn start_video_streaming(&self, key: ConnectionKey) {
            self.calls.lock().unwrap().push(("start_video_streaming", key));
        }
        fn stop_video_streaming(&self, key: ConnectionKey) {
            self.calls.lock().unwrap().push(("stop_video_streaming", key));
        }
    }

    struct Fixture {
        manager: Arc<ApplicationManager>,
        engine: Arc<ProtocolEngine>,
        transport: Arc<TestTransport>,
        policy: Arc<TestPolicy>,
        hmi: Arc<TestHmi>,
        media: Arc<TestMedia>,
    }

    fn fixture_with(config: ManagerConfig) -> Fixture {
        let transport = Arc::new(TestTransport::default());
        let engine = ProtocolEngine::new(ProtocolConfig::default(), transport.clone(), None);
        let policy = Arc::new(TestPolicy::default());
        let hmi = Arc::new(TestHmi::default());
        let media = Arc::new(TestMedia::default());
        let manager = ApplicationManager::new(
            config,
            Arc::clone(&engine),
            policy.clone(),
            hmi.clone(),
            media.clone(),
        );
        Fixture {
            manager,
            engine,
            transport,
            policy,
            hmi,
            media,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(ManagerConfig::default())
    }

    /// Drains the manager's queues and the engine's queues in lockstep.
    fn pump(fx: &Fixture) {
        loop {
            let mut progressed = false;
            while let Some(message) = fx.manager.from_mobile.try_pop() {
                fx.manager.handle_mobile_message(message);
                progressed = true;
            }
            while let Some(outgoing) = fx.manager.to_mobile.try_pop() {
                fx.manager.handle_outgoing_mobile(outgoing);
                progressed = true;
            }
            while let Some(message) = fx.manager.from_hmi.try_pop() {
                fx.manager.handle_hmi_message(message);
                progressed = true;
            }
            while let Some(message) = fx.manager.to_hmi.try_pop() {
                fx.manager.handle_outgoing_hmi(message);
                progressed = true;
            }
            while let Some(chunk) = fx.manager.audio_chunks.try_pop() {
                fx.manager.handle_audio_chunk(chunk);
                progressed = true;
            }
            fx.engine.pump_for_test();
            if !progressed {
                break;
            }
        }
    }

    fn open_rpc_session(fx: &Fixture, connection: ConnectionId) -> ConnectionKey {
        if fx.engine.device_info(connection).is_none() {
            fx.engine.on_connection_established(
                connection,
                DeviceInfo {
                    handle: connection.as_u32(),
                    name: format!("device-{connection}"),
                    mac_address: "aa:bb:cc".into(),
                },
            );
        }
        let before = fx.transport.sent.lock().unwrap().len();
        let start = Packet::control(
            Version::V3,
            ServiceType::Rpc,
            control_frame::START_SERVICE,
            0,
            0,
            Bytes::new(),
        );
        fx.engine.on_bytes_received(connection, &start.serialize());
        pump(fx);
        let sent = fx.transport.sent.lock().unwrap();
        let (_, ack_bytes) = &sent[before];
        let (ack, _) = Packet::deserialize(ack_bytes, usize::MAX >> 1).unwrap();
        assert_eq!(ack.frame_data, control_frame::START_SERVICE_ACK);
        ConnectionKey::from_pair(connection, ack.session_id)
    }

    fn registration_request(key: ConnectionKey, name: &str, media: bool, navi: bool) -> RpcMessage {
        let mut params = RpcValue::object();
        params.set("appID", name);
        params.set("appName", name);
        params.set("isMediaApplication", media);
        if navi {
            params.set(
                "appHMIType",
                RpcValue::Array(vec![RpcValue::String("NAVIGATION".into())]),
            );
        }
        RpcMessage {
            key,
            function_id: FunctionId::REGISTER_APP_INTERFACE,
            correlation_id: 1,
            message_type: RpcMessageType::Request,
            version: Version::V3,
            params,
            binary: None,
        }
    }

    fn register_app(fx: &Fixture, key: ConnectionKey, name: &str, media: bool, navi: bool) {
        let request = registration_request(key, name, media, navi);
        let payload = rpc::encode_payload(&request).unwrap();
        fx.manager.handle_mobile_message(RawMessage {
            key,
            version: Version::V3,
            service: ServiceType::Rpc,
            payload,
        });
        pump(fx);
        assert!(fx.manager.is_registered(key), "registration failed for {name}");
    }

    /// Every RPC message that reached the wire, decoded.
    fn mobile_rpc_messages(fx: &Fixture) -> Vec<RpcMessage> {
        fx.transport
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

    const CONN: ConnectionId = ConnectionId::new(7);

    #[test]
    fn registration_inserts_app_and_responds_success() {
        let fx = fixture();
        let key = open_rpc_session(&fx, CONN);
        register_app(&fx, key, "navigator", false, false);

        assert_eq!(fx.manager.hmi_level_of(key), Some(HmiLevel::None));

        let messages = mobile_rpc_messages(&fx);
        let response = messages
            .iter()
            .find(|m| {
                m.function_id == FunctionId::REGISTER_APP_INTERFACE
                    && m.message_type == RpcMessageType::Response
            })
            .unwrap();
        assert_eq!(response.params.get("success").unwrap().as_bool(), Some(true));
        let status = messages
            .iter()
            .find(|m| m.function_id == FunctionId::ON_HMI_STATUS)
            .unwrap();
        assert_eq!(
            status.params.get("hmiLevel").unwrap().as_str(),
            Some("NONE")
        );
    }

    #[test]
    fn registration_uses_policy_default_level() {
        let fx = fixture();
        *fx.policy.default_level.lock().unwrap() = "LIMITED".to_owned();
        let key = open_rpc_session(&fx, CONN);
        register_app(&fx, key, "media-app", true, false);
        assert_eq!(fx.manager.hmi_level_of(key), Some(HmiLevel::Limited));
    }

    #[test]
    fn registration_refused_when_apps_disabled() {
        let fx = fixture();
        fx.manager.set_all_apps_allowed(false);
        let key = open_rpc_session(&fx, CONN);

        let request = registration_request(key, "app", false, false);
        let payload = rpc::encode_payload(&request).unwrap();
        fx.manager.handle_mobile_message(RawMessage {
            key,
            version: Version::V3,
            service: ServiceType::Rpc,
            payload,
        });
        pump(&fx);

        assert!(!fx.manager.is_registered(key));
        let messages = mobile_rpc_messages(&fx);
        let response = messages.last().unwrap();
        assert_eq!(response.result_code_str(), Some("DISALLOWED"));
    }

    #[test]
    fn invalid_registration_yields_invalid_data() {
        let fx = fixture();
        let key = open_rpc_session(&fx, CONN);

        let mut request = registration_request(key, "app", false, false);
        if let RpcValue::Map(map) = &mut request.params {
            map.remove("appName");
        }
        let payload = rpc::encode_payload(&request).unwrap();
        fx.manager.handle_mobile_message(RawMessage {
            key,
            version: Version::V3,
            service: ServiceType::Rpc,
            payload,
        });
        pump(&fx);

        assert!(!fx.manager.is_registered(key));
        let messages = mobile_rpc_messages(&fx);
        assert_eq!(messages.last().unwrap().result_code_str(), Some("INVALID_DATA"));
    }

    #[test]
    fn v1_unknown_function_answered_with_unsupported_version() {
        let fx = fixture();
        let key = open_rpc_session(&fx, CONN);

        let payload = Bytes::from_static(
            br#"{"request":{"name":"MakeToast","correlationID":9,"parameters":{}}}"#,
        );
        fx.manager.handle_mobile_message(RawMessage {
            key,
            version: Version::V1,
            service: ServiceType::Rpc,
            payload,
        });
        pump(&fx);

        let messages = mobile_rpc_messages(&fx);
        let response = messages.last().unwrap();
        assert_eq!(response.version, Version::V1);
        assert_eq!(response.result_code_str(), Some("UNSUPPORTED_VERSION"));
        // Nothing was dispatched to the HMI.
        assert!(fx.hmi.messages.lock().unwrap().is_empty());
    }

    #[test]
    fn flood_callback_unregisters_and_bans_the_app() {
        let fx = fixture();
        let key = open_rpc_session(&fx, CONN);
        register_app(&fx, key, "chatty", false, false);

        fx.manager.on_application_flood(key);
        pump(&fx);

        assert!(!fx.manager.is_registered(key));
        assert_eq!(
            fx.policy.bad_behavior_removals.lock().unwrap().as_slice(),
            &["chatty".to_owned()]
        );
        let messages = mobile_rpc_messages(&fx);
        let notification = messages
            .iter()
            .find(|m| m.function_id == FunctionId::ON_APP_INTERFACE_UNREGISTERED)
            .unwrap();
        assert_eq!(
            notification.params.get("reason").unwrap().as_str(),
            Some("TOO_MANY_REQUESTS")
        );

        // Re-registration from the same app and device always fails the
        // same way, however often it is tried.
        for _ in 0..2 {
            let key = open_rpc_session(&fx, CONN);
            let request = registration_request(key, "chatty", false, false);
            let payload = rpc::encode_payload(&request).unwrap();
            fx.manager.handle_mobile_message(RawMessage {
                key,
                version: Version::V3,
                service: ServiceType::Rpc,
                payload,
            });
            pump(&fx);
            assert!(!fx.manager.is_registered(key));
            let messages = mobile_rpc_messages(&fx);
            assert_eq!(messages.last().unwrap().result_code_str(), Some("DISALLOWED"));
        }
    }

    #[test]
    fn none_level_burst_disconnects_the_app() {
        let fx = fixture_with(ManagerConfig {
            none_level_max_requests: 2,
            ..ManagerConfig::default()
        });
        let key = open_rpc_session(&fx, CONN);
        register_app(&fx, key, "pushy", false, false);
        assert_eq!(fx.manager.hmi_level_of(key), Some(HmiLevel::None));

        for correlation_id in 0..3 {
            let message = RpcMessage {
                key,
                function_id: FunctionId(10),
                correlation_id,
                message_type: RpcMessageType::Request,
                version: Version::V3,
                params: RpcValue::object(),
                binary: None,
            };
            let payload = rpc::encode_payload(&message).unwrap();
            fx.manager.handle_mobile_message(RawMessage {
                key,
                version: Version::V3,
                service: ServiceType::Rpc,
                payload,
            });
        }
        pump(&fx);

        assert!(!fx.manager.is_registered(key));
        assert_eq!(
            fx.policy.bad_behavior_removals.lock().unwrap().as_slice(),
            &["pushy".to_owned()]
        );
        let messages = mobile_rpc_messages(&fx);
        let notification = messages
            .iter()
            .find(|m| m.function_id == FunctionId::ON_APP_INTERFACE_UNREGISTERED)
            .unwrap();
        assert_eq!(
            notification.params.get("reason").unwrap().as_str(),
            Some("REQUEST_WHILE_IN_NONE_HMI_LEVEL")
        );
    }

    #[test]
    fn allowed_request_is_routed_to_hmi() {
        let fx = fixture();
        let key = open_rpc_session(&fx, CONN);
        register_app(&fx, key, "app", false, false);
        fx.manager.activate_application(key).unwrap();
        pump(&fx);

        let message = RpcMessage {
            key,
            function_id: FunctionId(13),
            correlation_id: 5,
            message_type: RpcMessageType::Request,
            version: Version::V3,
            params: RpcValue::object(),
            binary: None,
        };
        let payload = rpc::encode_payload(&message).unwrap();
        fx.manager.handle_mobile_message(RawMessage {
            key,
            version: Version::V3,
            service: ServiceType::Rpc,
            payload,
        });
        pump(&fx);

        let forwarded = fx.hmi.messages.lock().unwrap();
        assert!(forwarded.iter().any(|m| m.function_id == FunctionId(13)));
        assert_eq!(fx.manager.requests.pending_count(key), 1);
    }

    #[test]
    fn policy_denied_request_is_rejected() {
        let fx = fixture();
        let key = open_rpc_session(&fx, CONN);
        register_app(&fx, key, "app", false, false);
        fx.policy.deny_functions.lock().unwrap().push("13".to_owned());

        let message = RpcMessage {
            key,
            function_id: FunctionId(13),
            correlation_id: 5,
            message_type: RpcMessageType::Request,
            version: Version::V3,
            params: RpcValue::object(),
            binary: None,
        };
        let payload = rpc::encode_payload(&message).unwrap();
        fx.manager.handle_mobile_message(RawMessage {
            key,
            version: Version::V3,
            service: ServiceType::Rpc,
            payload,
        });
        pump(&fx);

        let messages = mobile_rpc_messages(&fx);
        assert_eq!(messages.last().unwrap().result_code_str(), Some("DISALLOWED"));
        assert!(fx.hmi.messages.lock().unwrap().is_empty());
        assert_eq!(fx.manager.requests.pending_count(key), 0);
    }

    #[test]
    fn activation_swap_between_media_apps() {
        let fx = fixture();
        let key1 = open_rpc_session(&fx, CONN);
        register_app(&fx, key1, "music-1", true, false);
        let key2 = open_rpc_session(&fx, CONN);
        register_app(&fx, key2, "music-2", true, false);

        fx.manager.activate_application(key1).unwrap();
        pump(&fx);
        assert_eq!(fx.manager.hmi_level_of(key1), Some(HmiLevel::Full));

        fx.transport.sent.lock().unwrap().clear();
        fx.manager.activate_application(key2).unwrap();
        pump(&fx);

        assert_eq!(fx.manager.hmi_level_of(key2), Some(HmiLevel::Full));
        assert_eq!(
            fx.manager.audio_state_of(key2),
            Some(AudioStreamingState::Audible)
        );
        assert_ne!(fx.manager.hmi_level_of(key1), Some(HmiLevel::Full));
        assert_eq!(
            fx.manager.audio_state_of(key1),
            Some(AudioStreamingState::NotAudible)
        );

        // Exactly one OnHMIStatus per affected application.
        let messages = mobile_rpc_messages(&fx);
        for key in [key1, key2] {
            assert_eq!(
                messages
                    .iter()
                    .filter(|m| m.function_id == FunctionId::ON_HMI_STATUS && m.key == key)
                    .count(),
                1
            );
        }
    }

    #[test]
    fn streaming_permitted_only_for_audible_navi_app() {
        let fx = fixture();
        let key = open_rpc_session(&fx, CONN);
        register_app(&fx, key, "nav", false, true);

        // Still in None: refused.
        assert!(!fx.manager.on_service_started(key, ServiceType::Video));

        fx.manager.activate_application(key).unwrap();
        pump(&fx);
        assert!(fx.manager.on_service_started(key, ServiceType::Video));
        assert!(fx
            .media
            .calls
            .lock()
            .unwrap()
            .contains(&("start_video_streaming", key)));
    }

    #[test]
    fn streaming_teardown_without_acks_unregisters() {
        let fx = fixture_with(ManagerConfig {
            stop_streaming_timeout: Duration::from_millis(40),
            ..ManagerConfig::default()
        });
        let key = open_rpc_session(&fx, CONN);
        register_app(&fx, key, "nav", false, true);
        fx.manager.activate_application(key).unwrap();
        pump(&fx);

        fx.transport.sent.lock().unwrap().clear();
        fx.manager.change_hmi_level(key, HmiLevel::Background);
        pump(&fx);

        // EndService went out for both streaming services.
        let end_services: Vec<ServiceType> = fx
            .transport
            .sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(_, bytes)| {
                let (packet, _) = Packet::deserialize(bytes, usize::MAX >> 1).ok()?;
                (packet.frame_data == control_frame::END_SERVICE).then_some(packet.service)
            })
            .collect();
        assert!(end_services.contains(&ServiceType::Audio));
        assert!(end_services.contains(&ServiceType::Video));

        // No acks arrive: the watchdog fires and the app goes away.
        std::thread::sleep(Duration::from_millis(160));
        pump(&fx);
        assert!(!fx.manager.is_registered(key));
        let messages = mobile_rpc_messages(&fx);
        let notification = messages
            .iter()
            .find(|m| m.function_id == FunctionId::ON_APP_INTERFACE_UNREGISTERED)
            .unwrap();
        assert_eq!(
            notification.params.get("reason").unwrap().as_str(),
            Some("PROTOCOL_VIOLATION")
        );
    }

    #[test]
    fn streaming_teardown_with_acks_keeps_the_app() {
        let fx = fixture_with(ManagerConfig {
            stop_streaming_timeout: Duration::from_millis(40),
            ..ManagerConfig::default()
        });
        let key = open_rpc_session(&fx, CONN);
        register_app(&fx, key, "nav", false, true);
        fx.manager.activate_application(key).unwrap();
        pump(&fx);

        fx.manager.change_hmi_level(key, HmiLevel::Background);
        fx.manager.on_service_end_ack(key, ServiceType::Audio);
        fx.manager.on_service_end_ack(key, ServiceType::Video);

        std::thread::sleep(Duration::from_millis(160));
        pump(&fx);
        assert!(fx.manager.is_registered(key));
    }

    #[test]
    fn audio_pass_thru_is_single_entry() {
        let fx = fixture();
        let key_a = open_rpc_session(&fx, CONN);
        let key_b = open_rpc_session(&fx, CONN);

        assert!(fx.manager.start_audio_pass_thru(key_a));
        assert!(!fx.manager.start_audio_pass_thru(key_b));
        assert!(!fx.manager.stop_audio_pass_thru(key_b));
        assert!(fx.manager.stop_audio_pass_thru(key_a));
        assert!(!fx.manager.stop_audio_pass_thru(key_a));
        assert!(fx.manager.start_audio_pass_thru(key_b));
    }

    #[test]
    fn audio_chunks_become_notifications() {
        let fx = fixture();
        let key = open_rpc_session(&fx, CONN);
        register_app(&fx, key, "app", false, false);
        assert!(fx.manager.start_audio_pass_thru(key));

        fx.manager.on_audio_chunk(key, Bytes::from_static(&[1, 2, 3]));
        pump(&fx);

        let messages = mobile_rpc_messages(&fx);
        let notification = messages
            .iter()
            .find(|m| m.function_id == FunctionId::ON_AUDIO_PASS_THRU)
            .unwrap();
        assert_eq!(notification.binary, Some(Bytes::from_static(&[1, 2, 3])));

        // Chunks for a non-owner are dropped.
        let other = open_rpc_session(&fx, CONN);
        fx.manager.on_audio_chunk(other, Bytes::from_static(&[9]));
        assert!(fx.manager.audio_chunks.is_empty());
    }

    #[test]
    fn rpc_service_end_unregisters_resumably() {
        let fx = fixture();
        let key = open_rpc_session(&fx, CONN);
        register_app(&fx, key, "app", false, false);
        let hmi_app_id = fx
            .manager
            .registry
            .read()
            .unwrap()
            .get(key)
            .unwrap()
            .hmi_app_id;

        fx.manager.on_service_ended(key, ServiceType::Rpc);
        pump(&fx);
        assert!(!fx.manager.is_registered(key));

        // The reconnecting app gets its HMI app id back.
        let key2 = open_rpc_session(&fx, CONN);
        register_app(&fx, key2, "app", false, false);
        assert_eq!(
            fx.manager.registry.read().unwrap().get(key2).unwrap().hmi_app_id,
            hmi_app_id
        );
    }

    #[test]
    fn hmi_response_with_invalid_params_surfaces_invalid_data() {
        let fx = fixture();
        let key = open_rpc_session(&fx, CONN);
        register_app(&fx, key, "app", false, false);

        // Misuse the one schema the core owns to force a failure.
        let mut bad = RpcValue::object();
        bad.set("appID", 42);
        fx.manager.on_hmi_message(RpcMessage {
            key,
            function_id: FunctionId::REGISTER_APP_INTERFACE,
            correlation_id: 77,
            message_type: RpcMessageType::Response,
            version: Version::V3,
            params: bad,
            binary: None,
        });
        pump(&fx);

        let messages = mobile_rpc_messages(&fx);
        let response = messages.last().unwrap();
        assert_eq!(response.correlation_id, 77);
        assert_eq!(response.result_code_str(), Some("INVALID_DATA"));
    }

    #[test]
    fn hmi_notification_with_invalid_params_is_dropped() {
        let fx = fixture();
        let key = open_rpc_session(&fx, CONN);
        register_app(&fx, key, "app", false, false);
        fx.transport.sent.lock().unwrap().clear();

        let mut bad = RpcValue::object();
        bad.set("appID", 42);
        fx.manager.on_hmi_message(RpcMessage {
            key,
            function_id: FunctionId::REGISTER_APP_INTERFACE,
            correlation_id: 0,
            message_type: RpcMessageType::Notification,
            version: Version::V3,
            params: bad,
            binary: None,
        });
        pump(&fx);

        assert!(mobile_rpc_messages(&fx).is_empty());
    }

    #[test]
    fn hmi_response_to_head_unit_request_is_consumed() {
        let fx = fixture();
        let key = open_rpc_session(&fx, CONN);
        register_app(&fx, key, "app", false, false);
        fx.transport.sent.lock().unwrap().clear();

        let correlation_id = fx.manager.next_hmi_correlation_id();
        fx.manager.requests.add_hmi_request(correlation_id);
        fx.manager.on_hmi_message(RpcMessage {
            key,
            function_id: FunctionId(42),
            correlation_id,
            message_type: RpcMessageType::Response,
            version: Version::V3,
            params: RpcValue::object(),
            binary: None,
        });
        pump(&fx);

        assert!(mobile_rpc_messages(&fx).is_empty());
    }

    #[test]
    fn low_voltage_blocks_mobile_commands() {
        let fx = fixture();
        let key = open_rpc_session(&fx, CONN);
        register_app(&fx, key, "app", false, false);
        fx.manager.on_low_voltage();

        let message = RpcMessage {
            key,
            function_id: FunctionId(13),
            correlation_id: 5,
            message_type: RpcMessageType::Request,
            version: Version::V3,
            params: RpcValue::object(),
            binary: None,
        };
        let payload = rpc::encode_payload(&message).unwrap();
        fx.manager.handle_mobile_message(RawMessage {
            key,
            version: Version::V3,
            service: ServiceType::Rpc,
            payload,
        });
        pump(&fx);
        assert!(fx.hmi.messages.lock().unwrap().is_empty());

        fx.manager.on_wake_up();
        fx.manager.handle_mobile_message(RawMessage {
            key,
            version: Version::V3,
            service: ServiceType::Rpc,
            payload: rpc::encode_payload(&message).unwrap(),
        });
        pump(&fx);
        assert!(!fx.hmi.messages.lock().unwrap().is_empty());
    }

    #[test]
    fn correlation_ids_increase_and_wrap() {
        let fx = fixture();
        let first = fx.manager.next_hmi_correlation_id();
        let second = fx.manager.next_hmi_correlation_id();
        assert_eq!(second, first.wrapping_add(1));

        fx.manager
            .correlation_id
            .store(u32::MAX, Ordering::Relaxed);
        assert_eq!(fx.manager.next_hmi_correlation_id(), 0);
    }
}
