//! Protocol engine: control-frame state machine, fragmentation, flood
//! defense and the outbound scheduler.
//!
//! # Architecture
//!
//! The engine spawns two workers, one per direction:
//! - **from-mobile**: drains decoded frames, consumes control frames,
//!   reassembles data frames and hands whole messages to the
//!   [`SessionEventSink`].
//! - **to-mobile**: drains outbound frames, applies the per-session
//!   cipher, serializes and hands bytes to the transport.
//!
//! A third thread sweeps session idle timers when heartbeats are
//! configured. Producers (the transport callback and the application
//! manager) only ever enqueue; they never block.

pub mod meter;
pub mod queue;
mod security;

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::config::ProtocolConfig;
use crate::interfaces::{DeviceInfo, RawMessage, SecurityManager, SessionEventSink, Transport};
use crate::protocol::packet::{
    control_frame, FrameType, Packet, ServiceType, Version, FRAME_DATA_LAST_CONSECUTIVE,
    FRAME_DATA_MAX_CONSECUTIVE,
};
use crate::protocol::reassembly::{first_frame_payload, Reassembler};
use crate::protocol::StreamFramer;
use crate::session::{ConnectionId, ConnectionKey, HashId, SessionRegistry};
use crate::trace::{debug, error, info, warn};

use meter::FrequencyMeter;
use queue::{MessageQueue, QueueItem};
use security::{HandshakeGate, PendingStart};

/// Ceiling for a reassembled message, independent of frame count.
const MAX_REASSEMBLED_SIZE: usize = 16 * 1024 * 1024;

/// A decoded frame waiting for the from-mobile worker.
struct InboundFrame {
    connection: ConnectionId,
    packet: Packet,
}

impl QueueItem for InboundFrame {
    fn droppable(&self) -> bool {
        self.packet.frame_type != FrameType::Control
    }
}

/// A frame waiting for the to-mobile worker.
struct OutboundFrame {
    connection: ConnectionId,
    packet: Packet,
    is_final: bool,
}

impl QueueItem for OutboundFrame {
    fn droppable(&self) -> bool {
        self.packet.frame_type != FrameType::Control
    }
}

/// Condvar-backed shutdown latch so timer threads stop promptly.
#[derive(Default)]
struct ShutdownSignal {
    flag: Mutex<bool>,
    cv: Condvar,
}

impl ShutdownSignal {
    /// Waits up to `timeout`; returns true once shutdown is requested.
    fn wait(&self, timeout: Duration) -> bool {
        let guard = self.flag.lock().expect("signal poisoned");
        if *guard {
            return true;
        }
        let (guard, _) = self
            .cv
            .wait_timeout(guard, timeout)
            .expect("signal poisoned");
        *guard
    }

    fn trigger(&self) {
        *self.flag.lock().expect("signal poisoned") = true;
        self.cv.notify_all();
    }
}

/// The framed-transport state machine of the head unit.
pub struct ProtocolEngine {
    config: ProtocolConfig,
    transport: Arc<dyn Transport>,
    security: Option<Arc<dyn SecurityManager>>,
    sink: Mutex<Option<Weak<dyn SessionEventSink>>>,

    registry: RwLock<SessionRegistry>,
    framers: Mutex<HashMap<ConnectionId, StreamFramer>>,
    reassembler: Mutex<Reassembler>,
    /// Next outbound message id per session. Single writer per session.
    message_counters: Mutex<HashMap<ConnectionKey, u32>>,
    flood_meter: Mutex<FrequencyMeter<ConnectionKey>>,
    malformed_meter: Mutex<FrequencyMeter<ConnectionId>>,
    /// (connection, session) → message id of a pending final message.
    final_messages: Mutex<HashMap<(ConnectionId, u8), u32>>,
    /// Connections whose shutdown waits for the EndService flush.
    ready_to_close: Mutex<Vec<ConnectionId>>,
    handshake_gate: HandshakeGate,

    from_mobile: Arc<MessageQueue<InboundFrame>>,
    to_mobile: Arc<MessageQueue<OutboundFrame>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_signal: Arc<ShutdownSignal>,
}

impl ProtocolEngine {
    #[must_use]
    pub fn new(
        config: ProtocolConfig,
        transport: Arc<dyn Transport>,
        security: Option<Arc<dyn SecurityManager>>,
    ) -> Arc<Self> {
        let queue_capacity = config.queue_capacity;
        Arc::new(Self {
            transport,
            security,
            sink: Mutex::new(None),
            registry: RwLock::new(SessionRegistry::new()),
            framers: Mutex::new(HashMap::new()),
            reassembler: Mutex::new(Reassembler::new(MAX_REASSEMBLED_SIZE)),
            message_counters: Mutex::new(HashMap::new()),
            flood_meter: Mutex::new(FrequencyMeter::new(config.message_frequency_time)),
            malformed_meter: Mutex::new(FrequencyMeter::new(
                config.malformed_message_frequency_time,
            )),
            final_messages: Mutex::new(HashMap::new()),
            ready_to_close: Mutex::new(Vec::new()),
            handshake_gate: HandshakeGate::default(),
            from_mobile: Arc::new(MessageQueue::new(queue_capacity)),
            to_mobile: Arc::new(MessageQueue::new(queue_capacity)),
            workers: Mutex::new(Vec::new()),
            shutdown_signal: Arc::new(ShutdownSignal::default()),
            config,
        })
    }

    /// Installs the event sink. The engine keeps a weak reference so the
    /// manager and the engine may hold each other without leaking.
    pub fn set_sink(&self, sink: &Arc<dyn SessionEventSink>) {
        *self.sink.lock().expect("sink poisoned") = Some(Arc::downgrade(sink));
    }

    fn sink(&self) -> Option<Arc<dyn SessionEventSink>> {
        self.sink
            .lock()
            .expect("sink poisoned")
            .as_ref()
            .and_then(Weak::upgrade)
    }

    /// Spawns the worker threads. Idempotent only in the sense that a
    /// second call spawns nothing after shutdown.
    pub fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().expect("workers poisoned");

        let engine = Arc::clone(self);
        let inbound = Arc::clone(&self.from_mobile);
        workers.push(
            std::thread::Builder::new()
                .name("applink-from-mobile".into())
                .spawn(move || {
                    info!("from-mobile worker started");
                    while let Some(frame) = inbound.pop() {
                        engine.handle_inbound(frame);
                    }
                    info!("from-mobile worker exiting");
                })
                .expect("failed to spawn from-mobile worker"),
        );

        let engine = Arc::clone(self);
        let outbound = Arc::clone(&self.to_mobile);
        workers.push(
            std::thread::Builder::new()
                .name("applink-to-mobile".into())
                .spawn(move || {
                    info!("to-mobile worker started");
                    while let Some(frame) = outbound.pop() {
                        engine.handle_outbound(frame);
                    }
                    info!("to-mobile worker exiting");
                })
                .expect("failed to spawn to-mobile worker"),
        );

        if let Some(timeout) = self.config.heart_beat_timeout {
            let engine = Arc::clone(self);
            let signal = Arc::clone(&self.shutdown_signal);
            workers.push(
                std::thread::Builder::new()
                    .name("applink-heartbeat".into())
                    .spawn(move || {
                        let tick = timeout / 2;
                        while !signal.wait(tick) {
                            engine.sweep_idle_sessions(timeout);
                        }
                    })
                    .expect("failed to spawn heartbeat monitor"),
            );
        }
    }

    /// Signals shutdown and joins every worker.
    pub fn stop(&self) {
        self.shutdown_signal.trigger();
        self.from_mobile.close();
        self.to_mobile.close();
        for handle in self.workers.lock().expect("workers poisoned").drain(..) {
            let _ = handle.join();
        }
    }

    /// Head-unit protocol version advertised in StartServiceAck.
    #[must_use]
    pub fn supported_version(&self) -> Version {
        if self.config.enable_protocol_4 {
            Version::V4
        } else if self.config.heart_beat_timeout.is_some() {
            Version::V3
        } else {
            Version::V2
        }
    }

    // ------------------------------------------------------------------
    // Transport edge
    // ------------------------------------------------------------------

    pub fn on_connection_established(&self, connection: ConnectionId, device: DeviceInfo) {
        self.framers
            .lock()
            .expect("framers poisoned")
            .insert(connection, StreamFramer::new());
        self.registry
            .write()
            .expect("registry poisoned")
            .add_connection(connection, device);
    }

    pub fn on_connection_closed(&self, connection: ConnectionId) {
        self.framers
            .lock()
            .expect("framers poisoned")
            .remove(&connection);
        self.reassembler
            .lock()
            .expect("reassembler poisoned")
            .evict_connection(connection);
        self.malformed_meter
            .lock()
            .expect("meter poisoned")
            .remove(&connection);
        self.handshake_gate.evict_connection(connection);
        self.ready_to_close
            .lock()
            .expect("ready list poisoned")
            .retain(|c| *c != connection);
        self.final_messages
            .lock()
            .expect("final messages poisoned")
            .retain(|(c, _), _| *c != connection);

        let evicted = self
            .registry
            .write()
            .expect("registry poisoned")
            .remove_connection(connection);
        let sink = self.sink();
        for (session_id, services) in evicted {
            let key = ConnectionKey::from_pair(connection, session_id);
            self.message_counters
                .lock()
                .expect("counters poisoned")
                .remove(&key);
            self.flood_meter
                .lock()
                .expect("meter poisoned")
                .remove(&key);
            if let Some(sink) = &sink {
                for service in services.iter().filter(|s| **s != ServiceType::Rpc) {
                    sink.on_service_ended(key, *service);
                }
                if services.contains(&ServiceType::Rpc) {
                    sink.on_service_ended(key, ServiceType::Rpc);
                }
            }
        }
    }

    /// Feeds raw transport bytes through the framer. Never blocks.
    pub fn on_bytes_received(&self, connection: ConnectionId, data: &[u8]) {
        let output = {
            let mut framers = self.framers.lock().expect("framers poisoned");
            let Some(framer) = framers.get_mut(&connection) else {
                warn!(connection = connection.as_u32(), "bytes for unknown connection");
                return;
            };
            framer.process(data, self.config.maximum_payload_size)
        };

        if output.malformed_occurrences > 0 {
            self.report_malformed(connection, output.malformed_occurrences);
        }

        for packet in output.packets {
            if let Some(dropped) = self.from_mobile.push(InboundFrame { connection, packet }) {
                warn!(
                    connection = dropped.connection.as_u32(),
                    "inbound queue overflow, frame dropped"
                );
            }
        }
    }

    fn report_malformed(&self, connection: ConnectionId, occurrences: usize) {
        let config = &self.config;
        if !config.malformed_message_filtering {
            debug!("malformed message filtering disabled, reporting first occurrence");
            if let Some(sink) = self.sink() {
                sink.on_malformed_message(connection);
            }
            return;
        }
        if config.malformed_message_frequency_time.is_zero()
            || config.malformed_message_max_frequency == 0
        {
            return;
        }
        let frequency = self
            .malformed_meter
            .lock()
            .expect("meter poisoned")
            .track_many(connection, occurrences, Instant::now());
        if frequency > config.malformed_message_max_frequency {
            warn!(
                connection = connection.as_u32(),
                frequency, "malformed frequency marked as high"
            );
            self.malformed_meter
                .lock()
                .expect("meter poisoned")
                .remove(&connection);
            if let Some(sink) = self.sink() {
                sink.on_malformed_message(connection);
            }
        }
    }

    // ------------------------------------------------------------------
    // From-mobile worker
    // ------------------------------------------------------------------

    fn handle_inbound(&self, frame: InboundFrame) {
        let InboundFrame { connection, packet } = frame;
        let key = ConnectionKey::from_pair(connection, packet.session_id);

        self.registry
            .write()
            .expect("registry poisoned")
            .mark_activity(connection, packet.session_id, Instant::now());

        if packet.frame_type != FrameType::Control
            && !packet.service.is_streaming()
            && self.track_message(key)
        {
            return;
        }

        let packet = match self.decrypt_inbound(key, packet) {
            DecryptOutcome::Pass(packet) => packet,
            DecryptOutcome::Skip => return,
            DecryptOutcome::SkipAndClose => {
                self.force_close_session(connection, key.pair().1);
                return;
            }
        };

        match packet.frame_type {
            FrameType::Control => self.handle_control(connection, &packet),
            FrameType::Single => {
                self.deliver(key, packet.version, packet.service, packet.payload);
            }
            FrameType::First => {
                let result = self.reassembler.lock().expect("reassembler poisoned").begin(
                    connection,
                    packet.session_id,
                    &packet.payload,
                );
                if let Err(err) = result {
                    warn!(key = %key, error = %err, "first frame rejected");
                    self.report_malformed(connection, 1);
                }
            }
            FrameType::Consecutive => {
                let result = self
                    .reassembler
                    .lock()
                    .expect("reassembler poisoned")
                    .append(connection, packet.session_id, packet.frame_data, &packet.payload);
                match result {
                    Ok(Some(payload)) => {
                        self.deliver(key, packet.version, packet.service, payload);
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(key = %key, error = %err, "reassembly failed");
                        self.report_malformed(connection, 1);
                    }
                }
            }
        }
    }

    /// Returns true when the flood meter tripped and the frame must drop.
    fn track_message(&self, key: ConnectionKey) -> bool {
        let config = &self.config;
        if config.message_frequency_time.is_zero() || config.message_max_frequency == 0 {
            return false;
        }
        let frequency = self
            .flood_meter
            .lock()
            .expect("meter poisoned")
            .track(key, Instant::now());
        if frequency > config.message_max_frequency {
            warn!(key = %key, frequency, "message frequency marked as high");
            self.flood_meter
                .lock()
                .expect("meter poisoned")
                .remove(&key);
            if let Some(sink) = self.sink() {
                sink.on_application_flood(key);
            }
            return true;
        }
        false
    }

    fn deliver(&self, key: ConnectionKey, version: Version, service: ServiceType, payload: Bytes) {
        if let Some(sink) = self.sink() {
            sink.on_message(RawMessage {
                key,
                version,
                service,
                payload,
            });
        }
    }

    // ------------------------------------------------------------------
    // Control frames
    // ------------------------------------------------------------------

    fn handle_control(&self, connection: ConnectionId, packet: &Packet) {
        match packet.frame_data {
            control_frame::START_SERVICE => self.handle_start_service(connection, packet),
            control_frame::END_SERVICE => self.handle_end_service(connection, packet),
            control_frame::END_SERVICE_ACK => {
                let key = ConnectionKey::from_pair(connection, packet.session_id);
                if let Some(sink) = self.sink() {
                    sink.on_service_end_ack(key, packet.service);
                }
            }
            control_frame::HEARTBEAT => self.handle_heartbeat(connection, packet),
            control_frame::HEARTBEAT_ACK => {
                debug!(connection = connection.as_u32(), "heartbeat ack consumed");
            }
            other => {
                debug!(frame_data = other, "control frame ignored");
            }
        }
    }

    fn handle_start_service(&self, connection: ConnectionId, packet: &Packet) {
        let service = packet.service;
        let protection_requested =
            packet.version > Version::V1 && packet.protected && self.security.is_some();

        let started = self.registry.write().expect("registry poisoned").start_session(
            connection,
            packet.session_id,
            service,
            protection_requested,
            packet.version,
        );

        let (session_id, hash_id) = match started {
            Ok(result) => result,
            Err(err) => {
                warn!(
                    connection = connection.as_u32(),
                    service = ?service,
                    error = %err,
                    "refused to start service"
                );
                self.send_start_service_nack(connection, packet.session_id, packet.version, service);
                return;
            }
        };

        let key = ConnectionKey::from_pair(connection, session_id);

        if service.is_streaming() {
            let allowed = self
                .sink()
                .map_or(false, |sink| sink.on_service_started(key, service));
            if !allowed {
                let _ = self.registry.write().expect("registry poisoned").end_session(
                    connection,
                    session_id,
                    HashId::NOT_SUPPORTED,
                    service,
                );
                self.send_start_service_nack(connection, session_id, packet.version, service);
                return;
            }
        }

        if protection_requested {
            let security = self.security.as_ref().expect("protection implies security");
            if security.create_context(key).is_err() {
                error!(key = %key, "security context creation failed, starting unprotected");
                self.send_start_service_ack(connection, session_id, service, hash_id, false);
                return;
            }
            if security.is_init_completed(key) {
                self.registry
                    .write()
                    .expect("registry poisoned")
                    .set_protection(key, service);
                self.send_start_service_ack(connection, session_id, service, hash_id, true);
            } else {
                self.handshake_gate.park(
                    key,
                    PendingStart {
                        connection,
                        session_id,
                        request_version: packet.version,
                        hash_id,
                        service,
                    },
                );
                if !security.is_handshake_pending(key) {
                    security.start_handshake(key);
                }
                debug!(key = %key, "protection establishing in progress");
            }
            return;
        }

        self.send_start_service_ack(connection, session_id, service, hash_id, false);
    }

    fn handle_end_service(&self, connection: ConnectionId, packet: &Packet) {
        let claimed = HashId::read_from(packet.version, &packet.payload);
        let ended = self.registry.write().expect("registry poisoned").end_session(
            connection,
            packet.session_id,
            claimed,
            packet.service,
        );

        match ended {
            Ok((key, extras)) => {
                self.send_end_service_ack(connection, packet.session_id, packet.version, packet.service);
                self.message_counters
                    .lock()
                    .expect("counters poisoned")
                    .remove(&key);
                if let Some(sink) = self.sink() {
                    for service in extras {
                        sink.on_service_ended(key, service);
                    }
                    sink.on_service_ended(key, packet.service);
                }
            }
            Err(err) => {
                debug!(
                    connection = connection.as_u32(),
                    service = ?packet.service,
                    error = %err,
                    "refused to end service"
                );
                self.send_end_service_nack(
                    connection,
                    packet.session_id,
                    packet.version,
                    packet.service,
                );
            }
        }
    }

    fn handle_heartbeat(&self, connection: ConnectionId, packet: &Packet) {
        let version = self
            .registry
            .read()
            .expect("registry poisoned")
            .protocol_version_used(connection, packet.session_id);
        match version {
            Some(version) if version >= Version::V3 => {
                // The ack mirrors the request's message id.
                let ack = Packet::control(
                    version,
                    ServiceType::Control,
                    control_frame::HEARTBEAT_ACK,
                    packet.session_id,
                    packet.message_id,
                    Bytes::new(),
                );
                self.enqueue_outbound(connection, ack, false);
            }
            Some(_) => warn!(connection = connection.as_u32(), "heartbeat not supported"),
            None => warn!(
                connection = connection.as_u32(),
                session = packet.session_id,
                "heartbeat for unknown session"
            ),
        }
    }

    // ------------------------------------------------------------------
    // Control frame construction
    // ------------------------------------------------------------------

    fn next_message_id(&self, key: ConnectionKey) -> u32 {
        let mut counters = self.message_counters.lock().expect("counters poisoned");
        let counter = counters.entry(key).or_insert(0);
        let id = *counter;
        *counter = counter.wrapping_add(1);
        id
    }

    fn send_start_service_ack(
        &self,
        connection: ConnectionId,
        session_id: u8,
        service: ServiceType,
        hash_id: HashId,
        protected: bool,
    ) {
        let version = self.supported_version();
        let payload = if version.has_message_id() && !hash_id.is_sentinel() {
            Bytes::copy_from_slice(&hash_id.as_u32().to_be_bytes())
        } else {
            Bytes::new()
        };
        let message_id = self.next_message_id(ConnectionKey::from_pair(connection, session_id));
        let mut packet = Packet::control(
            version,
            service,
            control_frame::START_SERVICE_ACK,
            session_id,
            message_id,
            payload,
        );
        packet.protected = protected;
        info!(
            connection = connection.as_u32(),
            session = session_id,
            service = ?service,
            protected,
            "start service ack"
        );
        self.enqueue_outbound(connection, packet, false);
    }

    fn send_start_service_nack(
        &self,
        connection: ConnectionId,
        session_id: u8,
        version: Version,
        service: ServiceType,
    ) {
        let message_id = self.next_message_id(ConnectionKey::from_pair(connection, session_id));
        let packet = Packet::control(
            version,
            service,
            control_frame::START_SERVICE_NACK,
            session_id,
            message_id,
            Bytes::new(),
        );
        self.enqueue_outbound(connection, packet, false);
    }

    fn send_end_service_ack(
        &self,
        connection: ConnectionId,
        session_id: u8,
        version: Version,
        service: ServiceType,
    ) {
        let message_id = self.next_message_id(ConnectionKey::from_pair(connection, session_id));
        let packet = Packet::control(
            version,
            service,
            control_frame::END_SERVICE_ACK,
            session_id,
            message_id,
            Bytes::new(),
        );
        self.enqueue_outbound(connection, packet, false);
    }

    fn send_end_service_nack(
        &self,
        connection: ConnectionId,
        session_id: u8,
        version: Version,
        service: ServiceType,
    ) {
        let message_id = self.next_message_id(ConnectionKey::from_pair(connection, session_id));
        let packet = Packet::control(
            version,
            service,
            control_frame::END_SERVICE_NACK,
            session_id,
            message_id,
            Bytes::new(),
        );
        self.enqueue_outbound(connection, packet, false);
    }

    /// Head-unit-initiated EndService, e.g. streaming teardown.
    pub fn send_end_service(&self, key: ConnectionKey, service: ServiceType) {
        let (connection, session_id) = key.pair();
        let version = self
            .registry
            .read()
            .expect("registry poisoned")
            .protocol_version_used(connection, session_id)
            .unwrap_or(Version::V2);
        let message_id = self.next_message_id(key);
        let packet = Packet::control(
            version,
            service,
            control_frame::END_SERVICE,
            session_id,
            message_id,
            Bytes::new(),
        );
        info!(key = %key, service = ?service, "end service");
        self.enqueue_outbound(connection, packet, false);
    }

    /// Video flow control: tells the peer how many frames the head unit
    /// can accept. The payload is a 4-byte big-endian count.
    pub fn send_frames_number(&self, key: ConnectionKey, frames: u32) {
        let (connection, session_id) = key.pair();
        let Some(version) = self
            .registry
            .read()
            .expect("registry poisoned")
            .protocol_version_used(connection, session_id)
        else {
            warn!(key = %key, "frames number for unknown session");
            return;
        };
        let message_id = self.next_message_id(key);
        let packet = Packet::control(
            version,
            ServiceType::Video,
            control_frame::SERVICE_DATA_ACK,
            session_id,
            message_id,
            Bytes::copy_from_slice(&frames.to_be_bytes()),
        );
        self.enqueue_outbound(connection, packet, false);
    }

    // ------------------------------------------------------------------
    // Outbound path
    // ------------------------------------------------------------------

    /// Fragments a logical message and schedules its frames.
    pub fn send_message_to_mobile(&self, message: RawMessage, is_final: bool) {
        let (connection, session_id) = message.key.pair();
        let header_size = message.version.header_size();
        debug_assert!(self.config.maximum_frame_size > header_size);
        let max_frame_data = self.config.maximum_frame_size - header_size;

        if message.payload.len() <= max_frame_data {
            let message_id = self.next_message_id(message.key);
            let packet = Packet {
                version: message.version,
                protected: false,
                frame_type: FrameType::Single,
                service: message.service,
                frame_data: 0,
                session_id,
                message_id,
                payload: message.payload,
            };
            self.enqueue_outbound(connection, packet, is_final);
            return;
        }

        let total = message.payload.len();
        let frame_count = total.div_ceil(max_frame_data);
        debug!(
            key = %message.key,
            total,
            frames = frame_count,
            "message sent in multiple frames"
        );

        // All fragments of one logical message share one message id.
        let message_id = self.next_message_id(message.key);
        let first = Packet {
            version: message.version,
            protected: false,
            frame_type: FrameType::First,
            service: message.service,
            frame_data: 0,
            session_id,
            message_id,
            payload: first_frame_payload(total as u32, frame_count as u32),
        };
        self.enqueue_outbound(connection, first, false);

        for i in 0..frame_count {
            let start = i * max_frame_data;
            let end = usize::min(start + max_frame_data, total);
            let is_last = i == frame_count - 1;
            let frame_data = if is_last {
                FRAME_DATA_LAST_CONSECUTIVE
            } else {
                (i % FRAME_DATA_MAX_CONSECUTIVE as usize) as u8 + 1
            };
            let packet = Packet {
                version: message.version,
                protected: false,
                frame_type: FrameType::Consecutive,
                service: message.service,
                frame_data,
                session_id,
                message_id,
                payload: message.payload.slice(start..end),
            };
            self.enqueue_outbound(connection, packet, is_last && is_final);
        }
    }

    fn enqueue_outbound(&self, connection: ConnectionId, packet: Packet, is_final: bool) {
        if let Some(dropped) = self.to_mobile.push(OutboundFrame {
            connection,
            packet,
            is_final,
        }) {
            warn!(
                connection = dropped.connection.as_u32(),
                "outbound queue overflow, frame dropped"
            );
        }
    }

    fn handle_outbound(&self, frame: OutboundFrame) {
        let OutboundFrame {
            connection,
            mut packet,
            is_final,
        } = frame;

        if is_final {
            self.final_messages
                .lock()
                .expect("final messages poisoned")
                .insert((connection, packet.session_id), packet.message_id);
        }

        let key = ConnectionKey::from_pair(connection, packet.session_id);
        match self.encrypt_outbound(key, &mut packet) {
            Ok(()) => {}
            Err(()) => {
                self.force_close_session(connection, packet.session_id);
                return;
            }
        }

        if let Err(err) = self.transport.send(connection, packet.serialize()) {
            warn!(connection = connection.as_u32(), error = %err, "transport send failed");
            return;
        }
        self.after_send(connection, &packet);
    }

    fn after_send(&self, connection: ConnectionId, packet: &Packet) {
        {
            let mut ready = self.ready_to_close.lock().expect("ready list poisoned");
            if let Some(pos) = ready.iter().position(|c| *c == connection) {
                ready.remove(pos);
                drop(ready);
                self.transport.disconnect(connection);
                return;
            }
        }

        let session_id = packet.session_id;
        let final_matches = {
            let mut finals = self.final_messages.lock().expect("final messages poisoned");
            match finals.get(&(connection, session_id)) {
                Some(&last_id)
                    if packet.message_id == last_id
                        && (packet.frame_type == FrameType::Single
                            || (packet.frame_type == FrameType::Consecutive
                                && packet.frame_data == FRAME_DATA_LAST_CONSECUTIVE)) =>
                {
                    finals.remove(&(connection, session_id));
                    true
                }
                _ => false,
            }
        };
        if !final_matches {
            return;
        }

        let sessions = self
            .registry
            .read()
            .expect("registry poisoned")
            .session_count(connection);
        if sessions > 1 {
            // Other sessions still ride this connection: only the owner
            // of the final message goes away.
            self.force_close_session(connection, session_id);
        } else {
            self.ready_to_close
                .lock()
                .expect("ready list poisoned")
                .push(connection);
            self.send_end_service(
                ConnectionKey::from_pair(connection, session_id),
                ServiceType::Rpc,
            );
        }
    }

    // ------------------------------------------------------------------
    // Encryption
    // ------------------------------------------------------------------

    fn decrypt_inbound(&self, key: ConnectionKey, packet: Packet) -> DecryptOutcome {
        if !packet.protected
            || packet.frame_type == FrameType::Control
            || packet.service == ServiceType::Control
        {
            return DecryptOutcome::Pass(packet);
        }
        let Some(security) = &self.security else {
            warn!(key = %key, "protected frame without a security manager");
            return DecryptOutcome::Skip;
        };
        let protected = self
            .registry
            .read()
            .expect("registry poisoned")
            .is_protected(key, packet.service);
        if !protected || !security.is_init_completed(key) {
            error!(key = %key, "decryption attempted on unprotected service");
            return DecryptOutcome::Skip;
        }
        match security.decrypt(key, &packet.payload) {
            Ok(plain) => {
                let mut packet = packet;
                packet.payload = plain;
                packet.protected = false;
                DecryptOutcome::Pass(packet)
            }
            Err(err) => {
                error!(key = %key, error = %err, "decryption failed");
                DecryptOutcome::SkipAndClose
            }
        }
    }

    fn encrypt_outbound(&self, key: ConnectionKey, packet: &mut Packet) -> Result<(), ()> {
        if packet.frame_type == FrameType::Control || packet.service == ServiceType::Control {
            return Ok(());
        }
        let Some(security) = &self.security else {
            return Ok(());
        };
        let protected = self
            .registry
            .read()
            .expect("registry poisoned")
            .is_protected(key, packet.service);
        if !protected || !security.is_init_completed(key) {
            return Ok(());
        }
        match security.encrypt(key, &packet.payload) {
            Ok(cipher) => {
                packet.payload = cipher;
                packet.protected = true;
                Ok(())
            }
            Err(err) => {
                error!(key = %key, error = %err, "encryption failed");
                Err(())
            }
        }
    }

    /// Flushes StartService acks parked on this key's handshake.
    pub fn on_handshake_done(&self, key: ConnectionKey, success: bool) {
        for pending in self.handshake_gate.take(key) {
            let already_protected = self
                .registry
                .read()
                .expect("registry poisoned")
                .is_protected(key, pending.service);
            if already_protected {
                if success {
                    // A second handshake cannot re-protect the service.
                    self.send_start_service_nack(
                        pending.connection,
                        pending.session_id,
                        pending.request_version,
                        pending.service,
                    );
                }
                continue;
            }
            if success {
                self.registry
                    .write()
                    .expect("registry poisoned")
                    .set_protection(key, pending.service);
            }
            self.send_start_service_ack(
                pending.connection,
                pending.session_id,
                pending.service,
                pending.hash_id,
                success,
            );
        }
    }

    // ------------------------------------------------------------------
    // Session teardown helpers
    // ------------------------------------------------------------------

    fn force_close_session(&self, connection: ConnectionId, session_id: u8) {
        let services = self
            .registry
            .write()
            .expect("registry poisoned")
            .force_end_session(connection, session_id);
        if services.is_empty() {
            return;
        }
        let key = ConnectionKey::from_pair(connection, session_id);
        self.message_counters
            .lock()
            .expect("counters poisoned")
            .remove(&key);
        self.reassembler
            .lock()
            .expect("reassembler poisoned")
            .evict_session(connection, session_id);
        if let Some(sink) = self.sink() {
            for service in services.iter().filter(|s| **s != ServiceType::Rpc) {
                sink.on_service_ended(key, *service);
            }
            if services.contains(&ServiceType::Rpc) {
                sink.on_service_ended(key, ServiceType::Rpc);
            }
        }
    }

    fn sweep_idle_sessions(&self, timeout: Duration) {
        let expired = self
            .registry
            .read()
            .expect("registry poisoned")
            .expired_sessions(timeout, Instant::now());
        for (connection, session_id) in expired {
            warn!(
                connection = connection.as_u32(),
                session = session_id,
                "session idle timeout"
            );
            self.force_close_session(connection, session_id);
            if self
                .registry
                .read()
                .expect("registry poisoned")
                .session_count(connection)
                == 0
            {
                self.transport.disconnect(connection);
            }
        }
    }

    // ------------------------------------------------------------------
    // Registry accessors for the application manager
    // ------------------------------------------------------------------

    #[must_use]
    pub fn device_info(&self, connection: ConnectionId) -> Option<DeviceInfo> {
        self.registry
            .read()
            .expect("registry poisoned")
            .device(connection)
            .cloned()
    }

    #[must_use]
    pub fn protocol_version_of(&self, key: ConnectionKey) -> Option<Version> {
        let (connection, session_id) = key.pair();
        self.registry
            .read()
            .expect("registry poisoned")
            .protocol_version_used(connection, session_id)
    }

    pub fn bind_protocol_version(&self, key: ConnectionKey, version: Version) {
        self.registry
            .write()
            .expect("registry poisoned")
            .bind_protocol_version(key, version);
    }

    /// Arms the per-session idle timer; a no-op when heartbeats are
    /// disabled by configuration.
    pub fn start_session_heartbeat(&self, key: ConnectionKey) {
        if self.config.heart_beat_timeout.is_some() {
            self.registry
                .write()
                .expect("registry poisoned")
                .start_heartbeat(key);
        }
    }

    #[must_use]
    pub fn heartbeat_supported(&self) -> bool {
        self.config.heart_beat_timeout.is_some()
    }

    #[must_use]
    pub fn session_count(&self, connection: ConnectionId) -> usize {
        self.registry
            .read()
            .expect("registry poisoned")
            .session_count(connection)
    }

    /// Drains both queues on the calling thread, in place of the workers.
    #[cfg(test)]
    pub(crate) fn pump_for_test(&self) {
        loop {
            let mut progressed = false;
            while let Some(frame) = self.from_mobile.try_pop() {
                self.handle_inbound(frame);
                progressed = true;
            }
            while let Some(frame) = self.to_mobile.try_pop() {
                self.handle_outbound(frame);
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
    }
}

enum DecryptOutcome {
    Pass(Packet),
    Skip,
    SkipAndClose,
}
