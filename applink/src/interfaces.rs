//! Collaborator interfaces consumed by the core.
//!
//! The engines talk to the rest of the head unit exclusively through
//! these traits; concrete implementations are injected at construction.
//! Everything here crosses thread boundaries, hence `Send + Sync`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::packet::{ServiceType, Version};
use crate::rpc::RpcMessage;
use crate::session::{ConnectionId, ConnectionKey};

/// Descriptor of the device behind a transport connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub handle: u32,
    pub name: String,
    pub mac_address: String,
}

/// Errors surfaced by the transport collaborator.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection is gone")]
    ConnectionGone,
    #[error("transport failure: {0}")]
    Io(String),
}

/// Outbound half of the transport layer.
///
/// Inbound traffic enters the engine through
/// [`crate::engine::ProtocolEngine::on_bytes_received`] and the
/// connection lifecycle calls; the transport adapter is expected to wire
/// its own callbacks to those.
pub trait Transport: Send + Sync {
    /// Hands one serialized frame to the device link.
    fn send(&self, connection: ConnectionId, bytes: Bytes) -> Result<(), TransportError>;
    /// Graceful disconnect, flushing what was already queued.
    fn disconnect(&self, connection: ConnectionId);
    /// Immediate teardown for misbehaving peers.
    fn force_disconnect(&self, connection: ConnectionId);
}

/// Verdict of a policy permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionVerdict {
    Allowed,
    Disallowed,
    UserDisallowed,
    Undefined,
}

/// Outcome of [`PolicyHandler::check_permissions`].
#[derive(Debug, Clone, Default)]
pub struct PermissionCheck {
    pub verdict: Option<PermissionVerdict>,
    pub allowed_params: Vec<String>,
    pub disallowed_params: Vec<String>,
    pub undefined_params: Vec<String>,
}

impl PermissionCheck {
    #[must_use]
    pub fn allowed() -> Self {
        Self {
            verdict: Some(PermissionVerdict::Allowed),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self.verdict, Some(PermissionVerdict::Allowed))
    }
}

/// Policy-table collaborator.
pub trait PolicyHandler: Send + Sync {
    fn check_permissions(
        &self,
        policy_app_id: &str,
        hmi_level: &str,
        function: &str,
        params: &[String],
    ) -> PermissionCheck;
    /// Default HMI level string for an application, e.g. `"NONE"`.
    fn default_hmi_level(&self, policy_app_id: &str) -> Option<String>;
    fn on_apps_search_started(&self);
    fn on_apps_search_completed(&self);
    /// Registers a newly seen application with the policy table.
    fn add_application(&self, mac_address: &str, policy_app_id: &str);
    /// Usage counter bumped when an app is removed for bad behavior.
    fn record_removal_for_bad_behavior(&self, policy_app_id: &str);
    /// Kilometer counter update from the vehicle.
    fn kms_changed(&self, kilometers: i32);
}

/// Errors surfaced by the security collaborator.
#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("no security context for connection key")]
    NoContext,
    #[error("handshake not completed")]
    NotReady,
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
}

/// Optional per-service encryption provider.
pub trait SecurityManager: Send + Sync {
    /// Ensures a context exists for the key; idempotent.
    fn create_context(&self, key: ConnectionKey) -> Result<(), SecurityError>;
    /// Kicks off the asynchronous handshake. Completion is reported back
    /// through [`crate::engine::ProtocolEngine::on_handshake_done`].
    fn start_handshake(&self, key: ConnectionKey);
    fn is_handshake_pending(&self, key: ConnectionKey) -> bool;
    fn is_init_completed(&self, key: ConnectionKey) -> bool;
    fn encrypt(&self, key: ConnectionKey, plaintext: &[u8]) -> Result<Bytes, SecurityError>;
    fn decrypt(&self, key: ConnectionKey, ciphertext: &[u8]) -> Result<Bytes, SecurityError>;
    fn last_error(&self) -> String;
}

/// Outbound half of the HMI message handler.
pub trait HmiHandler: Send + Sync {
    fn send(&self, message: RpcMessage);
}

/// Media capture/playback collaborator.
pub trait MediaManager: Send + Sync {
    fn start_microphone(&self, key: ConnectionKey);
    fn stop_microphone(&self, key: ConnectionKey);
    fn start_audio_streaming(&self, key: ConnectionKey);
    fn stop_audio_streaming(&self, key: ConnectionKey);
    fn start_video_streaming(&self, key: ConnectionKey);
    fn stop_video_streaming(&self, key: ConnectionKey);
}

/// A whole logical message lifted off the wire, or headed onto it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub key: ConnectionKey,
    pub version: Version,
    pub service: ServiceType,
    pub payload: Bytes,
}

/// Events the protocol engine raises toward the application manager.
///
/// Callbacks are invoked from the engine's worker threads with no engine
/// lock held; implementations may call back into the engine.
pub trait SessionEventSink: Send + Sync {
    /// Admission check before a non-RPC service start is acknowledged.
    fn on_service_started(&self, key: ConnectionKey, service: ServiceType) -> bool;
    /// A service ended: mobile-initiated EndService, transport loss,
    /// heartbeat expiry or forced teardown. RPC is always reported last
    /// for a dying session.
    fn on_service_ended(&self, key: ConnectionKey, service: ServiceType);
    /// The mobile side acknowledged a head-unit-initiated EndService.
    fn on_service_end_ack(&self, key: ConnectionKey, service: ServiceType);
    /// A reassembled message is ready for routing.
    fn on_message(&self, message: RawMessage);
    /// The flood meter tripped for this connection key.
    fn on_application_flood(&self, key: ConnectionKey);
    /// The malformed-message policy tripped for this connection.
    fn on_malformed_message(&self, connection: ConnectionId);
}
