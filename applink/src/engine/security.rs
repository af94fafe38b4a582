//! Deferred StartServiceAck bookkeeping for the encryption handshake.
//!
//! When a StartService requests protection and the security context is
//! not yet initialized, the ack is parked here until the security layer
//! reports handshake completion for the connection key.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::protocol::packet::{ServiceType, Version};
use crate::session::{ConnectionId, ConnectionKey, HashId};

/// A StartService waiting on the handshake outcome.
#[derive(Debug, Clone)]
pub(crate) struct PendingStart {
    pub connection: ConnectionId,
    pub session_id: u8,
    /// Version of the originating StartService, used for a NAck.
    pub request_version: Version,
    pub hash_id: HashId,
    pub service: ServiceType,
}

/// Pending-session map keyed by connection key.
#[derive(Debug, Default)]
pub(crate) struct HandshakeGate {
    pending: Mutex<HashMap<ConnectionKey, Vec<PendingStart>>>,
}

impl HandshakeGate {
    pub fn park(&self, key: ConnectionKey, start: PendingStart) {
        self.pending
            .lock()
            .expect("gate poisoned")
            .entry(key)
            .or_default()
            .push(start);
    }

    /// Takes every parked start for `key`, in arrival order.
    pub fn take(&self, key: ConnectionKey) -> Vec<PendingStart> {
        self.pending
            .lock()
            .expect("gate poisoned")
            .remove(&key)
            .unwrap_or_default()
    }

    /// Drops parked starts for a dying connection.
    pub fn evict_connection(&self, connection: ConnectionId) {
        self.pending
            .lock()
            .expect("gate poisoned")
            .retain(|key, _| key.pair().0 != connection);
    }
}
