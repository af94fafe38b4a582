//! Session registry: multiplexed logical channels over transport connections.
//!
//! A connection (transport-assigned) carries up to 255 sessions, each
//! holding a negotiated protocol version, a set of open services with
//! per-service protection state, and an RPC teardown cookie (hash id).
//! `(connection, session)` pairs are exposed upward as opaque 32-bit
//! connection keys.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::interfaces::DeviceInfo;
use crate::protocol::packet::{ServiceType, Version};
use crate::trace::{debug, info, warn};

/// Transport-assigned connection handle.
///
/// Only the low 24 bits participate in connection-key packing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u32);

impl ConnectionId {
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque 32-bit handle for a `(connection, session)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey(u32);

impl ConnectionKey {
    /// Packs a pair into a key. The inverse is [`ConnectionKey::pair`].
    #[must_use]
    pub const fn from_pair(connection: ConnectionId, session_id: u8) -> Self {
        Self((connection.0 << 8) | session_id as u32)
    }

    /// Recovers the `(connection, session)` pair.
    #[must_use]
    pub const fn pair(self) -> (ConnectionId, u8) {
        (ConnectionId(self.0 >> 8), (self.0 & 0xFF) as u8)
    }

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// RPC teardown cookie issued at StartService.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HashId(u32);

impl HashId {
    /// Sentinel for sessions negotiated below protocol version 2.
    pub const NOT_SUPPORTED: Self = Self(0);
    /// Sentinel for an absent or null cookie on the wire.
    pub const WRONG: Self = Self(u32::MAX);

    /// Generates a fresh cookie, never equal to a sentinel.
    #[must_use]
    pub fn generate() -> Self {
        loop {
            let candidate = Self(rand::random());
            if candidate != Self::NOT_SUPPORTED && candidate != Self::WRONG {
                return candidate;
            }
        }
    }

    /// Reads the cookie claimed by an EndService payload.
    ///
    /// Sessions below v2 never carry one; a missing or zero-valued cookie
    /// maps to [`HashId::WRONG`].
    #[must_use]
    pub fn read_from(version: Version, payload: &[u8]) -> Self {
        if version < Version::V2 {
            return Self::NOT_SUPPORTED;
        }
        if payload.len() < 4 {
            return Self::WRONG;
        }
        let value = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        if value == Self::NOT_SUPPORTED.0 {
            Self::WRONG
        } else {
            Self(value)
        }
    }

    #[must_use]
    pub const fn is_sentinel(self) -> bool {
        self.0 == Self::NOT_SUPPORTED.0 || self.0 == Self::WRONG.0
    }

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl From<u32> for HashId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

/// Why the registry declined a session operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SessionRefused {
    #[error("unknown connection")]
    UnknownConnection,
    #[error("unknown session")]
    UnknownSession,
    #[error("service already open on session")]
    ServiceAlreadyOpen,
    #[error("service not open on session")]
    ServiceNotOpen,
    #[error("hash id does not authenticate teardown")]
    WrongHash,
    #[error("no free session id on connection")]
    NoFreeSession,
}

#[derive(Debug)]
struct SessionEntry {
    version: Version,
    hash_id: HashId,
    /// Open services, each with its protection flag.
    services: HashMap<ServiceType, bool>,
    heartbeat_enabled: bool,
    last_activity: Instant,
}

#[derive(Debug)]
struct ConnectionEntry {
    device: DeviceInfo,
    sessions: HashMap<u8, SessionEntry>,
    next_session_id: u8,
}

impl ConnectionEntry {
    fn allocate_session_id(&mut self) -> Option<u8> {
        for _ in 0..u8::MAX {
            let candidate = self.next_session_id;
            self.next_session_id = if candidate == u8::MAX { 1 } else { candidate + 1 };
            if !self.sessions.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        None
    }
}

/// Tracks every connection and the sessions multiplexed over it.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    connections: HashMap<ConnectionId, ConnectionEntry>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_connection(&mut self, connection: ConnectionId, device: DeviceInfo) {
        info!(connection = connection.as_u32(), device = %device.name, "connection established");
        self.connections.insert(
            connection,
            ConnectionEntry {
                device,
                sessions: HashMap::new(),
                next_session_id: 1,
            },
        );
    }

    /// Removes a connection, returning each evicted session with its open
    /// services so the caller can emit teardown events.
    pub fn remove_connection(&mut self, connection: ConnectionId) -> Vec<(u8, Vec<ServiceType>)> {
        let Some(entry) = self.connections.remove(&connection) else {
            return Vec::new();
        };
        info!(
            connection = connection.as_u32(),
            sessions = entry.sessions.len(),
            "connection closed, evicting sessions"
        );
        entry
            .sessions
            .into_iter()
            .map(|(id, session)| (id, session.services.into_keys().collect()))
            .collect()
    }

    #[must_use]
    pub fn has_connection(&self, connection: ConnectionId) -> bool {
        self.connections.contains_key(&connection)
    }

    #[must_use]
    pub fn device(&self, connection: ConnectionId) -> Option<&DeviceInfo> {
        self.connections.get(&connection).map(|c| &c.device)
    }

    #[must_use]
    pub fn session_count(&self, connection: ConnectionId) -> usize {
        self.connections
            .get(&connection)
            .map_or(0, |c| c.sessions.len())
    }

    /// Handles a StartService request.
    ///
    /// An RPC start allocates a fresh session and issues a hash id (a
    /// sentinel below protocol v2). Any other service attaches to the
    /// session named by `proposed_session_id`.
    pub fn start_session(
        &mut self,
        connection: ConnectionId,
        proposed_session_id: u8,
        service: ServiceType,
        protection_requested: bool,
        version: Version,
    ) -> Result<(u8, HashId), SessionRefused> {
        let entry = self
            .connections
            .get_mut(&connection)
            .ok_or(SessionRefused::UnknownConnection)?;

        if service == ServiceType::Rpc {
            let session_id = entry
                .allocate_session_id()
                .ok_or(SessionRefused::NoFreeSession)?;
            let hash_id = if version >= Version::V2 {
                HashId::generate()
            } else {
                HashId::NOT_SUPPORTED
            };
            entry.sessions.insert(
                session_id,
                SessionEntry {
                    version,
                    hash_id,
                    services: HashMap::from([(ServiceType::Rpc, false)]),
                    heartbeat_enabled: false,
                    last_activity: Instant::now(),
                },
            );
            debug!(
                connection = connection.as_u32(),
                session = session_id,
                version = version.as_u8(),
                protection_requested,
                "rpc session started"
            );
            Ok((session_id, hash_id))
        } else {
            let session = entry
                .sessions
                .get_mut(&proposed_session_id)
                .ok_or(SessionRefused::UnknownSession)?;
            if session.services.contains_key(&service) {
                return Err(SessionRefused::ServiceAlreadyOpen);
            }
            session.services.insert(service, false);
            debug!(
                connection = connection.as_u32(),
                session = proposed_session_id,
                service = ?service,
                "service attached to session"
            );
            Ok((proposed_session_id, HashId::NOT_SUPPORTED))
        }
    }

    /// Handles an EndService request.
    ///
    /// The claimed hash authenticates RPC teardown only; for other
    /// services the comparison always succeeds. Ending the RPC service
    /// tears the whole session down; the returned list holds the other
    /// services that went with it.
    pub fn end_session(
        &mut self,
        connection: ConnectionId,
        session_id: u8,
        claimed: HashId,
        service: ServiceType,
    ) -> Result<(ConnectionKey, Vec<ServiceType>), SessionRefused> {
        let entry = self
            .connections
            .get_mut(&connection)
            .ok_or(SessionRefused::UnknownConnection)?;
        let session = entry
            .sessions
            .get_mut(&session_id)
            .ok_or(SessionRefused::UnknownSession)?;

        let key = ConnectionKey::from_pair(connection, session_id);
        if service == ServiceType::Rpc {
            if session.hash_id != HashId::NOT_SUPPORTED && claimed != session.hash_id {
                warn!(key = %key, "end service refused: wrong hash id");
                return Err(SessionRefused::WrongHash);
            }
            let removed = entry.sessions.remove(&session_id).expect("session exists");
            let extras = removed
                .services
                .into_keys()
                .filter(|s| *s != ServiceType::Rpc)
                .collect();
            debug!(key = %key, "rpc session ended");
            Ok((key, extras))
        } else {
            if session.services.remove(&service).is_none() {
                return Err(SessionRefused::ServiceNotOpen);
            }
            debug!(key = %key, service = ?service, "service ended");
            Ok((key, Vec::new()))
        }
    }

    #[must_use]
    pub fn protocol_version_used(
        &self,
        connection: ConnectionId,
        session_id: u8,
    ) -> Option<Version> {
        self.connections
            .get(&connection)?
            .sessions
            .get(&session_id)
            .map(|s| s.version)
    }

    /// Re-binds a session's protocol version, as negotiated at
    /// RegisterAppInterface.
    pub fn bind_protocol_version(&mut self, key: ConnectionKey, version: Version) {
        let (connection, session_id) = key.pair();
        if let Some(session) = self
            .connections
            .get_mut(&connection)
            .and_then(|c| c.sessions.get_mut(&session_id))
        {
            session.version = version;
        }
    }

    /// Marks a service as protected after a successful handshake.
    pub fn set_protection(&mut self, key: ConnectionKey, service: ServiceType) {
        let (connection, session_id) = key.pair();
        if let Some(session) = self
            .connections
            .get_mut(&connection)
            .and_then(|c| c.sessions.get_mut(&session_id))
        {
            if let Some(protected) = session.services.get_mut(&service) {
                *protected = true;
            }
        }
    }

    #[must_use]
    pub fn is_protected(&self, key: ConnectionKey, service: ServiceType) -> bool {
        let (connection, session_id) = key.pair();
        self.connections
            .get(&connection)
            .and_then(|c| c.sessions.get(&session_id))
            .and_then(|s| s.services.get(&service))
            .copied()
            .unwrap_or(false)
    }

    /// Enables the per-session idle timer.
    pub fn start_heartbeat(&mut self, key: ConnectionKey) {
        let (connection, session_id) = key.pair();
        if let Some(session) = self
            .connections
            .get_mut(&connection)
            .and_then(|c| c.sessions.get_mut(&session_id))
        {
            session.heartbeat_enabled = true;
            session.last_activity = Instant::now();
        }
    }

    /// Resets the idle timer; called for every valid inbound frame.
    pub fn mark_activity(&mut self, connection: ConnectionId, session_id: u8, now: Instant) {
        if let Some(session) = self
            .connections
            .get_mut(&connection)
            .and_then(|c| c.sessions.get_mut(&session_id))
        {
            session.last_activity = now;
        }
    }

    /// Sessions whose idle timer has lapsed.
    #[must_use]
    pub fn expired_sessions(&self, timeout: Duration, now: Instant) -> Vec<(ConnectionId, u8)> {
        let mut expired = Vec::new();
        for (connection, entry) in &self.connections {
            for (session_id, session) in &entry.sessions {
                if session.heartbeat_enabled
                    && now.duration_since(session.last_activity) >= timeout
                {
                    expired.push((*connection, *session_id));
                }
            }
        }
        expired
    }

    /// Force-removes one session, returning the services that were open.
    pub fn force_end_session(
        &mut self,
        connection: ConnectionId,
        session_id: u8,
    ) -> Vec<ServiceType> {
        self.connections
            .get_mut(&connection)
            .and_then(|c| c.sessions.remove(&session_id))
            .map(|s| s.services.into_keys().collect())
            .unwrap_or_default()
    }
}
