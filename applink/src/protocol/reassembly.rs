//! Multi-frame message reassembly.
//!
//! A multi-frame message opens with a First frame whose payload declares
//! the total size and frame count (both u32 BE), followed by Consecutive
//! frames whose data byte cycles `1..=0x7F` and terminates with `0x00` on
//! the last frame. Buffers are keyed by `(connection, session)`; any rule
//! violation discards the partial buffer and surfaces an error so the
//! caller can treat the session as malformed.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use crate::protocol::packet::{FIRST_FRAME_DATA_SIZE, FRAME_DATA_LAST_CONSECUTIVE,
    FRAME_DATA_MAX_CONSECUTIVE};
use crate::session::ConnectionId;
use crate::trace::{debug, warn};

/// Errors raised while collecting a multi-frame message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReassemblyError {
    /// First-frame payload is not the 8-byte size/count descriptor.
    #[error("first frame payload must be {FIRST_FRAME_DATA_SIZE} bytes, got {0}")]
    BadFirstPayload(usize),
    /// Declared total exceeds what this head unit is willing to buffer.
    #[error("declared total {declared} exceeds reassembly limit {limit}")]
    TotalTooLarge { declared: u32, limit: usize },
    /// Consecutive frame arrived with no pending First on the session.
    #[error("consecutive frame without a pending first frame")]
    Orphan,
    /// Appending this frame would exceed the declared total size.
    #[error("reassembly overflow: {received} + {incoming} > declared {declared}")]
    Overflow {
        received: usize,
        incoming: usize,
        declared: u32,
    },
    /// Consecutive ordinal broke the `1..=0x7F` cycle.
    #[error("out-of-order consecutive frame: expected {expected:#04x}, got {got:#04x}")]
    OutOfOrder { expected: u8, got: u8 },
    /// The terminating frame arrived before `frame_count` frames.
    #[error("last frame after {received} of {declared} frames")]
    CountMismatch { received: u32, declared: u32 },
    /// Completed buffer does not match the declared total size.
    #[error("assembled {assembled} bytes, declared {declared}")]
    SizeMismatch { assembled: usize, declared: u32 },
}

/// In-progress multi-frame message.
#[derive(Debug)]
struct PendingMessage {
    total_size: u32,
    frame_count: u32,
    frames_received: u32,
    next_ordinal: u8,
    buffer: BytesMut,
}

impl PendingMessage {
    fn advance_ordinal(&mut self) {
        self.next_ordinal = if self.next_ordinal == FRAME_DATA_MAX_CONSECUTIVE {
            1
        } else {
            self.next_ordinal + 1
        };
    }
}

/// Reassembly buffers for all connections, keyed by `(connection, session)`.
#[derive(Debug)]
pub struct Reassembler {
    pending: HashMap<(ConnectionId, u8), PendingMessage>,
    /// Upper bound accepted for a declared total size.
    max_message_size: usize,
}

impl Reassembler {
    #[must_use]
    pub fn new(max_message_size: usize) -> Self {
        Self {
            pending: HashMap::new(),
            max_message_size,
        }
    }

    /// Opens a buffer from a First frame payload.
    ///
    /// A First frame on a session with an unfinished message replaces it;
    /// the stale partial buffer is dropped.
    pub fn begin(
        &mut self,
        connection: ConnectionId,
        session_id: u8,
        payload: &[u8],
    ) -> Result<(), ReassemblyError> {
        if payload.len() != FIRST_FRAME_DATA_SIZE {
            return Err(ReassemblyError::BadFirstPayload(payload.len()));
        }
        let total_size = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let frame_count = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);

        if total_size as usize > self.max_message_size {
            return Err(ReassemblyError::TotalTooLarge {
                declared: total_size,
                limit: self.max_message_size,
            });
        }

        if let Some(stale) = self.pending.insert(
            (connection, session_id),
            PendingMessage {
                total_size,
                frame_count,
                frames_received: 0,
                next_ordinal: 1,
                buffer: BytesMut::with_capacity(total_size as usize),
            },
        ) {
            warn!(
                connection = connection.as_u32(),
                session = session_id,
                dropped = stale.buffer.len(),
                "first frame replaced an unfinished message"
            );
        }
        debug!(
            connection = connection.as_u32(),
            session = session_id,
            total = total_size,
            frames = frame_count,
            "multi-frame message started"
        );
        Ok(())
    }

    /// Appends a Consecutive frame.
    ///
    /// Returns the completed message when the terminating frame lands.
    /// On any error the partial buffer is discarded.
    pub fn append(
        &mut self,
        connection: ConnectionId,
        session_id: u8,
        frame_data: u8,
        payload: &[u8],
    ) -> Result<Option<Bytes>, ReassemblyError> {
        let key = (connection, session_id);
        let Some(entry) = self.pending.get_mut(&key) else {
            return Err(ReassemblyError::Orphan);
        };

        let result = Self::append_inner(entry, frame_data, payload);
        match result {
            Ok(true) => {
                let done = self.pending.remove(&key).expect("entry exists");
                Ok(Some(done.buffer.freeze()))
            }
            Ok(false) => Ok(None),
            Err(err) => {
                self.pending.remove(&key);
                Err(err)
            }
        }
    }

    fn append_inner(
        entry: &mut PendingMessage,
        frame_data: u8,
        payload: &[u8],
    ) -> Result<bool, ReassemblyError> {
        let is_last = frame_data == FRAME_DATA_LAST_CONSECUTIVE;
        if !is_last && frame_data != entry.next_ordinal {
            return Err(ReassemblyError::OutOfOrder {
                expected: entry.next_ordinal,
                got: frame_data,
            });
        }

        if entry.buffer.len() + payload.len() > entry.total_size as usize {
            return Err(ReassemblyError::Overflow {
                received: entry.buffer.len(),
                incoming: payload.len(),
                declared: entry.total_size,
            });
        }

        entry.buffer.extend_from_slice(payload);
        entry.frames_received += 1;

        if is_last {
            if entry.frames_received != entry.frame_count {
                return Err(ReassemblyError::CountMismatch {
                    received: entry.frames_received,
                    declared: entry.frame_count,
                });
            }
            if entry.buffer.len() != entry.total_size as usize {
                return Err(ReassemblyError::SizeMismatch {
                    assembled: entry.buffer.len(),
                    declared: entry.total_size,
                });
            }
            return Ok(true);
        }

        entry.advance_ordinal();
        Ok(false)
    }

    /// Whether a session has an unfinished message.
    #[must_use]
    pub fn has_pending(&self, connection: ConnectionId, session_id: u8) -> bool {
        self.pending.contains_key(&(connection, session_id))
    }

    /// Drops every partial buffer belonging to `connection`.
    pub fn evict_connection(&mut self, connection: ConnectionId) {
        self.pending.retain(|(conn, _), _| *conn != connection);
    }

    /// Drops the partial buffer of one session, if any.
    pub fn evict_session(&mut self, connection: ConnectionId, session_id: u8) {
        self.pending.remove(&(connection, session_id));
    }
}

/// Encodes a First-frame payload: `total_size || frame_count`, both u32 BE.
#[must_use]
pub fn first_frame_payload(total_size: u32, frame_count: u32) -> Bytes {
    let mut buf = [0u8; FIRST_FRAME_DATA_SIZE];
    buf[..4].copy_from_slice(&total_size.to_be_bytes());
    buf[4..].copy_from_slice(&frame_count.to_be_bytes());
    Bytes::copy_from_slice(&buf)
}
