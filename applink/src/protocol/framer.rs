//! Per-connection stream decoder.
//!
//! The transport hands over raw byte chunks with no frame alignment. The
//! framer accumulates them and peels off complete packets. A rejected
//! header does not poison the stream: the decoder advances to the next
//! plausible frame boundary and counts the occurrence, leaving the flood
//! policy to the caller.

use bytes::BytesMut;

use crate::protocol::packet::{Packet, PacketError};
use crate::trace::{debug, warn};

/// Outcome of one `process` call.
#[derive(Debug)]
pub struct FramerOutput {
    /// Packets decoded in arrival order.
    pub packets: Vec<Packet>,
    /// Number of distinct malformed regions skipped during this call.
    pub malformed_occurrences: usize,
}

/// Streaming decoder state for a single transport connection.
#[derive(Debug, Default)]
pub struct StreamFramer {
    buffer: BytesMut,
    /// True while we are inside a malformed region, so a run of garbage
    /// bytes counts as one occurrence rather than one per byte.
    skipping: bool,
}

impl StreamFramer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently buffered and not yet decoded.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Appends `data` and decodes as many packets as the buffer allows.
    pub fn process(&mut self, data: &[u8], max_payload: usize) -> FramerOutput {
        self.buffer.extend_from_slice(data);

        let mut packets = Vec::new();
        let mut malformed_occurrences = 0;

        loop {
            match Packet::deserialize(&self.buffer, max_payload) {
                Ok((packet, used)) => {
                    let _ = self.buffer.split_to(used);
                    self.skipping = false;
                    packets.push(packet);
                }
                Err(PacketError::NeedMoreData) => break,
                Err(err) => {
                    if !self.skipping {
                        malformed_occurrences += 1;
                        self.skipping = true;
                        warn!(error = %err, "header rejected, resynchronizing");
                    }
                    let _ = self.buffer.split_to(1);
                }
            }
        }

        if !packets.is_empty() {
            debug!(
                count = packets.len(),
                residue = self.buffer.len(),
                "frames decoded"
            );
        }

        FramerOutput {
            packets,
            malformed_occurrences,
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::protocol::packet::{FrameType, ServiceType, Version};

    const MAX: usize = 4096;

    fn packet(session_id: u8, payload: &'static [u8]) -> Packet {
        Packet {
            version: Version::V2,
            protected: false,
            frame_type: FrameType::Single,
            service: ServiceType::Rpc,
            frame_data: 0,
            session_id,
            message_id: 7,
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn single_packet_in_one_chunk() {
        let mut framer = StreamFramer::new();
        let out = framer.process(&packet(1, b"abc").serialize(), MAX);
        assert_eq!(out.packets.len(), 1);
        assert_eq!(out.malformed_occurrences, 0);
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn packet_split_across_chunks() {
        let mut framer = StreamFramer::new();
        let wire = packet(1, b"hello").serialize();
        let (a, b) = wire.split_at(5);

        assert!(framer.process(a, MAX).packets.is_empty());
        let out = framer.process(b, MAX);
        assert_eq!(out.packets.len(), 1);
        assert_eq!(out.packets[0].payload, Bytes::from_static(b"hello"));
    }

    #[test]
    fn back_to_back_packets() {
        let mut framer = StreamFramer::new();
        let mut wire = packet(1, b"one").serialize().to_vec();
        wire.extend_from_slice(&packet(2, b"two").serialize());

        let out = framer.process(&wire, MAX);
        assert_eq!(out.packets.len(), 2);
        assert_eq!(out.packets[0].session_id, 1);
        assert_eq!(out.packets[1].session_id, 2);
    }

    #[test]
    fn garbage_run_counts_once_and_resyncs() {
        let mut framer = StreamFramer::new();
        let mut wire = vec![0xFF; 16]; // invalid version nibble, 16 bytes
        wire.extend_from_slice(&packet(1, b"ok").serialize());

        let out = framer.process(&wire, MAX);
        assert_eq!(out.malformed_occurrences, 1);
        assert_eq!(out.packets.len(), 1);
        assert_eq!(out.packets[0].payload, Bytes::from_static(b"ok"));
    }

    #[test]
    fn separate_garbage_runs_count_separately() {
        let mut framer = StreamFramer::new();

        let mut wire = vec![0xFF; 4];
        wire.extend_from_slice(&packet(1, b"a").serialize());
        wire.extend_from_slice(&[0xEE; 4]);
        wire.extend_from_slice(&packet(2, b"b").serialize());

        let out = framer.process(&wire, MAX);
        assert_eq!(out.malformed_occurrences, 2);
        assert_eq!(out.packets.len(), 2);
    }

    #[test]
    fn oversized_payload_is_malformed_not_fatal() {
        let mut framer = StreamFramer::new();
        let mut wire = packet(1, b"toolarge").serialize().to_vec();
        wire.extend_from_slice(&packet(2, b"ok").serialize());

        let out = framer.process(&wire, 4);
        assert_eq!(out.malformed_occurrences, 1);
        // The small trailing packet still decodes once resync walks past
        // the oversized header.
        assert!(out.packets.iter().any(|p| p.session_id == 2));
    }
}
