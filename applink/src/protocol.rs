//! Framed wire transport: packet codec, stream decoding, reassembly.

pub mod framer;
pub mod packet;
pub mod reassembly;

pub use framer::{FramerOutput, StreamFramer};
pub use packet::{FrameType, Packet, PacketError, ServiceType, Version};
pub use reassembly::{Reassembler, ReassemblyError};
