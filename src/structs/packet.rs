//! Reassembled stream packets.

use crate::structs::page::GranulePosition;

/// A logical unit of stream data, reassembled from one or more page
/// segments.
///
/// `granule_position` is valid only when the segment that closed this
/// packet was the last segment of its page; mid-page packets carry
/// [`GranulePosition::INVALID`] since the true position is not yet
/// determined at that point.
///
/// `after_hole` marks that one or more pages of this stream were lost
/// immediately before this packet. Consumers must treat it as a
/// discontinuity and must not assume contiguous timing with the previous
/// packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub granule_position: GranulePosition,
    pub begin_of_stream: bool,
    pub end_of_stream: bool,
    pub after_hole: bool,
    pub body: Vec<u8>,
}

impl Packet {
    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] {
        &self.body
    }
}
