//! Per-stream packet reassembly.
//!
//! Turns the sequence of pages belonging to one logical stream back into
//! ordered packets, accumulating segments across table entries and page
//! boundaries, and surfacing lost pages as an `after_hole` marker on the
//! next completed packet.

use std::collections::VecDeque;
use std::mem;

use log::warn;

use crate::structs::packet::Packet;
use crate::structs::page::{GranulePosition, Page};
use crate::utils::errors::StreamError;

/// Reassembles packets for a single logical stream.
///
/// The first page added must carry BEGIN_OF_STREAM; adding pages after
/// END_OF_STREAM, or a second BEGIN_OF_STREAM, is a hard error that
/// terminates processing of this stream.
#[derive(Debug, Default)]
pub struct StreamReassembler {
    serial: u32,
    last_sequence: u32,
    bos_seen: bool,
    eos_seen: bool,
    emitted_any: bool,

    /// Body bytes of a packet still open across table entries or pages.
    pending: Vec<u8>,
    /// Discarding continuation data whose head was lost to a hole.
    drop_continuation: bool,
    /// The next completed packet follows a sequence gap.
    after_hole: bool,

    ready: VecDeque<Packet>,
}

impl StreamReassembler {
    pub fn new(serial: u32) -> Self {
        Self {
            serial,
            ..Self::default()
        }
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// True once the END_OF_STREAM page has been consumed.
    pub fn finished(&self) -> bool {
        self.eos_seen
    }

    /// Adds a page already known to belong to this stream.
    pub fn add(&mut self, page: &Page) -> Result<(), StreamError> {
        if page.serial != self.serial {
            return Err(StreamError::SerialMismatch {
                expected: self.serial,
                got: page.serial,
            });
        }

        if self.eos_seen {
            return Err(StreamError::PageAfterEndOfStream {
                serial: self.serial,
            });
        }

        if !self.bos_seen {
            if !page.flags.begin_of_stream() {
                return Err(StreamError::MissingBeginOfStream {
                    serial: self.serial,
                });
            }

            self.bos_seen = true;
        } else {
            if page.flags.begin_of_stream() {
                return Err(StreamError::DuplicateBeginOfStream {
                    serial: self.serial,
                });
            }

            let expected = self.last_sequence.wrapping_add(1);
            if page.sequence != expected {
                warn!(
                    "Stream {:#010X}: sequence hole, expected {expected}, got {}",
                    self.serial, page.sequence
                );

                // A hole invalidates in-flight continuation data; it cannot
                // be safely completed. If this page opens with continuation
                // segments their head is gone too, so they are discarded up
                // to the first closing entry.
                self.after_hole = true;
                self.pending.clear();
                self.drop_continuation = page.flags.continued();
            } else if self.drop_continuation {
                if !page.flags.continued() {
                    self.drop_continuation = false;
                }
            } else if page.flags.continued() && self.pending.is_empty() {
                // Continuation with nothing in flight: the head was never
                // seen, discard up to the close.
                warn!(
                    "Stream {:#010X}: continuation without an open packet",
                    self.serial
                );
                self.drop_continuation = true;
            } else if !page.flags.continued() && !self.pending.is_empty() {
                // The continuation that was promised never arrived.
                warn!(
                    "Stream {:#010X}: open packet abandoned at page boundary",
                    self.serial
                );
                self.pending.clear();
                self.after_hole = true;
            }
        }

        self.last_sequence = page.sequence;

        if page.flags.end_of_stream() {
            self.eos_seen = true;
        }

        self.consume_segments(page);

        Ok(())
    }

    fn consume_segments(&mut self, page: &Page) {
        let last_entry = page.segment_table.len().wrapping_sub(1);
        let mut offset = 0usize;

        for (index, &entry) in page.segment_table.iter().enumerate() {
            let segment = &page.body[offset..offset + entry as usize];
            offset += entry as usize;

            if self.drop_continuation {
                if entry < 255 {
                    self.drop_continuation = false;
                }
                continue;
            }

            self.pending.extend_from_slice(segment);

            // An entry of 255 keeps the segment open; anything shorter
            // closes the packet.
            if entry < 255 {
                let is_page_last = index == last_entry;

                let packet = Packet {
                    granule_position: if is_page_last {
                        page.granule_position
                    } else {
                        GranulePosition::INVALID
                    },
                    begin_of_stream: !self.emitted_any,
                    end_of_stream: page.flags.end_of_stream() && is_page_last,
                    after_hole: mem::take(&mut self.after_hole),
                    body: mem::take(&mut self.pending),
                };

                self.emitted_any = true;
                self.ready.push_back(packet);
            }
        }
    }

    /// Returns the next completed packet, or `None` when no packet has
    /// closed yet.
    pub fn read(&mut self) -> Option<Packet> {
        self.ready.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::page::{PAGE_VERSION, PageFlags};

    const SERIAL: u32 = 0xCAFE;

    fn raw_page(sequence: u32, flags: u8, granule: u64, table: &[u8], body: &[u8]) -> Page {
        let mut page = Page {
            version: PAGE_VERSION,
            flags: PageFlags(flags),
            granule_position: GranulePosition::new(granule),
            serial: SERIAL,
            sequence,
            crc: 0,
            segment_table: table.to_vec(),
            body: body.to_vec(),
        };
        page.seal().unwrap();
        page
    }

    #[test]
    fn packet_spanning_two_pages() -> anyhow::Result<()> {
        let mut stream = StreamReassembler::new(SERIAL);

        let head = vec![0xAAu8; 255];
        let tail = vec![0xBBu8; 45];

        stream.add(&raw_page(0, PageFlags::BEGIN_OF_STREAM, u64::MAX, &[255], &head))?;
        assert!(stream.read().is_none());

        stream.add(&raw_page(1, PageFlags::CONTINUED, 300, &[45], &tail))?;

        let packet = stream.read().expect("packet should close");
        let mut expected = head;
        expected.extend_from_slice(&tail);
        assert_eq!(packet.body, expected);
        assert_eq!(packet.granule_position, GranulePosition::new(300));
        assert!(packet.begin_of_stream);
        assert!(!packet.after_hole);
        Ok(())
    }

    #[test]
    fn hole_marks_only_the_next_packet() -> anyhow::Result<()> {
        let mut stream = StreamReassembler::new(SERIAL);

        stream.add(&raw_page(0, PageFlags::BEGIN_OF_STREAM, 100, &[4], &[1, 2, 3, 4]))?;
        // Sequence 1 lost.
        stream.add(&raw_page(2, 0, 200, &[2], &[5, 6]))?;
        stream.add(&raw_page(3, 0, 300, &[2], &[7, 8]))?;

        let before = stream.read().unwrap();
        assert!(!before.after_hole);

        let after = stream.read().unwrap();
        assert!(after.after_hole);
        assert_eq!(after.body, vec![5, 6]);

        let next = stream.read().unwrap();
        assert!(!next.after_hole);
        Ok(())
    }

    #[test]
    fn hole_drops_in_flight_continuation() -> anyhow::Result<()> {
        let mut stream = StreamReassembler::new(SERIAL);

        // Packet opens with 255 bytes and should have continued on page 1.
        stream.add(&raw_page(0, PageFlags::BEGIN_OF_STREAM, u64::MAX, &[255], &[0x11; 255]))?;
        // Page 1 lost; page 2 opens with the tail of some other packet,
        // which must be discarded, then a complete packet.
        let mut body = vec![0x22u8; 30];
        body.extend_from_slice(&[0x33; 8]);
        stream.add(&raw_page(2, PageFlags::CONTINUED, 500, &[30, 8], &body))?;

        let packet = stream.read().expect("whole packet after the hole");
        assert_eq!(packet.body, vec![0x33; 8]);
        assert!(packet.after_hole);
        assert!(stream.read().is_none());
        Ok(())
    }

    #[test]
    fn granule_valid_only_on_last_segment() -> anyhow::Result<()> {
        let mut stream = StreamReassembler::new(SERIAL);

        stream.add(&raw_page(
            0,
            PageFlags::BEGIN_OF_STREAM,
            1234,
            &[3, 5],
            &[1, 2, 3, 4, 5, 6, 7, 8],
        ))?;

        let first = stream.read().unwrap();
        assert!(!first.granule_position.is_valid());

        let second = stream.read().unwrap();
        assert_eq!(second.granule_position, GranulePosition::new(1234));
        Ok(())
    }

    #[test]
    fn lifecycle_violations_are_hard_errors() {
        let mut stream = StreamReassembler::new(SERIAL);

        // First page must carry BOS.
        assert!(matches!(
            stream.add(&raw_page(0, 0, 0, &[1], &[9])),
            Err(StreamError::MissingBeginOfStream { .. })
        ));

        stream
            .add(&raw_page(0, PageFlags::BEGIN_OF_STREAM, 0, &[1], &[9]))
            .unwrap();

        assert!(matches!(
            stream.add(&raw_page(1, PageFlags::BEGIN_OF_STREAM, 0, &[1], &[9])),
            Err(StreamError::DuplicateBeginOfStream { .. })
        ));

        stream
            .add(&raw_page(1, PageFlags::END_OF_STREAM, 10, &[1], &[9]))
            .unwrap();
        assert!(stream.finished());

        // First read drains the packet from page 0, which predates EOS.
        assert!(!stream.read().unwrap().end_of_stream);
        assert!(stream.read().unwrap().end_of_stream);

        assert!(matches!(
            stream.add(&raw_page(2, 0, 0, &[1], &[9])),
            Err(StreamError::PageAfterEndOfStream { .. })
        ));
    }
}
