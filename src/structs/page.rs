//! Container page structures and binary layout.
//!
//! A page is the framing unit of the container format: a 5-byte marker,
//! a 28-byte fixed header, a segment table, and a body whose length is the
//! sum of the table entries. All multi-byte integers are little-endian.
//! Pages are independently verifiable through a CRC-32 computed over the
//! whole page with the CRC field zeroed.

use std::fmt::{Display, Formatter};
use std::io;

use bitstream_io::{ByteRead, ByteReader, ByteWrite, ByteWriter, LittleEndian};

use crate::utils::crc::{CRC_PAGE_ALG, Crc32};
use crate::utils::errors::PageError;

/// Page marker: a fixed 4-byte constant followed by one reserved zero byte.
pub const PAGE_MARKER: [u8; 5] = [b'O', b'g', b'g', b'S', 0x00];

/// Fixed header length including the marker and the segment count byte.
pub const HEADER_LEN: usize = 28;

/// Byte offset of the CRC field inside the page.
pub const CRC_OFFSET: usize = 23;

/// The only page version this crate understands.
pub const PAGE_VERSION: u8 = 0;

/// Largest possible page: full header, 255 segments of 255 bytes each.
pub const MAX_PAGE_LEN: usize = HEADER_LEN + 255 + 255 * 255;

static PAGE_CRC: Crc32 = Crc32::new(&CRC_PAGE_ALG);

/// Codec-specific 64-bit position carried by a page.
///
/// The meaning of the value is defined by the codec occupying the logical
/// stream (typically samples decoded so far). The all-ones pattern is
/// reserved for "invalid/unknown". Only raw-value equality is meaningful;
/// no ordering is assumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GranulePosition(u64);

impl GranulePosition {
    /// Reserved "invalid/unknown" position.
    pub const INVALID: Self = Self(u64::MAX);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 != u64::MAX
    }
}

impl Display for GranulePosition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            f.write_str("invalid")
        }
    }
}

/// Page header flag set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageFlags(pub u8);

impl PageFlags {
    pub const CONTINUED: u8 = 0x01;
    pub const BEGIN_OF_STREAM: u8 = 0x02;
    pub const END_OF_STREAM: u8 = 0x04;

    pub const fn continued(self) -> bool {
        self.0 & Self::CONTINUED != 0
    }

    pub const fn begin_of_stream(self) -> bool {
        self.0 & Self::BEGIN_OF_STREAM != 0
    }

    pub const fn end_of_stream(self) -> bool {
        self.0 & Self::END_OF_STREAM != 0
    }
}

/// One framing unit of the container format.
///
/// A page belongs to exactly one logical stream, identified by `serial`.
/// Its `sequence` number increases by one per page within that stream;
/// any other step indicates lost pages. The segment table describes how the
/// body splits into logical segments: an entry of 255 means the segment
/// continues in the next table entry (or, with the CONTINUED flag, on the
/// next page).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub version: u8,
    pub flags: PageFlags,
    pub granule_position: GranulePosition,
    pub serial: u32,
    pub sequence: u32,
    pub crc: u32,
    pub segment_table: Vec<u8>,
    pub body: Vec<u8>,
}

impl Page {
    /// Total encoded length of the page in bytes.
    pub fn len(&self) -> usize {
        HEADER_LEN + self.segment_table.len() + self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segment_table.is_empty()
    }

    /// Parses one complete page from the start of `buf`.
    ///
    /// The buffer must begin with the page marker and contain the whole
    /// page. The CRC field is read but not verified; callers that need
    /// integrity checking compare against [`Page::checksum`].
    pub fn parse(buf: &[u8]) -> Result<Self, PageError> {
        if buf.len() < HEADER_LEN {
            return Err(PageError::Truncated {
                available: buf.len(),
                needed: HEADER_LEN,
            });
        }

        if buf[..PAGE_MARKER.len()] != PAGE_MARKER {
            return Err(PageError::InvalidMarker);
        }

        let mut reader = ByteReader::endian(io::Cursor::new(&buf[PAGE_MARKER.len()..]), LittleEndian);

        // Reads past HEADER_LEN are guarded above, so the fixed fields
        // cannot fail; map errors anyway rather than panic.
        let short = |_: io::Error| PageError::Truncated {
            available: buf.len(),
            needed: HEADER_LEN,
        };

        let version: u8 = reader.read().map_err(short)?;
        if version != PAGE_VERSION {
            return Err(PageError::UnsupportedVersion(version));
        }

        let flags = PageFlags(reader.read().map_err(short)?);
        let granule_position = GranulePosition::new(reader.read().map_err(short)?);
        let serial: u32 = reader.read().map_err(short)?;
        let sequence: u32 = reader.read().map_err(short)?;
        let crc: u32 = reader.read().map_err(short)?;
        let segments: u8 = reader.read().map_err(short)?;

        let table_end = HEADER_LEN + segments as usize;
        if buf.len() < table_end {
            return Err(PageError::Truncated {
                available: buf.len(),
                needed: table_end,
            });
        }

        let segment_table = buf[HEADER_LEN..table_end].to_vec();
        let body_len = segment_table.iter().map(|&l| l as usize).sum::<usize>();

        if buf.len() < table_end + body_len {
            return Err(PageError::Truncated {
                available: buf.len(),
                needed: table_end + body_len,
            });
        }

        let body = buf[table_end..table_end + body_len].to_vec();

        Ok(Self {
            version,
            flags,
            granule_position,
            serial,
            sequence,
            crc,
            segment_table,
            body,
        })
    }

    /// Serializes the page, writing the stored CRC field as-is.
    pub fn write_to<W: io::Write>(&self, writer: W) -> Result<(), PageError> {
        if self.segment_table.len() > 255 {
            return Err(PageError::SegmentTableTooLong(self.segment_table.len()));
        }

        let body_len = self
            .segment_table
            .iter()
            .map(|&l| l as usize)
            .sum::<usize>();
        if body_len != self.body.len() {
            return Err(PageError::BodyLengthMismatch {
                expected: body_len,
                actual: self.body.len(),
            });
        }

        let mut w = ByteWriter::endian(writer, LittleEndian);
        let full = |_: io::Error| PageError::Truncated {
            available: 0,
            needed: self.len(),
        };

        w.write_bytes(&PAGE_MARKER).map_err(full)?;
        w.write(self.version).map_err(full)?;
        w.write(self.flags.0).map_err(full)?;
        w.write(self.granule_position.value()).map_err(full)?;
        w.write(self.serial).map_err(full)?;
        w.write(self.sequence).map_err(full)?;
        w.write(self.crc).map_err(full)?;
        w.write(self.segment_table.len() as u8).map_err(full)?;
        w.write_bytes(&self.segment_table).map_err(full)?;
        w.write_bytes(&self.body).map_err(full)?;

        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, PageError> {
        let mut out = Vec::with_capacity(self.len());
        self.write_to(&mut out)?;
        Ok(out)
    }

    /// Computes the CRC the page should carry: a checksum over the entire
    /// encoded page with the CRC field zeroed.
    pub fn checksum(&self) -> Result<u32, PageError> {
        let mut bytes = self.to_bytes()?;
        bytes[CRC_OFFSET..CRC_OFFSET + 4].fill(0);
        Ok(PAGE_CRC.checksum(&bytes))
    }

    /// Recomputes and stores the CRC field. Call after filling in all other
    /// fields and before serializing for transmission.
    pub fn seal(&mut self) -> Result<(), PageError> {
        self.crc = self.checksum()?;
        Ok(())
    }
}

/// Validates the CRC of an encoded page occupying exactly `buf`.
pub(crate) fn crc_matches(buf: &[u8], declared: u32) -> bool {
    debug_assert!(buf.len() >= HEADER_LEN);

    let zero = [0u8; 4];
    let mut crc = PAGE_CRC.update(PAGE_CRC.init, &buf[..CRC_OFFSET]);
    crc = PAGE_CRC.update(crc, &zero);
    crc = PAGE_CRC.update(crc, &buf[CRC_OFFSET + 4..]);

    crc == declared
}

#[cfg(test)]
pub(crate) fn test_page(
    serial: u32,
    sequence: u32,
    flags: u8,
    granule: GranulePosition,
    segments: &[&[u8]],
) -> Page {
    let mut segment_table = Vec::new();
    let mut body = Vec::new();

    for seg in segments {
        let mut rest = seg.len();
        loop {
            let chunk = rest.min(255);
            segment_table.push(chunk as u8);
            rest -= chunk;
            if chunk < 255 {
                break;
            }
        }
        body.extend_from_slice(seg);
    }

    let mut page = Page {
        version: PAGE_VERSION,
        flags: PageFlags(flags),
        granule_position: granule,
        serial,
        sequence,
        crc: 0,
        segment_table,
        body,
    };
    page.seal().unwrap();
    page
}

#[test]
fn header_round_trip() -> anyhow::Result<()> {
    let page = test_page(
        0xDEAD_BEEF,
        7,
        PageFlags::BEGIN_OF_STREAM,
        GranulePosition::new(48_000),
        &[b"OpusHead".as_slice()],
    );

    let bytes = page.to_bytes()?;
    let parsed = Page::parse(&bytes)?;

    assert_eq!(parsed, page);
    assert_eq!(parsed.to_bytes()?, bytes);
    assert_eq!(parsed.checksum()?, parsed.crc);
    Ok(())
}

#[test]
fn sealed_page_passes_crc() -> anyhow::Result<()> {
    let page = test_page(1, 0, PageFlags::BEGIN_OF_STREAM, GranulePosition::INVALID, &[&[9u8; 300]]);

    let bytes = page.to_bytes()?;
    assert!(crc_matches(&bytes, page.crc));

    // 300-byte segment spans two table entries: 255 + 45.
    assert_eq!(page.segment_table, vec![255, 45]);
    Ok(())
}

#[test]
fn invalid_granule_position() {
    assert!(!GranulePosition::INVALID.is_valid());
    assert!(GranulePosition::new(0).is_valid());
    assert_eq!(format!("{}", GranulePosition::INVALID), "invalid");
}

#[test]
fn truncated_page_is_rejected() {
    let page = test_page(1, 0, PageFlags::BEGIN_OF_STREAM, GranulePosition::INVALID, &[b"x".as_slice()]);
    let bytes = page.to_bytes().unwrap();

    for cut in [0, 4, HEADER_LEN - 1, bytes.len() - 1] {
        assert!(matches!(
            Page::parse(&bytes[..cut]),
            Err(PageError::Truncated { .. }) | Err(PageError::InvalidMarker)
        ));
    }
}
