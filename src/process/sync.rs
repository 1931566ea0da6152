//! Page synchronization and validation.
//!
//! Finds and validates framing pages inside a growing byte buffer. The
//! scanner is self-healing against arbitrary corruption: a page with a
//! valid CRC is always eventually recovered, at the cost of discarding the
//! corrupted span in between.

use log::{debug, warn};

use crate::structs::page::{HEADER_LEN, PAGE_MARKER, PAGE_VERSION, Page, crc_matches};

/// Bytes requested per refill when no page marker is in sight.
pub const DEFAULT_READ_LEN: usize = 4096;

/// Outcome of one scan attempt.
#[derive(Debug)]
pub enum Scan {
    /// A validated page. `consumed` counts from the scan offset past the
    /// end of the page and includes any corrupted span that was skipped to
    /// reach it.
    Page { page: Page, consumed: usize },

    /// More input is needed. `skip` bytes from the scan offset hold no
    /// page start and can be discarded; `read` is the number of additional
    /// bytes to fetch before retrying.
    Need { skip: usize, read: usize },
}

/// Locates and validates pages in a caller-owned byte buffer.
///
/// The scanner itself is stateless between calls; the caller appends input
/// to its buffer, discards what a [`Scan::Need`] marks as skippable, and
/// retries after fetching the requested bytes.
#[derive(Debug)]
pub struct PageScanner {
    read_len: usize,
}

impl Default for PageScanner {
    fn default() -> Self {
        Self {
            read_len: DEFAULT_READ_LEN,
        }
    }
}

impl PageScanner {
    /// Scans `buf` from `offset` for the next valid page.
    ///
    /// At each candidate marker the fixed header, segment table and body
    /// are checked for availability, requesting exactly the missing byte
    /// count when short. A CRC mismatch is not fatal: scanning resumes at
    /// the next marker candidate. When no marker is found at all, all but
    /// the last `PAGE_MARKER.len() - 1` bytes are marked skippable, so a
    /// marker split across a refill boundary is never lost.
    pub fn scan(&self, buf: &[u8], offset: usize) -> Scan {
        let mut pos = offset;

        loop {
            let Some(found) = find_marker(&buf[pos..]) else {
                let keep_from = buf
                    .len()
                    .saturating_sub(PAGE_MARKER.len() - 1)
                    .max(pos);

                return Scan::Need {
                    skip: keep_from - offset,
                    read: self.read_len,
                };
            };

            let start = pos + found;
            let avail = buf.len() - start;

            if avail < HEADER_LEN {
                return Scan::Need {
                    skip: start - offset,
                    read: HEADER_LEN - avail,
                };
            }

            let version = buf[start + PAGE_MARKER.len()];
            if version != PAGE_VERSION {
                debug!("Skipping marker with unsupported page version {version}");
                pos = start + 1;
                continue;
            }

            let segments = buf[start + HEADER_LEN - 1] as usize;
            let table_end = HEADER_LEN + segments;
            if avail < table_end {
                return Scan::Need {
                    skip: start - offset,
                    read: table_end - avail,
                };
            }

            let body_len = buf[start + HEADER_LEN..start + table_end]
                .iter()
                .map(|&l| l as usize)
                .sum::<usize>();
            let total = table_end + body_len;
            if avail < total {
                return Scan::Need {
                    skip: start - offset,
                    read: total - avail,
                };
            }

            let declared = u32::from_le_bytes([
                buf[start + 23],
                buf[start + 24],
                buf[start + 25],
                buf[start + 26],
            ]);

            if !crc_matches(&buf[start..start + total], declared) {
                warn!("Page CRC mismatch at candidate offset {start}, resynchronizing");
                pos = start + 1;
                continue;
            }

            match Page::parse(&buf[start..start + total]) {
                Ok(page) => {
                    if start > offset {
                        debug!("Recovered page after skipping {} bytes", start - offset);
                    }

                    return Scan::Page {
                        page,
                        consumed: start - offset + total,
                    };
                }
                Err(err) => {
                    // Availability was verified above, so this is corruption
                    // that happened to pass the CRC. Resynchronize anyway.
                    warn!("Discarding unparseable page at offset {start}: {err}");
                    pos = start + 1;
                }
            }
        }
    }
}

fn find_marker(buf: &[u8]) -> Option<usize> {
    if buf.len() < PAGE_MARKER.len() {
        return None;
    }

    buf.windows(PAGE_MARKER.len())
        .position(|window| window == PAGE_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::page::{GranulePosition, PageFlags, test_page};

    fn sample_page(sequence: u32) -> Page {
        test_page(
            0x5EA1,
            sequence,
            if sequence == 0 {
                PageFlags::BEGIN_OF_STREAM
            } else {
                0
            },
            GranulePosition::new(960 * (sequence as u64 + 1)),
            &[&[sequence as u8; 40]],
        )
    }

    #[test]
    fn recovers_pages_around_garbage() -> anyhow::Result<()> {
        let scanner = PageScanner::default();

        let first = sample_page(0);
        let second = sample_page(1);
        let garbage = [0xA5u8; 333];

        let mut buf = first.to_bytes()?;
        buf.extend_from_slice(&garbage);
        buf.extend_from_slice(&second.to_bytes()?);

        let Scan::Page { page, consumed } = scanner.scan(&buf, 0) else {
            panic!("first page not found");
        };
        assert_eq!(page, first);
        assert_eq!(consumed, first.len());

        let Scan::Page { page, consumed } = scanner.scan(&buf, first.len()) else {
            panic!("second page not found");
        };
        assert_eq!(page, second);

        // Skips exactly the garbage span.
        assert_eq!(consumed, garbage.len() + second.len());
        Ok(())
    }

    #[test]
    fn any_bit_flip_rejects_the_page() -> anyhow::Result<()> {
        let scanner = PageScanner::default();
        let bytes = sample_page(0).to_bytes()?;

        for i in 0..bytes.len() {
            let mut flipped = bytes.clone();
            flipped[i] ^= 0x10;

            match scanner.scan(&flipped, 0) {
                Scan::Need { .. } => {}
                Scan::Page { .. } => panic!("corrupt page accepted at byte {i}"),
            }
        }
        Ok(())
    }

    #[test]
    fn requests_exact_missing_bytes() -> anyhow::Result<()> {
        let scanner = PageScanner::default();
        let bytes = sample_page(0).to_bytes()?;

        // Header cut short.
        let Scan::Need { skip, read } = scanner.scan(&bytes[..10], 0) else {
            panic!("partial header accepted");
        };
        assert_eq!(skip, 0);
        assert_eq!(read, HEADER_LEN - 10);

        // Body cut short.
        let cut = bytes.len() - 7;
        let Scan::Need { skip, read } = scanner.scan(&bytes[..cut], 0) else {
            panic!("partial body accepted");
        };
        assert_eq!(skip, 0);
        assert_eq!(read, 7);
        Ok(())
    }

    #[test]
    fn keeps_tail_when_no_marker_found() {
        let scanner = PageScanner::default();
        let buf = vec![0x11u8; 100];

        let Scan::Need { skip, read } = scanner.scan(&buf, 0) else {
            panic!("garbage produced a page");
        };
        assert_eq!(skip, 100 - (PAGE_MARKER.len() - 1));
        assert_eq!(read, DEFAULT_READ_LEN);
    }

    #[test]
    fn marker_split_across_refill_survives() -> anyhow::Result<()> {
        let scanner = PageScanner::default();
        let bytes = sample_page(0).to_bytes()?;

        // Garbage followed by the first 3 marker bytes.
        let mut buf = vec![0x42u8; 50];
        buf.extend_from_slice(&bytes[..3]);

        let Scan::Need { skip, .. } = scanner.scan(&buf, 0) else {
            panic!("unexpected page");
        };

        // Apply the skip, then refill with the rest of the page.
        buf.drain(..skip);
        buf.extend_from_slice(&bytes[3..]);

        let Scan::Page { page, .. } = scanner.scan(&buf, 0) else {
            panic!("split marker lost");
        };
        assert_eq!(page.to_bytes()?, bytes);
        Ok(())
    }
}
