//! Stream demultiplexing.
//!
//! Owns the synchronizer's byte buffer, routes validated pages to their
//! per-serial reassemblers, and manages stream lifecycle: streams are
//! created on an accepted BEGIN_OF_STREAM page and destroyed once their
//! END_OF_STREAM packet has been emitted. Completed packets leave the
//! demultiplexer wrapped as [`DataBlock`]s stamped with the current
//! sync/playout tags.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use log::debug;

use crate::log_or_err;
use crate::process::stream::StreamReassembler;
use crate::process::sync::{PageScanner, Scan};
use crate::structs::block::{DataBlock, PlayoutInfo, SyncToken};
use crate::structs::packet::Packet;
use crate::structs::page::Page;

/// The sniffed type of a newly discovered logical stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamKind(pub &'static str);

impl Display for StreamKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

/// A pure format probe: inspects the first page of a stream and returns
/// the stream kind when it recognizes (and wants) the format.
pub type Probe = fn(&Page) -> Option<StreamKind>;

/// An ordered, atomically swappable list of format probes.
///
/// The set is shared by cloning; [`ProbeSet::replace`] swaps the probe list
/// under all holders at once, which keeps a source swap race-free while a
/// demultiplexer is running.
#[derive(Clone, Default)]
pub struct ProbeSet {
    probes: Arc<Mutex<Vec<Probe>>>,
}

impl ProbeSet {
    pub fn new(probes: Vec<Probe>) -> Self {
        Self {
            probes: Arc::new(Mutex::new(probes)),
        }
    }

    /// Replaces the whole probe list.
    pub fn replace(&self, probes: Vec<Probe>) {
        *self.probes.lock().unwrap() = probes;
    }

    /// Tries each probe in order; the first match wins.
    pub fn sniff(&self, first_page: &Page) -> Option<StreamKind> {
        self.probes
            .lock()
            .unwrap()
            .iter()
            .find_map(|probe| probe(first_page))
    }
}

/// Stream lifecycle callbacks.
///
/// `end_of_stream` also fires when a stream is dropped because of a
/// protocol violation, so holders can release per-stream state either way.
pub trait StreamEvents: Send {
    fn begin_of_stream(&mut self, _serial: u32, _kind: StreamKind) {}
    fn end_of_stream(&mut self, _serial: u32) {}
}

impl StreamEvents for () {}

/// Routes container bytes to per-stream reassemblers.
pub struct Demultiplexer {
    buffer: Vec<u8>,
    scanner: PageScanner,
    streams: HashMap<u32, StreamReassembler>,
    probes: ProbeSet,
    events: Box<dyn StreamEvents>,

    sync: SyncToken,
    playout: PlayoutInfo,

    want_bytes: usize,
    skipped: u64,
    pages_routed: u64,
    fail_level: log::Level,
}

impl Demultiplexer {
    pub fn new(probes: ProbeSet, events: Box<dyn StreamEvents>) -> Self {
        Self {
            buffer: Vec::new(),
            scanner: PageScanner::default(),
            streams: HashMap::new(),
            probes,
            events,
            sync: SyncToken::default(),
            playout: PlayoutInfo::default(),
            want_bytes: crate::process::sync::DEFAULT_READ_LEN,
            skipped: 0,
            pages_routed: 0,
            fail_level: log::Level::Error,
        }
    }

    /// Appends raw container bytes to the scan buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// How many more bytes the scanner asked for on the last [`step`].
    ///
    /// Useful as a read-size hint for the transport. [`step`]: Self::step
    pub fn want_bytes(&self) -> usize {
        self.want_bytes
    }

    /// Total corrupted/unclaimed bytes discarded during resynchronization.
    pub fn skipped_bytes(&self) -> u64 {
        self.skipped
    }

    pub fn pages_routed(&self) -> u64 {
        self.pages_routed
    }

    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }

    /// Updates the correlation tag stamped on subsequently emitted blocks.
    pub fn set_sync_token(&mut self, sync: SyncToken) {
        self.sync = sync;
    }

    /// Updates the playout metadata stamped on subsequently emitted blocks.
    pub fn set_playout_info(&mut self, playout: PlayoutInfo) {
        self.playout = playout;
    }

    /// Sets the failure level for protocol violations.
    ///
    /// - `log::Level::Error`: violations are logged, the offending stream
    ///   is dropped, processing continues (default)
    /// - `log::Level::Warn`: violations abort [`step`] with an error
    ///   (strict mode) [`step`]: Self::step
    pub fn set_fail_level(&mut self, level: log::Level) {
        self.fail_level = level;
    }

    /// Pulls zero or more pages out of the buffer and routes them,
    /// returning every packet that completed, in order.
    ///
    /// Returns when the buffer holds no further complete page; call
    /// [`feed`] with at least [`want_bytes`] more input and step again.
    ///
    /// [`feed`]: Self::feed
    /// [`want_bytes`]: Self::want_bytes
    pub fn step(&mut self) -> Result<Vec<DataBlock<Packet>>> {
        let mut out = Vec::new();

        loop {
            match self.scanner.scan(&self.buffer, 0) {
                Scan::Need { skip, read } => {
                    if skip > 0 {
                        self.buffer.drain(..skip);
                        self.skipped += skip as u64;
                    }
                    self.want_bytes = read;
                    return Ok(out);
                }
                Scan::Page { page, consumed } => {
                    self.skipped += (consumed - page.len()) as u64;
                    self.buffer.drain(..consumed);
                    self.route(page, &mut out)?;
                }
            }
        }
    }

    fn route(&mut self, page: Page, out: &mut Vec<DataBlock<Packet>>) -> Result<()> {
        let serial = page.serial;
        self.pages_routed += 1;

        let mut stream = if let Some(stream) = self.streams.remove(&serial) {
            stream
        } else if page.flags.begin_of_stream() {
            let Some(kind) = self.probes.sniff(&page) else {
                debug!("Ignoring unwanted stream {serial:#010X}");
                return Ok(());
            };

            debug!("New stream {serial:#010X}, kind {kind}");
            self.events.begin_of_stream(serial, kind);
            StreamReassembler::new(serial)
        } else {
            // Unknown serial without BEGIN_OF_STREAM: either an unwanted
            // stream or a remnant from before a reconnect. Dropped silently.
            debug!("Discarding page for unknown stream {serial:#010X}");
            return Ok(());
        };

        if let Err(err) = stream.add(&page) {
            // Protocol violation: this stream's state is inconsistent
            // beyond recovery, terminate its processing.
            self.events.end_of_stream(serial);
            log_or_err!(self, log::Level::Warn, err);
            return Ok(());
        }

        while let Some(packet) = stream.read() {
            out.push(DataBlock::new(packet, self.sync, self.playout.clone()));
        }

        if stream.finished() {
            self.events.end_of_stream(serial);
        } else {
            self.streams.insert(serial, stream);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::page::{GranulePosition, PageFlags, test_page};

    const WANTED: u32 = 0x0A;
    const UNWANTED: u32 = 0x0B;

    fn sniff_wanted(page: &Page) -> Option<StreamKind> {
        page.body.starts_with(b"WANT").then_some(StreamKind("test-audio"))
    }

    #[derive(Default)]
    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl StreamEvents for Recorder {
        fn begin_of_stream(&mut self, serial: u32, kind: StreamKind) {
            self.0.lock().unwrap().push(format!("begin {serial:#X} {kind}"));
        }

        fn end_of_stream(&mut self, serial: u32) {
            self.0.lock().unwrap().push(format!("end {serial:#X}"));
        }
    }

    fn demux_with_recorder() -> (Demultiplexer, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let demux = Demultiplexer::new(
            ProbeSet::new(vec![sniff_wanted]),
            Box::new(Recorder(log.clone())),
        );
        (demux, log)
    }

    #[test]
    fn routes_wanted_streams_and_ignores_others() -> anyhow::Result<()> {
        let (mut demux, log) = demux_with_recorder();
        demux.set_sync_token(SyncToken(77));

        let mut bytes = Vec::new();
        for page in [
            test_page(WANTED, 0, PageFlags::BEGIN_OF_STREAM, GranulePosition::INVALID, &[b"WANT".as_slice()]),
            test_page(UNWANTED, 0, PageFlags::BEGIN_OF_STREAM, GranulePosition::INVALID, &[b"NOPE".as_slice()]),
            test_page(WANTED, 1, 0, GranulePosition::new(960), &[b"data-a".as_slice()]),
            test_page(UNWANTED, 1, 0, GranulePosition::new(960), &[b"data-b".as_slice()]),
            test_page(WANTED, 2, PageFlags::END_OF_STREAM, GranulePosition::new(1920), &[b"tail".as_slice()]),
        ] {
            bytes.extend_from_slice(&page.to_bytes()?);
        }

        // Feed in small chunks to exercise the insufficient-data path.
        let mut blocks = Vec::new();
        for chunk in bytes.chunks(13) {
            demux.feed(chunk);
            blocks.extend(demux.step()?);
        }

        let bodies: Vec<&[u8]> = blocks.iter().map(|b| b.payload.as_ref()).collect();
        assert_eq!(bodies, vec![b"WANT".as_slice(), b"data-a", b"tail"]);
        assert!(blocks.iter().all(|b| b.sync == SyncToken(77)));
        assert!(blocks.last().unwrap().payload.end_of_stream);
        assert_eq!(demux.active_streams(), 0);

        let events = log.lock().unwrap();
        assert_eq!(*events, vec!["begin 0xA test-audio", "end 0xA"]);
        Ok(())
    }

    #[test]
    fn counts_skipped_garbage_exactly() -> anyhow::Result<()> {
        let (mut demux, _) = demux_with_recorder();

        let bos = test_page(WANTED, 0, PageFlags::BEGIN_OF_STREAM, GranulePosition::INVALID, &[b"WANT".as_slice()]);
        let data = test_page(WANTED, 1, 0, GranulePosition::new(960), &[b"pcm".as_slice()]);

        let mut bytes = bos.to_bytes()?;
        bytes.extend_from_slice(&[0xEEu8; 217]);
        bytes.extend_from_slice(&data.to_bytes()?);

        demux.feed(&bytes);
        let blocks = demux.step()?;

        assert_eq!(blocks.len(), 2);
        assert_eq!(demux.skipped_bytes(), 217);
        assert_eq!(demux.pages_routed(), 2);
        Ok(())
    }

    #[test]
    fn violation_drops_stream_in_lenient_mode() -> anyhow::Result<()> {
        let (mut demux, log) = demux_with_recorder();

        let bos = test_page(WANTED, 0, PageFlags::BEGIN_OF_STREAM, GranulePosition::INVALID, &[b"WANT".as_slice()]);
        let dup = test_page(WANTED, 1, PageFlags::BEGIN_OF_STREAM, GranulePosition::INVALID, &[b"WANT".as_slice()]);

        demux.feed(&bos.to_bytes()?);
        demux.feed(&dup.to_bytes()?);
        demux.step()?;

        assert_eq!(demux.active_streams(), 0);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["begin 0xA test-audio", "end 0xA"]
        );
        Ok(())
    }

    #[test]
    fn violation_fails_step_in_strict_mode() -> anyhow::Result<()> {
        let (mut demux, _) = demux_with_recorder();
        demux.set_fail_level(log::Level::Warn);

        let bos = test_page(WANTED, 0, PageFlags::BEGIN_OF_STREAM, GranulePosition::INVALID, &[b"WANT".as_slice()]);
        let dup = test_page(WANTED, 1, PageFlags::BEGIN_OF_STREAM, GranulePosition::INVALID, &[b"WANT".as_slice()]);

        demux.feed(&bos.to_bytes()?);
        demux.feed(&dup.to_bytes()?);

        assert!(demux.step().is_err());
        Ok(())
    }

    #[test]
    fn probe_set_is_swappable_while_shared() {
        let probes = ProbeSet::new(vec![]);
        let shared = probes.clone();

        let bos = test_page(WANTED, 0, PageFlags::BEGIN_OF_STREAM, GranulePosition::INVALID, &[b"WANT".as_slice()]);
        assert!(shared.sniff(&bos).is_none());

        probes.replace(vec![sniff_wanted]);
        assert_eq!(shared.sniff(&bos), Some(StreamKind("test-audio")));
    }
}
