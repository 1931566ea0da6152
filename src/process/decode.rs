//! Decoder seam and container-to-PCM glue.
//!
//! The codec itself lives outside this crate behind [`PacketDecoder`];
//! [`DecodeSource`] chains a byte source, a [`Demultiplexer`] and one
//! active decoder into a [`BlockSource`] of PCM, so the skip filter and
//! ring buffer can sit directly on top of a network transport.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use log::{debug, warn};

use crate::process::demux::{Demultiplexer, ProbeSet, StreamEvents, StreamKind};
use crate::structs::block::{BlockRead, BlockSource, ByteSource, DataBlock, PcmBlock};
use crate::structs::packet::Packet;

/// Turns reassembled packets into PCM blocks.
///
/// Implementations wrap an actual codec. Header packets that produce no
/// audio return `Ok(None)`.
pub trait PacketDecoder: Send {
    fn decode(&mut self, packet: &Packet) -> Result<Option<PcmBlock>>;

    /// Called on a discontinuity (`after_hole` packet) before the packet is
    /// decoded, so codec state from before the gap is not carried across.
    fn reset(&mut self) {}
}

/// Opens a decoder for a sniffed stream kind.
pub trait DecoderFactory: Send {
    fn open(&mut self, kind: StreamKind) -> Result<Box<dyn PacketDecoder>>;
}

#[derive(Default)]
struct TrackEvents {
    started: VecDeque<(u32, StreamKind)>,
    ended: VecDeque<u32>,
}

struct TrackRecorder(Arc<Mutex<TrackEvents>>);

impl StreamEvents for TrackRecorder {
    fn begin_of_stream(&mut self, serial: u32, kind: StreamKind) {
        self.0.lock().unwrap().started.push_back((serial, kind));
    }

    fn end_of_stream(&mut self, serial: u32) {
        self.0.lock().unwrap().ended.push_back(serial);
    }
}

/// A PCM block source over container bytes.
///
/// Pulls chunks from the byte source using the demultiplexer's read hints,
/// decodes completed packets with the decoder obtained from the factory,
/// and forwards the demultiplexer's sync/playout tags onto every PCM block.
///
/// One decoder is active at a time, opened for the first accepted stream;
/// the probe set should therefore accept a single logical stream per
/// connection. When that stream ends, the next accepted one (if any) gets a
/// fresh decoder.
pub struct DecodeSource {
    input: Box<dyn ByteSource>,
    demux: Demultiplexer,
    factory: Box<dyn DecoderFactory>,
    decoder: Option<Box<dyn PacketDecoder>>,
    active_serial: Option<u32>,
    tracks: Arc<Mutex<TrackEvents>>,
    pending: VecDeque<DataBlock<Packet>>,
    input_done: bool,
}

impl DecodeSource {
    pub fn new(
        input: Box<dyn ByteSource>,
        probes: ProbeSet,
        factory: Box<dyn DecoderFactory>,
    ) -> Self {
        let tracks = Arc::new(Mutex::new(TrackEvents::default()));
        let demux = Demultiplexer::new(probes, Box::new(TrackRecorder(tracks.clone())));

        Self {
            input,
            demux,
            factory,
            decoder: None,
            active_serial: None,
            tracks,
            pending: VecDeque::new(),
            input_done: false,
        }
    }

    pub fn demux_mut(&mut self) -> &mut Demultiplexer {
        &mut self.demux
    }

    /// Opens a decoder for the earliest accepted stream that has none yet.
    fn ensure_decoder(&mut self) -> Result<()> {
        if self.decoder.is_some() {
            return Ok(());
        }

        let started = self.tracks.lock().unwrap().started.pop_front();
        if let Some((serial, kind)) = started {
            debug!("Opening decoder for stream {serial:#010X} ({kind})");
            self.decoder = Some(self.factory.open(kind)?);
            self.active_serial = Some(serial);
        }

        Ok(())
    }

    /// Retires the active decoder once its stream has ended and every
    /// pending packet has been consumed.
    fn retire_finished(&mut self) {
        debug_assert!(self.pending.is_empty());

        let mut tracks = self.tracks.lock().unwrap();
        while let Some(serial) = tracks.ended.pop_front() {
            if Some(serial) == self.active_serial {
                debug!("Stream {serial:#010X} ended, retiring decoder");
                self.decoder = None;
                self.active_serial = None;
            }
        }
    }
}

impl BlockSource for DecodeSource {
    fn read_block(&mut self) -> Result<BlockRead> {
        loop {
            while let Some(block) = self.pending.pop_front() {
                self.ensure_decoder()?;

                let Some(decoder) = self.decoder.as_mut() else {
                    warn!("Dropping packet with no decoder available");
                    continue;
                };

                if block.payload.after_hole {
                    decoder.reset();
                }

                if let Some(pcm) = decoder.decode(&block.payload)? {
                    return Ok(BlockRead::Block(block.map(|_| pcm)));
                }
            }

            self.retire_finished();

            if self.input_done {
                return Ok(BlockRead::EndOfStream);
            }

            match self.input.read_chunk(self.demux.want_bytes())? {
                Some(bytes) => {
                    self.demux.feed(&bytes);
                    self.pending.extend(self.demux.step()?);
                }
                None => self.input_done = true,
            }
        }
    }

    fn close(&mut self) {
        self.input.close();
        self.decoder = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::page::{GranulePosition, Page, PageFlags, test_page};

    const SERIAL: u32 = 0x77;

    fn sniff(page: &Page) -> Option<StreamKind> {
        page.body.starts_with(b"HDR").then_some(StreamKind("bytes"))
    }

    /// Byte source delivering a fixed byte string in small chunks.
    struct ChunkedBytes {
        bytes: Vec<u8>,
        pos: usize,
    }

    impl ByteSource for ChunkedBytes {
        fn read_chunk(&mut self, _want: usize) -> Result<Option<Vec<u8>>> {
            if self.pos >= self.bytes.len() {
                return Ok(None);
            }

            let end = (self.pos + 17).min(self.bytes.len());
            let chunk = self.bytes[self.pos..end].to_vec();
            self.pos = end;
            Ok(Some(chunk))
        }

        fn close(&mut self) {}
    }

    /// Stub codec: one mono frame per packet byte, header packets silent.
    struct ByteDecoder {
        resets: Arc<Mutex<usize>>,
    }

    impl PacketDecoder for ByteDecoder {
        fn decode(&mut self, packet: &Packet) -> Result<Option<PcmBlock>> {
            if packet.body.starts_with(b"HDR") {
                return Ok(None);
            }

            let samples = packet.body.iter().map(|&b| b as f32).collect();
            Ok(Some(PcmBlock::new(1, 48_000, samples)))
        }

        fn reset(&mut self) {
            *self.resets.lock().unwrap() += 1;
        }
    }

    struct StubFactory(Arc<Mutex<usize>>);

    impl DecoderFactory for StubFactory {
        fn open(&mut self, _kind: StreamKind) -> Result<Box<dyn PacketDecoder>> {
            Ok(Box::new(ByteDecoder {
                resets: self.0.clone(),
            }))
        }
    }

    fn container(sequences: &[(u32, u8, &[u8])]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for &(sequence, flags, body) in sequences {
            let page = test_page(SERIAL, sequence, flags, GranulePosition::INVALID, &[body]);
            bytes.extend_from_slice(&page.to_bytes().unwrap());
        }
        bytes
    }

    #[test]
    fn bytes_in_pcm_out() -> anyhow::Result<()> {
        let bytes = container(&[
            (0, PageFlags::BEGIN_OF_STREAM, b"HDRxx"),
            (1, 0, &[1, 2, 3]),
            (2, PageFlags::END_OF_STREAM, &[4, 5]),
        ]);

        let resets = Arc::new(Mutex::new(0));
        let mut source = DecodeSource::new(
            Box::new(ChunkedBytes { bytes, pos: 0 }),
            ProbeSet::new(vec![sniff]),
            Box::new(StubFactory(resets.clone())),
        );

        let mut samples = Vec::new();
        loop {
            match source.read_block()? {
                BlockRead::Block(block) => samples.extend(block.payload.samples),
                BlockRead::EndOfStream => break,
            }
        }

        assert_eq!(samples, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(*resets.lock().unwrap(), 0);
        Ok(())
    }

    #[test]
    fn hole_resets_the_decoder() -> anyhow::Result<()> {
        let bytes = container(&[
            (0, PageFlags::BEGIN_OF_STREAM, b"HDRxx"),
            (1, 0, &[1, 2]),
            // Sequence 2 lost.
            (3, PageFlags::END_OF_STREAM, &[7, 8]),
        ]);

        let resets = Arc::new(Mutex::new(0));
        let mut source = DecodeSource::new(
            Box::new(ChunkedBytes { bytes, pos: 0 }),
            ProbeSet::new(vec![sniff]),
            Box::new(StubFactory(resets.clone())),
        );

        let mut samples = Vec::new();
        while let BlockRead::Block(block) = source.read_block()? {
            samples.extend(block.payload.samples);
        }

        assert_eq!(samples, vec![1.0, 2.0, 7.0, 8.0]);
        assert_eq!(*resets.lock().unwrap(), 1);
        Ok(())
    }
}
