//! Pipeline stages from container bytes to buffered PCM.

/// Page synchronization over a raw byte stream.
///
/// Provides the [`PageScanner`](sync::PageScanner) for locating, validating
/// and re-locating page boundaries in arbitrary byte input.
pub mod sync;

/// Per-stream packet reassembly.
///
/// Provides the [`StreamReassembler`](stream::StreamReassembler) for turning
/// one stream's page sequence back into ordered
/// [`Packet`](crate::structs::packet::Packet)s.
pub mod stream;

/// Container demultiplexing and stream selection.
///
/// Provides the [`Demultiplexer`](demux::Demultiplexer) together with the
/// [`ProbeSet`](demux::ProbeSet) sniffing mechanism.
pub mod demux;

/// Codec seam and packet-to-PCM glue.
///
/// Provides [`DecodeSource`](decode::DecodeSource), a
/// [`BlockSource`](crate::structs::block::BlockSource) chaining transport,
/// demultiplexer and an external [`PacketDecoder`](decode::PacketDecoder).
pub mod decode;

/// Frame-accurate pre-/post-skip trimming.
///
/// Provides the [`SkipFilter`](skip::SkipFilter) for removing codec warm-up
/// and end padding from a decoded block stream.
pub mod skip;

/// Threaded producer/consumer PCM buffering.
///
/// Provides the [`RingBuffer`](ring::RingBuffer) with target-fill
/// regulation and [`BufferStatus`](crate::structs::status::BufferStatus)
/// reporting.
pub mod ring;

/// Seamless handover between playback buffers.
///
/// Provides the [`BufferMultiplexer`](mux::BufferMultiplexer) for gapless
/// transitions across prefetched buffers.
pub mod mux;
