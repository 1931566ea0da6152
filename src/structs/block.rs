//! Payload blocks and the source seams of the pipeline.
//!
//! [`DataBlock`] is the generic payload-carrying unit flowing through every
//! stage: container packets out of the demultiplexer, decoded PCM through
//! the skip filter and buffers. Each block carries two opaque metadata tags
//! that every stage forwards unchanged unless explicitly updated, so a
//! consumer arbitrarily far downstream can recover what is currently
//! audible.

use std::time::Duration;

use anyhow::Result;

/// Opaque correlation key identifying which logical service, track or item
/// a payload belongs to. Not a byte offset; equality is the only meaningful
/// operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SyncToken(pub u64);

/// Timing and position metadata travelling with a block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PlayoutInfo {
    /// Time until the current item ends and the next one begins, when known.
    pub time_to_next: Option<Duration>,
}

/// The generic payload-carrying unit of the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct DataBlock<T> {
    pub payload: T,
    pub sync: SyncToken,
    pub playout: PlayoutInfo,
}

impl<T> DataBlock<T> {
    pub fn new(payload: T, sync: SyncToken, playout: PlayoutInfo) -> Self {
        Self {
            payload,
            sync,
            playout,
        }
    }

    /// Transforms the payload while forwarding both metadata tags, the way
    /// every pipeline stage is required to.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> DataBlock<U> {
        DataBlock {
            payload: f(self.payload),
            sync: self.sync,
            playout: self.playout,
        }
    }
}

/// A block of interleaved PCM samples.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBlock {
    /// Interleaved samples, `channels` per frame.
    pub samples: Vec<f32>,
    pub channels: u16,
    pub sample_rate: u32,
}

impl PcmBlock {
    pub fn new(channels: u16, sample_rate: u32, samples: Vec<f32>) -> Self {
        debug_assert!(channels > 0);
        debug_assert_eq!(samples.len() % channels as usize, 0);

        Self {
            samples,
            channels,
            sample_rate,
        }
    }

    /// Number of sample frames (one sample per channel each).
    pub fn frames(&self) -> u64 {
        (self.samples.len() / self.channels.max(1) as usize) as u64
    }

    /// Playing time of this block.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }

        Duration::from_secs_f64(self.frames() as f64 / self.sample_rate as f64)
    }

    /// Removes up to `frames` frames from the front of the block, returning
    /// the number actually removed.
    pub fn trim_front(&mut self, frames: u64) -> u64 {
        let trim = frames.min(self.frames());
        self.samples.drain(..(trim as usize * self.channels as usize));
        trim
    }

    /// Removes up to `frames` frames from the end of the block, returning
    /// the number actually removed.
    pub fn trim_back(&mut self, frames: u64) -> u64 {
        let trim = frames.min(self.frames());
        self.samples
            .truncate(self.samples.len() - trim as usize * self.channels as usize);
        trim
    }
}

/// Outcome of a block read: either a block or ordinary end of stream.
///
/// Faults travel separately as `Err`, so end of stream never has to be
/// signalled through the error path.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockRead {
    Block(DataBlock<PcmBlock>),
    EndOfStream,
}

/// A pull source of PCM blocks: the seam between pipeline stages.
///
/// The decoder glue, the skip filter and the ring buffer backend all stand
/// behind this trait.
pub trait BlockSource: Send {
    /// Returns the next block, `Ok(BlockRead::EndOfStream)` once the source
    /// is exhausted, or an error for an unrecoverable fault.
    fn read_block(&mut self) -> Result<BlockRead>;

    /// Releases the underlying resources. Reads after close are undefined
    /// beyond "must not panic".
    fn close(&mut self);
}

/// A pull source of raw container bytes, typically backed by a network
/// transport.
pub trait ByteSource: Send {
    /// Reads roughly `want` more bytes. Returns `None` at end of input.
    fn read_chunk(&mut self, want: usize) -> Result<Option<Vec<u8>>>;

    fn close(&mut self);
}


#[test]
fn trim_respects_frame_boundaries() {
    let mut block = PcmBlock::new(2, 48_000, vec![0.0; 20]);
    assert_eq!(block.frames(), 10);

    assert_eq!(block.trim_front(3), 3);
    assert_eq!(block.frames(), 7);

    assert_eq!(block.trim_back(9), 7);
    assert_eq!(block.frames(), 0);
}

#[test]
fn map_forwards_tags() {
    let block = DataBlock::new(
        vec![1u8, 2, 3],
        SyncToken(42),
        PlayoutInfo {
            time_to_next: Some(Duration::from_secs(3)),
        },
    );

    let mapped = block.map(|b| b.len());
    assert_eq!(mapped.payload, 3);
    assert_eq!(mapped.sync, SyncToken(42));
    assert_eq!(mapped.playout.time_to_next, Some(Duration::from_secs(3)));
}
