//! Frame-accurate pre-/post-skip trimming.
//!
//! Codecs warm up: the first `pre_skip` frames of a decoded stream and the
//! last `post_skip` frames are padding that must never reach the consumer.
//! The true end of stream is only known on EOF, so the filter lags its
//! output by `post_skip` frames' worth of blocks and trims the exact tail
//! once the backend reports end of stream.

use std::collections::VecDeque;

use anyhow::Result;

use crate::structs::block::{BlockRead, BlockSource, DataBlock, PcmBlock};

/// Content-inspection hook for discovering the pre-skip at runtime.
///
/// `examine` sees every block read from the backend while the leading trim
/// is still in progress and may propose a larger pre-skip (for example by
/// counting leading near-silent frames). Proposals below the current value
/// are ignored: the pre-skip only ever grows, and only until the leading
/// trim has completed.
pub trait SkipPolicy: Send {
    fn examine(&mut self, block: &PcmBlock) -> Option<u64>;
}

/// The do-nothing policy: pre-skip stays as constructed.
impl SkipPolicy for () {
    fn examine(&mut self, _block: &PcmBlock) -> Option<u64> {
        None
    }
}

/// Trims codec warm-up and padding frames off a PCM block stream.
pub struct SkipFilter {
    source: Box<dyn BlockSource>,
    policy: Box<dyn SkipPolicy>,

    pre_skip: u64,
    post_skip: u64,
    pre_skip_done: bool,

    /// Total frames read from the backend.
    frames_in: u64,
    /// Total frames discarded, front and tail together.
    skipped: u64,

    /// Blocks held back until they are clear of the tail window.
    queue: VecDeque<DataBlock<PcmBlock>>,
    queued_frames: u64,
    eof: bool,
}

impl SkipFilter {
    pub fn new(source: Box<dyn BlockSource>, pre_skip: u64, post_skip: u64) -> Self {
        Self::with_policy(source, pre_skip, post_skip, Box::new(()))
    }

    pub fn with_policy(
        source: Box<dyn BlockSource>,
        pre_skip: u64,
        post_skip: u64,
        policy: Box<dyn SkipPolicy>,
    ) -> Self {
        Self {
            source,
            policy,
            pre_skip,
            post_skip,
            pre_skip_done: false,
            frames_in: 0,
            skipped: 0,
            queue: VecDeque::new(),
            queued_frames: 0,
            eof: false,
        }
    }

    /// Cumulative frames discarded so far, for timestamp reconciliation.
    pub fn skipped_frames(&self) -> u64 {
        self.skipped
    }

    pub fn pre_skip(&self) -> u64 {
        self.pre_skip
    }

    pub fn post_skip(&self) -> u64 {
        self.post_skip
    }

    fn pop_queued(&mut self) -> Option<DataBlock<PcmBlock>> {
        let block = self.queue.pop_front()?;
        self.queued_frames -= block.payload.frames();
        Some(block)
    }

    /// Applies the leading trim to a freshly read block. Returns `None`
    /// when the block disappears entirely into the skip window.
    fn apply_pre_skip(&mut self, mut block: DataBlock<PcmBlock>) -> Option<DataBlock<PcmBlock>> {
        if self.pre_skip_done {
            self.frames_in += block.payload.frames();
            return Some(block);
        }

        if let Some(proposed) = self.policy.examine(&block.payload) {
            if proposed > self.pre_skip {
                self.pre_skip = proposed;
            }
        }

        let start = self.frames_in;
        let frames = block.payload.frames();
        self.frames_in += frames;

        if self.frames_in <= self.pre_skip {
            self.skipped += frames;
            return None;
        }

        if start < self.pre_skip {
            let trimmed = block.payload.trim_front(self.pre_skip - start);
            self.skipped += trimmed;
        }

        self.pre_skip_done = true;
        Some(block)
    }

    /// Trims exactly the tail `post_skip` frames off the queued block(s).
    /// Blocks emptied by the trim are dropped.
    fn trim_tail(&mut self) {
        let mut need = self.post_skip;

        while need > 0 {
            let Some(mut block) = self.queue.pop_back() else {
                break;
            };
            self.queued_frames -= block.payload.frames();

            let trimmed = block.payload.trim_back(need);
            need -= trimmed;
            self.skipped += trimmed;

            if block.payload.frames() > 0 {
                self.queued_frames += block.payload.frames();
                self.queue.push_back(block);
            }
        }
    }
}

impl BlockSource for SkipFilter {
    fn read_block(&mut self) -> Result<BlockRead> {
        loop {
            // The oldest queued block may be released once post_skip frames
            // are queued behind it: it can no longer be part of the tail.
            if let Some(front) = self.queue.front() {
                if self.queued_frames - front.payload.frames() >= self.post_skip {
                    let block = self.pop_queued().unwrap();
                    return Ok(BlockRead::Block(block));
                }
            }

            if self.eof {
                return Ok(match self.pop_queued() {
                    Some(block) => BlockRead::Block(block),
                    None => BlockRead::EndOfStream,
                });
            }

            match self.source.read_block()? {
                BlockRead::Block(block) => {
                    if let Some(block) = self.apply_pre_skip(block) {
                        self.queued_frames += block.payload.frames();
                        self.queue.push_back(block);
                    }
                }
                BlockRead::EndOfStream => {
                    self.eof = true;
                    self.trim_tail();
                }
            }
        }
    }

    fn close(&mut self) {
        self.source.close();
    }
}
