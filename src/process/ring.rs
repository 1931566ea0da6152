//! Threaded producer/consumer PCM buffering.
//!
//! Each ring buffer owns one producer thread that pulls blocks from its
//! backend source and keeps the queue near a target fill level, measured
//! in seconds of audio. The consumer side is a blocking [`read`] with
//! periodic timeout wake-ups. Backend faults never unwind on the producer
//! thread; they are captured and re-raised to the consumer on its next
//! read, after which the buffer is permanently invalid.
//!
//! [`read`]: RingBuffer::read

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use log::{debug, error, trace};

use crate::structs::block::{BlockRead, BlockSource, DataBlock, PcmBlock};
use crate::structs::status::{BufferStatus, StatusListener};
use crate::utils::errors::BufferError;

/// Producer sleep while the buffer sits above its target fill.
pub const PRODUCER_POLL: Duration = Duration::from_millis(50);

/// Consumer wake-up interval while blocked on an empty queue, so a
/// terminal producer error is observed promptly.
pub const CONSUMER_POLL: Duration = Duration::from_millis(100);

/// Minimum spacing of non-notable status pushes.
pub const STATUS_INTERVAL: Duration = Duration::from_millis(500);

struct RingState {
    queue: VecDeque<DataBlock<PcmBlock>>,
    queued: Duration,
    eof: bool,
    closed: bool,
    invalid: bool,
    error: Option<anyhow::Error>,
    status: BufferStatus,
    over_target: bool,
    last_emit: Option<Instant>,
}

struct Shared {
    state: Mutex<RingState>,
    available: Condvar,
    stop: AtomicBool,
    listeners: Mutex<Vec<Box<dyn StatusListener>>>,
}

impl Shared {
    /// Builds a snapshot to push, honoring the rate limit unless the
    /// change is notable. Must be called with the state lock held; the
    /// returned snapshot is delivered after releasing it.
    fn maybe_snapshot(state: &mut RingState, notable: bool, now: Instant) -> Option<BufferStatus> {
        let due = match state.last_emit {
            None => true,
            Some(t) => now.duration_since(t) >= STATUS_INTERVAL,
        };

        if notable || due {
            state.last_emit = Some(now);
            Some(state.status.clone())
        } else {
            None
        }
    }

    fn deliver(&self, status: &BufferStatus) {
        for listener in self.listeners.lock().unwrap().iter_mut() {
            listener.buffer_status(status);
        }
    }
}

/// A producer/consumer buffer smoothing one decoder's PCM output.
pub struct RingBuffer {
    shared: Arc<Shared>,
    target: Duration,
    producer: Mutex<Option<thread::JoinHandle<()>>>,
}

impl RingBuffer {
    /// Starts buffering from `source`, aiming to keep `target` seconds of
    /// audio queued.
    pub fn new(target: Duration, source: Box<dyn BlockSource>) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(RingState {
                queue: VecDeque::new(),
                queued: Duration::ZERO,
                eof: false,
                closed: false,
                invalid: false,
                error: None,
                status: BufferStatus::new(Instant::now()),
                over_target: false,
                last_emit: None,
            }),
            available: Condvar::new(),
            stop: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
        });

        let producer_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("ring-producer".into())
            .spawn(move || produce(producer_shared, source, target))
            .expect("spawning the producer thread");

        Self {
            shared,
            target,
            producer: Mutex::new(Some(handle)),
        }
    }

    pub fn target(&self) -> Duration {
        self.target
    }

    /// Seconds of audio currently queued. Non-blocking.
    pub fn current_fill_level(&self) -> Duration {
        self.shared.state.lock().unwrap().queued
    }

    /// A fresh health snapshot. Non-blocking.
    pub fn status(&self) -> BufferStatus {
        self.shared.state.lock().unwrap().status.clone()
    }

    pub fn add_status_listener(&self, listener: Box<dyn StatusListener>) {
        self.shared.listeners.lock().unwrap().push(listener);
    }

    /// True while reads can still produce data: the queue holds blocks, or
    /// the producer is alive and fault-free.
    pub fn is_valid(&self) -> bool {
        let state = self.shared.state.lock().unwrap();

        !state.closed
            && !state.invalid
            && (!state.queue.is_empty() || (!state.eof && state.error.is_none()))
    }

    /// Pops the next block, blocking while the queue is empty.
    ///
    /// An empty queue records one underrun per wait episode. A captured
    /// producer error is returned once, then the buffer stays invalid.
    /// Closing the buffer unblocks the read as end of stream.
    pub fn read(&self) -> Result<BlockRead> {
        let mut noted_underrun = false;
        let mut state = self.shared.state.lock().unwrap();

        loop {
            if let Some(block) = state.queue.pop_front() {
                state.queued = state.queued.saturating_sub(block.payload.duration());

                let now = Instant::now();
                let fill = state.queued;
                let notable = state.status.note_fill(fill, now);
                let snapshot = Shared::maybe_snapshot(&mut state, notable, now);
                drop(state);

                if let Some(status) = snapshot {
                    self.shared.deliver(&status);
                }

                return Ok(BlockRead::Block(block));
            }

            if let Some(err) = state.error.take() {
                state.invalid = true;
                return Err(err);
            }

            if state.invalid {
                return Err(BufferError::Invalid.into());
            }

            if state.eof || state.closed || self.shared.stop.load(Ordering::Relaxed) {
                return Ok(BlockRead::EndOfStream);
            }

            if !noted_underrun {
                noted_underrun = true;

                let now = Instant::now();
                state.status.note_underrun(now);
                let snapshot = Shared::maybe_snapshot(&mut state, true, now);
                drop(state);

                if let Some(status) = snapshot {
                    self.shared.deliver(&status);
                }

                state = self.shared.state.lock().unwrap();
                continue;
            }

            let (guard, _) = self
                .shared
                .available
                .wait_timeout(state, CONSUMER_POLL)
                .unwrap();
            state = guard;
        }
    }

    /// Stops the producer, releases the backend, and unblocks any waiting
    /// consumer with end of stream. Joins after the in-flight backend read
    /// returns.
    pub fn close(&self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        self.shared.state.lock().unwrap().closed = true;
        self.shared.available.notify_all();

        if let Some(handle) = self.producer.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        // Signal only: joining here could block on an in-flight backend
        // read. Callers that need the backend released promptly use close().
        self.shared.stop.store(true, Ordering::Relaxed);
        self.shared.available.notify_all();
    }
}

fn produce(shared: Arc<Shared>, mut source: Box<dyn BlockSource>, target: Duration) {
    while !shared.stop.load(Ordering::Relaxed) {
        {
            let mut state = shared.state.lock().unwrap();

            if state.queued > target {
                let snapshot = if !state.over_target {
                    state.over_target = true;

                    let now = Instant::now();
                    let notable = state.status.note_overrun(now);
                    debug!("Buffer over target ({:?} queued), backing off", state.queued);
                    Shared::maybe_snapshot(&mut state, notable, now)
                } else {
                    None
                };
                drop(state);

                if let Some(status) = snapshot {
                    shared.deliver(&status);
                }

                thread::sleep(PRODUCER_POLL);
                continue;
            }

            state.over_target = false;
        }

        match source.read_block() {
            Ok(BlockRead::Block(block)) => {
                let now = Instant::now();
                let mut state = shared.state.lock().unwrap();

                state.queued += block.payload.duration();
                state.queue.push_back(block);

                let fill = state.queued;
                let notable = state.status.note_fill(fill, now);
                let snapshot = Shared::maybe_snapshot(&mut state, notable, now);
                drop(state);

                shared.available.notify_all();
                if let Some(status) = snapshot {
                    shared.deliver(&status);
                }
            }
            Ok(BlockRead::EndOfStream) => {
                trace!("Backend end of stream");
                shared.state.lock().unwrap().eof = true;
                shared.available.notify_all();
                break;
            }
            Err(err) => {
                error!("Backend failure captured for the consumer: {err}");
                shared.state.lock().unwrap().error = Some(err);
                shared.available.notify_all();
                break;
            }
        }
    }

    source.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::block::testing::{ScriptedSource, pcm};
    use anyhow::anyhow;

    /// One mono frame at 1 Hz: a one-second block with a single sample.
    fn second_block(value: f32) -> DataBlock<PcmBlock> {
        DataBlock::new(
            PcmBlock::new(1, 1, vec![value]),
            Default::default(),
            Default::default(),
        )
    }

    fn wait_for(mut probe: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !probe() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn overfilling_records_an_overrun() {
        let source = ScriptedSource::of_blocks(vec![
            second_block(1.0),
            second_block(2.0),
            second_block(3.0),
        ]);

        // Target below one block: the producer must back off after the
        // first enqueue.
        let ring = RingBuffer::new(Duration::from_millis(500), Box::new(source));

        wait_for(|| ring.status().overruns >= 1);

        // Draining lets the producer finish the script.
        let mut values = Vec::new();
        loop {
            match ring.read().unwrap() {
                BlockRead::Block(b) => values.push(b.payload.samples[0]),
                BlockRead::EndOfStream => break,
            }
        }
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
        ring.close();
    }

    #[test]
    fn draining_an_empty_buffer_records_an_underrun() {
        /// Backend that is slow to produce its single block.
        struct SlowSource {
            delivered: bool,
        }

        impl BlockSource for SlowSource {
            fn read_block(&mut self) -> Result<BlockRead> {
                if self.delivered {
                    return Ok(BlockRead::EndOfStream);
                }

                thread::sleep(Duration::from_millis(300));
                self.delivered = true;
                Ok(BlockRead::Block(pcm(4, 0.5)))
            }

            fn close(&mut self) {}
        }

        let ring = RingBuffer::new(
            Duration::from_secs(1),
            Box::new(SlowSource { delivered: false }),
        );

        // The consumer outruns the producer immediately.
        let BlockRead::Block(block) = ring.read().unwrap() else {
            panic!("expected the delayed block");
        };
        assert_eq!(block.payload.samples, vec![0.5; 4]);
        assert!(ring.status().underruns >= 1);
        assert!(ring.status().last_underrun.is_some());
        ring.close();
    }

    #[test]
    fn producer_error_surfaces_once_then_invalid() {
        let source = ScriptedSource::new(vec![
            Ok(BlockRead::Block(second_block(1.0))),
            Err(anyhow!("transport dropped")),
        ]);

        let ring = RingBuffer::new(Duration::from_secs(10), Box::new(source));

        // Buffered data is served before the fault.
        let BlockRead::Block(block) = ring.read().unwrap() else {
            panic!("expected the buffered block");
        };
        assert_eq!(block.payload.samples, vec![1.0]);

        let err = ring.read().unwrap_err();
        assert_eq!(err.to_string(), "transport dropped");

        // Permanently invalid afterwards.
        assert!(ring.read().is_err());
        assert!(!ring.is_valid());
        ring.close();
    }

    #[test]
    fn close_unblocks_the_consumer() {
        struct NeverSource;

        impl BlockSource for NeverSource {
            fn read_block(&mut self) -> Result<BlockRead> {
                thread::sleep(Duration::from_millis(50));
                Ok(BlockRead::EndOfStream)
            }

            fn close(&mut self) {}
        }

        let ring = Arc::new(RingBuffer::new(Duration::from_secs(1), Box::new(NeverSource)));

        let reader = {
            let ring = ring.clone();
            thread::spawn(move || ring.read().unwrap())
        };

        ring.close();
        assert_eq!(reader.join().unwrap(), BlockRead::EndOfStream);
        assert!(!ring.is_valid());
    }

    #[test]
    fn notable_events_reach_listeners_immediately() {
        struct Collector(Arc<Mutex<Vec<u64>>>);

        impl StatusListener for Collector {
            fn buffer_status(&mut self, status: &BufferStatus) {
                self.0.lock().unwrap().push(status.overruns);
            }
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let source = ScriptedSource::of_blocks(vec![second_block(1.0), second_block(2.0)]);

        let ring = RingBuffer::new(Duration::from_millis(100), Box::new(source));
        ring.add_status_listener(Box::new(Collector(seen.clone())));

        wait_for(|| seen.lock().unwrap().iter().any(|&o| o >= 1));
        ring.close();
    }
}
