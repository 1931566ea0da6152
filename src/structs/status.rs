//! Buffer health snapshots and status delivery.

use std::time::{Duration, Instant};

/// Point-in-time plus cumulative buffer health snapshot.
///
/// Snapshots are immutable once handed out; the owning buffer builds a
/// fresh one on every state change. Fill levels are measured in seconds of
/// queued audio.
///
/// `min_fill_since_max` tracks the lowest fill level observed since the
/// all-time maximum, which captures oscillation after a peak.
#[derive(Debug, Clone)]
pub struct BufferStatus {
    pub underruns: u64,
    pub last_underrun: Option<Instant>,

    pub overruns: u64,
    pub last_overrun: Option<Instant>,

    pub max_fill: Duration,
    pub max_fill_at: Option<Instant>,

    pub min_fill_since_max: Duration,
    pub min_fill_at: Option<Instant>,

    pub current_fill: Duration,
    pub current_at: Instant,
}

impl BufferStatus {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            underruns: 0,
            last_underrun: None,
            overruns: 0,
            last_overrun: None,
            max_fill: Duration::ZERO,
            max_fill_at: None,
            min_fill_since_max: Duration::ZERO,
            min_fill_at: None,
            current_fill: Duration::ZERO,
            current_at: now,
        }
    }

    /// Records the current fill level. Returns true when the change is
    /// notable: a new all-time maximum or a new minimum since that maximum.
    pub(crate) fn note_fill(&mut self, fill: Duration, now: Instant) -> bool {
        self.current_fill = fill;
        self.current_at = now;

        if fill > self.max_fill {
            self.max_fill = fill;
            self.max_fill_at = Some(now);
            self.min_fill_since_max = fill;
            self.min_fill_at = Some(now);
            return true;
        }

        if self.max_fill_at.is_some() && fill < self.min_fill_since_max {
            self.min_fill_since_max = fill;
            self.min_fill_at = Some(now);
            return true;
        }

        false
    }

    /// Records an underrun. Always notable.
    pub(crate) fn note_underrun(&mut self, now: Instant) -> bool {
        self.underruns += 1;
        self.last_underrun = Some(now);
        true
    }

    /// Records an overrun. Always notable.
    pub(crate) fn note_overrun(&mut self, now: Instant) -> bool {
        self.overruns += 1;
        self.last_overrun = Some(now);
        true
    }
}

/// Receiver for buffer status snapshots.
///
/// Delivery is rate-limited by the owning buffer except for notable events
/// (new underrun, new overrun, new maximum, new minimum-after-maximum),
/// which are pushed immediately. Listeners are called outside the buffer's
/// internal locks, so a listener may call back into the buffer.
pub trait StatusListener: Send {
    fn buffer_status(&mut self, status: &BufferStatus);
}

#[test]
fn max_then_min_tracking() {
    let t0 = Instant::now();
    let mut status = BufferStatus::new(t0);

    assert!(status.note_fill(Duration::from_secs(2), t0));
    assert_eq!(status.max_fill, Duration::from_secs(2));

    // Dropping below the peak is notable every time a new minimum is seen.
    assert!(status.note_fill(Duration::from_secs(1), t0));
    assert_eq!(status.min_fill_since_max, Duration::from_secs(1));

    // Between min and max: not notable.
    assert!(!status.note_fill(Duration::from_millis(1500), t0));

    // New peak resets the minimum tracking.
    assert!(status.note_fill(Duration::from_secs(3), t0));
    assert_eq!(status.min_fill_since_max, Duration::from_secs(3));
}

#[test]
fn event_counters() {
    let t0 = Instant::now();
    let mut status = BufferStatus::new(t0);

    assert!(status.note_underrun(t0));
    assert!(status.note_overrun(t0));
    assert_eq!(status.underruns, 1);
    assert_eq!(status.overruns, 1);
    assert_eq!(status.last_underrun, Some(t0));
}
