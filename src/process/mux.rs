//! Seamless handover between playback buffers.
//!
//! A gapless transition (station switch, next track prefetch) is built by
//! filling a second [`RingBuffer`] alongside the live one and letting the
//! multiplexer swap to it the moment the live buffer runs out. The consumer
//! keeps calling one [`read`] and never observes the seam, apart from the
//! sync token changing on the first block of the new buffer.
//!
//! [`read`]: BufferMultiplexer::read

use std::sync::{Arc, Mutex, Weak};

use anyhow::Result;
use log::{debug, trace};

use crate::process::ring::RingBuffer;
use crate::structs::block::BlockRead;
use crate::structs::status::{BufferStatus, StatusListener};

struct Entry {
    id: u64,
    buffer: Arc<RingBuffer>,
}

#[derive(Default)]
struct EntryList {
    entries: Vec<Entry>,
    selected: Option<u64>,
    next_id: u64,
}

impl EntryList {
    /// Returns the selected buffer, promoting the first valid entry when
    /// nothing is selected. Invalid entries skipped during promotion are
    /// removed and handed back for closing outside the lock.
    fn select(&mut self) -> (Option<(u64, Arc<RingBuffer>)>, Vec<Arc<RingBuffer>>) {
        let mut discarded = Vec::new();

        if let Some(id) = self.selected {
            if let Some(entry) = self.entries.iter().find(|e| e.id == id) {
                return (Some((entry.id, entry.buffer.clone())), discarded);
            }
            self.selected = None;
        }

        while !self.entries.is_empty() {
            if self.entries[0].buffer.is_valid() {
                let entry = &self.entries[0];
                self.selected = Some(entry.id);
                return (Some((entry.id, entry.buffer.clone())), discarded);
            }

            discarded.push(self.entries.remove(0).buffer);
        }

        (None, discarded)
    }

    fn remove(&mut self, id: u64) -> Option<Arc<RingBuffer>> {
        if self.selected == Some(id) {
            self.selected = None;
        }

        let index = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(index).buffer)
    }
}

struct MuxInner {
    entries: Mutex<EntryList>,
    listeners: Mutex<Vec<Box<dyn StatusListener>>>,
}

/// Forwards one entry's status stream to the multiplexer's listeners, but
/// only while that entry is the selected one. Events from buffers still
/// prefetching, or already abandoned, stay silent.
struct EntryStatusForwarder {
    inner: Weak<MuxInner>,
    id: u64,
}

impl StatusListener for EntryStatusForwarder {
    fn buffer_status(&mut self, status: &BufferStatus) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };

        if inner.entries.lock().unwrap().selected != Some(self.id) {
            return;
        }

        for listener in inner.listeners.lock().unwrap().iter_mut() {
            listener.buffer_status(status);
        }
    }
}

/// Multiplexes a set of ring buffers behind a single block-read interface.
///
/// Buffers are consumed in the order they were added. When the selected
/// buffer fails or reports end of stream, it is closed and dropped, the
/// next valid buffer is promoted, and the read is retried once; already
/// buffered blocks are never lost in the handover. With no buffers left
/// the multiplexer reports end of stream rather than an error, so a
/// consumer can idle through gaps in scheduling.
pub struct BufferMultiplexer {
    inner: Arc<MuxInner>,
}

impl Default for BufferMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferMultiplexer {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MuxInner {
                entries: Mutex::new(EntryList::default()),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Appends a buffer to the handover queue and returns its entry id.
    /// The first buffer added becomes the selected one.
    pub fn add_buffer(&self, buffer: Arc<RingBuffer>) -> u64 {
        let id = {
            let mut list = self.inner.entries.lock().unwrap();
            let id = list.next_id;
            list.next_id += 1;

            list.entries.push(Entry {
                id,
                buffer: buffer.clone(),
            });
            if list.selected.is_none() {
                list.selected = Some(id);
            }
            id
        };

        buffer.add_status_listener(Box::new(EntryStatusForwarder {
            inner: Arc::downgrade(&self.inner),
            id,
        }));

        debug!("Buffer entry {id} added");
        id
    }

    /// Removes a buffer before it is ever played, closing it. Removing the
    /// selected entry forces a handover on the next read.
    pub fn remove_buffer(&self, id: u64) {
        let removed = self.inner.entries.lock().unwrap().remove(id);

        if let Some(buffer) = removed {
            debug!("Buffer entry {id} removed");
            buffer.close();
        }
    }

    /// True while any queued buffer can still produce data.
    pub fn is_valid(&self) -> bool {
        self.inner
            .entries
            .lock()
            .unwrap()
            .entries
            .iter()
            .any(|e| e.buffer.is_valid())
    }

    /// Receives the selected buffer's status stream, across handovers.
    pub fn add_status_listener(&self, listener: Box<dyn StatusListener>) {
        self.inner.listeners.lock().unwrap().push(listener);
    }

    /// Reads the next block from the selected buffer, handing over to the
    /// next queued buffer when the selected one is spent.
    ///
    /// The handover retries the read exactly once; a second failure, or a
    /// failure with no successor available, is returned as-is.
    pub fn read(&self) -> Result<BlockRead> {
        let mut retried = false;

        loop {
            let (selected, discarded) = self.inner.entries.lock().unwrap().select();
            for buffer in discarded {
                buffer.close();
            }

            let Some((id, buffer)) = selected else {
                trace!("No buffers queued, reporting end of stream");
                return Ok(BlockRead::EndOfStream);
            };

            let result = buffer.read();
            if matches!(result, Ok(BlockRead::Block(_))) {
                return result;
            }

            // Spent or failed: close it, let the next entry take over.
            debug!("Buffer entry {id} exhausted, handing over");
            if let Some(buffer) = self.inner.entries.lock().unwrap().remove(id) {
                buffer.close();
            }

            if retried || !self.is_valid() {
                return result;
            }
            retried = true;
        }
    }

    /// Closes every queued buffer and empties the queue.
    pub fn close(&self) {
        let entries = {
            let mut list = self.inner.entries.lock().unwrap();
            list.selected = None;
            std::mem::take(&mut list.entries)
        };

        for entry in entries {
            entry.buffer.close();
        }
    }
}
