#![doc = include_str!("../README.md")]
//!
//! ## Technical Overview
//!
//! The container is a paged format: each page starts with a fixed marker,
//! carries stream serial, sequence number and granule position, and is
//! protected by a CRC-32 over the whole page. Packets are laced across
//! pages through a segment table, so a packet may span any number of
//! pages. See [`structs::page`] for the exact layout.
//!
//! ### Resilience model
//!
//! - Corrupt bytes never abort processing: the scanner discards up to the
//!   next plausible marker and counts what it skipped.
//! - A lost page surfaces as `after_hole` on the next completed packet of
//!   that stream, giving the codec a chance to reset.
//! - Backend faults inside a buffer are re-raised on the consumer side,
//!   and the multiplexer hands over to the next buffer when one dies.
//!
//! ## Quick Start
//!
//! Demultiplex container bytes into packets:
//!
//! ```rust
//! use audiopipe::process::demux::{Demultiplexer, ProbeSet, StreamKind};
//! use audiopipe::structs::page::Page;
//!
//! fn sniff(page: &Page) -> Option<StreamKind> {
//!     page.body.starts_with(b"OpusHead").then_some(StreamKind("opus"))
//! }
//!
//! let mut demux = Demultiplexer::new(ProbeSet::new(vec![sniff]), Box::new(()));
//!
//! // Feed transport chunks and collect completed packets.
//! demux.feed(&[0u8; 16]);
//! for block in demux.step()? {
//!     println!("packet of {} bytes", block.payload.len());
//! }
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! A full playback chain wraps a [`process::decode::DecodeSource`] in a
//! [`process::skip::SkipFilter`], buffers it with a
//! [`process::ring::RingBuffer`], and reads through a
//! [`process::mux::BufferMultiplexer`].

pub mod process;
pub mod structs;
pub mod utils;
