//! Data structures of the streaming pipeline.
//!
//! Contains the container framing structures (pages, packets), the generic
//! payload block with its cross-cutting metadata tags, and buffer health
//! snapshots.

pub mod block;
pub mod packet;
pub mod page;
pub mod status;
