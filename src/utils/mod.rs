//! Utility functions and supporting infrastructure.
//!
//! Provides CRC validation and error handling support for the
//! demultiplexing and buffering pipeline.

pub mod crc;
pub mod errors;
