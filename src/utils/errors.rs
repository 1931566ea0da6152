#[macro_export]
macro_rules! log_or_err {
    ($state:expr, $level:expr, $err:expr $(,)?) => {{
        if $level <= $state.fail_level {
            return Err($err.into());
        } else {
            match $level {
                ::log::Level::Error => ::log::error!("{}", $err),
                ::log::Level::Warn => ::log::warn!("{}", $err),
                ::log::Level::Info => ::log::info!("{}", $err),
                ::log::Level::Debug => ::log::debug!("{}", $err),
                ::log::Level::Trace => ::log::trace!("{}", $err),
            }
        }
    }};
}

#[derive(thiserror::Error, Debug)]
pub enum PageError {
    #[error("Page data too short: {available} bytes, {needed} needed")]
    Truncated { available: usize, needed: usize },

    #[error("Invalid page marker")]
    InvalidMarker,

    #[error("Unsupported page version {0}")]
    UnsupportedVersion(u8),

    #[error("Page body length {actual} does not match segment table total {expected}")]
    BodyLengthMismatch { expected: usize, actual: usize },

    #[error("Segment table longer than 255 entries: {0}")]
    SegmentTableTooLong(usize),
}

#[derive(thiserror::Error, Debug)]
pub enum StreamError {
    #[error("First page of stream {serial:#010X} does not carry BEGIN_OF_STREAM")]
    MissingBeginOfStream { serial: u32 },

    #[error("Duplicate BEGIN_OF_STREAM on stream {serial:#010X}")]
    DuplicateBeginOfStream { serial: u32 },

    #[error("Page added to stream {serial:#010X} after END_OF_STREAM")]
    PageAfterEndOfStream { serial: u32 },

    #[error("Page with serial {got:#010X} routed to stream {expected:#010X}")]
    SerialMismatch { expected: u32, got: u32 },
}

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("No decoder available for stream kind {0}")]
    UnknownStreamKind(String),

    #[error("Decoder failed on packet of {0} bytes")]
    PacketRejected(usize),
}

#[derive(thiserror::Error, Debug)]
pub enum BufferError {
    #[error("Buffer is invalid after a producer failure")]
    Invalid,

    #[error("Buffer is closed")]
    Closed,

    #[error("All multiplexer entries are exhausted")]
    Exhausted,
}
