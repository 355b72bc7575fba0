use core::fmt::{self, Display};

/// Errors reported by the flash driver.
///
/// `Busy` and `InUse` are submission-time refusals; `Timeout` and
/// `NotSupported` are delivered through the request's result field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashError {
    /// The driver is processing a request from a different owner.
    InUse,

    /// The driver is still processing this owner's previous request.
    Busy,

    /// An SPI transaction did not complete within the allowed time.
    Timeout,

    /// The JEDEC id is not in the supported-device table.
    NotSupported,
}

impl Display for FlashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashError::InUse => f.write_str("flash driver in use by another owner"),
            FlashError::Busy => f.write_str("flash driver busy with a previous request"),
            FlashError::Timeout => f.write_str("SPI transaction timed out"),
            FlashError::NotSupported => f.write_str("unsupported flash device"),
        }
    }
}

/// Errors reported by the stream receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    /// No stream slot is free.
    NotEnoughSpace,

    /// Fewer bytes are buffered than the read asked for.
    NotEnoughData,

    /// The stream is already running.
    Busy,

    /// The stream has been closed, cancelled, timed out or removed.
    Closed,
}

impl Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::NotEnoughSpace => f.write_str("not enough stream buffer space"),
            StreamError::NotEnoughData => f.write_str("not enough buffered stream data"),
            StreamError::Busy => f.write_str("stream already active"),
            StreamError::Closed => f.write_str("stream closed"),
        }
    }
}

/// Unrecoverable faults raised by the file index scanner.
///
/// These reach the fatal sink; the scanner halts once one is latched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexFault {
    /// The fixed file pool is full.
    FilePoolExhausted,

    /// The fixed segment pool is full.
    SegmentPoolExhausted,
}

impl Display for IndexFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexFault::FilePoolExhausted => f.write_str("file index: file pool exhausted"),
            IndexFault::SegmentPoolExhausted => f.write_str("file index: segment pool exhausted"),
        }
    }
}

/// The host link cannot accept a frame right now; retry on a later tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkFull;

impl Display for LinkFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("host link full")
    }
}
