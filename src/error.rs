//! How the library responds to invalid input, truncated files, and internal limits.

use std::convert::TryFrom;

pub type Result<T> = std::result::Result<T, Error>;
pub type PassiveResult = Result<()>;

/// An operation that produces no value on success.
pub type UnitResult = Result<()>;

pub use std::io::Error as IoError;
pub use std::io::Result as IoResult;


/// An error that occurred while reading or writing an exr file.
///
/// Errors during `open` (bad magic, unsupported version, malformed header,
/// invalid geometry) are fatal. Errors while decoding a single chunk
/// (`CorruptChunk`) leave the rest of the file usable.
#[derive(Debug)]
pub enum Error {

    /// The byte stream did not start with the four magic bytes of an exr file.
    NotSupported(String),

    /// The header, an attribute, or the requested operation violates a structural
    /// rule of the file format (duplicate channel, non-positive window, unknown enum, ...).
    Invalid(String),

    /// A read or seek went past the end of the available bytes.
    Io(IoError),
}

impl Error {

    /// A file or attribute violates a structural invariant of the format.
    pub fn invalid(message: impl Into<String>) -> Self {
        Error::Invalid(message.into())
    }

    /// The input is well-formed but uses a feature this implementation does not provide,
    /// for example deep pixel decoding or an unrecognized compression method.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Error::NotSupported(message.into())
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::NotSupported(message) => write!(formatter, "not supported: {}", message),
            Error::Invalid(message) => write!(formatter, "invalid: {}", message),
            Error::Io(io_error) => write!(formatter, "io error: {}", io_error),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(io_error) => Some(io_error),
            _ => None,
        }
    }
}

/// Enable using the `?` operator on `io::Result`.
/// An unexpected end of file is reported as `Io`, matching how the byte source surfaces truncation.
impl From<IoError> for Error {
    fn from(error: IoError) -> Self {
        Error::Io(error)
    }
}


/// Convert a file-derived `i32` into a `usize`, rejecting negative values.
/// Many header fields (counts, sizes) are stored as signed integers on disk
/// but are only ever meaningful as non-negative counts.
pub fn i32_to_usize(value: i32, error_message: &'static str) -> Result<usize> {
    usize::try_from(value).map_err(|_| Error::invalid(error_message))
}

/// Convert a in-memory `usize` into the `i32` used on the wire.
/// Panics if the value does not round-trip: larger than any real exr dimension,
/// but possible after a bug or a maliciously crafted geometry.
pub fn usize_to_i32(value: usize) -> i32 {
    i32::try_from(value).expect("number too large for the exr file format")
}

/// Convert a `usize` into the `u16` used by some wire formats (for example B44 sample counts).
pub fn usize_to_u16(value: usize) -> Result<u16> {
    u16::try_from(value).map_err(|_| Error::invalid("number too large for the exr file format"))
}

/// Convert a `usize` byte position into the `u64` used for file offsets on disk.
/// Panics on platforms where a `usize` does not fit into 64 bits, which cannot happen today.
pub fn usize_to_u64(value: usize) -> u64 {
    value as u64
}

/// Convert a file-derived `u64` offset into a `usize` byte count.
/// Panics if the offset could not possibly be addressed in memory on this platform.
pub fn u64_to_usize(value: u64) -> usize {
    usize::try_from(value).expect("offset or size too large for this platform")
}
