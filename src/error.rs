use std::convert::Infallible;
use std::error::Error as StdError;
use std::fmt::Display;
use std::result::Result as StdResult;
use thiserror::Error;

/// Possible errors that can occur while working with E57 files.
///
/// Every variant carries a human readable reason.
/// Variants wrapping I/O operations also keep the underlying error as source.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A physical page failed its checksum verification.
    #[error("Checksum mismatch: {reason}")]
    BadChecksum { reason: String },

    /// The header of a compressed vector binary section is invalid.
    #[error("Invalid compressed vector section header: {reason}")]
    BadCVHeader { reason: String },

    /// A packet inside a compressed vector binary section is invalid.
    #[error("Invalid compressed vector packet: {reason}")]
    BadCVPacket { reason: String },

    /// A value is outside the declared minimum and maximum of its field.
    #[error("Value out of bounds: {reason}")]
    ValueOutOfBounds { reason: String },

    /// A value cannot be represented by the destination type.
    #[error("Value not representable: {reason}")]
    ValueNotRepresentable { reason: String },

    /// A scaled value cannot be mapped to a raw integer value.
    #[error("Scaled value not representable: {reason}")]
    ScaledValueNotRepresentable { reason: String },

    /// A double value is too large for a single precision field.
    #[error("Double value too large for single precision: {reason}")]
    Real64TooLarge { reason: String },

    /// Buffer and field types differ and no conversion was requested.
    #[error("Conversion required: {reason}")]
    ConversionRequired { reason: String },

    /// A string buffer was bound to a numeric field.
    #[error("Expected numeric buffer: {reason}")]
    ExpectingNumeric { reason: String },

    /// Buffers of one transfer do not have the same capacity.
    #[error("Buffer size mismatch: {reason}")]
    BufferSizeMismatch { reason: String },

    /// Two buffers of one transfer are bound to the same path.
    #[error("Duplicate buffer path: {reason}")]
    BufferDuplicatePathName { reason: String },

    /// A prototype field has no buffer bound to it.
    #[error("No buffer for element: {reason}")]
    NoBufferForElement { reason: String },

    /// A path does not name a node.
    #[error("Path undefined: {reason}")]
    PathUndefined { reason: String },

    /// The prototype of a compressed vector is not usable.
    #[error("Invalid prototype: {reason}")]
    BadPrototype { reason: String },

    /// The codecs of a compressed vector are not usable.
    #[error("Invalid codecs: {reason}")]
    BadCodecs { reason: String },

    /// An argument passed to a function is invalid.
    #[error("Invalid argument: {reason}")]
    BadAPIArgument { reason: String },

    /// An element name or path is malformed.
    #[error("Invalid path name: {reason}")]
    BadPathName { reason: String },

    /// A value or child that can only be set once was set again.
    #[error("Already set: {reason}")]
    SetTwice { reason: String },

    /// A node that already has a parent was attached again.
    #[error("Node already has a parent: {reason}")]
    AlreadyHasParent { reason: String },

    /// A homogeneous vector received a child of a different type.
    #[error("Homogeneous vector violation: {reason}")]
    HomogeneousViolation { reason: String },

    /// Seeking in the underlying storage failed.
    #[error("Seek failed: {reason}")]
    SeekFailed {
        reason: String,
        #[source]
        source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    },

    /// Reading from the underlying storage failed.
    #[error("Read failed: {reason}")]
    ReadFailed {
        reason: String,
        #[source]
        source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    },

    /// Writing to the underlying storage failed.
    #[error("Write failed: {reason}")]
    WriteFailed {
        reason: String,
        #[source]
        source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    },

    /// Opening or creating a file failed.
    #[error("Open failed: {reason}")]
    OpenFailed {
        reason: String,
        #[source]
        source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    },

    /// The container was closed or is unusable after a fatal error.
    #[error("Image file not open: {reason}")]
    ImageFileNotOpen { reason: String },

    /// A modification was requested on a read-only container.
    #[error("Image file is read-only: {reason}")]
    FileReadOnly { reason: String },

    /// The compressed vector writer is closed or failed.
    #[error("Writer not open: {reason}")]
    WriterNotOpen { reason: String },

    /// The compressed vector reader is closed or failed.
    #[error("Reader not open: {reason}")]
    ReaderNotOpen { reason: String },

    /// Another writer is already open on the container.
    #[error("Too many writers: {reason}")]
    TooManyWriters { reason: String },

    /// Readers are open on the container.
    #[error("Too many readers: {reason}")]
    TooManyReaders { reason: String },

    /// The file does not start with the E57 signature.
    #[error("Bad file signature: {reason}")]
    BadFileSignature { reason: String },

    /// The file uses an unsupported format version.
    #[error("Unknown file version: {reason}")]
    UnknownFileVersion { reason: String },

    /// The file length does not match its header.
    #[error("Bad file length: {reason}")]
    BadFileLength { reason: String },

    /// The XML section cannot be parsed or describes an invalid tree.
    #[error("Invalid XML: {reason}")]
    BadXml {
        reason: String,
        #[source]
        source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    },

    /// The requested feature is not implemented.
    #[error("Not implemented: {reason}")]
    NotImplemented { reason: String },

    /// An unexpected internal issue occured.
    /// Most likely this is a logic error inside the library.
    #[error("Internal error: {reason}")]
    Internal { reason: String },
}

impl Error {
    /// Returns true for errors that leave the whole container in an undefined state.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::BadChecksum { .. }
                | Error::SeekFailed { .. }
                | Error::ReadFailed { .. }
                | Error::WriteFailed { .. }
                | Error::Internal { .. }
        )
    }

    pub(crate) fn internal<T>(reason: impl Into<String>) -> Result<T> {
        Err(Error::Internal {
            reason: reason.into(),
        })
    }

    pub(crate) fn bad_api<T>(reason: impl Into<String>) -> Result<T> {
        Err(Error::BadAPIArgument {
            reason: reason.into(),
        })
    }

    pub(crate) fn bad_packet<T>(reason: impl Into<String>) -> Result<T> {
        Err(Error::BadCVPacket {
            reason: reason.into(),
        })
    }

    pub(crate) fn not_implemented<T>(reason: impl Into<String>) -> Result<T> {
        Err(Error::NotImplemented {
            reason: reason.into(),
        })
    }
}

pub type Result<T> = StdResult<T, Error>;

/// Helper trait to map foreign errors and missing options into library errors.
pub(crate) trait Converter<T, E> {
    fn read_err<C: Display>(self, context: C) -> Result<T>;
    fn write_err<C: Display>(self, context: C) -> Result<T>;
    fn seek_err<C: Display>(self, context: C) -> Result<T>;
    fn xml_err<C: Display>(self, context: C) -> Result<T>;
    fn internal_err<C: Display>(self, context: C) -> Result<T>;
}

impl<T, E> Converter<T, E> for StdResult<T, E>
where
    E: StdError + Send + Sync + 'static,
{
    fn read_err<C: Display>(self, context: C) -> Result<T> {
        self.map_err(|e| Error::ReadFailed {
            reason: context.to_string(),
            source: Some(Box::new(e)),
        })
    }

    fn write_err<C: Display>(self, context: C) -> Result<T> {
        self.map_err(|e| Error::WriteFailed {
            reason: context.to_string(),
            source: Some(Box::new(e)),
        })
    }

    fn seek_err<C: Display>(self, context: C) -> Result<T> {
        self.map_err(|e| Error::SeekFailed {
            reason: context.to_string(),
            source: Some(Box::new(e)),
        })
    }

    fn xml_err<C: Display>(self, context: C) -> Result<T> {
        self.map_err(|e| Error::BadXml {
            reason: context.to_string(),
            source: Some(Box::new(e)),
        })
    }

    fn internal_err<C: Display>(self, context: C) -> Result<T> {
        self.map_err(|e| Error::Internal {
            reason: format!("{context}: {e}"),
        })
    }
}

impl<T> Converter<T, Infallible> for Option<T> {
    fn read_err<C: Display>(self, context: C) -> Result<T> {
        self.ok_or_else(|| Error::ReadFailed {
            reason: context.to_string(),
            source: None,
        })
    }

    fn write_err<C: Display>(self, context: C) -> Result<T> {
        self.ok_or_else(|| Error::WriteFailed {
            reason: context.to_string(),
            source: None,
        })
    }

    fn seek_err<C: Display>(self, context: C) -> Result<T> {
        self.ok_or_else(|| Error::SeekFailed {
            reason: context.to_string(),
            source: None,
        })
    }

    fn xml_err<C: Display>(self, context: C) -> Result<T> {
        self.ok_or_else(|| Error::BadXml {
            reason: context.to_string(),
            source: None,
        })
    }

    fn internal_err<C: Display>(self, context: C) -> Result<T> {
        self.ok_or_else(|| Error::Internal {
            reason: context.to_string(),
        })
    }
}
