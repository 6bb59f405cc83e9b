use core::fmt;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error returned by all fallible operations of this crate.
///
/// Use [`Error::kind`] to tell the failure classes apart.
pub struct Error {
    repr: Repr,
}

pub(crate) enum Repr {
    Malformed(String),
    LayoutOverflow,
    InsufficientBuffer { needed: usize, actual: usize },
    Codec(String),
    Lifecycle(String),
}

/// The class of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The input is not a JPEG stream this crate can parse up to its first scan.
    MalformedBitstream,
    /// The packed layout does not fit in the address space.
    LayoutOverflow,
    /// A caller-supplied output buffer is smaller than the planned layout.
    InsufficientBuffer,
    /// The decoder failed while reading coefficient data or tables.
    CodecExtraction,
    /// A decoder context was used in a state it does not support, or a background task died.
    HandleLifecycle,
}

impl Error {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Self {
            repr: Repr::Malformed(msg.into()),
        }
    }

    pub(crate) fn layout_overflow() -> Self {
        Self {
            repr: Repr::LayoutOverflow,
        }
    }

    pub(crate) fn insufficient_buffer(needed: usize, actual: usize) -> Self {
        Self {
            repr: Repr::InsufficientBuffer { needed, actual },
        }
    }

    pub(crate) fn codec(msg: impl Into<String>) -> Self {
        Self {
            repr: Repr::Codec(msg.into()),
        }
    }

    pub(crate) fn lifecycle(msg: impl Into<String>) -> Self {
        Self {
            repr: Repr::Lifecycle(msg.into()),
        }
    }

    /// Errors raised by the decoder while parsing the stream are reported as header or extraction
    /// failures depending on which phase the handle was in.
    pub(crate) fn into_codec(self) -> Self {
        match self.repr {
            Repr::Malformed(msg) => Self::codec(msg),
            repr => Self { repr },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            Repr::Malformed(_) => ErrorKind::MalformedBitstream,
            Repr::LayoutOverflow => ErrorKind::LayoutOverflow,
            Repr::InsufficientBuffer { .. } => ErrorKind::InsufficientBuffer,
            Repr::Codec(_) => ErrorKind::CodecExtraction,
            Repr::Lifecycle(_) => ErrorKind::HandleLifecycle,
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self.kind(), self)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            Repr::Malformed(s) => write!(f, "malformed JPEG: {s}"),
            Repr::LayoutOverflow => f.write_str("coefficient layout exceeds the addressable range"),
            Repr::InsufficientBuffer { needed, actual } => write!(
                f,
                "Insufficient output buffer: need {needed} bytes, got {actual}"
            ),
            Repr::Codec(s) => write!(f, "decoder error: {s}"),
            Repr::Lifecycle(s) => write!(f, "decoder lifecycle fault: {s}"),
        }
    }
}

impl std::error::Error for Error {}
