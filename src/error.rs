use thiserror::Error;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, covering every failure this library can return.
///
/// Two of the variants carry the weight of the loader contract:
/// [`Error::Malformed`] for any structural defect in the image (bad
/// signatures, out-of-range offsets, missing required heaps) and
/// [`Error::Io`] for operating-system failures during file open or map.
/// The coarse classification that external callers see is derived through
/// [`OpenStatus`].
///
/// # Examples
///
/// ```rust,no_run
/// use cilimage::{Error, ImageRegistry};
/// use std::path::Path;
///
/// let registry = ImageRegistry::new();
/// match registry.open(Path::new("program.exe")) {
///     Ok(image) => println!("loaded {}", image.name()),
///     Err(Error::Io(io_err)) => eprintln!("I/O error: {}", io_err),
///     Err(Error::Malformed { message, file, line }) => {
///         eprintln!("invalid image: {} ({}:{})", message, file, line);
///     }
///     Err(e) => eprintln!("error: {}", e),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The image is damaged and could not be parsed.
    ///
    /// Any signature mismatch, out-of-range offset, or structural
    /// inconsistency detected while reading the container. The source
    /// location where the malformation was detected is included for
    /// debugging purposes.
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while parsing the image.
    ///
    /// Safety check preventing reads past the end of the raw data or of
    /// an individual heap or stream.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// This file is not a supported CLI image.
    ///
    /// The container is structurally sound PE data but not something this
    /// loader handles (for example a PE32+ image or a non-x86 machine).
    #[error("This file type is not supported")]
    NotSupported,

    /// Provided input was empty.
    #[error("Provided input was empty")]
    Empty,

    /// File I/O error.
    ///
    /// Wraps the underlying [`std::io::Error`] unchanged, so callers that
    /// need the OS error code can still reach it.
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// Generic error for miscellaneous failures.
    #[error("{0}")]
    Error(String),
}

/// Coarse result classification for image open operations.
///
/// This is the compressed view of [`Error`] that assembly-level callers
/// consume: it distinguishes OS failures from format failures without
/// carrying the detail of the underlying error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenStatus {
    /// The operation completed successfully.
    Ok,
    /// The underlying operating system reported an error on open or stat.
    ErrorErrno,
    /// The file does not contain a valid CIL image.
    ImageInvalid,
    /// An assembly was referenced but could not be found.
    ///
    /// Reserved for the assembly loader; the image layer never produces it.
    MissingAssemblyRef,
}

impl OpenStatus {
    /// Returns a fixed human-readable description of the status.
    #[must_use]
    pub fn strerror(self) -> &'static str {
        match self {
            OpenStatus::Ok => "success",
            OpenStatus::ErrorErrno => "System error",
            OpenStatus::ImageInvalid => "File does not contain a valid CIL image",
            OpenStatus::MissingAssemblyRef => {
                "An assembly was referenced, but could not be found"
            }
        }
    }
}

impl From<&Error> for OpenStatus {
    fn from(error: &Error) -> Self {
        match error {
            Error::Io(_) => OpenStatus::ErrorErrno,
            _ => OpenStatus::ImageInvalid,
        }
    }
}
