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

macro_rules! out_of_bounds_error {
    () => {
        crate::Error::OutOfBounds {
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Only the structural checks of the load pipeline, the hard-form cursor reads and the overlay
/// file operations produce errors. Everything the loader can recover from is recorded in the
/// image's [`crate::Diagnostics`] instead.
///
/// # Error Categories
///
/// ## Fatal load errors
/// - [`Error::InvalidDosSignature`] - The input does not start with `MZ`
/// - [`Error::MisalignedHeaderOffset`] - `e_lfanew` is not a multiple of 8
/// - [`Error::InvalidPeSignature`] - No `PE\0\0` at the header offset
/// - [`Error::Malformed`] - A mandatory structure could not be decoded
/// - [`Error::Empty`] - Empty input provided
///
/// ## Access errors
/// - [`Error::OutOfBounds`] - A read or range request exceeded the available data
/// - [`Error::NotSupported`] - The operation needs a known image bit-width
/// - [`Error::MappedImage`] - Structural edit attempted on a memory-mapped image
///
/// ## I/O errors
/// - [`Error::FileError`] - Filesystem I/O errors
/// - [`Error::Error`] - Miscellaneous failures (e.g. memory mapping)
///
/// # Examples
///
/// ```rust,no_run
/// use peimage::{Error, Image};
///
/// match Image::from_file("sample.exe") {
///     Ok(image) => println!("{} sections", image.sections().len()),
///     Err(Error::MisalignedHeaderOffset(offset)) => eprintln!("bad e_lfanew 0x{offset:X}"),
///     Err(Error::FileError(io_err)) => eprintln!("I/O error: {io_err}"),
///     Err(e) => eprintln!("Other error: {e}"),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The file is damaged and could not be parsed.
    ///
    /// The error includes the source location where the malformation was detected for
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

    /// An out of bound access was attempted.
    ///
    /// Raised by hard-form reads that got fewer bytes than requested, and by range requests
    /// against a backend or an overlay source that exceed its length.
    #[error("Out of Bound read would have occurred! - {file}:{line}")]
    OutOfBounds {
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// The DOS header does not carry the `MZ` magic.
    #[error("Invalid DOS signature - 0x{0:04X}")]
    InvalidDosSignature(u16),

    /// The new-header offset (`e_lfanew`) is not aligned to 8 bytes.
    #[error("Header offset 0x{0:X} is not a multiple of 8")]
    MisalignedHeaderOffset(u32),

    /// The 4 bytes at the header offset are not `PE\0\0`.
    #[error("Invalid PE signature - 0x{0:08X}")]
    InvalidPeSignature(u32),

    /// The operation requires a known image bit-width (PE32 or PE32+).
    #[error("This operation is not supported for the current image")]
    NotSupported,

    /// Structural edits are rejected for images backed by mapped memory.
    #[error("Operation is not permitted on a memory-mapped image")]
    MappedImage,

    /// Provided input was empty.
    #[error("Provided input was empty")]
    Empty,

    /// File I/O error.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Generic error for miscellaneous failures.
    #[error("{0}")]
    Error(String),
}
