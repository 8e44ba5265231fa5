//! Error results that can occur while converting Commodore containers
#![warn(missing_docs)]
#![warn(unsafe_code)]
use std::{
    fmt::{Debug, Display, Formatter, Result},
    io,
};

/// An error that can occur when reading or writing a container, disk
/// image or host file.
pub struct Error {
    kind: ErrorKind,
}

impl Debug for Error {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(f, "{}", self.kind)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(f, "{}", self.kind)
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Create a new Error with a given ErrorKind variant
    pub fn new(kind: ErrorKind) -> Error {
        Error { kind }
    }

    /// Borrow the kind of this error
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// An out-of-space error for the active sink
    pub fn no_space() -> Error {
        Error::new(ErrorKind::NoSpace)
    }

    /// A duplicate file name error for the active sink
    pub fn file_exists() -> Error {
        Error::new(ErrorKind::FileExists)
    }

    /// True if the sink ran out of space
    pub fn is_no_space(&self) -> bool {
        matches!(self.kind, ErrorKind::NoSpace)
    }

    /// True if the sink already holds a file with the same name
    pub fn is_file_exists(&self) -> bool {
        matches!(self.kind, ErrorKind::FileExists)
    }
}

impl From<nom::Err<nom::error::Error<&[u8]>>> for Error {
    fn from(e: nom::Err<nom::error::Error<&[u8]>>) -> Self {
        Error::new(ErrorKind::new(&e.to_string()))
    }
}

impl<'a> nom::error::ParseError<&'a [u8]> for Error {
    fn from_error_kind(_input: &'a [u8], kind: nom::error::ErrorKind) -> Self {
        Error::new(ErrorKind::new(kind.description()))
    }

    fn append(_input: &'a [u8], _kind: nom::error::ErrorKind, other: Self) -> Self {
        other
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::new(ErrorKind::Io(e))
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

/// The kinds of errors that can occur when processing a container or
/// disk image.
pub enum ErrorKind {
    /// Generic error type
    Message(String),

    /// An error that occurs while reading or writing host files.
    Io(io::Error),

    /// An error that occurs when dealing with invalid or unexpected
    /// data.
    Invalid(InvalidErrorKind),

    /// The file was in a format that is unsupported or has
    /// unsupported features.
    Unimplemented(String),

    /// The data requested was not found.  This can occur when looking
    /// up a directory entry or an illegal track and sector address.
    NotFound(String),

    /// The sink (disk image, archive or host file system) is out of
    /// space.
    NoSpace,

    /// The sink already holds a file with the same Commodore name.
    FileExists,
}

impl PartialEq for ErrorKind {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ErrorKind::Message(a), ErrorKind::Message(b)) => a == b,
            (ErrorKind::Io(a), ErrorKind::Io(b)) => a.kind() == b.kind(),
            (ErrorKind::Invalid(a), ErrorKind::Invalid(b)) => a == b,
            (ErrorKind::Unimplemented(a), ErrorKind::Unimplemented(b)) => a == b,
            (ErrorKind::NotFound(a), ErrorKind::NotFound(b)) => a == b,
            (ErrorKind::NoSpace, ErrorKind::NoSpace) => true,
            (ErrorKind::FileExists, ErrorKind::FileExists) => true,
            _ => false,
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter) -> Result {
        match self {
            ErrorKind::Message(message) => write!(f, "An error occurred: {}", message),
            ErrorKind::Io(e) => write!(f, "{}", e),
            ErrorKind::Invalid(e) => write!(f, "{}", e),
            ErrorKind::Unimplemented(message) => {
                write!(f, "Unimplemented feature: {}", message)
            }
            ErrorKind::NotFound(message) => {
                write!(f, "Data not found: {}", message)
            }
            ErrorKind::NoSpace => write!(f, "Out of space"),
            ErrorKind::FileExists => write!(f, "Duplicate file name"),
        }
    }
}

impl ErrorKind {
    /// Return a new generic ErrorKind::Message with a given string message.
    pub fn new(message: &str) -> ErrorKind {
        ErrorKind::Message(message.to_string())
    }
}

/// An InvalidErrorKind is returned when the data is invalid.
#[derive(Eq, PartialEq)]
pub enum InvalidErrorKind {
    /// The data was invalid
    Invalid(String),
    /// The data contains an invalid checksum
    Checksum,
}

impl Display for InvalidErrorKind {
    fn fmt(&self, f: &mut Formatter) -> Result {
        match self {
            InvalidErrorKind::Invalid(message) => write!(f, "Invalid data: {}", message),
            InvalidErrorKind::Checksum => write!(f, "Invalid checksum"),
        }
    }
}

/// Shorthand for building an `ErrorKind::Invalid` error
pub fn invalid(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::Invalid(InvalidErrorKind::Invalid(message.into())))
}

#[cfg(test)]
mod tests {
    use super::{invalid, Error, ErrorKind};

    #[test]
    fn no_space_matches() {
        let e = Error::no_space();
        assert!(e.is_no_space());
        assert!(!e.is_file_exists());
    }

    #[test]
    fn display_kinds() {
        assert_eq!(format!("{}", Error::file_exists()), "Duplicate file name");
        assert_eq!(
            format!("{}", invalid("bad header")),
            "Invalid data: bad header"
        );
        assert_eq!(
            format!("{}", Error::new(ErrorKind::NotFound(String::from("18,0")))),
            "Data not found: 18,0"
        );
    }
}
