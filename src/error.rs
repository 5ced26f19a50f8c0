use crate::storage::FlashError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidGeometry,
    BufferTooSmall,
    UnknownDrive,
    NotOpen,
    /// A previous flash failure left the drive unusable until it is reopened.
    Faulted(FlashError),
    StorageFault(FlashError),
    CorruptImage,
}

impl From<FlashError> for ErrorKind {
    fn from(err: FlashError) -> Self {
        ErrorKind::StorageFault(err)
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ErrorKind::InvalidGeometry => write!(f, "invalid flash geometry"),
            ErrorKind::BufferTooSmall => write!(f, "buffer too small for request"),
            ErrorKind::UnknownDrive => write!(f, "unknown drive"),
            ErrorKind::NotOpen => write!(f, "drive not open"),
            ErrorKind::Faulted(err) => write!(f, "drive faulted: {:?}", err),
            ErrorKind::StorageFault(err) => write!(f, "storage fault: {:?}", err),
            ErrorKind::CorruptImage => write!(f, "corrupt flash image"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ErrorKind {}
