//! The kernel-wide error type.
//!
//! Every fallible operation reports the first error it encounters; partial
//! transfers return the count moved so far instead, and the next call
//! re-reports the error. User-visible errors never panic.

/// Errors returned by kernel services and surfaced to user programs as
/// negative syscall return values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum Error {
    /// Null pointer, out-of-range length or position, malformed argument.
    Invalid = 1,
    /// Resource already open or in use.
    Busy = 2,
    /// Operation not implemented by the interface, or bad ioctl.
    NotSupported = 3,
    /// No such device.
    NoDevice = 4,
    /// Backing device failure or short transfer.
    Io = 5,
    /// Executable failed a format sanity check.
    BadFormat = 6,
    /// Name not present.
    NotFound = 7,
    /// Virtual-memory flag check failed on a user pointer.
    NoAccess = 8,
    /// File descriptor out of range or empty.
    BadFd = 9,
    /// File descriptor table or open-file table full.
    TooManyFiles = 10,
    /// Thread table full.
    TooManyThreads = 11,
    /// Heap or physical-page allocation failed.
    OutOfMemory = 12,
    /// Write to a pipe with no remaining readers.
    BrokenPipe = 13,
}

impl Error {
    /// Returns the negative integer reported to user space.
    pub fn code(self) -> i64 {
        -(self as i64)
    }
}

impl From<ktfs::Error> for Error {
    fn from(e: ktfs::Error) -> Self {
        match e {
            ktfs::Error::Invalid => Error::Invalid,
            ktfs::Error::NotFound => Error::NotFound,
            ktfs::Error::Busy => Error::Busy,
            ktfs::Error::TooManyOpen => Error::TooManyFiles,
            // Disk exhaustion has no dedicated code; the device is full.
            ktfs::Error::NoSpace => Error::Io,
            ktfs::Error::Io => Error::Io,
        }
    }
}

/// Result type used throughout the kernel.
pub type Result<T> = core::result::Result<T, Error>;
