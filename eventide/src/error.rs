//! Error codes and task completion values for Eventide.
//!
//! The crate reports failures through a single plain-enum error type rather
//! than ad-hoc strings or boxed errors: an [`ErrorKind`] is `Copy`, can be
//! stored in a static table, and crosses thread and library boundaries
//! without allocation. The code list follows the POSIX errno families, plus
//! the handful of kinds specific to this library (`BadCall`, `Destroyed`,
//! `BadException`).

use core::fmt;

/// Result alias used by the fallible operations of this crate.
pub type EventResult<T> = core::result::Result<T, ErrorKind>;

/// Error code carried by failed operations and captured exceptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use = "error codes must be handled, not silently discarded"]
pub enum ErrorKind {
    /// Operation not permitted
    NotPermitted,
    /// No such file, object, or entry
    NotFound,
    /// No such process
    NoProcess,
    /// Interrupted call
    Interrupted,
    /// Input/output error
    Io,
    /// No such device or address
    NoDevice,
    /// Argument list too long
    ArgumentListTooLong,
    /// Executable format error
    ExecFormat,
    /// Bad file descriptor
    BadFileDescriptor,
    /// No child processes
    NoChild,
    /// Resource temporarily unavailable; retry may succeed
    WouldBlock,
    /// Out of memory, or an allocation limit was hit
    OutOfMemory,
    /// Access denied
    AccessDenied,
    /// Bad address
    BadAddress,
    /// Device or resource busy
    Busy,
    /// Object already exists
    AlreadyExists,
    /// Cross-device link
    CrossDevice,
    /// No such device
    NoSuchDevice,
    /// Not a directory
    NotADirectory,
    /// Is a directory
    IsADirectory,
    /// File table overflow
    FileTableFull,
    /// Too many open files
    TooManyOpenFiles,
    /// Not a terminal
    NotATerminal,
    /// File too large
    FileTooLarge,
    /// No space left on device
    NoSpace,
    /// Illegal seek
    IllegalSeek,
    /// Read-only filesystem
    ReadOnly,
    /// Too many links
    TooManyLinks,
    /// Broken pipe
    BrokenPipe,
    /// Argument outside the function's domain
    Domain,
    /// Resource deadlock would occur
    Deadlock,
    /// Name too long
    NameTooLong,
    /// No locks available
    NoLocks,
    /// Function not implemented
    NotImplemented,
    /// Directory not empty
    NotEmpty,
    /// Invalid argument
    InvalidArgument,
    /// Result out of range
    Range,
    /// Illegal byte sequence
    IllegalSequence,
    /// Truncated
    Truncated,
    /// Address in use
    AddressInUse,
    /// Address not available
    AddressNotAvailable,
    /// Address family not supported
    AddressFamilyNotSupported,
    /// Connection already in progress
    AlreadyInProgress,
    /// Bad message
    BadMessage,
    /// Operation canceled; stops a periodic task, an error elsewhere
    Canceled,
    /// Connection aborted
    ConnectionAborted,
    /// Connection refused
    ConnectionRefused,
    /// Connection reset
    ConnectionReset,
    /// Destination address required
    DestinationRequired,
    /// Host unreachable
    HostUnreachable,
    /// Identifier removed
    IdentifierRemoved,
    /// Operation in progress
    InProgress,
    /// Socket is connected
    IsConnected,
    /// Too many levels of symbolic links
    TooManySymlinks,
    /// Message too long
    MessageTooLong,
    /// Network is down
    NetworkDown,
    /// Network dropped connection on reset
    NetworkReset,
    /// Network unreachable
    NetworkUnreachable,
    /// No buffer space available
    NoBuffers,
    /// No data available
    NoData,
    /// Link has been severed
    LinkSevered,
    /// No message of the desired type
    NoMessage,
    /// Protocol option not available
    NoProtocolOption,
    /// No stream resources
    NoStreamResources,
    /// Not a stream
    NotAStream,
    /// Socket not connected
    NotConnected,
    /// State not recoverable
    NotRecoverable,
    /// Not a socket
    NotASocket,
    /// Operation not supported
    NotSupported,
    /// Catch-all for errors with no finer category
    Other,
    /// Value too large for the defined data type
    Overflow,
    /// Previous owner died
    OwnerDead,
    /// Protocol error
    Protocol,
    /// Protocol not supported
    ProtocolNotSupported,
    /// Wrong protocol type
    WrongProtocolType,
    /// Timer expired
    TimerExpired,
    /// Operation timed out
    TimedOut,
    /// Text file busy
    TextBusy,

    /// Invoking a moved-out or default-constructed functor
    BadCall,
    /// An event flag was destroyed while threads were waiting on it
    Destroyed,
    /// Failed to capture an exception
    BadException,
}

impl ErrorKind {
    /// Short human-readable description of the code.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotPermitted => "operation not permitted",
            ErrorKind::NotFound => "no such entry",
            ErrorKind::NoProcess => "no such process",
            ErrorKind::Interrupted => "interrupted call",
            ErrorKind::Io => "input/output error",
            ErrorKind::NoDevice => "no such device or address",
            ErrorKind::ArgumentListTooLong => "argument list too long",
            ErrorKind::ExecFormat => "executable format error",
            ErrorKind::BadFileDescriptor => "bad file descriptor",
            ErrorKind::NoChild => "no child processes",
            ErrorKind::WouldBlock => "resource temporarily unavailable",
            ErrorKind::OutOfMemory => "out of memory",
            ErrorKind::AccessDenied => "access denied",
            ErrorKind::BadAddress => "bad address",
            ErrorKind::Busy => "device or resource busy",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::CrossDevice => "cross-device link",
            ErrorKind::NoSuchDevice => "no such device",
            ErrorKind::NotADirectory => "not a directory",
            ErrorKind::IsADirectory => "is a directory",
            ErrorKind::FileTableFull => "file table overflow",
            ErrorKind::TooManyOpenFiles => "too many open files",
            ErrorKind::NotATerminal => "not a terminal",
            ErrorKind::FileTooLarge => "file too large",
            ErrorKind::NoSpace => "no space left on device",
            ErrorKind::IllegalSeek => "illegal seek",
            ErrorKind::ReadOnly => "read-only filesystem",
            ErrorKind::TooManyLinks => "too many links",
            ErrorKind::BrokenPipe => "broken pipe",
            ErrorKind::Domain => "argument outside domain",
            ErrorKind::Deadlock => "resource deadlock would occur",
            ErrorKind::NameTooLong => "name too long",
            ErrorKind::NoLocks => "no locks available",
            ErrorKind::NotImplemented => "function not implemented",
            ErrorKind::NotEmpty => "directory not empty",
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::Range => "result out of range",
            ErrorKind::IllegalSequence => "illegal byte sequence",
            ErrorKind::Truncated => "truncated",
            ErrorKind::AddressInUse => "address in use",
            ErrorKind::AddressNotAvailable => "address not available",
            ErrorKind::AddressFamilyNotSupported => "address family not supported",
            ErrorKind::AlreadyInProgress => "connection already in progress",
            ErrorKind::BadMessage => "bad message",
            ErrorKind::Canceled => "operation canceled",
            ErrorKind::ConnectionAborted => "connection aborted",
            ErrorKind::ConnectionRefused => "connection refused",
            ErrorKind::ConnectionReset => "connection reset",
            ErrorKind::DestinationRequired => "destination address required",
            ErrorKind::HostUnreachable => "host unreachable",
            ErrorKind::IdentifierRemoved => "identifier removed",
            ErrorKind::InProgress => "operation in progress",
            ErrorKind::IsConnected => "socket is connected",
            ErrorKind::TooManySymlinks => "too many levels of symbolic links",
            ErrorKind::MessageTooLong => "message too long",
            ErrorKind::NetworkDown => "network is down",
            ErrorKind::NetworkReset => "network dropped connection on reset",
            ErrorKind::NetworkUnreachable => "network unreachable",
            ErrorKind::NoBuffers => "no buffer space available",
            ErrorKind::NoData => "no data available",
            ErrorKind::LinkSevered => "link has been severed",
            ErrorKind::NoMessage => "no message of the desired type",
            ErrorKind::NoProtocolOption => "protocol option not available",
            ErrorKind::NoStreamResources => "no stream resources",
            ErrorKind::NotAStream => "not a stream",
            ErrorKind::NotConnected => "socket not connected",
            ErrorKind::NotRecoverable => "state not recoverable",
            ErrorKind::NotASocket => "not a socket",
            ErrorKind::NotSupported => "operation not supported",
            ErrorKind::Other => "unspecified error",
            ErrorKind::Overflow => "value too large",
            ErrorKind::OwnerDead => "previous owner died",
            ErrorKind::Protocol => "protocol error",
            ErrorKind::ProtocolNotSupported => "protocol not supported",
            ErrorKind::WrongProtocolType => "wrong protocol type",
            ErrorKind::TimerExpired => "timer expired",
            ErrorKind::TimedOut => "operation timed out",
            ErrorKind::TextBusy => "text file busy",
            ErrorKind::BadCall => "bad functor call",
            ErrorKind::Destroyed => "destroyed while waiting",
            ErrorKind::BadException => "failed to capture exception",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for ErrorKind {}

/// Value returned by a task run on the event loop (and by queued functors in
/// general).
///
/// `Done` is the norm. `Canceled` asks a periodic task not to be re-enqueued;
/// on every other path it is treated like any other failure. `Failed` is
/// turned into an [`Exception`](crate::Exception) and surfaced at the
/// `invoke` call site or the loop's error handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "task completions decide rescheduling and error routing"]
pub enum Completion {
    /// The task ran to completion.
    Done,
    /// The task asks not to run again (meaningful for periodic tasks).
    Canceled,
    /// The task failed with the given code.
    Failed(ErrorKind),
}

impl Completion {
    /// `Failed(kind)` or `Canceled` as the equivalent error code.
    pub fn err(self) -> Option<ErrorKind> {
        match self {
            Completion::Done => None,
            Completion::Canceled => Some(ErrorKind::Canceled),
            Completion::Failed(kind) => Some(kind),
        }
    }

    pub fn is_canceled(self) -> bool {
        matches!(self, Completion::Canceled)
    }
}

impl Default for Completion {
    fn default() -> Self {
        Completion::Done
    }
}
