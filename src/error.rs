use std::{fmt, io};

#[derive(Clone, Copy, Debug)]
pub enum ErrorCode {
    // A read against the target failed or came back short. Always recoverable by the caller.
    Unreadable = 1,
    // Data read from the target violates a structural invariant: unrecognized vtable,
    // object smaller than the requested type, length overflow. Evidence of a corrupt
    // or mismatched target.
    Inconsistent = 2,
    OutOfMemory = 3,
    // API misuse: pointer not produced by this engine, usage conflict, stale instance age.
    Usage = 4,
    // Something unexpected surfaced inside the session boundary and was converted
    // to an error instead of unwinding through the caller.
    HostFault = 5,
    // Target-visible interrupt during live debugging. The session boundary never
    // converts this one; it goes to the caller as-is.
    Interrupted = 6,
    // Stack walker has no current frame (walked off the end). Not a failure.
    NoFrame = 7,
    ProcessState = 8,
    NotImplemented = 9,
    Sanity = 10,
}

#[derive(Debug)]
pub enum ErrorEnum {
    IO(io::Error),
    Code(ErrorCode),
}

#[derive(Clone)]
pub struct Error {
    pub error: ErrorEnum,
    pub message: String,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(code: ErrorCode, message: String) -> Error {
        Error {error: ErrorEnum::Code(code), message}
    }

    pub fn from_io_error(e: io::Error, message: String) -> Error {
        Error {error: ErrorEnum::IO(e), message}
    }

    pub fn is_unreadable(&self) -> bool { match self.error { ErrorEnum::Code(ErrorCode::Unreadable) => true, _ => false, } }
    pub fn is_inconsistent(&self) -> bool { match self.error { ErrorEnum::Code(ErrorCode::Inconsistent) => true, _ => false, } }
    pub fn is_out_of_memory(&self) -> bool { match self.error { ErrorEnum::Code(ErrorCode::OutOfMemory) => true, _ => false, } }
    pub fn is_usage(&self) -> bool { match self.error { ErrorEnum::Code(ErrorCode::Usage) => true, _ => false, } }
    pub fn is_host_fault(&self) -> bool { match self.error { ErrorEnum::Code(ErrorCode::HostFault) => true, _ => false, } }
    pub fn is_interrupted(&self) -> bool { match self.error { ErrorEnum::Code(ErrorCode::Interrupted) => true, _ => false, } }
    pub fn is_no_frame(&self) -> bool { match self.error { ErrorEnum::Code(ErrorCode::NoFrame) => true, _ => false, } }
    pub fn is_process_state(&self) -> bool { match self.error { ErrorEnum::Code(ErrorCode::ProcessState) => true, _ => false, } }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error {error: ErrorEnum::IO(error), message: String::new()}
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(error: std::str::Utf8Error) -> Self {
        Error {error: ErrorEnum::Code(ErrorCode::Inconsistent), message: format!("{}", error)}
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(error: std::string::FromUtf8Error) -> Self {
        Error {error: ErrorEnum::Code(ErrorCode::Inconsistent), message: format!("{}", error)}
    }
}

// For printing to log.
impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error {
            &ErrorEnum::Code(code) => write!(f, "{}: {}", code as i64, self.message),
            ErrorEnum::IO(error) => write!(f, "{}: {}", self.message, error),
        }
    }
}

// For showing to the user.
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error {
            &ErrorEnum::Code(_) => write!(f, "{}", self.message),
            ErrorEnum::IO(error) if self.message.is_empty() => write!(f, "{}", error),
            ErrorEnum::IO(error) => write!(f, "{}: {}", self.message, error),
        }
    }
}

impl Clone for ErrorEnum {
    fn clone(&self) -> Self {
        match self {
            Self::Code(c) => Self::Code(c.clone()),
            Self::IO(e) => Self::IO(match e.raw_os_error() {
                Some(os) => io::Error::from_raw_os_error(os),
                None => e.kind().into(),
            }),
        }
    }
}

#[macro_export]
macro_rules! error {
    ($code:ident, $($arg:tt)*) => (
        Error {error: ErrorEnum::Code(ErrorCode::$code), message: format!($($arg)*)}
    );
}

#[macro_export]
macro_rules! err {
    ($code:ident, $($arg:tt)*) => (
        Err(error!($code, $($arg)*))
    );
}
