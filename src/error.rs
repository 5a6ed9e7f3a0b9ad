use std::{fmt, io};

use liaise::{Liaise, RegisterErrors};
use nix::errno::Errno;

#[derive(RegisterErrors, Debug, Copy, Clone, PartialEq, Eq)]
#[error_prefix = "HWB"] // Sets the reporting prefix
pub enum StatusCode {
    UnknownError = 1,
    NoMemory = 2,
    InvalidOperation = 3,
    BadValue = 4,
    BadType = 5,
    NameNotFound = 6,
    PermissionDenied = 7,
    NoInit = 8,
    AlreadyExists = 9,
    DeadObject = 10,
    FailedTransaction = 11,
    BadIndex = 12,
    NotEnoughData = 13,
    WouldBlock = 14,
    TimedOut = 15,
    UnknownTransaction = 16,
    FdsNotAllowed = 17,
    UnexpectedNull = 18,
    Os = 19,
    #[cfg(feature = "postcard")]
    PostcardEncode = 30,
    #[cfg(feature = "postcard")]
    PostcardDecode = 31,
    #[cfg(feature = "cbor")]
    CborEncode = 32,
    #[cfg(feature = "cbor")]
    CborDecode = 33,
}

impl Liaise for StatusCode {
    fn code_id(self) -> u16 { self as u16 }

    fn message(self) -> &'static str {
        match self {
            Self::UnknownError => "Unknown error",
            Self::NoMemory => "Out of memory",
            Self::InvalidOperation => "Invalid operation",
            Self::BadValue => "Bad value",
            Self::BadType => "Bad type",
            Self::NameNotFound => "Name not found",
            Self::PermissionDenied => "Permission denied",
            Self::NoInit => "Not initialized",
            Self::AlreadyExists => "Already exists",
            Self::DeadObject => "Dead object",
            Self::FailedTransaction => "Failed transaction",
            Self::BadIndex => "Bad index",
            Self::NotEnoughData => "Not enough data",
            Self::WouldBlock => "Would block",
            Self::TimedOut => "Timed out",
            Self::UnknownTransaction => "Unknown transaction",
            Self::FdsNotAllowed => "File descriptors not allowed",
            Self::UnexpectedNull => "Unexpected null",
            Self::Os => "OS error",
            #[cfg(feature = "postcard")]
            Self::PostcardEncode => "Postcard encode failed",
            #[cfg(feature = "postcard")]
            Self::PostcardDecode => "Postcard decode failed",
            #[cfg(feature = "cbor")]
            Self::CborEncode => "CBOR encode failed",
            #[cfg(feature = "cbor")]
            Self::CborDecode => "CBOR decode failed",
        }
    }
}

const INT32_MIN: i32 = i32::MIN;

impl StatusCode {
    /// The `status_t` value carried on the wire for this code.
    pub fn status(self) -> i32 {
        match self {
            Self::UnknownError | Self::Os => INT32_MIN,
            Self::NoMemory => -(Errno::ENOMEM as i32),
            Self::InvalidOperation => -(Errno::ENOSYS as i32),
            Self::BadValue => -(Errno::EINVAL as i32),
            Self::BadType => INT32_MIN + 1,
            Self::NameNotFound => -(Errno::ENOENT as i32),
            Self::PermissionDenied => -(Errno::EPERM as i32),
            Self::NoInit => -(Errno::ENODEV as i32),
            Self::AlreadyExists => -(Errno::EEXIST as i32),
            Self::DeadObject => -(Errno::EPIPE as i32),
            Self::FailedTransaction => INT32_MIN + 2,
            Self::BadIndex => -(Errno::EOVERFLOW as i32),
            Self::NotEnoughData => -(Errno::ENODATA as i32),
            Self::WouldBlock => -(Errno::EAGAIN as i32),
            Self::TimedOut => -(Errno::ETIMEDOUT as i32),
            Self::UnknownTransaction => -(Errno::EBADMSG as i32),
            Self::FdsNotAllowed => INT32_MIN + 7,
            Self::UnexpectedNull => INT32_MIN + 8,
            #[cfg(feature = "postcard")]
            Self::PostcardEncode | Self::PostcardDecode => -(Errno::EINVAL as i32),
            #[cfg(feature = "cbor")]
            Self::CborEncode | Self::CborDecode => -(Errno::EINVAL as i32),
        }
    }

    /// Maps a non-zero `status_t` back to its code, if it is one of ours.
    pub fn from_status(status: i32) -> Option<Self> {
        const CODES: [StatusCode; 18] = [
            StatusCode::UnknownError,
            StatusCode::NoMemory,
            StatusCode::InvalidOperation,
            StatusCode::BadValue,
            StatusCode::BadType,
            StatusCode::NameNotFound,
            StatusCode::PermissionDenied,
            StatusCode::NoInit,
            StatusCode::AlreadyExists,
            StatusCode::DeadObject,
            StatusCode::FailedTransaction,
            StatusCode::BadIndex,
            StatusCode::NotEnoughData,
            StatusCode::WouldBlock,
            StatusCode::TimedOut,
            StatusCode::UnknownTransaction,
            StatusCode::FdsNotAllowed,
            StatusCode::UnexpectedNull,
        ];
        CODES.into_iter().find(|c| c.status() == status)
    }
}

/// Concrete runtime error type for the crate.
/// Uses `liaise` for stable IDs + formatting; no `thiserror`.
#[derive(Debug)]
pub struct BinderError {
    pub code: StatusCode,
    pub ctx: Option<String>,
    pub source: Option<BinderSource>,
}

#[derive(Debug)]
pub enum BinderSource {
    Errno(Errno),
    Io(io::Error),
    #[cfg(feature = "postcard")]
    Postcard(postcard::Error),
    #[cfg(feature = "cbor")]
    Cbor(serde_cbor::Error),
}

pub type Result<T, E = BinderError> = std::result::Result<T, E>;

impl BinderError {
    #[inline]
    pub fn new(code: StatusCode) -> Self {
        Self { code, ctx: None, source: None }
    }

    #[inline]
    pub fn ctx(mut self, ctx: impl fmt::Display) -> Self {
        self.ctx = Some(ctx.to_string());
        self
    }

    #[inline]
    pub fn errno(err: Errno) -> Self {
        Self {
            code: StatusCode::Os,
            ctx: Some(err.desc().to_string()),
            source: Some(BinderSource::Errno(err)),
        }
    }

    #[inline]
    pub fn io(err: io::Error) -> Self {
        Self {
            code: StatusCode::Os,
            ctx: Some(err.to_string()),
            source: Some(BinderSource::Io(err)),
        }
    }

    #[inline]
    pub fn not_enough_data(needed: usize, avail: usize) -> Self {
        Self::new(StatusCode::NotEnoughData).ctx(format_args!("need {needed} bytes, {avail} left"))
    }

    #[inline]
    pub fn bad_value(ctx: impl fmt::Display) -> Self {
        Self::new(StatusCode::BadValue).ctx(ctx)
    }

    #[inline]
    pub fn bad_type(ctx: impl fmt::Display) -> Self {
        Self::new(StatusCode::BadType).ctx(ctx)
    }

    #[inline]
    pub fn no_memory(bytes: usize) -> Self {
        Self::new(StatusCode::NoMemory).ctx(format_args!("cannot grow to {bytes} bytes"))
    }

    #[cfg(feature = "postcard")]
    #[inline]
    pub fn postcard_encode(err: postcard::Error) -> Self {
        Self {
            code: StatusCode::PostcardEncode,
            ctx: Some(err.to_string()),
            source: Some(BinderSource::Postcard(err)),
        }
    }

    #[cfg(feature = "postcard")]
    #[inline]
    pub fn postcard_decode(err: postcard::Error) -> Self {
        Self {
            code: StatusCode::PostcardDecode,
            ctx: Some(err.to_string()),
            source: Some(BinderSource::Postcard(err)),
        }
    }

    #[cfg(feature = "cbor")]
    #[inline]
    pub fn cbor_encode(err: serde_cbor::Error) -> Self {
        Self {
            code: StatusCode::CborEncode,
            ctx: Some(err.to_string()),
            source: Some(BinderSource::Cbor(err)),
        }
    }

    #[cfg(feature = "cbor")]
    #[inline]
    pub fn cbor_decode(err: serde_cbor::Error) -> Self {
        Self {
            code: StatusCode::CborDecode,
            ctx: Some(err.to_string()),
            source: Some(BinderSource::Cbor(err)),
        }
    }

    /// Builds an error from a wire `status_t`. `None` for `OK`.
    pub fn from_status(status: i32) -> Option<Self> {
        if status == 0 {
            return None;
        }
        match StatusCode::from_status(status) {
            Some(code) => Some(Self::new(code)),
            None if status < 0 && status > INT32_MIN => Some(Self::errno(Errno::from_raw(-status))),
            None => Some(Self::new(StatusCode::UnknownError).ctx(format_args!("status {status}"))),
        }
    }

    /// The `status_t` to put on the wire for this error.
    pub fn status(&self) -> i32 {
        match &self.source {
            Some(BinderSource::Errno(e)) => -(*e as i32),
            Some(BinderSource::Io(e)) => e.raw_os_error().map_or(INT32_MIN, |raw| -raw),
            _ => self.code.status(),
        }
    }

    /// The OS error behind this status, if any.
    pub fn os_errno(&self) -> Option<Errno> {
        match &self.source {
            Some(BinderSource::Errno(e)) => Some(*e),
            Some(BinderSource::Io(e)) => e.raw_os_error().map(Errno::from_raw),
            _ => None,
        }
    }

    #[inline]
    pub fn is(&self, code: StatusCode) -> bool {
        self.code == code
    }
}

impl From<StatusCode> for BinderError {
    #[inline]
    fn from(code: StatusCode) -> Self {
        BinderError::new(code)
    }
}

impl fmt::Display for BinderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // "[HWB0013] Not enough data: need 4 bytes, 0 left"
        let base = self.code.render();
        match &self.ctx {
            Some(ctx) => write!(f, "{base}: {ctx}"),
            None => write!(f, "{base}"),
        }
    }
}

impl std::error::Error for BinderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.source {
            Some(BinderSource::Errno(e)) => Some(e),
            Some(BinderSource::Io(e)) => Some(e),
            #[cfg(feature = "postcard")]
            Some(BinderSource::Postcard(e)) => Some(e),
            #[cfg(feature = "cbor")]
            Some(BinderSource::Cbor(e)) => Some(e),
            None => None,
        }
    }
}

impl From<io::Error> for BinderError {
    #[inline]
    fn from(e: io::Error) -> Self {
        BinderError::io(e)
    }
}

impl From<Errno> for BinderError {
    #[inline]
    fn from(e: Errno) -> Self {
        BinderError::errno(e)
    }
}

/// Unrecoverable protocol contract violation: log and abort the process.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        std::process::abort()
    }};
}
pub(crate) use fatal;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip_for_every_code() {
        for code in [
            StatusCode::NoMemory,
            StatusCode::BadType,
            StatusCode::DeadObject,
            StatusCode::FailedTransaction,
            StatusCode::UnknownTransaction,
            StatusCode::FdsNotAllowed,
            StatusCode::UnexpectedNull,
        ] {
            assert_eq!(StatusCode::from_status(code.status()), Some(code));
        }
        assert_eq!(StatusCode::DeadObject.status(), -32);
        assert_eq!(StatusCode::FailedTransaction.status(), i32::MIN + 2);
    }

    #[test]
    fn unknown_negative_status_is_an_errno() {
        let err = BinderError::from_status(-(Errno::ECONNREFUSED as i32)).expect("error");
        assert!(err.is(StatusCode::Os));
        assert_eq!(err.os_errno(), Some(Errno::ECONNREFUSED));
        assert_eq!(err.status(), -(Errno::ECONNREFUSED as i32));
        assert!(BinderError::from_status(0).is_none());
    }

    #[test]
    fn display_carries_message_and_context() {
        let e = BinderError::not_enough_data(8, 3);
        let s = format!("{e}");
        assert!(s.contains("Not enough data"));
        assert!(s.contains("need 8 bytes"));
    }
}
