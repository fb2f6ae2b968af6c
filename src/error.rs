/// Flavour of a device-reported error stop tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceErrorKind {
    /// Plain `ERROR`.
    Error,
    /// `+CME ERROR: <n>`, mobile equipment error.
    Cme,
    /// `+CMS ERROR: <n>`, message service error.
    Cms,
}

/// Error reported by the module in place of `OK`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceError {
    pub kind: DeviceErrorKind,
    /// Numeric sub-code of a CME/CMS error. `None` for plain `ERROR` or
    /// when the module is configured for verbose error text.
    pub code: Option<i32>,
}

impl DeviceError {
    pub const fn plain() -> Self {
        Self {
            kind: DeviceErrorKind::Error,
            code: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The module rejected the command.
    Device(DeviceError),
    /// No stop tag or parameter arrived before the exchange deadline.
    Timeout,
    /// The byte stream lost synchronisation: abort tag, receiver resync,
    /// oversized line or a failed transport write.
    Aborted,
    /// The engine was called incorrectly, e.g. re-entrant lock, reading
    /// before `response_start` or a buffer shorter than the requested length.
    InvalidUsage,
    /// The response ended before the requested prefix or parameter.
    NoParameter,
    /// A parameter could not be interpreted as the requested type.
    Parse,
    /// A bounded resource was full: value buffer, URC table or callback queue.
    Overflow,
}

impl Error {
    /// Whether this error is latched into the exchange error state.
    pub const fn is_latched(&self) -> bool {
        matches!(
            self,
            Error::Device(_) | Error::Timeout | Error::Aborted | Error::InvalidUsage
        )
    }

    /// Negative status code as consumed by modules layered on the engine.
    pub const fn status_code(&self) -> i32 {
        match self {
            Error::InvalidUsage => -5,
            Error::Overflow => -6,
            Error::Timeout => -9,
            Error::Device(_) => -10,
            Error::NoParameter | Error::Parse => -11,
            Error::Aborted => -12,
        }
    }
}

impl From<DeviceError> for Error {
    fn from(e: DeviceError) -> Self {
        Error::Device(e)
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Device(DeviceError { kind, code: Some(code) }) => {
                write!(f, "device error {:?} {}", kind, code)
            }
            Error::Device(DeviceError { kind, code: None }) => write!(f, "device error {:?}", kind),
            Error::Timeout => f.write_str("timeout"),
            Error::Aborted => f.write_str("aborted"),
            Error::InvalidUsage => f.write_str("invalid usage"),
            Error::NoParameter => f.write_str("no parameter"),
            Error::Parse => f.write_str("parse error"),
            Error::Overflow => f.write_str("overflow"),
        }
    }
}
