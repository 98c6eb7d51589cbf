use std::fmt;

use crate::parcel::ParcelError;

/// Transport-level result of a transaction.
///
/// This is a closed set: it says whether the request reached a handler intact,
/// never whether the handler succeeded. Handler results travel in the reply
/// payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    /// Wrong interface token; the peer is incompatible or unauthenticated.
    InvalidValue,
    /// The request payload could not be decoded.
    FlattenObject,
    /// The target object is gone or was never registered.
    InvalidObject,
    /// No route and no fallback accepted the code.
    UnknownTransaction,
}

impl Status {
    pub fn as_i32(self) -> i32 {
        match self {
            Status::Ok => 0,
            Status::InvalidValue => -22,
            Status::FlattenObject => -74,
            Status::InvalidObject => -4,
            Status::UnknownTransaction => -38,
        }
    }

    pub fn from_i32(code: i32) -> Option<Self> {
        Some(match code {
            0 => Status::Ok,
            -22 => Status::InvalidValue,
            -74 => Status::FlattenObject,
            -4 => Status::InvalidObject,
            -38 => Status::UnknownTransaction,
            _ => return None,
        })
    }

    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }

    /// `Ok(())` for [`Status::Ok`], otherwise `Err(self)`.
    pub fn into_result(self) -> Result<(), Status> {
        if self.is_ok() { Ok(()) } else { Err(self) }
    }

    pub fn description(self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::InvalidValue => "invalid interface token",
            Status::FlattenObject => "malformed request payload",
            Status::InvalidObject => "invalid object",
            Status::UnknownTransaction => "unknown transaction code",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.as_i32())
    }
}

impl std::error::Error for Status {}

impl From<ParcelError> for Status {
    fn from(_: ParcelError) -> Self {
        Status::FlattenObject
    }
}
