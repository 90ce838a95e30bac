use std::io;

use thiserror::Error;

use crate::address::LogicalAddress;

/// Malformed input from an external caller. Always rejected before the bus is touched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {field}: {constraint}")]
pub struct ValidationError {
    pub field: &'static str,
    pub constraint: String,
}

impl ValidationError {
    pub fn new(field: &'static str, constraint: impl Into<String>) -> Self {
        Self {
            field,
            constraint: constraint.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to initialise the CEC engine: {0}")]
    AdapterInitFailed(#[source] io::Error),

    #[error("no CEC adapter found")]
    NoAdapterFound,

    #[error("failed to open CEC adapter {path}: {source}")]
    AdapterOpenFailed {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("{operation} is not allowed while the session is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("{operation} failed{}: {source}", address.map(|a| format!(" for device {a}")).unwrap_or_default())]
    BusOperationFailed {
        operation: &'static str,
        address: Option<LogicalAddress>,
        #[source]
        source: io::Error,
    },

    #[error("cannot route to device {address}: {source}")]
    RouteUnresolved {
        address: LogicalAddress,
        #[source]
        source: Box<Error>,
    },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("CEC bus is not ready")]
    ServiceUnavailable,
}

impl Error {
    pub(crate) fn bus(
        operation: &'static str,
        address: Option<LogicalAddress>,
    ) -> impl FnOnce(io::Error) -> Error {
        move |source| Error::BusOperationFailed {
            operation,
            address,
            source,
        }
    }

    /// Status code an HTTP style adapter should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::Validation(_) => 400,
            Error::ServiceUnavailable => 503,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_errors_name_operation_and_address() {
        let addr = LogicalAddress::new(4).unwrap();
        let err = Error::bus("power_on", Some(addr))(io::Error::new(io::ErrorKind::TimedOut, "nack"));
        assert_eq!(err.to_string(), "power_on failed for device 4: nack");
        assert_eq!(err.http_status(), 500);

        let err = Error::bus("volume_up", None)(io::Error::new(io::ErrorKind::Other, "nack"));
        assert_eq!(err.to_string(), "volume_up failed: nack");
    }

    #[test]
    fn classification() {
        let v: Error = ValidationError::new("port", "must be between 1 and 15").into();
        assert_eq!(v.http_status(), 400);
        assert_eq!(v.to_string(), "invalid port: must be between 1 and 15");
        assert_eq!(Error::ServiceUnavailable.http_status(), 503);
        assert_eq!(Error::NoAdapterFound.http_status(), 500);
    }
}
