//! Session error taxonomy.
//!
//! Errors travel as `anyhow::Error` like everything else in the crate. The
//! variants below are attached at the point of failure so the session
//! controller can record which class of failure ended an operation.

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    DriverError,
    NotOpen,
    ConversionFailure,
    SinkNegotiationFailure,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionError {
    /// The selector matched no enumerated device (or nothing was enumerated).
    NotFound(String),
    /// Any failure surfaced by the driver during connect/open/configure/grab.
    DriverError(String),
    /// Operation attempted on a closed session.
    NotOpen,
    /// A raw grab could not be decoded into a presentable frame.
    ConversionFailure(String),
    /// The sink rejected the presentation format.
    SinkNegotiationFailure(String),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::NotFound(_) => ErrorKind::NotFound,
            SessionError::DriverError(_) => ErrorKind::DriverError,
            SessionError::NotOpen => ErrorKind::NotOpen,
            SessionError::ConversionFailure(_) => ErrorKind::ConversionFailure,
            SessionError::SinkNegotiationFailure(_) => ErrorKind::SinkNegotiationFailure,
        }
    }

    /// Recover the taxonomy of an `anyhow::Error`.
    ///
    /// Errors that never had a `SessionError` attached (plain driver I/O
    /// failures, for instance) classify as `DriverError`.
    pub fn kind_of(err: &anyhow::Error) -> ErrorKind {
        Self::find(err)
            .map(SessionError::kind)
            .unwrap_or(ErrorKind::DriverError)
    }

    /// Convert any error into a `SessionError`, keeping the full context chain
    /// as the message.
    pub fn classify(err: &anyhow::Error) -> SessionError {
        let Some(found) = Self::find(err) else {
            return SessionError::DriverError(format!("{:#}", err));
        };
        if *found == SessionError::NotOpen {
            return SessionError::NotOpen;
        }
        let mut parts: Vec<String> = err
            .chain()
            .take_while(|cause| cause.downcast_ref::<SessionError>().is_none())
            .map(|cause| cause.to_string())
            .collect();
        parts.push(found.detail().to_string());
        found.with_message(parts.join(": "))
    }

    /// Message carried by the variant, without the class prefix.
    pub fn detail(&self) -> &str {
        match self {
            SessionError::NotFound(msg)
            | SessionError::DriverError(msg)
            | SessionError::ConversionFailure(msg)
            | SessionError::SinkNegotiationFailure(msg) => msg,
            SessionError::NotOpen => "",
        }
    }

    fn find(err: &anyhow::Error) -> Option<&SessionError> {
        err.chain().find_map(|cause| cause.downcast_ref::<SessionError>())
    }

    fn with_message(&self, message: String) -> SessionError {
        match self {
            SessionError::NotFound(_) => SessionError::NotFound(message),
            SessionError::DriverError(_) => SessionError::DriverError(message),
            SessionError::NotOpen => SessionError::NotOpen,
            SessionError::ConversionFailure(_) => SessionError::ConversionFailure(message),
            SessionError::SinkNegotiationFailure(_) => {
                SessionError::SinkNegotiationFailure(message)
            }
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::NotFound(msg) => write!(f, "device not found: {}", msg),
            SessionError::DriverError(msg) => write!(f, "driver error: {}", msg),
            SessionError::NotOpen => write!(f, "camera not open"),
            SessionError::ConversionFailure(msg) => write!(f, "conversion failure: {}", msg),
            SessionError::SinkNegotiationFailure(msg) => {
                write!(f, "sink negotiation failure: {}", msg)
            }
        }
    }
}

impl std::error::Error for SessionError {}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn kind_survives_context() {
        let err: anyhow::Result<()> = Err(SessionError::NotFound("serial=B".into()).into());
        let err = err.context("open camera").unwrap_err();
        assert_eq!(SessionError::kind_of(&err), ErrorKind::NotFound);
    }

    #[test]
    fn untagged_errors_are_driver_errors() {
        let err = anyhow::anyhow!("usb transfer failed");
        assert_eq!(SessionError::kind_of(&err), ErrorKind::DriverError);
        match SessionError::classify(&err) {
            SessionError::DriverError(msg) => assert!(msg.contains("usb transfer failed")),
            other => panic!("unexpected classification: {:?}", other),
        }
    }

    #[test]
    fn classify_keeps_context_without_repeating_the_class() {
        let err: anyhow::Result<()> = Err(SessionError::NotFound("ip=10.0.0.9".into()).into());
        let err = err.context("open").unwrap_err();
        assert_eq!(
            SessionError::classify(&err),
            SessionError::NotFound("open: ip=10.0.0.9".into())
        );
    }

    #[test]
    fn display_names_the_failure() {
        assert!(SessionError::NotOpen.to_string().contains("not open"));
        let err = SessionError::SinkNegotiationFailure("640x480 Rgb32".into());
        assert!(err.to_string().contains("640x480"));
    }
}
