use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::fmt;

/// Error kinds surfaced across the signaling boundary. The labels are part
/// of the wire protocol and must stay byte-stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalError {
    NotInitialized,
    MissingDeviceId,
    ProtocolOrder,
    UnknownTransport,
    UnknownProducer,
    UnknownStream,
    UnsupportedCapabilities,
    ProduceFailed,
    EgressPortsExhausted,
    ProducerClosed,
}

impl SignalError {
    pub fn kind(self) -> &'static str {
        match self {
            Self::NotInitialized => "NotInitialized",
            Self::MissingDeviceId => "MissingDeviceId",
            Self::ProtocolOrder => "ProtocolOrder",
            Self::UnknownTransport => "UnknownTransport",
            Self::UnknownProducer => "UnknownProducer",
            Self::UnknownStream => "UnknownStream",
            Self::UnsupportedCapabilities => "UnsupportedCapabilities",
            Self::ProduceFailed => "ProduceFailed",
            Self::EgressPortsExhausted => "EgressPortsExhausted",
            Self::ProducerClosed => "ProducerClosed",
        }
    }
}

impl fmt::Display for SignalError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.kind())
    }
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {msg}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".into(),
                )
            }
        };

        let body = axum::Json(json!({ "error": message }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_labels_are_stable() {
        let kinds = [
            (SignalError::NotInitialized, "NotInitialized"),
            (SignalError::MissingDeviceId, "MissingDeviceId"),
            (SignalError::ProtocolOrder, "ProtocolOrder"),
            (SignalError::UnknownTransport, "UnknownTransport"),
            (SignalError::UnknownProducer, "UnknownProducer"),
            (SignalError::UnknownStream, "UnknownStream"),
            (
                SignalError::UnsupportedCapabilities,
                "UnsupportedCapabilities",
            ),
            (SignalError::ProduceFailed, "ProduceFailed"),
            (SignalError::EgressPortsExhausted, "EgressPortsExhausted"),
            (SignalError::ProducerClosed, "ProducerClosed"),
        ];

        for (error, label) in kinds {
            assert_eq!(error.kind(), label);
            assert_eq!(error.to_string(), label);
        }
    }
}
