use mediasoup::prelude::{DtlsParameters, MediaKind, RtpCapabilities, RtpCapabilitiesFinalized, RtpParameters};
use serde::{Deserialize, Serialize};

use crate::events::StreamInfo;
use crate::media::egress::EgressReply;
use crate::media::transport::CreatedClientTransport;

pub const MAX_REQUEST_ID_CHARS: usize = 128;
pub const MAX_ENTITY_ID_CHARS: usize = 128;
pub const MAX_NAME_CHARS: usize = 128;

/// Requests arriving over the signaling channel. Every request may carry a
/// `request_id` that is echoed on the correlated reply.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum ClientMessage {
    RegisterDevice {
        request_id: Option<String>,
        device_id: Option<String>,
        device_name: Option<String>,
    },
    GetRtpCapabilities {
        request_id: Option<String>,
    },
    CreateTransport {
        request_id: Option<String>,
    },
    ConnectTransport {
        request_id: Option<String>,
        transport_id: String,
        dtls_parameters: DtlsParameters,
    },
    Produce {
        request_id: Option<String>,
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    CreateRecvTransport {
        request_id: Option<String>,
    },
    ConnectRecvTransport {
        request_id: Option<String>,
        transport_id: String,
        dtls_parameters: DtlsParameters,
    },
    ConsumeStream {
        request_id: Option<String>,
        transport_id: String,
        producer_id: String,
        rtp_capabilities: RtpCapabilities,
    },
    ResumeConsumer {
        request_id: Option<String>,
        consumer_id: String,
    },
    StopStream {
        request_id: Option<String>,
    },
    DisconnectStream {
        request_id: Option<String>,
        stream_id: String,
    },
    UpdateStreamName {
        request_id: Option<String>,
        stream_id: String,
        name: String,
    },
    GetActiveStreams {
        request_id: Option<String>,
    },
    NdiBridgeConsumeStream {
        request_id: Option<String>,
        stream_id: String,
        producer_id: String,
        rtp_capabilities: RtpCapabilities,
    },
}

impl ClientMessage {
    pub fn request_id(&self) -> Option<String> {
        match self {
            Self::RegisterDevice { request_id, .. }
            | Self::GetRtpCapabilities { request_id }
            | Self::CreateTransport { request_id }
            | Self::ConnectTransport { request_id, .. }
            | Self::Produce { request_id, .. }
            | Self::CreateRecvTransport { request_id }
            | Self::ConnectRecvTransport { request_id, .. }
            | Self::ConsumeStream { request_id, .. }
            | Self::ResumeConsumer { request_id, .. }
            | Self::StopStream { request_id }
            | Self::DisconnectStream { request_id, .. }
            | Self::UpdateStreamName { request_id, .. }
            | Self::GetActiveStreams { request_id }
            | Self::NdiBridgeConsumeStream { request_id, .. } => request_id.clone(),
        }
    }

    /// Field length limits, checked before any state is touched.
    pub fn validate_fields(&self) -> Result<(), &'static str> {
        if let Some(request_id) = self.request_id() {
            if request_id.is_empty() || request_id.len() > MAX_REQUEST_ID_CHARS {
                return Err("request_id is invalid");
            }
        }

        match self {
            Self::RegisterDevice {
                device_id,
                device_name,
                ..
            } => {
                if let Some(device_id) = device_id {
                    if device_id.len() > MAX_ENTITY_ID_CHARS {
                        return Err("device_id is too long");
                    }
                }
                if let Some(device_name) = device_name {
                    if device_name.len() > MAX_NAME_CHARS {
                        return Err("device_name is too long");
                    }
                }
            }
            Self::ConnectTransport { transport_id, .. }
            | Self::ConnectRecvTransport { transport_id, .. }
            | Self::Produce { transport_id, .. } => {
                if transport_id.is_empty() || transport_id.len() > MAX_ENTITY_ID_CHARS {
                    return Err("transport_id is invalid");
                }
            }
            Self::ConsumeStream {
                transport_id,
                producer_id,
                ..
            } => {
                if transport_id.is_empty() || transport_id.len() > MAX_ENTITY_ID_CHARS {
                    return Err("transport_id is invalid");
                }
                if producer_id.is_empty() || producer_id.len() > MAX_ENTITY_ID_CHARS {
                    return Err("producer_id is invalid");
                }
            }
            Self::ResumeConsumer { consumer_id, .. } => {
                if consumer_id.is_empty() || consumer_id.len() > MAX_ENTITY_ID_CHARS {
                    return Err("consumer_id is invalid");
                }
            }
            Self::DisconnectStream { stream_id, .. } => {
                if stream_id.is_empty() || stream_id.len() > MAX_ENTITY_ID_CHARS {
                    return Err("stream_id is invalid");
                }
            }
            Self::UpdateStreamName {
                stream_id, name, ..
            } => {
                if stream_id.is_empty() || stream_id.len() > MAX_ENTITY_ID_CHARS {
                    return Err("stream_id is invalid");
                }
                if name.is_empty() || name.len() > MAX_NAME_CHARS {
                    return Err("name is invalid");
                }
            }
            Self::NdiBridgeConsumeStream {
                stream_id,
                producer_id,
                ..
            } => {
                if stream_id.is_empty() || stream_id.len() > MAX_ENTITY_ID_CHARS {
                    return Err("stream_id is invalid");
                }
                if producer_id.is_empty() || producer_id.len() > MAX_ENTITY_ID_CHARS {
                    return Err("producer_id is invalid");
                }
            }
            Self::GetRtpCapabilities { .. }
            | Self::CreateTransport { .. }
            | Self::CreateRecvTransport { .. }
            | Self::StopStream { .. }
            | Self::GetActiveStreams { .. } => {}
        }

        Ok(())
    }
}

/// Correlated replies. Lifecycle broadcasts are serialized straight from
/// `RegistryEvent` and share the same `action` tag space.
#[derive(Debug, Serialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum ServerMessage {
    DeviceRegistered {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        device_id: String,
    },
    RtpCapabilities {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        rtp_capabilities: RtpCapabilitiesFinalized,
    },
    TransportCreated {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(flatten)]
        transport: CreatedClientTransport,
    },
    TransportConnected {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        transport_id: String,
    },
    Produced {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        id: String,
        kind: MediaKind,
    },
    RecvTransportCreated {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(flatten)]
        transport: CreatedClientTransport,
    },
    RecvTransportConnected {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        transport_id: String,
    },
    StreamConsumed {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        id: String,
        producer_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    ConsumerResumed {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        consumer_id: String,
    },
    StreamStopped {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    StreamDisconnected {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        stream_id: String,
    },
    StreamRenamed {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        stream_id: String,
    },
    ActiveStreams {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        streams: Vec<StreamInfo>,
    },
    NdiBridgeStreamConsumed {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(flatten)]
        reply: EgressReply,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        error: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn requests_parse_from_kebab_case_actions() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "action": "register-device",
            "request_id": "r1",
            "device_id": "dev-A",
        }))
        .unwrap();
        match msg {
            ClientMessage::RegisterDevice {
                request_id,
                device_id,
                device_name,
            } => {
                assert_eq!(request_id.as_deref(), Some("r1"));
                assert_eq!(device_id.as_deref(), Some("dev-A"));
                assert!(device_name.is_none());
            }
            other => panic!("unexpected message {other:?}"),
        }

        let msg: ClientMessage = serde_json::from_value(json!({
            "action": "ndi-bridge-consume-stream",
            "stream_id": "stream-T1-1",
            "producer_id": "11111111-2222-3333-4444-555555555555",
            "rtp_capabilities": { "codecs": [], "headerExtensions": [] },
        }))
        .unwrap();
        assert!(matches!(msg, ClientMessage::NdiBridgeConsumeStream { .. }));
    }

    #[test]
    fn register_device_without_id_still_parses() {
        // Missing device_id is a protocol error, not a parse error.
        let msg: ClientMessage =
            serde_json::from_value(json!({ "action": "register-device" })).unwrap();
        match msg {
            ClientMessage::RegisterDevice { device_id, .. } => assert!(device_id.is_none()),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn error_reply_carries_stable_kind() {
        let reply = ServerMessage::Error {
            request_id: Some("r9".into()),
            error: crate::errors::SignalError::ProtocolOrder.kind(),
            message: None,
        };
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["action"], "error");
        assert_eq!(value["error"], "ProtocolOrder");
        assert_eq!(value["request_id"], "r9");
        assert!(value.get("message").is_none());
    }

    #[test]
    fn oversized_fields_are_rejected() {
        let long = "x".repeat(MAX_ENTITY_ID_CHARS + 1);
        let msg: ClientMessage = serde_json::from_value(json!({
            "action": "disconnect-stream",
            "stream_id": long,
        }))
        .unwrap();
        assert!(msg.validate_fields().is_err());
    }
}
