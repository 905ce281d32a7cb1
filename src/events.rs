use chrono::{DateTime, Utc};
use serde::Serialize;

/// Operator-visible view of a stream record. `name` is the effective
/// display name: the operator override when set, otherwise the owning
/// device's name, otherwise the device id.
#[derive(Debug, Clone, Serialize)]
pub struct StreamInfo {
    pub id: String,
    pub producer_id: String,
    pub device_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub max_bitrate: u32,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle transitions broadcast to every open signaling channel.
///
/// For a single device these are emitted in commit order; across devices
/// there is no ordering guarantee.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum RegistryEvent {
    DeviceConnected {
        device_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        device_name: Option<String>,
    },
    DeviceDisconnected {
        device_id: String,
    },
    DeviceRemoved {
        device_id: String,
    },
    DeviceStreamingChanged {
        device_id: String,
        is_streaming: bool,
        stream_id: Option<String>,
    },
    StreamStarted {
        stream: StreamInfo,
    },
    StreamUpdated {
        stream: StreamInfo,
    },
    StreamEnded {
        stream_id: String,
    },
    StreamNameUpdated {
        stream_id: String,
        name: String,
        stream: StreamInfo,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_info() -> StreamInfo {
        StreamInfo {
            id: "stream-t1-1".into(),
            producer_id: "p1".into(),
            device_id: "dev-A".into(),
            name: "dev-A".into(),
            custom_name: None,
            width: 1280,
            height: 720,
            fps: 30,
            max_bitrate: 1_000_000,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn events_serialize_with_kebab_case_actions() {
        let event = RegistryEvent::DeviceStreamingChanged {
            device_id: "dev-A".into(),
            is_streaming: true,
            stream_id: Some("stream-t1-1".into()),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["action"], "device-streaming-changed");
        assert_eq!(value["is_streaming"], true);

        let event = RegistryEvent::StreamStarted {
            stream: stream_info(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["action"], "stream-started");
        assert_eq!(value["stream"]["id"], "stream-t1-1");
    }

    #[test]
    fn connected_event_omits_absent_device_name() {
        let event = RegistryEvent::DeviceConnected {
            device_id: "dev-A".into(),
            device_name: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert!(value.get("device_name").is_none());
    }
}
