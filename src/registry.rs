use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::errors::SignalError;
use crate::events::{RegistryEvent, StreamInfo};
use crate::telemetry::Telemetry;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Nominal parameters of a published video stream, derived from the
/// producer's RTP parameters by the media layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamProfile {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub max_bitrate: u32,
}

impl Default for StreamProfile {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30,
            max_bitrate: 1_000_000,
        }
    }
}

#[derive(Debug)]
struct DeviceRecord {
    name: Option<String>,
    session_id: Option<Uuid>,
    connected: bool,
    streaming: bool,
    stream_id: Option<String>,
    last_seen: DateTime<Utc>,
    // Cancellation handle for the deferred-removal task, never the timer
    // itself.
    removal: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct StreamRecord {
    id: String,
    producer_id: String,
    device_id: String,
    transport_id: String,
    device_name: Option<String>,
    custom_name: Option<String>,
    profile: StreamProfile,
    created_at: DateTime<Utc>,
}

impl StreamRecord {
    fn info(&self) -> StreamInfo {
        let name = self
            .custom_name
            .clone()
            .or_else(|| self.device_name.clone())
            .unwrap_or_else(|| self.device_id.clone());
        StreamInfo {
            id: self.id.clone(),
            producer_id: self.producer_id.clone(),
            device_id: self.device_id.clone(),
            name,
            custom_name: self.custom_name.clone(),
            width: self.profile.width,
            height: self.profile.height,
            fps: self.profile.fps,
            max_bitrate: self.profile.max_bitrate,
            created_at: self.created_at,
        }
    }
}

#[derive(Default)]
struct State {
    devices: HashMap<String, DeviceRecord>,
    streams: HashMap<String, StreamRecord>,
    device_by_session: HashMap<Uuid, String>,
    stream_by_producer: HashMap<String, String>,
    stream_by_transport: HashMap<String, String>,
}

/// Authoritative mapping between device identities, sessions, producers and
/// streams. All mutations serialize behind one mutex and lifecycle events
/// are published while it is held, so observers see them in commit order.
#[derive(Clone)]
pub struct Registry {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    event_tx: broadcast::Sender<RegistryEvent>,
    grace: Duration,
    telemetry: Arc<Telemetry>,
}

impl Registry {
    pub fn new(grace: Duration, telemetry: Arc<Telemetry>) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                event_tx,
                grace,
                telemetry,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.shared.event_tx.subscribe()
    }

    fn emit(&self, event: RegistryEvent) {
        // Nobody listening is fine, broadcast just reports zero receivers.
        let _ = self.shared.event_tx.send(event);
    }

    /// Binds a session to a device identity, creating the device on first
    /// sight. Re-registration is idempotent; registering from a new session
    /// transfers the binding and cancels any pending removal. The stored
    /// device name is preserved when the registration omits one.
    pub fn register_device(
        &self,
        session_id: Uuid,
        device_id: &str,
        device_name: Option<String>,
    ) {
        let mut state = self.shared.state.lock().expect("registry lock poisoned");

        if let Some(previous) = state.device_by_session.get(&session_id).cloned() {
            if previous != device_id {
                // The session re-registered as a different device; release
                // the old identity as if the session had closed.
                self.disconnect_device_locked(&mut state, &previous, session_id);
            }
        }

        let now = Utc::now();
        let device = state
            .devices
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceRecord {
                name: None,
                session_id: None,
                connected: false,
                streaming: false,
                stream_id: None,
                last_seen: now,
                removal: None,
            });

        if let Some(handle) = device.removal.take() {
            handle.abort();
        }

        let was_connected = device.connected;
        let old_session = device.session_id.replace(session_id);
        if device_name.is_some() {
            device.name = device_name;
        }
        device.connected = true;
        device.last_seen = now;
        let effective_name = device.name.clone();

        if let Some(old) = old_session {
            if old != session_id {
                state.device_by_session.remove(&old);
            }
        }
        state
            .device_by_session
            .insert(session_id, device_id.to_string());

        if !was_connected {
            tracing::debug!(device_id = %device_id, session_id = %session_id, "device connected");
            self.emit(RegistryEvent::DeviceConnected {
                device_id: device_id.to_string(),
                device_name: effective_name,
            });
        }
    }

    /// Marks the device bound to this session as disconnected and starts
    /// the removal grace window. No-op when the device has already been
    /// rebound to a newer session.
    pub fn mark_disconnected(&self, session_id: Uuid) -> Option<String> {
        let mut state = self.shared.state.lock().expect("registry lock poisoned");
        let device_id = state.device_by_session.get(&session_id).cloned()?;
        self.disconnect_device_locked(&mut state, &device_id, session_id);
        Some(device_id)
    }

    fn disconnect_device_locked(&self, state: &mut State, device_id: &str, session_id: Uuid) {
        let Some(device) = state.devices.get_mut(device_id) else {
            state.device_by_session.remove(&session_id);
            return;
        };
        if device.session_id != Some(session_id) {
            return;
        }

        state.device_by_session.remove(&session_id);
        device.session_id = None;
        device.connected = false;
        device.last_seen = Utc::now();

        if let Some(handle) = device.removal.take() {
            handle.abort();
        }
        let registry = self.clone();
        let id = device_id.to_string();
        let grace = self.shared.grace;
        device.removal = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            registry.reap(&id);
        }));

        tracing::debug!(device_id = %device_id, "device disconnected, removal scheduled");
        self.emit(RegistryEvent::DeviceDisconnected {
            device_id: device_id.to_string(),
        });
    }

    /// Deletes a device whose grace window elapsed without reconnection.
    fn reap(&self, device_id: &str) {
        let mut state = self.shared.state.lock().expect("registry lock poisoned");
        let Some(device) = state.devices.get_mut(device_id) else {
            return;
        };
        if device.connected || device.streaming {
            device.removal = None;
            return;
        }

        state.devices.remove(device_id);
        tracing::info!(device_id = %device_id, "device removed after grace window");
        self.shared.telemetry.inc_devices_reaped();
        self.emit(RegistryEvent::DeviceRemoved {
            device_id: device_id.to_string(),
        });
    }

    /// Creates the stream record for a video producer, or updates the
    /// existing record in place when the client transport already carries
    /// one (producer replacement after a client-side restart). Returns the
    /// stream view plus the id of the producer that was displaced, if any.
    pub fn upsert_stream(
        &self,
        device_id: &str,
        transport_id: &str,
        producer_id: &str,
        profile: StreamProfile,
    ) -> (StreamInfo, Option<String>) {
        let mut state = self.shared.state.lock().expect("registry lock poisoned");
        let now = Utc::now();

        // A produce during the grace window keeps the device alive.
        let device_name = match state.devices.get_mut(device_id) {
            Some(device) => {
                if let Some(handle) = device.removal.take() {
                    handle.abort();
                }
                device.last_seen = now;
                device.name.clone()
            }
            None => None,
        };

        let existing = state.stream_by_transport.get(transport_id).cloned();
        if let Some(stream_id) = existing {
            if let Some(stream) = state.streams.get_mut(&stream_id) {
                let replaced = (stream.producer_id != producer_id)
                    .then(|| stream.producer_id.clone());
                let old_producer = stream.producer_id.clone();
                stream.producer_id = producer_id.to_string();
                stream.device_name = device_name;
                stream.profile = profile;
                stream.created_at = now;
                let info = stream.info();

                state.stream_by_producer.remove(&old_producer);
                state
                    .stream_by_producer
                    .insert(producer_id.to_string(), stream_id.clone());
                self.set_streaming_locked(&mut state, device_id, &stream_id);

                self.emit(RegistryEvent::StreamUpdated {
                    stream: info.clone(),
                });
                self.emit(RegistryEvent::DeviceStreamingChanged {
                    device_id: device_id.to_string(),
                    is_streaming: true,
                    stream_id: Some(stream_id),
                });
                return (info, replaced);
            }
        }

        let stream_id = format!("stream-{}-{}", transport_id, now.timestamp_millis());
        let record = StreamRecord {
            id: stream_id.clone(),
            producer_id: producer_id.to_string(),
            device_id: device_id.to_string(),
            transport_id: transport_id.to_string(),
            device_name,
            custom_name: None,
            profile,
            created_at: now,
        };
        let info = record.info();

        state.streams.insert(stream_id.clone(), record);
        state
            .stream_by_producer
            .insert(producer_id.to_string(), stream_id.clone());
        state
            .stream_by_transport
            .insert(transport_id.to_string(), stream_id.clone());
        self.set_streaming_locked(&mut state, device_id, &stream_id);

        tracing::debug!(device_id = %device_id, stream_id = %stream_id, "stream started");
        self.emit(RegistryEvent::StreamStarted {
            stream: info.clone(),
        });
        self.emit(RegistryEvent::DeviceStreamingChanged {
            device_id: device_id.to_string(),
            is_streaming: true,
            stream_id: Some(stream_id),
        });
        (info, None)
    }

    fn set_streaming_locked(&self, state: &mut State, device_id: &str, stream_id: &str) {
        if let Some(device) = state.devices.get_mut(device_id) {
            device.streaming = true;
            device.stream_id = Some(stream_id.to_string());
        }
    }

    /// Advisory stop: flips the streaming flag without touching the
    /// producer or the stream record.
    pub fn stop_streaming(&self, session_id: Uuid) -> Result<(), SignalError> {
        let mut state = self.shared.state.lock().expect("registry lock poisoned");
        let device_id = state
            .device_by_session
            .get(&session_id)
            .cloned()
            .ok_or(SignalError::ProtocolOrder)?;
        let device = state
            .devices
            .get_mut(&device_id)
            .ok_or(SignalError::ProtocolOrder)?;

        device.streaming = false;
        device.stream_id = None;
        self.emit(RegistryEvent::DeviceStreamingChanged {
            device_id,
            is_streaming: false,
            stream_id: None,
        });
        Ok(())
    }

    /// Removes the stream owned by a closing video producer. Emits
    /// `stream-ended`; the streaming flag is cleared silently unless
    /// `emit_streaming_changed` is set (operator-driven disconnects, where
    /// the device socket stays alive).
    pub fn end_stream_for_producer(
        &self,
        producer_id: &str,
        emit_streaming_changed: bool,
    ) -> Option<StreamInfo> {
        let mut state = self.shared.state.lock().expect("registry lock poisoned");
        let stream_id = state.stream_by_producer.remove(producer_id)?;
        let stream = state.streams.remove(&stream_id)?;
        state.stream_by_transport.remove(&stream.transport_id);
        let info = stream.info();

        let mut device_known = false;
        if let Some(device) = state.devices.get_mut(&stream.device_id) {
            device_known = true;
            device.streaming = false;
            if device.stream_id.as_deref() == Some(stream_id.as_str()) {
                device.stream_id = None;
            }
        }

        tracing::debug!(stream_id = %stream_id, producer_id = %producer_id, "stream ended");
        self.emit(RegistryEvent::StreamEnded {
            stream_id: stream_id.clone(),
        });
        if emit_streaming_changed && device_known {
            self.emit(RegistryEvent::DeviceStreamingChanged {
                device_id: stream.device_id.clone(),
                is_streaming: false,
                stream_id: None,
            });
        }
        Some(info)
    }

    /// Operator rename. The override survives producer replacement on the
    /// same transport.
    pub fn rename_stream(&self, stream_id: &str, name: &str) -> Result<StreamInfo, SignalError> {
        let mut state = self.shared.state.lock().expect("registry lock poisoned");
        let stream = state
            .streams
            .get_mut(stream_id)
            .ok_or(SignalError::UnknownStream)?;
        stream.custom_name = Some(name.to_string());
        let info = stream.info();

        self.emit(RegistryEvent::StreamNameUpdated {
            stream_id: stream_id.to_string(),
            name: name.to_string(),
            stream: info.clone(),
        });
        Ok(info)
    }

    pub fn active_streams(&self) -> Vec<StreamInfo> {
        let state = self.shared.state.lock().expect("registry lock poisoned");
        let mut streams: Vec<StreamInfo> = state.streams.values().map(StreamRecord::info).collect();
        streams.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        streams
    }

    pub fn stream(&self, stream_id: &str) -> Option<StreamInfo> {
        let state = self.shared.state.lock().expect("registry lock poisoned");
        state.streams.get(stream_id).map(StreamRecord::info)
    }

    pub fn stream_for_producer(&self, producer_id: &str) -> Option<StreamInfo> {
        let state = self.shared.state.lock().expect("registry lock poisoned");
        let stream_id = state.stream_by_producer.get(producer_id)?;
        state.streams.get(stream_id).map(StreamRecord::info)
    }

    pub fn device_for_session(&self, session_id: Uuid) -> Option<String> {
        let state = self.shared.state.lock().expect("registry lock poisoned");
        state.device_by_session.get(&session_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    fn registry() -> Registry {
        Registry::new(Duration::from_secs(30), Arc::new(Telemetry::default()))
    }

    fn drain(rx: &mut broadcast::Receiver<RegistryEvent>) -> Vec<RegistryEvent> {
        let mut events = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                Err(TryRecvError::Lagged(_)) => continue,
            }
        }
        events
    }

    fn action(event: &RegistryEvent) -> &'static str {
        match event {
            RegistryEvent::DeviceConnected { .. } => "device-connected",
            RegistryEvent::DeviceDisconnected { .. } => "device-disconnected",
            RegistryEvent::DeviceRemoved { .. } => "device-removed",
            RegistryEvent::DeviceStreamingChanged { .. } => "device-streaming-changed",
            RegistryEvent::StreamStarted { .. } => "stream-started",
            RegistryEvent::StreamUpdated { .. } => "stream-updated",
            RegistryEvent::StreamEnded { .. } => "stream-ended",
            RegistryEvent::StreamNameUpdated { .. } => "stream-name-updated",
        }
    }

    async fn let_timers_run() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn duplicate_registration_is_idempotent() {
        let registry = registry();
        let mut rx = registry.subscribe();
        let session = Uuid::new_v4();

        registry.register_device(session, "dev-A", Some("Phone".into()));
        registry.register_device(session, "dev-A", None);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1, "re-registration must not re-announce");
        match &events[0] {
            RegistryEvent::DeviceConnected {
                device_id,
                device_name,
            } => {
                assert_eq!(device_id, "dev-A");
                assert_eq!(device_name.as_deref(), Some("Phone"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn grace_expiry_removes_device_exactly_once() {
        let registry = registry();
        let mut rx = registry.subscribe();
        let session = Uuid::new_v4();

        registry.register_device(session, "dev-A", None);
        registry.mark_disconnected(session);
        let_timers_run().await;

        tokio::time::advance(Duration::from_secs(31)).await;
        let_timers_run().await;
        tokio::time::advance(Duration::from_secs(60)).await;
        let_timers_run().await;

        let events = drain(&mut rx);
        let actions: Vec<_> = events.iter().map(action).collect();
        assert_eq!(
            actions,
            vec!["device-connected", "device-disconnected", "device-removed"]
        );
        assert!(registry.device_for_session(session).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn reregistration_within_grace_cancels_removal() {
        let registry = registry();
        let mut rx = registry.subscribe();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        registry.register_device(first, "dev-A", None);
        registry.mark_disconnected(first);
        let_timers_run().await;

        tokio::time::advance(Duration::from_secs(10)).await;
        registry.register_device(second, "dev-A", None);

        tokio::time::advance(Duration::from_secs(60)).await;
        let_timers_run().await;

        let actions: Vec<_> = drain(&mut rx).iter().map(action).collect();
        assert_eq!(
            actions,
            vec![
                "device-connected",
                "device-disconnected",
                "device-connected"
            ]
        );
    }

    #[tokio::test]
    async fn stream_lifecycle_emits_started_then_updated() {
        let registry = registry();
        let mut rx = registry.subscribe();
        let session = Uuid::new_v4();

        registry.register_device(session, "dev-A", Some("Phone".into()));
        let (info, replaced) =
            registry.upsert_stream("dev-A", "T1", "P1", StreamProfile::default());
        assert!(replaced.is_none());
        assert!(info.id.starts_with("stream-T1-"));
        assert_eq!(info.name, "Phone");

        registry.rename_stream(&info.id, "CAM-LEFT").unwrap();

        // Producer replacement over the same transport keeps the id and the
        // operator label.
        let (updated, replaced) =
            registry.upsert_stream("dev-A", "T1", "P2", StreamProfile::default());
        assert_eq!(replaced.as_deref(), Some("P1"));
        assert_eq!(updated.id, info.id);
        assert_eq!(updated.custom_name.as_deref(), Some("CAM-LEFT"));
        assert_eq!(updated.name, "CAM-LEFT");
        assert_eq!(updated.producer_id, "P2");

        let actions: Vec<_> = drain(&mut rx).iter().map(action).collect();
        assert_eq!(
            actions,
            vec![
                "device-connected",
                "stream-started",
                "device-streaming-changed",
                "stream-name-updated",
                "stream-updated",
                "device-streaming-changed"
            ]
        );

        assert!(registry.stream_for_producer("P1").is_none());
        assert_eq!(
            registry.stream_for_producer("P2").map(|s| s.id),
            Some(info.id)
        );
    }

    #[tokio::test]
    async fn rename_round_trips_through_active_streams() {
        let registry = registry();
        let session = Uuid::new_v4();
        registry.register_device(session, "dev-A", None);
        let (info, _) = registry.upsert_stream("dev-A", "T1", "P1", StreamProfile::default());

        registry.rename_stream(&info.id, "CAM-LEFT").unwrap();

        let listed = registry.active_streams();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "CAM-LEFT");

        assert_eq!(
            registry.rename_stream("stream-missing-0", "X").unwrap_err(),
            SignalError::UnknownStream
        );
    }

    #[tokio::test]
    async fn stop_streaming_is_advisory() {
        let registry = registry();
        let mut rx = registry.subscribe();
        let session = Uuid::new_v4();
        registry.register_device(session, "dev-A", None);
        registry.upsert_stream("dev-A", "T1", "P1", StreamProfile::default());
        drain(&mut rx);

        registry.stop_streaming(session).unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            RegistryEvent::DeviceStreamingChanged {
                is_streaming,
                stream_id,
                ..
            } => {
                assert!(!is_streaming);
                assert!(stream_id.is_none());
            }
            other => panic!("unexpected event {other:?}"),
        }
        // The stream itself is still listed.
        assert_eq!(registry.active_streams().len(), 1);
    }

    #[tokio::test]
    async fn stop_streaming_requires_a_bound_device() {
        let registry = registry();
        assert_eq!(
            registry.stop_streaming(Uuid::new_v4()).unwrap_err(),
            SignalError::ProtocolOrder
        );
    }

    #[tokio::test(start_paused = true)]
    async fn full_device_trace_is_ordered() {
        let registry = registry();
        let mut rx = registry.subscribe();
        let session = Uuid::new_v4();

        registry.register_device(session, "dev-A", None);
        let (info, _) = registry.upsert_stream("dev-A", "T1", "P1", StreamProfile::default());

        // Session close cascade: stream ends first, then the disconnect.
        registry.end_stream_for_producer("P1", false);
        registry.mark_disconnected(session);
        let_timers_run().await;
        tokio::time::advance(Duration::from_secs(31)).await;
        let_timers_run().await;

        let actions: Vec<_> = drain(&mut rx).iter().map(action).collect();
        assert_eq!(
            actions,
            vec![
                "device-connected",
                "stream-started",
                "device-streaming-changed",
                "stream-ended",
                "device-disconnected",
                "device-removed"
            ]
        );
        assert!(registry.stream(&info.id).is_none());
        assert!(registry.active_streams().is_empty());
    }

    #[tokio::test]
    async fn operator_disconnect_announces_streaming_change() {
        let registry = registry();
        let mut rx = registry.subscribe();
        let session = Uuid::new_v4();
        registry.register_device(session, "dev-A", None);
        registry.upsert_stream("dev-A", "T1", "P1", StreamProfile::default());
        drain(&mut rx);

        registry.end_stream_for_producer("P1", true);

        let actions: Vec<_> = drain(&mut rx).iter().map(action).collect();
        assert_eq!(actions, vec!["stream-ended", "device-streaming-changed"]);
    }
}
