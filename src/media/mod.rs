pub mod codecs;
pub mod egress;
pub mod transport;

use mediasoup::types::data_structures::DtlsState;
use mediasoup::prelude::*;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::sync::OnceLock;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::config::MediaConfig;
use crate::errors::SignalError;
use crate::registry::{Registry, StreamProfile};
use egress::{EgressBinding, EgressPortPool};
use transport::{
    ClosedProducer, CreatedClientTransport, CreatedConsumer, ProducerEntry, SessionMediaState,
    TransportDirection,
};

/// Notification that the SFU closed a client transport (DTLS teardown or
/// failure); the watchdog task runs the owning session's cascade for it.
#[derive(Debug, Clone)]
pub struct TransportClosed {
    pub connection_id: Uuid,
    pub transport_id: String,
}

#[derive(Debug, Clone)]
pub struct ProducedMedia {
    pub producer_id: String,
    pub kind: MediaKind,
    pub transport_id: String,
    pub profile: Option<StreamProfile>,
}

/// Owns the mediasoup worker subprocess and the single routing context, plus
/// all per-session media objects and egress bindings.
pub struct MediaService {
    worker: Worker,
    router: OnceLock<Router>,
    sessions: Mutex<HashMap<Uuid, SessionMediaState>>,
    egress_bindings: Mutex<HashMap<String, EgressBinding>>,
    egress_pool: EgressPortPool,
    webrtc_listen_ip: IpAddr,
    announced_ip: Option<String>,
    egress_listen_ip: IpAddr,
    egress_announced_ip: Option<IpAddr>,
    initial_outgoing_bitrate: u32,
    max_incoming_bitrate: u32,
    video_codecs: Vec<String>,
    closed_tx: mpsc::UnboundedSender<TransportClosed>,
}

impl MediaService {
    pub async fn new(config: &MediaConfig) -> (Self, mpsc::UnboundedReceiver<TransportClosed>) {
        let worker_manager = WorkerManager::new();
        let mut worker_settings = WorkerSettings::default();
        worker_settings.rtc_port_range = config.rtc_min_port..=config.rtc_max_port;

        let worker = worker_manager
            .create_worker(worker_settings)
            .await
            .expect("Failed to create mediasoup worker");

        let worker_id = worker.id();
        worker
            .on_dead(move |reason| {
                // Losing the worker IPC channel is terminal; external
                // orchestration restarts the process.
                tracing::error!(?reason, %worker_id, "mediasoup worker died, exiting");
                std::process::exit(1);
            })
            .detach();

        let webrtc_listen_ip = IpAddr::from_str(&config.webrtc_listen_ip).unwrap_or_else(|error| {
            tracing::warn!(
                "Invalid WEBRTC_LISTEN_IP '{}': {}. Falling back to 127.0.0.1",
                config.webrtc_listen_ip,
                error
            );
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        });

        let egress_listen_ip = IpAddr::from_str(&config.egress_listen_ip).unwrap_or_else(|error| {
            tracing::warn!(
                "Invalid EGRESS_LISTEN_IP '{}': {}. Falling back to 127.0.0.1",
                config.egress_listen_ip,
                error
            );
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        });

        let egress_announced_ip = config.egress_announced_ip.as_deref().and_then(|value| {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return None;
            }
            match IpAddr::from_str(trimmed) {
                Ok(ip) => Some(ip),
                Err(error) => {
                    tracing::warn!(
                        "Invalid EGRESS_ANNOUNCED_IP '{}': {}. Falling back to listen IP",
                        trimmed,
                        error
                    );
                    None
                }
            }
        });

        let egress_pool = EgressPortPool::new(config.egress_min_port, config.egress_max_port);
        tracing::info!(
            pairs = egress_pool.available_pairs(),
            min_port = config.egress_min_port,
            max_port = config.egress_max_port,
            "egress port pool ready"
        );

        let (closed_tx, closed_rx) = mpsc::unbounded_channel();

        let service = MediaService {
            worker,
            router: OnceLock::new(),
            sessions: Mutex::new(HashMap::new()),
            egress_bindings: Mutex::new(HashMap::new()),
            egress_pool,
            webrtc_listen_ip,
            announced_ip: config.announced_ip.clone(),
            egress_listen_ip,
            egress_announced_ip,
            initial_outgoing_bitrate: config.initial_outgoing_bitrate,
            max_incoming_bitrate: config.max_incoming_bitrate,
            video_codecs: config.video_codecs.clone(),
            closed_tx,
        };
        (service, closed_rx)
    }

    /// Creates the routing context. Every media operation fails with
    /// `NotInitialized` until this has completed.
    pub async fn init_router(&self) {
        let codecs = codecs::media_codecs(&self.video_codecs);
        let router = self
            .worker
            .create_router(RouterOptions::new(codecs))
            .await
            .expect("Failed to create media router");
        tracing::info!(router_id = %router.id(), "media router ready");
        let _ = self.router.set(router);
    }

    pub(crate) fn router(&self) -> Result<&Router, SignalError> {
        self.router.get().ok_or(SignalError::NotInitialized)
    }

    pub fn rtp_capabilities(&self) -> Result<RtpCapabilitiesFinalized, SignalError> {
        Ok(self.router()?.rtp_capabilities().clone())
    }

    fn webrtc_listen_info(&self) -> ListenInfo {
        ListenInfo {
            protocol: Protocol::Udp,
            ip: self.webrtc_listen_ip,
            announced_address: self.announced_ip.clone(),
            expose_internal_ip: false,
            port: None,
            port_range: None,
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
        }
    }

    pub(crate) fn egress_listen_info(&self, port: u16) -> ListenInfo {
        ListenInfo {
            protocol: Protocol::Udp,
            ip: self.egress_listen_ip,
            announced_address: self.egress_announced_ip.map(|ip| ip.to_string()),
            expose_internal_ip: false,
            port: Some(port),
            port_range: None,
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
        }
    }

    /// Address the external sink should read RTP from.
    pub(crate) fn egress_target_ip(&self) -> IpAddr {
        if let Some(announced_ip) = self.egress_announced_ip {
            announced_ip
        } else if self.egress_listen_ip.is_unspecified() {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            self.egress_listen_ip
        }
    }

    pub async fn create_client_transport(
        &self,
        connection_id: Uuid,
        direction: TransportDirection,
    ) -> Result<CreatedClientTransport, SignalError> {
        let router = self.router()?.clone();

        let listen_infos = WebRtcTransportListenInfos::new(self.webrtc_listen_info());
        let mut transport_options = WebRtcTransportOptions::new(listen_infos);
        transport_options.initial_available_outgoing_bitrate = self.initial_outgoing_bitrate;

        let transport = router
            .create_webrtc_transport(transport_options)
            .await
            .map_err(|error| {
                tracing::error!(%error, "Failed to create WebRTC transport");
                SignalError::ProduceFailed
            })?;

        if let Err(error) = transport
            .set_max_incoming_bitrate(self.max_incoming_bitrate)
            .await
        {
            tracing::warn!(%error, "Failed to set incoming bitrate ceiling");
        }

        let transport_id = transport.id().to_string();
        {
            let closed_tx = self.closed_tx.clone();
            let watched_id = transport_id.clone();
            transport
                .on_dtls_state_change(move |dtls_state| {
                    if matches!(dtls_state, DtlsState::Closed | DtlsState::Failed) {
                        let _ = closed_tx.send(TransportClosed {
                            connection_id,
                            transport_id: watched_id.clone(),
                        });
                    }
                })
                .detach();
        }

        let created = CreatedClientTransport {
            id: transport_id.clone(),
            ice_parameters: transport.ice_parameters().clone(),
            ice_candidates: transport.ice_candidates().clone(),
            dtls_parameters: transport.dtls_parameters(),
        };

        let mut sessions = self.sessions.lock().await;
        let entry = sessions.entry(connection_id).or_default();
        let replaced = match direction {
            TransportDirection::Send => entry.send_transport_id.replace(transport_id.clone()),
            TransportDirection::Recv => entry.recv_transport_id.replace(transport_id.clone()),
        };
        if let Some(previous_transport_id) = replaced {
            entry.transports.remove(&previous_transport_id);
        }
        entry.transports.insert(transport_id.clone(), transport);

        tracing::debug!(
            connection_id = %connection_id,
            transport_id = %transport_id,
            direction = direction.as_str(),
            "client transport created"
        );
        Ok(created)
    }

    pub async fn connect_client_transport(
        &self,
        connection_id: Uuid,
        transport_id: &str,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), SignalError> {
        let transport = {
            let sessions = self.sessions.lock().await;
            let entry = sessions
                .get(&connection_id)
                .ok_or(SignalError::UnknownTransport)?;
            entry
                .transports
                .get(transport_id)
                .cloned()
                .ok_or(SignalError::UnknownTransport)?
        };

        transport
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(|error| {
                tracing::warn!(%error, transport_id, "Failed to connect WebRTC transport");
                SignalError::ProduceFailed
            })
    }

    pub async fn produce(
        &self,
        connection_id: Uuid,
        transport_id: &str,
        device_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducedMedia, SignalError> {
        let transport = {
            let sessions = self.sessions.lock().await;
            let entry = sessions
                .get(&connection_id)
                .ok_or(SignalError::UnknownTransport)?;
            if entry.send_transport_id.as_deref() != Some(transport_id) {
                return Err(SignalError::UnknownTransport);
            }
            entry
                .transports
                .get(transport_id)
                .cloned()
                .ok_or(SignalError::UnknownTransport)?
        };

        let profile =
            (kind == MediaKind::Video).then(|| transport::stream_profile_from_parameters(&rtp_parameters));

        let producer = transport
            .produce(ProducerOptions::new(kind, rtp_parameters))
            .await
            .map_err(|error| {
                tracing::warn!(%error, "SFU rejected producer RTP parameters");
                SignalError::ProduceFailed
            })?;

        let producer_id = producer.id().to_string();
        {
            let mut sessions = self.sessions.lock().await;
            let entry = sessions
                .get_mut(&connection_id)
                .ok_or(SignalError::ProducerClosed)?;
            entry.producers.insert(
                producer_id.clone(),
                ProducerEntry {
                    producer,
                    kind,
                    device_id: device_id.to_string(),
                    transport_id: transport_id.to_string(),
                },
            );
        }

        tracing::debug!(
            connection_id = %connection_id,
            producer_id = %producer_id,
            device_id = %device_id,
            kind = transport::media_kind_as_str(kind),
            "producer bound"
        );
        Ok(ProducedMedia {
            producer_id,
            kind,
            transport_id: transport_id.to_string(),
            profile,
        })
    }

    pub async fn consume(
        &self,
        connection_id: Uuid,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<CreatedConsumer, SignalError> {
        let producer_id = producer_id
            .parse::<ProducerId>()
            .map_err(|_| SignalError::UnknownProducer)?;

        let transport = {
            let sessions = self.sessions.lock().await;
            let entry = sessions
                .get(&connection_id)
                .ok_or(SignalError::UnknownTransport)?;
            if entry.recv_transport_id.as_deref() != Some(transport_id) {
                return Err(SignalError::UnknownTransport);
            }
            entry
                .transports
                .get(transport_id)
                .cloned()
                .ok_or(SignalError::UnknownTransport)?
        };

        if self.find_producer(&producer_id.to_string()).await.is_none() {
            return Err(SignalError::UnknownProducer);
        }

        let router = self.router()?;
        if !router.can_consume(&producer_id, &rtp_capabilities) {
            return Err(SignalError::UnsupportedCapabilities);
        }

        // Paused until the consuming endpoint is ready, resumed explicitly.
        let mut consumer_options = ConsumerOptions::new(producer_id, rtp_capabilities);
        consumer_options.paused = true;

        let consumer = transport.consume(consumer_options).await.map_err(|error| {
            tracing::warn!(%error, "Failed to create consumer");
            SignalError::UnsupportedCapabilities
        })?;

        let created = CreatedConsumer {
            id: consumer.id().to_string(),
            producer_id: consumer.producer_id().to_string(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters().clone(),
        };

        let mut sessions = self.sessions.lock().await;
        let entry = sessions
            .get_mut(&connection_id)
            .ok_or(SignalError::ProducerClosed)?;
        entry.consumers.insert(created.id.clone(), consumer);

        Ok(created)
    }

    pub async fn resume_consumer(
        &self,
        connection_id: Uuid,
        consumer_id: &str,
    ) -> Result<(), SignalError> {
        let consumer = {
            let sessions = self.sessions.lock().await;
            let entry = sessions
                .get(&connection_id)
                .ok_or(SignalError::ProtocolOrder)?;
            entry
                .consumers
                .get(consumer_id)
                .cloned()
                .ok_or(SignalError::ProtocolOrder)?
        };

        consumer.resume().await.map_err(|error| {
            tracing::warn!(%error, consumer_id, "Failed to resume consumer");
            SignalError::ProduceFailed
        })
    }

    pub(crate) async fn find_producer(&self, producer_id: &str) -> Option<Producer> {
        let sessions = self.sessions.lock().await;
        sessions.values().find_map(|entry| {
            entry
                .producers
                .get(producer_id)
                .map(|owned| owned.producer.clone())
        })
    }

    /// Full close cascade for one producer: the egress binding is destroyed
    /// first, then the stream record (emitting `stream-ended`), then the
    /// producer itself.
    pub async fn close_producer_cascade(
        &self,
        producer_id: &str,
        registry: &Registry,
        emit_streaming_changed: bool,
    ) -> Result<ClosedProducer, SignalError> {
        self.close_egress_binding(producer_id).await;

        let removed = {
            let mut sessions = self.sessions.lock().await;
            let mut found = None;
            for entry in sessions.values_mut() {
                if let Some(owned) = entry.producers.remove(producer_id) {
                    found = Some(owned);
                    break;
                }
            }
            found
        }
        .ok_or(SignalError::UnknownProducer)?;

        if removed.kind == MediaKind::Video {
            registry.end_stream_for_producer(producer_id, emit_streaming_changed);
        }

        Ok(ClosedProducer {
            producer_id: producer_id.to_string(),
            device_id: removed.device_id.clone(),
            kind: removed.kind,
        })
    }

    /// Drops a producer displaced by a replacement on the same transport.
    /// The stream record has already been rebound, so no events fire.
    pub async fn close_replaced_producer(&self, producer_id: &str) {
        self.close_egress_binding(producer_id).await;
        let mut sessions = self.sessions.lock().await;
        for entry in sessions.values_mut() {
            if entry.producers.remove(producer_id).is_some() {
                tracing::debug!(producer_id, "replaced producer closed");
                return;
            }
        }
    }

    /// Session-close cascade: tears down every producer the session owns
    /// (egress bindings first), then drops all media objects.
    pub async fn cleanup_connection(
        &self,
        connection_id: Uuid,
        registry: &Registry,
    ) -> Vec<ClosedProducer> {
        let removed = {
            let mut sessions = self.sessions.lock().await;
            sessions.remove(&connection_id)
        };
        let Some(state) = removed else {
            return Vec::new();
        };

        let mut closed = Vec::new();
        for (producer_id, owned) in &state.producers {
            self.close_egress_binding(producer_id).await;
            if owned.kind == MediaKind::Video {
                registry.end_stream_for_producer(producer_id, false);
            }
            closed.push(ClosedProducer {
                producer_id: producer_id.clone(),
                device_id: owned.device_id.clone(),
                kind: owned.kind,
            });
        }

        // Dropping the state closes transports, producers and consumers.
        drop(state);
        closed
    }

    /// Same cascade as a session close, scoped to one transport (SFU-side
    /// DTLS teardown).
    pub async fn close_transport_cascade(
        &self,
        connection_id: Uuid,
        transport_id: &str,
        registry: &Registry,
    ) -> Vec<ClosedProducer> {
        let removed_producers = {
            let mut sessions = self.sessions.lock().await;
            let Some(entry) = sessions.get_mut(&connection_id) else {
                return Vec::new();
            };
            if entry.transports.remove(transport_id).is_none() {
                return Vec::new();
            }
            if entry.send_transport_id.as_deref() == Some(transport_id) {
                entry.send_transport_id = None;
            }
            if entry.recv_transport_id.as_deref() == Some(transport_id) {
                entry.recv_transport_id = None;
            }

            let owned_ids: Vec<String> = entry
                .producers
                .iter()
                .filter(|(_, owned)| owned.transport_id == transport_id)
                .map(|(id, _)| id.clone())
                .collect();
            owned_ids
                .into_iter()
                .filter_map(|id| entry.producers.remove(&id).map(|owned| (id, owned)))
                .collect::<Vec<_>>()
        };

        let mut closed = Vec::new();
        for (producer_id, owned) in removed_producers {
            self.close_egress_binding(&producer_id).await;
            if owned.kind == MediaKind::Video {
                registry.end_stream_for_producer(&producer_id, false);
            }
            closed.push(ClosedProducer {
                producer_id,
                device_id: owned.device_id.clone(),
                kind: owned.kind,
            });
        }
        closed
    }
}

/// Drains SFU-side transport closures and runs the session cascade for each.
pub async fn run_transport_watchdog(
    media: std::sync::Arc<MediaService>,
    registry: Registry,
    mut closed_rx: mpsc::UnboundedReceiver<TransportClosed>,
) {
    while let Some(notice) = closed_rx.recv().await {
        tracing::info!(
            connection_id = %notice.connection_id,
            transport_id = %notice.transport_id,
            "transport closed by SFU, cleaning up"
        );
        media
            .close_transport_cascade(notice.connection_id, &notice.transport_id, &registry)
            .await;
    }
}
