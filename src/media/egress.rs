use chrono::{DateTime, Utc};
use mediasoup::prelude::{
    Consumer, ConsumerOptions, PlainTransport, PlainTransportOptions, ProducerId, RtpCapabilities,
    RtpParameters, Transport,
};
use serde::Serialize;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Mutex;

use super::MediaService;
use crate::errors::SignalError;
use crate::events::StreamInfo;

/// One RTP/RTCP port pair from the egress pool. RTP lands on the even port,
/// RTCP on the odd one right above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortPair {
    pub rtp: u16,
    pub rtcp: u16,
}

/// Fixed pool of UDP port pairs for plain egress transports. Allocation
/// hands out the lowest free pair so a re-created binding lands on a
/// predictable tuple; release is idempotent.
#[derive(Debug)]
pub struct EgressPortPool {
    free: Mutex<BTreeSet<u16>>,
}

impl EgressPortPool {
    pub fn new(min_port: u16, max_port: u16) -> Self {
        let mut free = BTreeSet::new();
        let mut port = if min_port % 2 == 0 { min_port } else { min_port + 1 };
        while port < max_port {
            free.insert(port);
            port = match port.checked_add(2) {
                Some(next) => next,
                None => break,
            };
        }
        Self {
            free: Mutex::new(free),
        }
    }

    pub fn allocate(&self) -> Option<PortPair> {
        let mut free = self.free.lock().expect("egress pool lock poisoned");
        let rtp = free.iter().next().copied()?;
        free.remove(&rtp);
        Some(PortPair { rtp, rtcp: rtp + 1 })
    }

    pub fn release(&self, pair: PortPair) {
        let mut free = self.free.lock().expect("egress pool lock poisoned");
        free.insert(pair.rtp);
    }

    pub fn available_pairs(&self) -> usize {
        self.free.lock().expect("egress pool lock poisoned").len()
    }
}

/// A live pairing of one producer with its plain egress transport. Dropping
/// the binding closes the transport and the consumer.
#[derive(Debug)]
pub(crate) struct EgressBinding {
    pub transport: PlainTransport,
    pub consumer: Consumer,
    pub ports: PortPair,
    pub stream_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EgressTransportTuple {
    pub id: String,
    pub ip: IpAddr,
    pub port: u16,
    pub rtcp_port: u16,
    pub protocol: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct EgressStreamMetadata {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub device_name: String,
}

/// Bridge reply: everything the sink needs to read the flow without WebRTC.
/// The SSRC and payload type inside `rtp_parameters` match the emitted RTP
/// byte for byte.
#[derive(Debug, Clone, Serialize)]
pub struct EgressReply {
    pub consumer_id: String,
    pub transport: EgressTransportTuple,
    pub rtp_parameters: RtpParameters,
    pub stream: EgressStreamMetadata,
}

/// Read-only admin view of one egress binding.
#[derive(Debug, Clone, Serialize)]
pub struct PlainTransportView {
    pub transport_id: String,
    pub producer_id: String,
    pub stream_id: String,
    pub ip: IpAddr,
    pub port: u16,
    pub rtcp_port: u16,
    pub created_at: DateTime<Utc>,
}

impl MediaService {
    /// Materializes (or returns) the plain RTP egress for one producer.
    ///
    /// Idempotent per producer: a repeated request returns the original
    /// tuple for the lifetime of the binding. Port acquisition either
    /// succeeds fully or releases what it took before failing.
    pub async fn consume_for_bridge(
        &self,
        stream: &StreamInfo,
        producer_id: &str,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<EgressReply, SignalError> {
        let router = self.router()?.clone();

        if stream.producer_id != producer_id {
            return Err(SignalError::UnknownProducer);
        }
        let parsed_producer_id = producer_id
            .parse::<ProducerId>()
            .map_err(|_| SignalError::UnknownProducer)?;
        if self.find_producer(producer_id).await.is_none() {
            return Err(SignalError::UnknownProducer);
        }

        {
            let bindings = self.egress_bindings.lock().await;
            if let Some(existing) = bindings.get(producer_id) {
                return Ok(self.egress_reply(existing, stream));
            }
        }

        let Some(ports) = self.egress_pool.allocate() else {
            tracing::warn!(producer_id, "egress port pool exhausted");
            return Err(SignalError::EgressPortsExhausted);
        };

        let mut transport_options = PlainTransportOptions::new(self.egress_listen_info(ports.rtp));
        transport_options.rtcp_listen_info = Some(self.egress_listen_info(ports.rtcp));
        transport_options.rtcp_mux = false;
        transport_options.comedia = true;

        let transport = match router.create_plain_transport(transport_options).await {
            Ok(transport) => transport,
            Err(error) => {
                tracing::error!(%error, rtp_port = ports.rtp, "Failed to create egress transport");
                self.egress_pool.release(ports);
                return Err(SignalError::EgressPortsExhausted);
            }
        };

        if !router.can_consume(&parsed_producer_id, &rtp_capabilities) {
            self.egress_pool.release(ports);
            return Err(SignalError::UnsupportedCapabilities);
        }

        // Unpaused from the start: the sink just reads the flow, there is
        // no client-side consumer to synchronize with.
        let consumer_options = ConsumerOptions::new(parsed_producer_id, rtp_capabilities);
        let consumer = match transport.consume(consumer_options).await {
            Ok(consumer) => consumer,
            Err(error) => {
                tracing::warn!(%error, producer_id, "Failed to create egress consumer");
                self.egress_pool.release(ports);
                return Err(SignalError::UnsupportedCapabilities);
            }
        };

        if self.find_producer(producer_id).await.is_none() {
            // Producer closed while we were negotiating with the worker.
            self.egress_pool.release(ports);
            return Err(SignalError::ProducerClosed);
        }

        let binding = EgressBinding {
            transport,
            consumer,
            ports,
            stream_id: stream.id.clone(),
            created_at: Utc::now(),
        };
        let reply = self.egress_reply(&binding, stream);

        {
            let mut bindings = self.egress_bindings.lock().await;
            if let Some(existing) = bindings.get(producer_id) {
                // Lost a race with a concurrent bridge request; keep the
                // established binding and give back our ports.
                let existing_reply = self.egress_reply(existing, stream);
                drop(bindings);
                drop(binding);
                self.egress_pool.release(ports);
                return Ok(existing_reply);
            }
            bindings.insert(producer_id.to_string(), binding);
        }

        tracing::info!(
            producer_id,
            stream_id = %stream.id,
            rtp_port = ports.rtp,
            rtcp_port = ports.rtcp,
            "egress binding created"
        );
        Ok(reply)
    }

    fn egress_reply(&self, binding: &EgressBinding, stream: &StreamInfo) -> EgressReply {
        EgressReply {
            consumer_id: binding.consumer.id().to_string(),
            transport: EgressTransportTuple {
                id: binding.transport.id().to_string(),
                ip: self.egress_target_ip(),
                port: binding.ports.rtp,
                rtcp_port: binding.ports.rtcp,
                protocol: "udp",
            },
            rtp_parameters: binding.consumer.rtp_parameters().clone(),
            stream: EgressStreamMetadata {
                width: stream.width,
                height: stream.height,
                fps: stream.fps,
                device_name: stream.name.clone(),
            },
        }
    }

    /// Destroys the egress binding of a closing producer and returns its
    /// ports to the pool. Idempotent.
    pub(crate) async fn close_egress_binding(&self, producer_id: &str) {
        let removed = {
            let mut bindings = self.egress_bindings.lock().await;
            bindings.remove(producer_id)
        };
        if let Some(binding) = removed {
            let ports = binding.ports;
            tracing::debug!(
                producer_id,
                stream_id = %binding.stream_id,
                rtp_port = ports.rtp,
                "egress binding closed"
            );
            drop(binding);
            self.egress_pool.release(ports);
        }
    }

    pub async fn plain_transport_views(&self) -> Vec<PlainTransportView> {
        let bindings = self.egress_bindings.lock().await;
        let mut views: Vec<PlainTransportView> = bindings
            .iter()
            .map(|(producer_id, binding)| PlainTransportView {
                transport_id: binding.transport.id().to_string(),
                producer_id: producer_id.clone(),
                stream_id: binding.stream_id.clone(),
                ip: self.egress_target_ip(),
                port: binding.ports.rtp,
                rtcp_port: binding.ports.rtcp,
                created_at: binding.created_at,
            })
            .collect();
        views.sort_by(|a, b| a.port.cmp(&b.port));
        views
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_hands_out_even_odd_pairs_lowest_first() {
        let pool = EgressPortPool::new(20000, 20100);
        assert_eq!(pool.available_pairs(), 50);

        let first = pool.allocate().unwrap();
        assert_eq!(first, PortPair { rtp: 20000, rtcp: 20001 });
        let second = pool.allocate().unwrap();
        assert_eq!(second, PortPair { rtp: 20002, rtcp: 20003 });
    }

    #[test]
    fn exhausted_pool_fails_until_release() {
        let pool = EgressPortPool::new(30000, 30003);
        assert_eq!(pool.available_pairs(), 2);

        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert!(pool.allocate().is_none());

        pool.release(a);
        assert_eq!(pool.allocate().unwrap(), a);
        assert!(pool.allocate().is_none());

        // Double release must not mint extra capacity beyond the pair.
        pool.release(b);
        pool.release(b);
        assert_eq!(pool.allocate().unwrap(), b);
        assert!(pool.allocate().is_none());
    }

    #[test]
    fn odd_range_start_is_rounded_up() {
        let pool = EgressPortPool::new(20001, 20006);
        // Pairs (20002, 20003) and (20004, 20005).
        assert_eq!(pool.available_pairs(), 2);
        assert_eq!(
            pool.allocate().unwrap(),
            PortPair { rtp: 20002, rtcp: 20003 }
        );
    }
}
