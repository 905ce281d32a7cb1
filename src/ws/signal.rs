use tokio::sync::mpsc;
use uuid::Uuid;

use super::broadcast::send_server_message;
use super::messages::{ClientMessage, ServerMessage};
use crate::errors::SignalError;
use crate::media::transport::TransportDirection;
use crate::AppState;

/// Send-path negotiation progress. The chain is strict: a request from a
/// later rung issued before its predecessor completed is a protocol-order
/// violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SendPhase {
    Opened,
    Registered,
    TransportCreated,
    TransportConnected,
    Producing,
}

/// Recv-path progress. Consumer-only sessions (dashboard, bridge) walk this
/// chain without ever touching the send path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RecvPhase {
    None,
    Created,
    Connected,
}

#[derive(Debug)]
pub struct SessionState {
    pub connection_id: Uuid,
    pub device_id: Option<String>,
    pub send_phase: SendPhase,
    pub recv_phase: RecvPhase,
}

impl SessionState {
    pub fn new(connection_id: Uuid) -> Self {
        Self {
            connection_id,
            device_id: None,
            send_phase: SendPhase::Opened,
            recv_phase: RecvPhase::None,
        }
    }
}

fn require_send_phase(session: &SessionState, at_least: SendPhase) -> Result<(), SignalError> {
    if session.send_phase >= at_least {
        Ok(())
    } else {
        Err(SignalError::ProtocolOrder)
    }
}

fn require_recv_phase(session: &SessionState, at_least: RecvPhase) -> Result<(), SignalError> {
    if session.recv_phase >= at_least {
        Ok(())
    } else {
        Err(SignalError::ProtocolOrder)
    }
}

fn validate_device_id(device_id: Option<&str>) -> Result<&str, SignalError> {
    match device_id {
        Some(id) if !id.trim().is_empty() => Ok(id),
        _ => Err(SignalError::MissingDeviceId),
    }
}

fn reply_error(
    state: &AppState,
    out_tx: &mpsc::Sender<String>,
    request_id: Option<String>,
    error: SignalError,
    message: Option<String>,
) {
    state.telemetry.inc_signal_error();
    if error == SignalError::EgressPortsExhausted {
        state.telemetry.inc_egress_exhaustion();
    }
    send_server_message(
        out_tx,
        ServerMessage::Error {
            request_id,
            error: error.kind(),
            message,
        },
    );
}

pub async fn handle_request(
    state: &AppState,
    session: &mut SessionState,
    request: ClientMessage,
    out_tx: &mpsc::Sender<String>,
) {
    let request_id = request.request_id();

    if let Err(message) = request.validate_fields() {
        tracing::warn!(
            connection_id = %session.connection_id,
            message,
            "Rejected signaling request due to invalid field constraints"
        );
        reply_error(
            state,
            out_tx,
            request_id,
            SignalError::ProtocolOrder,
            Some(message.to_string()),
        );
        return;
    }

    match request {
        ClientMessage::RegisterDevice {
            device_id,
            device_name,
            ..
        } => {
            let device_id = match validate_device_id(device_id.as_deref()) {
                Ok(id) => id.to_string(),
                Err(error) => {
                    reply_error(state, out_tx, request_id, error, None);
                    return;
                }
            };

            state
                .registry
                .register_device(session.connection_id, &device_id, device_name);
            session.device_id = Some(device_id.clone());
            if session.send_phase < SendPhase::Registered {
                session.send_phase = SendPhase::Registered;
            }

            send_server_message(
                out_tx,
                ServerMessage::DeviceRegistered {
                    request_id,
                    device_id,
                },
            );
        }

        ClientMessage::GetRtpCapabilities { .. } => match state.media.rtp_capabilities() {
            Ok(rtp_capabilities) => {
                send_server_message(
                    out_tx,
                    ServerMessage::RtpCapabilities {
                        request_id,
                        rtp_capabilities,
                    },
                );
            }
            Err(error) => reply_error(state, out_tx, request_id, error, None),
        },

        ClientMessage::CreateTransport { .. } => {
            if let Err(error) = require_send_phase(session, SendPhase::Registered) {
                reply_error(state, out_tx, request_id, error, None);
                return;
            }

            match state
                .media
                .create_client_transport(session.connection_id, TransportDirection::Send)
                .await
            {
                Ok(transport) => {
                    if session.send_phase < SendPhase::TransportCreated {
                        session.send_phase = SendPhase::TransportCreated;
                    }
                    send_server_message(
                        out_tx,
                        ServerMessage::TransportCreated {
                            request_id,
                            transport,
                        },
                    );
                }
                Err(error) => reply_error(state, out_tx, request_id, error, None),
            }
        }

        ClientMessage::ConnectTransport {
            transport_id,
            dtls_parameters,
            ..
        } => {
            if let Err(error) = require_send_phase(session, SendPhase::TransportCreated) {
                reply_error(state, out_tx, request_id, error, None);
                return;
            }

            match state
                .media
                .connect_client_transport(session.connection_id, &transport_id, dtls_parameters)
                .await
            {
                Ok(()) => {
                    if session.send_phase < SendPhase::TransportConnected {
                        session.send_phase = SendPhase::TransportConnected;
                    }
                    send_server_message(
                        out_tx,
                        ServerMessage::TransportConnected {
                            request_id,
                            transport_id,
                        },
                    );
                }
                Err(error) => reply_error(state, out_tx, request_id, error, None),
            }
        }

        ClientMessage::Produce {
            transport_id,
            kind,
            rtp_parameters,
            ..
        } => {
            if let Err(error) = require_send_phase(session, SendPhase::TransportConnected) {
                reply_error(state, out_tx, request_id, error, None);
                return;
            }
            // The chain guarantees a bound device at this point.
            let Some(device_id) = session.device_id.clone() else {
                reply_error(state, out_tx, request_id, SignalError::ProtocolOrder, None);
                return;
            };

            match state
                .media
                .produce(
                    session.connection_id,
                    &transport_id,
                    &device_id,
                    kind,
                    rtp_parameters,
                )
                .await
            {
                Ok(produced) => {
                    if let Some(profile) = produced.profile {
                        let (_, replaced) = state.registry.upsert_stream(
                            &device_id,
                            &produced.transport_id,
                            &produced.producer_id,
                            profile,
                        );
                        if let Some(old_producer_id) = replaced {
                            state.media.close_replaced_producer(&old_producer_id).await;
                        }
                    }
                    session.send_phase = SendPhase::Producing;
                    send_server_message(
                        out_tx,
                        ServerMessage::Produced {
                            request_id,
                            id: produced.producer_id,
                            kind: produced.kind,
                        },
                    );
                }
                Err(error) => reply_error(state, out_tx, request_id, error, None),
            }
        }

        ClientMessage::CreateRecvTransport { .. } => {
            match state
                .media
                .create_client_transport(session.connection_id, TransportDirection::Recv)
                .await
            {
                Ok(transport) => {
                    // A fresh transport is never connected, even when it
                    // replaces one that was.
                    session.recv_phase = RecvPhase::Created;
                    send_server_message(
                        out_tx,
                        ServerMessage::RecvTransportCreated {
                            request_id,
                            transport,
                        },
                    );
                }
                Err(error) => reply_error(state, out_tx, request_id, error, None),
            }
        }

        ClientMessage::ConnectRecvTransport {
            transport_id,
            dtls_parameters,
            ..
        } => {
            if let Err(error) = require_recv_phase(session, RecvPhase::Created) {
                reply_error(state, out_tx, request_id, error, None);
                return;
            }

            match state
                .media
                .connect_client_transport(session.connection_id, &transport_id, dtls_parameters)
                .await
            {
                Ok(()) => {
                    session.recv_phase = RecvPhase::Connected;
                    send_server_message(
                        out_tx,
                        ServerMessage::RecvTransportConnected {
                            request_id,
                            transport_id,
                        },
                    );
                }
                Err(error) => reply_error(state, out_tx, request_id, error, None),
            }
        }

        ClientMessage::ConsumeStream {
            transport_id,
            producer_id,
            rtp_capabilities,
            ..
        } => {
            if let Err(error) = require_recv_phase(session, RecvPhase::Connected) {
                reply_error(state, out_tx, request_id, error, None);
                return;
            }

            match state
                .media
                .consume(
                    session.connection_id,
                    &transport_id,
                    &producer_id,
                    rtp_capabilities,
                )
                .await
            {
                Ok(consumer) => {
                    send_server_message(
                        out_tx,
                        ServerMessage::StreamConsumed {
                            request_id,
                            id: consumer.id,
                            producer_id: consumer.producer_id,
                            kind: consumer.kind,
                            rtp_parameters: consumer.rtp_parameters,
                        },
                    );
                }
                Err(error) => reply_error(state, out_tx, request_id, error, None),
            }
        }

        ClientMessage::ResumeConsumer { consumer_id, .. } => {
            match state
                .media
                .resume_consumer(session.connection_id, &consumer_id)
                .await
            {
                Ok(()) => {
                    send_server_message(
                        out_tx,
                        ServerMessage::ConsumerResumed {
                            request_id,
                            consumer_id,
                        },
                    );
                }
                Err(error) => reply_error(state, out_tx, request_id, error, None),
            }
        }

        ClientMessage::StopStream { .. } => {
            match state.registry.stop_streaming(session.connection_id) {
                Ok(()) => {
                    send_server_message(out_tx, ServerMessage::StreamStopped { request_id });
                }
                Err(error) => reply_error(state, out_tx, request_id, error, None),
            }
        }

        ClientMessage::DisconnectStream { stream_id, .. } => {
            let Some(stream) = state.registry.stream(&stream_id) else {
                reply_error(state, out_tx, request_id, SignalError::UnknownStream, None);
                return;
            };

            if state
                .media
                .close_producer_cascade(&stream.producer_id, &state.registry, true)
                .await
                .is_err()
            {
                // The producer is already gone; purge the stale record so
                // observers converge.
                state
                    .registry
                    .end_stream_for_producer(&stream.producer_id, true);
            }
            send_server_message(
                out_tx,
                ServerMessage::StreamDisconnected {
                    request_id,
                    stream_id,
                },
            );
        }

        ClientMessage::UpdateStreamName {
            stream_id, name, ..
        } => match state.registry.rename_stream(&stream_id, &name) {
            Ok(_) => {
                send_server_message(
                    out_tx,
                    ServerMessage::StreamRenamed {
                        request_id,
                        stream_id,
                    },
                );
            }
            Err(error) => reply_error(state, out_tx, request_id, error, None),
        },

        ClientMessage::GetActiveStreams { .. } => {
            send_server_message(
                out_tx,
                ServerMessage::ActiveStreams {
                    request_id,
                    streams: state.registry.active_streams(),
                },
            );
        }

        ClientMessage::NdiBridgeConsumeStream {
            stream_id,
            producer_id,
            rtp_capabilities,
            ..
        } => {
            let Some(stream) = state.registry.stream(&stream_id) else {
                reply_error(state, out_tx, request_id, SignalError::UnknownStream, None);
                return;
            };

            match state
                .media
                .consume_for_bridge(&stream, &producer_id, rtp_capabilities)
                .await
            {
                Ok(reply) => {
                    send_server_message(
                        out_tx,
                        ServerMessage::NdiBridgeStreamConsumed { request_id, reply },
                    );
                }
                Err(error) => reply_error(state, out_tx, request_id, error, None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produce_before_connect_is_out_of_order() {
        let mut session = SessionState::new(Uuid::new_v4());
        session.send_phase = SendPhase::TransportCreated;

        assert_eq!(
            require_send_phase(&session, SendPhase::TransportConnected).unwrap_err(),
            SignalError::ProtocolOrder
        );
    }

    #[test]
    fn send_chain_admits_each_step_in_turn() {
        let mut session = SessionState::new(Uuid::new_v4());
        assert!(require_send_phase(&session, SendPhase::Registered).is_err());

        session.send_phase = SendPhase::Registered;
        assert!(require_send_phase(&session, SendPhase::Registered).is_ok());
        assert!(require_send_phase(&session, SendPhase::TransportCreated).is_err());

        session.send_phase = SendPhase::TransportConnected;
        assert!(require_send_phase(&session, SendPhase::TransportConnected).is_ok());
    }

    #[test]
    fn recv_chain_is_ordered_independently() {
        let mut session = SessionState::new(Uuid::new_v4());
        assert!(require_recv_phase(&session, RecvPhase::Created).is_err());

        session.recv_phase = RecvPhase::Created;
        assert!(require_recv_phase(&session, RecvPhase::Created).is_ok());
        assert!(require_recv_phase(&session, RecvPhase::Connected).is_err());
    }

    #[test]
    fn missing_or_blank_device_id_is_rejected() {
        assert_eq!(
            validate_device_id(None).unwrap_err(),
            SignalError::MissingDeviceId
        );
        assert_eq!(
            validate_device_id(Some("  ")).unwrap_err(),
            SignalError::MissingDeviceId
        );
        assert_eq!(validate_device_id(Some("dev-A")).unwrap(), "dev-A");
    }
}
