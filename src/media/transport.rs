use mediasoup::prelude::{
    Consumer, DtlsParameters, IceCandidate, IceParameters, MediaKind, Producer, RtpParameters,
    WebRtcTransport,
};
use serde::Serialize;
use std::collections::HashMap;

use crate::registry::StreamProfile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportDirection {
    Send,
    Recv,
}

impl TransportDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Recv => "recv",
        }
    }
}

/// Connection parameters handed to the client after transport creation.
#[derive(Debug, Clone, Serialize)]
pub struct CreatedClientTransport {
    pub id: String,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug)]
pub(crate) struct ProducerEntry {
    pub producer: Producer,
    pub kind: MediaKind,
    pub device_id: String,
    pub transport_id: String,
}

/// Media objects owned by one signaling session. Dropping the whole state
/// (or single entries) closes the underlying mediasoup objects.
#[derive(Debug, Default)]
pub(crate) struct SessionMediaState {
    pub send_transport_id: Option<String>,
    pub recv_transport_id: Option<String>,
    pub transports: HashMap<String, WebRtcTransport>,
    pub producers: HashMap<String, ProducerEntry>,
    pub consumers: HashMap<String, Consumer>,
}

/// Summary of a producer torn down by a cleanup cascade.
#[derive(Debug, Clone)]
pub struct ClosedProducer {
    pub producer_id: String,
    pub device_id: String,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedConsumer {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

pub fn media_kind_as_str(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Audio => "audio",
        MediaKind::Video => "video",
    }
}

/// Derives the nominal stream parameters from negotiated RTP parameters:
/// 1280x720 at 30 fps and 1 Mbps unless the first encoding declares a
/// downscale factor or a bitrate cap.
pub(crate) fn stream_profile_from_parameters(rtp_parameters: &RtpParameters) -> StreamProfile {
    let mut profile = StreamProfile::default();

    if let Some(encoding) = rtp_parameters.encodings.first() {
        if let Some(scale) = encoding.scale_resolution_down_by {
            if scale > 1.0 {
                profile.width = (f64::from(profile.width) / scale).floor() as u32;
                profile.height = (f64::from(profile.height) / scale).floor() as u32;
            }
        }
        if let Some(max_bitrate) = encoding.max_bitrate {
            profile.max_bitrate = max_bitrate;
        }
    }

    profile
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediasoup::prelude::RtpEncodingParameters;

    fn parameters_with_encoding(encoding: RtpEncodingParameters) -> RtpParameters {
        RtpParameters {
            encodings: vec![encoding],
            ..RtpParameters::default()
        }
    }

    #[test]
    fn defaults_apply_without_encodings() {
        let params = RtpParameters::default();
        let profile = stream_profile_from_parameters(&params);
        assert_eq!((profile.width, profile.height), (1280, 720));
        assert_eq!(profile.fps, 30);
        assert_eq!(profile.max_bitrate, 1_000_000);
    }

    #[test]
    fn downscale_factor_divides_dimensions_floored() {
        let params = parameters_with_encoding(RtpEncodingParameters {
            scale_resolution_down_by: Some(3.0),
            ..RtpEncodingParameters::default()
        });
        let profile = stream_profile_from_parameters(&params);
        assert_eq!((profile.width, profile.height), (426, 240));
    }

    #[test]
    fn declared_bitrate_cap_is_adopted() {
        let params = parameters_with_encoding(RtpEncodingParameters {
            max_bitrate: Some(2_500_000),
            ..RtpEncodingParameters::default()
        });
        let profile = stream_profile_from_parameters(&params);
        assert_eq!(profile.max_bitrate, 2_500_000);
    }
}
