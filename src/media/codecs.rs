use mediasoup::prelude::{
    MimeTypeAudio, MimeTypeVideo, RtcpFeedback, RtpCodecCapability, RtpCodecParametersParameters,
};

fn video_rtcp_feedback() -> Vec<RtcpFeedback> {
    vec![
        RtcpFeedback::Nack,
        RtcpFeedback::NackPli,
        RtcpFeedback::CcmFir,
        RtcpFeedback::GoogRemb,
        RtcpFeedback::TransportCc,
    ]
}

fn h264_codec_parameters() -> RtpCodecParametersParameters {
    let mut parameters = RtpCodecParametersParameters::default();
    parameters
        .insert("level-asymmetry-allowed", 1_u32)
        .insert("packetization-mode", 1_u32)
        .insert("profile-level-id", "42e01f");
    parameters
}

/// Router codec set: opus plus the configured video codecs. Unknown codec
/// names are skipped with a warning instead of failing startup.
pub fn media_codecs(video_codecs: &[String]) -> Vec<RtpCodecCapability> {
    let mut codecs = vec![RtpCodecCapability::Audio {
        mime_type: MimeTypeAudio::Opus,
        preferred_payload_type: None,
        clock_rate: 48000.try_into().unwrap(),
        channels: 2.try_into().unwrap(),
        parameters: RtpCodecParametersParameters::from([("useinbandfec", 1_u32.into())]),
        rtcp_feedback: vec![RtcpFeedback::TransportCc],
    }];

    for name in video_codecs {
        let codec = match name.to_ascii_uppercase().as_str() {
            "VP8" => RtpCodecCapability::Video {
                mime_type: MimeTypeVideo::Vp8,
                preferred_payload_type: None,
                clock_rate: 90000.try_into().unwrap(),
                parameters: RtpCodecParametersParameters::default(),
                rtcp_feedback: video_rtcp_feedback(),
            },
            "VP9" => RtpCodecCapability::Video {
                mime_type: MimeTypeVideo::Vp9,
                preferred_payload_type: None,
                clock_rate: 90000.try_into().unwrap(),
                parameters: RtpCodecParametersParameters::default(),
                rtcp_feedback: video_rtcp_feedback(),
            },
            "H264" => RtpCodecCapability::Video {
                mime_type: MimeTypeVideo::H264,
                preferred_payload_type: None,
                clock_rate: 90000.try_into().unwrap(),
                parameters: h264_codec_parameters(),
                rtcp_feedback: video_rtcp_feedback(),
            },
            other => {
                tracing::warn!(codec = %other, "Ignoring unsupported video codec in config");
                continue;
            }
        };
        codecs.push(codec);
    }

    codecs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_codecs_are_skipped() {
        let codecs = media_codecs(&["VP8".into(), "AV2".into(), "h264".into()]);
        // opus + VP8 + H264
        assert_eq!(codecs.len(), 3);
    }
}
