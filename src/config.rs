use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub media: MediaConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MediaConfig {
    pub webrtc_listen_ip: String,
    pub announced_ip: Option<String>,
    #[serde(default = "default_rtc_min_port")]
    pub rtc_min_port: u16,
    #[serde(default = "default_rtc_max_port")]
    pub rtc_max_port: u16,
    #[serde(default = "default_egress_listen_ip")]
    pub egress_listen_ip: String,
    #[serde(default)]
    pub egress_announced_ip: Option<String>,
    #[serde(default = "default_egress_min_port")]
    pub egress_min_port: u16,
    #[serde(default = "default_egress_max_port")]
    pub egress_max_port: u16,
    #[serde(default = "default_initial_outgoing_bitrate")]
    pub initial_outgoing_bitrate: u32,
    #[serde(default = "default_max_incoming_bitrate")]
    pub max_incoming_bitrate: u32,
    #[serde(default = "default_video_codecs")]
    pub video_codecs: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    #[serde(default = "default_removal_grace_seconds")]
    pub removal_grace_seconds: u64,
}

fn default_rtc_min_port() -> u16 {
    40000
}

fn default_rtc_max_port() -> u16 {
    49999
}

fn default_egress_listen_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_egress_min_port() -> u16 {
    20000
}

fn default_egress_max_port() -> u16 {
    20100
}

fn default_initial_outgoing_bitrate() -> u32 {
    600_000
}

fn default_max_incoming_bitrate() -> u32 {
    1_500_000
}

fn default_video_codecs() -> Vec<String> {
    vec!["VP8".to_string(), "VP9".to_string(), "H264".to_string()]
}

fn default_removal_grace_seconds() -> u64 {
    30
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            removal_grace_seconds: default_removal_grace_seconds(),
        }
    }
}

impl AppConfig {
    pub fn load() -> Self {
        let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".into());

        let config = if Path::new(&config_path).exists() {
            let contents =
                std::fs::read_to_string(&config_path).expect("Failed to read config file");
            toml::from_str(&contents).expect("Failed to parse config file")
        } else {
            // Fall back to environment variables
            AppConfig {
                server: ServerConfig {
                    host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
                    port: std::env::var("PORT")
                        .unwrap_or_else(|_| "3000".into())
                        .parse()
                        .expect("PORT must be a number"),
                },
                media: MediaConfig {
                    webrtc_listen_ip: std::env::var("WEBRTC_LISTEN_IP")
                        .unwrap_or_else(|_| "0.0.0.0".into()),
                    announced_ip: std::env::var("WEBRTC_ANNOUNCED_IP").ok(),
                    rtc_min_port: std::env::var("WEBRTC_MIN_PORT")
                        .unwrap_or_else(|_| default_rtc_min_port().to_string())
                        .parse()
                        .expect("WEBRTC_MIN_PORT must be a port number"),
                    rtc_max_port: std::env::var("WEBRTC_MAX_PORT")
                        .unwrap_or_else(|_| default_rtc_max_port().to_string())
                        .parse()
                        .expect("WEBRTC_MAX_PORT must be a port number"),
                    egress_listen_ip: std::env::var("EGRESS_LISTEN_IP")
                        .unwrap_or_else(|_| default_egress_listen_ip()),
                    egress_announced_ip: std::env::var("EGRESS_ANNOUNCED_IP").ok(),
                    egress_min_port: std::env::var("EGRESS_MIN_PORT")
                        .unwrap_or_else(|_| default_egress_min_port().to_string())
                        .parse()
                        .expect("EGRESS_MIN_PORT must be a port number"),
                    egress_max_port: std::env::var("EGRESS_MAX_PORT")
                        .unwrap_or_else(|_| default_egress_max_port().to_string())
                        .parse()
                        .expect("EGRESS_MAX_PORT must be a port number"),
                    initial_outgoing_bitrate: std::env::var("INITIAL_OUTGOING_BITRATE")
                        .unwrap_or_else(|_| default_initial_outgoing_bitrate().to_string())
                        .parse()
                        .expect("INITIAL_OUTGOING_BITRATE must be a number"),
                    max_incoming_bitrate: std::env::var("MAX_INCOMING_BITRATE")
                        .unwrap_or_else(|_| default_max_incoming_bitrate().to_string())
                        .parse()
                        .expect("MAX_INCOMING_BITRATE must be a number"),
                    video_codecs: std::env::var("VIDEO_CODECS")
                        .map(|value| {
                            value
                                .split(',')
                                .map(|codec| codec.trim().to_string())
                                .filter(|codec| !codec.is_empty())
                                .collect()
                        })
                        .unwrap_or_else(|_| default_video_codecs()),
                },
                registry: RegistryConfig {
                    removal_grace_seconds: std::env::var("REMOVAL_GRACE_SECONDS")
                        .unwrap_or_else(|_| default_removal_grace_seconds().to_string())
                        .parse()
                        .expect("REMOVAL_GRACE_SECONDS must be a number"),
                },
            }
        };

        config.validate();
        config
    }

    /// The egress pool must not overlap the WebRTC ICE range, otherwise the
    /// worker and the pool race for the same UDP ports.
    fn validate(&self) {
        let media = &self.media;
        assert!(
            media.rtc_min_port <= media.rtc_max_port,
            "WEBRTC_MIN_PORT must not exceed WEBRTC_MAX_PORT"
        );
        assert!(
            media.egress_min_port <= media.egress_max_port,
            "EGRESS_MIN_PORT must not exceed EGRESS_MAX_PORT"
        );
        assert!(
            media.egress_max_port < media.rtc_min_port || media.egress_min_port > media.rtc_max_port,
            "egress port range must not overlap the WebRTC port range"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media_config(egress: (u16, u16), rtc: (u16, u16)) -> AppConfig {
        AppConfig {
            server: ServerConfig {
                host: "127.0.0.1".into(),
                port: 3000,
            },
            media: MediaConfig {
                webrtc_listen_ip: "0.0.0.0".into(),
                announced_ip: None,
                rtc_min_port: rtc.0,
                rtc_max_port: rtc.1,
                egress_listen_ip: default_egress_listen_ip(),
                egress_announced_ip: None,
                egress_min_port: egress.0,
                egress_max_port: egress.1,
                initial_outgoing_bitrate: default_initial_outgoing_bitrate(),
                max_incoming_bitrate: default_max_incoming_bitrate(),
                video_codecs: default_video_codecs(),
            },
            registry: RegistryConfig::default(),
        }
    }

    #[test]
    fn disjoint_port_ranges_pass_validation() {
        media_config((20000, 20100), (40000, 49999)).validate();
    }

    #[test]
    #[should_panic(expected = "must not overlap")]
    fn overlapping_port_ranges_are_rejected() {
        media_config((39000, 41000), (40000, 49999)).validate();
    }
}
