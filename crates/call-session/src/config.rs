use std::env;

use serde::Deserialize;
use thiserror::Error;

use crate::connection::{DataChannelConfig, MediaConstraints};

const ICE_SERVERS_ENV: &str = "CALL_SESSION_ICE_SERVERS";
const DISABLE_VIDEO_ENV: &str = "CALL_SESSION_DISABLE_VIDEO";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid session config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("{0} is required")]
    Missing(&'static str),
}

/// A STUN/TURN server handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

impl IceServer {
    pub fn new(urls: Vec<String>) -> Self {
        Self {
            urls,
            username: String::new(),
            credential: String::new(),
        }
    }
}

/// Stream, track and channel identifiers advertised to the remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MediaIdentifiers {
    pub stream_id: String,
    pub audio_track_id: String,
    pub video_track_id: String,
    pub data_channel_label: String,
}

impl Default for MediaIdentifiers {
    fn default() -> Self {
        Self {
            stream_id: "ARDAMS".to_string(),
            audio_track_id: "ARDAMSa0".to_string(),
            video_track_id: "ARDAMSv0".to_string(),
            data_channel_label: "signaling".to_string(),
        }
    }
}

/// Whether local video capture can be provisioned in this environment.
///
/// Resolved once at startup; sessions never probe the environment themselves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum VideoCapability {
    #[default]
    Available,
    Unavailable { reason: String },
}

impl VideoCapability {
    pub fn detect() -> Self {
        match env::var(DISABLE_VIDEO_ENV) {
            Ok(value) if env_truthy(&value) => VideoCapability::Unavailable {
                reason: format!("disabled by {DISABLE_VIDEO_ENV}"),
            },
            _ => VideoCapability::Available,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, VideoCapability::Available)
    }
}

fn env_truthy(value: &str) -> bool {
    !value.is_empty() && value != "0" && !value.eq_ignore_ascii_case("false")
}

/// Per-session configuration, fixed at construction.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub ice_servers: Vec<IceServer>,
    pub identifiers: MediaIdentifiers,
    pub offer_constraints: MediaConstraints,
    pub data_channel: DataChannelConfig,
    #[serde(skip)]
    pub video: VideoCapability,
}

impl SessionConfig {
    /// Defaults overridden by `CALL_SESSION_ICE_SERVERS` (comma separated
    /// URLs, one server each) and `CALL_SESSION_DISABLE_VIDEO`.
    pub fn from_env() -> Self {
        let mut config = Self {
            video: VideoCapability::detect(),
            ..Default::default()
        };
        if let Ok(urls) = env::var(ICE_SERVERS_ENV) {
            config.ice_servers = parse_ice_urls(&urls);
        }
        config
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let mut config: SessionConfig = toml::from_str(raw)?;
        config.video = VideoCapability::detect();
        Ok(config)
    }
}

fn parse_ice_urls(raw: &str) -> Vec<IceServer> {
    raw.split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(|url| IceServer::new(vec![url.to_string()]))
        .collect()
}

/// Builder for [`SessionConfig`].
#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    ice_servers: Vec<IceServer>,
    identifiers: Option<MediaIdentifiers>,
    data_channel_label: Option<String>,
    offer_constraints: Option<MediaConstraints>,
    data_channel: Option<DataChannelConfig>,
    video: Option<VideoCapability>,
}

impl SessionConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_ice_server(mut self, urls: Vec<String>) -> Self {
        self.ice_servers.push(IceServer::new(urls));
        self
    }

    pub fn add_ice_server_with_credentials(
        mut self,
        urls: Vec<String>,
        username: String,
        credential: String,
    ) -> Self {
        self.ice_servers.push(IceServer {
            urls,
            username,
            credential,
        });
        self
    }

    pub fn identifiers(mut self, identifiers: MediaIdentifiers) -> Self {
        self.identifiers = Some(identifiers);
        self
    }

    pub fn data_channel_label(mut self, label: impl Into<String>) -> Self {
        self.data_channel_label = Some(label.into());
        self
    }

    pub fn offer_constraints(mut self, constraints: MediaConstraints) -> Self {
        self.offer_constraints = Some(constraints);
        self
    }

    pub fn data_channel(mut self, config: DataChannelConfig) -> Self {
        self.data_channel = Some(config);
        self
    }

    pub fn video(mut self, capability: VideoCapability) -> Self {
        self.video = Some(capability);
        self
    }

    pub fn build(self) -> Result<SessionConfig, ConfigError> {
        let mut identifiers = self.identifiers.unwrap_or_default();
        if let Some(label) = self.data_channel_label {
            identifiers.data_channel_label = label;
        }
        if identifiers.data_channel_label.is_empty() {
            return Err(ConfigError::Missing("data channel label"));
        }

        Ok(SessionConfig {
            ice_servers: self.ice_servers,
            identifiers,
            offer_constraints: self.offer_constraints.unwrap_or_default(),
            data_channel: self.data_channel.unwrap_or_default(),
            video: self.video.unwrap_or_else(VideoCapability::detect),
        })
    }
}
