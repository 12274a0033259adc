use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use session_description::SessionDescription;

use crate::error::ConnectionError;

pub type ConnectionResult<T> = Result<T, ConnectionError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Non-owning reference to a sender stored inside the transport.
///
/// The transport stays the sender's only owner; a handle that outlives the
/// sender simply resolves to [`ConnectionError::UnknownSender`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderHandle(u64);

impl SenderHandle {
    pub fn new(index: u64) -> Self {
        Self(index)
    }

    pub fn index(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SenderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sender#{}", self.0)
    }
}

/// Options passed to offer and answer generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConstraints {
    pub offer_to_receive_audio: bool,
    pub offer_to_receive_video: bool,
    pub voice_activity_detection: bool,
    pub ice_restart: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            offer_to_receive_audio: true,
            offer_to_receive_video: true,
            voice_activity_detection: false,
            ice_restart: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataChannelConfig {
    pub ordered: bool,
    pub max_retransmits: Option<u16>,
}

impl Default for DataChannelConfig {
    fn default() -> Self {
        Self {
            ordered: true,
            max_retransmits: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Receives inbound traffic for a data channel.
pub trait DataChannelDelegate: Send + Sync {
    fn on_message(&self, label: &str, payload: Bytes);

    fn on_state_change(&self, _label: &str, _state: DataChannelState) {}
}

/// Transport-owned data channel.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    /// Routes inbound messages and state changes to `delegate`, replacing any
    /// previously installed delegate.
    fn set_delegate(&self, delegate: Arc<dyn DataChannelDelegate>);

    async fn send(&self, payload: Bytes) -> ConnectionResult<()>;

    async fn close(&self) -> ConnectionResult<()>;
}

/// Notifications a transport raises outside of any requested operation.
pub enum ConnectionEvent {
    LocalIceCandidate(IceCandidate),
    IceGatheringComplete,
    StateChanged(PeerConnectionState),
    /// A channel opened by the remote peer; adopt it with
    /// [`adopt_data_channel`].
    ///
    /// [`adopt_data_channel`]: crate::PeerConnectionSession::adopt_data_channel
    DataChannel(Arc<dyn DataChannel>),
}

impl fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEvent::LocalIceCandidate(candidate) => {
                f.debug_tuple("LocalIceCandidate").field(candidate).finish()
            }
            ConnectionEvent::IceGatheringComplete => f.write_str("IceGatheringComplete"),
            ConnectionEvent::StateChanged(state) => {
                f.debug_tuple("StateChanged").field(state).finish()
            }
            ConnectionEvent::DataChannel(channel) => {
                f.debug_tuple("DataChannel").field(&channel.label()).finish()
            }
        }
    }
}

/// The media transport capability a session negotiates over.
///
/// Every async operation completes exactly once. Offer and answer creation
/// return `Ok(None)` when the transport reports success without producing a
/// description; callers treat that as a protocol violation.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn create_offer(
        &self,
        constraints: &MediaConstraints,
    ) -> ConnectionResult<Option<SessionDescription>>;

    async fn create_answer(
        &self,
        constraints: &MediaConstraints,
    ) -> ConnectionResult<Option<SessionDescription>>;

    async fn set_local_description(&self, description: SessionDescription) -> ConnectionResult<()>;

    async fn set_remote_description(&self, description: SessionDescription)
    -> ConnectionResult<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> ConnectionResult<()>;

    async fn open_data_channel(
        &self,
        label: &str,
        config: &DataChannelConfig,
    ) -> ConnectionResult<Arc<dyn DataChannel>>;

    async fn add_sender(
        &self,
        kind: MediaKind,
        stream_id: &str,
        track_id: &str,
    ) -> ConnectionResult<SenderHandle>;

    async fn remove_sender(&self, sender: SenderHandle) -> ConnectionResult<()>;

    /// Gates whether the sender emits media. Has no negotiation side effects.
    fn set_sender_enabled(&self, sender: SenderHandle, enabled: bool) -> ConnectionResult<()>;

    async fn close(&self) -> ConnectionResult<()>;
}
