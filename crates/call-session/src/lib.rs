//! Offer/answer negotiation for a single call.
//!
//! [`PeerConnectionSession`] owns one [`Connection`] together with the local
//! media tracks and the signaling data channel. Its
//! [`NegotiationCoordinator`] sequences transport operations into the offer
//! and answer protocols, rejects overlapping operations, and hardens every
//! description it applies locally.

pub mod backend;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod data_channel;
pub mod error;
pub mod logging;
pub mod media;
pub mod mock;
pub mod session;

pub use config::{
    ConfigError, IceServer, MediaIdentifiers, SessionConfig, SessionConfigBuilder, VideoCapability,
};
pub use connection::{
    Connection, ConnectionEvent, ConnectionResult, DataChannel, DataChannelConfig,
    DataChannelDelegate, DataChannelState, IceCandidate, MediaConstraints, MediaKind,
    PeerConnectionState, SenderHandle,
};
pub use coordinator::{NegotiationCoordinator, NegotiationState};
pub use data_channel::DataChannelBridge;
pub use error::{ConnectionError, SessionError, SessionResult};
pub use logging::{LogConfig, LogOutput};
pub use media::{MediaTrack, MediaTrackController};
pub use session::PeerConnectionSession;
pub use session_description::{
    AUDIO_LEVEL_URN, HardenedSessionDescription, SdpKind, SessionDescription, harden,
};

#[cfg(feature = "webrtc-backend")]
pub use backend::WebRtcConnection;
