//! Concrete [`Connection`](crate::Connection) implementations.

#[cfg(feature = "webrtc-backend")]
pub mod webrtc;

#[cfg(feature = "webrtc-backend")]
pub use self::webrtc::WebRtcConnection;
