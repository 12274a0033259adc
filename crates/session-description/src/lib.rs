//! Session descriptions exchanged during offer/answer negotiation.
//!
//! A [`SessionDescription`] is what the transport produces or what arrives
//! from the remote peer. A [`HardenedSessionDescription`] is the only form a
//! peer may apply as its own local description: it is built by running the
//! raw text through [`harden`] exactly once and cannot be modified afterwards.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod harden;

pub use harden::{AUDIO_LEVEL_URN, harden};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DescriptionError {
    #[error("unknown session description type {0:?}")]
    UnknownKind(String),
}

/// Negotiation stage a description belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
}

impl SdpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
            SdpKind::Pranswer => "pranswer",
        }
    }
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SdpKind {
    type Err = DescriptionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "offer" => Ok(SdpKind::Offer),
            "answer" => Ok(SdpKind::Answer),
            "pranswer" => Ok(SdpKind::Pranswer),
            other => Err(DescriptionError::UnknownKind(other.to_string())),
        }
    }
}

/// Raw, type-tagged SDP text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(kind: SdpKind, sdp: impl Into<String>) -> Self {
        Self {
            kind,
            sdp: sdp.into(),
        }
    }

    pub fn offer(sdp: impl Into<String>) -> Self {
        Self::new(SdpKind::Offer, sdp)
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self::new(SdpKind::Answer, sdp)
    }

    pub fn pranswer(sdp: impl Into<String>) -> Self {
        Self::new(SdpKind::Pranswer, sdp)
    }
}

/// A description that has been through exactly one hardening pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HardenedSessionDescription {
    #[serde(flatten)]
    inner: SessionDescription,
}

impl HardenedSessionDescription {
    pub fn kind(&self) -> SdpKind {
        self.inner.kind
    }

    pub fn sdp(&self) -> &str {
        &self.inner.sdp
    }

    pub fn as_description(&self) -> &SessionDescription {
        &self.inner
    }

    /// Releases the hardened text, e.g. to hand it to the signaling layer.
    pub fn into_description(self) -> SessionDescription {
        self.inner
    }
}

impl From<SessionDescription> for HardenedSessionDescription {
    fn from(description: SessionDescription) -> Self {
        let sdp = harden(&description.sdp);
        Self {
            inner: SessionDescription {
                kind: description.kind,
                sdp,
            },
        }
    }
}

impl fmt::Display for HardenedSessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes)", self.inner.kind, self.inner.sdp.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardening_happens_at_construction() {
        let raw = SessionDescription::offer(
            "a=extmap:1 urn:ietf:params:rtp-hdrext:ssrc-audio-level\r\na=fmtp:111 minptime=10\r\n",
        );
        let hardened = HardenedSessionDescription::from(raw);
        assert_eq!(hardened.kind(), SdpKind::Offer);
        assert_eq!(hardened.sdp(), "a=fmtp:111 minptime=10;cbr=1\r\n");
    }

    #[test]
    fn serializes_with_type_tag() {
        let json = serde_json::to_value(SessionDescription::answer("v=0\r\n")).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "answer", "sdp": "v=0\r\n" }));

        let hardened = HardenedSessionDescription::from(SessionDescription::offer("v=0\r\n"));
        let json = serde_json::to_value(&hardened).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "offer", "sdp": "v=0\r\n" }));
    }

    #[test]
    fn parses_remote_description() {
        let parsed: SessionDescription =
            serde_json::from_str(r#"{"type":"pranswer","sdp":"v=0"}"#).unwrap();
        assert_eq!(parsed, SessionDescription::pranswer("v=0"));
    }

    #[test]
    fn rejects_unknown_kind() {
        assert_eq!("offer".parse::<SdpKind>(), Ok(SdpKind::Offer));
        assert_eq!(
            "rollback".parse::<SdpKind>(),
            Err(DescriptionError::UnknownKind("rollback".into()))
        );
    }
}
