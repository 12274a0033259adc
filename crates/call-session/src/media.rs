use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::config::{MediaIdentifiers, VideoCapability};
use crate::connection::{Connection, ConnectionResult, MediaKind, SenderHandle};
use crate::error::{SessionError, SessionResult};

/// A locally produced track and the handle of the sender feeding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    pub kind: MediaKind,
    pub track_id: String,
    pub enabled: bool,
    pub sender: SenderHandle,
}

/// Owns the local audio and video tracks of a session.
///
/// Tracks are created disabled when the session is established and are only
/// toggled afterwards; toggling never renegotiates.
#[derive(Debug, Default)]
pub struct MediaTrackController {
    audio: Mutex<Option<MediaTrack>>,
    video: Mutex<Option<MediaTrack>>,
}

impl MediaTrackController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the audio sender and, when capture is available, the video
    /// sender. Both start disabled.
    pub async fn provision(
        connection: &dyn Connection,
        identifiers: &MediaIdentifiers,
        video: &VideoCapability,
    ) -> ConnectionResult<Self> {
        let controller = Self::new();

        let audio = create_track(
            connection,
            MediaKind::Audio,
            &identifiers.stream_id,
            &identifiers.audio_track_id,
        )
        .await?;
        *controller.audio.lock() = Some(audio);

        match video {
            VideoCapability::Available => {
                let track = create_track(
                    connection,
                    MediaKind::Video,
                    &identifiers.stream_id,
                    &identifiers.video_track_id,
                )
                .await?;
                *controller.video.lock() = Some(track);
            }
            VideoCapability::Unavailable { reason } => {
                warn!(
                    target = "call_session::media",
                    reason = %reason,
                    "refusing to create local video track"
                );
            }
        }

        Ok(controller)
    }

    pub fn set_audio_enabled(
        &self,
        connection: &dyn Connection,
        enabled: bool,
    ) -> SessionResult<()> {
        set_enabled(&self.audio, MediaKind::Audio, connection, enabled)
    }

    pub fn set_video_enabled(
        &self,
        connection: &dyn Connection,
        enabled: bool,
    ) -> SessionResult<()> {
        set_enabled(&self.video, MediaKind::Video, connection, enabled)
    }

    pub fn audio(&self) -> Option<MediaTrack> {
        self.audio.lock().clone()
    }

    pub fn video(&self) -> Option<MediaTrack> {
        self.video.lock().clone()
    }

    /// Drops both tracks and detaches their senders. Failures are logged;
    /// the tracks are gone either way.
    pub async fn release(&self, connection: &dyn Connection) {
        let tracks = [self.audio.lock().take(), self.video.lock().take()];
        for track in tracks.into_iter().flatten() {
            if let Err(err) = connection.remove_sender(track.sender).await {
                warn!(
                    target = "call_session::media",
                    kind = %track.kind,
                    sender = %track.sender,
                    error = %err,
                    "failed to detach sender"
                );
            }
        }
    }
}

async fn create_track(
    connection: &dyn Connection,
    kind: MediaKind,
    stream_id: &str,
    track_id: &str,
) -> ConnectionResult<MediaTrack> {
    let sender = connection.add_sender(kind, stream_id, track_id).await?;
    // Disabled until the call is connected.
    connection.set_sender_enabled(sender, false)?;
    debug!(
        target = "call_session::media",
        %kind,
        track_id,
        %sender,
        "local track created"
    );
    Ok(MediaTrack {
        kind,
        track_id: track_id.to_string(),
        enabled: false,
        sender,
    })
}

fn set_enabled(
    slot: &Mutex<Option<MediaTrack>>,
    kind: MediaKind,
    connection: &dyn Connection,
    enabled: bool,
) -> SessionResult<()> {
    let mut guard = slot.lock();
    let Some(track) = guard.as_mut() else {
        let action = if enabled { "enable" } else { "disable" };
        error!(
            target = "call_session::media",
            %kind,
            "trying to {action} a track which doesn't exist"
        );
        return Err(SessionError::NotReady(match kind {
            MediaKind::Audio => "audio track",
            MediaKind::Video => "video track",
        }));
    };

    connection
        .set_sender_enabled(track.sender, enabled)
        .map_err(|err| SessionError::transport("set_sender_enabled", err))?;
    track.enabled = enabled;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ConnectionOp, MockConnection};

    #[tokio::test]
    async fn provisions_disabled_tracks() {
        let (connection, probe) = MockConnection::new();
        let controller = MediaTrackController::provision(
            &connection,
            &MediaIdentifiers::default(),
            &VideoCapability::Available,
        )
        .await
        .expect("provision ok");

        let audio = controller.audio().expect("audio track");
        let video = controller.video().expect("video track");
        assert_eq!(audio.track_id, "ARDAMSa0");
        assert_eq!(video.track_id, "ARDAMSv0");
        assert!(!audio.enabled && !video.enabled);
        assert_eq!(probe.sender_enabled(audio.sender), Some(false));
        assert_eq!(probe.sender_enabled(video.sender), Some(false));
        assert_eq!(
            probe.senders(),
            vec![
                (MediaKind::Audio, "ARDAMS".to_string(), "ARDAMSa0".to_string()),
                (MediaKind::Video, "ARDAMS".to_string(), "ARDAMSv0".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn skips_video_without_capture() {
        let (connection, probe) = MockConnection::new();
        let controller = MediaTrackController::provision(
            &connection,
            &MediaIdentifiers::default(),
            &VideoCapability::Unavailable {
                reason: "simulator".into(),
            },
        )
        .await
        .expect("provision ok");

        assert!(controller.audio().is_some());
        assert!(controller.video().is_none());
        assert_eq!(probe.senders().len(), 1);

        let err = controller.set_video_enabled(&connection, true).unwrap_err();
        assert!(matches!(err, SessionError::NotReady("video track")));
    }

    #[tokio::test]
    async fn toggles_gate_the_sender() {
        let (connection, probe) = MockConnection::new();
        let controller = MediaTrackController::provision(
            &connection,
            &MediaIdentifiers::default(),
            &VideoCapability::Available,
        )
        .await
        .unwrap();

        controller.set_audio_enabled(&connection, true).unwrap();
        let audio = controller.audio().unwrap();
        assert!(audio.enabled);
        assert_eq!(probe.sender_enabled(audio.sender), Some(true));

        controller.set_audio_enabled(&connection, false).unwrap();
        assert_eq!(probe.sender_enabled(audio.sender), Some(false));
        assert!(!probe.invoked().iter().any(|op| op.is_negotiation()));
    }

    #[tokio::test]
    async fn release_detaches_senders_once() {
        let (connection, probe) = MockConnection::new();
        let controller = MediaTrackController::provision(
            &connection,
            &MediaIdentifiers::default(),
            &VideoCapability::Available,
        )
        .await
        .unwrap();

        controller.release(&connection).await;
        controller.release(&connection).await;

        assert!(controller.audio().is_none());
        assert!(controller.video().is_none());
        let removals = probe
            .invoked()
            .into_iter()
            .filter(|op| *op == ConnectionOp::RemoveSender)
            .count();
        assert_eq!(removals, 2);
        assert!(matches!(
            controller.set_audio_enabled(&connection, true),
            Err(SessionError::NotReady("audio track"))
        ));
    }

    #[tokio::test]
    async fn audio_failure_aborts_provisioning() {
        let (connection, probe) = MockConnection::new();
        probe.fail_next(ConnectionOp::AddSender, "no microphone");
        let err = MediaTrackController::provision(
            &connection,
            &MediaIdentifiers::default(),
            &VideoCapability::Available,
        )
        .await
        .unwrap_err();
        assert_eq!(
            err,
            crate::ConnectionError::Operation {
                operation: "add_sender",
                message: "no microphone".into(),
            }
        );
    }
}
