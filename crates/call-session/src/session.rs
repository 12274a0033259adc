use std::sync::Arc;

use bytes::Bytes;
use session_description::{HardenedSessionDescription, SessionDescription};
use tracing::{debug, info, warn};

use crate::config::{IceServer, SessionConfig};
use crate::connection::{
    Connection, DataChannel, DataChannelDelegate, IceCandidate, MediaConstraints,
};
use crate::coordinator::{NegotiationCoordinator, NegotiationState};
use crate::data_channel::DataChannelBridge;
use crate::error::{SessionError, SessionResult};
use crate::media::MediaTrackController;

/// One call attempt: the transport, its local tracks, the signaling channel
/// and the negotiation state, torn down together by [`terminate`].
///
/// [`terminate`]: PeerConnectionSession::terminate
pub struct PeerConnectionSession {
    config: SessionConfig,
    coordinator: NegotiationCoordinator,
    media: MediaTrackController,
    data_channel: DataChannelBridge,
}

impl PeerConnectionSession {
    /// Takes ownership of `connection` and provisions the local tracks,
    /// disabled. If provisioning fails the connection is closed.
    pub async fn establish<C>(connection: C, config: SessionConfig) -> SessionResult<Self>
    where
        C: Connection + 'static,
    {
        let connection: Arc<dyn Connection> = Arc::new(connection);
        info!(
            target = "call_session::session",
            ice_servers = config.ice_servers.len(),
            video = config.video.is_available(),
            "establishing peer connection session"
        );

        let media = match MediaTrackController::provision(
            connection.as_ref(),
            &config.identifiers,
            &config.video,
        )
        .await
        {
            Ok(media) => media,
            Err(err) => {
                warn!(
                    target = "call_session::session",
                    error = %err,
                    "failed to provision local media"
                );
                if let Err(close_err) = connection.close().await {
                    debug!(
                        target = "call_session::session",
                        error = %close_err,
                        "close after failed setup also failed"
                    );
                }
                return Err(SessionError::transport("establish", err));
            }
        };

        Ok(Self {
            config,
            coordinator: NegotiationCoordinator::new(connection),
            media,
            data_channel: DataChannelBridge::new(),
        })
    }

    pub fn state(&self) -> NegotiationState {
        self.coordinator.state()
    }

    pub fn is_terminated(&self) -> bool {
        self.coordinator.is_closed()
    }

    pub fn ice_servers(&self) -> &[IceServer] {
        &self.config.ice_servers
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Creates an offer with the configured constraints.
    pub async fn create_offer(&self) -> SessionResult<HardenedSessionDescription> {
        self.coordinator
            .create_offer(&self.config.offer_constraints)
            .await
    }

    pub async fn create_offer_with(
        &self,
        constraints: &MediaConstraints,
    ) -> SessionResult<HardenedSessionDescription> {
        self.coordinator.create_offer(constraints).await
    }

    pub async fn set_local_description(
        &self,
        description: &HardenedSessionDescription,
    ) -> SessionResult<()> {
        self.coordinator.set_local_description(description).await
    }

    pub async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> SessionResult<()> {
        self.coordinator.set_remote_description(description).await
    }

    pub async fn negotiate_answer(
        &self,
        constraints: &MediaConstraints,
    ) -> SessionResult<HardenedSessionDescription> {
        self.coordinator.negotiate_answer(constraints).await
    }

    pub async fn negotiate(
        &self,
        remote: SessionDescription,
        constraints: &MediaConstraints,
    ) -> SessionResult<HardenedSessionDescription> {
        self.coordinator.negotiate(remote, constraints).await
    }

    pub async fn add_ice_candidate(&self, candidate: IceCandidate) {
        self.coordinator.add_ice_candidate(candidate).await;
    }

    pub fn set_audio_enabled(&self, enabled: bool) -> SessionResult<()> {
        self.ensure_live()?;
        let result = self
            .media
            .set_audio_enabled(self.coordinator.connection(), enabled);
        self.settle_toggle(result)
    }

    pub fn set_video_enabled(&self, enabled: bool) -> SessionResult<()> {
        self.ensure_live()?;
        let result = self
            .media
            .set_video_enabled(self.coordinator.connection(), enabled);
        self.settle_toggle(result)
    }

    pub fn has_audio_track(&self) -> bool {
        self.media.audio().is_some()
    }

    pub fn has_video_track(&self) -> bool {
        self.media.video().is_some()
    }

    /// Opens the configured signaling data channel.
    pub async fn open_signaling_channel(
        &self,
        delegate: Arc<dyn DataChannelDelegate>,
    ) -> SessionResult<()> {
        self.ensure_live()?;
        self.data_channel
            .open(
                self.coordinator.connection(),
                &self.config.identifiers.data_channel_label,
                &self.config.data_channel,
                delegate,
            )
            .await?;

        if self.coordinator.is_closed() {
            // Terminated while the channel was opening.
            self.data_channel.release().await;
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    /// Installs a data channel the remote peer opened.
    pub fn adopt_data_channel(
        &self,
        channel: Arc<dyn DataChannel>,
        delegate: Arc<dyn DataChannelDelegate>,
    ) -> SessionResult<()> {
        self.ensure_live()?;
        self.data_channel.adopt(channel, delegate)
    }

    pub fn has_data_channel(&self) -> bool {
        self.data_channel.is_open()
    }

    /// Returns `false` if there is no channel, the session is terminated, or
    /// the transport refused the write.
    pub async fn send_data_channel_message(&self, payload: Bytes) -> bool {
        if self.coordinator.is_closed() {
            debug!(
                target = "call_session::session",
                bytes = payload.len(),
                "dropping data channel message for terminated session"
            );
            return false;
        }
        self.data_channel.send(payload).await
    }

    /// Releases tracks and the data channel, then closes the transport.
    /// Safe to call repeatedly and while a negotiation is still pending.
    pub async fn terminate(&self) {
        if !self.coordinator.close() {
            debug!(target = "call_session::session", "session already terminated");
            return;
        }

        let connection = self.coordinator.connection();
        self.media.release(connection).await;
        self.data_channel.release().await;
        if let Err(err) = connection.close().await {
            warn!(
                target = "call_session::session",
                error = %err,
                "transport close failed"
            );
        }
        info!(target = "call_session::session", "session terminated");
    }

    /// `terminate` closes the coordinator before it releases the tracks, so a
    /// toggle that lost its track to a concurrent terminate reports `Closed`.
    fn settle_toggle(&self, result: SessionResult<()>) -> SessionResult<()> {
        match result {
            Err(_) if self.coordinator.is_closed() => Err(SessionError::Closed),
            other => other,
        }
    }

    fn ensure_live(&self) -> SessionResult<()> {
        if self.coordinator.is_closed() {
            return Err(SessionError::Closed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SessionConfigBuilder, VideoCapability};
    use crate::mock::{ConnectionOp, MockConnection, RecordingDelegate};

    fn config() -> SessionConfig {
        SessionConfigBuilder::new()
            .add_ice_server(vec!["stun:stun.example.org:3478".into()])
            .video(VideoCapability::Available)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn establish_provisions_disabled_tracks() {
        let (connection, probe) = MockConnection::new();
        let session = PeerConnectionSession::establish(connection, config())
            .await
            .expect("session");

        assert_eq!(session.state(), NegotiationState::New);
        assert!(session.has_audio_track());
        assert!(session.has_video_track());
        assert!(!session.has_data_channel());
        assert_eq!(session.ice_servers()[0].urls, vec!["stun:stun.example.org:3478"]);
        assert_eq!(probe.attached_senders().len(), 2);
        assert!(!probe.invoked().iter().any(|op| op.is_negotiation()));
    }

    #[tokio::test]
    async fn failed_setup_closes_transport() {
        let (connection, probe) = MockConnection::new();
        probe.fail_next(ConnectionOp::AddSender, "no microphone permission");
        let err = PeerConnectionSession::establish(connection, config())
            .await
            .err()
            .expect("setup fails");
        assert!(matches!(err, SessionError::Transport { operation: "establish", .. }));
        assert!(probe.is_closed());
    }

    #[tokio::test]
    async fn terminate_rejects_later_operations() {
        let (connection, probe) = MockConnection::new();
        let session = PeerConnectionSession::establish(connection, config())
            .await
            .unwrap();
        session.terminate().await;

        assert!(session.is_terminated());
        assert!(matches!(session.create_offer().await, Err(SessionError::Closed)));
        assert!(matches!(session.set_audio_enabled(true), Err(SessionError::Closed)));
        assert!(matches!(
            session
                .open_signaling_channel(Arc::new(RecordingDelegate::default()))
                .await,
            Err(SessionError::Closed)
        ));
        assert!(!session.send_data_channel_message(Bytes::from_static(b"x")).await);
        assert_eq!(
            probe
                .invoked()
                .iter()
                .filter(|op| **op == ConnectionOp::Close)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn toggle_overtaken_by_terminate_reports_closed() {
        let (connection, _probe) = MockConnection::new();
        let session = PeerConnectionSession::establish(connection, config())
            .await
            .unwrap();
        assert!(session.set_audio_enabled(true).is_ok());

        // The toggle passed its liveness check, then terminate ran to the
        // point of releasing the tracks.
        assert!(session.coordinator.close());
        session.media.release(session.coordinator.connection()).await;
        let result = session
            .media
            .set_audio_enabled(session.coordinator.connection(), false);
        assert!(matches!(result, Err(SessionError::NotReady("audio track"))));
        assert!(matches!(session.settle_toggle(result), Err(SessionError::Closed)));
        assert!(matches!(session.set_video_enabled(true), Err(SessionError::Closed)));
    }
}
