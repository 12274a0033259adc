use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use session_description::{SdpKind, SessionDescription};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::{RTCAnswerOptions, RTCOfferOptions};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::config::{IceServer, SessionConfig};
use crate::connection::{
    Connection, ConnectionEvent, ConnectionResult, DataChannel, DataChannelConfig,
    DataChannelDelegate, DataChannelState, IceCandidate, MediaConstraints, MediaKind,
    PeerConnectionState, SenderHandle,
};
use crate::error::ConnectionError;

struct SenderSlot {
    kind: MediaKind,
    track: Arc<TrackLocalStaticSample>,
    rtp_sender: Arc<RTCRtpSender>,
    enabled: Arc<AtomicBool>,
}

/// [`Connection`] backed by a webrtc-rs peer connection.
///
/// Senders live in this struct; callers only ever see [`SenderHandle`]s.
/// Events the transport raises on its own (local candidates, state changes,
/// channels opened by the remote peer) are delivered on the receiver
/// returned from [`WebRtcConnection::new`].
pub struct WebRtcConnection {
    peer_connection: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<u64, SenderSlot>>,
    next_sender: AtomicU64,
    receive_only: Mutex<HashSet<MediaKind>>,
    closed: AtomicBool,
}

impl WebRtcConnection {
    pub async fn new(
        config: &SessionConfig,
    ) -> ConnectionResult<(Self, mpsc::UnboundedReceiver<ConnectionEvent>)> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|err| ConnectionError::operation("register_codecs", err))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|err| ConnectionError::operation("register_interceptors", err))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config.ice_servers.iter().map(to_rtc_ice_server).collect(),
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        };

        let peer_connection = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|err| ConnectionError::operation("new_peer_connection", err))?,
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        install_event_handlers(&peer_connection, events_tx);

        debug!(
            target = "call_session::webrtc",
            ice_servers = config.ice_servers.len(),
            "peer connection created"
        );

        Ok((
            Self {
                peer_connection,
                senders: Mutex::new(HashMap::new()),
                next_sender: AtomicU64::new(0),
                receive_only: Mutex::new(HashSet::new()),
                closed: AtomicBool::new(false),
            },
            events_rx,
        ))
    }

    /// Feeds an encoded sample into a sender's track. Returns `Ok(false)`
    /// without writing while the sender is disabled.
    pub async fn write_sample(
        &self,
        sender: SenderHandle,
        sample: &Sample,
    ) -> ConnectionResult<bool> {
        let (track, enabled) = {
            let senders = self.senders.lock();
            let slot = senders
                .get(&sender.index())
                .ok_or(ConnectionError::UnknownSender(sender))?;
            (slot.track.clone(), slot.enabled.clone())
        };
        if !enabled.load(Ordering::Acquire) {
            return Ok(false);
        }
        track
            .write_sample(sample)
            .await
            .map_err(|err| ConnectionError::operation("write_sample", err))?;
        Ok(true)
    }

    fn ensure_open(&self) -> ConnectionResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnectionError::Closed);
        }
        Ok(())
    }

    /// Adds receive-only transceivers for kinds the constraints want to
    /// receive but no local sender covers.
    async fn ensure_receivers(&self, constraints: &MediaConstraints) -> ConnectionResult<()> {
        let wanted = [
            (MediaKind::Audio, constraints.offer_to_receive_audio),
            (MediaKind::Video, constraints.offer_to_receive_video),
        ];
        for (kind, wanted) in wanted {
            if !wanted {
                continue;
            }
            let covered = self.senders.lock().values().any(|slot| slot.kind == kind)
                || self.receive_only.lock().contains(&kind);
            if covered {
                continue;
            }
            self.peer_connection
                .add_transceiver_from_kind(
                    codec_type(kind),
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(|err| ConnectionError::operation("add_transceiver", err))?;
            self.receive_only.lock().insert(kind);
            trace!(target = "call_session::webrtc", %kind, "added receive-only transceiver");
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for WebRtcConnection {
    async fn create_offer(
        &self,
        constraints: &MediaConstraints,
    ) -> ConnectionResult<Option<SessionDescription>> {
        self.ensure_open()?;
        self.ensure_receivers(constraints).await?;
        let offer = self
            .peer_connection
            .create_offer(Some(RTCOfferOptions {
                voice_activity_detection: constraints.voice_activity_detection,
                ice_restart: constraints.ice_restart,
            }))
            .await
            .map_err(|err| ConnectionError::operation("create_offer", err))?;
        Ok(from_rtc_description(offer))
    }

    async fn create_answer(
        &self,
        constraints: &MediaConstraints,
    ) -> ConnectionResult<Option<SessionDescription>> {
        self.ensure_open()?;
        let answer = self
            .peer_connection
            .create_answer(Some(RTCAnswerOptions {
                voice_activity_detection: constraints.voice_activity_detection,
            }))
            .await
            .map_err(|err| ConnectionError::operation("create_answer", err))?;
        Ok(from_rtc_description(answer))
    }

    async fn set_local_description(&self, description: SessionDescription) -> ConnectionResult<()> {
        self.ensure_open()?;
        self.peer_connection
            .set_local_description(to_rtc_description(description)?)
            .await
            .map_err(|err| ConnectionError::operation("set_local_description", err))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> ConnectionResult<()> {
        self.ensure_open()?;
        self.peer_connection
            .set_remote_description(to_rtc_description(description)?)
            .await
            .map_err(|err| ConnectionError::operation("set_remote_description", err))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> ConnectionResult<()> {
        self.ensure_open()?;
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|err| ConnectionError::operation("add_ice_candidate", err))
    }

    async fn open_data_channel(
        &self,
        label: &str,
        config: &DataChannelConfig,
    ) -> ConnectionResult<Arc<dyn DataChannel>> {
        self.ensure_open()?;
        let init = RTCDataChannelInit {
            ordered: Some(config.ordered),
            max_retransmits: config.max_retransmits,
            ..Default::default()
        };
        let channel = self
            .peer_connection
            .create_data_channel(label, Some(init))
            .await
            .map_err(|err| ConnectionError::operation("open_data_channel", err))?;
        Ok(Arc::new(RtcDataChannel::wrap(channel)))
    }

    async fn add_sender(
        &self,
        kind: MediaKind,
        stream_id: &str,
        track_id: &str,
    ) -> ConnectionResult<SenderHandle> {
        self.ensure_open()?;
        let mime_type = match kind {
            MediaKind::Audio => MIME_TYPE_OPUS,
            MediaKind::Video => MIME_TYPE_VP8,
        };
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            track_id.to_owned(),
            stream_id.to_owned(),
        ));
        let rtp_sender = self
            .peer_connection
            .add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|err| ConnectionError::operation("add_sender", err))?;

        let handle = SenderHandle::new(self.next_sender.fetch_add(1, Ordering::Relaxed));
        self.senders.lock().insert(
            handle.index(),
            SenderSlot {
                kind,
                track,
                rtp_sender,
                enabled: Arc::new(AtomicBool::new(true)),
            },
        );
        debug!(target = "call_session::webrtc", %kind, track_id, %handle, "sender added");
        Ok(handle)
    }

    async fn remove_sender(&self, sender: SenderHandle) -> ConnectionResult<()> {
        let slot = self
            .senders
            .lock()
            .remove(&sender.index())
            .ok_or(ConnectionError::UnknownSender(sender))?;
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.peer_connection
            .remove_track(&slot.rtp_sender)
            .await
            .map_err(|err| ConnectionError::operation("remove_sender", err))
    }

    fn set_sender_enabled(&self, sender: SenderHandle, enabled: bool) -> ConnectionResult<()> {
        let senders = self.senders.lock();
        let slot = senders
            .get(&sender.index())
            .ok_or(ConnectionError::UnknownSender(sender))?;
        slot.enabled.store(enabled, Ordering::Release);
        trace!(target = "call_session::webrtc", %sender, enabled, "sender gated");
        Ok(())
    }

    async fn close(&self) -> ConnectionResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.senders.lock().clear();
        self.peer_connection
            .close()
            .await
            .map_err(|err| ConnectionError::operation("close", err))
    }
}

fn install_event_handlers(
    peer_connection: &Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) {
    let tx = events.clone();
    peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            let event = match candidate {
                None => ConnectionEvent::IceGatheringComplete,
                Some(candidate) => match candidate.to_json() {
                    Ok(init) => ConnectionEvent::LocalIceCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }),
                    Err(err) => {
                        warn!(
                            target = "call_session::webrtc",
                            error = %err,
                            "failed to serialize local ICE candidate"
                        );
                        return;
                    }
                },
            };
            let _ = tx.send(event);
        })
    }));

    let tx = events.clone();
    peer_connection.on_peer_connection_state_change(Box::new(
        move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                debug!(target = "call_session::webrtc", ?state, "peer connection state changed");
                if let Some(state) = from_rtc_state(state) {
                    let _ = tx.send(ConnectionEvent::StateChanged(state));
                }
            })
        },
    ));

    let tx = events;
    peer_connection.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
        let tx = tx.clone();
        Box::pin(async move {
            debug!(
                target = "call_session::webrtc",
                label = channel.label(),
                "remote peer opened data channel"
            );
            let channel: Arc<dyn DataChannel> = Arc::new(RtcDataChannel::wrap(channel));
            let _ = tx.send(ConnectionEvent::DataChannel(channel));
        })
    }));
}

type DelegateSlot = Arc<Mutex<Option<Arc<dyn DataChannelDelegate>>>>;

/// [`DataChannel`] over an `RTCDataChannel`. Messages that arrive before a
/// delegate is installed are dropped.
struct RtcDataChannel {
    inner: Arc<RTCDataChannel>,
    label: String,
    delegate: DelegateSlot,
}

impl RtcDataChannel {
    fn wrap(inner: Arc<RTCDataChannel>) -> Self {
        let label = inner.label().to_owned();
        let delegate: DelegateSlot = Arc::new(Mutex::new(None));

        let slot = delegate.clone();
        let name = label.clone();
        inner.on_message(Box::new(move |message: DataChannelMessage| {
            let current = slot.lock().clone();
            match current {
                Some(delegate) => delegate.on_message(&name, message.data),
                None => trace!(
                    target = "call_session::webrtc",
                    label = %name,
                    bytes = message.data.len(),
                    "dropping message for channel without delegate"
                ),
            }
            Box::pin(async {})
        }));

        let slot = delegate.clone();
        let name = label.clone();
        inner.on_open(Box::new(move || {
            if let Some(delegate) = slot.lock().clone() {
                delegate.on_state_change(&name, DataChannelState::Open);
            }
            Box::pin(async {})
        }));

        let slot = delegate.clone();
        let name = label.clone();
        inner.on_close(Box::new(move || {
            if let Some(delegate) = slot.lock().clone() {
                delegate.on_state_change(&name, DataChannelState::Closed);
            }
            Box::pin(async {})
        }));

        Self {
            inner,
            label,
            delegate,
        }
    }
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn set_delegate(&self, delegate: Arc<dyn DataChannelDelegate>) {
        *self.delegate.lock() = Some(delegate);
    }

    async fn send(&self, payload: Bytes) -> ConnectionResult<()> {
        // Signaling messages go out as text frames; anything else as binary.
        let result = match std::str::from_utf8(&payload) {
            Ok(text) => self.inner.send_text(text.to_owned()).await,
            Err(_) => self.inner.send(&payload).await,
        };
        result
            .map(|_| ())
            .map_err(|err| ConnectionError::operation("data_channel_send", err))
    }

    async fn close(&self) -> ConnectionResult<()> {
        self.inner
            .close()
            .await
            .map_err(|err| ConnectionError::operation("data_channel_close", err))
    }
}

fn to_rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone(),
        credential: server.credential.clone(),
        ..Default::default()
    }
}

fn codec_type(kind: MediaKind) -> RTPCodecType {
    match kind {
        MediaKind::Audio => RTPCodecType::Audio,
        MediaKind::Video => RTPCodecType::Video,
    }
}

fn to_rtc_description(description: SessionDescription) -> ConnectionResult<RTCSessionDescription> {
    let SessionDescription { kind, sdp } = description;
    let parsed = match kind {
        SdpKind::Offer => RTCSessionDescription::offer(sdp),
        SdpKind::Answer => RTCSessionDescription::answer(sdp),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(sdp),
    };
    parsed.map_err(|err| ConnectionError::InvalidDescription(err.to_string()))
}

fn from_rtc_description(description: RTCSessionDescription) -> Option<SessionDescription> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        _ => return None,
    };
    if description.sdp.is_empty() {
        return None;
    }
    Some(SessionDescription::new(kind, description.sdp))
}

fn from_rtc_state(state: RTCPeerConnectionState) -> Option<PeerConnectionState> {
    Some(match state {
        RTCPeerConnectionState::New => PeerConnectionState::New,
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
        _ => return None,
    })
}
