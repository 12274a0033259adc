//! In-memory [`Connection`] for tests.
//!
//! [`MockConnection`] records every operation and can be scripted through
//! its paired [`MockProbe`] to fail, return nothing, or stay pending until
//! released.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use session_description::SessionDescription;
use tokio::sync::{Notify, oneshot};

use crate::connection::{
    Connection, ConnectionResult, DataChannel, DataChannelConfig, DataChannelDelegate,
    DataChannelState, IceCandidate, MediaConstraints, MediaKind, SenderHandle,
};
use crate::error::ConnectionError;

pub mod fixtures {
    pub const OFFER_SDP: &str = "v=0\r\n\
o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0 1\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:0\r\n\
a=extmap:1 urn:ietf:params:rtp-hdrext:ssrc-audio-level\r\n\
a=sendrecv\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=fmtp:111 minptime=10;useinbandfec=1\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:1\r\n\
a=rtpmap:96 VP8/90000\r\n";

    pub const ANSWER_SDP: &str = "v=0\r\n\
o=- 7283920130558810214 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0 1\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:0\r\n\
a=extmap:1 urn:ietf:params:rtp-hdrext:ssrc-audio-level\r\n\
a=sendrecv\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=fmtp:111 minptime=10;useinbandfec=1\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:1\r\n\
a=rtpmap:96 VP8/90000\r\n";

    pub const CANDIDATE: &str =
        "candidate:842163049 1 udp 1677729535 203.0.113.7 46154 typ srflx raddr 0.0.0.0 rport 0";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionOp {
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    AddIceCandidate,
    OpenDataChannel,
    AddSender,
    RemoveSender,
    SetSenderEnabled,
    Close,
}

impl ConnectionOp {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionOp::CreateOffer => "create_offer",
            ConnectionOp::CreateAnswer => "create_answer",
            ConnectionOp::SetLocalDescription => "set_local_description",
            ConnectionOp::SetRemoteDescription => "set_remote_description",
            ConnectionOp::AddIceCandidate => "add_ice_candidate",
            ConnectionOp::OpenDataChannel => "open_data_channel",
            ConnectionOp::AddSender => "add_sender",
            ConnectionOp::RemoveSender => "remove_sender",
            ConnectionOp::SetSenderEnabled => "set_sender_enabled",
            ConnectionOp::Close => "close",
        }
    }

    /// Offer/answer operations, as opposed to media or channel plumbing.
    pub fn is_negotiation(self) -> bool {
        matches!(
            self,
            ConnectionOp::CreateOffer
                | ConnectionOp::CreateAnswer
                | ConnectionOp::SetLocalDescription
                | ConnectionOp::SetRemoteDescription
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockEvent {
    Invoked(ConnectionOp),
    Completed { op: ConnectionOp, ok: bool },
}

impl MockEvent {
    pub fn invoked(&self, op: ConnectionOp) -> bool {
        *self == MockEvent::Invoked(op)
    }

    pub fn completed(&self, op: ConnectionOp) -> bool {
        matches!(self, MockEvent::Completed { op: done, .. } if *done == op)
    }
}

enum Script {
    Fail(String),
    Empty,
    Respond(SessionDescription),
    Hold(oneshot::Receiver<()>),
}

/// Keeps a held operation pending until released or dropped.
pub struct HoldHandle(oneshot::Sender<()>);

impl HoldHandle {
    pub fn release(self) {
        let _ = self.0.send(());
    }
}

#[derive(Debug, Clone)]
struct MockSender {
    kind: MediaKind,
    track_id: String,
    enabled: bool,
}

#[derive(Default)]
struct MockState {
    log: Vec<MockEvent>,
    scripts: HashMap<ConnectionOp, VecDeque<Script>>,
    local: Vec<SessionDescription>,
    remote: Vec<SessionDescription>,
    candidates: Vec<IceCandidate>,
    senders: BTreeMap<u64, MockSender>,
    added: Vec<(MediaKind, String, String)>,
    next_sender: u64,
    channels: Vec<Arc<MockDataChannel>>,
    closed: bool,
}

#[derive(Default)]
struct Inner {
    state: Mutex<MockState>,
    invoked: Notify,
}

enum Outcome {
    Proceed,
    Fail(String),
    Empty,
    Respond(SessionDescription),
}

pub struct MockConnection {
    inner: Arc<Inner>,
}

/// Test-side view of a [`MockConnection`].
#[derive(Clone)]
pub struct MockProbe {
    inner: Arc<Inner>,
}

impl MockConnection {
    pub fn new() -> (Self, MockProbe) {
        let inner = Arc::new(Inner::default());
        (
            Self {
                inner: inner.clone(),
            },
            MockProbe { inner },
        )
    }

    async fn begin(&self, op: ConnectionOp) -> Outcome {
        let script = {
            let mut state = self.inner.state.lock();
            state.log.push(MockEvent::Invoked(op));
            state.scripts.get_mut(&op).and_then(VecDeque::pop_front)
        };
        self.inner.invoked.notify_waiters();

        match script {
            None => Outcome::Proceed,
            Some(Script::Fail(message)) => Outcome::Fail(message),
            Some(Script::Empty) => Outcome::Empty,
            Some(Script::Respond(description)) => Outcome::Respond(description),
            Some(Script::Hold(release)) => {
                let _ = release.await;
                Outcome::Proceed
            }
        }
    }

    fn begin_sync(&self, op: ConnectionOp) -> Outcome {
        let script = {
            let mut state = self.inner.state.lock();
            state.log.push(MockEvent::Invoked(op));
            state.scripts.get_mut(&op).and_then(VecDeque::pop_front)
        };
        self.inner.invoked.notify_waiters();
        match script {
            Some(Script::Fail(message)) => Outcome::Fail(message),
            _ => Outcome::Proceed,
        }
    }

    fn finish<T>(&self, op: ConnectionOp, result: ConnectionResult<T>) -> ConnectionResult<T> {
        self.inner.state.lock().log.push(MockEvent::Completed {
            op,
            ok: result.is_ok(),
        });
        result
    }

    fn ensure_open(&self) -> ConnectionResult<()> {
        if self.inner.state.lock().closed {
            return Err(ConnectionError::Closed);
        }
        Ok(())
    }

    async fn describe(
        &self,
        op: ConnectionOp,
        fallback: fn() -> SessionDescription,
    ) -> ConnectionResult<Option<SessionDescription>> {
        let result = match self.begin(op).await {
            Outcome::Fail(message) => Err(ConnectionError::operation(op.as_str(), message)),
            Outcome::Empty => Ok(None),
            Outcome::Respond(description) => Ok(Some(description)),
            Outcome::Proceed => self.ensure_open().map(|()| Some(fallback())),
        };
        self.finish(op, result)
    }

    async fn record<T>(
        &self,
        op: ConnectionOp,
        apply: impl FnOnce(&mut MockState) -> ConnectionResult<T>,
    ) -> ConnectionResult<T> {
        let result = match self.begin(op).await {
            Outcome::Fail(message) => Err(ConnectionError::operation(op.as_str(), message)),
            _ => {
                let mut state = self.inner.state.lock();
                if state.closed {
                    Err(ConnectionError::Closed)
                } else {
                    apply(&mut state)
                }
            }
        };
        self.finish(op, result)
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn create_offer(
        &self,
        _constraints: &MediaConstraints,
    ) -> ConnectionResult<Option<SessionDescription>> {
        self.describe(ConnectionOp::CreateOffer, || {
            SessionDescription::offer(fixtures::OFFER_SDP)
        })
        .await
    }

    async fn create_answer(
        &self,
        _constraints: &MediaConstraints,
    ) -> ConnectionResult<Option<SessionDescription>> {
        self.describe(ConnectionOp::CreateAnswer, || {
            SessionDescription::answer(fixtures::ANSWER_SDP)
        })
        .await
    }

    async fn set_local_description(&self, description: SessionDescription) -> ConnectionResult<()> {
        self.record(ConnectionOp::SetLocalDescription, |state| {
            state.local.push(description);
            Ok(())
        })
        .await
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> ConnectionResult<()> {
        self.record(ConnectionOp::SetRemoteDescription, |state| {
            state.remote.push(description);
            Ok(())
        })
        .await
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> ConnectionResult<()> {
        self.record(ConnectionOp::AddIceCandidate, |state| {
            state.candidates.push(candidate);
            Ok(())
        })
        .await
    }

    async fn open_data_channel(
        &self,
        label: &str,
        _config: &DataChannelConfig,
    ) -> ConnectionResult<Arc<dyn DataChannel>> {
        self.record(ConnectionOp::OpenDataChannel, |state| {
            let channel = Arc::new(MockDataChannel::new(label));
            state.channels.push(channel.clone());
            Ok(channel as Arc<dyn DataChannel>)
        })
        .await
    }

    async fn add_sender(
        &self,
        kind: MediaKind,
        stream_id: &str,
        track_id: &str,
    ) -> ConnectionResult<SenderHandle> {
        self.record(ConnectionOp::AddSender, |state| {
            let index = state.next_sender;
            state.next_sender += 1;
            state.senders.insert(
                index,
                MockSender {
                    kind,
                    track_id: track_id.to_string(),
                    enabled: true,
                },
            );
            state
                .added
                .push((kind, stream_id.to_string(), track_id.to_string()));
            Ok(SenderHandle::new(index))
        })
        .await
    }

    async fn remove_sender(&self, sender: SenderHandle) -> ConnectionResult<()> {
        self.record(ConnectionOp::RemoveSender, |state| {
            state
                .senders
                .remove(&sender.index())
                .map(|_| ())
                .ok_or(ConnectionError::UnknownSender(sender))
        })
        .await
    }

    fn set_sender_enabled(&self, sender: SenderHandle, enabled: bool) -> ConnectionResult<()> {
        let op = ConnectionOp::SetSenderEnabled;
        let result = match self.begin_sync(op) {
            Outcome::Fail(message) => Err(ConnectionError::operation(op.as_str(), message)),
            _ => {
                let mut state = self.inner.state.lock();
                match state.senders.get_mut(&sender.index()) {
                    Some(slot) => {
                        slot.enabled = enabled;
                        Ok(())
                    }
                    None => Err(ConnectionError::UnknownSender(sender)),
                }
            }
        };
        self.finish(op, result)
    }

    async fn close(&self) -> ConnectionResult<()> {
        let op = ConnectionOp::Close;
        let result = match self.begin(op).await {
            Outcome::Fail(message) => Err(ConnectionError::operation(op.as_str(), message)),
            _ => {
                self.inner.state.lock().closed = true;
                Ok(())
            }
        };
        self.finish(op, result)
    }
}

impl MockProbe {
    fn script(&self, op: ConnectionOp, script: Script) {
        self.inner
            .state
            .lock()
            .scripts
            .entry(op)
            .or_default()
            .push_back(script);
    }

    /// The next call to `op` fails with `message`.
    pub fn fail_next(&self, op: ConnectionOp, message: impl Into<String>) {
        self.script(op, Script::Fail(message.into()));
    }

    /// The next offer or answer succeeds without producing a description.
    pub fn respond_empty_next(&self, op: ConnectionOp) {
        self.script(op, Script::Empty);
    }

    pub fn respond_with_next(&self, op: ConnectionOp, description: SessionDescription) {
        self.script(op, Script::Respond(description));
    }

    /// The next call to `op` stays pending until the handle is released.
    pub fn hold_next(&self, op: ConnectionOp) -> HoldHandle {
        let (tx, rx) = oneshot::channel();
        self.script(op, Script::Hold(rx));
        HoldHandle(tx)
    }

    /// Resolves once `op` has been invoked at least once.
    pub async fn wait_for_invocation(&self, op: ConnectionOp) {
        loop {
            let notified = self.inner.invoked.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.invoked().contains(&op) {
                return;
            }
            notified.await;
        }
    }

    pub fn log(&self) -> Vec<MockEvent> {
        self.inner.state.lock().log.clone()
    }

    pub fn invoked(&self) -> Vec<ConnectionOp> {
        self.inner
            .state
            .lock()
            .log
            .iter()
            .filter_map(|event| match event {
                MockEvent::Invoked(op) => Some(*op),
                MockEvent::Completed { .. } => None,
            })
            .collect()
    }

    pub fn local_descriptions(&self) -> Vec<SessionDescription> {
        self.inner.state.lock().local.clone()
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.inner.state.lock().remote.clone()
    }

    pub fn ice_candidates(&self) -> Vec<IceCandidate> {
        self.inner.state.lock().candidates.clone()
    }

    /// Every sender ever added, in order, as `(kind, stream_id, track_id)`.
    pub fn senders(&self) -> Vec<(MediaKind, String, String)> {
        self.inner.state.lock().added.clone()
    }

    /// Senders still attached to the connection.
    pub fn attached_senders(&self) -> Vec<(MediaKind, String)> {
        self.inner
            .state
            .lock()
            .senders
            .values()
            .map(|sender| (sender.kind, sender.track_id.clone()))
            .collect()
    }

    pub fn sender_enabled(&self, sender: SenderHandle) -> Option<bool> {
        self.inner
            .state
            .lock()
            .senders
            .get(&sender.index())
            .map(|slot| slot.enabled)
    }

    pub fn data_channel(&self, label: &str) -> Option<Arc<MockDataChannel>> {
        self.inner
            .state
            .lock()
            .channels
            .iter()
            .find(|channel| channel.label == label)
            .cloned()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }
}

/// Data channel that keeps sent payloads and lets tests inject inbound ones.
pub struct MockDataChannel {
    label: String,
    delegate: Mutex<Option<Arc<dyn DataChannelDelegate>>>,
    sent: Mutex<Vec<Bytes>>,
    closed: AtomicBool,
}

impl MockDataChannel {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            delegate: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    /// Simulates a message from the remote peer.
    pub fn deliver(&self, payload: Bytes) {
        let delegate = self.delegate.lock().clone();
        if let Some(delegate) = delegate {
            delegate.on_message(&self.label, payload);
        }
    }

    /// Simulates the remote peer closing the channel.
    pub fn close_now(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify(DataChannelState::Closed);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn notify(&self, state: DataChannelState) {
        let delegate = self.delegate.lock().clone();
        if let Some(delegate) = delegate {
            delegate.on_state_change(&self.label, state);
        }
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn set_delegate(&self, delegate: Arc<dyn DataChannelDelegate>) {
        *self.delegate.lock() = Some(delegate);
    }

    async fn send(&self, payload: Bytes) -> ConnectionResult<()> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        self.sent.lock().push(payload);
        Ok(())
    }

    async fn close(&self) -> ConnectionResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.notify(DataChannelState::Closed);
        }
        Ok(())
    }
}

/// Delegate that remembers everything it was told.
#[derive(Default)]
pub struct RecordingDelegate {
    messages: Mutex<Vec<(String, Bytes)>>,
    states: Mutex<Vec<(String, DataChannelState)>>,
}

impl RecordingDelegate {
    pub fn messages(&self) -> Vec<(String, Bytes)> {
        self.messages.lock().clone()
    }

    pub fn states(&self) -> Vec<(String, DataChannelState)> {
        self.states.lock().clone()
    }
}

impl DataChannelDelegate for RecordingDelegate {
    fn on_message(&self, label: &str, payload: Bytes) {
        self.messages.lock().push((label.to_string(), payload));
    }

    fn on_state_change(&self, label: &str, state: DataChannelState) {
        self.states.lock().push((label.to_string(), state));
    }
}
