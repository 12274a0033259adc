use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::connection::{Connection, DataChannel, DataChannelConfig, DataChannelDelegate};
use crate::error::{SessionError, SessionResult};

#[derive(Default)]
enum Slot {
    #[default]
    Vacant,
    /// Reserved by an `open` that is still waiting on the transport.
    Opening(u64),
    Open(Arc<dyn DataChannel>),
}

#[derive(Default)]
struct BridgeState {
    slot: Slot,
    next_ticket: u64,
}

/// Owns the single in-band signaling channel of a session.
#[derive(Default)]
pub struct DataChannelBridge {
    state: Mutex<BridgeState>,
}

impl DataChannelBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the session's data channel and routes inbound traffic to
    /// `delegate`. Only one channel may exist per session; the slot is held
    /// while the transport opens the channel, so a concurrent `open` or
    /// `adopt` sees it as taken.
    pub async fn open(
        &self,
        connection: &dyn Connection,
        label: &str,
        config: &DataChannelConfig,
        delegate: Arc<dyn DataChannelDelegate>,
    ) -> SessionResult<()> {
        let reservation = self.reserve()?;
        let channel = connection
            .open_data_channel(label, config)
            .await
            .map_err(|err| SessionError::transport("open_data_channel", err))?;

        if !reservation.fulfil(channel.clone(), delegate) {
            // The reservation was released while the transport was busy.
            close_channel(channel.as_ref()).await;
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    /// Installs a channel announced by the remote peer.
    pub fn adopt(
        &self,
        channel: Arc<dyn DataChannel>,
        delegate: Arc<dyn DataChannelDelegate>,
    ) -> SessionResult<()> {
        let mut state = self.state.lock();
        if !matches!(state.slot, Slot::Vacant) {
            return Err(SessionError::AlreadyExists("data channel"));
        }
        install(&mut state.slot, channel, delegate);
        Ok(())
    }

    fn reserve(&self) -> SessionResult<Reservation<'_>> {
        let mut state = self.state.lock();
        if !matches!(state.slot, Slot::Vacant) {
            return Err(SessionError::AlreadyExists("data channel"));
        }
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.slot = Slot::Opening(ticket);
        Ok(Reservation {
            state: &self.state,
            ticket,
        })
    }

    fn current(&self) -> Option<Arc<dyn DataChannel>> {
        match &self.state.lock().slot {
            Slot::Open(channel) => Some(channel.clone()),
            _ => None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state.lock().slot, Slot::Open(_))
    }

    pub fn label(&self) -> Option<String> {
        self.current().map(|channel| channel.label().to_string())
    }

    /// Returns `false` when there is no channel yet or the transport refused
    /// the write.
    pub async fn send(&self, payload: Bytes) -> bool {
        let Some(channel) = self.current() else {
            error!(
                target = "call_session::data_channel",
                bytes = payload.len(),
                "ignoring send for missing data channel"
            );
            return false;
        };

        match channel.send(payload).await {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    target = "call_session::data_channel",
                    label = channel.label(),
                    error = %err,
                    "data channel send failed"
                );
                false
            }
        }
    }

    /// Drops the channel reference after asking the transport to close it.
    /// A pending `open` loses its reservation and closes its channel itself.
    pub async fn release(&self) {
        let slot = std::mem::take(&mut self.state.lock().slot);
        if let Slot::Open(channel) = slot {
            close_channel(channel.as_ref()).await;
        }
    }
}

/// Frees the slot again unless the pending `open` fills it, including when
/// the `open` future is dropped mid-await.
struct Reservation<'a> {
    state: &'a Mutex<BridgeState>,
    ticket: u64,
}

impl Reservation<'_> {
    fn holds(&self, slot: &Slot) -> bool {
        matches!(slot, Slot::Opening(ticket) if *ticket == self.ticket)
    }

    /// Returns `false` if the reservation was released in the meantime.
    fn fulfil(self, channel: Arc<dyn DataChannel>, delegate: Arc<dyn DataChannelDelegate>) -> bool {
        let mut state = self.state.lock();
        if !self.holds(&state.slot) {
            return false;
        }
        install(&mut state.slot, channel, delegate);
        true
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if self.holds(&state.slot) {
            state.slot = Slot::Vacant;
        }
    }
}

fn install(
    slot: &mut Slot,
    channel: Arc<dyn DataChannel>,
    delegate: Arc<dyn DataChannelDelegate>,
) {
    channel.set_delegate(delegate);
    info!(
        target = "call_session::data_channel",
        label = channel.label(),
        "data channel installed"
    );
    *slot = Slot::Open(channel);
}

async fn close_channel(channel: &dyn DataChannel) {
    if let Err(err) = channel.close().await {
        debug!(
            target = "call_session::data_channel",
            label = channel.label(),
            error = %err,
            "data channel close failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::mock::{ConnectionOp, MockConnection, MockDataChannel, RecordingDelegate};

    const WAIT: Duration = Duration::from_secs(5);

    fn spawn_open(
        connection: &Arc<MockConnection>,
        bridge: &Arc<DataChannelBridge>,
    ) -> tokio::task::JoinHandle<SessionResult<()>> {
        let (connection, bridge) = (connection.clone(), bridge.clone());
        tokio::spawn(async move {
            bridge
                .open(
                    connection.as_ref(),
                    "signaling",
                    &DataChannelConfig::default(),
                    Arc::new(RecordingDelegate::default()),
                )
                .await
        })
    }

    #[tokio::test]
    async fn send_without_channel_reports_not_ready() {
        let bridge = DataChannelBridge::new();
        assert!(!bridge.send(Bytes::from_static(b"hangup")).await);
        assert!(!bridge.is_open());
    }

    #[tokio::test]
    async fn open_routes_messages_both_ways() {
        let (connection, probe) = MockConnection::new();
        let bridge = DataChannelBridge::new();
        let delegate = Arc::new(RecordingDelegate::default());

        bridge
            .open(
                &connection,
                "signaling",
                &DataChannelConfig::default(),
                delegate.clone(),
            )
            .await
            .expect("open ok");
        assert_eq!(bridge.label().as_deref(), Some("signaling"));

        assert!(bridge.send(Bytes::from_static(b"connected")).await);
        let channel = probe.data_channel("signaling").expect("channel exists");
        assert_eq!(channel.sent(), vec![Bytes::from_static(b"connected")]);

        channel.deliver(Bytes::from_static(b"hangup"));
        assert_eq!(
            delegate.messages(),
            vec![("signaling".to_string(), Bytes::from_static(b"hangup"))]
        );
    }

    #[tokio::test]
    async fn only_one_channel_per_session() {
        let (connection, _probe) = MockConnection::new();
        let bridge = DataChannelBridge::new();
        let delegate = Arc::new(RecordingDelegate::default());
        bridge
            .open(&connection, "signaling", &DataChannelConfig::default(), delegate.clone())
            .await
            .unwrap();

        let err = bridge
            .open(&connection, "second", &DataChannelConfig::default(), delegate.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::AlreadyExists("data channel")));

        let remote = Arc::new(MockDataChannel::new("remote"));
        assert!(bridge.adopt(remote, delegate).is_err());
    }

    #[tokio::test]
    async fn adopt_remote_channel() {
        let bridge = DataChannelBridge::new();
        let delegate = Arc::new(RecordingDelegate::default());
        let remote = Arc::new(MockDataChannel::new("signaling"));

        bridge.adopt(remote.clone(), delegate.clone()).unwrap();
        remote.deliver(Bytes::from_static(b"busy"));
        assert_eq!(delegate.messages().len(), 1);
        assert!(bridge.send(Bytes::from_static(b"ok")).await);
        assert_eq!(remote.sent(), vec![Bytes::from_static(b"ok")]);
    }

    #[tokio::test]
    async fn failed_send_returns_false() {
        let bridge = DataChannelBridge::new();
        let remote = Arc::new(MockDataChannel::new("signaling"));
        bridge
            .adopt(remote.clone(), Arc::new(RecordingDelegate::default()))
            .unwrap();
        remote.close_now();
        assert!(!bridge.send(Bytes::from_static(b"late")).await);
    }

    #[tokio::test]
    async fn release_closes_channel() {
        let bridge = DataChannelBridge::new();
        let remote = Arc::new(MockDataChannel::new("signaling"));
        bridge
            .adopt(remote.clone(), Arc::new(RecordingDelegate::default()))
            .unwrap();

        bridge.release().await;
        bridge.release().await;
        assert!(remote.is_closed());
        assert!(!bridge.is_open());
        assert!(!bridge.send(Bytes::from_static(b"after")).await);
    }

    #[tokio::test]
    async fn slot_is_reserved_while_opening() {
        let (connection, probe) = MockConnection::new();
        let connection = Arc::new(connection);
        let bridge = Arc::new(DataChannelBridge::new());
        let hold = probe.hold_next(ConnectionOp::OpenDataChannel);

        let pending = spawn_open(&connection, &bridge);
        tokio::time::timeout(WAIT, probe.wait_for_invocation(ConnectionOp::OpenDataChannel))
            .await
            .expect("open requested");

        let remote = Arc::new(MockDataChannel::new("remote"));
        let err = bridge
            .adopt(remote.clone(), Arc::new(RecordingDelegate::default()))
            .unwrap_err();
        assert!(matches!(err, SessionError::AlreadyExists("data channel")));
        let err = bridge
            .open(
                connection.as_ref(),
                "second",
                &DataChannelConfig::default(),
                Arc::new(RecordingDelegate::default()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::AlreadyExists("data channel")));
        assert!(!bridge.is_open());
        assert!(!bridge.send(Bytes::from_static(b"early")).await);

        hold.release();
        tokio::time::timeout(WAIT, pending)
            .await
            .expect("open finished")
            .expect("task joined")
            .expect("open ok");

        let channel = probe.data_channel("signaling").expect("signaling channel");
        assert!(!channel.is_closed());
        assert_eq!(bridge.label().as_deref(), Some("signaling"));
        assert!(bridge.send(Bytes::from_static(b"ready")).await);
        assert_eq!(channel.sent(), vec![Bytes::from_static(b"ready")]);
        assert!(remote.sent().is_empty());
    }

    #[tokio::test]
    async fn release_during_open_closes_the_new_channel() {
        let (connection, probe) = MockConnection::new();
        let connection = Arc::new(connection);
        let bridge = Arc::new(DataChannelBridge::new());
        let hold = probe.hold_next(ConnectionOp::OpenDataChannel);

        let pending = spawn_open(&connection, &bridge);
        tokio::time::timeout(WAIT, probe.wait_for_invocation(ConnectionOp::OpenDataChannel))
            .await
            .expect("open requested");
        bridge.release().await;

        hold.release();
        let result = tokio::time::timeout(WAIT, pending)
            .await
            .expect("open finished")
            .expect("task joined");
        assert!(matches!(result, Err(SessionError::Closed)));

        let channel = probe.data_channel("signaling").expect("signaling channel");
        assert!(channel.is_closed());
        assert!(!bridge.is_open());
    }

    #[tokio::test]
    async fn failed_open_frees_the_slot() {
        let (connection, probe) = MockConnection::new();
        let bridge = DataChannelBridge::new();
        probe.fail_next(ConnectionOp::OpenDataChannel, "sctp not negotiated");

        let err = bridge
            .open(
                &connection,
                "signaling",
                &DataChannelConfig::default(),
                Arc::new(RecordingDelegate::default()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Transport { operation: "open_data_channel", .. }));

        let remote = Arc::new(MockDataChannel::new("signaling"));
        bridge
            .adopt(remote, Arc::new(RecordingDelegate::default()))
            .expect("slot is free again");
        assert!(bridge.is_open());
    }
}
