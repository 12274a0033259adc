use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use session_description::{HardenedSessionDescription, SdpKind, SessionDescription};
use tokio::sync::{Semaphore, SemaphorePermit, TryAcquireError};
use tracing::{debug, error, info, trace, warn};

use crate::connection::{Connection, ConnectionResult, IceCandidate, MediaConstraints};
use crate::error::{SessionError, SessionResult};

use NegotiationState::*;

/// Where a session is in the offer/answer exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    New,
    /// An offer was generated but not yet applied locally.
    LocalOfferPending,
    LocalOfferSet,
    /// A remote offer has been applied; an answer is due.
    Negotiating,
    /// An answer was generated but not yet applied locally.
    AnswerPending,
    Negotiated,
    Closed,
}

impl NegotiationState {
    pub fn as_str(self) -> &'static str {
        match self {
            New => "new",
            LocalOfferPending => "local offer pending",
            LocalOfferSet => "local offer set",
            Negotiating => "negotiating",
            AnswerPending => "answer pending",
            Negotiated => "negotiated",
            Closed => "closed",
        }
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const CREATE_OFFER_FROM: &[NegotiationState] = &[New, LocalOfferPending, Negotiated];
const REMOTE_OFFER_FROM: &[NegotiationState] = &[New, LocalOfferPending, Negotiated];
const REMOTE_ANSWER_FROM: &[NegotiationState] = &[LocalOfferSet];
const LOCAL_OFFER_FROM: &[NegotiationState] = &[LocalOfferPending];
const LOCAL_ANSWER_FROM: &[NegotiationState] = &[AnswerPending];
const ANSWER_FROM: &[NegotiationState] = &[Negotiating, AnswerPending];

#[derive(Debug, Default)]
struct IceBuffer {
    remote_applied: bool,
    /// Set while buffered candidates are being handed to the transport. New
    /// candidates queue behind them until the buffer is empty.
    flushing: bool,
    pending: Vec<IceCandidate>,
}

/// Sequences transport operations into the offer and answer protocols.
///
/// Every negotiation operation takes the coordinator's single permit for its
/// whole duration, so overlapping calls fail fast with [`SessionError::Busy`]
/// instead of interleaving. Once closed, completions still in flight are
/// discarded and reported as [`SessionError::Closed`].
pub struct NegotiationCoordinator {
    connection: Arc<dyn Connection>,
    state: Mutex<NegotiationState>,
    permit: Semaphore,
    ice: Mutex<IceBuffer>,
    /// The last description this coordinator generated. Only it may be
    /// applied through [`set_local_description`](Self::set_local_description).
    issued: Mutex<Option<HardenedSessionDescription>>,
}

impl NegotiationCoordinator {
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self {
            connection,
            state: Mutex::new(New),
            permit: Semaphore::new(1),
            ice: Mutex::new(IceBuffer::default()),
            issued: Mutex::new(None),
        }
    }

    pub fn state(&self) -> NegotiationState {
        *self.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == Closed
    }

    pub(crate) fn connection(&self) -> &dyn Connection {
        self.connection.as_ref()
    }

    /// Generates a hardened offer. The offer is not applied locally; call
    /// [`set_local_description`](Self::set_local_description) to commit to it.
    pub async fn create_offer(
        &self,
        constraints: &MediaConstraints,
    ) -> SessionResult<HardenedSessionDescription> {
        const OP: &str = "create_offer";
        let _permit = self.acquire(OP)?;
        self.expect_state(OP, CREATE_OFFER_FROM)?;

        let result = self.connection.create_offer(constraints).await;
        self.ensure_open_after(OP)?;
        let offer = HardenedSessionDescription::from(require_description(
            OP,
            SdpKind::Offer,
            result,
        )?);

        self.transition(OP, LocalOfferPending)?;
        self.issue(&offer);
        Ok(offer)
    }

    /// Applies the description most recently returned by this coordinator.
    /// Anything else, including an older offer, is rejected without reaching
    /// the transport.
    pub async fn set_local_description(
        &self,
        description: &HardenedSessionDescription,
    ) -> SessionResult<()> {
        const OP: &str = "set_local_description";
        let _permit = self.acquire(OP)?;
        if self.issued.lock().as_ref() != Some(description) {
            warn!(
                target = "call_session::coordinator",
                kind = %description.kind(),
                "refusing local description this session did not generate"
            );
            return Err(SessionError::ForeignDescription { operation: OP });
        }
        self.apply_local(description).await
    }

    /// Applies a description received from the remote peer, as is.
    pub async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> SessionResult<()> {
        let _permit = self.acquire("set_remote_description")?;
        self.apply_remote(description).await
    }

    /// Creates an answer to the applied remote offer, hardens it and applies
    /// it locally. Completes only after the local description is in place.
    pub async fn negotiate_answer(
        &self,
        constraints: &MediaConstraints,
    ) -> SessionResult<HardenedSessionDescription> {
        let _permit = self.acquire("negotiate_answer")?;
        self.answer(constraints).await
    }

    /// Applies a remote offer and answers it as one unit.
    pub async fn negotiate(
        &self,
        remote: SessionDescription,
        constraints: &MediaConstraints,
    ) -> SessionResult<HardenedSessionDescription> {
        const OP: &str = "negotiate";
        let _permit = self.acquire(OP)?;
        if remote.kind != SdpKind::Offer {
            return Err(SessionError::UnexpectedDescription {
                operation: OP,
                expected: SdpKind::Offer,
                actual: remote.kind,
            });
        }
        self.apply_remote(remote).await?;
        self.answer(constraints).await
    }

    /// Best-effort candidate hand-off. Candidates that arrive before a remote
    /// description are held back and flushed once it has been applied.
    pub async fn add_ice_candidate(&self, candidate: IceCandidate) {
        if self.is_closed() {
            debug!(
                target = "call_session::coordinator",
                candidate = %candidate.candidate,
                "dropping ICE candidate for closed session"
            );
            return;
        }
        {
            let mut ice = self.ice.lock();
            if !ice.remote_applied || ice.flushing {
                ice.pending.push(candidate);
                debug!(
                    target = "call_session::coordinator",
                    buffered = ice.pending.len(),
                    flushing = ice.flushing,
                    "buffering ICE candidate"
                );
                return;
            }
        }
        self.submit_candidate(candidate).await;
    }

    /// Moves to `Closed`. Returns `false` if the coordinator was already
    /// closed.
    pub(crate) fn close(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state == Closed {
                return false;
            }
            info!(
                target = "call_session::coordinator",
                from = %*state,
                "negotiation closed"
            );
            *state = Closed;
        }
        self.permit.close();
        let mut ice = self.ice.lock();
        ice.pending.clear();
        ice.flushing = false;
        true
    }

    async fn apply_local(&self, description: &HardenedSessionDescription) -> SessionResult<()> {
        const OP: &str = "set_local_description";
        let (from, to) = match description.kind() {
            SdpKind::Offer => (LOCAL_OFFER_FROM, LocalOfferSet),
            SdpKind::Answer => (LOCAL_ANSWER_FROM, Negotiated),
            SdpKind::Pranswer => (LOCAL_ANSWER_FROM, AnswerPending),
        };
        self.expect_state(OP, from)?;

        trace!(
            target = "call_session::coordinator",
            kind = %description.kind(),
            sdp = description.sdp(),
            "setting local session description"
        );
        let result = self
            .connection
            .set_local_description(description.as_description().clone())
            .await;
        self.ensure_open_after(OP)?;
        result.map_err(|err| {
            warn!(
                target = "call_session::coordinator",
                error = %err,
                "local description rejected"
            );
            SessionError::transport(OP, err)
        })?;

        self.transition(OP, to)
    }

    async fn apply_remote(&self, description: SessionDescription) -> SessionResult<()> {
        const OP: &str = "set_remote_description";
        let (from, to) = match description.kind {
            SdpKind::Offer => (REMOTE_OFFER_FROM, Negotiating),
            SdpKind::Answer => (REMOTE_ANSWER_FROM, Negotiated),
            SdpKind::Pranswer => (REMOTE_ANSWER_FROM, LocalOfferSet),
        };
        self.expect_state(OP, from)?;

        trace!(
            target = "call_session::coordinator",
            kind = %description.kind,
            sdp = %description.sdp,
            "setting remote session description"
        );
        let result = self.connection.set_remote_description(description).await;
        self.ensure_open_after(OP)?;
        result.map_err(|err| {
            warn!(
                target = "call_session::coordinator",
                error = %err,
                "remote description rejected"
            );
            SessionError::transport(OP, err)
        })?;
        self.transition(OP, to)?;

        self.flush_candidates().await;
        Ok(())
    }

    /// Hands buffered candidates to the transport in arrival order. Batches
    /// are drained until the buffer stays empty, so a candidate arriving
    /// mid-flush is submitted after the ones ahead of it.
    async fn flush_candidates(&self) {
        {
            let mut ice = self.ice.lock();
            ice.remote_applied = true;
            ice.flushing = true;
        }
        loop {
            let batch = {
                let mut ice = self.ice.lock();
                if ice.pending.is_empty() || self.is_closed() {
                    ice.pending.clear();
                    ice.flushing = false;
                    return;
                }
                std::mem::take(&mut ice.pending)
            };
            debug!(
                target = "call_session::coordinator",
                count = batch.len(),
                "flushing buffered ICE candidates"
            );
            for candidate in batch {
                self.submit_candidate(candidate).await;
            }
        }
    }

    async fn answer(
        &self,
        constraints: &MediaConstraints,
    ) -> SessionResult<HardenedSessionDescription> {
        const OP: &str = "negotiate_answer";
        self.expect_state(OP, ANSWER_FROM)?;

        debug!(target = "call_session::coordinator", "negotiating answer session description");
        let result = self.connection.create_answer(constraints).await;
        self.ensure_open_after(OP)?;
        let answer = HardenedSessionDescription::from(require_description(
            OP,
            SdpKind::Answer,
            result,
        )?);
        self.transition(OP, AnswerPending)?;
        self.issue(&answer);

        self.apply_local(&answer).await?;
        Ok(answer)
    }

    fn issue(&self, description: &HardenedSessionDescription) {
        *self.issued.lock() = Some(description.clone());
    }

    async fn submit_candidate(&self, candidate: IceCandidate) {
        if self.is_closed() {
            return;
        }
        trace!(
            target = "call_session::coordinator",
            candidate = %candidate.candidate,
            "adding ICE candidate"
        );
        if let Err(err) = self.connection.add_ice_candidate(candidate).await {
            warn!(
                target = "call_session::coordinator",
                error = %err,
                "failed to add ICE candidate"
            );
        }
    }

    fn acquire(&self, operation: &'static str) -> SessionResult<SemaphorePermit<'_>> {
        match self.permit.try_acquire() {
            Ok(permit) => Ok(permit),
            Err(TryAcquireError::Closed) => Err(SessionError::Closed),
            Err(TryAcquireError::NoPermits) => {
                warn!(
                    target = "call_session::coordinator",
                    operation,
                    "rejecting overlapping negotiation operation"
                );
                Err(SessionError::Busy)
            }
        }
    }

    fn expect_state(
        &self,
        operation: &'static str,
        allowed: &[NegotiationState],
    ) -> SessionResult<()> {
        let state = self.state();
        if state == Closed {
            return Err(SessionError::Closed);
        }
        if !allowed.contains(&state) {
            return Err(SessionError::InvalidState { operation, state });
        }
        Ok(())
    }

    fn ensure_open_after(&self, operation: &'static str) -> SessionResult<()> {
        if self.is_closed() {
            debug!(
                target = "call_session::coordinator",
                operation,
                "discarding completion that arrived after close"
            );
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    fn transition(&self, operation: &'static str, to: NegotiationState) -> SessionResult<()> {
        let mut state = self.state.lock();
        if *state == Closed {
            debug!(
                target = "call_session::coordinator",
                operation,
                "discarding completion that arrived after close"
            );
            return Err(SessionError::Closed);
        }
        debug!(
            target = "call_session::coordinator",
            operation,
            from = %*state,
            to = %to,
            "negotiation state changed"
        );
        *state = to;
        Ok(())
    }
}

fn require_description(
    operation: &'static str,
    expected: SdpKind,
    result: ConnectionResult<Option<SessionDescription>>,
) -> SessionResult<SessionDescription> {
    match result {
        Err(err) => {
            warn!(
                target = "call_session::coordinator",
                operation,
                error = %err,
                "transport failed"
            );
            Err(SessionError::transport(operation, err))
        }
        Ok(None) => {
            error!(
                target = "call_session::coordinator",
                operation,
                "no session description was obtained, even though there was no error reported"
            );
            Err(SessionError::ProtocolViolation {
                operation,
                reason: "transport returned no session description".to_string(),
            })
        }
        Ok(Some(description)) if description.kind != expected => {
            error!(
                target = "call_session::coordinator",
                operation,
                %expected,
                actual = %description.kind,
                "transport produced the wrong kind of session description"
            );
            Err(SessionError::ProtocolViolation {
                operation,
                reason: format!("expected {expected}, transport produced {}", description.kind),
            })
        }
        Ok(Some(description)) => Ok(description),
    }
}
