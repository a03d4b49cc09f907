//! Offer/answer negotiation state machine
//!
//! ```text
//! Idle ──start (viewer)──> Negotiating(OfferSent) ──answer──┐
//!  │                                                        v
//!  └──offer (camera)──> Negotiating(OfferReceived) ──> Stabilizing ──> Connected
//!                                                                        │
//!                                          Disconnected / Failed / Closed <┘
//! ```
//!
//! One offer and one answer per round. Anything that does not fit the
//! current state is logged and dropped without changing state.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::candidate_queue::IceCandidateQueue;
use super::channel::{ChannelState, SignalingSender};
use super::monitor::ConnectionStateMonitor;
use super::signaling::{ConnectionState, IceCandidate, SignalingMessage};
use super::transport::{MediaTransport, TransportEvent, TransportEvents};
use crate::error::{AppError, Result};
use crate::events::{EventBus, SystemEvent};
use crate::role::Role;

/// Which side of the outstanding exchange we are on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pending {
    OfferSent,
    OfferReceived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationState {
    Idle,
    Negotiating(Pending),
    Stabilizing,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Failed | NegotiationState::Closed)
    }
}

impl std::fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NegotiationState::Idle => write!(f, "idle"),
            NegotiationState::Negotiating(Pending::OfferSent) => write!(f, "negotiating(offer_sent)"),
            NegotiationState::Negotiating(Pending::OfferReceived) => {
                write!(f, "negotiating(offer_received)")
            }
            NegotiationState::Stabilizing => write!(f, "stabilizing"),
            NegotiationState::Connected => write!(f, "connected"),
            NegotiationState::Disconnected => write!(f, "disconnected"),
            NegotiationState::Failed => write!(f, "failed"),
            NegotiationState::Closed => write!(f, "closed"),
        }
    }
}

/// Owns the media transport and drives one negotiation over the signaling
/// channel
pub struct PeerConnectionManager<T: MediaTransport> {
    role: Role,
    transport: Arc<T>,
    signaling: SignalingSender,
    monitor: ConnectionStateMonitor,
    events: Arc<EventBus>,
    state_tx: watch::Sender<NegotiationState>,
    remote_stream_tx: watch::Sender<Option<T::RemoteStream>>,
    /// Remote track that arrived before the transport reported connected
    pending_stream: Option<T::RemoteStream>,
    offer_outstanding: bool,
    remote_committed: bool,
    remote_candidates: IceCandidateQueue,
    local_candidates: IceCandidateQueue,
    offers_created: u32,
    answers_created: u32,
}

impl<T: MediaTransport> PeerConnectionManager<T> {
    pub fn new(
        role: Role,
        transport: Arc<T>,
        signaling: SignalingSender,
        monitor: ConnectionStateMonitor,
        events: Arc<EventBus>,
    ) -> Self {
        let (state_tx, _) = watch::channel(NegotiationState::Idle);
        let (remote_stream_tx, _) = watch::channel(None);
        Self {
            role,
            transport,
            signaling,
            monitor,
            events,
            state_tx,
            remote_stream_tx,
            pending_stream: None,
            offer_outstanding: false,
            remote_committed: false,
            remote_candidates: IceCandidateQueue::new(),
            local_candidates: IceCandidateQueue::new(),
            offers_created: 0,
            answers_created: 0,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        *self.state_tx.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<NegotiationState> {
        self.state_tx.subscribe()
    }

    /// Remote media stream, set once the transport is connected
    pub fn remote_stream(&self) -> watch::Receiver<Option<T::RemoteStream>> {
        self.remote_stream_tx.subscribe()
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn offers_created(&self) -> u32 {
        self.offers_created
    }

    pub fn answers_created(&self) -> u32 {
        self.answers_created
    }

    fn set_state(&self, state: NegotiationState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!("Negotiation state: {} -> {}", previous, state);
            self.events
                .publish(SystemEvent::NegotiationStateChanged { state });
        }
    }

    /// Create, commit and send the offer (viewer only)
    ///
    /// Only valid from `Idle`; repeated calls are ignored so a round never
    /// carries more than one offer.
    pub async fn start_negotiation(&mut self) -> Result<()> {
        if !self.role.is_initiator() {
            return Err(AppError::Negotiation(format!(
                "{} role does not initiate negotiation",
                self.role
            )));
        }
        if self.state() != NegotiationState::Idle {
            warn!("Negotiation already started ({}), not sending another offer", self.state());
            return Ok(());
        }

        let offer = self.transport.create_offer().await?;
        self.offers_created += 1;
        self.transport.set_local_description(offer.clone()).await?;
        self.signaling.send(SignalingMessage::Offer(offer))?;
        self.offer_outstanding = true;
        self.set_state(NegotiationState::Negotiating(Pending::OfferSent));
        info!("Offer sent");
        Ok(())
    }

    /// Apply one inbound signaling message
    pub async fn handle_message(&mut self, message: SignalingMessage) -> Result<()> {
        match message {
            SignalingMessage::Offer(offer) => {
                if self.role.is_initiator() {
                    warn!("Ignoring offer received by the initiating side");
                    return Ok(());
                }
                if self.remote_committed {
                    warn!("Ignoring offer: remote description already committed this round");
                    return Ok(());
                }

                self.set_state(NegotiationState::Negotiating(Pending::OfferReceived));
                self.transport.set_remote_description(offer).await?;
                self.remote_committed = true;
                self.flush_remote_candidates().await;

                if let Err(e) = self.send_answer().await {
                    // Reopen the round so a repeated offer is answered
                    warn!("Failed to answer offer, waiting for a new one: {}", e);
                    self.remote_committed = false;
                    self.set_state(NegotiationState::Idle);
                    return Err(e);
                }
            }
            SignalingMessage::Answer(answer) => {
                if !self.offer_outstanding {
                    warn!("Ignoring answer with no outstanding offer");
                    return Ok(());
                }

                self.transport.set_remote_description(answer).await?;
                self.offer_outstanding = false;
                self.remote_committed = true;
                self.flush_remote_candidates().await;
                self.set_state(NegotiationState::Stabilizing);
                info!("Answer applied");
            }
            SignalingMessage::Candidate(candidate) => {
                if let Some(candidate) = self.remote_candidates.push(candidate) {
                    self.apply_remote_candidate(candidate).await;
                } else {
                    debug!(
                        "Buffered remote candidate ({} pending)",
                        self.remote_candidates.len()
                    );
                }
            }
        }
        Ok(())
    }

    async fn send_answer(&mut self) -> Result<()> {
        let answer = self.transport.create_answer().await?;
        self.answers_created += 1;
        self.transport.set_local_description(answer.clone()).await?;
        self.signaling.send(SignalingMessage::Answer(answer))?;
        self.set_state(NegotiationState::Stabilizing);
        info!("Answer sent");
        Ok(())
    }

    async fn flush_remote_candidates(&mut self) {
        for candidate in self.remote_candidates.open() {
            self.apply_remote_candidate(candidate).await;
        }
    }

    async fn apply_remote_candidate(&self, candidate: IceCandidate) {
        if let Err(e) = self.transport.add_ice_candidate(candidate).await {
            warn!("Failed to add remote ICE candidate: {}", e);
        }
    }

    /// Send every local candidate gathered before the channel opened
    pub fn on_channel_open(&mut self) {
        let queued = self.local_candidates.open();
        if !queued.is_empty() {
            debug!("Flushing {} queued local candidates", queued.len());
        }
        for candidate in queued {
            self.send_candidate(candidate);
        }
    }

    fn send_candidate(&self, candidate: IceCandidate) {
        if let Err(e) = self.signaling.send(SignalingMessage::Candidate(candidate)) {
            warn!("Failed to send local ICE candidate: {}", e);
        }
    }

    /// Apply one transport event; returns true when the session is over
    pub fn handle_transport_event(&mut self, event: TransportEvent<T::RemoteStream>) -> bool {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                if let Some(candidate) = self.local_candidates.push(candidate) {
                    self.send_candidate(candidate);
                }
                false
            }
            TransportEvent::RemoteTrack(stream) => {
                if self.state() == NegotiationState::Connected {
                    self.remote_stream_tx.send_replace(Some(stream));
                } else {
                    self.pending_stream = Some(stream);
                }
                false
            }
            TransportEvent::StateChanged(state) => {
                self.monitor.publish(state);
                match state {
                    ConnectionState::Connected => {
                        self.set_state(NegotiationState::Connected);
                        if let Some(stream) = self.pending_stream.take() {
                            self.remote_stream_tx.send_replace(Some(stream));
                        }
                    }
                    ConnectionState::Disconnected => {
                        self.set_state(NegotiationState::Disconnected)
                    }
                    ConnectionState::Failed => self.set_state(NegotiationState::Failed),
                    ConnectionState::Closed => self.set_state(NegotiationState::Closed),
                    ConnectionState::New | ConnectionState::Connecting => {}
                }
                if state.is_terminal() {
                    self.remote_stream_tx.send_replace(None);
                }
                state.is_terminal()
            }
        }
    }

    /// Drive negotiation until the connection fails or closes, signaling is
    /// lost before connecting, or `cancel` fires
    ///
    /// The viewer sends its offer as soon as the signaling channel opens.
    /// The transport is closed on the way out.
    pub async fn run(
        mut self,
        mut inbound: mpsc::UnboundedReceiver<SignalingMessage>,
        mut transport_events: TransportEvents<T::RemoteStream>,
        mut opened: watch::Receiver<ChannelState>,
        cancel: CancellationToken,
    ) -> NegotiationState {
        let mut watching_channel = true;
        let mut inbound_open = true;

        let initial = *opened.borrow_and_update();
        match initial {
            ChannelState::Open => self.channel_opened().await,
            ChannelState::Closed => {
                warn!("Signaling channel closed before negotiation; abandoning");
                return self.shutdown().await;
            }
            ChannelState::Connecting => {}
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Negotiation cancelled");
                    break;
                }
                changed = opened.changed(), if watching_channel => {
                    if changed.is_err() {
                        watching_channel = false;
                        continue;
                    }
                    let channel_state = *opened.borrow_and_update();
                    match channel_state {
                        ChannelState::Open => self.channel_opened().await,
                        ChannelState::Closed => {
                            watching_channel = false;
                            if self.state() != NegotiationState::Connected {
                                warn!("Signaling channel lost during negotiation; abandoning");
                                self.events
                                    .error("signaling", "Channel lost before the peer connected");
                                break;
                            }
                            info!("Signaling channel closed; peer connection stays up");
                        }
                        ChannelState::Connecting => {}
                    }
                }
                message = inbound.recv(), if inbound_open => match message {
                    Some(message) => {
                        let kind = message.kind();
                        if let Err(e) = self.handle_message(message).await {
                            warn!("Failed to handle {} message: {}", kind, e);
                        }
                    }
                    None => inbound_open = false,
                },
                event = transport_events.recv() => match event {
                    Some(event) => {
                        if self.handle_transport_event(event) {
                            info!("Peer connection ended: {}", self.state());
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        self.shutdown().await
    }

    async fn channel_opened(&mut self) {
        self.on_channel_open();
        if self.role.is_initiator() {
            if let Err(e) = self.start_negotiation().await {
                warn!("Failed to start negotiation: {}", e);
            }
        }
    }

    async fn shutdown(self) -> NegotiationState {
        if let Err(e) = self.transport.close().await {
            warn!("Failed to close peer connection: {}", e);
        }
        self.remote_stream_tx.send_replace(None);
        self.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webrtc::signaling::SessionDescription;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeTransport {
        calls: Mutex<Vec<String>>,
        fail_answer: std::sync::atomic::AtomicBool,
    }

    impl FakeTransport {
        fn record(&self, call: String) {
            self.calls.lock().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait::async_trait]
    impl MediaTransport for FakeTransport {
        type RemoteStream = &'static str;

        async fn create_offer(&self) -> Result<SessionDescription> {
            self.record("create_offer".to_string());
            Ok(SessionDescription::offer("offer-sdp"))
        }

        async fn create_answer(&self) -> Result<SessionDescription> {
            self.record("create_answer".to_string());
            if self.fail_answer.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(AppError::WebRtcError("answer rejected".to_string()));
            }
            Ok(SessionDescription::answer("answer-sdp"))
        }

        async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
            self.record(format!("set_local:{}", desc.kind));
            Ok(())
        }

        async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
            self.record(format!("set_remote:{}", desc.kind));
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
            self.record(format!("add_candidate:{}", candidate.candidate));
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.record("close".to_string());
            Ok(())
        }
    }

    struct Harness {
        manager: PeerConnectionManager<FakeTransport>,
        transport: Arc<FakeTransport>,
        sent: mpsc::UnboundedReceiver<SignalingMessage>,
        events: Arc<EventBus>,
    }

    fn harness(role: Role) -> Harness {
        let transport = Arc::new(FakeTransport::default());
        let (sender, sent) = SignalingSender::detached();
        let events = Arc::new(EventBus::new());
        let monitor = ConnectionStateMonitor::new(events.clone());
        let manager =
            PeerConnectionManager::new(role, transport.clone(), sender, monitor, events.clone());
        Harness {
            manager,
            transport,
            sent,
            events,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SignalingMessage>) -> Vec<SignalingMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn candidate(s: &str) -> SignalingMessage {
        SignalingMessage::Candidate(IceCandidate::new(s))
    }

    #[tokio::test]
    async fn test_remote_candidates_buffered_until_offer_committed() {
        let mut h = harness(Role::Camera);

        h.manager.handle_message(candidate("c1")).await.unwrap();
        h.manager.handle_message(candidate("c2")).await.unwrap();
        assert!(h.transport.calls().is_empty());

        h.manager
            .handle_message(SignalingMessage::Offer(SessionDescription::offer("remote")))
            .await
            .unwrap();
        h.manager.handle_message(candidate("c3")).await.unwrap();

        assert_eq!(
            h.transport.calls(),
            vec![
                "set_remote:offer",
                "add_candidate:c1",
                "add_candidate:c2",
                "create_answer",
                "set_local:answer",
                "add_candidate:c3",
            ]
        );
        assert_eq!(
            drain(&mut h.sent),
            vec![SignalingMessage::Answer(SessionDescription::answer(
                "answer-sdp"
            ))]
        );
        assert_eq!(h.manager.state(), NegotiationState::Stabilizing);
    }

    #[tokio::test]
    async fn test_viewer_creates_one_offer() {
        let mut h = harness(Role::Viewer);

        h.manager.start_negotiation().await.unwrap();
        h.manager.start_negotiation().await.unwrap();

        assert_eq!(h.manager.offers_created(), 1);
        assert_eq!(
            h.manager.state(),
            NegotiationState::Negotiating(Pending::OfferSent)
        );
        assert_eq!(h.transport.calls(), vec!["create_offer", "set_local:offer"]);
        assert_eq!(
            drain(&mut h.sent),
            vec![SignalingMessage::Offer(SessionDescription::offer(
                "offer-sdp"
            ))]
        );
    }

    #[tokio::test]
    async fn test_camera_does_not_initiate() {
        let mut h = harness(Role::Camera);
        assert!(matches!(
            h.manager.start_negotiation().await,
            Err(AppError::Negotiation(_))
        ));
        assert_eq!(h.manager.offers_created(), 0);
        assert!(drain(&mut h.sent).is_empty());
    }

    #[tokio::test]
    async fn test_full_round_ignores_stray_reoffer() {
        let mut viewer = harness(Role::Viewer);
        let mut camera = harness(Role::Camera);

        viewer.manager.start_negotiation().await.unwrap();
        for msg in drain(&mut viewer.sent) {
            camera.manager.handle_message(msg).await.unwrap();
        }
        assert_eq!(camera.manager.state(), NegotiationState::Stabilizing);

        for msg in drain(&mut camera.sent) {
            viewer.manager.handle_message(msg).await.unwrap();
        }
        assert_eq!(viewer.manager.state(), NegotiationState::Stabilizing);

        // A duplicate offer after the round must not produce a second answer
        camera
            .manager
            .handle_message(SignalingMessage::Offer(SessionDescription::offer("again")))
            .await
            .unwrap();
        assert_eq!(camera.manager.answers_created(), 1);
        assert!(drain(&mut camera.sent).is_empty());
        assert_eq!(camera.manager.state(), NegotiationState::Stabilizing);

        // Nor does a late duplicate answer reach the viewer's transport twice
        viewer
            .manager
            .handle_message(SignalingMessage::Answer(SessionDescription::answer("again")))
            .await
            .unwrap();
        let remote_sets = viewer
            .transport
            .calls()
            .iter()
            .filter(|c| c.starts_with("set_remote"))
            .count();
        assert_eq!(remote_sets, 1);
    }

    #[tokio::test]
    async fn test_reoffer_after_connected_is_ignored() {
        let mut viewer = harness(Role::Viewer);
        let mut camera = harness(Role::Camera);

        viewer.manager.start_negotiation().await.unwrap();
        let sent_by_viewer = drain(&mut viewer.sent);
        let first_offer = sent_by_viewer[0].clone();
        for msg in sent_by_viewer {
            camera.manager.handle_message(msg).await.unwrap();
        }
        for msg in drain(&mut camera.sent) {
            viewer.manager.handle_message(msg).await.unwrap();
        }

        for h in [&mut viewer, &mut camera] {
            assert!(!h
                .manager
                .handle_transport_event(TransportEvent::StateChanged(ConnectionState::Connected)));
            assert_eq!(h.manager.state(), NegotiationState::Connected);
        }

        camera.manager.handle_message(first_offer).await.unwrap();

        assert_eq!(camera.manager.state(), NegotiationState::Connected);
        assert_eq!(camera.manager.answers_created(), 1);
        assert!(drain(&mut camera.sent).is_empty());
        assert_eq!(
            camera
                .transport
                .calls()
                .iter()
                .filter(|c| c.starts_with("set_remote"))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_failed_answer_reopens_round() {
        let mut h = harness(Role::Camera);
        h.transport
            .fail_answer
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let offer = SignalingMessage::Offer(SessionDescription::offer("remote"));
        assert!(h.manager.handle_message(offer.clone()).await.is_err());
        assert_eq!(h.manager.state(), NegotiationState::Idle);
        assert_eq!(h.manager.answers_created(), 0);
        assert!(drain(&mut h.sent).is_empty());

        h.transport
            .fail_answer
            .store(false, std::sync::atomic::Ordering::SeqCst);
        h.manager.handle_message(offer).await.unwrap();
        assert_eq!(h.manager.state(), NegotiationState::Stabilizing);
        assert_eq!(h.manager.answers_created(), 1);
        assert_eq!(
            drain(&mut h.sent),
            vec![SignalingMessage::Answer(SessionDescription::answer(
                "answer-sdp"
            ))]
        );
    }

    #[tokio::test]
    async fn test_answer_without_offer_is_ignored() {
        let mut h = harness(Role::Viewer);
        h.manager
            .handle_message(SignalingMessage::Answer(SessionDescription::answer("x")))
            .await
            .unwrap();
        assert_eq!(h.manager.state(), NegotiationState::Idle);
        assert!(h.transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_offer_at_initiator_is_ignored() {
        let mut h = harness(Role::Viewer);
        h.manager
            .handle_message(SignalingMessage::Offer(SessionDescription::offer("x")))
            .await
            .unwrap();
        assert_eq!(h.manager.state(), NegotiationState::Idle);
        assert!(h.transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_local_candidates_wait_for_channel_open() {
        let mut h = harness(Role::Camera);

        h.manager
            .handle_transport_event(TransportEvent::LocalCandidate(IceCandidate::new("l1")));
        h.manager
            .handle_transport_event(TransportEvent::LocalCandidate(IceCandidate::new("l2")));
        assert!(drain(&mut h.sent).is_empty());

        h.manager.on_channel_open();
        h.manager
            .handle_transport_event(TransportEvent::LocalCandidate(IceCandidate::new("l3")));

        assert_eq!(
            drain(&mut h.sent),
            vec![candidate("l1"), candidate("l2"), candidate("l3")]
        );
    }

    #[tokio::test]
    async fn test_remote_stream_exposed_on_connected() {
        let mut h = harness(Role::Viewer);
        let stream = h.manager.remote_stream();
        let monitor_state = h.manager.monitor.subscribe();

        assert!(!h.manager.handle_transport_event(TransportEvent::RemoteTrack("video")));
        assert!(stream.borrow().is_none());

        assert!(!h
            .manager
            .handle_transport_event(TransportEvent::StateChanged(ConnectionState::Connected)));
        assert_eq!(*stream.borrow(), Some("video"));
        assert_eq!(*monitor_state.borrow(), ConnectionState::Connected);
        assert_eq!(h.manager.state(), NegotiationState::Connected);

        assert!(h
            .manager
            .handle_transport_event(TransportEvent::StateChanged(ConnectionState::Failed)));
        assert!(stream.borrow().is_none());
        assert_eq!(h.manager.state(), NegotiationState::Failed);
    }

    #[tokio::test]
    async fn test_run_drives_viewer_round() {
        let h = harness(Role::Viewer);
        let transport = h.transport.clone();
        let mut sent = h.sent;
        let state = h.manager.state_watch();

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (open_tx, open_rx) = watch::channel(ChannelState::Connecting);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(h.manager.run(inbound_rx, event_rx, open_rx, cancel.clone()));

        // Candidate gathered before the channel opens is held back
        event_tx
            .send(TransportEvent::LocalCandidate(IceCandidate::new("l1")))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(drain(&mut sent).is_empty());

        open_tx.send(ChannelState::Open).unwrap();
        let first = tokio::time::timeout(Duration::from_secs(1), sent.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, candidate("l1"));
        let second = tokio::time::timeout(Duration::from_secs(1), sent.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(second, SignalingMessage::Offer(_)));

        inbound_tx
            .send(SignalingMessage::Answer(SessionDescription::answer("remote")))
            .unwrap();
        let mut state_rx = state.clone();
        tokio::time::timeout(
            Duration::from_secs(1),
            state_rx.wait_for(|s| *s == NegotiationState::Stabilizing),
        )
        .await
        .unwrap()
        .unwrap();

        event_tx
            .send(TransportEvent::StateChanged(ConnectionState::Connected))
            .unwrap();
        event_tx
            .send(TransportEvent::StateChanged(ConnectionState::Closed))
            .unwrap();

        let final_state = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(final_state, NegotiationState::Closed);
        assert_eq!(transport.calls().last().map(String::as_str), Some("close"));
    }

    #[tokio::test]
    async fn test_run_abandons_when_signaling_lost() {
        let h = harness(Role::Viewer);
        let mut bus = h.events.subscribe();
        let (_inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (_event_tx, event_rx) = mpsc::unbounded_channel();
        let (open_tx, open_rx) = watch::channel(ChannelState::Connecting);

        let task = tokio::spawn(h.manager.run(
            inbound_rx,
            event_rx,
            open_rx,
            CancellationToken::new(),
        ));
        open_tx.send(ChannelState::Closed).unwrap();

        let final_state = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(final_state, NegotiationState::Idle);

        let mut reported = false;
        while let Ok(event) = bus.try_recv() {
            if let SystemEvent::Error { module, .. } = event {
                reported = module == "signaling";
            }
        }
        assert!(reported);
    }
}
