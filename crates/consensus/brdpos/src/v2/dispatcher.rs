//! Single task driving the v2 engine
//!
//! Every input that mutates the pacemaker (network messages, the round timer, imported blocks)
//! is queued on one channel and handled in order by [`Dispatcher::run`]. The engine handlers
//! are synchronous and return [`Action`]s, which the dispatcher performs: broadcasting messages,
//! notifying the miner of new rounds, re-arming the timer and publishing forensics evidence.

use super::{
    ConsensusMessage, ForensicsEvent, QuorumCert, Round, SyncInfo, Timeout, Vote,
    engine::BrdposV2Engine,
};
use crate::{
    constants::{EVENT_CHANNEL_SIZE, FEED_CHANNEL_SIZE, NEW_ROUND_CHANNEL_SIZE},
    errors::{BrdposError, BrdposResult},
};
use alloc::{sync::Arc, vec::Vec};
use alloy_primitives::Address;
use brc_primitives::BrcBlockHeader;
use core::time::Duration;
use tokio::{
    sync::{broadcast, mpsc},
    time::{Instant, sleep, sleep_until},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Side effect requested by an engine handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send a message to every peer
    Broadcast(ConsensusMessage),
    /// The node entered a new round outside of sync
    NewRound(Round),
    /// Restart the round timer
    ResetTimer {
        /// Round the timer belongs to
        round: Round,
        /// Delay until the timer fires
        after: Duration,
    },
    /// Evidence of a safety violation
    Forensics(ForensicsEvent),
}

/// Input of the dispatcher
#[derive(Debug, Clone)]
pub enum ConsensusEvent {
    /// Vote received from a peer
    Vote(Vote),
    /// Timeout received from a peer
    Timeout(Timeout),
    /// Sync info received from a peer
    SyncInfo(SyncInfo),
    /// QC learned outside of a block header
    QuorumCert(QuorumCert),
    /// Fire the round timer now
    TimerFired,
    /// A v2 block was inserted into the chain
    ProposedBlock(BrcBlockHeader),
    /// Perform actions produced outside of the dispatcher
    Perform(Vec<Action>),
}

/// Owner of the engine event loop
#[derive(Debug)]
pub struct Dispatcher {
    engine: Arc<BrdposV2Engine>,
    events: mpsc::Receiver<ConsensusEvent>,
    new_round_tx: mpsc::Sender<Round>,
    broadcast_tx: broadcast::Sender<ConsensusMessage>,
    forensics_tx: broadcast::Sender<ForensicsEvent>,
    cancel: CancellationToken,
}

/// Cloneable entry point of a running [`Dispatcher`]
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    engine: Arc<BrdposV2Engine>,
    events_tx: mpsc::Sender<ConsensusEvent>,
    broadcast_tx: broadcast::Sender<ConsensusMessage>,
    forensics_tx: broadcast::Sender<ForensicsEvent>,
    cancel: CancellationToken,
}

impl Dispatcher {
    /// Create a dispatcher for `engine`, its handle and the new round notifications.
    ///
    /// The new round channel holds a single pending round; notifications are dropped while the
    /// miner has not consumed the previous one.
    pub fn new(
        engine: Arc<BrdposV2Engine>,
        cancel: CancellationToken,
    ) -> (Self, DispatcherHandle, mpsc::Receiver<Round>) {
        let (events_tx, events) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let (new_round_tx, new_round_rx) = mpsc::channel(NEW_ROUND_CHANNEL_SIZE);
        let (broadcast_tx, _) = broadcast::channel(FEED_CHANNEL_SIZE);
        let (forensics_tx, _) = broadcast::channel(FEED_CHANNEL_SIZE);

        let handle = DispatcherHandle {
            engine: engine.clone(),
            events_tx,
            broadcast_tx: broadcast_tx.clone(),
            forensics_tx: forensics_tx.clone(),
            cancel: cancel.clone(),
        };
        let dispatcher =
            Self { engine, events, new_round_tx, broadcast_tx, forensics_tx, cancel };
        (dispatcher, handle, new_round_rx)
    }

    /// Run until cancelled or until every handle is dropped
    pub async fn run(mut self) {
        info!(target: "consensus::brdpos", "Starting consensus dispatcher");
        let timer = sleep(Duration::ZERO);
        tokio::pin!(timer);
        let mut armed = false;

        loop {
            let actions = tokio::select! {
                biased;

                () = self.cancel.cancelled() => break,

                event = self.events.recv() => {
                    let Some(event) = event else { break };
                    self.handle_event(event)
                }

                () = &mut timer, if armed => {
                    armed = false;
                    self.engine.on_local_timeout()
                }
            };

            for action in actions {
                if let Action::ResetTimer { round, after } = action {
                    trace!(target: "consensus::brdpos", round, ?after, "Reset round timer");
                    timer.as_mut().reset(Instant::now() + after);
                    armed = true;
                } else {
                    self.perform(action);
                }
            }
        }
        info!(target: "consensus::brdpos", "Consensus dispatcher stopped");
    }

    fn handle_event(&self, event: ConsensusEvent) -> Vec<Action> {
        let result = match event {
            ConsensusEvent::Vote(vote) => self.engine.handle_vote(vote),
            ConsensusEvent::Timeout(timeout) => self.engine.handle_timeout(timeout),
            ConsensusEvent::SyncInfo(sync_info) => self.engine.handle_sync_info(sync_info),
            ConsensusEvent::QuorumCert(qc) => self.engine.handle_quorum_cert(qc),
            ConsensusEvent::TimerFired => Ok(self.engine.on_local_timeout()),
            ConsensusEvent::ProposedBlock(header) => self.engine.handle_proposed_block(&header),
            ConsensusEvent::Perform(actions) => Ok(actions),
        };
        result.unwrap_or_else(|err| {
            debug!(target: "consensus::brdpos", %err, "Dropped consensus event");
            Vec::new()
        })
    }

    fn perform(&self, action: Action) {
        match action {
            Action::Broadcast(message) => {
                if self.broadcast_tx.send(message).is_err() {
                    trace!(target: "consensus::brdpos", "No broadcast subscriber");
                }
            }
            Action::NewRound(round) => {
                if self.new_round_tx.try_send(round).is_err() {
                    trace!(target: "consensus::brdpos", round, "New round notification dropped");
                }
            }
            Action::Forensics(event) => {
                warn!(target: "consensus::brdpos", offenders = ?event.offenders(), "Forensics evidence");
                if self.forensics_tx.send(event).is_err() {
                    trace!(target: "consensus::brdpos", "No forensics subscriber");
                }
            }
            Action::ResetTimer { .. } => {}
        }
    }
}

impl DispatcherHandle {
    /// The engine driven by the dispatcher
    pub const fn engine(&self) -> &Arc<BrdposV2Engine> {
        &self.engine
    }

    /// Queue an event, waiting for room
    pub async fn send(&self, event: ConsensusEvent) -> BrdposResult<()> {
        self.events_tx.send(event).await.map_err(|_| dispatcher_stopped())
    }

    /// Queue an event without waiting
    pub fn try_send(&self, event: ConsensusEvent) -> BrdposResult<()> {
        self.events_tx.try_send(event).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => BrdposError::Custom("event queue full".into()),
            mpsc::error::TrySendError::Closed(_) => dispatcher_stopped(),
        })
    }

    /// Messages to send to peers
    pub fn subscribe_broadcasts(&self) -> broadcast::Receiver<ConsensusMessage> {
        self.broadcast_tx.subscribe()
    }

    /// Evidence of safety violations
    pub fn subscribe_forensics(&self) -> broadcast::Receiver<ForensicsEvent> {
        self.forensics_tx.subscribe()
    }

    /// [`BrdposV2Engine::your_turn`], forwarding the actions of a lazy initialisation to the
    /// dispatcher
    pub async fn your_turn(&self, parent: &BrcBlockHeader, signer: Address) -> BrdposResult<bool> {
        let turn = self.engine.your_turn(parent, signer);
        let deferred = self.engine.take_deferred_actions();
        if !deferred.is_empty() {
            self.send(ConsensusEvent::Perform(deferred)).await?;
        }
        turn
    }

    /// Stop the dispatcher
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

fn dispatcher_stopped() -> BrdposError {
    BrdposError::Custom("consensus dispatcher stopped".into())
}

/// Wait until the mine period of the current round has elapsed since `parent`.
///
/// Returns `false` if `stop` fired first.
pub async fn wait_for_mine_period(
    engine: &BrdposV2Engine,
    parent: &BrcBlockHeader,
    stop: &CancellationToken,
) -> bool {
    let mine_period = engine.round_config(engine.current_round()).mine_period;
    let target = parent.timestamp.saturating_add(mine_period);
    let now = engine.now();
    if now >= target {
        return true;
    }

    let Some(deadline) = Instant::now().checked_add(Duration::from_secs(target - now)) else {
        stop.cancelled().await;
        return false;
    };
    tokio::select! {
        () = stop.cancelled() => false,
        () = sleep_until(deadline) => true,
    }
}
