use super::super::message::{Address, Envelope, Message, VoteRequest};
use super::super::{NodeID, Ticks, ACK_TIMEOUT, DECISION_TIMEOUT, REWIND_BACKOFF};
use super::coordinator::Coordinator;
use super::participant::Participant;
use super::{Node, RawNode, Role};
use crate::error::{Error, Result};

use log::{debug, warn};
use std::collections::{BTreeMap, BTreeSet};

/// What a recovering node has learned about the cluster so far.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryState {
    /// No peer has responded yet.
    NoInformation,
    /// Some peer reported it voted yes but saw no precommit or decision.
    /// Such a peer holds no more information than the local node, and its
    /// responses no longer contribute to the recovered/intersection sets.
    SomeUncertain,
    /// Some peer reported it is itself recovering.
    SomeInRecovery,
}

/// Where the recovering node currently is in its recovery procedure.
#[derive(Clone, Copy, Debug, PartialEq)]
enum WalkMode {
    /// A decision request to the current peer is outstanding.
    Querying { timer: Ticks },
    /// The walk was exhausted without a verdict; waiting out the backoff
    /// before restarting from the first peer.
    Backoff { remaining: Ticks },
    /// A newly elected coordinator has polled this node; awaiting its
    /// verdict.
    AwaitingDecision { coordinator: NodeID, precommitted: bool, timer: Ticks },
}

/// A restarted node whose log replay found a transaction with no logged
/// decision. It walks its peers in ascending id order asking for the
/// outcome. Peers that are themselves recovering report their last-known
/// up-sets; the walk intersects these, and tracks which processes have
/// recovered. Once the intersection certifies that every process that
/// might know more is accounted for, the node elects itself coordinator
/// and runs the termination protocol.
#[derive(Clone, Debug, PartialEq)]
pub struct RecoveringParticipant {
    /// The pending transaction recovered from the log.
    request: VoteRequest,
    /// The request's peers excluding the local node, ascending. The walk
    /// visits them in this order; all recovering nodes derive the same
    /// order.
    sorted_peers: Vec<NodeID>,
    /// Index of the currently queried peer.
    current: usize,
    /// Processes confirmed live and responding, the local node included.
    recovered: BTreeSet<NodeID>,
    /// Intersection of all reported up-sets. Only ever shrinks within one
    /// walk attempt, seeded from the node's own last-known up-set.
    intersection: BTreeSet<NodeID>,
    /// The intersection's seed, restored when the walk rewinds.
    seed: BTreeSet<NodeID>,
    state: RecoveryState,
    mode: WalkMode,
}

impl Role for RecoveringParticipant {}

impl RawNode<Participant> {
    /// Enters crash recovery for a pending transaction found in the log.
    /// With no peers to ask, the node is the whole surviving cluster and
    /// elects itself immediately.
    pub(super) fn into_recovery(self, request: VoteRequest) -> Result<Node> {
        let id = self.id;
        let sorted_peers = request.participant_ids(id);
        let seed = self.up_set.clone();
        let mut node = self.into_role(RecoveringParticipant {
            request,
            sorted_peers,
            current: 0,
            recovered: [id].into(),
            intersection: seed.clone(),
            seed,
            state: RecoveryState::NoInformation,
            mode: WalkMode::Querying { timer: 0 },
        });
        if node.role.sorted_peers.is_empty() {
            return node.elect();
        }
        node.query_current()?;
        Ok(node.into())
    }
}

impl RawNode<RecoveringParticipant> {
    pub(super) fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert_step(&msg);
        let txid = self.role.request.txid;
        match msg.message {
            Message::Commit { txid: t } if t == txid => self.decision(true),
            Message::Abort { txid: t } if t == txid => self.decision(false),
            Message::Precommit { txid: t } if t == txid => self.precommit(msg.from),
            Message::Uncertain { txid: t } if t == txid => self.uncertain(&msg.from),
            Message::InRecovery { txid: t, up_set } if t == txid => {
                self.in_recovery(msg.from, up_set)
            }
            Message::DecisionRequest { txid: t } => {
                if t == txid {
                    // A fellow recovering node is walking; report our own
                    // last-known up-set.
                    let up_set = self.up_set.iter().copied().collect();
                    self.send(msg.from, Message::InRecovery { txid: t, up_set })?;
                } else {
                    self.answer_decision_request(msg.from, t, None)?;
                }
                Ok(self.into())
            }
            Message::StateRequest { txid: t } if t == txid => self.state_request(msg.from),
            Message::Elected { txid: t, up_set } if t == txid => {
                self.up_set = up_set.into_iter().collect();
                self.into_termination()
            }
            Message::Timeout { peer } => self.timeout(peer),
            Message::VoteRequest(request) => Err(Error::Internal(format!(
                "vote request {} received while recovering {txid}",
                request.txid
            ))),
            message => {
                debug!("Ignoring {message} while recovering");
                Ok(self.into())
            }
        }
    }

    pub(super) fn tick(mut self) -> Result<Node> {
        let id = self.id;
        let peer = match &mut self.role.mode {
            WalkMode::Querying { timer } => {
                *timer += 1;
                if *timer < DECISION_TIMEOUT {
                    return Ok(self.into());
                }
                self.role.sorted_peers[self.role.current]
            }
            WalkMode::AwaitingDecision { coordinator, timer, .. } => {
                *timer += 1;
                if *timer < DECISION_TIMEOUT {
                    return Ok(self.into());
                }
                *coordinator
            }
            WalkMode::Backoff { remaining } => {
                *remaining -= 1;
                if *remaining == 0 {
                    self.restart_walk()?;
                }
                return Ok(self.into());
            }
        };
        Node::from(self).step(Envelope {
            from: Address::Node(id),
            to: Address::Node(id),
            message: Message::Timeout { peer },
        })
    }

    /// Acts on a terminal decision. Always valid while awaiting the new
    /// coordinator's verdict; during the walk, only before any peer has
    /// reported uncertain.
    fn decision(mut self, commit: bool) -> Result<Node> {
        if !matches!(self.role.mode, WalkMode::AwaitingDecision { .. })
            && self.role.state == RecoveryState::SomeUncertain
        {
            return Err(Error::Internal(format!(
                "decision for {} received while some processes are uncertain",
                self.role.request.txid
            )));
        }
        let request = self.role.request.clone();
        if commit {
            self.apply_commit(&request)?;
        } else {
            self.apply_abort(request.txid)?;
        }
        Ok(self.into_role(Participant::new()).into())
    }

    fn precommit(mut self, from: Address) -> Result<Node> {
        let txid = self.role.request.txid;
        if let WalkMode::AwaitingDecision { precommitted, timer, .. } = &mut self.role.mode {
            // The new coordinator is driving the commit home.
            *precommitted = true;
            *timer = 0;
            self.send(from, Message::Ack { txid })?;
            return Ok(self.into());
        }
        if self.is_queried(&from) {
            // The peer precommitted but does not know the outcome either.
            return self.advance();
        }
        debug!("Ignoring precommit report from {from:?}");
        Ok(self.into())
    }

    fn uncertain(mut self, from: &Address) -> Result<Node> {
        if !self.is_queried(from) {
            debug!("Ignoring uncertain report from {from:?}");
            return Ok(self.into());
        }
        self.role.state = RecoveryState::SomeUncertain;
        self.advance()
    }

    fn in_recovery(mut self, from: Address, up_set: Vec<NodeID>) -> Result<Node> {
        if !self.is_queried(&from) {
            debug!("Ignoring recovery report from {from:?}");
            return Ok(self.into());
        }
        if self.role.state == RecoveryState::SomeUncertain {
            // Uninformative once an uncertain peer exists.
            return self.advance();
        }
        let Address::Node(peer) = from else {
            return Err(Error::Internal("recovery report from client".to_owned()));
        };
        self.role.state = RecoveryState::SomeInRecovery;
        self.role.recovered.insert(peer);
        let reported: BTreeSet<NodeID> = up_set.into_iter().collect();
        self.role.intersection.retain(|id| reported.contains(id));
        if self.role.current + 1 < self.role.sorted_peers.len() {
            return self.advance();
        }
        self.try_elect()
    }

    fn state_request(mut self, from: Address) -> Result<Node> {
        let txid = self.role.request.txid;
        let Address::Node(coordinator) = from else {
            return Err(Error::Internal("state request from client".to_owned()));
        };
        // If a previous new coordinator already got our ack, a successor
        // must learn of the precommit.
        let precommitted =
            matches!(self.role.mode, WalkMode::AwaitingDecision { precommitted: true, .. });
        let reply = if precommitted {
            Message::Precommit { txid }
        } else {
            Message::Uncertain { txid }
        };
        self.send(from, reply)?;
        self.role.mode = WalkMode::AwaitingDecision { coordinator, precommitted, timer: 0 };
        Ok(self.into())
    }

    fn timeout(mut self, peer: NodeID) -> Result<Node> {
        match self.role.mode {
            WalkMode::Querying { .. }
                if peer == self.role.sorted_peers[self.role.current] =>
            {
                self.advance()
            }
            WalkMode::AwaitingDecision { coordinator, .. } if peer == coordinator => {
                debug!("New coordinator {peer} went quiet, resuming walk");
                self.role.mode = WalkMode::Backoff { remaining: REWIND_BACKOFF };
                Ok(self.into())
            }
            _ => {
                debug!("Ignoring stale timeout for {peer}");
                Ok(self.into())
            }
        }
    }

    /// Whether the message comes from the peer currently being queried.
    fn is_queried(&self, from: &Address) -> bool {
        matches!(self.role.mode, WalkMode::Querying { .. })
            && *from == Address::Node(self.role.sorted_peers[self.role.current])
    }

    fn query_current(&mut self) -> Result<()> {
        let peer = self.role.sorted_peers[self.role.current];
        self.role.mode = WalkMode::Querying { timer: 0 };
        self.send_peer(peer, Message::DecisionRequest { txid: self.role.request.txid })
    }

    /// Moves the walk to the next peer, or rewinds if the list is
    /// exhausted.
    fn advance(mut self) -> Result<Node> {
        self.role.current += 1;
        if self.role.current < self.role.sorted_peers.len() {
            self.query_current()?;
            return Ok(self.into());
        }
        self.rewind()
    }

    /// Backs off, then restarts the walk from the first peer with the
    /// recovered and intersection sets restored to their seeds. The backoff
    /// gives a slow-to-restart peer time to come up between attempts.
    fn rewind(mut self) -> Result<Node> {
        debug!("Peer walk exhausted, backing off before rewinding");
        self.role.mode = WalkMode::Backoff { remaining: REWIND_BACKOFF };
        Ok(self.into())
    }

    fn restart_walk(&mut self) -> Result<()> {
        self.role.current = 0;
        self.role.recovered = [self.id].into();
        self.role.intersection = self.role.seed.clone();
        self.query_current()
    }

    /// The election readiness check, run when the walk completes with every
    /// peer reporting in-recovery: every process numbered up to the highest
    /// id in the up-set intersection must itself have recovered, which
    /// certifies that no process holding a more advanced decision state is
    /// still unreachable.
    fn try_elect(self) -> Result<Node> {
        let Some(max) = self.role.intersection.iter().max().copied() else {
            return self.rewind();
        };
        if !(1..=max).all(|id| self.role.recovered.contains(&id)) {
            debug!("Recovered processes incomplete below {max}, rewinding");
            return self.rewind();
        }
        self.elect()
    }

    /// Self-elects as the new coordinator: the up-set becomes the recovered
    /// subset of the transaction's peer set, and the termination protocol
    /// starts.
    fn elect(mut self) -> Result<Node> {
        debug!("Self-electing as coordinator for {}", self.role.request.txid);
        self.up_set = self
            .role
            .request
            .peer_ids()
            .into_iter()
            .filter(|id| self.role.recovered.contains(id))
            .collect();
        self.into_termination()
    }

    /// Becomes the new coordinator and starts the termination protocol by
    /// polling the surviving up-set for precommit state.
    fn into_termination(self) -> Result<Node> {
        let request = self.role.request.clone();
        let txid = request.txid;
        let polled: BTreeSet<NodeID> = self.up_set_peers().into_iter().collect();
        let timers = polled.iter().map(|id| (*id, 0)).collect();
        let mut node = self.into_role(RecoveringCoordinator {
            request,
            phase: TerminationPhase::Polling {
                pending: polled.clone(),
                precommitted: false,
                timers,
            },
        });
        if polled.is_empty() {
            // Nobody else survived, and the local node only knows it voted
            // yes: abort is the safe verdict.
            return node.decide(false);
        }
        node.broadcast(polled, Message::StateRequest { txid })?;
        Ok(node.into())
    }
}

/// A node that took over as coordinator after recovery, running the
/// termination protocol: poll the surviving up-set for precommit state,
/// then drive a commit if anyone precommitted, or a safe abort if everyone
/// is uncertain. A polled peer that relays an actual decision settles the
/// verdict outright.
#[derive(Clone, Debug, PartialEq)]
pub struct RecoveringCoordinator {
    request: VoteRequest,
    phase: TerminationPhase,
}

#[derive(Clone, Debug, PartialEq)]
enum TerminationPhase {
    /// State reports are being collected from the up-set.
    Polling { pending: BTreeSet<NodeID>, precommitted: bool, timers: BTreeMap<NodeID, Ticks> },
    /// Someone precommitted; the precommit has been rebroadcast and
    /// acknowledgements are being collected before the commit.
    Acking { pending: BTreeSet<NodeID>, timers: BTreeMap<NodeID, Ticks> },
}

impl Role for RecoveringCoordinator {}

impl RawNode<RecoveringCoordinator> {
    pub(super) fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert_step(&msg);
        let txid = self.role.request.txid;
        match msg.message {
            Message::Precommit { txid: t } if t == txid => self.report(msg.from, true),
            Message::Uncertain { txid: t } if t == txid => self.report(msg.from, false),
            Message::Commit { txid: t } if t == txid => self.decide(true),
            Message::Abort { txid: t } if t == txid => self.decide(false),
            Message::Ack { txid: t } if t == txid => self.ack(msg.from),
            Message::Timeout { peer } => self.timeout(peer),
            Message::DecisionRequest { txid: t } => {
                // While polling, the verdict is still open; stay silent and
                // let the asker's own timeout advance its walk.
                if matches!(self.role.phase, TerminationPhase::Acking { .. }) {
                    self.answer_decision_request(msg.from, t, Some((txid, true)))?;
                }
                Ok(self.into())
            }
            message => {
                debug!("Ignoring {message} during termination");
                Ok(self.into())
            }
        }
    }

    pub(super) fn tick(mut self) -> Result<Node> {
        let id = self.id;
        let (limit, timers) = match &mut self.role.phase {
            TerminationPhase::Polling { timers, .. } => (DECISION_TIMEOUT, timers),
            TerminationPhase::Acking { timers, .. } => (ACK_TIMEOUT, timers),
        };
        for ticks in timers.values_mut() {
            *ticks += 1;
        }
        let expired: Vec<NodeID> =
            timers.iter().filter(|(_, ticks)| **ticks >= limit).map(|(id, _)| *id).collect();
        timers.retain(|id, _| !expired.contains(id));
        let mut node: Node = self.into();
        for peer in expired {
            node = node.step(Envelope {
                from: Address::Node(id),
                to: Address::Node(id),
                message: Message::Timeout { peer },
            })?;
        }
        Ok(node)
    }

    /// Records a polled peer's precommit-state report.
    fn report(mut self, from: Address, precommit: bool) -> Result<Node> {
        let Address::Node(from) = from else {
            return Err(Error::Internal("state report from client".to_owned()));
        };
        let TerminationPhase::Polling { pending, precommitted, timers } = &mut self.role.phase
        else {
            debug!("Ignoring late state report from {from}");
            return Ok(self.into());
        };
        pending.remove(&from);
        timers.remove(&from);
        *precommitted |= precommit;
        self.maybe_close_poll()
    }

    /// A poll timeout counts the peer as reporting nothing.
    fn timeout(mut self, peer: NodeID) -> Result<Node> {
        match &mut self.role.phase {
            TerminationPhase::Polling { pending, .. } => {
                pending.remove(&peer);
                self.maybe_close_poll()
            }
            TerminationPhase::Acking { pending, .. } => {
                // Implicit acknowledgement, as in the normal protocol.
                pending.remove(&peer);
                self.maybe_commit()
            }
        }
    }

    fn ack(mut self, from: Address) -> Result<Node> {
        let Address::Node(from) = from else {
            return Err(Error::Internal("ack from client".to_owned()));
        };
        let TerminationPhase::Acking { pending, timers } = &mut self.role.phase else {
            debug!("Ignoring stray ack from {from}");
            return Ok(self.into());
        };
        pending.remove(&from);
        timers.remove(&from);
        self.maybe_commit()
    }

    /// Once every polled peer has reported or timed out: rebroadcast the
    /// precommit if anyone precommitted, otherwise abort. The abort is safe
    /// because no participant had progressed past voting.
    fn maybe_close_poll(mut self) -> Result<Node> {
        let TerminationPhase::Polling { pending, precommitted, .. } = &self.role.phase else {
            unreachable!();
        };
        if !pending.is_empty() {
            return Ok(self.into());
        }
        let precommitted = *precommitted;
        if !precommitted {
            return self.decide(false);
        }
        let txid = self.role.request.txid;
        let polled: BTreeSet<NodeID> = self.up_set_peers().into_iter().collect();
        let timers = polled.iter().map(|id| (*id, 0)).collect();
        self.role.phase = TerminationPhase::Acking { pending: polled.clone(), timers };
        self.broadcast(polled, Message::Precommit { txid })?;
        Ok(self.into())
    }

    fn maybe_commit(mut self) -> Result<Node> {
        let TerminationPhase::Acking { pending, .. } = &self.role.phase else {
            unreachable!();
        };
        if !pending.is_empty() {
            return Ok(self.into());
        }
        self.decide(true)
    }

    /// Settles the transaction's verdict, broadcasts it to the surviving
    /// up-set, and takes over as the normal coordinator.
    fn decide(mut self, commit: bool) -> Result<Node> {
        let request = self.role.request.clone();
        let txid = request.txid;
        if commit {
            self.apply_commit(&request)?;
            self.broadcast(self.up_set_peers(), Message::Commit { txid })?;
        } else {
            self.apply_abort(txid)?;
            self.broadcast(self.up_set_peers(), Message::Abort { txid })?;
        }
        warn!("Termination protocol settled {txid}: commit={commit}");
        Ok(self.into_role(Coordinator::idle()).into())
    }
}
