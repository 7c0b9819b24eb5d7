use super::super::message::{Address, Envelope, Message, VoteRequest, NO_TRANSACTION};
use super::super::{NodeID, Ticks, TransactionID, ACK_TIMEOUT, VOTE_TIMEOUT};
use super::{Node, RawNode, Role};
use crate::error::{Error, Result};

use log::{debug, warn};
use std::collections::{BTreeMap, BTreeSet};

/// The coordinator role: it receives vote requests from the transaction
/// submitter, collects votes, and drives the precommit/commit handoff.
///
/// The fail-fast rule applies only while collecting votes: a single no
/// vote or vote timeout aborts the transaction. Once the precommit has
/// been broadcast the coordinator never aborts, and an acknowledgement
/// timeout counts as an implicit acknowledgement.
#[derive(Clone, Debug, PartialEq)]
pub struct Coordinator {
    phase: Phase,
}

#[derive(Clone, Debug, PartialEq)]
enum Phase {
    /// No transaction in progress.
    Idle,
    /// Votes are being collected.
    Voting(Round),
    /// The precommit has been broadcast; acknowledgements are being
    /// collected.
    Acking(Round),
}

/// A transaction round in progress.
#[derive(Clone, Debug, PartialEq)]
struct Round {
    request: VoteRequest,
    /// The polled participants, ascending, excluding the coordinator.
    participants: Vec<NodeID>,
    /// Participants that have responded in the current phase.
    responded: BTreeSet<NodeID>,
    /// Elapsed ticks per participant with an outstanding response.
    timers: BTreeMap<NodeID, Ticks>,
}

impl Round {
    fn new(request: VoteRequest, coordinator: NodeID) -> Self {
        let participants = request.participant_ids(coordinator);
        let timers = participants.iter().map(|id| (*id, 0)).collect();
        Self { request, participants, responded: BTreeSet::new(), timers }
    }

    /// Resets the responded set and re-arms all participant timers, for the
    /// transition into the acknowledgement phase.
    fn rearm(&mut self) {
        self.responded.clear();
        self.timers = self.participants.iter().map(|id| (*id, 0)).collect();
    }

    fn complete(&self) -> bool {
        self.participants.iter().all(|id| self.responded.contains(id))
    }
}

impl Role for Coordinator {}

impl Coordinator {
    pub(super) fn idle() -> Self {
        Self { phase: Phase::Idle }
    }
}

impl RawNode<Coordinator> {
    pub(super) fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert_step(&msg);

        // Any real message from a peer cancels that peer's phase timer.
        if let Address::Node(from) = msg.from {
            if let Phase::Voting(round) | Phase::Acking(round) = &mut self.role.phase {
                round.timers.remove(&from);
            }
        }

        match msg.message {
            Message::VoteRequest(request) => self.request(msg.from, request),

            Message::Yes { txid } => self.yes(msg.from, txid),

            Message::No { txid } => {
                if matches!(&self.role.phase, Phase::Voting(r) if r.request.txid == txid) {
                    return self.abort_round();
                }
                debug!("Ignoring stale no vote for {txid}");
                Ok(self.into())
            }

            Message::Timeout { peer } => {
                // A vote timeout is a failed vote; an ack timeout is an
                // implicit acknowledgement.
                if matches!(self.role.phase, Phase::Voting(_)) {
                    return self.abort_round();
                }
                self.timeout_ack(peer)
            }

            Message::Ack { txid } => self.ack(msg.from, txid),

            Message::DecisionRequest { txid } | Message::StateRequest { txid } => {
                let ongoing = match &self.role.phase {
                    Phase::Idle => None,
                    Phase::Voting(round) => Some((round.request.txid, false)),
                    Phase::Acking(round) => Some((round.request.txid, true)),
                };
                self.answer_decision_request(msg.from, txid, ongoing)?;
                Ok(self.into())
            }

            Message::DubCoordinator => {
                debug!("Already coordinating");
                Ok(self.into())
            }

            message => {
                warn!("Ignoring unexpected message {message}");
                Ok(self.into())
            }
        }
    }

    /// Advances the phase timers, injecting a synthetic timeout for each
    /// expired participant through the ordinary dispatch path.
    pub(super) fn tick(mut self) -> Result<Node> {
        let limit = match &self.role.phase {
            Phase::Idle => return Ok(self.into()),
            Phase::Voting(_) => VOTE_TIMEOUT,
            Phase::Acking(_) => ACK_TIMEOUT,
        };
        let id = self.id;
        let expired: Vec<NodeID> = match &mut self.role.phase {
            Phase::Voting(round) | Phase::Acking(round) => {
                for ticks in round.timers.values_mut() {
                    *ticks += 1;
                }
                let expired: Vec<NodeID> = round
                    .timers
                    .iter()
                    .filter(|(_, ticks)| **ticks >= limit)
                    .map(|(id, _)| *id)
                    .collect();
                round.timers.retain(|id, _| !expired.contains(id));
                expired
            }
            Phase::Idle => unreachable!(),
        };
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

    /// Starts a new transaction round for a submitted request. The
    /// coordinator assigns the transaction ID and stamps the cluster's
    /// peer set onto the request, logs it together with its own implicit
    /// yes vote, and broadcasts it to all participants.
    fn request(mut self, from: Address, mut request: VoteRequest) -> Result<Node> {
        if from != Address::Client {
            return Err(Error::Internal(format!(
                "vote request {} from {from:?} while coordinating",
                request.txid
            )));
        }
        if !matches!(self.role.phase, Phase::Idle) {
            // One transaction at a time; reject the submission outright.
            self.send(from, Message::Abort { txid: request.txid })?;
            return Ok(self.into());
        }

        if request.txid == NO_TRANSACTION {
            request.txid = self.next_txid;
        }
        self.next_txid = self.next_txid.max(request.txid + 1);
        request.peers = self.cluster.clone();
        let txid = request.txid;

        self.log.append(&Message::VoteRequest(request.clone()))?;
        if !self.store.validate(&request.action) {
            self.apply_abort(txid)?;
            self.send(Address::Client, Message::Abort { txid })?;
            return Ok(self.into());
        }
        self.log.append(&Message::Yes { txid })?;
        self.up_set = request.peer_ids();

        let round = Round::new(request.clone(), self.id);
        if round.participants.is_empty() {
            // Single-node cluster: the unanimous vote is the local one.
            self.apply_commit(&request)?;
            self.send(Address::Client, Message::Commit { txid })?;
            return Ok(self.into());
        }
        self.broadcast(round.participants.clone(), Message::VoteRequest(request))?;
        self.role.phase = Phase::Voting(round);
        Ok(self.into())
    }

    fn yes(mut self, from: Address, txid: TransactionID) -> Result<Node> {
        let Address::Node(from) = from else {
            return Err(Error::Internal("yes vote from client".to_owned()));
        };
        let Phase::Voting(round) = &mut self.role.phase else {
            debug!("Ignoring stale yes vote for {txid} from {from}");
            return Ok(self.into());
        };
        if round.request.txid != txid {
            debug!("Ignoring stale yes vote for {txid} from {from}");
            return Ok(self.into());
        }
        round.responded.insert(from);
        if !round.complete() {
            return Ok(self.into());
        }

        // Unanimous yes: broadcast the precommit and collect acks.
        let mut round = round.clone();
        round.rearm();
        self.broadcast(round.participants.clone(), Message::Precommit { txid })?;
        self.role.phase = Phase::Acking(round);
        Ok(self.into())
    }

    /// Aborts the current voting round on the first no vote or vote
    /// timeout, reporting the outcome to the submitter. Must only be
    /// called in the voting phase.
    fn abort_round(mut self) -> Result<Node> {
        let Phase::Voting(round) = std::mem::replace(&mut self.role.phase, Phase::Idle) else {
            unreachable!();
        };
        let txid = round.request.txid;
        self.apply_abort(txid)?;
        self.broadcast(round.participants, Message::Abort { txid })?;
        self.send(Address::Client, Message::Abort { txid })?;
        Ok(self.into())
    }

    fn ack(mut self, from: Address, txid: TransactionID) -> Result<Node> {
        let Address::Node(from) = from else {
            return Err(Error::Internal("ack from client".to_owned()));
        };
        let Phase::Acking(round) = &mut self.role.phase else {
            debug!("Ignoring stale ack for {txid} from {from}");
            return Ok(self.into());
        };
        if round.request.txid != txid {
            debug!("Ignoring stale ack for {txid} from {from}");
            return Ok(self.into());
        }
        round.responded.insert(from);
        self.maybe_commit()
    }

    /// An acknowledgement timeout counts as an implicit acknowledgement;
    /// the timed-out participant will reach the commit via recovery.
    fn timeout_ack(mut self, peer: NodeID) -> Result<Node> {
        let Phase::Acking(round) = &mut self.role.phase else {
            debug!("Ignoring stale timeout for {peer}");
            return Ok(self.into());
        };
        round.responded.insert(peer);
        self.maybe_commit()
    }

    /// Commits the round once every participant has acknowledged or timed
    /// out.
    fn maybe_commit(mut self) -> Result<Node> {
        let Phase::Acking(round) = &self.role.phase else { unreachable!() };
        if !round.complete() {
            return Ok(self.into());
        }
        let Phase::Acking(round) = std::mem::replace(&mut self.role.phase, Phase::Idle) else {
            unreachable!();
        };
        let txid = round.request.txid;
        self.apply_commit(&round.request)?;
        self.broadcast(round.participants, Message::Commit { txid })?;
        self.send(Address::Client, Message::Commit { txid })?;
        Ok(self.into())
    }
}

#[cfg(test)]
mod tests {
    use super::super::super::log::DtLog;
    use super::super::super::message::{Action, FaultPlan};
    use super::super::super::state::Store;
    use super::super::tests::{assert_messages, peer_refs};
    use super::*;
    use crate::storage::Memory;
    use pretty_assertions::assert_eq;

    /// Sets up an idle coordinator with id 1 in a 3-node cluster.
    fn setup() -> (Node, crossbeam::channel::Receiver<Envelope>) {
        let (node_tx, node_rx) = crossbeam::channel::unbounded();
        let node = RawNode {
            id: 1,
            cluster: peer_refs(&[1, 2, 3]),
            store: Store::new(),
            log: DtLog::new(Box::new(Memory::new()), 1),
            up_set: [1, 2, 3].into(),
            next_txid: 1,
            decided: None,
            node_tx,
            role: Coordinator::idle(),
        };
        (node.into(), node_rx)
    }

    fn submit(name: &str, value: &str) -> Envelope {
        Envelope {
            from: Address::Client,
            to: Address::Node(1),
            message: Message::VoteRequest(VoteRequest {
                txid: NO_TRANSACTION,
                action: Action::Add { name: name.to_owned(), value: value.to_owned() },
                peers: vec![],
                fault: FaultPlan::default(),
            }),
        }
    }

    fn envelope(from: NodeID, message: Message) -> Envelope {
        Envelope { from: Address::Node(from), to: Address::Node(1), message }
    }

    fn sent(to: Address, message: Message) -> Envelope {
        Envelope { from: Address::Node(1), to, message }
    }

    fn stamped_request(txid: TransactionID, name: &str, value: &str) -> VoteRequest {
        VoteRequest {
            txid,
            action: Action::Add { name: name.to_owned(), value: value.to_owned() },
            peers: peer_refs(&[1, 2, 3]),
            fault: FaultPlan::default(),
        }
    }

    #[test]
    fn unanimous_yes_and_ack_commits() -> Result<()> {
        let (node, mut rx) = setup();
        let node = node.step(submit("s", "u"))?;
        let request = Message::VoteRequest(stamped_request(1, "s", "u"));
        assert_messages(
            &mut rx,
            vec![sent(Address::Node(2), request.clone()), sent(Address::Node(3), request)],
        );

        let node = node.step(envelope(2, Message::Yes { txid: 1 }))?;
        assert_messages(&mut rx, vec![]);
        let node = node.step(envelope(3, Message::Yes { txid: 1 }))?;
        assert_messages(
            &mut rx,
            vec![
                sent(Address::Node(2), Message::Precommit { txid: 1 }),
                sent(Address::Node(3), Message::Precommit { txid: 1 }),
            ],
        );

        let node = node.step(envelope(2, Message::Ack { txid: 1 }))?;
        assert_messages(&mut rx, vec![]);
        let node = node.step(envelope(3, Message::Ack { txid: 1 }))?;
        assert_messages(
            &mut rx,
            vec![
                sent(Address::Node(2), Message::Commit { txid: 1 }),
                sent(Address::Node(3), Message::Commit { txid: 1 }),
                sent(Address::Client, Message::Commit { txid: 1 }),
            ],
        );
        assert_eq!(node.store().get("s"), Some(&"u".to_owned()));
        assert!(matches!(node, Node::Coordinator(_)));
        Ok(())
    }

    #[test]
    fn single_no_vote_aborts() -> Result<()> {
        let (node, mut rx) = setup();
        let node = node.step(submit("s", "u"))?;
        while rx.try_recv().is_ok() {}

        let node = node.step(envelope(2, Message::Yes { txid: 1 }))?;
        let node = node.step(envelope(3, Message::No { txid: 1 }))?;
        assert_messages(
            &mut rx,
            vec![
                sent(Address::Node(2), Message::Abort { txid: 1 }),
                sent(Address::Node(3), Message::Abort { txid: 1 }),
                sent(Address::Client, Message::Abort { txid: 1 }),
            ],
        );
        assert!(node.store().is_empty());

        // The next submission gets a fresh transaction ID.
        let node = node.step(submit("s", "u"))?;
        let request = Message::VoteRequest(stamped_request(2, "s", "u"));
        assert_messages(
            &mut rx,
            vec![sent(Address::Node(2), request.clone()), sent(Address::Node(3), request)],
        );
        drop(node);
        Ok(())
    }

    #[test]
    fn vote_timeout_aborts() -> Result<()> {
        let (node, mut rx) = setup();
        let mut node = node.step(submit("s", "u"))?;
        while rx.try_recv().is_ok() {}

        node = node.step(envelope(2, Message::Yes { txid: 1 }))?;
        for _ in 0..VOTE_TIMEOUT {
            node = node.tick()?;
        }
        assert_messages(
            &mut rx,
            vec![
                sent(Address::Node(2), Message::Abort { txid: 1 }),
                sent(Address::Node(3), Message::Abort { txid: 1 }),
                sent(Address::Client, Message::Abort { txid: 1 }),
            ],
        );
        Ok(())
    }

    #[test]
    fn ack_timeout_still_commits() -> Result<()> {
        let (node, mut rx) = setup();
        let mut node = node.step(submit("s", "u"))?;
        node = node.step(envelope(2, Message::Yes { txid: 1 }))?;
        node = node.step(envelope(3, Message::Yes { txid: 1 }))?;
        while rx.try_recv().is_ok() {}

        node = node.step(envelope(2, Message::Ack { txid: 1 }))?;
        for _ in 0..ACK_TIMEOUT {
            node = node.tick()?;
        }
        assert_messages(
            &mut rx,
            vec![
                sent(Address::Node(2), Message::Commit { txid: 1 }),
                sent(Address::Node(3), Message::Commit { txid: 1 }),
                sent(Address::Client, Message::Commit { txid: 1 }),
            ],
        );
        assert_eq!(node.store().get("s"), Some(&"u".to_owned()));
        Ok(())
    }

    #[test]
    fn invalid_request_aborts_locally() -> Result<()> {
        let (node, mut rx) = setup();
        let Node::Coordinator(mut raw) = node else { unreachable!() };
        raw.store.apply(&Action::Add { name: "s".to_owned(), value: "old".to_owned() })?;
        let node = Node::from(raw).step(submit("s", "u"))?;
        assert_messages(&mut rx, vec![sent(Address::Client, Message::Abort { txid: 1 })]);
        assert!(matches!(node, Node::Coordinator(_)));
        Ok(())
    }

    #[test]
    fn submission_while_busy_rejected() -> Result<()> {
        let (node, mut rx) = setup();
        let node = node.step(submit("s", "u"))?;
        while rx.try_recv().is_ok() {}

        let node = node.step(submit("t", "v"))?;
        assert_messages(
            &mut rx,
            vec![sent(Address::Client, Message::Abort { txid: NO_TRANSACTION })],
        );

        // The original round is still live.
        let node = node.step(envelope(2, Message::Yes { txid: 1 }))?;
        let node = node.step(envelope(3, Message::Yes { txid: 1 }))?;
        assert_messages(
            &mut rx,
            vec![
                sent(Address::Node(2), Message::Precommit { txid: 1 }),
                sent(Address::Node(3), Message::Precommit { txid: 1 }),
            ],
        );
        drop(node);
        Ok(())
    }
}
