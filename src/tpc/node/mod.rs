mod coordinator;
mod participant;
mod recovery;

use super::log::DtLog;
use super::message::{Address, Envelope, Message, PeerRef, VoteRequest};
use super::state::Store;
use super::{NodeID, TransactionID};
use crate::error::{Error, Result};

use coordinator::Coordinator;
use participant::Participant;
pub use recovery::RecoveryState;
use recovery::{RecoveringCoordinator, RecoveringParticipant};

use itertools::Itertools as _;
use log::debug;
use std::collections::BTreeSet;

/// A 3PC node, with a dynamic role. The node is driven synchronously by
/// processing inbound messages via step() or by advancing time via tick().
/// These methods consume the current node, and return a new one with a
/// possibly different role. Outbound messages are sent via the given
/// node_tx channel.
///
/// This enum wraps the RawNode<Role> types, which implement the actual
/// node logic. It exists for ergonomic use across role transitions, i.e.
/// node = node.step()?.
pub enum Node {
    Participant(RawNode<Participant>),
    Coordinator(RawNode<Coordinator>),
    RecoveringParticipant(RawNode<RecoveringParticipant>),
    RecoveringCoordinator(RawNode<RecoveringCoordinator>),
}

impl Node {
    /// Creates a node, replaying its transaction log. A log that ends
    /// mid-transaction puts the node straight into recovery; otherwise it
    /// starts as an ordinary participant.
    pub fn new(
        id: NodeID,
        peers: Vec<PeerRef>,
        log: DtLog,
        node_tx: crossbeam::channel::Sender<Envelope>,
    ) -> Result<Self> {
        let replayed = replay(log.replay()?)?;
        let cluster: Vec<PeerRef> = peers.into_iter().sorted_by_key(|p| p.id).dedup().collect();
        if !cluster.iter().any(|p| p.id == id) {
            return Err(Error::Internal(format!("node {id} not in cluster")));
        }
        let up_set: BTreeSet<NodeID> = match &replayed.pending {
            // The logged request's peer set is the last cluster view this
            // node is known to have held before the crash.
            Some(request) => request.peer_ids(),
            None => cluster.iter().map(|p| p.id).collect(),
        };
        let node = RawNode {
            id,
            cluster,
            store: replayed.store,
            log,
            up_set,
            next_txid: replayed.next_txid,
            decided: replayed.decided,
            node_tx,
            role: Participant::new(),
        };
        match replayed.pending {
            Some(request) => node.into_recovery(request),
            None => Ok(node.into()),
        }
    }

    /// Returns the node ID.
    pub fn id(&self) -> NodeID {
        match self {
            Node::Participant(n) => n.id,
            Node::Coordinator(n) => n.id,
            Node::RecoveringParticipant(n) => n.id,
            Node::RecoveringCoordinator(n) => n.id,
        }
    }

    /// Whether the node currently acts as the coordinator.
    pub fn is_coordinator(&self) -> bool {
        matches!(self, Node::Coordinator(_))
    }

    /// Returns the node's replicated item store.
    pub fn store(&self) -> &Store {
        match self {
            Node::Participant(n) => &n.store,
            Node::Coordinator(n) => &n.store,
            Node::RecoveringParticipant(n) => &n.store,
            Node::RecoveringCoordinator(n) => &n.store,
        }
    }

    /// Processes an inbound message. Dispatch is serialized per node: a
    /// step runs to completion before the next message is processed.
    pub fn step(self, msg: Envelope) -> Result<Self> {
        debug!("Stepping {:?}", msg);
        match self {
            Node::Participant(n) => n.step(msg),
            Node::Coordinator(n) => n.step(msg),
            Node::RecoveringParticipant(n) => n.step(msg),
            Node::RecoveringCoordinator(n) => n.step(msg),
        }
    }

    /// Moves time forward by a tick. Expired timers inject synthetic
    /// Timeout messages through the ordinary step() dispatch path.
    pub fn tick(self) -> Result<Self> {
        match self {
            Node::Participant(n) => n.tick(),
            Node::Coordinator(n) => n.tick(),
            Node::RecoveringParticipant(n) => n.tick(),
            Node::RecoveringCoordinator(n) => n.tick(),
        }
    }
}

impl From<RawNode<Participant>> for Node {
    fn from(n: RawNode<Participant>) -> Self {
        Node::Participant(n)
    }
}

impl From<RawNode<Coordinator>> for Node {
    fn from(n: RawNode<Coordinator>) -> Self {
        Node::Coordinator(n)
    }
}

impl From<RawNode<RecoveringParticipant>> for Node {
    fn from(n: RawNode<RecoveringParticipant>) -> Self {
        Node::RecoveringParticipant(n)
    }
}

impl From<RawNode<RecoveringCoordinator>> for Node {
    fn from(n: RawNode<RecoveringCoordinator>) -> Self {
        Node::RecoveringCoordinator(n)
    }
}

/// A node role: participant, coordinator, or one of the recovery roles.
pub trait Role: Clone + std::fmt::Debug + PartialEq {}

/// A 3PC node with the concrete role R.
///
/// This implements the typestate pattern, where individual node states
/// (roles) are encoded as RawNode<Role>.
pub struct RawNode<R: Role = Participant> {
    id: NodeID,
    /// All cluster members including the local node, ascending by id. The
    /// coordinator stamps this set onto every vote request it broadcasts.
    cluster: Vec<PeerRef>,
    store: Store,
    log: DtLog,
    /// The peer ids this node currently believes are alive, self included.
    up_set: BTreeSet<NodeID>,
    /// The next transaction ID to assign when acting as coordinator.
    next_txid: TransactionID,
    /// The latest terminal decision, used to answer decision requests from
    /// recovering peers.
    decided: Option<(TransactionID, bool)>,
    node_tx: crossbeam::channel::Sender<Envelope>,
    role: R,
}

impl<R: Role> RawNode<R> {
    /// Helper for role transitions.
    fn into_role<T: Role>(self, role: T) -> RawNode<T> {
        RawNode {
            id: self.id,
            cluster: self.cluster,
            store: self.store,
            log: self.log,
            up_set: self.up_set,
            next_txid: self.next_txid,
            decided: self.decided,
            node_tx: self.node_tx,
            role,
        }
    }

    /// Sends a message.
    fn send(&self, to: Address, message: Message) -> Result<()> {
        let msg = Envelope { from: Address::Node(self.id), to, message };
        debug!("Sending {msg:?}");
        Ok(self.node_tx.send(msg)?)
    }

    /// Sends a message to a peer node.
    fn send_peer(&self, to: NodeID, message: Message) -> Result<()> {
        self.send(Address::Node(to), message)
    }

    /// Broadcasts a message to the given peers, in ascending id order so
    /// that every node observes the same relative send order.
    fn broadcast(&self, to: impl IntoIterator<Item = NodeID>, message: Message) -> Result<()> {
        for id in to.into_iter().sorted() {
            self.send_peer(id, message.clone())?;
        }
        Ok(())
    }

    /// The ids of the node's current up-set, excluding the local node, in
    /// ascending order.
    fn up_set_peers(&self) -> Vec<NodeID> {
        self.up_set.iter().copied().filter(|id| *id != self.id).collect()
    }

    /// Asserts message invariants when stepping.
    fn assert_step(&self, msg: &Envelope) {
        // Messages must be addressed to the local node.
        assert_eq!(msg.to, Address::Node(self.id), "Message to other node");

        // Senders must be known.
        match msg.from {
            Address::Client => {}
            Address::Node(from) => assert!(
                from == self.id || self.cluster.iter().any(|p| p.id == from),
                "Unknown sender {from}",
            ),
        }
    }

    /// Logs a commit decision, then applies the action to the replicated
    /// items. The log entry must be durable before the action becomes
    /// externally observable.
    fn apply_commit(&mut self, request: &VoteRequest) -> Result<()> {
        self.log.append(&Message::Commit { txid: request.txid })?;
        self.store.apply(&request.action)?;
        self.decided = Some((request.txid, true));
        Ok(())
    }

    /// Logs an abort decision. The replicated items are untouched.
    fn apply_abort(&mut self, txid: TransactionID) -> Result<()> {
        self.log.append(&Message::Abort { txid })?;
        self.decided = Some((txid, false));
        Ok(())
    }

    /// Answers a recovering peer's decision request. `ongoing` carries the
    /// current transaction's id and precommit status, if any. A known
    /// decision is relayed outright; an ongoing transaction reports
    /// precommitted or uncertain; an unknown transaction is answered with
    /// abort, since a node that never logged the request never voted yes
    /// and no precommit can have happened.
    fn answer_decision_request(
        &self,
        to: Address,
        txid: TransactionID,
        ongoing: Option<(TransactionID, bool)>,
    ) -> Result<()> {
        let reply = match self.decided {
            Some((decided, true)) if decided == txid => Message::Commit { txid },
            Some((decided, false)) if decided == txid => Message::Abort { txid },
            _ => match ongoing {
                Some((ongoing, true)) if ongoing == txid => Message::Precommit { txid },
                Some((ongoing, false)) if ongoing == txid => Message::Uncertain { txid },
                _ => Message::Abort { txid },
            },
        };
        self.send(to, reply)
    }
}

/// The result of interpreting a replayed log.
struct Replayed {
    store: Store,
    pending: Option<VoteRequest>,
    decided: Option<(TransactionID, bool)>,
    next_txid: TransactionID,
}

/// Interprets a replayed message sequence exactly as the live state
/// machines interpret traffic: a vote request opens a pending transaction,
/// an abort closes it with no effect, a commit closes it and applies the
/// action. Inconsistencies are fatal: the node cannot safely determine its
/// state and must not rejoin automatically.
fn replay(messages: Vec<Message>) -> Result<Replayed> {
    let mut replayed =
        Replayed { store: Store::new(), pending: None, decided: None, next_txid: 1 };
    for message in messages {
        match message {
            Message::VoteRequest(request) => {
                if let Some(pending) = &replayed.pending {
                    return Err(Error::Internal(format!(
                        "log replay: request {} logged while {} is pending",
                        request.txid, pending.txid
                    )));
                }
                replayed.next_txid = replayed.next_txid.max(request.txid + 1);
                replayed.pending = Some(request);
            }
            Message::Yes { txid } => match &replayed.pending {
                Some(request) if request.txid == txid => {}
                _ => {
                    return Err(Error::Internal(format!(
                        "log replay: yes vote for {txid} with no matching request"
                    )))
                }
            },
            Message::Commit { txid } => match replayed.pending.take() {
                Some(request) if request.txid == txid => {
                    replayed.store.apply(&request.action)?;
                    replayed.decided = Some((txid, true));
                }
                _ => {
                    return Err(Error::Internal(format!(
                        "log replay: commit of {txid} with no open transaction"
                    )))
                }
            },
            Message::Abort { txid } => match replayed.pending.take() {
                Some(request) if request.txid == txid => {
                    replayed.decided = Some((txid, false));
                }
                _ => {
                    return Err(Error::Internal(format!(
                        "log replay: abort of {txid} with no open transaction"
                    )))
                }
            },
            message => {
                return Err(Error::Internal(format!("log replay: unexpected entry {message}")))
            }
        }
    }
    Ok(replayed)
}

#[cfg(test)]
pub mod tests {
    use super::super::message::{Action, FaultPlan};
    use super::*;
    use crate::storage::Memory;
    use pretty_assertions::assert_eq;

    /// Asserts that the given receiver contains exactly these messages.
    #[track_caller]
    pub fn assert_messages(rx: &mut crossbeam::channel::Receiver<Envelope>, msgs: Vec<Envelope>) {
        let mut actual = Vec::new();
        while let Ok(message) = rx.try_recv() {
            actual.push(message)
        }
        assert_eq!(msgs, actual);
    }

    pub fn peer_refs(ids: &[NodeID]) -> Vec<PeerRef> {
        ids.iter().map(|id| PeerRef::new(*id, format!("127.0.0.1:700{id}"))).collect()
    }

    pub fn add_request(txid: TransactionID, peers: &[NodeID]) -> VoteRequest {
        VoteRequest {
            txid,
            action: Action::Add { name: "s".to_owned(), value: "u".to_owned() },
            peers: peer_refs(peers),
            fault: FaultPlan::default(),
        }
    }

    fn node_from_log(
        id: NodeID,
        peers: &[NodeID],
        messages: Vec<Message>,
    ) -> Result<(Node, crossbeam::channel::Receiver<Envelope>)> {
        let mut log = DtLog::new(Box::new(Memory::new()), id);
        for message in &messages {
            log.append(message)?;
        }
        let (node_tx, node_rx) = crossbeam::channel::unbounded();
        Ok((Node::new(id, peer_refs(peers), log, node_tx)?, node_rx))
    }

    #[test]
    fn new_clean_is_participant() -> Result<()> {
        let (node, _rx) = node_from_log(1, &[1, 2, 3], vec![])?;
        assert!(matches!(node, Node::Participant(_)));
        assert!(node.store().is_empty());
        Ok(())
    }

    #[test]
    fn replay_committed() -> Result<()> {
        let (node, _rx) = node_from_log(
            2,
            &[1, 2, 3],
            vec![
                Message::VoteRequest(add_request(1, &[1, 2, 3])),
                Message::Yes { txid: 1 },
                Message::Commit { txid: 1 },
            ],
        )?;
        assert!(matches!(node, Node::Participant(_)));
        assert_eq!(node.store().get("s"), Some(&"u".to_owned()));
        Ok(())
    }

    #[test]
    fn replay_aborted() -> Result<()> {
        let (node, _rx) = node_from_log(
            2,
            &[1, 2, 3],
            vec![
                Message::VoteRequest(add_request(1, &[1, 2, 3])),
                Message::Yes { txid: 1 },
                Message::Abort { txid: 1 },
            ],
        )?;
        assert!(matches!(node, Node::Participant(_)));
        assert_eq!(node.store().get("s"), None);
        Ok(())
    }

    #[test]
    fn replay_sequential_transactions() -> Result<()> {
        let update = |txid, value: &str| {
            Message::VoteRequest(VoteRequest {
                txid,
                action: Action::Update {
                    name: "s".to_owned(),
                    new_name: "s".to_owned(),
                    value: value.to_owned(),
                },
                peers: peer_refs(&[1, 2, 3]),
                fault: FaultPlan::default(),
            })
        };

        let (node, _rx) = node_from_log(
            2,
            &[1, 2, 3],
            vec![
                Message::VoteRequest(add_request(1, &[1, 2, 3])),
                Message::Yes { txid: 1 },
                Message::Commit { txid: 1 },
                update(2, "u2"),
                Message::Yes { txid: 2 },
                Message::Commit { txid: 2 },
            ],
        )?;
        assert_eq!(node.store().get("s"), Some(&"u2".to_owned()));

        // The same run with a trailing abort keeps the first value.
        let (node, _rx) = node_from_log(
            2,
            &[1, 2, 3],
            vec![
                Message::VoteRequest(add_request(1, &[1, 2, 3])),
                Message::Yes { txid: 1 },
                Message::Commit { txid: 1 },
                update(2, "u2"),
                Message::Yes { txid: 2 },
                Message::Abort { txid: 2 },
            ],
        )?;
        assert_eq!(node.store().get("s"), Some(&"u".to_owned()));
        Ok(())
    }

    #[test]
    fn replay_pending_enters_recovery() -> Result<()> {
        let (node, mut rx) = node_from_log(
            2,
            &[1, 2, 3],
            vec![Message::VoteRequest(add_request(1, &[1, 2, 3])), Message::Yes { txid: 1 }],
        )?;
        assert!(matches!(node, Node::RecoveringParticipant(_)));
        // The recovery walk starts by querying the lowest-numbered peer.
        assert_messages(
            &mut rx,
            vec![Envelope {
                from: Address::Node(2),
                to: Address::Node(1),
                message: Message::DecisionRequest { txid: 1 },
            }],
        );
        Ok(())
    }

    #[test]
    fn replay_decision_without_request_fatal() {
        let result = node_from_log(2, &[1, 2, 3], vec![Message::Commit { txid: 1 }]);
        assert!(matches!(result, Err(Error::Internal(_))));
        let result = node_from_log(2, &[1, 2, 3], vec![Message::Abort { txid: 1 }]);
        assert!(matches!(result, Err(Error::Internal(_))));
    }

    #[test]
    fn replay_double_request_fatal() {
        let result = node_from_log(
            2,
            &[1, 2, 3],
            vec![
                Message::VoteRequest(add_request(1, &[1, 2, 3])),
                Message::VoteRequest(add_request(2, &[1, 2, 3])),
            ],
        );
        assert!(matches!(result, Err(Error::Internal(_))));
    }
}
