use super::super::message::{Address, Envelope, Message, VoteRequest};
use super::{Node, RawNode, Role};
use crate::error::{Error, Result};

use log::{debug, warn};

/// The normal-case role of a non-coordinator node: it votes on requests
/// and applies decided actions.
///
/// A participant is either idle or mid-transaction (voted yes, awaiting
/// the decision). A participant that votes no does not open a transaction;
/// it has already logged the abort and only ignores the coordinator's
/// matching abort broadcast when it arrives.
#[derive(Clone, Debug, PartialEq)]
pub struct Participant {
    ongoing: Option<Ongoing>,
}

/// A transaction this participant has voted yes on.
#[derive(Clone, Debug, PartialEq)]
struct Ongoing {
    request: VoteRequest,
    /// True once the coordinator's precommit has been received. A
    /// precommitted participant reports Precommit when polled, which is
    /// what lets a recovered coordinator drive the commit home.
    precommitted: bool,
}

impl Role for Participant {}

impl Participant {
    pub fn new() -> Self {
        Self { ongoing: None }
    }
}

impl RawNode<Participant> {
    /// Transitions the participant into the initial coordinator. Only an
    /// idle participant can be dubbed.
    fn into_coordinator(self) -> Result<Node> {
        assert!(self.role.ongoing.is_none(), "dubbed mid-transaction");
        Ok(self.into_role(super::coordinator::Coordinator::idle()).into())
    }

    pub(super) fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert_step(&msg);
        match msg.message {
            Message::VoteRequest(request) => self.vote(msg.from, request),

            Message::Precommit { txid } => {
                match &mut self.role.ongoing {
                    Some(ongoing) if ongoing.request.txid == txid => {
                        ongoing.precommitted = true;
                        self.send(msg.from, Message::Ack { txid })?;
                    }
                    Some(ongoing) => {
                        return Err(Error::Internal(format!(
                            "precommit for {txid} while {} is in progress",
                            ongoing.request.txid
                        )))
                    }
                    // A termination-protocol rebroadcast can reach a node
                    // that already committed; re-acknowledge it.
                    None if self.decided == Some((txid, true)) => {
                        self.send(msg.from, Message::Ack { txid })?;
                    }
                    None => {
                        return Err(Error::Internal(format!(
                            "precommit for unknown transaction {txid}"
                        )))
                    }
                }
                Ok(self.into())
            }

            Message::Commit { txid } => match self.role.ongoing.take() {
                Some(ongoing) if ongoing.request.txid == txid => {
                    self.apply_commit(&ongoing.request)?;
                    Ok(self.into())
                }
                Some(ongoing) => Err(Error::Internal(format!(
                    "commit for {txid} while {} is in progress",
                    ongoing.request.txid
                ))),
                None if self.decided == Some((txid, true)) => Ok(self.into()),
                None => Err(Error::Internal(format!("commit for unknown transaction {txid}"))),
            },

            Message::Abort { txid } => match self.role.ongoing.take() {
                Some(ongoing) if ongoing.request.txid == txid => {
                    self.apply_abort(txid)?;
                    Ok(self.into())
                }
                Some(ongoing) => Err(Error::Internal(format!(
                    "abort for {txid} while {} is in progress",
                    ongoing.request.txid
                ))),
                // The coordinator broadcasts the abort to no-voters too,
                // which already logged it when they voted.
                None => {
                    debug!("Ignoring abort for {txid} with no ongoing transaction");
                    Ok(self.into())
                }
            },

            Message::DecisionRequest { txid } | Message::StateRequest { txid } => {
                let ongoing =
                    self.role.ongoing.as_ref().map(|o| (o.request.txid, o.precommitted));
                self.answer_decision_request(msg.from, txid, ongoing)?;
                Ok(self.into())
            }

            Message::DubCoordinator => self.into_coordinator(),

            Message::Elected { txid, .. } => {
                Err(Error::Internal(format!("elected for {txid} while not recovering")))
            }

            message => {
                warn!("Ignoring unexpected message {message}");
                Ok(self.into())
            }
        }
    }

    /// Participants have no timers; they wait for the coordinator (or, if
    /// they crash, recover via log replay).
    pub(super) fn tick(self) -> Result<Node> {
        Ok(self.into())
    }

    /// Votes on a request. The request is always logged first, then either
    /// an abort (invalid against the local items) or a yes vote, before
    /// the reply goes out.
    fn vote(mut self, from: Address, request: VoteRequest) -> Result<Node> {
        if let Some(ongoing) = &self.role.ongoing {
            return Err(Error::Internal(format!(
                "vote request {} while {} is in progress",
                request.txid, ongoing.request.txid
            )));
        }
        let txid = request.txid;
        self.log.append(&Message::VoteRequest(request.clone()))?;
        self.next_txid = self.next_txid.max(txid + 1);
        if !self.store.validate(&request.action) {
            self.apply_abort(txid)?;
            self.send(from, Message::No { txid })?;
            return Ok(self.into());
        }
        self.log.append(&Message::Yes { txid })?;
        self.up_set = request.peer_ids();
        self.send(from, Message::Yes { txid })?;
        self.role.ongoing = Some(Ongoing { request, precommitted: false });
        Ok(self.into())
    }
}

#[cfg(test)]
mod tests {
    use super::super::super::log::DtLog;
    use super::super::super::message::{Action, FaultPlan};
    use super::super::super::NodeID;
    use super::super::tests::{add_request, assert_messages, peer_refs};
    use super::*;
    use crate::storage::Memory;
    use pretty_assertions::assert_eq;

    /// Sets up an idle participant with id 2 in a 3-node cluster.
    fn setup() -> (RawNode<Participant>, crossbeam::channel::Receiver<Envelope>) {
        let (node_tx, node_rx) = crossbeam::channel::unbounded();
        let node = RawNode {
            id: 2,
            cluster: peer_refs(&[1, 2, 3]),
            store: crate::tpc::state::Store::new(),
            log: DtLog::new(Box::new(Memory::new()), 2),
            up_set: [1, 2, 3].into(),
            next_txid: 1,
            decided: None,
            node_tx,
            role: Participant::new(),
        };
        (node, node_rx)
    }

    fn envelope(from: NodeID, message: Message) -> Envelope {
        Envelope { from: Address::Node(from), to: Address::Node(2), message }
    }

    fn reply(to: NodeID, message: Message) -> Envelope {
        Envelope { from: Address::Node(2), to: Address::Node(to), message }
    }

    #[test]
    fn valid_request_votes_yes_then_commits() -> Result<()> {
        let (node, mut rx) = setup();
        let request = add_request(1, &[1, 2, 3]);

        let node = node.step(envelope(1, Message::VoteRequest(request.clone())))?;
        assert_messages(&mut rx, vec![reply(1, Message::Yes { txid: 1 })]);

        let node = node.step(envelope(1, Message::Precommit { txid: 1 }))?;
        assert_messages(&mut rx, vec![reply(1, Message::Ack { txid: 1 })]);

        let node = node.step(envelope(1, Message::Commit { txid: 1 }))?;
        assert_messages(&mut rx, vec![]);
        assert!(matches!(node, Node::Participant(_)));
        assert_eq!(node.store().get("s"), Some(&"u".to_owned()));

        // The log now replays to a committed transaction.
        let Node::Participant(node) = node else { unreachable!() };
        assert_eq!(
            node.log.replay()?,
            vec![
                Message::VoteRequest(request),
                Message::Yes { txid: 1 },
                Message::Commit { txid: 1 },
            ]
        );
        Ok(())
    }

    #[test]
    fn invalid_request_votes_no() -> Result<()> {
        let (mut node, mut rx) = setup();
        node.store.apply(&Action::Add { name: "s".to_owned(), value: "old".to_owned() })?;

        let request = add_request(1, &[1, 2, 3]);
        let node = node.step(envelope(1, Message::VoteRequest(request.clone())))?;
        assert_messages(&mut rx, vec![reply(1, Message::No { txid: 1 })]);

        // The abort is already logged; the coordinator's broadcast abort is
        // ignored.
        let node = node.step(envelope(1, Message::Abort { txid: 1 }))?;
        let Node::Participant(node) = node else { unreachable!() };
        assert_eq!(node.role.ongoing, None);
        assert_eq!(
            node.log.replay()?,
            vec![Message::VoteRequest(request), Message::Abort { txid: 1 }]
        );
        Ok(())
    }

    #[test]
    fn abort_discards_transaction() -> Result<()> {
        let (node, mut rx) = setup();
        let node = node.step(envelope(1, Message::VoteRequest(add_request(1, &[1, 2, 3]))))?;
        assert_messages(&mut rx, vec![reply(1, Message::Yes { txid: 1 })]);

        let node = node.step(envelope(1, Message::Abort { txid: 1 }))?;
        assert!(node.store().is_empty());
        let Node::Participant(node) = node else { unreachable!() };
        assert_eq!(node.role.ongoing, None);
        assert_eq!(node.decided, Some((1, false)));
        Ok(())
    }

    #[test]
    fn request_while_ongoing_fatal() -> Result<()> {
        let (node, _rx) = setup();
        let node = node.step(envelope(1, Message::VoteRequest(add_request(1, &[1, 2, 3]))))?;
        let result = node.step(envelope(
            1,
            Message::VoteRequest(VoteRequest {
                txid: 2,
                action: Action::Delete { name: "s".to_owned() },
                peers: peer_refs(&[1, 2, 3]),
                fault: FaultPlan::default(),
            }),
        ));
        assert!(matches!(result, Err(Error::Internal(_))));
        Ok(())
    }

    #[test]
    fn precommit_without_transaction_fatal() {
        let (node, _rx) = setup();
        let result = Node::from(node).step(envelope(1, Message::Precommit { txid: 7 }));
        assert!(matches!(result, Err(Error::Internal(_))));
    }

    #[test]
    fn decision_request_reports_state() -> Result<()> {
        let (node, mut rx) = setup();

        // Unknown transaction: the node never voted yes, so abort is safe.
        let node = node.step(envelope(3, Message::DecisionRequest { txid: 9 }))?;
        assert_messages(&mut rx, vec![reply(3, Message::Abort { txid: 9 })]);

        // Voted but not precommitted: uncertain.
        let node = node.step(envelope(1, Message::VoteRequest(add_request(1, &[1, 2, 3]))))?;
        assert_messages(&mut rx, vec![reply(1, Message::Yes { txid: 1 })]);
        let node = node.step(envelope(3, Message::DecisionRequest { txid: 1 }))?;
        assert_messages(&mut rx, vec![reply(3, Message::Uncertain { txid: 1 })]);

        // Precommitted: report precommit.
        let node = node.step(envelope(1, Message::Precommit { txid: 1 }))?;
        assert_messages(&mut rx, vec![reply(1, Message::Ack { txid: 1 })]);
        let node = node.step(envelope(3, Message::DecisionRequest { txid: 1 }))?;
        assert_messages(&mut rx, vec![reply(3, Message::Precommit { txid: 1 })]);

        // Committed: relay the decision.
        let node = node.step(envelope(1, Message::Commit { txid: 1 }))?;
        let node = node.step(envelope(3, Message::DecisionRequest { txid: 1 }))?;
        assert_messages(&mut rx, vec![reply(3, Message::Commit { txid: 1 })]);
        drop(node);
        Ok(())
    }

    #[test]
    fn committed_node_reacks_precommit() -> Result<()> {
        let (node, mut rx) = setup();
        let node = node.step(envelope(1, Message::VoteRequest(add_request(1, &[1, 2, 3]))))?;
        let node = node.step(envelope(1, Message::Precommit { txid: 1 }))?;
        let node = node.step(envelope(1, Message::Commit { txid: 1 }))?;
        while rx.try_recv().is_ok() {}

        // A recovered coordinator re-runs the precommit/commit handoff.
        let node = node.step(envelope(3, Message::Precommit { txid: 1 }))?;
        assert_messages(&mut rx, vec![reply(3, Message::Ack { txid: 1 })]);
        let node = node.step(envelope(3, Message::Commit { txid: 1 }))?;
        assert_eq!(node.store().get("s"), Some(&"u".to_owned()));
        Ok(())
    }

    #[test]
    fn dub_coordinator() -> Result<()> {
        let (node, _rx) = setup();
        let node = node.step(envelope(2, Message::DubCoordinator))?;
        assert!(matches!(node, Node::Coordinator(_)));
        Ok(())
    }
}
