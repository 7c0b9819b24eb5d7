use super::{NodeID, TransactionID};
use crate::error::{Error, Result};

use itertools::Itertools as _;
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The sentinel transaction ID for connection-management and control
/// messages that belong to no transaction.
pub const NO_TRANSACTION: TransactionID = 0;

/// The token separator used on the wire and in log lines.
const SEPARATOR: &str = "  ";

/// A message address.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Address {
    /// The local command submitter (transaction manager / CLI).
    Client,
    /// A node with the given ID.
    Node(NodeID),
}

/// A message envelope, routing a message between addresses. Only the
/// message itself crosses the wire; the sender is established by the
/// connection handshake, and the envelope is reconstructed on receipt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The sender.
    pub from: Address,
    /// The recipient.
    pub to: Address,
    /// The message payload.
    pub message: Message,
}

/// The action a vote request asks the cluster to apply to the replicated
/// collection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// Adds a named item. Invalid if the name already exists.
    Add { name: String, value: String },
    /// Renames an item and replaces its value. Invalid if `name` is absent.
    Update { name: String, new_name: String, value: String },
    /// Removes a named item. Invalid if the name is absent.
    Delete { name: String },
}

impl Action {
    /// The wire kind token for this action.
    fn kind(&self) -> &'static str {
        match self {
            Action::Add { .. } => "add",
            Action::Update { .. } => "update",
            Action::Delete { .. } => "delete",
        }
    }

    fn field_tokens(&self) -> Vec<String> {
        match self {
            Action::Add { name, value } => vec![name.clone(), value.clone()],
            Action::Update { name, new_name, value } => {
                vec![name.clone(), new_name.clone(), value.clone()]
            }
            Action::Delete { name } => vec![name.clone()],
        }
    }
}

/// A peer reference: a node ID plus its listening address. The channel to
/// the peer is resolved lazily by the transport. Equality is by (id, addr).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerRef {
    pub id: NodeID,
    pub addr: String,
}

impl PeerRef {
    pub fn new(id: NodeID, addr: impl Into<String>) -> Self {
        Self { id, addr: addr.into() }
    }

    /// Parses a peer token of the form `<id>@<addr>`.
    fn parse(token: &str) -> Result<Self> {
        let (id, addr) = token
            .split_once('@')
            .ok_or_else(|| Error::Internal(format!("invalid peer token {token}")))?;
        Ok(Self { id: parse_node_id(id)?, addr: addr.to_owned() })
    }

    fn encode(&self) -> String {
        format!("{}@{}", self.id, self.addr)
    }
}

/// A failure-injection plan, carried on vote requests so that every node
/// sees it. Consumed by the server-side fault injector; the role state
/// machines never act on it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultPlan {
    /// The coordinator dies mid-commit-broadcast: only peers with ids up to
    /// and including this one receive the commit.
    pub partial_commit: Option<NodeID>,
    /// As above, for the precommit broadcast.
    pub partial_precommit: Option<NodeID>,
    /// The targeted peer dies after receiving this many further messages.
    pub death_after: Option<(u64, NodeID)>,
    /// Sets the shared artificial network delay, in seconds.
    pub delay: Option<u64>,
}

impl FaultPlan {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Parses trailing `-`-prefixed flag tokens, as they appear both on the
    /// command line and at the tail of an encoded vote request. An
    /// unrecognized flag rejects the whole input.
    pub(crate) fn decode(tokens: &[&str]) -> Result<Self> {
        let mut plan = Self::default();
        let mut iter = tokens.iter();
        // Manual loop rather than chunking: -deathAfter takes two arguments.
        loop {
            let Some(flag) = iter.next().copied() else { break };
            match flag {
                "-partialCommit" => {
                    plan.partial_commit = Some(parse_node_id(flag_arg(&mut iter, flag)?)?);
                }
                "-partialPrecommit" => {
                    plan.partial_precommit = Some(parse_node_id(flag_arg(&mut iter, flag)?)?);
                }
                "-deathAfter" => {
                    let count = parse_u64(flag_arg(&mut iter, flag)?)?;
                    let peer = parse_node_id(flag_arg(&mut iter, flag)?)?;
                    plan.death_after = Some((count, peer));
                }
                "-delay" => {
                    plan.delay = Some(parse_u64(flag_arg(&mut iter, flag)?)?);
                }
                flag => return Err(Error::InvalidInput(format!("unrecognized flag {flag}"))),
            }
        }
        Ok(plan)
    }

    fn encode_tokens(&self, tokens: &mut Vec<String>) {
        if let Some(id) = self.partial_commit {
            tokens.extend(["-partialCommit".to_owned(), id.to_string()]);
        }
        if let Some(id) = self.partial_precommit {
            tokens.extend(["-partialPrecommit".to_owned(), id.to_string()]);
        }
        if let Some((count, id)) = self.death_after {
            tokens.extend(["-deathAfter".to_owned(), count.to_string(), id.to_string()]);
        }
        if let Some(seconds) = self.delay {
            tokens.extend(["-delay".to_owned(), seconds.to_string()]);
        }
    }
}

/// A vote request: the action to apply on commit, the transaction it
/// belongs to, and the ordered set of peers participating in it. Immutable
/// once created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    /// The transaction ID. 0 on submission; the coordinator assigns the
    /// real ID before broadcasting.
    pub txid: TransactionID,
    /// The action to vote on.
    pub action: Action,
    /// All nodes participating in the transaction, coordinator included.
    pub peers: Vec<PeerRef>,
    /// Failure-injection flags riding on the request.
    pub fault: FaultPlan,
}

impl VoteRequest {
    /// The ids of all peers in the request's peer set.
    pub fn peer_ids(&self) -> BTreeSet<NodeID> {
        self.peers.iter().map(|p| p.id).collect()
    }

    /// The ids of the request's peers excluding the given node, in
    /// ascending order. All nodes derive the same order, which the
    /// termination protocol's peer walk depends on.
    pub fn participant_ids(&self, exclude: NodeID) -> Vec<NodeID> {
        self.peers.iter().map(|p| p.id).filter(|id| *id != exclude).sorted().dedup().collect()
    }

    fn decode_tokens(kind: &str, rest: &[&str]) -> Result<Self> {
        let (txid, rest) = rest
            .split_first()
            .ok_or_else(|| Error::Internal(format!("{kind} expects a transaction id")))?;
        let txid = parse_u64(txid)?;
        let arity = match kind {
            "add" => 2,
            "update" => 3,
            "delete" => 1,
            kind => return Err(Error::Internal(format!("unknown vote request kind {kind}"))),
        };
        if rest.len() < arity {
            return Err(Error::Internal(format!(
                "{kind} expects {arity} fields, got {}",
                rest.len()
            )));
        }
        let action = match kind {
            "add" => Action::Add { name: rest[0].to_owned(), value: rest[1].to_owned() },
            "update" => Action::Update {
                name: rest[0].to_owned(),
                new_name: rest[1].to_owned(),
                value: rest[2].to_owned(),
            },
            _ => Action::Delete { name: rest[0].to_owned() },
        };
        let mut peers = Vec::new();
        let mut i = arity;
        while i < rest.len() && !rest[i].starts_with('-') {
            peers.push(PeerRef::parse(rest[i])?);
            i += 1;
        }
        let fault = FaultPlan::decode(&rest[i..])?;
        Ok(Self { txid, action, peers, fault })
    }

    fn encode_tokens(&self) -> Vec<String> {
        let mut tokens = vec![self.action.kind().to_owned(), self.txid.to_string()];
        tokens.extend(self.action.field_tokens());
        tokens.extend(self.peers.iter().map(|p| p.encode()));
        self.fault.encode_tokens(&mut tokens);
        tokens
    }
}

/// A message passed between nodes (or between a node and its submitter).
/// The set of kinds is closed: decoding dispatches purely on the leading
/// kind token, never on any local type information.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// A request to vote on an add/update/delete action.
    VoteRequest(VoteRequest),
    /// A yes vote.
    Yes { txid: TransactionID },
    /// A no vote.
    No { txid: TransactionID },
    /// Phase two: all peers voted yes. Also used by a polled participant to
    /// report that it had precommitted.
    Precommit { txid: TransactionID },
    /// Phase three: the decision to commit.
    Commit { txid: TransactionID },
    /// The decision to abort.
    Abort { txid: TransactionID },
    /// Acknowledges a precommit.
    Ack { txid: TransactionID },
    /// A recovering node asking a peer for the transaction's outcome.
    DecisionRequest { txid: TransactionID },
    /// A recovering node's answer to a decision request, reporting its own
    /// last-known up-set.
    InRecovery { txid: TransactionID, up_set: Vec<NodeID> },
    /// "I voted yes but never saw a precommit or a decision."
    Uncertain { txid: TransactionID },
    /// A newly elected coordinator polling for precommit state.
    StateRequest { txid: TransactionID },
    /// Designates the recipient as the new coordinator for the transaction,
    /// with the given up-set.
    Elected { txid: TransactionID, up_set: Vec<NodeID> },
    /// A synthetic timeout for the given peer, injected by the local timer
    /// into the ordinary dispatch path.
    Timeout { peer: NodeID },
    /// Connection handshake: identifies the sending node.
    Node { id: NodeID },
    /// Control: designates the recipient as the initial coordinator.
    DubCoordinator,
    /// Control: instructs the recipient process to terminate.
    Kill,
    /// Control: adjusts the shared artificial network delay, in seconds.
    Delay { seconds: u64 },
}

impl Message {
    /// The transaction this message belongs to, or `NO_TRANSACTION` for
    /// connection-management and control messages.
    pub fn txid(&self) -> TransactionID {
        match self {
            Message::VoteRequest(request) => request.txid,
            Message::Yes { txid }
            | Message::No { txid }
            | Message::Precommit { txid }
            | Message::Commit { txid }
            | Message::Abort { txid }
            | Message::Ack { txid }
            | Message::DecisionRequest { txid }
            | Message::InRecovery { txid, .. }
            | Message::Uncertain { txid }
            | Message::StateRequest { txid }
            | Message::Elected { txid, .. } => *txid,
            Message::Timeout { .. }
            | Message::Node { .. }
            | Message::DubCoordinator
            | Message::Kill
            | Message::Delay { .. } => NO_TRANSACTION,
        }
    }

    /// Encodes the message as a flat token list: the kind name followed by
    /// its fields, joined by the two-space separator.
    pub fn encode(&self) -> String {
        let tokens: Vec<String> = match self {
            Message::VoteRequest(request) => request.encode_tokens(),
            Message::Yes { txid } => vec!["yes".to_owned(), txid.to_string()],
            Message::No { txid } => vec!["no".to_owned(), txid.to_string()],
            Message::Precommit { txid } => vec!["precommit".to_owned(), txid.to_string()],
            Message::Commit { txid } => vec!["commit".to_owned(), txid.to_string()],
            Message::Abort { txid } => vec!["abort".to_owned(), txid.to_string()],
            Message::Ack { txid } => vec!["ack".to_owned(), txid.to_string()],
            Message::DecisionRequest { txid } => vec!["decisionreq".to_owned(), txid.to_string()],
            Message::InRecovery { txid, up_set } => ["inrecovery".to_owned(), txid.to_string()]
                .into_iter()
                .chain(up_set.iter().map(|id| id.to_string()))
                .collect(),
            Message::Uncertain { txid } => vec!["uncertain".to_owned(), txid.to_string()],
            Message::StateRequest { txid } => vec!["staterequest".to_owned(), txid.to_string()],
            Message::Elected { txid, up_set } => ["elected".to_owned(), txid.to_string()]
                .into_iter()
                .chain(up_set.iter().map(|id| id.to_string()))
                .collect(),
            Message::Timeout { peer } => vec!["timeout".to_owned(), peer.to_string()],
            Message::Node { id } => vec!["node".to_owned(), id.to_string()],
            Message::DubCoordinator => vec!["dubcoordinator".to_owned()],
            Message::Kill => vec!["kill".to_owned()],
            Message::Delay { seconds } => vec!["delay".to_owned(), seconds.to_string()],
        };
        tokens.join(SEPARATOR)
    }

    /// Decodes a message from its token list. An unrecognized kind or a
    /// token count mismatch is a fatal local error: the wire stream only
    /// discloses which bytes arrived, so there is nothing to fall back on.
    pub fn decode(line: &str) -> Result<Self> {
        let tokens: Vec<&str> = line.split(SEPARATOR).collect();
        let (kind, rest) = tokens
            .split_first()
            .ok_or_else(|| Error::Internal("empty message line".to_owned()))?;
        match *kind {
            "add" | "update" | "delete" => {
                Ok(Message::VoteRequest(VoteRequest::decode_tokens(kind, rest)?))
            }
            "yes" => Ok(Message::Yes { txid: single_u64(kind, rest)? }),
            "no" => Ok(Message::No { txid: single_u64(kind, rest)? }),
            "precommit" => Ok(Message::Precommit { txid: single_u64(kind, rest)? }),
            "commit" => Ok(Message::Commit { txid: single_u64(kind, rest)? }),
            "abort" => Ok(Message::Abort { txid: single_u64(kind, rest)? }),
            "ack" => Ok(Message::Ack { txid: single_u64(kind, rest)? }),
            "decisionreq" => Ok(Message::DecisionRequest { txid: single_u64(kind, rest)? }),
            "inrecovery" => {
                let (txid, up_set) = leading_u64(kind, rest)?;
                Ok(Message::InRecovery { txid, up_set })
            }
            "uncertain" => Ok(Message::Uncertain { txid: single_u64(kind, rest)? }),
            "staterequest" => Ok(Message::StateRequest { txid: single_u64(kind, rest)? }),
            "elected" => {
                let (txid, up_set) = leading_u64(kind, rest)?;
                Ok(Message::Elected { txid, up_set })
            }
            "timeout" => Ok(Message::Timeout { peer: single_node_id(kind, rest)? }),
            "node" => Ok(Message::Node { id: single_node_id(kind, rest)? }),
            "dubcoordinator" => empty(kind, rest).map(|_| Message::DubCoordinator),
            "kill" => empty(kind, rest).map(|_| Message::Kill),
            "delay" => Ok(Message::Delay { seconds: single_u64(kind, rest)? }),
            kind => Err(Error::Internal(format!("unknown message kind {kind}"))),
        }
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.encode())
    }
}

fn parse_u64(token: &str) -> Result<u64> {
    token.parse().map_err(|_| Error::Internal(format!("invalid numeric token {token}")))
}

fn parse_node_id(token: &str) -> Result<NodeID> {
    token.parse().map_err(|_| Error::Internal(format!("invalid node id {token}")))
}

/// Takes the next token as the argument of the given fault flag.
fn flag_arg<'a>(iter: &mut std::slice::Iter<'a, &'a str>, flag: &str) -> Result<&'a str> {
    iter.next()
        .copied()
        .ok_or_else(|| Error::InvalidInput(format!("missing argument for {flag}")))
}

/// Parses the sole numeric token of a kind.
fn single_u64(kind: &str, rest: &[&str]) -> Result<u64> {
    match rest {
        [token] => parse_u64(token),
        rest => Err(Error::Internal(format!("{kind} expects 1 token, got {}", rest.len()))),
    }
}

/// Parses the sole token of a kind carrying only a node id.
fn single_node_id(kind: &str, rest: &[&str]) -> Result<NodeID> {
    match rest {
        [token] => parse_node_id(token),
        rest => Err(Error::Internal(format!("{kind} expects 1 token, got {}", rest.len()))),
    }
}

/// Parses a leading transaction id followed by a list of node ids.
fn leading_u64(kind: &str, rest: &[&str]) -> Result<(u64, Vec<NodeID>)> {
    let (txid, ids) = rest
        .split_first()
        .ok_or_else(|| Error::Internal(format!("{kind} expects a transaction id")))?;
    let ids = ids.iter().map(|id| parse_node_id(id)).collect::<Result<Vec<_>>>()?;
    Ok((parse_u64(txid)?, ids))
}

fn empty(kind: &str, rest: &[&str]) -> Result<()> {
    if !rest.is_empty() {
        return Err(Error::Internal(format!("{kind} expects no tokens, got {}", rest.len())));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn peers() -> Vec<PeerRef> {
        vec![
            PeerRef::new(1, "127.0.0.1:7001"),
            PeerRef::new(2, "127.0.0.1:7002"),
            PeerRef::new(3, "127.0.0.1:7003"),
        ]
    }

    #[test]
    fn encode_vote_request() {
        let message = Message::VoteRequest(VoteRequest {
            txid: 7,
            action: Action::Add { name: "s".to_owned(), value: "u".to_owned() },
            peers: peers(),
            fault: FaultPlan::default(),
        });
        assert_eq!(
            message.encode(),
            "add  7  s  u  1@127.0.0.1:7001  2@127.0.0.1:7002  3@127.0.0.1:7003"
        );
        assert_eq!(Message::decode(&message.encode()).unwrap(), message);
    }

    #[test]
    fn decode_update_with_flags() {
        let line = "update  3  s  t  v2  1@a  2@b  -deathAfter  5  2  -delay  1";
        let message = Message::decode(line).unwrap();
        assert_eq!(
            message,
            Message::VoteRequest(VoteRequest {
                txid: 3,
                action: Action::Update {
                    name: "s".to_owned(),
                    new_name: "t".to_owned(),
                    value: "v2".to_owned(),
                },
                peers: vec![PeerRef::new(1, "a"), PeerRef::new(2, "b")],
                fault: FaultPlan {
                    death_after: Some((5, 2)),
                    delay: Some(1),
                    ..FaultPlan::default()
                },
            })
        );
        assert_eq!(message.encode(), line);
    }

    #[test]
    fn decode_txid_kinds() {
        assert_eq!(Message::decode("yes  4").unwrap(), Message::Yes { txid: 4 });
        assert_eq!(Message::decode("precommit  4").unwrap(), Message::Precommit { txid: 4 });
        assert_eq!(Message::decode("decisionreq  9").unwrap(), Message::DecisionRequest { txid: 9 });
        assert_eq!(
            Message::decode("inrecovery  9  1  2  3").unwrap(),
            Message::InRecovery { txid: 9, up_set: vec![1, 2, 3] }
        );
        assert_eq!(
            Message::decode("elected  9  2  3").unwrap(),
            Message::Elected { txid: 9, up_set: vec![2, 3] }
        );
        assert_eq!(Message::decode("node  2").unwrap(), Message::Node { id: 2 });
        assert_eq!(Message::decode("kill").unwrap(), Message::Kill);
        assert_eq!(Message::decode("delay  3").unwrap(), Message::Delay { seconds: 3 });
    }

    #[test]
    fn decode_out_of_range_node_id() {
        // Node ids are u8; anything larger must fail, not wrap.
        assert!(matches!(Message::decode("node  300"), Err(Error::Internal(_))));
        assert!(matches!(Message::decode("timeout  300"), Err(Error::Internal(_))));
    }

    #[test]
    fn decode_unknown_kind() {
        assert!(matches!(Message::decode("gossip  1"), Err(Error::Internal(_))));
    }

    #[test]
    fn decode_token_count_mismatch() {
        assert!(matches!(Message::decode("yes"), Err(Error::Internal(_))));
        assert!(matches!(Message::decode("yes  1  2"), Err(Error::Internal(_))));
        assert!(matches!(Message::decode("kill  1"), Err(Error::Internal(_))));
        assert!(matches!(Message::decode("add  1  s"), Err(Error::Internal(_))));
    }

    #[test]
    fn control_messages_have_no_transaction() {
        assert_eq!(Message::Kill.txid(), NO_TRANSACTION);
        assert_eq!(Message::Node { id: 3 }.txid(), NO_TRANSACTION);
        assert_eq!(Message::Timeout { peer: 3 }.txid(), NO_TRANSACTION);
        assert_eq!(Message::Delay { seconds: 2 }.txid(), NO_TRANSACTION);
    }

    #[test]
    fn participant_ids_sorted_excluding_self() {
        let request = VoteRequest {
            txid: 1,
            action: Action::Delete { name: "s".to_owned() },
            peers: vec![PeerRef::new(3, "c"), PeerRef::new(1, "a"), PeerRef::new(2, "b")],
            fault: FaultPlan::default(),
        };
        assert_eq!(request.participant_ids(2), vec![1, 3]);
        assert_eq!(request.participant_ids(9), vec![1, 2, 3]);
    }

    #[test]
    fn unrecognized_flag_rejected() {
        assert!(matches!(
            Message::decode("add  1  s  u  1@a  -explode  2"),
            Err(Error::InvalidInput(_))
        ));
    }
}
