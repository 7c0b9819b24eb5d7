//! Implements the three-phase commit (3PC) protocol for a small replicated,
//! ordered collection of named items.
//!
//! A cluster of fail-stop nodes connected by reliable, order-preserving
//! channels replicates a set of named items. One node acts as coordinator:
//! it receives vote requests (add/update/delete) from a transaction
//! submitter and drives each transaction through three phases:
//!
//! * Vote: the request is broadcast to all peers, which check it against
//!   their local copy of the collection and vote yes or no. Every vote is
//!   appended to the node's durable transaction log before it is sent.
//!
//! * Precommit: once every peer has voted yes, the coordinator broadcasts
//!   a precommit and collects acknowledgements. This phase is what
//!   distinguishes 3PC from 2PC: after precommit has been broadcast the
//!   coordinator never aborts, because every participant that received the
//!   precommit is guaranteed to eventually reach commit via recovery. A
//!   single no vote or timeout during the vote phase, by contrast, aborts
//!   the transaction immediately.
//!
//! * Commit: the coordinator broadcasts the commit, and every node applies
//!   the action to its replicated collection, exactly once, after logging
//!   the decision.
//!
//! Nodes can be in one of four roles, modeled as `Node::Participant`,
//! `Node::Coordinator`, `Node::RecoveringParticipant` and
//! `Node::RecoveringCoordinator`.
//!
//! * Participant: votes on requests and applies decided actions.
//! * Coordinator: collects votes and drives the precommit/commit handoff.
//! * RecoveringParticipant: a restarted node whose log replay found a
//!   transaction with no logged decision. It polls peers for the outcome in
//!   a deterministic ascending-id order, tracking which processes have
//!   recovered and intersecting their reported up-sets. When the
//!   intersection certifies that every process that might know more is
//!   accounted for, the node elects itself coordinator.
//! * RecoveringCoordinator: runs the termination protocol: it polls the
//!   surviving up-set for precommit state and drives a commit if anyone
//!   precommitted, or a safe abort if everyone is uncertain.
//!
//! Every protocol-relevant message a node sends or receives for its current
//! transaction is appended to its DTLog before any externally observable
//! reply, so that replaying the log on restart reconstructs the node's
//! exact decision state. Timeouts are tick-driven: the server advances
//! logical time at a fixed interval, and an expired timer injects a
//! synthetic `Message::Timeout` through the same dispatch path as real
//! messages.
//!
//! The protocol assumes fail-stop (non-Byzantine) processes and makes no
//! attempt at authentication, sharding, or dynamic membership.

pub mod log;
pub mod message;
pub mod node;
pub mod state;

pub use log::DtLog;
pub use message::{
    Action, Address, Envelope, FaultPlan, Message, PeerRef, VoteRequest, NO_TRANSACTION,
};
pub use node::{Node, RecoveryState};
pub use state::Store;

/// A node ID. Nodes are numbered contiguously from 1.
pub type NodeID = u8;

/// A transaction ID. 0 is the sentinel for "no transaction".
pub type TransactionID = u64;

/// A logical clock interval as number of ticks.
pub type Ticks = u8;

/// The interval between ticks, the unit of time for timeouts and backoff.
pub const TICK_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

/// Ticks the coordinator waits for each peer's vote.
const VOTE_TIMEOUT: Ticks = 10;

/// Ticks the coordinator waits for each peer's precommit acknowledgement.
/// Expiry counts as an implicit acknowledgement, never as an abort.
const ACK_TIMEOUT: Ticks = 10;

/// Ticks a recovering node waits for a peer's answer to a decision or
/// state query before moving on to the next peer.
const DECISION_TIMEOUT: Ticks = 10;

/// Ticks a recovering node waits before rewinding its peer walk back to
/// the first peer. Gives a slow-to-restart peer time to come up between
/// walk attempts.
const REWIND_BACKOFF: Ticks = 30;
