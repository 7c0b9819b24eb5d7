use super::message::Message;
use super::NodeID;
use crate::error::{Error, Result};
use crate::storage::Storage;

use chrono::{SecondsFormat, Utc};

/// The distributed transaction log (DTLog): a durable, append-only record
/// of every protocol-relevant message a node sends or receives for its
/// current (or most recent) transaction. Each physical entry carries the
/// owning node id and a timestamp, followed by the message's kind and
/// tokenized fields:
///
/// ```text
/// [2 2024-03-01T10:12:01.031Z] add  1  s  u  1@host:7001  2@host:7002
/// [2 2024-03-01T10:12:01.034Z] yes  1
/// [2 2024-03-01T10:12:02.110Z] commit  1
/// ```
///
/// Replay parses entries back to messages in order; the node interprets
/// them exactly as the live state machines interpret traffic, which is how
/// a restarted node reconstructs its replicated items and discovers a
/// transaction it crashed in the middle of.
///
/// Entries must be appended before the corresponding reply or broadcast is
/// sent: a node may crash at any point, and a vote that reached a peer but
/// not the log would be forgotten by recovery.
pub struct DtLog {
    /// The underlying line store. A trait object, to allow runtime engine
    /// selection without propagating type parameters through the protocol.
    engine: Box<dyn Storage>,
    /// The owning node.
    node_id: NodeID,
}

impl DtLog {
    pub fn new(engine: Box<dyn Storage>, node_id: NodeID) -> Self {
        Self { engine, node_id }
    }

    /// Appends a message, making it durable before returning.
    pub fn append(&mut self, message: &Message) -> Result<()> {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        self.engine.append(&format!("[{} {}] {}", self.node_id, timestamp, message.encode()))
    }

    /// Replays the full log into its sequence of messages. Malformed lines
    /// are fatal: a node that cannot parse its own log cannot safely
    /// determine its state.
    pub fn replay(&self) -> Result<Vec<Message>> {
        self.engine.read_all()?.iter().map(|line| Self::parse(line)).collect()
    }

    fn parse(line: &str) -> Result<Message> {
        let rest = line
            .strip_prefix('[')
            .and_then(|rest| rest.split_once("] "))
            .map(|(_header, rest)| rest)
            .ok_or_else(|| Error::Internal(format!("malformed log line {line}")))?;
        Message::decode(rest)
    }
}

#[cfg(test)]
mod tests {
    use super::super::message::{Action, FaultPlan, PeerRef, VoteRequest};
    use super::*;
    use crate::storage::Memory;
    use pretty_assertions::assert_eq;

    fn request(txid: u64) -> VoteRequest {
        VoteRequest {
            txid,
            action: Action::Add { name: "s".to_owned(), value: "u".to_owned() },
            peers: vec![PeerRef::new(1, "a"), PeerRef::new(2, "b")],
            fault: FaultPlan::default(),
        }
    }

    #[test]
    fn append_replay() -> Result<()> {
        let mut log = DtLog::new(Box::new(Memory::new()), 2);
        let messages = vec![
            Message::VoteRequest(request(1)),
            Message::Yes { txid: 1 },
            Message::Commit { txid: 1 },
        ];
        for message in &messages {
            log.append(message)?;
        }
        assert_eq!(log.replay()?, messages);
        Ok(())
    }

    #[test]
    fn line_format() -> Result<()> {
        assert_eq!(
            DtLog::parse("[3 2024-03-01T10:12:01.031Z] abort  9")?,
            Message::Abort { txid: 9 }
        );
        Ok(())
    }

    #[test]
    fn malformed_line_fatal() {
        assert!(matches!(DtLog::parse("yes  1"), Err(Error::Internal(_))));
        assert!(matches!(
            DtLog::parse("[1 2024-03-01T10:12:01.031Z] nonsense  1"),
            Err(Error::Internal(_))
        ));
    }
}
