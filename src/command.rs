use crate::error::{Error, Result};
use crate::tpc::{Action, FaultPlan, NodeID};

/// What a submitted command asks the cluster to do.
#[derive(Clone, Debug, PartialEq)]
pub enum CommandKind {
    /// A transaction on the replicated items, driven through 3PC.
    Action(Action),
    /// Terminates the given node's process.
    Kill(NodeID),
}

/// A parsed command line, as submitted to the coordinator. Failure
/// injection flags may trail any command.
#[derive(Clone, Debug, PartialEq)]
pub struct Command {
    pub kind: CommandKind,
    pub fault: FaultPlan,
}

impl Command {
    /// Parses a whitespace-separated command line. An unrecognized leading
    /// command or flag rejects the whole line; it never reaches the
    /// protocol core.
    pub fn parse(line: &str) -> Result<Self> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let (command, rest) = tokens
            .split_first()
            .ok_or_else(|| Error::InvalidInput("empty command".to_owned()))?;
        let arity = match *command {
            "add" => 2,
            "update" => 3,
            "delete" | "kill" => 1,
            command => {
                return Err(Error::InvalidInput(format!("unknown command {command}")))
            }
        };
        if rest.len() < arity {
            return Err(Error::InvalidInput(format!(
                "{command} expects {arity} arguments, got {}",
                rest.len()
            )));
        }
        let kind = match *command {
            "add" => CommandKind::Action(Action::Add {
                name: rest[0].to_owned(),
                value: rest[1].to_owned(),
            }),
            "update" => CommandKind::Action(Action::Update {
                name: rest[0].to_owned(),
                new_name: rest[1].to_owned(),
                value: rest[2].to_owned(),
            }),
            "delete" => CommandKind::Action(Action::Delete { name: rest[0].to_owned() }),
            _ => CommandKind::Kill(
                rest[0]
                    .parse()
                    .map_err(|_| Error::InvalidInput(format!("invalid node id {}", rest[0])))?,
            ),
        };
        let fault = FaultPlan::decode(&rest[arity..])?;
        Ok(Self { kind, fault })
    }
}
