use crate::command::{Command, CommandKind};
use crate::error::{Error, Result};
use crate::tpc::{
    Address, DtLog, Envelope, FaultPlan, Message, Node, NodeID, PeerRef, TransactionID,
    VoteRequest, NO_TRANSACTION, TICK_INTERVAL,
};

use itertools::Itertools as _;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub type ClientSender =
    crossbeam::channel::Sender<(Command, crossbeam::channel::Sender<Result<Response>>)>;
pub type ClientReceiver =
    crossbeam::channel::Receiver<(Command, crossbeam::channel::Sender<Result<Response>>)>;

/// The outcome of a submitted command, as reported to the client.
#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    /// The transaction committed.
    Commit(TransactionID),
    /// The transaction aborted.
    Abort(TransactionID),
    /// The kill was dispatched to the target node.
    Killed(NodeID),
}

impl Response {
    /// Encodes a command outcome as a single response line, errors
    /// included.
    pub fn encode(result: &Result<Response>) -> String {
        match result {
            Ok(Response::Commit(txid)) => format!("commit  {txid}"),
            Ok(Response::Abort(txid)) => format!("abort  {txid}"),
            Ok(Response::Killed(id)) => format!("killed  {id}"),
            Err(err) => format!("error  {err}"),
        }
    }

    /// Decodes a response line.
    pub fn decode(line: &str) -> Result<Response> {
        match line.split_once("  ") {
            Some(("commit", txid)) => Ok(Response::Commit(txid.parse()?)),
            Some(("abort", txid)) => Ok(Response::Abort(txid.parse()?)),
            Some(("killed", id)) => Ok(Response::Killed(id.parse()?)),
            Some(("error", message)) => Err(Error::InvalidInput(message.to_owned())),
            _ => Err(Error::Internal(format!("malformed response line {line}"))),
        }
    }
}

/// Injects the failures a vote request's trailing flags ask for. The
/// protocol state machines never see these; the server consumes the plan
/// as messages pass through it.
struct FaultInjector {
    id: NodeID,
    /// Inbound messages remaining until this process exits.
    death_after: Option<u64>,
    /// Die mid-commit-broadcast after the send to this peer id.
    partial_commit: Option<NodeID>,
    /// As above, for the precommit broadcast.
    partial_precommit: Option<NodeID>,
    delay: Arc<AtomicU64>,
}

impl FaultInjector {
    fn new(id: NodeID, delay: Arc<AtomicU64>) -> Self {
        Self { id, death_after: None, partial_commit: None, partial_precommit: None, delay }
    }

    /// Arms the injector from a vote request's fault plan. Every node sees
    /// the plan, since it rides on the broadcast request.
    fn arm(&mut self, plan: &FaultPlan) {
        if plan.is_empty() {
            return;
        }
        warn!("Arming fault injection: {plan:?}");
        if let Some((count, peer)) = plan.death_after {
            if peer == self.id {
                self.death_after = Some(count);
            }
        }
        if let Some(seconds) = plan.delay {
            self.delay.store(seconds, Ordering::Relaxed);
        }
        self.partial_commit = plan.partial_commit;
        self.partial_precommit = plan.partial_precommit;
    }

    /// Counts down an inbound protocol message, exiting the process when
    /// the armed countdown is spent.
    fn on_receive(&mut self) {
        let Some(count) = &mut self.death_after else { return };
        *count = count.saturating_sub(1);
        if *count == 0 {
            warn!("Injected death: inbound message countdown spent");
            std::process::exit(1);
        }
    }

    /// Inspects an outbound message. A partial-broadcast fault kills the
    /// process at the first recipient beyond the armed peer id; since
    /// broadcasts go out in ascending id order, exactly the peers up to
    /// and including it receive the message.
    fn on_send(&self, msg: &Envelope) {
        let Address::Node(to) = msg.to else { return };
        let limit = match msg.message {
            Message::Commit { .. } => self.partial_commit,
            Message::Precommit { .. } => self.partial_precommit,
            _ => return,
        };
        if let Some(limit) = limit {
            if to > limit {
                warn!("Injected death: partial broadcast cut off before {to}");
                std::process::exit(1);
            }
        }
    }
}

/// A trikv server: one cluster node plus its TCP transport. Peers and
/// clients connect to the same listener; peers identify themselves with a
/// `node` handshake line, anything else is treated as a client submitting
/// command lines.
pub struct Server {
    node: Node,
    /// Peer listen addresses, excluding the local node.
    peers: HashMap<NodeID, String>,
    node_rx: crossbeam::channel::Receiver<Envelope>,
    /// The shared artificial network delay, in seconds.
    delay: Arc<AtomicU64>,
    faults: FaultInjector,
}

impl Server {
    /// Creates a new cluster node. `peers` is the full cluster membership,
    /// the local node included. The designated initial coordinator is
    /// dubbed before the server starts serving.
    pub fn new(
        id: NodeID,
        peers: HashMap<NodeID, String>,
        log: DtLog,
        coordinator: bool,
    ) -> Result<Self> {
        let (node_tx, node_rx) = crossbeam::channel::unbounded();
        let cluster =
            peers.iter().map(|(id, addr)| PeerRef::new(*id, addr.clone())).collect_vec();
        let mut node = Node::new(id, cluster, log, node_tx)?;
        if coordinator {
            node = node.step(Envelope {
                from: Address::Node(id),
                to: Address::Node(id),
                message: Message::DubCoordinator,
            })?;
        }
        let peers = peers.into_iter().filter(|(peer, _)| *peer != id).collect();
        let delay = Arc::new(AtomicU64::new(0));
        let faults = FaultInjector::new(id, delay.clone());
        Ok(Self { node, peers, node_rx, delay, faults })
    }

    /// Connects to peers and serves inbound connections until killed.
    pub fn serve(self, listener: std::net::TcpListener) -> Result<()> {
        let id = self.node.id();
        info!(
            "Node {id} listening on {} ({} peers)",
            listener.local_addr()?,
            self.peers.len()
        );
        std::thread::scope(|s| {
            let (tcp_in_tx, tcp_in_rx) = crossbeam::channel::unbounded::<Envelope>();
            let (tcp_out_tx, tcp_out_rx) = crossbeam::channel::unbounded::<Envelope>();
            let (client_tx, client_rx) = crossbeam::channel::unbounded();

            let delay = self.delay.clone();
            s.spawn(move || Self::tcp_receive(listener, id, tcp_in_tx, client_tx));
            s.spawn(move || Self::tcp_send(self.peers, id, delay, tcp_out_rx));
            s.spawn(move || {
                Self::eventloop(
                    self.node,
                    self.node_rx,
                    client_rx,
                    tcp_in_rx,
                    tcp_out_tx,
                    self.faults,
                    self.delay,
                )
                .expect("event processing failed")
            });
            Ok(())
        })
    }

    /// Runs the event loop, serializing all inputs into a single logical
    /// stream for the node state machine.
    fn eventloop(
        mut node: Node,
        node_rx: crossbeam::channel::Receiver<Envelope>,
        client_rx: ClientReceiver,
        tcp_rx: crossbeam::channel::Receiver<Envelope>,
        tcp_tx: crossbeam::channel::Sender<Envelope>,
        mut faults: FaultInjector,
        delay: Arc<AtomicU64>,
    ) -> Result<()> {
        let ticker = crossbeam::channel::tick(TICK_INTERVAL);
        // The submitter whose transaction is in flight, if any.
        let mut pending_client: Option<crossbeam::channel::Sender<Result<Response>>> = None;
        loop {
            crossbeam::select! {
                recv(ticker) -> _ => node = node.tick()?,

                recv(tcp_rx) -> msg => {
                    let msg = msg?;
                    faults.on_receive();
                    match &msg.message {
                        Message::Kill => {
                            info!("Killed by {:?}", msg.from);
                            std::process::exit(0);
                        }
                        Message::Delay { seconds } => {
                            info!("Artificial network delay set to {seconds}s");
                            delay.store(*seconds, Ordering::Relaxed);
                        }
                        message => {
                            if let Message::VoteRequest(request) = message {
                                faults.arm(&request.fault);
                            }
                            node = node.step(msg)?;
                        }
                    }
                }

                recv(node_rx) -> msg => {
                    let msg = msg?;
                    match msg.to {
                        Address::Node(_) => {
                            faults.on_send(&msg);
                            tcp_tx.send(msg)?;
                        }
                        Address::Client => {
                            let response = match msg.message {
                                Message::Commit { txid } => Ok(Response::Commit(txid)),
                                Message::Abort { txid } => Ok(Response::Abort(txid)),
                                message => Err(Error::Internal(
                                    format!("unexpected client response {message}"),
                                )),
                            };
                            match pending_client.take() {
                                // A dropped client just misses its response.
                                Some(tx) => _ = tx.send(response),
                                None => error!("Client response with no pending client"),
                            }
                        }
                    }
                }

                recv(client_rx) -> r => {
                    let (command, response_tx) = r?;
                    match command.kind {
                        CommandKind::Kill(target) if target == node.id() => {
                            info!("Killed by client command");
                            std::process::exit(0);
                        }
                        CommandKind::Kill(target) => {
                            tcp_tx.send(Envelope {
                                from: Address::Node(node.id()),
                                to: Address::Node(target),
                                message: Message::Kill,
                            })?;
                            _ = response_tx.send(Ok(Response::Killed(target)));
                        }
                        CommandKind::Action(_) if !node.is_coordinator() => {
                            _ = response_tx.send(Err(Error::InvalidInput(
                                "this node is not the coordinator".to_owned(),
                            )));
                        }
                        CommandKind::Action(_) if pending_client.is_some() => {
                            _ = response_tx.send(Err(Error::Abort));
                        }
                        CommandKind::Action(action) => {
                            faults.arm(&command.fault);
                            let request = VoteRequest {
                                txid: NO_TRANSACTION,
                                action,
                                peers: vec![],
                                fault: command.fault,
                            };
                            let to = Address::Node(node.id());
                            node = node.step(Envelope {
                                from: Address::Client,
                                to,
                                message: Message::VoteRequest(request),
                            })?;
                            pending_client = Some(response_tx);
                        }
                    }
                }
            }
        }
    }

    /// Accepts inbound connections, spawning a session thread per
    /// connection.
    fn tcp_receive(
        listener: std::net::TcpListener,
        id: NodeID,
        in_tx: crossbeam::channel::Sender<Envelope>,
        client_tx: ClientSender,
    ) {
        std::thread::scope(|s| loop {
            let (socket, peer) = match listener.accept() {
                Ok(r) => r,
                Err(err) => {
                    error!("Connection failed: {err}");
                    continue;
                }
            };
            let in_tx = in_tx.clone();
            let client_tx = client_tx.clone();
            s.spawn(move || match Self::tcp_session(socket, id, in_tx, client_tx) {
                Ok(()) => debug!("Connection from {peer} closed"),
                Err(err) => error!("Connection from {peer} failed: {err}"),
            });
        });
    }

    /// Serves one inbound connection. The first line decides whether this
    /// is a peer (a `node` handshake) or a client (a command line).
    fn tcp_session(
        socket: std::net::TcpStream,
        id: NodeID,
        in_tx: crossbeam::channel::Sender<Envelope>,
        client_tx: ClientSender,
    ) -> Result<()> {
        let mut writer = socket.try_clone()?;
        let mut reader = BufReader::new(socket);
        let mut first = String::new();
        if reader.read_line(&mut first)? == 0 {
            return Ok(());
        }
        let first = first.trim_end();

        if let Ok(Message::Node { id: peer }) = Message::decode(first) {
            debug!("Peer {peer} connected");
            for line in reader.lines() {
                let message = Message::decode(&line?)?;
                in_tx.send(Envelope {
                    from: Address::Node(peer),
                    to: Address::Node(id),
                    message,
                })?;
            }
            return Ok(());
        }

        // A client session: submit each command line and write back the
        // outcome.
        let mut submit = |line: &str| -> Result<Response> {
            let command = Command::parse(line)?;
            let (response_tx, response_rx) = crossbeam::channel::bounded(1);
            client_tx.send((command, response_tx))?;
            response_rx.recv()?
        };
        writer.write_all(format!("{}\n", Response::encode(&submit(first))).as_bytes())?;
        for line in reader.lines() {
            let result = submit(&line?);
            writer.write_all(format!("{}\n", Response::encode(&result)).as_bytes())?;
        }
        Ok(())
    }

    /// Routes outbound messages to per-peer sender threads.
    fn tcp_send(
        peers: HashMap<NodeID, String>,
        id: NodeID,
        delay: Arc<AtomicU64>,
        out_rx: crossbeam::channel::Receiver<Envelope>,
    ) {
        std::thread::scope(move |s| {
            let mut peer_txs: HashMap<NodeID, crossbeam::channel::Sender<Message>> =
                HashMap::new();
            for (peer, addr) in peers.into_iter() {
                let (tx, rx) = crossbeam::channel::bounded::<Message>(1000);
                peer_txs.insert(peer, tx);
                let delay = delay.clone();
                s.spawn(move || Self::tcp_send_peer(addr, id, delay, rx));
            }

            while let Ok(msg) = out_rx.recv() {
                let Address::Node(to) = msg.to else {
                    error!("Outbound message for non-peer address {:?}", msg.to);
                    continue;
                };
                let Some(tx) = peer_txs.get(&to) else {
                    error!("Outbound message for unknown peer {to}");
                    continue;
                };
                if tx.try_send(msg.message).is_err() {
                    error!("Full send buffer for peer {to}, discarding message");
                }
            }
        });
    }

    /// Sends outbound messages to a peer, continuously reconnecting. Each
    /// session opens with the node handshake; sends honor the artificial
    /// network delay.
    fn tcp_send_peer(
        addr: String,
        id: NodeID,
        delay: Arc<AtomicU64>,
        rx: crossbeam::channel::Receiver<Message>,
    ) {
        loop {
            match std::net::TcpStream::connect(&addr) {
                Ok(socket) => {
                    debug!("Connected to peer {addr}");
                    match Self::tcp_send_peer_session(socket, id, &delay, &rx) {
                        Ok(()) => break,
                        Err(err) => error!("Failed sending to peer {addr}: {err}"),
                    }
                }
                Err(err) => error!("Failed connecting to peer {addr}: {err}"),
            }
            std::thread::sleep(Duration::from_millis(1000));
        }
        debug!("Disconnected from peer {addr}");
    }

    fn tcp_send_peer_session(
        mut socket: std::net::TcpStream,
        id: NodeID,
        delay: &AtomicU64,
        rx: &crossbeam::channel::Receiver<Message>,
    ) -> Result<()> {
        socket.write_all(format!("{}\n", Message::Node { id }.encode()).as_bytes())?;
        while let Ok(message) = rx.recv() {
            let seconds = delay.load(Ordering::Relaxed);
            if seconds > 0 {
                std::thread::sleep(Duration::from_secs(seconds));
            }
            socket.write_all(format!("{}\n", message.encode()).as_bytes())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn response_encoding() -> Result<()> {
        for result in
            [Ok(Response::Commit(7)), Ok(Response::Abort(7)), Ok(Response::Killed(3))]
        {
            assert_eq!(Response::decode(&Response::encode(&result))?, result.unwrap());
        }
        assert_eq!(Response::encode(&Err(Error::Abort)), "error  transaction aborted");
        assert!(matches!(
            Response::decode("error  unknown command frobnicate"),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(Response::decode("nonsense"), Err(Error::Internal(_))));
        Ok(())
    }

    #[test]
    fn fault_injector_arms_for_own_id_only() {
        let delay = Arc::new(AtomicU64::new(0));
        let mut faults = FaultInjector::new(2, delay.clone());
        faults.arm(&FaultPlan { death_after: Some((5, 3)), ..FaultPlan::default() });
        assert_eq!(faults.death_after, None);
        faults.arm(&FaultPlan { death_after: Some((5, 2)), delay: Some(3), ..FaultPlan::default() });
        assert_eq!(faults.death_after, Some(5));
        assert_eq!(delay.load(Ordering::Relaxed), 3);
    }
}
