use crate::error::{Error, Result};
use crate::server::Response;

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};

/// A trikv client. Submits command lines to a node (typically the
/// coordinator) and reads back one response line per command.
pub struct Client {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Client {
    /// Connects to a node.
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let socket = TcpStream::connect(addr)?;
        let reader = BufReader::new(socket.try_clone()?);
        Ok(Self { reader, writer: socket })
    }

    /// Submits a single command line, e.g. `add s u`, and blocks until the
    /// transaction's outcome is reported.
    pub fn execute(&mut self, command: &str) -> Result<Response> {
        self.writer.write_all(format!("{}\n", command.trim()).as_bytes())?;
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(Error::IO("server disconnected".to_owned()));
        }
        Response::decode(line.trim_end())
    }
}
