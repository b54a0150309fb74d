//! Transfer session lifecycle, abort coordination, and the accept-side
//! dispatch that runs one approved inbound connection.

use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::bulk::Progress;
use crate::error::TransferError;
use crate::gate::Gate;
use crate::logger::Reporter;
use crate::packet::{read_packet_blocking, send_packet};
use crate::protocol::flags;
use crate::server::ConnectionHandler;
use crate::tree;

/// Which way the bytes flow in this session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

/// One directed transfer bound to one connection.
///
/// The stream is exclusively owned by the thread running the session for its
/// whole lifetime and is closed exactly once, when the session drops.
pub struct Session {
    pub stream: TcpStream,
    pub root: PathBuf,
    pub direction: Direction,
    aborted: bool,
}

impl Session {
    pub fn new(stream: TcpStream, root: PathBuf, direction: Direction) -> Self {
        Self {
            stream,
            root,
            direction,
            aborted: false,
        }
    }

    pub fn aborted(&self) -> bool {
        self.aborted
    }

    /// Local failure: mark the session aborted and tell the peer, once.
    /// Repeated calls do nothing, so both halves of a failing transfer can
    /// call it without flooding the wire. A failed send is ignored; the
    /// connection may already be gone.
    pub fn signal_local_abort(&mut self) {
        if self.aborted {
            return;
        }
        self.aborted = true;
        let _ = send_packet(&mut self.stream, &[], flags::ABORT_TRANSFER);
    }

    /// Peer-initiated abort: record it without echoing an abort back.
    pub fn on_abort_received(&mut self) {
        self.aborted = true;
    }
}

/// Dispatch one approved inbound connection according to its opening packet:
/// the peer either pushes a tree at us (SEND_OPERATION) or asks us to send
/// one back (RECEIVE_OPERATION, with the requested path as payload).
pub fn serve_inbound(
    mut stream: TcpStream,
    receive_root: &Path,
    reporter: &dyn Reporter,
) -> Result<Direction, TransferError> {
    let first = read_packet_blocking(&mut stream)?;
    if !first.has(flags::START_TRANSFER) {
        return Err(TransferError::Protocol(format!(
            "expected transfer open, got flags {:#x}",
            first.flags
        )));
    }
    if first.has(flags::SEND_OPERATION) {
        let mut session = Session::new(stream, receive_root.to_path_buf(), Direction::Receive);
        tree::recv_tree(&mut session, reporter, &mut Progress::none())?;
        Ok(Direction::Receive)
    } else if first.has(flags::RECEIVE_OPERATION) {
        let root = PathBuf::from(first.path()?);
        let mut session = Session::new(stream, root, Direction::Send);
        tree::send_tree(&mut session, reporter, &mut Progress::none())?;
        Ok(Direction::Send)
    } else {
        Err(TransferError::Protocol(
            "transfer open names no operation".into(),
        ))
    }
}

/// Accept-side glue: ask the operator's gate, then run the inbound session.
/// A denied connection is dropped without any protocol traffic.
pub struct GatedHandler {
    pub gate: Arc<Gate>,
    pub receive_root: PathBuf,
    pub reporter: Arc<dyn Reporter>,
}

impl ConnectionHandler for GatedHandler {
    fn on_accept(&self, stream: TcpStream, peer: SocketAddr) {
        let peer_str = peer.to_string();
        let Some(_permit) = self.gate.request(peer) else {
            self.reporter.session(&peer_str, "denied");
            return;
        };
        match serve_inbound(stream, &self.receive_root, self.reporter.as_ref()) {
            Ok(Direction::Receive) => self.reporter.session(&peer_str, "received"),
            Ok(Direction::Send) => self.reporter.session(&peer_str, "served"),
            Err(e) => self
                .reporter
                .session(&peer_str, &format!("failed: {} [{}]", e, e.kind())),
        }
    }
}
