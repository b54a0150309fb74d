//! Operator rendezvous: inbound sessions wait for an explicit allow/deny,
//! and at most one transfer (inbound or outbound) runs at a time.
//!
//! The pending slot is the only state shared between the accept-handler
//! threads and the operator thread. Everything moves through one mutex plus
//! a per-request reply channel, so at-most-one-PENDING holds structurally:
//! a second inbound connection blocks before its request is even visible.

use parking_lot::{Condvar, Mutex};
use std::net::SocketAddr;
use std::sync::mpsc::{sync_channel, SyncSender};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

struct PendingRequest {
    peer: SocketAddr,
    reply: SyncSender<Decision>,
}

#[derive(Default)]
struct GateState {
    pending: Option<PendingRequest>,
    // A session (allowed inbound, or an operator command) is in flight
    busy: bool,
}

/// Holds the gate's exclusive session slot; dropping it frees the slot and
/// wakes whoever is waiting for it.
pub struct Permit<'a> {
    gate: &'a Gate,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock();
        state.busy = false;
        drop(state);
        self.gate.changed.notify_all();
    }
}

pub struct Gate {
    state: Mutex<GateState>,
    changed: Condvar,
    notifier: Box<dyn Fn(SocketAddr) + Send + Sync>,
}

impl Gate {
    /// `notifier` surfaces a newly pending request to the operator (it is
    /// called outside the gate's lock, once per request).
    pub fn new<F>(notifier: F) -> Self
    where
        F: Fn(SocketAddr) + Send + Sync + 'static,
    {
        Self {
            state: Mutex::new(GateState::default()),
            changed: Condvar::new(),
            notifier: Box::new(notifier),
        }
    }

    /// Called from a connection-handler thread. Blocks until the operator
    /// resolves this request; while another request is pending or a session
    /// is running, blocks before the request becomes visible at all.
    /// Returns the session permit on Allow, None on Deny.
    pub fn request(&self, peer: SocketAddr) -> Option<Permit<'_>> {
        let reply_rx = {
            let mut state = self.state.lock();
            while state.pending.is_some() || state.busy {
                self.changed.wait(&mut state);
            }
            let (tx, rx) = sync_channel(1);
            state.pending = Some(PendingRequest { peer, reply: tx });
            rx
        };
        (self.notifier)(peer);

        // A dropped gate answers Deny
        match reply_rx.recv().unwrap_or(Decision::Deny) {
            // resolve() already marked the slot busy on our behalf
            Decision::Allow => Some(Permit { gate: self }),
            Decision::Deny => None,
        }
    }

    /// Called from the operator thread on a Y/N answer. Returns false if no
    /// request was pending.
    pub fn resolve(&self, decision: Decision) -> bool {
        let mut state = self.state.lock();
        let Some(pending) = state.pending.take() else {
            return false;
        };
        if decision == Decision::Allow {
            // Hand the session slot straight to the waiting handler, so no
            // other request or command can slip in between
            state.busy = true;
            if pending.reply.send(decision).is_err() {
                state.busy = false;
            }
        } else {
            let _ = pending.reply.send(decision);
        }
        drop(state);
        self.changed.notify_all();
        true
    }

    /// The peer whose request currently awaits a decision, if any.
    pub fn pending_peer(&self) -> Option<SocketAddr> {
        self.state.lock().pending.as_ref().map(|p| p.peer)
    }

    /// Claim the session slot for an operator-issued command. Fails while a
    /// request awaits its Y/N or another session is running.
    pub fn begin_command(&self) -> Option<Permit<'_>> {
        let mut state = self.state.lock();
        if state.pending.is_some() || state.busy {
            return None;
        }
        state.busy = true;
        Some(Permit { gate: self })
    }
}
