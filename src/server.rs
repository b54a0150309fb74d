//! Listening-socket lifecycle: a blocking accept loop on its own thread,
//! one handler thread per accepted connection, and LISTEN/REJECT toggling.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use parking_lot::Mutex;

use crate::logger::Reporter;

/// Typed capability invoked once per accepted connection, on a thread of
/// its own. The handler owns the stream from that point on.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn on_accept(&self, stream: TcpStream, peer: SocketAddr);
}

pub struct Service {
    addr: SocketAddr,
    accepting: Arc<AtomicBool>,
    handler: Arc<dyn ConnectionHandler>,
    reporter: Arc<dyn Reporter>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Service {
    /// Bind `port` on all interfaces and start accepting.
    pub fn start(
        port: u16,
        handler: Arc<dyn ConnectionHandler>,
        reporter: Arc<dyn Reporter>,
    ) -> Result<Self> {
        let listener =
            TcpListener::bind(("0.0.0.0", port)).with_context(|| format!("bind port {}", port))?;
        let addr = listener.local_addr().context("listener local addr")?;
        let service = Self {
            addr,
            accepting: Arc::new(AtomicBool::new(false)),
            handler,
            reporter,
            accept_thread: Mutex::new(None),
        };
        *service.accept_thread.lock() = Some(service.spawn(listener));
        Ok(service)
    }

    /// The bound address (the actual port when started with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Resume accepting after `reject`. No-op while already listening.
    pub fn listen(&self) -> Result<()> {
        let mut guard = self.accept_thread.lock();
        if guard.is_some() {
            return Ok(());
        }
        let listener =
            TcpListener::bind(self.addr).with_context(|| format!("rebind {}", self.addr))?;
        *guard = Some(self.spawn(listener));
        Ok(())
    }

    /// Stop accepting. The in-flight accept is abandoned: the loop wakes on
    /// a throwaway self-connection and drops the listener, so further
    /// connection attempts are refused. Connections already handed to their
    /// handler threads keep running.
    pub fn reject(&self) {
        let handle = self.accept_thread.lock().take();
        let Some(handle) = handle else {
            return;
        };
        self.accepting.store(false, Ordering::Release);
        // Wake the blocking accept
        let _ = TcpStream::connect(("127.0.0.1", self.addr.port()));
        let _ = handle.join();
    }

    fn spawn(&self, listener: TcpListener) -> JoinHandle<()> {
        self.accepting.store(true, Ordering::Release);
        let accepting = Arc::clone(&self.accepting);
        let handler = Arc::clone(&self.handler);
        let reporter = Arc::clone(&self.reporter);
        thread::spawn(move || accept_loop(listener, accepting, handler, reporter))
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.reject();
    }
}

fn accept_loop(
    listener: TcpListener,
    accepting: Arc<AtomicBool>,
    handler: Arc<dyn ConnectionHandler>,
    reporter: Arc<dyn Reporter>,
) {
    while accepting.load(Ordering::Acquire) {
        let (stream, peer) = match listener.accept() {
            Ok(pair) => pair,
            Err(e) => {
                reporter.error("server", "accept", &e.to_string(), "io");
                continue;
            }
        };
        // The reject() wake-up lands here and is dropped, not served
        if !accepting.load(Ordering::Acquire) {
            break;
        }
        tune_socket(&stream);
        let handler = Arc::clone(&handler);
        thread::spawn(move || handler.on_accept(stream, peer));
    }
}

// Keepalive on every transfer connection; failures are ignored
#[allow(unused_variables)]
pub(crate) fn tune_socket(stream: &TcpStream) {
    #[cfg(unix)]
    {
        use std::os::fd::AsRawFd;
        let fd = stream.as_raw_fd();
        let keepalive: libc::c_int = 1;
        unsafe {
            let _ = libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_KEEPALIVE,
                &keepalive as *const _ as *const libc::c_void,
                std::mem::size_of_val(&keepalive) as libc::socklen_t,
            );
        }
    }
}
