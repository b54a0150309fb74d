//! Bulk data path between a connected stream and a file.
//!
//! On Linux the payload never crosses user space: `sendfile` moves file
//! bytes onto the socket and `splice` drains the socket through a pipe into
//! the destination file. Every other target (and any filesystem the kernel
//! refuses to splice) uses a bounded-buffer relay loop with the identical
//! external contract: exactly `total` bytes or an error carrying the count
//! moved so far.

use std::fs::File;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::protocol::timeouts;

const RELAY_BUF_SIZE: usize = 4 * 1024 * 1024;
#[cfg(target_os = "linux")]
const ZERO_COPY_CHUNK: u64 = 8 * 1024 * 1024;

/// A failed bulk move, carrying how many bytes made it across before the
/// underlying error.
#[derive(Debug, Error)]
#[error("bulk transfer failed after {moved} bytes: {source}")]
pub struct BulkError {
    pub moved: u64,
    pub source: io::Error,
}

impl From<BulkError> for crate::error::TransferError {
    fn from(e: BulkError) -> Self {
        crate::error::TransferError::Io(e.source)
    }
}

/// Throttled byte-count reporting for bulk moves. Invokes the callback with
/// (moved, total) at most once per tick; purely observational, never part of
/// control flow.
pub struct Progress<'a> {
    callback: Option<&'a mut dyn FnMut(u64, u64)>,
    last: Instant,
}

impl<'a> Progress<'a> {
    pub fn new(callback: &'a mut dyn FnMut(u64, u64)) -> Self {
        Self {
            callback: Some(callback),
            last: Instant::now(),
        }
    }

    pub fn none() -> Self {
        Self {
            callback: None,
            last: Instant::now(),
        }
    }

    fn tick(&mut self, moved: u64, total: u64) {
        if let Some(cb) = self.callback.as_mut() {
            if self.last.elapsed() >= Duration::from_millis(timeouts::PROGRESS_TICK_MS) {
                cb(moved, total);
                self.last = Instant::now();
            }
        }
    }
}

/// Batching hint around a bulk send: TCP_CORK on Linux, no-op elsewhere.
/// Failures are ignored; the hint never affects correctness.
pub fn cork(stream: &TcpStream, enabled: bool) {
    #[cfg(target_os = "linux")]
    {
        use std::os::fd::AsRawFd;
        let on: libc::c_int = if enabled { 1 } else { 0 };
        unsafe {
            let _ = libc::setsockopt(
                stream.as_raw_fd(),
                libc::IPPROTO_TCP,
                libc::TCP_CORK,
                &on as *const _ as *const libc::c_void,
                std::mem::size_of_val(&on) as libc::socklen_t,
            );
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (stream, enabled);
    }
}

/// Stream exactly `total` bytes from `file` onto `stream`.
#[cfg(target_os = "linux")]
pub fn send_file_bytes(
    file: &mut File,
    stream: &mut TcpStream,
    total: u64,
    progress: &mut Progress,
) -> Result<u64, BulkError> {
    use std::os::fd::AsRawFd;

    let in_fd = file.as_raw_fd();
    let out_fd = stream.as_raw_fd();
    let mut moved = 0u64;
    while moved < total {
        let chunk = (total - moved).min(ZERO_COPY_CHUNK) as usize;
        let sent = unsafe { libc::sendfile(out_fd, in_fd, std::ptr::null_mut(), chunk) };
        if sent < 0 {
            let e = io::Error::last_os_error();
            match e.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => {
                    thread::sleep(Duration::from_millis(timeouts::POLL_MS));
                    continue;
                }
                // Source not sendfile-capable on this kernel/filesystem
                Some(libc::EINVAL) | Some(libc::ENOSYS) if moved == 0 => {
                    return relay_file_to_stream(file, stream, total, progress);
                }
                _ => return Err(BulkError { moved, source: e }),
            }
        }
        if sent == 0 {
            return Err(BulkError {
                moved,
                source: io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "file ended before the announced size",
                ),
            });
        }
        moved += sent as u64;
        progress.tick(moved, total);
    }
    Ok(moved)
}

#[cfg(not(target_os = "linux"))]
pub fn send_file_bytes(
    file: &mut File,
    stream: &mut TcpStream,
    total: u64,
    progress: &mut Progress,
) -> Result<u64, BulkError> {
    relay_file_to_stream(file, stream, total, progress)
}

/// Drain exactly `total` bytes from `stream` into `file`.
#[cfg(target_os = "linux")]
pub fn recv_file_bytes(
    stream: &mut TcpStream,
    file: &mut File,
    total: u64,
    progress: &mut Progress,
) -> Result<u64, BulkError> {
    use std::os::fd::AsRawFd;

    let pipe = match Pipe::new() {
        Ok(p) => p,
        Err(_) => return relay_stream_to_file(stream, file, total, progress),
    };
    let sock_fd = stream.as_raw_fd();
    let file_fd = file.as_raw_fd();
    let mut moved = 0u64;
    while moved < total {
        let chunk = (total - moved).min(ZERO_COPY_CHUNK) as usize;
        let received = unsafe {
            libc::splice(
                sock_fd,
                std::ptr::null_mut(),
                pipe.write_fd(),
                std::ptr::null_mut(),
                chunk,
                libc::SPLICE_F_MOVE,
            )
        };
        if received < 0 {
            let e = io::Error::last_os_error();
            match e.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => {
                    thread::sleep(Duration::from_millis(timeouts::POLL_MS));
                    continue;
                }
                // Destination not splice-capable on this kernel/filesystem
                Some(libc::EINVAL) | Some(libc::ENOSYS) if moved == 0 => {
                    return relay_stream_to_file(stream, file, total, progress);
                }
                _ => return Err(BulkError { moved, source: e }),
            }
        }
        if received == 0 {
            return Err(BulkError {
                moved,
                source: io::Error::new(io::ErrorKind::UnexpectedEof, "stream closed mid-transfer"),
            });
        }
        // Drain what landed in the pipe into the file
        let mut pending = received as usize;
        while pending > 0 {
            let written = unsafe {
                libc::splice(
                    pipe.read_fd(),
                    std::ptr::null_mut(),
                    file_fd,
                    std::ptr::null_mut(),
                    pending,
                    libc::SPLICE_F_MOVE,
                )
            };
            if written < 0 {
                let e = io::Error::last_os_error();
                if e.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(BulkError { moved, source: e });
            }
            pending -= written as usize;
            moved += written as u64;
        }
        progress.tick(moved, total);
    }
    Ok(moved)
}

#[cfg(not(target_os = "linux"))]
pub fn recv_file_bytes(
    stream: &mut TcpStream,
    file: &mut File,
    total: u64,
    progress: &mut Progress,
) -> Result<u64, BulkError> {
    relay_stream_to_file(stream, file, total, progress)
}

#[cfg(target_os = "linux")]
struct Pipe {
    fds: [libc::c_int; 2],
}

#[cfg(target_os = "linux")]
impl Pipe {
    fn new() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fds })
    }

    fn read_fd(&self) -> libc::c_int {
        self.fds[0]
    }

    fn write_fd(&self) -> libc::c_int {
        self.fds[1]
    }
}

#[cfg(target_os = "linux")]
impl Drop for Pipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fds[0]);
            libc::close(self.fds[1]);
        }
    }
}

fn relay_file_to_stream(
    file: &mut File,
    stream: &mut TcpStream,
    total: u64,
    progress: &mut Progress,
) -> Result<u64, BulkError> {
    let mut buf = vec![0u8; RELAY_BUF_SIZE];
    let mut moved = 0u64;
    while moved < total {
        let want = (total - moved).min(buf.len() as u64) as usize;
        let n = match file.read(&mut buf[..want]) {
            Ok(0) => {
                return Err(BulkError {
                    moved,
                    source: io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "file ended before the announced size",
                    ),
                })
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(BulkError { moved, source: e }),
        };
        if let Err(e) = write_all_spin(stream, &buf[..n]) {
            return Err(BulkError { moved, source: e });
        }
        moved += n as u64;
        progress.tick(moved, total);
    }
    Ok(moved)
}

fn relay_stream_to_file(
    stream: &mut TcpStream,
    file: &mut File,
    total: u64,
    progress: &mut Progress,
) -> Result<u64, BulkError> {
    let mut buf = vec![0u8; RELAY_BUF_SIZE];
    let mut moved = 0u64;
    while moved < total {
        let want = (total - moved).min(buf.len() as u64) as usize;
        let n = match stream.read(&mut buf[..want]) {
            Ok(0) => {
                return Err(BulkError {
                    moved,
                    source: io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream closed mid-transfer",
                    ),
                })
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(timeouts::POLL_MS));
                continue;
            }
            Err(e) => return Err(BulkError { moved, source: e }),
        };
        if let Err(e) = file.write_all(&buf[..n]) {
            return Err(BulkError { moved, source: e });
        }
        moved += n as u64;
        progress.tick(moved, total);
    }
    Ok(moved)
}

fn write_all_spin(stream: &mut TcpStream, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match stream.write(buf) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "stream refused further bytes",
                ))
            }
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(timeouts::POLL_MS))
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = thread::spawn(move || listener.accept().unwrap().0);
        let client = TcpStream::connect(addr).unwrap();
        (client, accepted.join().unwrap())
    }

    fn write_pattern(path: &std::path::Path, size: usize) {
        let mut f = File::create(path).unwrap();
        let mut buf = vec![0u8; 64 * 1024];
        let mut remaining = size;
        let mut val: u8 = 0;
        while remaining > 0 {
            for b in buf.iter_mut() {
                *b = val;
                val = val.wrapping_add(1);
            }
            let n = remaining.min(buf.len());
            f.write_all(&buf[..n]).unwrap();
            remaining -= n;
        }
    }

    #[test]
    fn test_move_exact_byte_count() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("dst.bin");
        let total: u64 = 3 * 1024 * 1024 + 17;
        write_pattern(&src, total as usize);

        let (mut client, mut server) = tcp_pair();
        let src_clone = src.clone();
        let sender = thread::spawn(move || {
            let mut f = File::open(&src_clone).unwrap();
            send_file_bytes(&mut f, &mut client, total, &mut Progress::none()).unwrap()
        });

        let mut out = File::create(&dst).unwrap();
        let received =
            recv_file_bytes(&mut server, &mut out, total, &mut Progress::none()).unwrap();

        assert_eq!(sender.join().unwrap(), total);
        assert_eq!(received, total);
        assert_eq!(std::fs::read(&src).unwrap(), std::fs::read(&dst).unwrap());
    }

    #[test]
    fn test_zero_length_move() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("empty.bin");
        let (_client, mut server) = tcp_pair();

        let mut out = File::create(&dst).unwrap();
        let received = recv_file_bytes(&mut server, &mut out, 0, &mut Progress::none()).unwrap();
        assert_eq!(received, 0);
        assert_eq!(std::fs::metadata(&dst).unwrap().len(), 0);
    }

    #[test]
    fn test_short_stream_reports_partial_count() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("short.bin");
        let (mut client, mut server) = tcp_pair();

        client.write_all(b"0123456789").unwrap();
        drop(client);

        let mut out = File::create(&dst).unwrap();
        let err = recv_file_bytes(&mut server, &mut out, 20, &mut Progress::none()).unwrap_err();
        assert_eq!(err.moved, 10);
        assert_eq!(err.source.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_progress_throttle_holds_first_tick() {
        let mut fired = 0u32;
        let mut cb = |_moved: u64, _total: u64| fired += 1;
        let mut progress = Progress::new(&mut cb);
        // Well inside the first tick interval: nothing may fire yet
        progress.tick(1, 10);
        progress.tick(2, 10);
        drop(progress);
        assert_eq!(fired, 0);
    }
}
