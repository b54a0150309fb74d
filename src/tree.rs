//! Tree protocol: serialize a filesystem subtree into an ordered packet
//! sequence, or rebuild one from the stream.
//!
//! A directory's entry packet always precedes the entries of its children;
//! a file's name packet is immediately followed by its size packet and then
//! exactly that many raw bytes on the data path. Enumeration order within a
//! directory is whatever the OS yields; it is not stable across platforms.

use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

use crate::bulk::{self, Progress};
use crate::error::TransferError;
use crate::logger::Reporter;
use crate::packet::{read_packet_blocking, send_packet};
use crate::protocol::flags;
use crate::session::Session;

/// Send the session's root (a single file or a directory tree) to the peer.
///
/// On any failure the session aborts toward the peer before the error is
/// returned; END_TRANSFER is only emitted after a clean walk.
pub fn send_tree(
    session: &mut Session,
    reporter: &dyn Reporter,
    progress: &mut Progress,
) -> Result<(), TransferError> {
    let root = session.root.clone();
    let meta = match fs::metadata(&root) {
        Ok(m) => m,
        Err(e) => {
            reporter.error("tree", "stat", &root.display().to_string(), "io");
            session.signal_local_abort();
            return Err(e.into());
        }
    };

    let result: Result<(), TransferError> = (|| {
        send_packet(
            &mut session.stream,
            &[],
            flags::START_TRANSFER | flags::SEND_OPERATION,
        )?;
        if meta.is_dir() {
            walk_and_send(session, reporter, progress)
        } else {
            let name = root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            send_one_file(session, &root, &name, reporter, progress)
        }
    })();

    match result {
        Ok(()) => {
            send_packet(&mut session.stream, &[], flags::END_TRANSFER)?;
            Ok(())
        }
        Err(e) => {
            session.signal_local_abort();
            Err(e)
        }
    }
}

// Depth-first, pre-order. walkdir keeps its own stack of open directory
// handles, so depth costs heap, not call frames, and the self/parent
// pseudo-entries never appear.
fn walk_and_send(
    session: &mut Session,
    reporter: &dyn Reporter,
    progress: &mut Progress,
) -> Result<(), TransferError> {
    let root = session.root.clone();
    for entry in WalkDir::new(&root).follow_links(false) {
        if session.aborted() {
            return Err(TransferError::LocalAbort);
        }
        let entry = entry.map_err(|e| {
            reporter.error("tree", "walk", &root.display().to_string(), "io");
            TransferError::Io(io::Error::from(e))
        })?;
        let rel = entry
            .path()
            .strip_prefix(&root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .into_owned();
        if entry.file_type().is_dir() {
            send_packet(&mut session.stream, rel.as_bytes(), flags::DIR_TYPE)?;
        } else if entry.file_type().is_file() {
            send_one_file(session, entry.path(), &rel, reporter, progress)?;
        }
        // Symlinks and special files are not part of the protocol
    }
    Ok(())
}

fn send_one_file(
    session: &mut Session,
    path: &Path,
    rel: &str,
    reporter: &dyn Reporter,
    progress: &mut Progress,
) -> Result<(), TransferError> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            reporter.error("tree", "open", &path.display().to_string(), "io");
            return Err(e.into());
        }
    };
    let size = match file.metadata() {
        Ok(m) => m.len(),
        Err(e) => {
            reporter.error("tree", "stat", &path.display().to_string(), "io");
            return Err(e.into());
        }
    };

    send_packet(&mut session.stream, rel.as_bytes(), flags::FILE_TYPE)?;
    send_packet(
        &mut session.stream,
        &size.to_le_bytes(),
        flags::FILE_TYPE | flags::FILE_SIZE,
    )?;

    // Batch the payload into full segments for the bulk leg
    bulk::cork(&session.stream, true);
    let moved = bulk::send_file_bytes(&mut file, &mut session.stream, size, progress);
    bulk::cork(&session.stream, false);

    match moved {
        Ok(_) => Ok(()),
        Err(e) => {
            reporter.error("tree", "send", &path.display().to_string(), "io");
            Err(e.into())
        }
    }
}

/// Receive a tree into the session's root. The loop ends on END_TRANSFER
/// (success), ABORT_TRANSFER (peer failure), or the first malformed step.
pub fn recv_tree(
    session: &mut Session,
    reporter: &dyn Reporter,
    progress: &mut Progress,
) -> Result<(), TransferError> {
    loop {
        let packet = match read_packet_blocking(&mut session.stream) {
            Ok(p) => p,
            Err(e) => {
                if matches!(e, TransferError::Io(_) | TransferError::TruncatedPacket) {
                    session.signal_local_abort();
                }
                return Err(e);
            }
        };

        if packet.has(flags::DIR_TYPE) && !packet.has(flags::ABORT_TRANSFER) {
            let dir = resolve_entry_path(&session.root, packet.path()?)?;
            // An existing directory is fine; anything else is fatal
            if let Err(e) = fs::create_dir_all(&dir) {
                reporter.error("tree", "create_dir", &dir.display().to_string(), "io");
                session.signal_local_abort();
                return Err(e.into());
            }
        } else if packet.has(flags::FILE_TYPE) && !packet.has(flags::ABORT_TRANSFER) {
            let rel = packet.path()?.to_owned();
            recv_one_file(session, &rel, reporter, progress)?;
        } else if packet.has(flags::END_TRANSFER) {
            return Ok(());
        } else if packet.has(flags::ABORT_TRANSFER) {
            session.on_abort_received();
            return Err(TransferError::PeerAborted);
        } else {
            return Err(TransferError::Protocol(format!(
                "unexpected packet flags {:#x}",
                packet.flags
            )));
        }
    }
}

fn recv_one_file(
    session: &mut Session,
    rel: &str,
    reporter: &dyn Reporter,
    progress: &mut Progress,
) -> Result<(), TransferError> {
    let dest = resolve_entry_path(&session.root, rel)?;

    // The size must follow the name with nothing in between
    let size_packet = match read_packet_blocking(&mut session.stream) {
        Ok(p) => p,
        Err(e) => {
            if matches!(e, TransferError::Io(_) | TransferError::TruncatedPacket) {
                session.signal_local_abort();
            }
            return Err(e);
        }
    };
    if size_packet.has(flags::ABORT_TRANSFER) {
        session.on_abort_received();
        return Err(TransferError::PeerAborted);
    }
    if !size_packet.has(flags::FILE_SIZE) {
        return Err(TransferError::Protocol(format!(
            "expected file size after name, got flags {:#x}",
            size_packet.flags
        )));
    }
    let total = size_packet.file_size()?;

    if let Some(parent) = dest.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            reporter.error("tree", "create_dir", &parent.display().to_string(), "io");
            session.signal_local_abort();
            return Err(e.into());
        }
    }
    let mut file = match File::create(&dest) {
        Ok(f) => f,
        Err(e) => {
            reporter.error("tree", "create", &dest.display().to_string(), "io");
            session.signal_local_abort();
            return Err(e.into());
        }
    };

    match bulk::recv_file_bytes(&mut session.stream, &mut file, total, progress) {
        Ok(_) => Ok(()),
        Err(e) => {
            reporter.error("tree", "receive", &dest.display().to_string(), "io");
            session.signal_local_abort();
            Err(e.into())
        }
    }
}

/// Join a peer-supplied relative path under `root`, rejecting anything that
/// could land outside it: absolute paths, parent components, prefixes, and
/// NUL bytes. The empty path resolves to `root` itself.
pub fn resolve_entry_path(root: &Path, rel: &str) -> Result<PathBuf, TransferError> {
    use Component::{CurDir, Normal, ParentDir, Prefix, RootDir};

    if rel.contains('\0') {
        return Err(TransferError::Protocol("path contains NUL byte".into()));
    }
    let mut safe = PathBuf::new();
    for component in Path::new(rel).components() {
        match component {
            CurDir => {}
            Normal(s) => safe.push(s),
            ParentDir | RootDir | Prefix(_) => {
                return Err(TransferError::Protocol(format!(
                    "path escapes the receive root: {:?}",
                    rel
                )));
            }
        }
    }
    Ok(root.join(safe))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_entry_path_safe() {
        let root = Path::new("/recv");
        assert_eq!(
            resolve_entry_path(root, "sub/file.txt").unwrap(),
            root.join("sub/file.txt")
        );
        assert_eq!(
            resolve_entry_path(root, "./sub/./file.txt").unwrap(),
            root.join("sub/file.txt")
        );
    }

    #[test]
    fn test_resolve_entry_path_empty_is_root() {
        let root = Path::new("/recv");
        assert_eq!(resolve_entry_path(root, "").unwrap(), root.to_path_buf());
    }

    #[test]
    fn test_resolve_entry_path_unsafe() {
        let root = Path::new("/recv");
        assert!(resolve_entry_path(root, "../etc/passwd").is_err());
        assert!(resolve_entry_path(root, "sub/../../etc").is_err());
        assert!(resolve_entry_path(root, "/etc/passwd").is_err());
        assert!(resolve_entry_path(root, "file\0.txt").is_err());
    }
}
