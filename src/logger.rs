use anyhow::Result;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// Fire-and-forget reporting sink. Implementations must not block session
/// threads or influence control flow; a report that cannot be written is
/// silently dropped.
pub trait Reporter: Send + Sync {
    /// A failed call: the module it happened in, the call that failed, the
    /// operand it failed on, and a stable error kind.
    fn error(&self, _source: &str, _call: &str, _context: &str, _kind: &str) {}
    /// One finished session: who, and how it ended.
    fn session(&self, _peer: &str, _outcome: &str) {}
    /// Accept-layer and console notices.
    fn notice(&self, _msg: &str) {}
}

pub struct NoopReporter;
impl Reporter for NoopReporter {}

/// Prints to stderr; the interactive default.
pub struct StderrReporter;

impl Reporter for StderrReporter {
    fn error(&self, source: &str, call: &str, context: &str, kind: &str) {
        eprintln!("error: {}: {} {} ({})", source, call, context, kind);
    }
    fn session(&self, peer: &str, outcome: &str) {
        eprintln!("session {}: {}", peer, outcome);
    }
    fn notice(&self, msg: &str) {
        eprintln!("{}", msg);
    }
}

/// Appends timestamped lines to a file.
pub struct TextReporter {
    file: Mutex<File>,
}

impl TextReporter {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl Reporter for TextReporter {
    fn error(&self, source: &str, call: &str, context: &str, kind: &str) {
        self.line(&format!(
            "ERROR src={} call={} ctx={} kind={}",
            source, call, context, kind
        ));
    }
    fn session(&self, peer: &str, outcome: &str) {
        self.line(&format!("SESSION peer={} outcome={}", peer, outcome));
    }
    fn notice(&self, msg: &str) {
        self.line(&format!("NOTE {}", msg));
    }
}
