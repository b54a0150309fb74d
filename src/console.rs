//! Interactive operator loop: issue transfers, answer inbound prompts.

use std::io::{self, BufRead, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};

use crate::bulk::Progress;
use crate::error::TransferError;
use crate::gate::{Decision, Gate};
use crate::logger::Reporter;
use crate::packet::{read_packet_blocking, send_packet};
use crate::protocol::flags;
use crate::server::tune_socket;
use crate::session::{Direction, Session};
use crate::tree;

/// One parsed operator line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send { path: String, ip: String },
    Receive { path: String, ip: String },
    Allow,
    Deny,
    Stop,
    Empty,
    Unknown,
}

/// Whitespace tokenizer over one input line.
pub fn parse_command(line: &str) -> Command {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.as_slice() {
        [] => Command::Empty,
        ["send", path, ip] => Command::Send {
            path: (*path).to_string(),
            ip: (*ip).to_string(),
        },
        ["receive", path, ip] => Command::Receive {
            path: (*path).to_string(),
            ip: (*ip).to_string(),
        },
        ["stop"] => Command::Stop,
        [one] if one.eq_ignore_ascii_case("y") => Command::Allow,
        [one] if one.eq_ignore_ascii_case("n") => Command::Deny,
        _ => Command::Unknown,
    }
}

pub struct Console {
    gate: Arc<Gate>,
    reporter: Arc<dyn Reporter>,
    port: u16,
    receive_root: PathBuf,
}

impl Console {
    pub fn new(
        gate: Arc<Gate>,
        reporter: Arc<dyn Reporter>,
        port: u16,
        receive_root: PathBuf,
    ) -> Self {
        Self {
            gate,
            reporter,
            port,
            receive_root,
        }
    }

    /// Drive the operator loop until `stop` or end of input.
    pub fn run(&self) -> Result<()> {
        let stdin = io::stdin();
        let mut line = String::new();
        loop {
            print!("\n-> ");
            io::stdout().flush().ok();
            line.clear();
            if stdin.lock().read_line(&mut line).context("read stdin")? == 0 {
                break;
            }
            match parse_command(&line) {
                Command::Send { path, ip } => self.transfer(&ip, Direction::Send, &path),
                Command::Receive { path, ip } => self.transfer(&ip, Direction::Receive, &path),
                Command::Allow => {
                    if !self.gate.resolve(Decision::Allow) {
                        println!("nothing to answer");
                    }
                }
                Command::Deny => {
                    if !self.gate.resolve(Decision::Deny) {
                        println!("nothing to answer");
                    }
                }
                Command::Stop => break,
                Command::Empty => {}
                Command::Unknown => {
                    if let Some(peer) = self.gate.pending_peer() {
                        println!("answer [Y/N] for the connection from {}", peer);
                    } else {
                        println!("commands: send <path> <ip> | receive <path> <ip> | stop");
                    }
                }
            }
        }
        Ok(())
    }

    fn transfer(&self, ip: &str, direction: Direction, path: &str) {
        let Some(_permit) = self.gate.begin_command() else {
            if let Some(peer) = self.gate.pending_peer() {
                println!("answer [Y/N] for the connection from {} first", peer);
            } else {
                println!("another transfer is still running");
            }
            return;
        };
        let outcome = match direction {
            Direction::Send => self.push(path, ip),
            Direction::Receive => self.pull(path, ip),
        };
        match outcome {
            Ok(()) => {
                let verb = match direction {
                    Direction::Send => "sent",
                    Direction::Receive => "received",
                };
                self.reporter.session(ip, verb);
                println!("done");
            }
            Err(e) => {
                self.reporter
                    .session(ip, &format!("failed: {} [{}]", e, e.kind()));
                println!("transfer failed: {}", e);
            }
        }
    }

    fn connect(&self, ip: &str) -> Result<TcpStream, TransferError> {
        let stream = TcpStream::connect((ip, self.port))?;
        tune_socket(&stream);
        Ok(stream)
    }

    fn push(&self, path: &str, ip: &str) -> Result<(), TransferError> {
        let stream = self.connect(ip)?;
        let mut session = Session::new(stream, PathBuf::from(path), Direction::Send);

        let spinner = transfer_spinner();
        let mut update = |moved: u64, total: u64| {
            spinner.set_message(format!("{} / {} bytes", moved, total));
        };
        let mut progress = Progress::new(&mut update);
        let result = tree::send_tree(&mut session, self.reporter.as_ref(), &mut progress);
        spinner.finish_and_clear();
        result
    }

    // Ask the peer to send `remote_path` back to us; it answers by opening
    // its own send leg, which we receive as usual.
    fn pull(&self, remote_path: &str, ip: &str) -> Result<(), TransferError> {
        let mut stream = self.connect(ip)?;
        send_packet(
            &mut stream,
            remote_path.as_bytes(),
            flags::START_TRANSFER | flags::RECEIVE_OPERATION,
        )?;
        let mut session = Session::new(stream, self.receive_root.clone(), Direction::Receive);

        let first = read_packet_blocking(&mut session.stream)?;
        if first.has(flags::ABORT_TRANSFER) {
            session.on_abort_received();
            return Err(TransferError::PeerAborted);
        }
        if !first.has(flags::START_TRANSFER) {
            return Err(TransferError::Protocol(format!(
                "expected transfer open, got flags {:#x}",
                first.flags
            )));
        }

        let spinner = transfer_spinner();
        let mut update = |moved: u64, total: u64| {
            spinner.set_message(format!("{} / {} bytes", moved, total));
        };
        let mut progress = Progress::new(&mut update);
        let result = tree::recv_tree(&mut session, self.reporter.as_ref(), &mut progress);
        spinner.finish_and_clear();
        result
    }
}

fn transfer_spinner() -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("  {spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_transfers() {
        assert_eq!(
            parse_command("send /tmp/tree 10.0.0.2"),
            Command::Send {
                path: "/tmp/tree".into(),
                ip: "10.0.0.2".into()
            }
        );
        assert_eq!(
            parse_command("receive photos 10.0.0.2\n"),
            Command::Receive {
                path: "photos".into(),
                ip: "10.0.0.2".into()
            }
        );
    }

    #[test]
    fn test_parse_answers_any_case() {
        assert_eq!(parse_command("y"), Command::Allow);
        assert_eq!(parse_command("Y\n"), Command::Allow);
        assert_eq!(parse_command("n"), Command::Deny);
        assert_eq!(parse_command("N"), Command::Deny);
    }

    #[test]
    fn test_parse_misc() {
        assert_eq!(parse_command("stop"), Command::Stop);
        assert_eq!(parse_command("   "), Command::Empty);
        assert_eq!(parse_command(""), Command::Empty);
        assert_eq!(parse_command("send onlypath"), Command::Unknown);
        assert_eq!(parse_command("frobnicate a b c"), Command::Unknown);
    }
}
