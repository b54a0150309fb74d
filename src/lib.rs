//! Ferry - peer-to-peer file and directory transfer
//!
//! Two peers exchange a small framed protocol over a raw TCP stream to move
//! a file or a whole directory tree in one direction. File payloads travel
//! on a zero-copy path where the platform has one. Inbound transfers only
//! start after the local operator approves them.

pub mod bulk;
pub mod cli;
pub mod console;
pub mod error;
pub mod gate;
pub mod logger;
pub mod packet;
pub mod protocol;
pub mod server;
pub mod session;
pub mod tree;
