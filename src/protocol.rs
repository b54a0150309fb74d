//! Shared wire constants for the ferry framed transport

// Packet header: 4-byte payload size, then 4-byte flag bitmask, little-endian
pub const HEADER_SIZE: usize = 8;

// Maximum packet payload size (16MB) - prevents DoS via memory exhaustion.
// Control payloads are paths and an 8-byte file size; bulk file data never
// travels inside a packet, so anything near this limit is hostile or corrupt.
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

// Default TCP port for both the listener and outbound connections
pub const DEFAULT_PORT: u16 = 8899;

// Flag bit values (bitmask, combinable)
pub mod flags {
    pub const START_TRANSFER: u32 = 0x001;
    pub const ABORT_TRANSFER: u32 = 0x002;
    pub const END_TRANSFER: u32 = 0x004;
    // Reserved on the wire; never emitted. Receivers treat it as an
    // unrecognized combination.
    pub const CONTINUE_TRANSFER: u32 = 0x008;
    pub const FILE_TYPE: u32 = 0x010;
    pub const DIR_TYPE: u32 = 0x020;
    pub const SEND_OPERATION: u32 = 0x040;
    pub const RECEIVE_OPERATION: u32 = 0x080;
    pub const FILE_SIZE: u32 = 0x100;
}

// Centralized timing constants for the blocking send/receive paths
pub mod timeouts {
    // Sleep between retries when a non-blocking stream reports WouldBlock (ms)
    pub const POLL_MS: u64 = 1;

    // Progress callback throttle interval (ms)
    pub const PROGRESS_TICK_MS: u64 = 1000;
}
