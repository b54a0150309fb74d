//! Framed packet codec: 8-byte header (payload size, flag bitmask) followed
//! by exactly `size` payload bytes.
//!
//! The header's size field is authoritative: a receiver never interprets the
//! payload before that many bytes have arrived, and a stream that ends early
//! fails with `TruncatedPacket` rather than yielding a short buffer.

use std::io::{self, Read, Write};
use std::thread;
use std::time::Duration;

use crate::error::TransferError;
use crate::protocol::{timeouts, HEADER_SIZE, MAX_PACKET_SIZE};

/// One framed protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub flags: u32,
    pub payload: Vec<u8>,
}

impl Packet {
    /// True if any of `bits` is set.
    pub fn has(&self, bits: u32) -> bool {
        self.flags & bits != 0
    }

    /// Payload interpreted as a UTF-8 relative path (DIR_TYPE / FILE_TYPE).
    pub fn path(&self) -> Result<&str, TransferError> {
        std::str::from_utf8(&self.payload)
            .map_err(|_| TransferError::Protocol("path payload is not valid UTF-8".into()))
    }

    /// Payload interpreted as an 8-byte little-endian file size (FILE_SIZE).
    pub fn file_size(&self) -> Result<u64, TransferError> {
        if self.payload.len() != 8 {
            return Err(TransferError::Protocol(format!(
                "file size payload is {} bytes, want 8",
                self.payload.len()
            )));
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.payload);
        Ok(u64::from_le_bytes(bytes))
    }
}

/// Write one packet: header then payload. An empty payload is a valid
/// control-only packet.
pub fn send_packet<W: Write>(
    stream: &mut W,
    payload: &[u8],
    flag_bits: u32,
) -> Result<(), TransferError> {
    let mut hdr = [0u8; HEADER_SIZE];
    hdr[0..4].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    hdr[4..8].copy_from_slice(&flag_bits.to_le_bytes());
    write_full(stream, &hdr)?;
    write_full(stream, payload)?;
    Ok(())
}

/// Read one packet. A would-block condition before any header byte arrives
/// is `NoPacket` ("nothing yet, retry"), never a fabricated empty packet.
/// End-of-stream inside the header or payload is `TruncatedPacket`.
pub fn read_packet<R: Read>(stream: &mut R) -> Result<Packet, TransferError> {
    let mut hdr = [0u8; HEADER_SIZE];
    let mut got = 0usize;
    while got < HEADER_SIZE {
        match stream.read(&mut hdr[got..]) {
            Ok(0) => return Err(TransferError::TruncatedPacket),
            Ok(n) => got += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if got == 0 {
                    return Err(TransferError::NoPacket);
                }
                // Mid-header: the peer has committed to a packet, spin it in
                thread::sleep(Duration::from_millis(timeouts::POLL_MS));
            }
            Err(e) => return Err(TransferError::Io(e)),
        }
    }

    let size = u32::from_le_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]) as usize;
    let flag_bits = u32::from_le_bytes([hdr[4], hdr[5], hdr[6], hdr[7]]);
    if size > MAX_PACKET_SIZE {
        return Err(TransferError::Protocol(format!(
            "packet payload too large: {} bytes (max {})",
            size, MAX_PACKET_SIZE
        )));
    }

    let mut payload = vec![0u8; size];
    read_full(stream, &mut payload)?;
    Ok(Packet {
        flags: flag_bits,
        payload,
    })
}

/// Like `read_packet`, but retries the not-ready case for callers that sit
/// on a non-blocking stream waiting for the next protocol step.
pub fn read_packet_blocking<R: Read>(stream: &mut R) -> Result<Packet, TransferError> {
    loop {
        match read_packet(stream) {
            Err(TransferError::NoPacket) => {
                thread::sleep(Duration::from_millis(timeouts::POLL_MS))
            }
            other => return other,
        }
    }
}

fn write_full<W: Write>(stream: &mut W, mut buf: &[u8]) -> Result<(), TransferError> {
    while !buf.is_empty() {
        match stream.write(buf) {
            Ok(0) => {
                return Err(TransferError::Io(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "stream refused further bytes",
                )))
            }
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(timeouts::POLL_MS))
            }
            Err(e) => return Err(TransferError::Io(e)),
        }
    }
    Ok(())
}

fn read_full<R: Read>(stream: &mut R, buf: &mut [u8]) -> Result<(), TransferError> {
    let mut got = 0usize;
    while got < buf.len() {
        match stream.read(&mut buf[got..]) {
            Ok(0) => return Err(TransferError::TruncatedPacket),
            Ok(n) => got += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(timeouts::POLL_MS))
            }
            Err(e) => return Err(TransferError::Io(e)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::flags;
    use std::io::Cursor;

    #[test]
    fn test_round_trip() {
        let mut wire = Vec::new();
        send_packet(&mut wire, b"dir/file.txt", flags::FILE_TYPE).unwrap();

        let packet = read_packet(&mut Cursor::new(wire)).unwrap();
        assert_eq!(packet.flags, flags::FILE_TYPE);
        assert_eq!(packet.payload, b"dir/file.txt");
        assert_eq!(packet.path().unwrap(), "dir/file.txt");
    }

    #[test]
    fn test_round_trip_empty_payload() {
        let mut wire = Vec::new();
        send_packet(
            &mut wire,
            &[],
            flags::START_TRANSFER | flags::SEND_OPERATION,
        )
        .unwrap();
        assert_eq!(wire.len(), HEADER_SIZE);

        let packet = read_packet(&mut Cursor::new(wire)).unwrap();
        assert!(packet.has(flags::START_TRANSFER));
        assert!(packet.has(flags::SEND_OPERATION));
        assert!(!packet.has(flags::RECEIVE_OPERATION));
        assert!(packet.payload.is_empty());
    }

    #[test]
    fn test_truncated_payload() {
        let mut wire = Vec::new();
        send_packet(&mut wire, b"abcdef", flags::DIR_TYPE).unwrap();
        wire.truncate(HEADER_SIZE + 3);

        let err = read_packet(&mut Cursor::new(wire)).unwrap_err();
        assert!(matches!(err, TransferError::TruncatedPacket));
    }

    #[test]
    fn test_truncated_header() {
        let wire = vec![0u8; 3];
        let err = read_packet(&mut Cursor::new(wire)).unwrap_err();
        assert!(matches!(err, TransferError::TruncatedPacket));
    }

    #[test]
    fn test_oversized_header_rejected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&((MAX_PACKET_SIZE as u32) + 1).to_le_bytes());
        wire.extend_from_slice(&flags::DIR_TYPE.to_le_bytes());

        let err = read_packet(&mut Cursor::new(wire)).unwrap_err();
        assert!(matches!(err, TransferError::Protocol(_)));
    }

    #[test]
    fn test_file_size_payload() {
        let mut wire = Vec::new();
        send_packet(
            &mut wire,
            &1_234_567_890u64.to_le_bytes(),
            flags::FILE_TYPE | flags::FILE_SIZE,
        )
        .unwrap();

        let packet = read_packet(&mut Cursor::new(wire)).unwrap();
        assert!(packet.has(flags::FILE_SIZE));
        assert_eq!(packet.file_size().unwrap(), 1_234_567_890);
    }

    #[test]
    fn test_file_size_wrong_length() {
        let packet = Packet {
            flags: flags::FILE_TYPE | flags::FILE_SIZE,
            payload: vec![0u8; 4],
        };
        assert!(matches!(
            packet.file_size().unwrap_err(),
            TransferError::Protocol(_)
        ));
    }

    #[test]
    fn test_path_invalid_utf8() {
        let packet = Packet {
            flags: flags::DIR_TYPE,
            payload: vec![0xff, 0xfe, 0x80],
        };
        assert!(matches!(
            packet.path().unwrap_err(),
            TransferError::Protocol(_)
        ));
    }
}
