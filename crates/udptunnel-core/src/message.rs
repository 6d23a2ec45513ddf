//! Relayed message and correlation ID allocation.

use std::fmt::{self, Write};
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_ID: AtomicU32 = AtomicU32::new(0);

/// A payload tagged with the correlation ID that pairs a request with its replies.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    pub id: u32,
    pub payload: Vec<u8>,
}

impl Message {
    pub const fn new(id: u32, payload: Vec<u8>) -> Self {
        Self { id, payload }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("len", &self.payload.len())
            .finish()
    }
}

/// Allocate the next process-wide correlation ID.
///
/// IDs increase monotonically and wrap at 32 bits. Uniqueness only matters
/// among requests that are outstanding at the same time.
pub fn next_id() -> u32 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
}

/// Render a payload as a hex dump for debug logging.
pub fn hex_dump(payload: &[u8]) -> String {
    let mut out = String::with_capacity(payload.len() * 3 + payload.len() / 16 * 10);
    for (row, chunk) in payload.chunks(16).enumerate() {
        if row > 0 {
            out.push('\n');
        }
        let _ = write!(out, "{:08x} ", row * 16);
        for byte in chunk {
            let _ = write!(out, " {byte:02x}");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_increasing() {
        let a = next_id();
        let b = next_id();
        assert_ne!(a, b);
        assert!(b.wrapping_sub(a) >= 1);
    }

    #[test]
    fn debug_omits_payload_bytes() {
        let msg = Message::new(7, vec![0xaa; 32]);
        let rendered = format!("{msg:?}");
        assert!(rendered.contains("id: 7"));
        assert!(rendered.contains("len: 32"));
    }

    #[test]
    fn hex_dump_rows() {
        let dump = hex_dump(&(0u8..18).collect::<Vec<_>>());
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("00000000  00 01 02"));
        assert_eq!(lines[1], "00000010  10 11");
    }
}
