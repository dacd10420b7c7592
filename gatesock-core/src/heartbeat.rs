//! Application-level heartbeat packets.
//!
//! A heartbeat is an 18-byte packet carried inside ordinary data payloads
//! (WebSocket binary frames, raw TCP reads, UDP datagrams). The framing layer
//! never sees it as anything special; it is recognised purely by content.
//!
//! ```text
//!  0               4               8                              16      18
//! +---------------+---------------+-------------------------------+-------+
//! | FE FD FC FB   | 'W' 'B' 'H' 'T'| epoch millis (i64, LE)       | csum  |
//! +---------------+---------------+-------------------------------+-------+
//! ```
//!
//! The checksum is the one's complement of the 16-bit folded byte sum of the
//! first 16 bytes, stored little-endian. A payload is a heartbeat only when the
//! magic matches *and* the checksum verifies.
//!
//! # Examples
//!
//! ```
//! use gatesock_core::heartbeat;
//!
//! let packet = heartbeat::create_heartbeat_packet_at(1_700_000_000_123);
//! assert!(heartbeat::is_heartbeat_packet(&packet));
//! assert_eq!(heartbeat::extract_timestamp(&packet), Some(1_700_000_000_123));
//!
//! // Windows into larger buffers work the same way.
//! let mut buffer = vec![0u8; 4];
//! buffer.extend_from_slice(&packet);
//! assert!(heartbeat::is_heartbeat_packet(&buffer[4..]));
//! ```

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Magic marker: four sentinel bytes followed by ASCII `WBHT`.
pub const HEARTBEAT_MAGIC: [u8; 8] = [0xFE, 0xFD, 0xFC, 0xFB, b'W', b'B', b'H', b'T'];

/// Total packet length.
pub const HEARTBEAT_LEN: usize = 18;

const TIMESTAMP_OFFSET: usize = 8;
const CHECKSUM_OFFSET: usize = 16;

/// Creates a heartbeat stamped with the current wall-clock time.
pub fn create_heartbeat_packet() -> [u8; HEARTBEAT_LEN] {
    create_heartbeat_packet_at(now_millis())
}

/// Creates a heartbeat carrying `timestamp_ms`.
pub fn create_heartbeat_packet_at(timestamp_ms: i64) -> [u8; HEARTBEAT_LEN] {
    let mut packet = [0u8; HEARTBEAT_LEN];
    packet[..TIMESTAMP_OFFSET].copy_from_slice(&HEARTBEAT_MAGIC);
    packet[TIMESTAMP_OFFSET..CHECKSUM_OFFSET].copy_from_slice(&timestamp_ms.to_le_bytes());
    let sum = checksum(&packet[..CHECKSUM_OFFSET]);
    packet[CHECKSUM_OFFSET..].copy_from_slice(&sum.to_le_bytes());
    packet
}

/// Returns `true` if `window` starts with a valid heartbeat packet.
///
/// Only the first [`HEARTBEAT_LEN`] bytes are inspected.
pub fn is_heartbeat_packet(window: &[u8]) -> bool {
    if window.len() < HEARTBEAT_LEN || window[..TIMESTAMP_OFFSET] != HEARTBEAT_MAGIC {
        return false;
    }

    let stored = u16::from_le_bytes([window[CHECKSUM_OFFSET], window[CHECKSUM_OFFSET + 1]]);
    checksum(&window[..CHECKSUM_OFFSET]) == stored
}

/// Reads the timestamp without verifying the packet.
///
/// Callers validate with [`is_heartbeat_packet`] first. Returns `None` only
/// when the window is too short to hold a timestamp.
pub fn extract_timestamp(window: &[u8]) -> Option<i64> {
    let bytes = window.get(TIMESTAMP_OFFSET..CHECKSUM_OFFSET)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Some(i64::from_le_bytes(raw))
}

/// One's complement of the folded 16-bit sum of `bytes`.
pub fn checksum(bytes: &[u8]) -> u16 {
    let mut sum: u32 = bytes
        .iter()
        .fold(0u32, |acc, &b| acc.wrapping_add(u32::from(b)));
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Keep-alive bookkeeping for one session.
///
/// Any inbound traffic refreshes the idle clock; heartbeats additionally record
/// the peer's timestamp.
#[derive(Debug, Clone)]
pub struct KeepAlive {
    last_seen: Instant,
    last_peer_timestamp: Option<i64>,
    heartbeats_received: u64,
}

impl KeepAlive {
    /// Starts the idle clock now.
    pub fn new() -> Self {
        Self {
            last_seen: Instant::now(),
            last_peer_timestamp: None,
            heartbeats_received: 0,
        }
    }

    /// Records non-heartbeat traffic.
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Records a verified heartbeat and returns its timestamp.
    pub fn record_heartbeat(&mut self, packet: &[u8]) -> Option<i64> {
        self.touch();
        self.heartbeats_received += 1;
        let timestamp = extract_timestamp(packet);
        if timestamp.is_some() {
            self.last_peer_timestamp = timestamp;
        }
        timestamp
    }

    /// Time since the last inbound traffic.
    pub fn idle_for(&self) -> Duration {
        self.last_seen.elapsed()
    }

    /// Whether the session has been silent for longer than `timeout`.
    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.idle_for() > timeout
    }

    /// Timestamp carried by the most recent heartbeat.
    pub fn last_peer_timestamp(&self) -> Option<i64> {
        self.last_peer_timestamp
    }

    /// Number of heartbeats seen so far.
    pub fn heartbeats_received(&self) -> u64 {
        self.heartbeats_received
    }
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_buffers_are_never_heartbeats() {
        let packet = create_heartbeat_packet();
        for len in 0..HEARTBEAT_LEN {
            assert!(!is_heartbeat_packet(&packet[..len]), "len {}", len);
        }
    }

    #[test]
    fn test_created_packets_verify() {
        for ts in [0, 1, -1, i64::MIN, i64::MAX, 1_700_000_000_000] {
            let packet = create_heartbeat_packet_at(ts);
            assert!(is_heartbeat_packet(&packet));
            assert_eq!(extract_timestamp(&packet), Some(ts));
        }
        assert!(is_heartbeat_packet(&create_heartbeat_packet()));
    }

    #[test]
    fn test_current_timestamp_is_millis() {
        let before = now_millis();
        let packet = create_heartbeat_packet();
        let after = now_millis();
        let ts = extract_timestamp(&packet).unwrap();
        assert!(before <= ts && ts <= after);
    }

    #[test]
    fn test_layout() {
        let packet = create_heartbeat_packet_at(0x0102_0304_0506_0708);
        assert_eq!(&packet[..4], &[0xFE, 0xFD, 0xFC, 0xFB]);
        assert_eq!(&packet[4..8], b"WBHT");
        assert_eq!(&packet[8..16], &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
        let stored = u16::from_le_bytes([packet[16], packet[17]]);
        assert_eq!(stored, checksum(&packet[..16]));
    }

    #[test]
    fn test_single_bit_flips_are_rejected() {
        let packet = create_heartbeat_packet_at(1_234_567_890_123);
        let original_sum = checksum(&packet[..16]);
        let mut undetectable = 0;

        for byte in 0..HEARTBEAT_LEN {
            for bit in 0..8 {
                let mut mutated = packet;
                mutated[byte] ^= 1 << bit;

                // Oracle: a flip inside the summed range that leaves the folded
                // sum unchanged cannot be caught by the checksum.
                let blind = (8..16).contains(&byte) && checksum(&mutated[..16]) == original_sum;
                if blind {
                    undetectable += 1;
                    continue;
                }
                assert!(
                    !is_heartbeat_packet(&mutated),
                    "flip of bit {} in byte {} accepted",
                    bit,
                    byte
                );
            }
        }

        // The byte sum of 16 bytes never wraps, so every flip changes it.
        assert_eq!(undetectable, 0);
    }

    #[test]
    fn test_magic_alone_is_not_enough() {
        let mut lookalike = [0u8; HEARTBEAT_LEN];
        lookalike[..8].copy_from_slice(&HEARTBEAT_MAGIC);
        lookalike[16] = 0x12;
        lookalike[17] = 0x34;
        assert!(!is_heartbeat_packet(&lookalike));
    }

    #[test]
    fn test_trailing_bytes_are_ignored() {
        let mut buffer = create_heartbeat_packet_at(42).to_vec();
        buffer.extend_from_slice(b"trailing application bytes");
        assert!(is_heartbeat_packet(&buffer));
        assert!(!is_heartbeat_packet(&buffer[1..]));
    }

    #[test]
    fn test_checksum_folding() {
        assert_eq!(checksum(&[]), 0xFFFF);
        assert_eq!(checksum(&[0xFF, 0x01]), !0x0100);
        // 0x1FFFE folds to 0xFFFF, complemented to zero.
        let bytes = vec![0xFFu8; 514];
        let sum: u32 = 514 * 0xFF;
        let folded = (sum & 0xFFFF) + (sum >> 16);
        assert_eq!(checksum(&bytes), !(folded as u16));
    }

    #[test]
    fn test_extract_timestamp_short_window() {
        assert_eq!(extract_timestamp(&[0u8; 15]), None);
        assert_eq!(extract_timestamp(&[0u8; 16]), Some(0));
    }

    #[test]
    fn test_keep_alive_records_heartbeats() {
        let mut keep_alive = KeepAlive::new();
        assert_eq!(keep_alive.heartbeats_received(), 0);
        assert_eq!(keep_alive.last_peer_timestamp(), None);

        let packet = create_heartbeat_packet_at(99);
        assert_eq!(keep_alive.record_heartbeat(&packet), Some(99));
        assert_eq!(keep_alive.heartbeats_received(), 1);
        assert_eq!(keep_alive.last_peer_timestamp(), Some(99));
        assert!(!keep_alive.is_expired(Duration::from_secs(60)));
    }
}
