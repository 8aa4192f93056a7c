//! Trace identifier generation.
//!
//! # Layout
//! ```text
//! 10 bytes, rendered as 20 lowercase hex chars:
//!   [0..5)  milliseconds since the Unix epoch (wraps after ~34 years)
//!   [5..8)  machine id: crc32(interface names + hardware addresses + random) & 0xFFFFFF
//!   [8..10) low 16 bits of a process-wide counter seeded with a random 31-bit value
//! ```
//!
//! # Design Decisions
//! - No coordination service: machine id + counter make ids collision resistant
//! - Only the counter is shared state, and it is a single atomic increment
//! - Sortable by creation time to millisecond resolution
//! - More than 65536 ids within one millisecond wrap the counter silently;
//!   ordering inside that millisecond is then no longer guaranteed

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::LazyLock;

use chrono::Utc;
use rand::Rng;

/// Length in hex characters of every generated id.
pub const ID_LEN: usize = 20;

static MACHINE_ID: LazyLock<u32> = LazyLock::new(machine_id);

static COUNTER: LazyLock<AtomicU32> =
    LazyLock::new(|| AtomicU32::new(rand::thread_rng().gen_range(0..i32::MAX as u32)));

/// Generate a new time-ordered trace id.
pub fn next_id() -> String {
    let millis = Utc::now().timestamp_millis() as u64;
    let count = COUNTER.fetch_add(1, Ordering::Relaxed) & 0x00FF_FFFF;
    encode(millis, *MACHINE_ID, count)
}

fn encode(millis: u64, machine: u32, count: u32) -> String {
    let bytes: [u8; 10] = [
        (millis >> 32) as u8,
        (millis >> 24) as u8,
        (millis >> 16) as u8,
        (millis >> 8) as u8,
        millis as u8,
        (machine >> 16) as u8,
        (machine >> 8) as u8,
        machine as u8,
        (count >> 8) as u8,
        count as u8,
    ];

    let mut id = String::with_capacity(ID_LEN);
    for b in bytes {
        let _ = write!(id, "{:02x}", b);
    }
    id
}

/// Derive the 24-bit machine identifier.
fn machine_id() -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for (name, address) in interfaces() {
        hasher.update(name.as_bytes());
        hasher.update(address.as_bytes());
    }
    if let Ok(host) = std::env::var("HOSTNAME") {
        hasher.update(host.as_bytes());
    }
    let salt: u32 = rand::thread_rng().gen();
    hasher.update(salt.to_string().as_bytes());
    hasher.finalize() & 0x00FF_FFFF
}

/// Enumerate `(name, hardware address)` for every local network interface.
#[cfg(target_os = "linux")]
fn interfaces() -> Vec<(String, String)> {
    let Ok(entries) = std::fs::read_dir("/sys/class/net") else {
        return Vec::new();
    };

    let mut found: Vec<(String, String)> = entries
        .filter_map(Result::ok)
        .map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            let address = std::fs::read_to_string(entry.path().join("address"))
                .map(|s| s.trim().to_string())
                .unwrap_or_default();
            (name, address)
        })
        .collect();
    found.sort();
    found
}

#[cfg(not(target_os = "linux"))]
fn interfaces() -> Vec<(String, String)> {
    Vec::new()
}

/// Extract the millisecond timestamp encoded in the first 5 bytes of `id`.
pub fn timestamp_millis(id: &str) -> Option<u64> {
    if id.len() != ID_LEN {
        return None;
    }
    u64::from_str_radix(&id[..10], 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_id_is_twenty_hex_chars() {
        let id = next_id();
        assert_eq!(id.len(), ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_encode_layout() {
        let id = encode(0x01_0203_0405, 0x00AB_CDEF, 0x1234);
        assert_eq!(id, "0102030405abcdef1234");
        assert_eq!(timestamp_millis(&id), Some(0x01_0203_0405));
    }

    #[test]
    fn test_ids_increase_once_millisecond_advances() {
        let first = next_id();
        std::thread::sleep(std::time::Duration::from_millis(3));
        let second = next_id();
        assert!(timestamp_millis(&second) > timestamp_millis(&first));
        assert!(second[..10] > first[..10]);
    }

    #[test]
    fn test_machine_id_is_stable_within_process() {
        let a = next_id();
        let b = next_id();
        assert_eq!(a[10..16], b[10..16]);
    }

    #[test]
    fn test_concurrent_ids_are_unique() {
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| (0..8192).map(|_| next_id()).collect::<Vec<_>>()))
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id generated");
            }
        }
        assert_eq!(seen.len(), 65536);
    }
}
