//! Generation of push keys: 24-character, time-ordered, collision-safe
//! identifiers in the cuid style (timestamp + process counter + process
//! fingerprint + random tail).

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

static COUNTER: AtomicU32 = AtomicU32::new(0);

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn base36_fixed(mut n: u64, width: usize) -> String {
    let mut out = vec![b'0'; width];
    for slot in out.iter_mut().rev() {
        *slot = BASE36[(n % 36) as usize];
        n /= 36;
        if n == 0 {
            break;
        }
    }
    String::from_utf8(out).unwrap()
}

/// A new 24-character push key. Keys generated later sort later, which
/// keeps pushed children append-ordered under their parent.
pub fn generate_push_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed) % 36u32.pow(4);
    let fingerprint = std::process::id() as u64 % 36u64.pow(3);
    let mut rng = rand::thread_rng();
    let random: String = (0..8)
        .map(|_| BASE36[rng.gen_range(0..36)] as char)
        .collect();

    let mut id = String::with_capacity(24);
    id.push('c');
    id.push_str(&base36_fixed(now, 8));
    id.push_str(&base36_fixed(count as u64, 4));
    id.push_str(&base36_fixed(fingerprint, 3));
    id.push_str(&random);
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn keys_are_24_chars_and_unique() {
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let id = generate_push_id();
            assert_eq!(id.len(), 24);
            assert!(id.starts_with('c'));
            assert!(id.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn keys_sort_by_generation_time() {
        let a = generate_push_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = generate_push_id();
        assert!(a < b);
    }
}
