// Template id generation: `tmpl_<monotonic-ts>_<random>`.

use rand::Rng;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static LAST_TIMESTAMP_MS: AtomicI64 = AtomicI64::new(0);

/// Generates a new template id. The timestamp component is monotonic within
/// a process even if the wall clock goes backwards or two calls land in the
/// same millisecond, so ids remain lexically sortable by creation order.
pub fn generate_template_id() -> String {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_millis() as i64;

    let ts = loop {
        let last = LAST_TIMESTAMP_MS.load(Ordering::SeqCst);
        let candidate = now_ms.max(last + 1);
        if LAST_TIMESTAMP_MS
            .compare_exchange(last, candidate, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            break candidate;
        }
    };

    let suffix: String = {
        let mut rng = rand::thread_rng();
        (0..8)
            .map(|_| {
                const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
                CHARS[rng.gen_range(0..CHARS.len())] as char
            })
            .collect()
    };

    format!("tmpl_{ts}_{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_and_well_formed() {
        let a = generate_template_id();
        let b = generate_template_id();
        assert_ne!(a, b);
        assert!(a.starts_with("tmpl_"));
        assert_eq!(a.split('_').count(), 3);
    }

    #[test]
    fn timestamps_are_monotonic_under_rapid_calls() {
        let ids: Vec<i64> = (0..50)
            .map(|_| {
                let id = generate_template_id();
                id.split('_').nth(1).unwrap().parse().unwrap()
            })
            .collect();
        for pair in ids.windows(2) {
            assert!(pair[1] > pair[0]);
        }
    }
}
