// ids.rs - UUIDv7 generation with intra-millisecond monotonicity

use std::sync::Mutex;

use rand::RngCore;
use uuid::Uuid;

/// Tracks the last millisecond we minted an id for and a counter within that
/// millisecond, so that ids generated in rapid succession — or across a
/// backward clock step — stay strictly increasing.
struct MonotonicState {
    last_millis: u64,
    counter: u16,
}

static STATE: Mutex<MonotonicState> = Mutex::new(MonotonicState {
    last_millis: 0,
    counter: 0,
});

/// Generates a new UUIDv7: the high 48 bits are a monotonic UNIX millisecond
/// timestamp, the next 12 bits are a per-millisecond counter, and the
/// remaining bits are random entropy. Ids minted in the same millisecond, or
/// while the system clock briefly steps backward, still sort strictly after
/// the previous one.
pub fn new_uuid_v7() -> Uuid {
    let observed_millis = chrono::Utc::now().timestamp_millis().max(0) as u64;

    let (millis, counter) = {
        let mut state = STATE.lock().expect("id generator mutex poisoned");
        if observed_millis > state.last_millis {
            state.last_millis = observed_millis;
            state.counter = 0;
        } else {
            // Clock did not advance (or went backward): keep the
            // timestamp pinned and bump the counter instead.
            state.counter = state.counter.wrapping_add(1) & 0x0FFF;
        }
        (state.last_millis, state.counter)
    };

    let mut rand_bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut rand_bytes);

    build_uuid_v7(millis, counter, rand_bytes)
}

fn build_uuid_v7(millis: u64, counter12: u16, rand_bytes: [u8; 8]) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes[0..6].copy_from_slice(&millis.to_be_bytes()[2..8]);
    // byte 6: version nibble (0111) followed by the counter's top 4 bits.
    bytes[6] = 0x70 | (((counter12 >> 8) & 0x0F) as u8);
    // byte 7: the counter's low 8 bits.
    bytes[7] = (counter12 & 0xFF) as u8;
    // byte 8: RFC 4122 variant bits (10) followed by random entropy.
    bytes[8] = 0x80 | (rand_bytes[0] & 0x3F);
    bytes[9..16].copy_from_slice(&rand_bytes[1..8]);
    Uuid::from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_strictly_increasing() {
        let mut ids = Vec::new();
        for _ in 0..200 {
            ids.push(new_uuid_v7());
        }
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1], "ids must be strictly increasing");
        }
    }

    #[test]
    fn version_and_variant_bits_are_set() {
        let id = new_uuid_v7();
        assert_eq!(id.get_version_num(), 7);
        assert_eq!(id.as_bytes()[8] >> 6, 0b10);
    }
}
