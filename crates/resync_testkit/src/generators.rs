//! Property-based test generators using proptest.

use proptest::prelude::*;
use resync_engine::EngineConfig;
use std::time::Duration;

/// Strategy for valid record keys.
pub fn record_key_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,15}").expect("Invalid regex")
}

/// Strategy for keys drawn from a small pool, so writes collide.
pub fn colliding_key_strategy() -> impl Strategy<Value = String> {
    (0u8..4).prop_map(|i| format!("progress_{i}"))
}

/// Strategy for opaque payloads.
pub fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..64)
}

/// Strategy for a sequence of writes over colliding keys.
pub fn write_sequence_strategy(max_len: usize) -> impl Strategy<Value = Vec<(String, Vec<u8>)>> {
    prop::collection::vec((colliding_key_strategy(), payload_strategy()), 1..max_len)
}

/// Strategy for backoff settings with `base <= max`.
pub fn backoff_config_strategy() -> impl Strategy<Value = EngineConfig> {
    (1u64..5_000, 1u64..120_000, 0u32..8).prop_map(|(base, extra, retries)| {
        EngineConfig::default()
            .with_base_delay(Duration::from_millis(base))
            .with_max_delay(Duration::from_millis(base + extra))
            .with_max_retries(retries)
    })
}

/// Strategy for batch job priorities.
pub fn priority_strategy() -> impl Strategy<Value = i64> {
    -3i64..=3
}
