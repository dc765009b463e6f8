//! Coordinator tuning. All durations are milliseconds; every field has a default so a
//! partial `[coordinator]` table in the daemon's config file is valid.

use serde::Deserialize;

use crate::integrity::DEFAULT_MAX_CORRUPT_FRAMES;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoordinatorConfig {
    /// Silence after which a node is considered disconnected.
    pub heartbeat_timeout_ms: i64,
    /// Cadence of clock synchronisation rounds per node.
    pub sync_interval_ms: i64,
    /// How long a sync request may stay unanswered.
    pub sync_reply_timeout_ms: i64,
    /// Samples with a round trip above this are kept for diagnostics only.
    pub rtt_ceiling_ms: i64,
    /// Number of accepted samples the smoothed offset is the median of.
    pub smoothing_window: usize,
    /// Bounded per-node measurement history.
    pub history_len: usize,
    /// Alignment tolerance across nodes; also scales the quality score.
    pub sync_tolerance_ms: f64,
    /// Consecutive intervals without a valid sample before quality drops to zero.
    pub max_missed_sync_intervals: u32,
    /// Lead time between the start command and the scheduled start.
    pub start_delay_ms: i64,
    /// Wait for stop acknowledgements before aggregating anyway.
    pub stop_timeout_ms: i64,
    /// Idle time allowed between file chunks.
    pub chunk_timeout_ms: i64,
    /// Corrupt frames tolerated before a channel is dropped.
    pub max_corrupt_frames: u32,
    /// A session left in configuring for longer than this is aborted.
    pub arm_timeout_ms: i64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 30_000,
            sync_interval_ms: 30_000,
            sync_reply_timeout_ms: 5_000,
            rtt_ceiling_ms: 100,
            smoothing_window: 5,
            history_len: 32,
            sync_tolerance_ms: 5.0,
            max_missed_sync_intervals: 3,
            start_delay_ms: 2_500,
            stop_timeout_ms: 10_000,
            chunk_timeout_ms: 30_000,
            max_corrupt_frames: DEFAULT_MAX_CORRUPT_FRAMES,
            arm_timeout_ms: 5 * 60_000,
        }
    }
}
