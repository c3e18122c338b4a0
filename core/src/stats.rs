//! Statistics snapshots (§3 `JitterCore` statistics field, §6 "statistics
//! accessors"). Grounded on the teacher's `Channel::state()` /
//! `Mixer::get_state()` convention: a plain, cloneable struct read out of a
//! lock-guarded counter set, never the counters themselves.

/// Per-stream counters maintained by a [`crate::jitter::JitterCore`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct JitterStats {
    pub received: u64,
    pub lost: u64,
    pub late: u64,
    pub reordered: u64,
    pub underrun: u64,
    pub overrun: u64,
    pub avg_jitter_ms: f64,
    pub loss_rate: f64,
}

/// Aggregate view of the [`crate::mixer::Mixer`]'s stream table.
#[derive(Debug, Clone, Default)]
pub struct MixerStats {
    pub active_streams: usize,
    pub per_stream: Vec<(u32, JitterStats)>,
}
