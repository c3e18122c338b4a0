//! Per-source jitter buffer (§3 `JitterSlot`/`JitterCore`, §4.4).
//!
//! One [`JitterCore`] absorbs jitter for exactly one remote SSRC: it
//! reorders packets into a fixed 16-slot ring, feeds the codec's decode and
//! conceal entry points, and tracks an RFC 3550-style jitter estimate.
//! Grounded on the teacher's `network_audio::rtp::JitterBuffer`
//! (`server/src/network_audio/rtp.rs`), generalized from its flat
//! sample-ring model to the spec's slotted, sequence-aware ring — the
//! teacher's buffer has no concept of sequence numbers or concealment,
//! since AES67/PTP assumes a synchronized, effectively lossless LAN.
//!
//! The "faster" startup variant is authoritative here (§9 Open Questions):
//! `get` never waits for `target_delay_ms` before emitting.

use std::time::Instant;

use lanvoice_protocol::rtp::{seq_distance, RtpHeader};
use parking_lot::Mutex;

use crate::codec::Decoder;
use crate::stats::JitterStats;
use crate::SAMPLES_PER_FRAME;

pub const RING_SIZE: usize = 16;

/// A distance below this many slots behind `next_seq` is too old to place
/// in the ring at all (§4.4 `Put`).
const LATE_THRESHOLD: i32 = -8;

/// Tuning knobs for a jitter core. `target_delay_ms` and `max_delay_ms` are
/// carried for a conservative startup policy some deployments may want
/// (§9 Open Questions); the default `get` path ignores them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JitterConfig {
    pub min_delay_ms: u32,
    pub target_delay_ms: u32,
    pub max_delay_ms: u32,
    pub adaptive: bool,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 20,
            target_delay_ms: 60,
            max_delay_ms: 200,
            adaptive: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Empty,
    Filled,
    Decoded,
}

struct JitterSlot {
    state: SlotState,
    sequence: u16,
    timestamp: u32,
    ssrc: u32,
    payload: Vec<u8>,
    pcm: [i16; SAMPLES_PER_FRAME],
    pcm_len: usize,
}

impl JitterSlot {
    fn empty() -> Self {
        Self {
            state: SlotState::Empty,
            sequence: 0,
            timestamp: 0,
            ssrc: 0,
            payload: Vec::new(),
            pcm: [0; SAMPLES_PER_FRAME],
            pcm_len: 0,
        }
    }
}

/// Outcome of a single [`JitterCore::put`] call, surfaced mainly for tests
/// (§8 reorder/loss/late scenarios).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Accepted,
    Duplicate,
    Late,
    Overrun,
}

struct Inner {
    config: JitterConfig,
    slots: [JitterSlot; RING_SIZE],
    head: usize,
    next_seq: u16,
    seq_initialized: bool,
    max_seq: u16,
    count: usize,
    jitter_ema_ms: f64,
    last_recv_time: Option<Instant>,
    last_timestamp: u32,
    stats: JitterStats,
    decoder: Box<dyn Decoder>,
}

/// One per remote SSRC (§3). The whole structure is guarded by a single
/// internal mutex, per spec — callers reach it through `&self`, never
/// needing an external lock of their own.
pub struct JitterCore {
    inner: Mutex<Inner>,
}

impl JitterCore {
    pub fn new(config: JitterConfig, decoder: Box<dyn Decoder>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                config,
                slots: std::array::from_fn(|_| JitterSlot::empty()),
                head: 0,
                next_seq: 0,
                seq_initialized: false,
                max_seq: 0,
                count: 0,
                jitter_ema_ms: 0.0,
                last_recv_time: None,
                last_timestamp: 0,
                stats: JitterStats::default(),
                decoder,
            }),
        }
    }

    pub fn config(&self) -> JitterConfig {
        self.inner.lock().config
    }

    /// Places `payload` into the ring according to `header.sequence`,
    /// updating the jitter estimate from arrival/timestamp deltas (§4.4).
    pub fn put(&self, header: &RtpHeader, payload: &[u8]) -> PutOutcome {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        if let Some(last_recv) = inner.last_recv_time {
            let delta_recv_ms = now.duration_since(last_recv).as_secs_f64() * 1000.0;
            let delta_ts_ticks = header.timestamp.wrapping_sub(inner.last_timestamp) as i32;
            let delta_ts_ms = delta_ts_ticks as f64 * 1000.0 / crate::SAMPLE_RATE_HZ as f64;
            let sample = (delta_recv_ms - delta_ts_ms).abs();
            inner.jitter_ema_ms += (sample - inner.jitter_ema_ms) / 16.0;
        }
        inner.last_recv_time = Some(now);
        inner.last_timestamp = header.timestamp;

        if !inner.seq_initialized {
            inner.next_seq = header.sequence;
            inner.max_seq = header.sequence;
            inner.seq_initialized = true;
        }

        let distance = seq_distance(header.sequence, inner.next_seq);
        if distance < LATE_THRESHOLD {
            inner.stats.late += 1;
            return PutOutcome::Late;
        }
        if distance >= RING_SIZE as i32 {
            inner.stats.overrun += 1;
            return PutOutcome::Overrun;
        }

        let idx = (inner.head as i32 + distance).rem_euclid(RING_SIZE as i32) as usize;

        if inner.slots[idx].state != SlotState::Empty && inner.slots[idx].sequence == header.sequence {
            return PutOutcome::Duplicate;
        }

        if seq_distance(header.sequence, inner.max_seq) < 0 {
            inner.stats.reordered += 1;
        } else {
            inner.max_seq = header.sequence;
        }

        let was_empty = inner.slots[idx].state == SlotState::Empty;
        inner.slots[idx] = JitterSlot {
            state: SlotState::Filled,
            sequence: header.sequence,
            timestamp: header.timestamp,
            ssrc: header.ssrc,
            payload: payload.to_vec(),
            pcm: [0; SAMPLES_PER_FRAME],
            pcm_len: 0,
        };
        if was_empty {
            inner.count += 1;
        }
        inner.stats.received += 1;
        PutOutcome::Accepted
    }

    /// Pulls the next frame in sequence order, decoding or concealing as
    /// needed, and advances the ring by one slot (§4.4 `Get`).
    pub fn get(&self, out: &mut [i16; SAMPLES_PER_FRAME]) -> usize {
        let mut inner = self.inner.lock();
        if !inner.seq_initialized {
            return 0;
        }

        let head = inner.head;
        let initial_state = inner.slots[head].state;

        if initial_state == SlotState::Filled {
            let payload = std::mem::take(&mut inner.slots[head].payload);
            let mut pcm = [0i16; SAMPLES_PER_FRAME];
            match inner.decoder.decode(&payload, &mut pcm) {
                Some(n) => {
                    inner.slots[head].pcm[..n].copy_from_slice(&pcm[..n]);
                    inner.slots[head].pcm_len = n;
                    inner.slots[head].state = SlotState::Decoded;
                }
                None => {
                    inner.stats.lost += 1;
                    inner.slots[head].state = SlotState::Empty;
                }
            }
        }

        let produced = match inner.slots[head].state {
            SlotState::Empty => {
                if initial_state == SlotState::Empty {
                    inner.stats.underrun += 1;
                    inner.stats.lost += 1;
                }
                inner.decoder.conceal(out)
            }
            SlotState::Decoded => {
                let n = inner.slots[head].pcm_len;
                out[..n].copy_from_slice(&inner.slots[head].pcm[..n]);
                n
            }
            SlotState::Filled => unreachable!("decoded above"),
        };

        if initial_state != SlotState::Empty {
            inner.count -= 1;
        }
        inner.slots[head] = JitterSlot::empty();
        inner.head = (head + 1) % RING_SIZE;
        inner.next_seq = inner.next_seq.wrapping_add(1);

        let total = inner.stats.lost + inner.stats.received;
        inner.stats.loss_rate = if total > 0 {
            inner.stats.lost as f64 / total as f64
        } else {
            0.0
        };
        inner.stats.avg_jitter_ms = inner.jitter_ema_ms;

        produced
    }

    pub fn stats(&self) -> JitterStats {
        self.inner.lock().stats
    }

    /// Number of slots currently holding an un-consumed packet (§3 `count`).
    pub fn occupancy(&self) -> usize {
        self.inner.lock().count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PcmPassthroughCodec;

    fn core() -> JitterCore {
        JitterCore::new(JitterConfig::default(), Box::new(PcmPassthroughCodec))
    }

    fn header(seq: u16, ts: u32) -> RtpHeader {
        RtpHeader {
            version: 2,
            payload_type: 0,
            sequence: seq,
            timestamp: ts,
            ssrc: 1,
            payload_length: 0,
            flags: 0,
        }
    }

    fn payload_for(value: i16) -> Vec<u8> {
        let pcm = [value; SAMPLES_PER_FRAME];
        let mut bytes = Vec::with_capacity(SAMPLES_PER_FRAME * 2);
        for s in pcm {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn in_order_delivery_round_trips() {
        let core = core();
        for seq in 0..5u16 {
            let outcome = core.put(&header(seq, seq as u32 * 960), &payload_for(seq as i16));
            assert_eq!(outcome, PutOutcome::Accepted);
        }
        let mut out = [0i16; SAMPLES_PER_FRAME];
        for seq in 0..5u16 {
            let n = core.get(&mut out);
            assert_eq!(n, SAMPLES_PER_FRAME);
            assert_eq!(out[0], seq as i16);
        }
        let stats = core.stats();
        assert_eq!(stats.received, 5);
        assert_eq!(stats.lost, 0);
    }

    #[test]
    fn reorder_is_delivered_in_sequence() {
        let core = core();
        for seq in [0u16, 2, 1, 3] {
            core.put(&header(seq, seq as u32 * 960), &payload_for(seq as i16));
        }
        let mut out = [0i16; SAMPLES_PER_FRAME];
        for expected in 0..4i16 {
            core.get(&mut out);
            assert_eq!(out[0], expected);
        }
        assert_eq!(core.stats().reordered, 1);
    }

    #[test]
    fn single_loss_produces_one_plc_frame() {
        let core = core();
        for seq in [0u16, 1, 2, 4, 5] {
            core.put(&header(seq, seq as u32 * 960), &payload_for(seq as i16));
        }
        let mut out = [0i16; SAMPLES_PER_FRAME];
        let mut concealed_at = None;
        for i in 0..5 {
            core.get(&mut out);
            if out[0] == 0 && i != 0 {
                concealed_at = Some(i);
            }
        }
        assert_eq!(concealed_at, Some(3));
        let stats = core.stats();
        assert_eq!(stats.lost, 1);
        assert!((stats.loss_rate - (1.0 / 6.0)).abs() < 1e-9);
    }

    #[test]
    fn late_packet_is_counted_not_reemitted() {
        let core = core();
        for seq in 0..=20u16 {
            core.put(&header(seq, seq as u32 * 960), &payload_for(seq as i16));
            let mut out = [0i16; SAMPLES_PER_FRAME];
            core.get(&mut out);
        }
        let outcome = core.put(&header(4, 4 * 960), &payload_for(4));
        assert_eq!(outcome, PutOutcome::Late);
        assert_eq!(core.stats().late, 1);
    }

    #[test]
    fn duplicate_packet_is_ignored() {
        let core = core();
        core.put(&header(0, 0), &payload_for(0));
        let outcome = core.put(&header(0, 0), &payload_for(0));
        assert_eq!(outcome, PutOutcome::Duplicate);
        assert_eq!(core.stats().received, 1);
    }

    #[test]
    fn never_primed_returns_zero() {
        let core = core();
        let mut out = [1i16; SAMPLES_PER_FRAME];
        assert_eq!(core.get(&mut out), 0);
    }

    #[test]
    fn overrun_packet_is_dropped_and_counted() {
        let core = core();
        core.put(&header(0, 0), &payload_for(0));
        let outcome = core.put(&header(40, 40 * 960), &payload_for(40));
        assert_eq!(outcome, PutOutcome::Overrun);
        assert_eq!(core.stats().overrun, 1);
    }
}
