//! Multi-stream mixer (§3 `StreamTable`, §4.5).
//!
//! One [`JitterCore`] per remote SSRC, routed by a fixed-size stream table;
//! a periodic sweep evicts streams that have gone idle. `get_mixed` pulls
//! one frame from every active stream into a 32-bit accumulator and
//! soft-clips the sum back to `i16`.
//!
//! Grounded on the teacher's `mixer::Mixer` (`server/src/mixer/mod.rs`),
//! which holds a fixed `Vec<Channel>` behind one lock and exposes a single
//! `process()` summing pass; generalized here from statically-configured
//! input channels to dynamically-arriving SSRCs with LRU eviction, since
//! the teacher has no notion of a channel appearing or disappearing at
//! runtime.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lanvoice_protocol::rtp::RtpHeader;
use parking_lot::Mutex;

use crate::codec::Decoder;
use crate::jitter::{JitterConfig, JitterCore};
use crate::stats::{JitterStats, MixerStats};
use crate::SAMPLES_PER_FRAME;

pub const STREAM_TABLE_SIZE: usize = 16;

/// A stream with no traffic for this long is evicted on the next sweep
/// (§4.5).
const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// The sweep runs roughly once per 5 s of playback pulls, i.e. every 250
/// pulls at 50 fps / 20 ms frames (§4.5).
const GC_SWEEP_EVERY_PULLS: u32 = 250;

pub type DecoderFactory = Arc<dyn Fn() -> Box<dyn Decoder> + Send + Sync>;

struct StreamEntry {
    ssrc: u32,
    active: bool,
    last_active: Instant,
    core: Arc<JitterCore>,
}

/// Fixed-capacity table of per-SSRC jitter cores (§3 `StreamTable`).
pub struct Mixer {
    slots: Mutex<[Option<StreamEntry>; STREAM_TABLE_SIZE]>,
    decoder_factory: DecoderFactory,
    pulls_since_gc: AtomicU32,
}

impl Mixer {
    pub fn new(decoder_factory: DecoderFactory) -> Self {
        Self {
            slots: Mutex::new(std::array::from_fn(|_| None)),
            decoder_factory,
            pulls_since_gc: AtomicU32::new(0),
        }
    }

    /// Routes an inbound RTP packet to its SSRC's jitter core, allocating
    /// or evicting a slot as needed (§4.5 insertion policy).
    pub fn put(&self, header: &RtpHeader, payload: &[u8]) {
        let core = {
            let mut table = self.slots.lock();

            if let Some(entry) = table.iter_mut().flatten().find(|e| e.ssrc == header.ssrc) {
                entry.last_active = Instant::now();
                entry.active = true;
                entry.core.clone()
            } else {
                let empty_idx = table.iter().position(|s| s.is_none());
                let idx = match empty_idx {
                    Some(i) => i,
                    None => table
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, s)| s.as_ref().unwrap().last_active)
                        .map(|(i, _)| i)
                        .expect("stream table is never zero-length"),
                };

                let core = Arc::new(JitterCore::new(JitterConfig::default(), (self.decoder_factory)()));
                table[idx] = Some(StreamEntry {
                    ssrc: header.ssrc,
                    active: true,
                    last_active: Instant::now(),
                    core: core.clone(),
                });
                tracing::debug!(ssrc = header.ssrc, slot = idx, "mixer allocated stream slot");
                core
            }
        };

        core.put(header, payload);
    }

    /// Pulls one frame from every active stream and soft-clip mixes them
    /// down (§4.5 `GetMixed`).
    pub fn get_mixed(&self, out: &mut [i16; SAMPLES_PER_FRAME]) -> usize {
        let cores: Vec<Arc<JitterCore>> = {
            let table = self.slots.lock();
            table
                .iter()
                .flatten()
                .filter(|e| e.active)
                .map(|e| e.core.clone())
                .collect()
        };

        let mut acc = [0i32; SAMPLES_PER_FRAME];
        let mut max_len = 0usize;
        for core in &cores {
            let mut frame = [0i16; SAMPLES_PER_FRAME];
            let n = core.get(&mut frame);
            for i in 0..n {
                acc[i] += frame[i] as i32;
            }
            max_len = max_len.max(n);
        }

        for i in 0..max_len {
            out[i] = soft_clip(acc[i]);
        }

        if self.pulls_since_gc.fetch_add(1, Ordering::Relaxed) + 1 >= GC_SWEEP_EVERY_PULLS {
            self.pulls_since_gc.store(0, Ordering::Relaxed);
            self.gc();
        }

        max_len
    }

    /// Destroys and marks inactive any stream idle for longer than
    /// [`IDLE_TIMEOUT`] (§4.5).
    pub fn gc(&self) {
        let now = Instant::now();
        let mut table = self.slots.lock();
        for slot in table.iter_mut() {
            if let Some(entry) = slot {
                if now.duration_since(entry.last_active) > IDLE_TIMEOUT {
                    tracing::info!(ssrc = entry.ssrc, "evicting idle stream");
                    *slot = None;
                }
            }
        }
    }

    /// Clears every stream, for session reset on rejoin (§4.8 `JoinSession`
    /// resets the multi-stream mixer).
    pub fn reset(&self) {
        let mut table = self.slots.lock();
        for slot in table.iter_mut() {
            *slot = None;
        }
        self.pulls_since_gc.store(0, Ordering::Relaxed);
    }

    pub fn active_count(&self) -> usize {
        self.slots.lock().iter().flatten().filter(|e| e.active).count()
    }

    pub fn stats(&self) -> MixerStats {
        let table = self.slots.lock();
        let per_stream: Vec<(u32, JitterStats)> = table
            .iter()
            .flatten()
            .filter(|e| e.active)
            .map(|e| (e.ssrc, e.core.stats()))
            .collect();
        MixerStats {
            active_streams: per_stream.len(),
            per_stream,
        }
    }
}

/// 32-bit accumulator sum clamped into the `i16` range (§4.5).
fn soft_clip(sample: i32) -> i16 {
    sample.clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PcmPassthroughCodec;

    fn factory() -> DecoderFactory {
        Arc::new(|| Box::new(PcmPassthroughCodec) as Box<dyn Decoder>)
    }

    fn header(ssrc: u32, seq: u16) -> RtpHeader {
        RtpHeader {
            version: 2,
            payload_type: 0,
            sequence: seq,
            timestamp: seq as u32 * 960,
            ssrc,
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
    fn new_ssrc_creates_a_table_entry() {
        let mixer = Mixer::new(factory());
        mixer.put(&header(7, 0), &payload_for(100));
        assert_eq!(mixer.active_count(), 1);
    }

    #[test]
    fn two_talkers_mix_without_clipping() {
        let mixer = Mixer::new(factory());
        mixer.put(&header(1, 0), &payload_for(10_000));
        mixer.put(&header(2, 0), &payload_for(10_000));
        let mut out = [0i16; SAMPLES_PER_FRAME];
        let n = mixer.get_mixed(&mut out);
        assert_eq!(n, SAMPLES_PER_FRAME);
        assert_eq!(out[0], 20_000);
    }

    #[test]
    fn loud_talkers_soft_clip() {
        let mixer = Mixer::new(factory());
        mixer.put(&header(1, 0), &payload_for(30_000));
        mixer.put(&header(2, 0), &payload_for(30_000));
        let mut out = [0i16; SAMPLES_PER_FRAME];
        mixer.get_mixed(&mut out);
        assert_eq!(out[0], i16::MAX);
    }

    #[test]
    fn silent_mixer_returns_zero() {
        let mixer = Mixer::new(factory());
        let mut out = [0i16; SAMPLES_PER_FRAME];
        assert_eq!(mixer.get_mixed(&mut out), 0);
    }

    #[test]
    fn table_evicts_lru_when_full() {
        let mixer = Mixer::new(factory());
        for ssrc in 0..STREAM_TABLE_SIZE as u32 {
            mixer.put(&header(ssrc, 0), &payload_for(1));
        }
        assert_eq!(mixer.active_count(), STREAM_TABLE_SIZE);
        // One more distinct SSRC must evict the LRU entry (ssrc 0) rather
        // than silently failing to register.
        mixer.put(&header(STREAM_TABLE_SIZE as u32, 0), &payload_for(1));
        assert_eq!(mixer.active_count(), STREAM_TABLE_SIZE);
    }

    #[test]
    fn hitting_existing_ssrc_does_not_grow_table() {
        let mixer = Mixer::new(factory());
        mixer.put(&header(5, 0), &payload_for(1));
        mixer.put(&header(5, 1), &payload_for(1));
        assert_eq!(mixer.active_count(), 1);
    }
}
