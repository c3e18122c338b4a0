//! Capture-side audio DSP: an RMS/ZCR noise gate with attack/release
//! smoothing (§4.6).
//!
//! Grounded on the teacher's `mixer::Channel::update_meter` (`server/src/
//! mixer/channel.rs`), which also tracks a smoothed level with separate
//! attack/release behavior; generalized here from a peak meter (always
//! tracks upward instantly, decays slowly) to a two-target noise gate
//! whose smoothing constant depends on whether the gain is rising or
//! falling.

use crate::SAMPLES_PER_FRAME;

const SILENCE_FLOOR_DB: f32 = -100.0;
const SILENCE_THRESHOLD_DB: f32 = -40.0;
const HIGH_ENERGY_THRESHOLD_DB: f32 = -6.0;
const NON_VOICE_ZCR_THRESHOLD: f32 = 0.05;
const VOICE_ZCR_MAX: f32 = 0.40;

const FRAME_MS: f32 = 20.0;
const ATTACK_TIME_CONST_MS: f32 = 5.0;
const RELEASE_TIME_CONST_MS: f32 = 50.0;

const GATE_SILENCE_TARGET: f32 = 0.0;
const GATE_NON_VOICE_TARGET: f32 = 0.1;
const GATE_OPEN_TARGET: f32 = 1.0;

/// Per-frame classification the gate derives its target gain from (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Silence,
    LikelyNonVoice,
    LikelyVoice,
    /// Energetic but not cleanly classifiable as voice or non-voice (high
    /// energy with a ZCR above the non-voice threshold, or low energy with
    /// a ZCR outside the voice band). Gate still opens fully for it.
    Uncertain,
}

/// One frame's analysis result, returned alongside the gate's output so
/// callers (a level meter, a test) can inspect it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameAnalysis {
    pub rms_db: f32,
    pub peak_db: f32,
    pub zero_crossing_rate: f32,
    pub classification: Classification,
    pub gain: f32,
}

/// RMS/ZCR noise gate with one-pole attack/release smoothing (§4.6).
pub struct NoiseGate {
    gain: f32,
}

impl Default for NoiseGate {
    fn default() -> Self {
        Self { gain: 1.0 }
    }
}

impl NoiseGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    /// Analyzes one 20 ms block and applies the smoothed gate gain to it
    /// in place. Returns the frame's analysis for metering.
    pub fn process(&mut self, frame: &mut [i16; SAMPLES_PER_FRAME]) -> FrameAnalysis {
        let rms_db = rms_dbfs(frame);
        let peak_db = peak_dbfs(frame);
        let zcr = zero_crossing_rate(frame);
        let classification = classify(rms_db, zcr);
        let target = target_gain(classification);

        let alpha = if target < self.gain {
            attack_alpha()
        } else {
            release_alpha()
        };
        self.gain += (target - self.gain) * alpha;

        if self.gain < 0.99 {
            apply_gain_soft_clip(frame, self.gain);
        } else {
            apply_gain(frame, self.gain);
        }

        FrameAnalysis {
            rms_db,
            peak_db,
            zero_crossing_rate: zcr,
            classification,
            gain: self.gain,
        }
    }
}

fn classify(rms_db: f32, zcr: f32) -> Classification {
    if rms_db < SILENCE_THRESHOLD_DB {
        return Classification::Silence;
    }
    let high_energy = rms_db > HIGH_ENERGY_THRESHOLD_DB;
    if high_energy && zcr < NON_VOICE_ZCR_THRESHOLD {
        return Classification::LikelyNonVoice;
    }
    if (NON_VOICE_ZCR_THRESHOLD..=VOICE_ZCR_MAX).contains(&zcr) {
        return Classification::LikelyVoice;
    }
    Classification::Uncertain
}

fn target_gain(classification: Classification) -> f32 {
    match classification {
        Classification::Silence => GATE_SILENCE_TARGET,
        Classification::LikelyNonVoice => GATE_NON_VOICE_TARGET,
        Classification::LikelyVoice | Classification::Uncertain => GATE_OPEN_TARGET,
    }
}

fn attack_alpha() -> f32 {
    1.0 - (-FRAME_MS / ATTACK_TIME_CONST_MS).exp()
}

fn release_alpha() -> f32 {
    1.0 - (-FRAME_MS / RELEASE_TIME_CONST_MS).exp()
}

fn rms_dbfs(frame: &[i16]) -> f32 {
    let sum_sq: f64 = frame.iter().map(|&s| (s as f64) * (s as f64)).sum();
    let rms = (sum_sq / frame.len() as f64).sqrt() / 32768.0;
    if rms <= 0.0 {
        SILENCE_FLOOR_DB
    } else {
        (20.0 * rms.log10()).max(SILENCE_FLOOR_DB as f64) as f32
    }
}

fn peak_dbfs(frame: &[i16]) -> f32 {
    let peak = frame.iter().map(|&s| s.unsigned_abs()).max().unwrap_or(0) as f64 / 32768.0;
    if peak <= 0.0 {
        SILENCE_FLOOR_DB
    } else {
        (20.0 * peak.log10()).max(SILENCE_FLOOR_DB as f64) as f32
    }
}

fn zero_crossing_rate(frame: &[i16]) -> f32 {
    if frame.len() < 2 {
        return 0.0;
    }
    let crossings = frame
        .windows(2)
        .filter(|pair| (pair[0] >= 0) != (pair[1] >= 0))
        .count();
    crossings as f32 / (frame.len() - 1) as f32
}

fn apply_gain(frame: &mut [i16], gain: f32) {
    for sample in frame.iter_mut() {
        *sample = (*sample as f32 * gain).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
    }
}

/// `tanh` saturator, used instead of a hard clamp while the gate is below
/// unity gain. Transparent for samples well under full scale; only the
/// samples a hard clamp would pin gets rounded off.
fn apply_gain_soft_clip(frame: &mut [i16], gain: f32) {
    const THRESHOLD: f32 = i16::MAX as f32;
    for sample in frame.iter_mut() {
        let scaled = *sample as f32 * gain;
        let shaped = (scaled / THRESHOLD).tanh() * THRESHOLD;
        *sample = shaped.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(amplitude: i16) -> [i16; SAMPLES_PER_FRAME] {
        let mut frame = [0i16; SAMPLES_PER_FRAME];
        for (i, s) in frame.iter_mut().enumerate() {
            *s = if i % 2 == 0 { amplitude } else { -amplitude };
        }
        frame
    }

    #[test]
    fn silence_classifies_as_silence_and_gates_to_zero() {
        let mut gate = NoiseGate::new();
        let mut frame = [0i16; SAMPLES_PER_FRAME];
        for _ in 0..50 {
            gate.process(&mut frame);
        }
        assert!(gate.gain() < 0.05);
    }

    #[test]
    fn loud_dc_like_signal_has_low_zcr_and_is_non_voice() {
        let mut gate = NoiseGate::new();
        let mut frame = [20_000i16; SAMPLES_PER_FRAME];
        let analysis = gate.process(&mut frame);
        assert_eq!(analysis.zero_crossing_rate, 0.0);
        assert_eq!(analysis.classification, Classification::LikelyNonVoice);
    }

    #[test]
    fn zero_crossing_rate_of_full_alternation_is_one() {
        let frame = tone(1000);
        assert_eq!(zero_crossing_rate(&frame), 1.0);
    }

    #[test]
    fn gain_moves_toward_target_gradually() {
        let mut gate = NoiseGate::new();
        assert_eq!(gate.gain(), 1.0);
        let mut frame = [0i16; SAMPLES_PER_FRAME];
        gate.process(&mut frame);
        assert!(gate.gain() < 1.0);
        assert!(gate.gain() > 0.0);
    }

    #[test]
    fn soft_clip_rounds_off_what_a_hard_clamp_would_pin_to_full_scale() {
        let mut frame = [i16::MAX; SAMPLES_PER_FRAME];
        let mut clamped = frame;
        apply_gain(&mut clamped, 0.95);
        apply_gain_soft_clip(&mut frame, 0.95);
        assert!(frame[0] < clamped[0]);
    }

    #[test]
    fn soft_clip_leaves_quiet_samples_close_to_a_hard_clamp() {
        let mut frame = [1_000i16; SAMPLES_PER_FRAME];
        let mut clamped = frame;
        apply_gain(&mut clamped, 0.5);
        apply_gain_soft_clip(&mut frame, 0.5);
        assert!((frame[0] - clamped[0]).abs() <= 2);
    }
}
