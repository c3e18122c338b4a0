//! Codec trait boundary (§1, §9 DESIGN NOTES).
//!
//! The Opus library is a black box: "an Opus implementation callable with
//! (sample_rate=48000, channels=1, frame=960) and supporting in-band FEC
//! and PLC". This module defines that boundary as traits rather than
//! linking an FFI crate directly, mirroring the teacher's
//! `AudioNetworkBackend` trait (`network_audio/backend.rs`), which isolates
//! a concrete backend behind an interface with a placeholder
//! implementation.
//!
//! [`JitterCore`](crate::jitter::JitterCore)'s two decode entry points from
//! §3/§4.4 map directly onto [`Decoder::decode`] and [`Decoder::conceal`].

use crate::SAMPLES_PER_FRAME;

/// Encodes 20 ms PCM16 mono frames (960 samples) into a wire payload no
/// larger than [`lanvoice_protocol::MAX_RTP_PAYLOAD`].
pub trait Encoder: Send {
    /// Returns the encoded payload, or `None` on encoder failure (§7:
    /// dropped, not propagated).
    fn encode(&mut self, pcm: &[i16; SAMPLES_PER_FRAME]) -> Option<Vec<u8>>;
}

/// Decodes payloads produced by a matching [`Encoder`], with in-band packet
/// loss concealment for the frames the jitter core marks missing.
pub trait Decoder: Send {
    /// Regular decode entry point (§3, §4.4 `Get`). Returns the sample
    /// count written to `out`, or `None` on decoder failure (treated as a
    /// loss by the caller, which then falls back to `conceal`).
    fn decode(&mut self, payload: &[u8], out: &mut [i16; SAMPLES_PER_FRAME]) -> Option<usize>;

    /// Conceal-one-frame entry point, invoked when a slot is empty at
    /// delivery time (§4.4 `Get`, underrun path). Returns the sample count
    /// written, 0 if the decoder has no concealment model (caller falls
    /// back to silence).
    fn conceal(&mut self, out: &mut [i16; SAMPLES_PER_FRAME]) -> usize;
}

/// Dependency-free stand-in used by tests and as the default when no real
/// codec is wired up: "encodes" by copying PCM verbatim (payload type 0,
/// §3) and "conceals" with silence. A production deployment supplies an
/// Opus-backed `Encoder`/`Decoder` pair instead.
#[derive(Default)]
pub struct PcmPassthroughCodec;

impl Encoder for PcmPassthroughCodec {
    fn encode(&mut self, pcm: &[i16; SAMPLES_PER_FRAME]) -> Option<Vec<u8>> {
        let mut bytes = Vec::with_capacity(SAMPLES_PER_FRAME * 2);
        for sample in pcm {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        Some(bytes)
    }
}

impl Decoder for PcmPassthroughCodec {
    fn decode(&mut self, payload: &[u8], out: &mut [i16; SAMPLES_PER_FRAME]) -> Option<usize> {
        if payload.len() % 2 != 0 {
            return None;
        }
        let count = (payload.len() / 2).min(SAMPLES_PER_FRAME);
        for (i, chunk) in payload.chunks_exact(2).take(count).enumerate() {
            out[i] = i16::from_le_bytes([chunk[0], chunk[1]]);
        }
        Some(count)
    }

    fn conceal(&mut self, out: &mut [i16; SAMPLES_PER_FRAME]) -> usize {
        out.fill(0);
        SAMPLES_PER_FRAME
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_roundtrips() {
        let mut codec = PcmPassthroughCodec;
        let mut pcm = [0i16; SAMPLES_PER_FRAME];
        for (i, s) in pcm.iter_mut().enumerate() {
            *s = (i as i16).wrapping_mul(7);
        }
        let encoded = codec.encode(&pcm).unwrap();
        let mut out = [0i16; SAMPLES_PER_FRAME];
        let n = codec.decode(&encoded, &mut out).unwrap();
        assert_eq!(n, SAMPLES_PER_FRAME);
        assert_eq!(out, pcm);
    }

    #[test]
    fn conceal_is_silence() {
        let mut codec = PcmPassthroughCodec;
        let mut out = [1i16; SAMPLES_PER_FRAME];
        let n = codec.conceal(&mut out);
        assert_eq!(n, SAMPLES_PER_FRAME);
        assert!(out.iter().all(|&s| s == 0));
    }
}
