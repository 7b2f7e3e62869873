//! Audio codec utilities for the telephony boundary.
//!
//! Converts between 8-bit G.711 mu-law (the companded format the telephony
//! stream speaks at 8 kHz) and 16-bit linear PCM, resamples PCM between the
//! 8/16/24 kHz rates used on either side of the bridge, and normalizes
//! loudness before frames are companded back down. Everything here is a pure
//! function over slices; corrupt input degrades to a shorter buffer, never a
//! panic.

/// Bias added to the magnitude before segment encoding, per G.711.
const MULAW_BIAS: i32 = 0x84;
/// Largest magnitude representable after biasing.
const MULAW_CLIP: i32 = 32_635;

/// Peak level normalization aims for, ~85% of full scale.
const TARGET_PEAK: f32 = 27_850.0;
/// Peaks inside this band are left alone.
const HEALTHY_PEAK_LOW: i32 = 8_000;
const HEALTHY_PEAK_HIGH: i32 = 31_000;
/// Gain never exceeds this, so near-silent frames don't become noise.
const MAX_GAIN: f32 = 2.0;

/// Taps in the anti-alias FIR. Odd so the filter is symmetric.
const LOWPASS_TAPS: usize = 63;

fn encode_mulaw_sample(pcm: i16) -> u8 {
    let mut x = pcm as i32;
    let sign = if x < 0 {
        x = -x;
        0x80u8
    } else {
        0x00
    };
    if x > MULAW_CLIP {
        x = MULAW_CLIP;
    }
    x += MULAW_BIAS;

    let mut exponent: u8 = 7;
    let mut mask = 0x4000;
    while exponent > 0 && (x & mask) == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = ((x >> (exponent as i32 + 3)) & 0x0F) as u8;
    !(sign | (exponent << 4) | mantissa)
}

fn decode_mulaw_sample(byte: u8) -> i16 {
    let b = !byte;
    let sign = b & 0x80;
    let exponent = ((b >> 4) & 0x07) as i32;
    let mantissa = (b & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + MULAW_BIAS) << exponent) - MULAW_BIAS;
    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Decode 8-bit mu-law bytes to linear PCM16.
pub fn decode_mulaw(bytes: &[u8]) -> Vec<i16> {
    bytes.iter().map(|&b| decode_mulaw_sample(b)).collect()
}

/// Encode linear PCM16 to 8-bit mu-law bytes.
pub fn encode_mulaw(pcm: &[i16]) -> Vec<u8> {
    pcm.iter().map(|&s| encode_mulaw_sample(s)).collect()
}

/// Convert little-endian PCM bytes to samples. An odd trailing byte is
/// dropped; a corrupt frame must shorten, not crash.
pub fn bytes_to_pcm(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

/// Convert samples to little-endian PCM bytes.
pub fn pcm_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    bytes
}

/// Resample PCM between two rates using 4-point cubic interpolation.
///
/// Downsampling runs a windowed-sinc low-pass first so energy above the new
/// Nyquist limit is attenuated instead of folding back into the passband.
/// Upsampling skips the filter. Matching rates return the input verbatim.
pub fn resample(input: &[i16], from_hz: u32, to_hz: u32) -> Vec<i16> {
    if from_hz == to_hz || input.is_empty() || from_hz == 0 || to_hz == 0 {
        return input.to_vec();
    }

    let filtered;
    let src: &[i16] = if to_hz < from_hz {
        filtered = low_pass(input, from_hz, to_hz);
        &filtered
    } else {
        input
    };

    let step = from_hz as f64 / to_hz as f64;
    let out_len = ((input.len() as f64) / step).floor() as usize;
    let mut out = Vec::with_capacity(out_len);
    let last = src.len() as isize - 1;

    let sample_at = |idx: isize| -> f64 { src[idx.clamp(0, last) as usize] as f64 };

    for n in 0..out_len {
        let pos = n as f64 * step;
        let i = pos.floor() as isize;
        let t = pos - i as f64;

        // Catmull-Rom over the four surrounding samples, edges clamped.
        let s0 = sample_at(i - 1);
        let s1 = sample_at(i);
        let s2 = sample_at(i + 1);
        let s3 = sample_at(i + 2);

        let interpolated = s1
            + 0.5
                * t
                * (s2 - s0
                    + t * (2.0 * s0 - 5.0 * s1 + 4.0 * s2 - s3 + t * (3.0 * (s1 - s2) + s3 - s0)));

        out.push(interpolated.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16);
    }

    out
}

/// Windowed-sinc (Hann) low-pass at ~45% of the target rate.
fn low_pass(input: &[i16], from_hz: u32, to_hz: u32) -> Vec<i16> {
    let cutoff = 0.45 * to_hz as f64 / from_hz as f64; // normalized to source rate
    let mid = (LOWPASS_TAPS / 2) as isize;

    let mut kernel = [0.0f64; LOWPASS_TAPS];
    let mut sum = 0.0;
    for (n, k) in kernel.iter_mut().enumerate() {
        let x = n as isize - mid;
        let sinc = if x == 0 {
            2.0 * cutoff
        } else {
            let px = std::f64::consts::PI * x as f64;
            (2.0 * cutoff * px).sin() / px
        };
        let window = 0.5
            - 0.5
                * (2.0 * std::f64::consts::PI * n as f64 / (LOWPASS_TAPS as f64 - 1.0)).cos();
        *k = sinc * window;
        sum += *k;
    }
    for k in kernel.iter_mut() {
        *k /= sum;
    }

    let last = input.len() as isize - 1;
    let mut out = Vec::with_capacity(input.len());
    for i in 0..input.len() as isize {
        let mut acc = 0.0;
        for (n, k) in kernel.iter().enumerate() {
            let idx = (i + n as isize - mid).clamp(0, last);
            acc += input[idx as usize] as f64 * k;
        }
        out.push(acc.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16);
    }
    out
}

/// Bring a frame's peak toward ~85% of full scale.
///
/// Frames whose peak already sits in the healthy band pass through
/// untouched; everything else is scaled, with gain capped so near-silent
/// frames don't have their noise floor amplified into audibility.
pub fn normalize(pcm: &[i16]) -> Vec<i16> {
    let peak = pcm.iter().map(|&s| (s as i32).abs()).max().unwrap_or(0);
    if peak == 0 || (HEALTHY_PEAK_LOW..=HEALTHY_PEAK_HIGH).contains(&peak) {
        return pcm.to_vec();
    }

    let gain = (TARGET_PEAK / peak as f32).min(MAX_GAIN);
    pcm.iter()
        .map(|&s| {
            (s as f32 * gain)
                .round()
                .clamp(i16::MIN as f32, i16::MAX as f32) as i16
        })
        .collect()
}

/// RMS energy of a frame on the 16-bit sample scale.
pub fn frame_rms(pcm: &[i16]) -> f64 {
    if pcm.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = pcm.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_sq / pcm.len() as f64).sqrt()
}
