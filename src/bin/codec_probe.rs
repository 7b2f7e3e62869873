/// Codec inspection tool
/// Synthesizes test tones, runs them through the mu-law round trip and the
/// resampler, and writes the results as WAV files for listening or
/// spectrogram inspection.
use linebridge::codec;
use std::error::Error;

/// Save PCM audio data to a WAV file
fn save_pcm_to_wav(pcm: &[i16], sample_rate: u32, filename: &str) -> Result<(), Box<dyn Error>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::create(filename, spec)?;
    for sample in pcm {
        writer.write_sample(*sample)?;
    }
    writer.finalize()?;
    Ok(())
}

fn tone(freq_hz: f64, rate: u32, duration_ms: u64, amplitude: f64) -> Vec<i16> {
    let n = (rate as u64 * duration_ms / 1000) as usize;
    (0..n)
        .map(|i| {
            let t = i as f64 / rate as f64;
            (amplitude * (2.0 * std::f64::consts::PI * freq_hz * t).sin()) as i16
        })
        .collect()
}

fn main() -> Result<(), Box<dyn Error>> {
    println!("🔊 Codec probe");
    println!("Writes WAV files for each stage of the audio pipeline.\n");

    // Stage 1: mu-law round trip at the telephony rate.
    let source = tone(440.0, 8_000, 2_000, 16_000.0);
    save_pcm_to_wav(&source, 8_000, "probe_source_8k.wav")?;

    let companded = codec::encode_mulaw(&source);
    let decoded = codec::decode_mulaw(&companded);
    save_pcm_to_wav(&decoded, 8_000, "probe_mulaw_roundtrip_8k.wav")?;

    let max_err = source
        .iter()
        .zip(&decoded)
        .map(|(a, b)| (*a as i32 - *b as i32).abs())
        .max()
        .unwrap_or(0);
    println!("mu-law round trip: {} samples, max error {max_err}", source.len());

    // Stage 2: upsample to the session rate and back down.
    let up = codec::resample(&decoded, 8_000, 24_000);
    save_pcm_to_wav(&up, 24_000, "probe_upsampled_24k.wav")?;
    println!("upsampled: {} samples at 24 kHz", up.len());

    let down = codec::resample(&up, 24_000, 8_000);
    save_pcm_to_wav(&down, 8_000, "probe_downsampled_8k.wav")?;
    println!("downsampled back: {} samples at 8 kHz", down.len());

    // Stage 3: aliasing check. A 6 kHz tone must disappear on the way down
    // to 8 kHz; listen for a ghost 2 kHz tone to spot filter regressions.
    let high = tone(6_000.0, 24_000, 2_000, 16_000.0);
    let high_down = codec::resample(&high, 24_000, 8_000);
    save_pcm_to_wav(&high_down, 8_000, "probe_alias_check_8k.wav")?;
    let residual = codec::frame_rms(&high_down) / codec::frame_rms(&high);
    println!("aliasing residual: {:.1}% of source energy", residual * 100.0);

    // Stage 4: normalization of a too-quiet frame.
    let quiet = tone(440.0, 8_000, 2_000, 1_500.0);
    let normalized = codec::normalize(&quiet);
    save_pcm_to_wav(&normalized, 8_000, "probe_normalized_8k.wav")?;
    println!(
        "normalize: peak {} -> {}",
        quiet.iter().map(|s| s.unsigned_abs()).max().unwrap_or(0),
        normalized.iter().map(|s| s.unsigned_abs()).max().unwrap_or(0),
    );

    println!("\n✅ Done - inspect the probe_*.wav files");
    Ok(())
}
