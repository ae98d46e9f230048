//! Procedural earcon synthesis.
//!
//! Earcons are short synthetic tones used as UX cues: wake accepted,
//! utterance heard, follow-up window open, session end, error.

use std::f32::consts::TAU;

use super::playback::Playback;
use crate::config::EarconConfig;

/// Fade-in/fade-out length applied to every tone.
const FADE_S: f32 = 0.02;

/// Generate a sine tone with a linear fade envelope.
pub fn generate_tone(frequency: f32, duration_s: f32, volume: f32, sample_rate: u32) -> Vec<f32> {
    let n = (duration_s * sample_rate as f32) as usize;
    let fade_len = (FADE_S * sample_rate as f32) as usize;
    let mut samples = Vec::with_capacity(n);
    for i in 0..n {
        let t = i as f32 / sample_rate as f32;
        let mut s = (TAU * frequency * t).sin() * volume;
        if fade_len > 0 && fade_len * 2 < n {
            if i < fade_len {
                s *= i as f32 / fade_len as f32;
            } else if i >= n - fade_len {
                s *= (n - i) as f32 / fade_len as f32;
            }
        }
        samples.push(s);
    }
    samples
}

fn silence(duration_s: f32, sample_rate: u32) -> Vec<f32> {
    vec![0.0; (duration_s * sample_rate as f32) as usize]
}

/// Descending frequency glide with the standard fade envelope.
fn glide(from_hz: f32, to_hz: f32, duration_s: f32, volume: f32, sample_rate: u32) -> Vec<f32> {
    let n = (duration_s * sample_rate as f32) as usize;
    let fade_len = (FADE_S * sample_rate as f32) as usize;
    let mut samples = Vec::with_capacity(n);
    let mut phase = 0.0f32;
    for i in 0..n {
        let frac = i as f32 / n as f32;
        let freq = from_hz + (to_hz - from_hz) * frac;
        phase += TAU * freq / sample_rate as f32;
        let mut s = phase.sin() * volume;
        if fade_len > 0 && fade_len * 2 < n {
            if i < fade_len {
                s *= i as f32 / fade_len as f32;
            } else if i >= n - fade_len {
                s *= (n - i) as f32 / fade_len as f32;
            }
        }
        samples.push(s);
    }
    samples
}

/// Generate a named earcon.
///
/// Supported names:
///   wake    -- 880 Hz chime on wake detection (150 ms)
///   heard   -- 440 Hz confirmation when an utterance is captured (100 ms)
///   ready   -- 660 Hz then 880 Hz pips when the follow-up window opens
///   goodbye -- 880 to 440 Hz glide when the session ends (200 ms)
///   error   -- two 220 Hz bursts on pipeline error
pub fn generate_earcon(name: &str, sample_rate: u32, volume: f32) -> anyhow::Result<Vec<f32>> {
    match name {
        "wake" => Ok(generate_tone(880.0, 0.15, volume, sample_rate)),
        "heard" => Ok(generate_tone(440.0, 0.10, volume, sample_rate)),
        "ready" => {
            let mut out = generate_tone(660.0, 0.08, volume, sample_rate);
            out.extend(silence(0.04, sample_rate));
            out.extend(generate_tone(880.0, 0.08, volume, sample_rate));
            Ok(out)
        }
        "goodbye" => Ok(glide(880.0, 440.0, 0.20, volume, sample_rate)),
        "error" => {
            let mut out = generate_tone(220.0, 0.08, volume, sample_rate);
            out.extend(silence(0.06, sample_rate));
            out.extend(generate_tone(220.0, 0.08, volume, sample_rate));
            Ok(out)
        }
        other => anyhow::bail!("unknown earcon: {other:?}"),
    }
}

/// Generate and play a named earcon.
pub fn play_named_earcon(player: &dyn Playback, name: &str, sample_rate: u32, volume: f32) {
    match generate_earcon(name, sample_rate, volume) {
        Ok(audio) => player.play(audio, sample_rate),
        Err(e) => tracing::warn!("{e}"),
    }
}

/// Play the wake cue using the configured frequency and duration.
pub fn play_wake_earcon(player: &dyn Playback, config: &EarconConfig, sample_rate: u32) {
    let audio = generate_tone(config.frequency, config.duration_s, config.volume, sample_rate);
    player.play(audio, sample_rate);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tone_length_matches_duration() {
        let tone = generate_tone(880.0, 0.15, 0.3, 16_000);
        assert_eq!(tone.len(), 2_400);
    }

    #[test]
    fn tone_fades_in_and_out() {
        let tone = generate_tone(440.0, 0.2, 1.0, 16_000);
        assert!(tone[0].abs() < 1e-6);
        assert!(tone[tone.len() - 1].abs() < 0.01);
        // Mid-tone amplitude is not faded.
        let mid_peak = tone[tone.len() / 2 - 50..tone.len() / 2 + 50]
            .iter()
            .fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(mid_peak > 0.9);
    }

    #[test]
    fn all_named_earcons_generate() {
        for name in ["wake", "heard", "ready", "goodbye", "error"] {
            let audio = generate_earcon(name, 16_000, 0.3).unwrap();
            assert!(!audio.is_empty(), "{name} produced no audio");
            // Everything stays within the volume bound.
            assert!(audio.iter().all(|s| s.abs() <= 0.31), "{name} clipped");
        }
    }

    #[test]
    fn ready_is_two_pips_with_gap() {
        let audio = generate_earcon("ready", 16_000, 0.3).unwrap();
        // 80 ms + 40 ms + 80 ms.
        assert_eq!(audio.len(), 1_280 + 640 + 1_280);
        // The gap is silent.
        assert!(audio[1_280..1_920].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn unknown_earcon_is_an_error() {
        assert!(generate_earcon("bogus", 16_000, 0.3).is_err());
    }
}
