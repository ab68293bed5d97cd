//! Conversions between game-native amplitude/pan/envelope units and MIDI/DLS units

// SPDX-FileCopyrightText: © 2023 Marcus Rowe <undisbeliever@gmail.com>
//
// SPDX-License-Identifier: MIT

// The constants in this file were verified against sound-driver disassembly.
// Treat them as fixed; do not re-derive them.

use std::f64::consts::FRAC_PI_2;

/// Attenuation (in decibels) that DLS/SF2 treat as fully silent.
pub const EXPONENTIAL_MIN_DECIBELS: f64 = -100.0;

/// Converts a value on a linear-amplitude 0-127 scale to the standard MIDI
/// scale, where perceived loudness follows `20*log10(x/127)`.
///
/// Many drivers treat volume and velocity as a plain amplitude multiplier;
/// MIDI synths square the controller value before applying it, so the square
/// root here cancels that out.
pub fn percent_amplitude_to_std_midi_val(value: u8) -> u8 {
    let value = value.min(127);
    let v = (f64::from(value) / 127.0).sqrt() * 127.0;

    // rounded sqrt of a 0..=127 fraction stays within 0..=127
    v.round() as u8
}

/// Converts a 0.0..=1.0 amplitude multiplier to the standard MIDI scale.
pub fn percent_volume_to_std_midi_val(volume: f64) -> u8 {
    let v = volume.clamp(0.0, 1.0).sqrt() * 127.0;

    v.round() as u8
}

/// Amplitude multiplier (0.0..=1.0) to decibels of attenuation (<= 0).
pub fn percent_amplitude_to_atten_db(amplitude: f64) -> f64 {
    assert!(amplitude > 0.0);
    20.0 * amplitude.log10()
}

/// Inverse of `percent_amplitude_to_atten_db`.
pub fn decibels_to_percent_amplitude(db: f64) -> f64 {
    10.0_f64.powf(db / 20.0)
}

/// Rescales an envelope decay/release time expressed on a linear-amplitude
/// ramp to the equivalent time on a linear-decibel ramp.
///
/// DLS and SoundFont describe envelopes in dB-per-time while many chips ramp
/// amplitude linearly.  `linear_range` is the resolution of the chip's volume
/// ramp (128 for a 7-bit envelope, 256 for an 8-bit one).
pub fn lin_amp_decay_to_lin_db_decay(seconds_to_full_atten: f64, linear_range: f64) -> f64 {
    assert!(linear_range > 1.0);

    let linear_min_db = (1.0 / linear_range).log10() * 20.0;
    let scale = (linear_min_db - EXPONENTIAL_MIN_DECIBELS).ln() / 2.0_f64.ln();

    seconds_to_full_atten * scale
}

/// Maps a linear left/right balance (0.0 = hard left, 0.5 = centre,
/// 1.0 = hard right) onto the sine/cosine-law MIDI pan curve.
///
/// Returns the MIDI pan value and the companion volume scale (<= 1.0) needed
/// to keep perceived loudness constant across the sweep.
pub fn percent_pan_to_std_midi_pan(pan: f64) -> (u8, f64) {
    let pan = pan.clamp(0.0, 1.0);
    let theta = pan.atan2(1.0 - pan);

    let volume_scale = 1.0 / (theta.cos() + theta.sin());
    let midi_pan = (theta / FRAC_PI_2 * 127.0).round() as u8;

    (midi_pan, volume_scale)
}

/// Seconds to the DLS/SF2 time unit (1200 * log2(seconds)).
pub fn seconds_to_timecents(seconds: f64) -> i32 {
    assert!(seconds > 0.0);

    (1200.0 * seconds.log2()).round() as i32
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn amplitude_endpoints() {
        assert_eq!(percent_amplitude_to_std_midi_val(0), 0);
        assert_eq!(percent_amplitude_to_std_midi_val(127), 127);
    }

    #[test]
    fn amplitude_midpoint() {
        // sqrt(64/127)*127 = 90.1
        assert_eq!(percent_amplitude_to_std_midi_val(64), 90);
    }

    #[test]
    fn amplitude_monotonic() {
        let mut prev = 0;
        for v in 0..=127 {
            let m = percent_amplitude_to_std_midi_val(v);
            assert!(m >= prev, "not monotonic at {}", v);
            prev = m;
        }
    }

    #[test]
    fn amplitude_saturates_above_range() {
        assert_eq!(percent_amplitude_to_std_midi_val(200), 127);
    }

    #[test]
    fn percent_volume() {
        assert_eq!(percent_volume_to_std_midi_val(0.0), 0);
        assert_eq!(percent_volume_to_std_midi_val(1.0), 127);
        assert_eq!(percent_volume_to_std_midi_val(0.25), 64);
    }

    #[test]
    fn attenuation_round_trip() {
        for a in [1.0, 0.5, 0.25, 0.125] {
            let db = percent_amplitude_to_atten_db(a);
            assert!((decibels_to_percent_amplitude(db) - a).abs() < 1e-12);
        }
        assert!((percent_amplitude_to_atten_db(0.5) - -6.0205999).abs() < 1e-6);
    }

    #[test]
    fn pan_law() {
        let (centre, scale) = percent_pan_to_std_midi_pan(0.5);
        assert_eq!(centre, 64);
        assert!((scale - 1.0 / std::f64::consts::SQRT_2).abs() < 1e-12);

        assert_eq!(percent_pan_to_std_midi_pan(0.0), (0, 1.0));

        let (right, right_scale) = percent_pan_to_std_midi_pan(1.0);
        assert_eq!(right, 127);
        assert!((right_scale - 1.0).abs() < 1e-12);
    }

    #[test]
    fn pan_volume_scale_never_boosts() {
        for i in 0..=100 {
            let (_, scale) = percent_pan_to_std_midi_pan(f64::from(i) / 100.0);
            assert!(scale <= 1.0 + 1e-12);
        }
    }

    #[test]
    fn timecents() {
        assert_eq!(seconds_to_timecents(1.0), 0);
        assert_eq!(seconds_to_timecents(2.0), 1200);
        assert_eq!(seconds_to_timecents(0.5), -1200);
    }

    #[test]
    fn linear_decay_scale() {
        // 7-bit ramp: linear_min_db = 20*log10(1/128) = -42.1, scale = ln(57.9)/ln(2)
        let t = lin_amp_decay_to_lin_db_decay(1.0, 128.0);
        assert!((t - 5.855).abs() < 0.01);

        // the rescale is proportional in time
        let t2 = lin_amp_decay_to_lin_db_decay(2.0, 128.0);
        assert!((t2 - 2.0 * t).abs() < 1e-12);
    }
}
