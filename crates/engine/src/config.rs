//! Conversion options

// SPDX-FileCopyrightText: © 2023 Marcus Rowe <undisbeliever@gmail.com>
//
// SPDX-License-Identifier: MIT

use serde::{Deserialize, Serialize};

pub const DEFAULT_LOOP_REPEAT_COUNT: u32 = 2;
pub const DEFAULT_MIN_SEQUENCE_SIZE: u32 = 8;

/// Read-only configuration supplied before a conversion begins.
///
/// Passed into the engine constructor explicitly so conversions with
/// different settings stay independently testable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionOptions {
    /// How many times a confirmed forever-loop jump is taken before the
    /// engine truncates it.  Must be at least 1; the loop body is heard
    /// `loop_repeat_count + 1` times.
    pub loop_repeat_count: u32,

    /// Avoid General MIDI's reserved percussion channel when auto-assigning
    /// channels to tracks.
    pub skip_channel_10: bool,

    /// Validation threshold used by format scanners.
    pub min_sequence_size: u32,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        ConversionOptions {
            loop_repeat_count: DEFAULT_LOOP_REPEAT_COUNT,
            skip_channel_10: false,
            min_sequence_size: DEFAULT_MIN_SEQUENCE_SIZE,
        }
    }
}

impl ConversionOptions {
    /// The repeat count with the `>= 1` invariant enforced.
    pub fn effective_loop_repeat_count(&self) -> u32 {
        self.loop_repeat_count.max(1)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let o = ConversionOptions::default();

        assert_eq!(o.loop_repeat_count, 2);
        assert!(!o.skip_channel_10);
        assert_eq!(o.effective_loop_repeat_count(), 2);
    }

    #[test]
    fn zero_repeat_count_is_clamped() {
        let o = ConversionOptions {
            loop_repeat_count: 0,
            ..Default::default()
        };
        assert_eq!(o.effective_loop_repeat_count(), 1);
    }
}
