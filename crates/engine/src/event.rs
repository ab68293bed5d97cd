//! Decoded-event records and the labeled byte ranges handed to the item sink

// SPDX-FileCopyrightText: © 2023 Marcus Rowe <undisbeliever@gmail.com>
//
// SPDX-License-Identifier: MIT

use serde::Serialize;

/// The byte range one decoded event was read from.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct ByteRange {
    pub offset: u32,
    pub length: u32,
}

impl ByteRange {
    pub fn new(offset: u32, length: u32) -> ByteRange {
        ByteRange { offset, length }
    }

    pub fn end(&self) -> u32 {
        self.offset + self.length
    }
}

/// MIDI continuous-controller targets the cursor knows how to emit.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum ControllerTarget {
    Volume,
    Expression,
    Pan,
    Reverb,
    Modulation,
    Sustain,
}

impl ControllerTarget {
    pub fn controller_number(self) -> u8 {
        match self {
            ControllerTarget::Modulation => 1,
            ControllerTarget::Volume => 7,
            ControllerTarget::Pan => 10,
            ControllerTarget::Expression => 11,
            ControllerTarget::Sustain => 64,
            ControllerTarget::Reverb => 91,
        }
    }

    /// Volume-like targets pass through the amplitude-scale conversion.
    pub fn is_amplitude(self) -> bool {
        matches!(self, ControllerTarget::Volume | ControllerTarget::Expression)
    }
}

/// One decoded musical action.
///
/// This is a closed set: format decoders express everything they find in
/// terms of these variants (falling back to `Unknown` for undocumented
/// opcodes) so the three passes can interpret them uniformly.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EventKind {
    NoteOn {
        key: u8,
        velocity: u8,
    },
    NoteOff {
        key: u8,
    },
    NoteWithDuration {
        key: u8,
        velocity: u8,
        duration: u32,
    },
    Rest {
        ticks: u32,
    },
    ControllerChange {
        target: ControllerTarget,
        value: u8,
    },
    ControllerSlide {
        target: ControllerTarget,
        start_value: u8,
        end_value: u8,
        duration: u32,
    },
    ProgramChange {
        program: u8,
    },
    Tempo {
        microseconds_per_quarter: u32,
    },
    TimeSignature {
        numerator: u8,
        denominator: u8,
    },
    PitchBend {
        value: i16,
    },
    PitchBendRange {
        semitones: u8,
        cents: u8,
    },
    Marker {
        name: String,
        data: Vec<u8>,
    },
    LoopForever,
    TrackEnd,
    Unknown,
}

/// Colour hint for the hex-view / tree-view collaborator.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum EventColor {
    Note,
    Rest,
    Control,
    Program,
    Tempo,
    PitchBend,
    Loop,
    Marker,
    TrackEnd,
    Unknown,
}

impl EventKind {
    pub fn color(&self) -> EventColor {
        match self {
            EventKind::NoteOn { .. }
            | EventKind::NoteOff { .. }
            | EventKind::NoteWithDuration { .. } => EventColor::Note,
            EventKind::Rest { .. } => EventColor::Rest,
            EventKind::ControllerChange { .. }
            | EventKind::ControllerSlide { .. }
            | EventKind::PitchBendRange { .. } => EventColor::Control,
            EventKind::ProgramChange { .. } => EventColor::Program,
            EventKind::Tempo { .. } | EventKind::TimeSignature { .. } => EventColor::Tempo,
            EventKind::PitchBend { .. } => EventColor::PitchBend,
            EventKind::LoopForever => EventColor::Loop,
            EventKind::Marker { .. } => EventColor::Marker,
            EventKind::TrackEnd => EventColor::TrackEnd,
            EventKind::Unknown => EventColor::Unknown,
        }
    }

    fn describe(&self) -> String {
        match self {
            EventKind::NoteOn { key, velocity } => {
                format!("key {} velocity {}", key, velocity)
            }
            EventKind::NoteOff { key } => format!("key {}", key),
            EventKind::NoteWithDuration {
                key,
                velocity,
                duration,
            } => format!("key {} velocity {} duration {} ticks", key, velocity, duration),
            EventKind::Rest { ticks } => format!("{} ticks", ticks),
            EventKind::ControllerChange { target, value } => {
                format!("{:?} = {}", target, value)
            }
            EventKind::ControllerSlide {
                target,
                start_value,
                end_value,
                duration,
            } => format!(
                "{:?} {} -> {} over {} ticks",
                target, start_value, end_value, duration
            ),
            EventKind::ProgramChange { program } => format!("program {}", program),
            EventKind::Tempo {
                microseconds_per_quarter,
            } => format!("{} us per quarter note", microseconds_per_quarter),
            EventKind::TimeSignature {
                numerator,
                denominator,
            } => format!("{}/{}", numerator, denominator),
            EventKind::PitchBend { value } => format!("{}", value),
            EventKind::PitchBendRange { semitones, cents } => {
                format!("{} semitones {} cents", semitones, cents)
            }
            EventKind::Marker { name, data } => {
                if data.is_empty() {
                    name.clone()
                } else {
                    format!("{} ({} bytes)", name, data.len())
                }
            }
            EventKind::LoopForever => String::new(),
            EventKind::TrackEnd => String::new(),
            EventKind::Unknown => String::new(),
        }
    }
}

/// A labeled byte range describing one decoded event.
///
/// The item-building pass collects these (first visit of each offset only)
/// and hands them, sorted by source offset, to the UI item sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    pub offset: u32,
    pub length: u32,
    pub kind: EventKind,
    pub label: String,
    pub description: String,
}

impl EventRecord {
    pub fn new(range: ByteRange, kind: EventKind, label: &str) -> EventRecord {
        let description = kind.describe();

        EventRecord {
            offset: range.offset,
            length: range.length,
            kind,
            label: label.to_owned(),
            description,
        }
    }

    pub fn range(&self) -> ByteRange {
        ByteRange::new(self.offset, self.length)
    }

    pub fn color(&self) -> EventColor {
        self.kind.color()
    }
}
