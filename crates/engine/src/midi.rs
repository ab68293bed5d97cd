//! In-memory MIDI accumulation and final chronological ordering

// SPDX-FileCopyrightText: © 2023 Marcus Rowe <undisbeliever@gmail.com>
//
// SPDX-License-Identifier: MIT

use crate::time::Ppqn;

pub const MIDI_CHANNELS: u8 = 16;

/// General MIDI percussion channel (0-indexed).
pub const DRUM_CHANNEL: u8 = 9;

#[derive(Debug, Clone, PartialEq)]
pub enum MidiMessage {
    NoteOn { channel: u8, key: u8, velocity: u8 },
    NoteOff { channel: u8, key: u8 },
    Controller { channel: u8, controller: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
    /// 14-bit value, 0x2000 is centre.
    PitchBend { channel: u8, value: u16 },
    Tempo { microseconds_per_quarter: u32 },
    TimeSignature { numerator: u8, denominator: u8 },
    Marker { text: String },
    TrackName { text: String },
    /// MIDI port meta event, for pieces with more than 16 channels.
    MidiPort { port: u8 },
    EndOfTrack,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimedMessage {
    pub tick: u32,
    pub message: MidiMessage,
}

#[derive(Debug, Default)]
pub struct MidiTrack {
    events: Vec<TimedMessage>,
}

impl MidiTrack {
    pub fn insert(&mut self, tick: u32, message: MidiMessage) {
        self.events.push(TimedMessage { tick, message });
    }

    pub fn events(&self) -> &[TimedMessage] {
        &self.events
    }

    /// Stable sort by absolute tick, then normalise the end-of-track marker
    /// so exactly one terminates the track at or after the last event.
    fn finalize(&mut self) {
        let mut end_tick: u32 = 0;

        self.events.retain(|e| {
            if e.message == MidiMessage::EndOfTrack {
                end_tick = end_tick.max(e.tick);
                false
            } else {
                end_tick = end_tick.max(e.tick);
                true
            }
        });

        self.events.sort_by_key(|e| e.tick);
        self.events.push(TimedMessage {
            tick: end_tick,
            message: MidiMessage::EndOfTrack,
        });
    }
}

/// Accumulates emitted events into a standard MIDI track/file structure.
///
/// Following the convention that tools honour a single authoritative tempo
/// track, tempo and time-signature meta events are always routed to the
/// first track regardless of which sequence track produced them.
#[derive(Debug)]
pub struct MidiFile {
    ppqn: Ppqn,
    tracks: Vec<MidiTrack>,
}

impl MidiFile {
    pub fn new(ppqn: Ppqn) -> MidiFile {
        MidiFile {
            ppqn,
            tracks: Vec::new(),
        }
    }

    pub fn ppqn(&self) -> Ppqn {
        self.ppqn
    }

    pub fn add_track(&mut self) -> usize {
        self.tracks.push(MidiTrack::default());
        self.tracks.len() - 1
    }

    pub fn n_tracks(&self) -> usize {
        self.tracks.len()
    }

    pub fn track(&self, index: usize) -> &MidiTrack {
        &self.tracks[index]
    }

    pub fn tracks(&self) -> &[MidiTrack] {
        &self.tracks
    }

    pub fn insert(&mut self, track: usize, tick: u32, message: MidiMessage) {
        match message {
            MidiMessage::Tempo { .. } | MidiMessage::TimeSignature { .. } => {
                // Conductor events belong to the first track only.
                if !self.tracks.is_empty() {
                    self.tracks[0].insert(tick, message);
                }
            }
            _ => self.tracks[track].insert(tick, message),
        }
    }

    pub fn finalize_sort_by_time(&mut self) {
        for t in &mut self.tracks {
            t.finalize();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::time::DEFAULT_PPQN;

    #[test]
    fn finalize_sorts_and_terminates() {
        let mut f = MidiFile::new(DEFAULT_PPQN);
        let t = f.add_track();

        f.insert(
            t,
            48,
            MidiMessage::NoteOff {
                channel: 0,
                key: 60,
            },
        );
        f.insert(
            t,
            0,
            MidiMessage::NoteOn {
                channel: 0,
                key: 60,
                velocity: 100,
            },
        );
        f.finalize_sort_by_time();

        let events = f.track(t).events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].tick, 0);
        assert_eq!(events[1].tick, 48);
        assert_eq!(
            events[2],
            TimedMessage {
                tick: 48,
                message: MidiMessage::EndOfTrack
            }
        );
    }

    #[test]
    fn tempo_routes_to_first_track() {
        let mut f = MidiFile::new(DEFAULT_PPQN);
        let t0 = f.add_track();
        let t1 = f.add_track();

        f.insert(
            t1,
            0,
            MidiMessage::Tempo {
                microseconds_per_quarter: 500_000,
            },
        );

        assert_eq!(f.track(t0).events().len(), 1);
        assert!(f.track(t1).events().is_empty());
    }

    #[test]
    fn stable_order_at_equal_ticks() {
        let mut f = MidiFile::new(DEFAULT_PPQN);
        let t = f.add_track();

        f.insert(
            t,
            0,
            MidiMessage::Controller {
                channel: 0,
                controller: 7,
                value: 100,
            },
        );
        f.insert(
            t,
            0,
            MidiMessage::NoteOn {
                channel: 0,
                key: 64,
                velocity: 90,
            },
        );
        f.finalize_sort_by_time();

        // insertion order preserved at tick 0
        assert!(matches!(
            f.track(t).events()[0].message,
            MidiMessage::Controller { .. }
        ));
        assert!(matches!(
            f.track(t).events()[1].message,
            MidiMessage::NoteOn { .. }
        ));
    }
}
