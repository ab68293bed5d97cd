//! Per-pass emission strategies

// SPDX-FileCopyrightText: © 2023 Marcus Rowe <undisbeliever@gmail.com>
//
// SPDX-License-Identifier: MIT

use crate::event::EventRecord;
use crate::midi::{MidiFile, MidiMessage};

/// The three replays of the decode loop.  Identical control flow, different
/// side effects.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Pass {
    FindLength,
    BuildItems,
    EmitMidi,
}

/// The side-effect strategy injected into the cursor's emission primitives.
///
/// The cursor calls both hooks unconditionally; each pass implementation
/// listens to the ones it cares about.  This is what lets one decode call
/// site serve all three passes.
pub trait PassSink {
    /// A labeled byte range, offered once per first-visited offset.
    fn item(&mut self, track_index: usize, record: &EventRecord);

    /// A MIDI message at an absolute tick.
    fn message(&mut self, track_index: usize, tick: u32, message: MidiMessage);
}

/// Pass 1: lengths and loop counters only, no output.
pub struct LengthPass;

impl PassSink for LengthPass {
    fn item(&mut self, _track_index: usize, _record: &EventRecord) {}
    fn message(&mut self, _track_index: usize, _tick: u32, _message: MidiMessage) {}
}

/// Pass 2: collects the per-track item lists for the UI sink.
pub struct ItemPass {
    tracks: Vec<Vec<EventRecord>>,
}

impl ItemPass {
    pub fn new(n_tracks: usize) -> ItemPass {
        ItemPass {
            tracks: vec![Vec::new(); n_tracks],
        }
    }

    /// The item tree, stable-sorted by source offset.
    pub fn into_items(mut self) -> Vec<Vec<EventRecord>> {
        for t in &mut self.tracks {
            t.sort_by_key(|r| r.offset);
        }
        self.tracks
    }
}

impl PassSink for ItemPass {
    fn item(&mut self, track_index: usize, record: &EventRecord) {
        self.tracks[track_index].push(record.clone());
    }

    fn message(&mut self, _track_index: usize, _tick: u32, _message: MidiMessage) {}
}

/// Pass 3: forwards messages into the MIDI file.
pub struct MidiPass<'a> {
    file: &'a mut MidiFile,
    // sequence track index -> MIDI track handle
    handles: Vec<usize>,
}

impl<'a> MidiPass<'a> {
    pub fn new(file: &'a mut MidiFile, n_tracks: usize) -> MidiPass<'a> {
        let handles = (0..n_tracks).map(|_| file.add_track()).collect();

        MidiPass { file, handles }
    }
}

impl PassSink for MidiPass<'_> {
    fn item(&mut self, _track_index: usize, _record: &EventRecord) {}

    fn message(&mut self, track_index: usize, tick: u32, message: MidiMessage) {
        self.file.insert(self.handles[track_index], tick, message);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::event::{ByteRange, EventKind};
    use crate::time::DEFAULT_PPQN;

    #[test]
    fn item_pass_sorts_by_offset() {
        let mut p = ItemPass::new(1);

        p.item(0, &EventRecord::new(ByteRange::new(8, 1), EventKind::Unknown, "b"));
        p.item(0, &EventRecord::new(ByteRange::new(2, 1), EventKind::Unknown, "a"));

        let items = p.into_items();
        assert_eq!(items[0][0].offset, 2);
        assert_eq!(items[0][1].offset, 8);
    }

    #[test]
    fn midi_pass_routes_by_track() {
        let mut f = MidiFile::new(DEFAULT_PPQN);
        {
            let mut p = MidiPass::new(&mut f, 2);
            p.message(
                1,
                0,
                MidiMessage::NoteOn {
                    channel: 1,
                    key: 60,
                    velocity: 90,
                },
            );
        }

        assert_eq!(f.n_tracks(), 2);
        assert!(f.track(0).events().is_empty());
        assert_eq!(f.track(1).events().len(), 1);
    }
}
