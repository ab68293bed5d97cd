//! The three-pass sequence conversion driver

// SPDX-FileCopyrightText: © 2023 Marcus Rowe <undisbeliever@gmail.com>
//
// SPDX-License-Identifier: MIT

use crate::byte_source::ByteSource;
use crate::config::ConversionOptions;
use crate::decoder::{FormatDecoder, Scheduling, SequenceLayout};
use crate::errors::{DecodeError, HeaderError};
use crate::event::EventRecord;
use crate::midi::{MidiFile, MidiMessage, DRUM_CHANNEL};
use crate::passes::{ItemPass, LengthPass, MidiPass, Pass, PassSink};
use crate::time::{bpm_to_microseconds_per_quarter, TickCounter};
use crate::track::TrackCursor;

use std::cmp::max;
use std::collections::BTreeSet;

/// One track's decode loop failed.  The remaining tracks keep their output;
/// the offset pinpoints the malformed input.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackFailure {
    pub pass: Pass,
    pub track: usize,
    pub offset: u32,
    pub error: DecodeError,
}

impl std::fmt::Display for TrackFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} pass: track {} failed at offset 0x{:x}: {}",
            self.pass, self.track, self.offset, self.error
        )
    }
}

/// Everything one conversion produced.
pub struct Conversion {
    pub name: String,
    pub midi: MidiFile,
    /// Per-track labeled byte ranges, sorted by source offset (the UI item
    /// sink contract).
    pub items: Vec<Vec<EventRecord>>,
    pub stop_time: TickCounter,
    pub instruments_referenced: BTreeSet<u32>,
    pub failures: Vec<TrackFailure>,
}

/// MIDI channel for an auto-assigned track.
fn auto_assign_channel(track_index: usize, skip_channel_10: bool) -> u8 {
    if skip_channel_10 {
        let c = (track_index % 15) as u8;
        if c >= DRUM_CHANNEL {
            c + 1
        } else {
            c
        }
    } else {
        (track_index % 16) as u8
    }
}

/// Owns all tracks of one musical piece and drives the three-pass protocol:
/// `FindLength` bounds forever-loops, `BuildItems` collects the labeled item
/// tree, `EmitMidi` produces the MIDI file.  All three replay the identical
/// decode control flow; only the injected sink differs.
pub struct SequenceEngine<'a, D: FormatDecoder> {
    source: &'a ByteSource,
    decoder: D,
    layout: SequenceLayout,
    tracks: Vec<TrackCursor<'a>>,
    stop_time: Option<TickCounter>,
    failures: Vec<TrackFailure>,
}

impl<'a, D: FormatDecoder> SequenceEngine<'a, D> {
    pub fn new(
        source: &'a ByteSource,
        mut decoder: D,
        options: &ConversionOptions,
    ) -> Result<SequenceEngine<'a, D>, HeaderError> {
        let layout = decoder.parse_header(source)?;

        if layout.tracks.is_empty() {
            return Err(HeaderError::NoTracks);
        }
        for (i, t) in layout.tracks.iter().enumerate() {
            if !source.is_valid_offset(t.start_offset) {
                return Err(HeaderError::TrackPointerOutOfRange {
                    track: i,
                    offset: t.start_offset,
                });
            }
        }

        let repeat_limit = options.effective_loop_repeat_count();
        let tracks = layout
            .tracks
            .iter()
            .enumerate()
            .map(|(i, tl)| {
                TrackCursor::new(
                    source,
                    i,
                    tl,
                    auto_assign_channel(i, options.skip_channel_10),
                    layout.amplitude_scale,
                    repeat_limit,
                )
            })
            .collect();

        Ok(SequenceEngine {
            source,
            decoder,
            layout,
            tracks,
            stop_time: None,
            failures: Vec::new(),
        })
    }

    pub fn layout(&self) -> &SequenceLayout {
        &self.layout
    }

    pub fn source(&self) -> &ByteSource {
        self.source
    }

    pub fn n_tracks(&self) -> usize {
        self.tracks.len()
    }

    pub fn failures(&self) -> &[TrackFailure] {
        &self.failures
    }

    pub fn track_delta_length(&self, track: usize) -> TickCounter {
        self.tracks[track].delta_length()
    }

    /// Source offsets visited by `track` in the most recent pass.
    pub fn visited_offsets(&self, track: usize) -> &BTreeSet<u32> {
        self.tracks[track].visited_offsets()
    }

    fn run_pass(&mut self, pass: Pass, sink: &mut dyn PassSink) {
        let stop_time = match pass {
            Pass::FindLength => None,
            // `find_length` is a hard precondition of the later passes
            Pass::BuildItems | Pass::EmitMidi => Some(self.stop_time.unwrap()),
        };

        self.decoder.begin_pass(pass);
        for t in &mut self.tracks {
            t.begin_pass();
        }

        let decoder = &mut self.decoder;
        let tracks = &mut self.tracks;
        let failures = &mut self.failures;

        match self.layout.scheduling {
            Scheduling::TrackSync => {
                for cursor in tracks.iter_mut() {
                    decode_track(decoder, cursor, pass, stop_time, sink, failures);
                }
            }
            Scheduling::TickSync => {
                decode_lockstep(decoder, tracks, pass, stop_time, sink, failures);
            }
        }
    }

    /// Pass 1: discovers how many ticks bound the sequence once every
    /// forever-loop has been taken the configured number of times.
    pub fn find_length(&mut self) -> TickCounter {
        if let Some(stop) = self.stop_time {
            return stop;
        }

        self.run_pass(Pass::FindLength, &mut LengthPass);

        let mut stop = TickCounter::new(0);
        for t in &mut self.tracks {
            let length = t.ticks();
            t.set_delta_length(length);
            stop = max(stop, length);
        }

        self.stop_time = Some(stop);
        stop
    }

    /// Pass 2: the annotated item tree for the UI sink.
    pub fn build_items(&mut self) -> Vec<Vec<EventRecord>> {
        self.find_length();

        let mut sink = ItemPass::new(self.tracks.len());
        self.run_pass(Pass::BuildItems, &mut sink);
        sink.into_items()
    }

    /// Pass 3: the MIDI file, chronologically sorted and terminated.
    pub fn emit_midi(&mut self) -> MidiFile {
        self.find_length();

        let mut midi = MidiFile::new(self.layout.ppqn);
        {
            let mut sink = MidiPass::new(&mut midi, self.tracks.len());
            self.write_initial_state(&mut sink);
            self.run_pass(Pass::EmitMidi, &mut sink);
        }
        midi.finalize_sort_by_time();
        midi
    }

    /// Controller state the driver assumes at power-on, written at tick 0
    /// before any decoded event.
    fn write_initial_state(&mut self, sink: &mut dyn PassSink) {
        let initial = self.layout.initial_state.clone();

        if !self.layout.name.is_empty() {
            sink.message(
                0,
                0,
                MidiMessage::TrackName {
                    text: self.layout.name.clone(),
                },
            );
        }

        if let Some(bpm) = initial.tempo_bpm {
            if let Ok(us) = bpm_to_microseconds_per_quarter(bpm) {
                sink.message(
                    0,
                    0,
                    MidiMessage::Tempo {
                        microseconds_per_quarter: us,
                    },
                );
            }
        }

        for (i, t) in self.tracks.iter().enumerate() {
            let channel = t.channel();

            if t.channel_group() > 0 {
                sink.message(
                    i,
                    0,
                    MidiMessage::MidiPort {
                        port: t.channel_group(),
                    },
                );
            }

            if let Some(v) = initial.volume {
                sink.message(
                    i,
                    0,
                    MidiMessage::Controller {
                        channel,
                        controller: 7,
                        value: v.min(127),
                    },
                );
            }
            if let Some(v) = initial.expression {
                sink.message(
                    i,
                    0,
                    MidiMessage::Controller {
                        channel,
                        controller: 11,
                        value: v.min(127),
                    },
                );
            }
            if let Some((semitones, cents)) = initial.pitch_bend_range {
                for (controller, value) in [(101, 0), (100, 0), (6, semitones), (38, cents)] {
                    sink.message(
                        i,
                        0,
                        MidiMessage::Controller {
                            channel,
                            controller,
                            value,
                        },
                    );
                }
            }
        }
    }

    /// Runs all three passes and collects every output.
    pub fn convert(mut self) -> Conversion {
        let stop_time = self.find_length();
        let items = self.build_items();
        let midi = self.emit_midi();

        let mut instruments_referenced = BTreeSet::new();
        for t in &self.tracks {
            instruments_referenced.extend(t.instruments_used().iter().copied());
        }

        Conversion {
            name: self.layout.name.clone(),
            midi,
            items,
            stop_time,
            instruments_referenced,
            failures: self.failures,
        }
    }
}

/// Whether the cursor may decode another event, applying the per-track
/// bounds shared by both scheduling disciplines.
fn may_step(cursor: &mut TrackCursor, stop_time: Option<TickCounter>) -> bool {
    if !cursor.is_active() {
        return false;
    }
    if let Some(stop_offset) = cursor.stop_offset() {
        if cursor.current_offset() >= stop_offset {
            cursor.deactivate();
            return false;
        }
    }
    if let Some(stop) = stop_time {
        if cursor.ticks() > stop {
            cursor.deactivate();
            return false;
        }
    }
    if !cursor.consume_event_budget() {
        cursor.deactivate();
        return false;
    }
    true
}

fn step<D: FormatDecoder>(
    decoder: &mut D,
    cursor: &mut TrackCursor,
    pass: Pass,
    sink: &mut dyn PassSink,
    failures: &mut Vec<TrackFailure>,
) {
    match decoder.read_event(cursor, sink) {
        Ok(true) => (),
        Ok(false) => cursor.deactivate(),
        Err(error) => {
            // Contain the failure: truncate this track, leave siblings alone.
            failures.push(TrackFailure {
                pass,
                track: cursor.track_index(),
                offset: cursor.current_offset(),
                error,
            });
            cursor.deactivate();
        }
    }
}

fn decode_track<D: FormatDecoder>(
    decoder: &mut D,
    cursor: &mut TrackCursor,
    pass: Pass,
    stop_time: Option<TickCounter>,
    sink: &mut dyn PassSink,
    failures: &mut Vec<TrackFailure>,
) {
    while may_step(cursor, stop_time) {
        step(decoder, cursor, pass, sink, failures);
    }
}

/// Tick-synchronous scheduling: every track decodes one tick's worth of
/// events before any track moves to the next tick.
fn decode_lockstep<D: FormatDecoder>(
    decoder: &mut D,
    tracks: &mut [TrackCursor],
    pass: Pass,
    stop_time: Option<TickCounter>,
    sink: &mut dyn PassSink,
    failures: &mut Vec<TrackFailure>,
) {
    let mut tick: u32 = 0;

    while tracks.iter().any(|t| t.is_active()) {
        if let Some(stop) = stop_time {
            if tick > stop.value() {
                for t in tracks.iter_mut() {
                    t.deactivate();
                }
                break;
            }
        }

        decoder.on_tick(tick);

        for cursor in tracks.iter_mut() {
            while cursor.is_active() && cursor.time() <= tick && may_step(cursor, stop_time) {
                step(decoder, cursor, pass, sink, failures);
            }
        }

        tick += 1;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::decoder::{AmplitudeScale, InitialState, TrackLayout};
    use crate::time::DEFAULT_PPQN;

    #[test]
    fn channel_assignment() {
        assert_eq!(auto_assign_channel(0, false), 0);
        assert_eq!(auto_assign_channel(9, false), 9);
        assert_eq!(auto_assign_channel(16, false), 0);

        assert_eq!(auto_assign_channel(8, true), 8);
        assert_eq!(auto_assign_channel(9, true), 10);
        assert_eq!(auto_assign_channel(14, true), 15);
        // wraps around 15 usable channels
        assert_eq!(auto_assign_channel(15, true), 0);
    }

    /// A two-track tick-synchronous decoder: every byte is a one-tick rest,
    /// 0xff ends the track.  The shared tick hook must fire once per tick.
    struct LockstepDecoder {
        ticks_seen: Vec<u32>,
    }

    impl FormatDecoder for LockstepDecoder {
        fn parse_header(
            &mut self,
            _source: &ByteSource,
        ) -> Result<SequenceLayout, HeaderError> {
            Ok(SequenceLayout {
                name: String::new(),
                ppqn: DEFAULT_PPQN,
                scheduling: Scheduling::TickSync,
                amplitude_scale: AmplitudeScale::Logarithmic,
                tracks: vec![
                    TrackLayout {
                        start_offset: 0,
                        stop_offset: None,
                    },
                    TrackLayout {
                        start_offset: 4,
                        stop_offset: None,
                    },
                ],
                initial_state: InitialState::default(),
            })
        }

        fn read_event(
            &mut self,
            cursor: &mut TrackCursor,
            sink: &mut dyn PassSink,
        ) -> Result<bool, DecodeError> {
            let start = cursor.current_offset();
            let op = cursor.read_u8()?;
            let range = cursor.range_from(start);

            match op {
                0xff => Ok(cursor.add_end_of_track(sink, range, "End of Track")),
                ticks => {
                    cursor.add_rest(sink, range, ticks.into(), "Rest");
                    Ok(true)
                }
            }
        }

        fn begin_pass(&mut self, _pass: Pass) {
            self.ticks_seen.clear();
        }

        fn on_tick(&mut self, tick: u32) {
            self.ticks_seen.push(tick);
        }
    }

    #[test]
    fn lockstep_scheduling_interleaves_by_tick() {
        // track 0: 3 ticks, track 1: 5 ticks
        let source = ByteSource::new(vec![1, 1, 1, 0xff, 1, 1, 1, 1, 1, 0xff], 0);
        let decoder = LockstepDecoder {
            ticks_seen: Vec::new(),
        };

        let mut engine =
            SequenceEngine::new(&source, decoder, &ConversionOptions::default()).unwrap();
        let stop = engine.find_length();

        assert_eq!(stop, TickCounter::new(5));
        assert_eq!(engine.track_delta_length(0), TickCounter::new(3));
        assert_eq!(engine.track_delta_length(1), TickCounter::new(5));

        let midi = engine.emit_midi();
        assert_eq!(midi.n_tracks(), 2);
    }

    #[test]
    fn stop_offset_truncates_the_track() {
        /// One-tick rests forever; the declared byte range must stop it.
        struct RestDecoder;
        impl FormatDecoder for RestDecoder {
            fn parse_header(
                &mut self,
                _source: &ByteSource,
            ) -> Result<SequenceLayout, HeaderError> {
                Ok(SequenceLayout {
                    name: String::new(),
                    ppqn: DEFAULT_PPQN,
                    scheduling: Scheduling::TrackSync,
                    amplitude_scale: AmplitudeScale::Logarithmic,
                    tracks: vec![TrackLayout {
                        start_offset: 0,
                        stop_offset: Some(3),
                    }],
                    initial_state: InitialState::default(),
                })
            }

            fn read_event(
                &mut self,
                cursor: &mut TrackCursor,
                sink: &mut dyn PassSink,
            ) -> Result<bool, DecodeError> {
                let start = cursor.current_offset();
                let ticks = cursor.read_u8()?;
                let range = cursor.range_from(start);
                cursor.add_rest(sink, range, ticks.into(), "Rest");
                Ok(true)
            }
        }

        let source = ByteSource::new(vec![1; 16], 0);
        let mut engine =
            SequenceEngine::new(&source, RestDecoder, &ConversionOptions::default()).unwrap();

        assert_eq!(engine.find_length(), TickCounter::new(3));
        assert!(engine.failures().is_empty());
    }

    #[test]
    fn track_pointer_validation() {
        struct BadHeader;
        impl FormatDecoder for BadHeader {
            fn parse_header(
                &mut self,
                _source: &ByteSource,
            ) -> Result<SequenceLayout, HeaderError> {
                Ok(SequenceLayout {
                    name: String::new(),
                    ppqn: DEFAULT_PPQN,
                    scheduling: Scheduling::TrackSync,
                    amplitude_scale: AmplitudeScale::Logarithmic,
                    tracks: vec![TrackLayout {
                        start_offset: 0x1000,
                        stop_offset: None,
                    }],
                    initial_state: InitialState::default(),
                })
            }

            fn read_event(
                &mut self,
                _cursor: &mut TrackCursor,
                _sink: &mut dyn PassSink,
            ) -> Result<bool, DecodeError> {
                unreachable!()
            }
        }

        let source = ByteSource::new(vec![0; 16], 0);
        let e = SequenceEngine::new(&source, BadHeader, &ConversionOptions::default());
        assert_eq!(
            e.err(),
            Some(HeaderError::TrackPointerOutOfRange {
                track: 0,
                offset: 0x1000
            })
        );
    }
}
