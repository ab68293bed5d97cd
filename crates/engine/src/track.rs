//! Per-track byte-cursor interpreter state and emission primitives

// SPDX-FileCopyrightText: © 2023 Marcus Rowe <undisbeliever@gmail.com>
//
// SPDX-License-Identifier: MIT

use crate::byte_source::{ByteSource, Endian};
use crate::decoder::{AmplitudeScale, TrackLayout};
use crate::errors::DecodeError;
use crate::event::{ByteRange, ControllerTarget, EventKind, EventRecord};
use crate::midi::{MidiMessage, DRUM_CHANNEL};
use crate::passes::PassSink;
use crate::scale::percent_amplitude_to_std_midi_val;
use crate::time::{bpm_to_microseconds_per_quarter, TickCounter, DEFAULT_TEMPO_MICROSECONDS};

use std::collections::BTreeSet;

/// Bounded subroutine-call nesting.  Real drivers allow 1-3 levels; anything
/// deeper indicates corrupt or mis-detected input.
pub const MAX_CALL_STACK_DEPTH: usize = 8;

pub const MAX_FINITE_LOOP_DEPTH: usize = 4;

// Prevent infinite decode loops on pathological input by limiting the number
// of events processed in one pass.
const MAX_EVENTS_PER_PASS: u32 = 250_000;

const DEFAULT_OCTAVE: u8 = 4;
const DEFAULT_VELOCITY: u8 = 100;
const DEFAULT_VOLUME: u8 = 100;
const DEFAULT_EXPRESSION: u8 = 127;
const CENTER_PAN: u8 = 64;

#[derive(Debug, Copy, Clone, Default)]
struct LoopFrame {
    restart_offset: u32,
    remaining: u16,
}

/// Per-track interpreter state.
///
/// A format decoder reads opcode/operand bytes through the cursor (all
/// advancement goes through the bounds-checked `ByteSource`) and reports each
/// decoded action through exactly one `add_*` primitive.  The primitives are
/// pass-polymorphic: the injected `PassSink` decides whether an action
/// becomes a UI item, MIDI messages, or nothing at all.
pub struct TrackCursor<'a> {
    source: &'a ByteSource,
    track_index: usize,
    start_offset: u32,
    stop_offset: Option<u32>,
    channel: u8,
    channel_group: u8,
    amplitude_scale: AmplitudeScale,
    repeat_limit: u32,

    offset: u32,
    ticks: TickCounter,
    active: bool,
    visited: BTreeSet<u32>,

    call_stack: [u32; MAX_CALL_STACK_DEPTH],
    call_depth: usize,
    loop_stack: [LoopFrame; MAX_FINITE_LOOP_DEPTH],
    loop_depth: usize,
    forever_loops: u32,

    octave: u8,
    transpose: i8,
    key_correction: i8,
    velocity: u8,
    volume: u8,
    expression: u8,
    pan: u8,
    reverb: u8,
    prev_key: u8,
    prev_velocity: u8,
    drum_note: Option<u8>,

    delta_length: TickCounter,
    instruments_used: BTreeSet<u32>,
    event_budget: u32,
}

impl<'a> TrackCursor<'a> {
    pub fn new(
        source: &'a ByteSource,
        track_index: usize,
        layout: &TrackLayout,
        channel: u8,
        amplitude_scale: AmplitudeScale,
        repeat_limit: u32,
    ) -> TrackCursor<'a> {
        assert!(channel < 16);
        assert!(repeat_limit >= 1);

        let mut c = TrackCursor {
            source,
            track_index,
            start_offset: layout.start_offset,
            stop_offset: layout.stop_offset,
            channel,
            // Pieces with more than 16 tracks spill onto a second MIDI port.
            channel_group: (track_index / 16) as u8,
            amplitude_scale,
            repeat_limit,

            offset: layout.start_offset,
            ticks: TickCounter::new(0),
            active: true,
            visited: BTreeSet::new(),

            call_stack: [0; MAX_CALL_STACK_DEPTH],
            call_depth: 0,
            loop_stack: [LoopFrame::default(); MAX_FINITE_LOOP_DEPTH],
            loop_depth: 0,
            forever_loops: 0,

            octave: DEFAULT_OCTAVE,
            transpose: 0,
            key_correction: 0,
            velocity: DEFAULT_VELOCITY,
            volume: DEFAULT_VOLUME,
            expression: DEFAULT_EXPRESSION,
            pan: CENTER_PAN,
            reverb: 0,
            prev_key: 0,
            prev_velocity: DEFAULT_VELOCITY,
            drum_note: None,

            delta_length: TickCounter::new(0),
            instruments_used: BTreeSet::new(),
            event_budget: MAX_EVENTS_PER_PASS,
        };
        c.begin_pass();
        c
    }

    /// Rewinds every piece of per-pass state.  The decode loop must replay
    /// identically in all three passes; only `delta_length` (pass 1's result)
    /// and the referenced-instrument set survive a reset.
    pub fn begin_pass(&mut self) {
        self.offset = self.start_offset;
        self.ticks = TickCounter::new(0);
        self.active = true;
        self.visited.clear();

        self.call_depth = 0;
        self.loop_depth = 0;
        self.forever_loops = 0;

        self.octave = DEFAULT_OCTAVE;
        self.transpose = 0;
        self.key_correction = 0;
        self.velocity = DEFAULT_VELOCITY;
        self.volume = DEFAULT_VOLUME;
        self.expression = DEFAULT_EXPRESSION;
        self.pan = CENTER_PAN;
        self.reverb = 0;
        self.prev_key = 0;
        self.prev_velocity = DEFAULT_VELOCITY;
        self.drum_note = None;

        self.event_budget = MAX_EVENTS_PER_PASS;
    }

    // State accessors
    // ===============

    pub fn track_index(&self) -> usize {
        self.track_index
    }

    pub fn current_offset(&self) -> u32 {
        self.offset
    }

    pub fn start_offset(&self) -> u32 {
        self.start_offset
    }

    pub fn stop_offset(&self) -> Option<u32> {
        self.stop_offset
    }

    pub fn ticks(&self) -> TickCounter {
        self.ticks
    }

    pub fn time(&self) -> u32 {
        self.ticks.value()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn deactivate(&mut self) {
        self.active = false;
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// MIDI port index for pieces with more tracks than channels.
    pub fn channel_group(&self) -> u8 {
        self.channel_group
    }

    pub fn visited_offsets(&self) -> &BTreeSet<u32> {
        &self.visited
    }

    pub fn is_visited(&self, offset: u32) -> bool {
        self.visited.contains(&offset)
    }

    pub fn delta_length(&self) -> TickCounter {
        self.delta_length
    }

    pub(crate) fn set_delta_length(&mut self, length: TickCounter) {
        self.delta_length = length;
    }

    pub fn instruments_used(&self) -> &BTreeSet<u32> {
        &self.instruments_used
    }

    pub fn octave(&self) -> u8 {
        self.octave
    }

    pub fn set_octave(&mut self, octave: u8) {
        self.octave = octave.min(10);
    }

    /// MIDI key of scale step `step` in the current octave.
    pub fn octave_key(&self, step: u8) -> u8 {
        (u32::from(self.octave) * 12 + u32::from(step)).min(127) as u8
    }

    pub fn set_transpose(&mut self, transpose: i8) {
        self.transpose = transpose;
    }

    pub fn set_key_correction(&mut self, correction: i8) {
        self.key_correction = correction;
    }

    /// Running velocity for formats whose note opcodes carry no velocity.
    pub fn velocity(&self) -> u8 {
        self.velocity
    }

    pub fn set_velocity(&mut self, velocity: u8) {
        self.velocity = velocity.min(127);
    }

    /// Key of the most recent note on, after remapping.
    pub fn prev_key(&self) -> u8 {
        self.prev_key
    }

    pub fn prev_velocity(&self) -> u8 {
        self.prev_velocity
    }

    pub fn volume(&self) -> u8 {
        self.volume
    }

    pub fn expression(&self) -> u8 {
        self.expression
    }

    pub fn pan(&self) -> u8 {
        self.pan
    }

    /// Redirect subsequent notes to the percussion channel, substituting
    /// `key` for whatever key the decoder reports.  `None` restores normal
    /// note handling.  Invisible to the decoder's own bookkeeping.
    pub fn set_drum_note(&mut self, key: Option<u8>) {
        self.drum_note = key.map(|k| k.min(127));
    }

    pub(crate) fn consume_event_budget(&mut self) -> bool {
        match self.event_budget.checked_sub(1) {
            Some(b) => {
                self.event_budget = b;
                true
            }
            None => false,
        }
    }

    // Byte reads (the only way a decoder advances the cursor)
    // =======================================================

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let b = self.source.read_u8(self.offset)?;
        self.offset += 1;
        Ok(b)
    }

    pub fn read_i8(&mut self) -> Result<i8, DecodeError> {
        let b = self.source.read_i8(self.offset)?;
        self.offset += 1;
        Ok(b)
    }

    pub fn read_u16(&mut self, endian: Endian) -> Result<u16, DecodeError> {
        let v = self.source.read_u16(self.offset, endian)?;
        self.offset += 2;
        Ok(v)
    }

    pub fn read_u32(&mut self, endian: Endian) -> Result<u32, DecodeError> {
        let v = self.source.read_u32(self.offset, endian)?;
        self.offset += 4;
        Ok(v)
    }

    pub fn peek_u8(&self) -> Result<u8, DecodeError> {
        Ok(self.source.read_u8(self.offset)?)
    }

    /// The byte range consumed since `start` (the event's opcode offset).
    pub fn range_from(&self, start: u32) -> ByteRange {
        assert!(self.offset >= start);
        ByteRange::new(start, self.offset - start)
    }

    // Emission primitives
    // ===================

    fn record(&mut self, sink: &mut dyn PassSink, range: ByteRange, kind: EventKind, label: &str) {
        // The cycle guard: every executed event marks its start offset, the
        // item sink only hears about the first visit.
        let first_visit = self.visited.insert(range.offset);
        if first_visit {
            sink.item(self.track_index, &EventRecord::new(range, kind, label));
        }
    }

    fn amplitude_value(&self, value: u8) -> u8 {
        match self.amplitude_scale {
            AmplitudeScale::Linear => percent_amplitude_to_std_midi_val(value),
            AmplitudeScale::Logarithmic => value.min(127),
        }
    }

    fn note_destination(&self, key: u8) -> (u8, u8) {
        match self.drum_note {
            Some(drum_key) => (DRUM_CHANNEL, drum_key),
            None => {
                let k = i32::from(key) + i32::from(self.transpose) + i32::from(self.key_correction);
                (self.channel, k.clamp(0, 127) as u8)
            }
        }
    }

    pub fn advance(&mut self, ticks: u32) {
        self.ticks += TickCounter::new(ticks);
    }

    /// A note that sounds for `duration` ticks starting now.  Does not
    /// advance the cursor's time; rests and explicit `advance` calls do.
    pub fn add_note_by_duration(
        &mut self,
        sink: &mut dyn PassSink,
        range: ByteRange,
        key: u8,
        velocity: u8,
        duration: u32,
        label: &str,
    ) {
        let velocity = self.amplitude_value(velocity);
        let (channel, key) = self.note_destination(key);

        self.prev_key = key;
        self.prev_velocity = velocity;

        self.record(
            sink,
            range,
            EventKind::NoteWithDuration {
                key,
                velocity,
                duration,
            },
            label,
        );

        let tick = self.ticks.value();
        sink.message(
            self.track_index,
            tick,
            MidiMessage::NoteOn {
                channel,
                key,
                velocity,
            },
        );
        sink.message(
            self.track_index,
            tick + duration,
            MidiMessage::NoteOff { channel, key },
        );
    }

    pub fn add_note_on(
        &mut self,
        sink: &mut dyn PassSink,
        range: ByteRange,
        key: u8,
        velocity: u8,
        label: &str,
    ) {
        let velocity = self.amplitude_value(velocity);
        let (channel, key) = self.note_destination(key);

        self.prev_key = key;
        self.prev_velocity = velocity;

        self.record(sink, range, EventKind::NoteOn { key, velocity }, label);
        sink.message(
            self.track_index,
            self.ticks.value(),
            MidiMessage::NoteOn {
                channel,
                key,
                velocity,
            },
        );
    }

    pub fn add_note_off(
        &mut self,
        sink: &mut dyn PassSink,
        range: ByteRange,
        key: u8,
        label: &str,
    ) {
        let (channel, key) = self.note_destination(key);

        self.record(sink, range, EventKind::NoteOff { key }, label);
        sink.message(
            self.track_index,
            self.ticks.value(),
            MidiMessage::NoteOff { channel, key },
        );
    }

    /// Note off for the most recent note on (off-pairing for formats whose
    /// note-off opcode carries no key).
    pub fn add_note_off_prev(&mut self, sink: &mut dyn PassSink, range: ByteRange, label: &str) {
        let key = self.prev_key;
        let channel = match self.drum_note {
            Some(_) => DRUM_CHANNEL,
            None => self.channel,
        };

        self.record(sink, range, EventKind::NoteOff { key }, label);
        sink.message(
            self.track_index,
            self.ticks.value(),
            MidiMessage::NoteOff { channel, key },
        );
    }

    pub fn add_rest(&mut self, sink: &mut dyn PassSink, range: ByteRange, ticks: u32, label: &str) {
        self.record(sink, range, EventKind::Rest { ticks }, label);
        self.advance(ticks);
    }

    pub fn add_controller(
        &mut self,
        sink: &mut dyn PassSink,
        range: ByteRange,
        target: ControllerTarget,
        value: u8,
        label: &str,
    ) {
        let value = if target.is_amplitude() {
            self.amplitude_value(value)
        } else {
            value.min(127)
        };
        self.set_controller_state(target, value);

        self.record(
            sink,
            range,
            EventKind::ControllerChange { target, value },
            label,
        );
        sink.message(
            self.track_index,
            self.ticks.value(),
            MidiMessage::Controller {
                channel: self.channel,
                controller: target.controller_number(),
                value,
            },
        );
    }

    /// A ramp from `start_value` to `end_value` over `duration` ticks.
    ///
    /// Expanded into at most one controller message per tick.  Ticks whose
    /// rounded value equals the previous tick's emit nothing.
    pub fn add_controller_slide(
        &mut self,
        sink: &mut dyn PassSink,
        range: ByteRange,
        target: ControllerTarget,
        start_value: u8,
        end_value: u8,
        duration: u32,
        label: &str,
    ) {
        let start_value = start_value.min(127);
        let end_value = end_value.min(127);

        self.record(
            sink,
            range,
            EventKind::ControllerSlide {
                target,
                start_value,
                end_value,
                duration,
            },
            label,
        );

        let base_tick = self.ticks.value();
        let controller = target.controller_number();

        let convert = |raw: f64| -> u8 {
            let raw = raw.round().clamp(0.0, 127.0) as u8;
            if target.is_amplitude() {
                self.amplitude_value(raw)
            } else {
                raw
            }
        };

        if duration == 0 {
            let v = convert(f64::from(end_value));
            sink.message(
                self.track_index,
                base_tick,
                MidiMessage::Controller {
                    channel: self.channel,
                    controller,
                    value: v,
                },
            );
        } else {
            let mut prev: Option<u8> = None;
            for t in 0..=duration {
                let raw = f64::from(start_value)
                    + (f64::from(end_value) - f64::from(start_value)) * f64::from(t)
                        / f64::from(duration);
                let v = convert(raw);

                if prev != Some(v) {
                    sink.message(
                        self.track_index,
                        base_tick + t,
                        MidiMessage::Controller {
                            channel: self.channel,
                            controller,
                            value: v,
                        },
                    );
                    prev = Some(v);
                }
            }
        }

        let final_value = if target.is_amplitude() {
            self.amplitude_value(end_value)
        } else {
            end_value
        };
        self.set_controller_state(target, final_value);
    }

    fn set_controller_state(&mut self, target: ControllerTarget, value: u8) {
        match target {
            ControllerTarget::Volume => self.volume = value,
            ControllerTarget::Expression => self.expression = value,
            ControllerTarget::Pan => self.pan = value,
            ControllerTarget::Reverb => self.reverb = value,
            ControllerTarget::Modulation | ControllerTarget::Sustain => (),
        }
    }

    pub fn add_program_change(
        &mut self,
        sink: &mut dyn PassSink,
        range: ByteRange,
        program: u8,
        label: &str,
    ) {
        let program = program.min(127);
        self.instruments_used.insert(program.into());

        self.record(sink, range, EventKind::ProgramChange { program }, label);
        sink.message(
            self.track_index,
            self.ticks.value(),
            MidiMessage::ProgramChange {
                channel: self.channel,
                program,
            },
        );
    }

    pub fn add_tempo(
        &mut self,
        sink: &mut dyn PassSink,
        range: ByteRange,
        microseconds_per_quarter: u32,
        label: &str,
    ) {
        self.record(
            sink,
            range,
            EventKind::Tempo {
                microseconds_per_quarter,
            },
            label,
        );
        sink.message(
            self.track_index,
            self.ticks.value(),
            MidiMessage::Tempo {
                microseconds_per_quarter,
            },
        );
    }

    pub fn add_tempo_bpm(
        &mut self,
        sink: &mut dyn PassSink,
        range: ByteRange,
        bpm: f64,
        label: &str,
    ) {
        // A driver tempo of 0 would divide by zero; fall back to the SMF default.
        let us = bpm_to_microseconds_per_quarter(bpm).unwrap_or(DEFAULT_TEMPO_MICROSECONDS);
        self.add_tempo(sink, range, us, label);
    }

    pub fn add_time_signature(
        &mut self,
        sink: &mut dyn PassSink,
        range: ByteRange,
        numerator: u8,
        denominator: u8,
        label: &str,
    ) {
        self.record(
            sink,
            range,
            EventKind::TimeSignature {
                numerator,
                denominator,
            },
            label,
        );
        sink.message(
            self.track_index,
            self.ticks.value(),
            MidiMessage::TimeSignature {
                numerator,
                denominator,
            },
        );
    }

    /// `value` is a signed offset from centre, -8192..=8191.
    pub fn add_pitch_bend(
        &mut self,
        sink: &mut dyn PassSink,
        range: ByteRange,
        value: i16,
        label: &str,
    ) {
        self.record(sink, range, EventKind::PitchBend { value }, label);

        let wire = (i32::from(value) + 0x2000).clamp(0, 0x3fff) as u16;
        sink.message(
            self.track_index,
            self.ticks.value(),
            MidiMessage::PitchBend {
                channel: self.channel,
                value: wire,
            },
        );
    }

    /// Emitted as the standard RPN 0 sequence.
    pub fn add_pitch_bend_range(
        &mut self,
        sink: &mut dyn PassSink,
        range: ByteRange,
        semitones: u8,
        cents: u8,
        label: &str,
    ) {
        self.record(
            sink,
            range,
            EventKind::PitchBendRange { semitones, cents },
            label,
        );

        let tick = self.ticks.value();
        for (controller, value) in [(101, 0), (100, 0), (6, semitones), (38, cents)] {
            sink.message(
                self.track_index,
                tick,
                MidiMessage::Controller {
                    channel: self.channel,
                    controller,
                    value,
                },
            );
        }
    }

    pub fn add_marker(
        &mut self,
        sink: &mut dyn PassSink,
        range: ByteRange,
        name: &str,
        data: &[u8],
        label: &str,
    ) {
        self.record(
            sink,
            range,
            EventKind::Marker {
                name: name.to_owned(),
                data: data.to_vec(),
            },
            label,
        );
        sink.message(
            self.track_index,
            self.ticks.value(),
            MidiMessage::Marker {
                text: name.to_owned(),
            },
        );
    }

    /// Undocumented opcode: label the bytes and keep decoding.
    pub fn add_unknown(&mut self, sink: &mut dyn PassSink, range: ByteRange, label: &str) {
        self.record(sink, range, EventKind::Unknown, label);
    }

    pub fn add_end_of_track(
        &mut self,
        sink: &mut dyn PassSink,
        range: ByteRange,
        label: &str,
    ) -> bool {
        self.record(sink, range, EventKind::TrackEnd, label);
        sink.message(
            self.track_index,
            self.ticks.value(),
            MidiMessage::EndOfTrack,
        );

        self.active = false;
        false
    }

    /// A confirmed forever loop.  Returns whether the loop may be taken
    /// again; once the configured repeat count is exhausted the track stops
    /// exactly as if it had reached a natural end.
    pub fn add_loop_forever(
        &mut self,
        sink: &mut dyn PassSink,
        range: ByteRange,
        label: &str,
    ) -> bool {
        self.record(sink, range, EventKind::LoopForever, label);

        if self.forever_loops < self.repeat_limit {
            self.forever_loops += 1;
            true
        } else {
            self.active = false;
            false
        }
    }

    /// An unconditional jump.  A destination inside already-visited bytes is
    /// a confirmed loop and goes through the forever-loop bound; an unvisited
    /// destination is a plain branch.
    pub fn add_jump(
        &mut self,
        sink: &mut dyn PassSink,
        range: ByteRange,
        destination: u32,
        label: &str,
    ) -> bool {
        if self.visited.contains(&destination) {
            let continuing = self.add_loop_forever(sink, range, label);
            if continuing {
                self.offset = destination;
            }
            continuing
        } else {
            self.record(
                sink,
                range,
                EventKind::Marker {
                    name: label.to_owned(),
                    data: Vec::new(),
                },
                label,
            );
            self.offset = destination;
            true
        }
    }

    pub fn call_subroutine(
        &mut self,
        sink: &mut dyn PassSink,
        range: ByteRange,
        destination: u32,
        label: &str,
    ) -> Result<(), DecodeError> {
        if self.call_depth >= MAX_CALL_STACK_DEPTH {
            return Err(DecodeError::LoopNestingExceeded {
                depth: self.call_depth,
            });
        }

        self.record(
            sink,
            range,
            EventKind::Marker {
                name: label.to_owned(),
                data: Vec::new(),
            },
            label,
        );

        self.call_stack[self.call_depth] = self.offset;
        self.call_depth += 1;
        self.offset = destination;
        Ok(())
    }

    /// Return to the saved call address.  With an empty stack the track ends
    /// (the return opcode doubles as end-of-data in several drivers).
    pub fn return_from_subroutine(
        &mut self,
        sink: &mut dyn PassSink,
        range: ByteRange,
        label: &str,
    ) -> bool {
        self.record(
            sink,
            range,
            EventKind::Marker {
                name: label.to_owned(),
                data: Vec::new(),
            },
            label,
        );

        match self.call_depth.checked_sub(1) {
            Some(d) => {
                self.call_depth = d;
                self.offset = self.call_stack[d];
                true
            }
            None => {
                self.active = false;
                false
            }
        }
    }

    /// `count` is the total number of iterations; 0 means 256.
    pub fn loop_start(
        &mut self,
        sink: &mut dyn PassSink,
        range: ByteRange,
        count: u8,
        label: &str,
    ) -> Result<(), DecodeError> {
        if self.loop_depth >= MAX_FINITE_LOOP_DEPTH {
            return Err(DecodeError::LoopNestingExceeded {
                depth: self.loop_depth,
            });
        }

        self.record(
            sink,
            range,
            EventKind::Marker {
                name: label.to_owned(),
                data: Vec::new(),
            },
            label,
        );

        self.loop_stack[self.loop_depth] = LoopFrame {
            restart_offset: self.offset,
            remaining: if count == 0 { 256 } else { count.into() },
        };
        self.loop_depth += 1;
        Ok(())
    }

    pub fn loop_end(&mut self, sink: &mut dyn PassSink, range: ByteRange, label: &str) {
        self.record(
            sink,
            range,
            EventKind::Marker {
                name: label.to_owned(),
                data: Vec::new(),
            },
            label,
        );

        // A loop end without a matching start is malformed; skip it and keep
        // decoding (best-effort recovery).
        if self.loop_depth == 0 {
            return;
        }

        let frame = &mut self.loop_stack[self.loop_depth - 1];
        frame.remaining -= 1;
        if frame.remaining > 0 {
            self.offset = frame.restart_offset;
        } else {
            self.loop_depth -= 1;
        }
    }
}
