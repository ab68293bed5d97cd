//! The capability contract every format decoder plugs into

// SPDX-FileCopyrightText: © 2023 Marcus Rowe <undisbeliever@gmail.com>
//
// SPDX-License-Identifier: MIT

use crate::byte_source::ByteSource;
use crate::errors::{DecodeError, HeaderError};
use crate::passes::{Pass, PassSink};
use crate::time::Ppqn;
use crate::track::TrackCursor;

/// How the engine interleaves multi-track decoding within one pass.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Scheduling {
    /// Each track is decoded to completion independently, in track index
    /// order.  Correct for formats whose tracks only carry statically fixed
    /// delta times.
    TrackSync,

    /// All tracks advance one tick at a time in lock-step.  Required by
    /// formats where a shared micro-timer (hardware LFO clocks and the like)
    /// modulates per-tick state across tracks.
    TickSync,
}

/// Whether the format's volume/velocity values are linear amplitude
/// multipliers (converted to the logarithmic MIDI scale on emission) or
/// already follow the MIDI convention.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AmplitudeScale {
    Linear,
    Logarithmic,
}

/// Controller state a driver establishes at power-on rather than through
/// opcodes.  Written at tick 0 of the MIDI-emission pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InitialState {
    pub volume: Option<u8>,
    pub expression: Option<u8>,
    pub pitch_bend_range: Option<(u8, u8)>,
    pub tempo_bpm: Option<f64>,
}

/// One track discovered by header parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackLayout {
    pub start_offset: u32,

    /// Hard upper bound on the track's byte range, when the header declares
    /// one.  Reaching it truncates the track like a natural end.
    pub stop_offset: Option<u32>,
}

/// Everything the engine needs to know about a sequence before decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceLayout {
    pub name: String,
    pub ppqn: Ppqn,
    pub scheduling: Scheduling,
    pub amplitude_scale: AmplitudeScale,
    pub tracks: Vec<TrackLayout>,
    pub initial_state: InitialState,
}

/// A pluggable per-format opcode interpreter.
///
/// The engine calls `read_event` once per event; the decoder reads opcode and
/// operand bytes through the cursor and reports what it found through the
/// cursor's emission API.  Decoders must not write MIDI or item output
/// directly; everything goes through the cursor so the three-pass replay
/// stays valid.
pub trait FormatDecoder {
    fn parse_header(&mut self, source: &ByteSource) -> Result<SequenceLayout, HeaderError>;

    /// Decode one event.  Returns `false` when the track should stop
    /// (natural end, exhausted loop bound, or unwinding after an error).
    fn read_event(
        &mut self,
        cursor: &mut TrackCursor,
        sink: &mut dyn PassSink,
    ) -> Result<bool, DecodeError>;

    /// Called at the start of every pass.  Decoders holding per-pass state
    /// must reset it here or the replay passes will diverge.
    fn begin_pass(&mut self, _pass: Pass) {}

    /// Called once per global tick in tick-synchronous scheduling, before
    /// the per-track bursts for that tick.
    fn on_tick(&mut self, _tick: u32) {}
}
