//! SQB sequence bytecode decoder

// SPDX-FileCopyrightText: © 2023 Marcus Rowe <undisbeliever@gmail.com>
//
// SPDX-License-Identifier: MIT

//
// SQB is the driver-agnostic sequence bytecode used by the conformance
// corpus and the command-line converter.
//
// Layout:
//      +0  signature "SQB0"
//      +4  u8 track count (1-16)
//      +5  u8 ticks per quarter note
//      +6  u16-LE track start offset, one per track, relative to the
//          start of the sequence
//
// Track data is a stream of one-byte opcodes with fixed-length operands.
// Opcodes 0x00-0x7f play the note with that MIDI key; everything in the
// 0x90-0xfe gap is undocumented and skipped.

use crate::byte_source::{ByteSource, Endian};
use crate::decoder::{
    AmplitudeScale, FormatDecoder, InitialState, Scheduling, SequenceLayout, TrackLayout,
};
use crate::errors::{DecodeError, HeaderError};
use crate::event::ControllerTarget;
use crate::passes::PassSink;
use crate::time::Ppqn;
use crate::track::TrackCursor;

pub const SIGNATURE: &[u8; 4] = b"SQB0";

pub const MAX_TRACKS: u8 = 16;

pub mod opcodes {
    pub const LAST_NOTE_OPCODE: u8 = 0x7f;

    pub const REST: u8 = 0x80;
    pub const SET_VOLUME: u8 = 0x81;
    pub const SET_EXPRESSION: u8 = 0x82;
    pub const SET_PAN: u8 = 0x83;
    pub const PROGRAM_CHANGE: u8 = 0x84;
    pub const SET_TEMPO: u8 = 0x85;
    pub const PITCH_BEND: u8 = 0x86;
    pub const SET_TRANSPOSE: u8 = 0x87;
    pub const VOLUME_SLIDE: u8 = 0x88;
    pub const START_LOOP: u8 = 0x89;
    pub const END_LOOP: u8 = 0x8a;
    pub const CALL_SUBROUTINE: u8 = 0x8b;
    pub const RETURN_FROM_SUBROUTINE: u8 = 0x8c;
    pub const JUMP: u8 = 0x8d;
    pub const DRUM_MODE: u8 = 0x8e;
    pub const TIME_SIGNATURE: u8 = 0x8f;

    pub const END_OF_TRACK: u8 = 0xff;
}

const HEADER_SIZE: u32 = 6;

#[derive(Default)]
pub struct SqbDecoder;

impl SqbDecoder {
    pub fn new() -> SqbDecoder {
        SqbDecoder
    }
}

impl FormatDecoder for SqbDecoder {
    fn parse_header(&mut self, source: &ByteSource) -> Result<SequenceLayout, HeaderError> {
        if source.bytes(0, 4)? != SIGNATURE.as_slice() {
            return Err(HeaderError::BadSignature);
        }

        let n_tracks = source.read_u8(4)?;
        if n_tracks == 0 {
            return Err(HeaderError::NoTracks);
        }
        if n_tracks > MAX_TRACKS {
            return Err(HeaderError::TooManyTracks(n_tracks.into()));
        }

        let ppqn = Ppqn::try_from(u32::from(source.read_u8(5)?))?;

        let table_end = HEADER_SIZE + u32::from(n_tracks) * 2;

        let mut tracks = Vec::with_capacity(n_tracks.into());
        for i in 0..u32::from(n_tracks) {
            let offset: u32 = source.read_u16(HEADER_SIZE + i * 2, Endian::Little)?.into();

            // A pointer into the header (or past the end of the data) marks
            // the table as implausible.
            if offset < table_end || !source.is_valid_offset(offset) {
                return Err(HeaderError::TrackPointerOutOfRange {
                    track: i as usize,
                    offset,
                });
            }

            tracks.push(TrackLayout {
                start_offset: offset,
                stop_offset: None,
            });
        }

        Ok(SequenceLayout {
            name: "SQB Sequence".to_owned(),
            ppqn,
            scheduling: Scheduling::TrackSync,
            amplitude_scale: AmplitudeScale::Logarithmic,
            tracks,
            initial_state: InitialState::default(),
        })
    }

    fn read_event(
        &mut self,
        cursor: &mut TrackCursor,
        sink: &mut dyn PassSink,
    ) -> Result<bool, DecodeError> {
        let start = cursor.current_offset();
        let opcode = cursor.read_u8()?;

        if opcode <= opcodes::LAST_NOTE_OPCODE {
            let velocity = cursor.read_u8()?;
            let duration = cursor.read_u8()?;
            let range = cursor.range_from(start);

            cursor.add_note_by_duration(sink, range, opcode, velocity, duration.into(), "Note");
            cursor.advance(duration.into());
            return Ok(true);
        }

        match opcode {
            opcodes::REST => {
                let ticks = cursor.read_u8()?;
                let range = cursor.range_from(start);
                cursor.add_rest(sink, range, ticks.into(), "Rest");
            }

            opcodes::SET_VOLUME => {
                let value = cursor.read_u8()?;
                let range = cursor.range_from(start);
                cursor.add_controller(sink, range, ControllerTarget::Volume, value, "Volume");
            }
            opcodes::SET_EXPRESSION => {
                let value = cursor.read_u8()?;
                let range = cursor.range_from(start);
                cursor.add_controller(
                    sink,
                    range,
                    ControllerTarget::Expression,
                    value,
                    "Expression",
                );
            }
            opcodes::SET_PAN => {
                let value = cursor.read_u8()?;
                let range = cursor.range_from(start);
                cursor.add_controller(sink, range, ControllerTarget::Pan, value, "Pan");
            }

            opcodes::PROGRAM_CHANGE => {
                let program = cursor.read_u8()?;
                let range = cursor.range_from(start);
                cursor.add_program_change(sink, range, program, "Program Change");
            }

            opcodes::SET_TEMPO => {
                let bpm = cursor.read_u8()?;
                let range = cursor.range_from(start);
                cursor.add_tempo_bpm(sink, range, bpm.into(), "Tempo");
            }

            opcodes::PITCH_BEND => {
                let value = cursor.read_i8()?;
                let range = cursor.range_from(start);
                cursor.add_pitch_bend(sink, range, i16::from(value) << 6, "Pitch Bend");
            }

            opcodes::SET_TRANSPOSE => {
                let semitones = cursor.read_i8()?;
                let range = cursor.range_from(start);
                cursor.set_transpose(semitones);
                cursor.add_marker(sink, range, "Transpose", &[], "Transpose");
            }

            opcodes::VOLUME_SLIDE => {
                let target = cursor.read_u8()?;
                let ticks = cursor.read_u8()?;
                let range = cursor.range_from(start);
                let start_value = cursor.volume();
                cursor.add_controller_slide(
                    sink,
                    range,
                    ControllerTarget::Volume,
                    start_value,
                    target,
                    ticks.into(),
                    "Volume Slide",
                );
            }

            opcodes::START_LOOP => {
                let count = cursor.read_u8()?;
                let range = cursor.range_from(start);
                cursor.loop_start(sink, range, count, "Loop Start")?;
            }
            opcodes::END_LOOP => {
                let range = cursor.range_from(start);
                cursor.loop_end(sink, range, "Loop End");
            }

            opcodes::CALL_SUBROUTINE => {
                let destination = cursor.read_u16(Endian::Little)?;
                let range = cursor.range_from(start);
                cursor.call_subroutine(sink, range, destination.into(), "Call")?;
            }
            opcodes::RETURN_FROM_SUBROUTINE => {
                let range = cursor.range_from(start);
                return Ok(cursor.return_from_subroutine(sink, range, "Return"));
            }

            opcodes::JUMP => {
                let destination = cursor.read_u16(Endian::Little)?;
                let range = cursor.range_from(start);
                return Ok(cursor.add_jump(sink, range, destination.into(), "Jump"));
            }

            opcodes::DRUM_MODE => {
                let key = cursor.read_u8()?;
                let range = cursor.range_from(start);
                cursor.set_drum_note(if key <= 127 { Some(key) } else { None });
                cursor.add_marker(sink, range, "Drum Mode", &[key], "Drum Mode");
            }

            opcodes::TIME_SIGNATURE => {
                let numerator = cursor.read_u8()?;
                let denominator = cursor.read_u8()?;
                let range = cursor.range_from(start);
                cursor.add_time_signature(sink, range, numerator, denominator, "Time Signature");
            }

            opcodes::END_OF_TRACK => {
                let range = cursor.range_from(start);
                return Ok(cursor.add_end_of_track(sink, range, "End of Track"));
            }

            // Undocumented opcode: label the byte and keep decoding.
            _ => {
                let range = cursor.range_from(start);
                cursor.add_unknown(sink, range, "Unknown Event");
            }
        }

        Ok(true)
    }
}
