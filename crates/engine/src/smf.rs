//! Standard MIDI File (format 1) serialisation

// SPDX-FileCopyrightText: © 2023 Marcus Rowe <undisbeliever@gmail.com>
//
// SPDX-License-Identifier: MIT

use crate::midi::{MidiFile, MidiMessage, MidiTrack};

const NOTE_OFF_VELOCITY: u8 = 0x40;

fn encode_variable_length(mut value: u32, out: &mut Vec<u8>) {
    // 7 bits per byte, most significant first, continuation bit on all but the last
    let mut buf = [0u8; 5];
    let mut n = 0;

    loop {
        buf[n] = (value & 0x7f) as u8;
        value >>= 7;
        n += 1;
        if value == 0 {
            break;
        }
    }

    for i in (0..n).rev() {
        let continuation = if i == 0 { 0 } else { 0x80 };
        out.push(buf[i] | continuation);
    }
}

fn write_meta(out: &mut Vec<u8>, meta_type: u8, payload: &[u8]) {
    out.push(0xff);
    out.push(meta_type);
    encode_variable_length(payload.len() as u32, out);
    out.extend_from_slice(payload);
}

fn write_message(out: &mut Vec<u8>, message: &MidiMessage) {
    match message {
        MidiMessage::NoteOn {
            channel,
            key,
            velocity,
        } => {
            out.push(0x90 | (channel & 0x0f));
            out.push(key & 0x7f);
            out.push(velocity & 0x7f);
        }
        MidiMessage::NoteOff { channel, key } => {
            out.push(0x80 | (channel & 0x0f));
            out.push(key & 0x7f);
            out.push(NOTE_OFF_VELOCITY);
        }
        MidiMessage::Controller {
            channel,
            controller,
            value,
        } => {
            out.push(0xb0 | (channel & 0x0f));
            out.push(controller & 0x7f);
            out.push(value & 0x7f);
        }
        MidiMessage::ProgramChange { channel, program } => {
            out.push(0xc0 | (channel & 0x0f));
            out.push(program & 0x7f);
        }
        MidiMessage::PitchBend { channel, value } => {
            let value = (*value).min(0x3fff);
            out.push(0xe0 | (channel & 0x0f));
            out.push((value & 0x7f) as u8);
            out.push((value >> 7) as u8);
        }
        MidiMessage::Tempo {
            microseconds_per_quarter,
        } => {
            let us = (*microseconds_per_quarter).min(0xff_ffff);
            let b = us.to_be_bytes();
            write_meta(out, 0x51, &b[1..4]);
        }
        MidiMessage::TimeSignature {
            numerator,
            denominator,
        } => {
            // The denominator is stored as a power of two.
            // 24 MIDI clocks per metronome tick, 8 32nd notes per quarter.
            let dd = denominator.max(1).trailing_zeros() as u8;
            write_meta(out, 0x58, &[*numerator, dd, 24, 8]);
        }
        MidiMessage::Marker { text } => {
            write_meta(out, 0x06, text.as_bytes());
        }
        MidiMessage::TrackName { text } => {
            write_meta(out, 0x03, text.as_bytes());
        }
        MidiMessage::MidiPort { port } => {
            write_meta(out, 0x21, &[*port]);
        }
        MidiMessage::EndOfTrack => {
            write_meta(out, 0x2f, &[]);
        }
    }
}

fn write_track_chunk(out: &mut Vec<u8>, track: &MidiTrack) {
    let mut data = Vec::new();
    let mut prev_tick: u32 = 0;

    for e in track.events() {
        // `MidiFile::finalize_sort_by_time` guarantees non-decreasing ticks
        assert!(e.tick >= prev_tick);

        encode_variable_length(e.tick - prev_tick, &mut data);
        write_message(&mut data, &e.message);
        prev_tick = e.tick;
    }

    out.extend_from_slice(b"MTrk");
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(&data);
}

/// Serialises a finalised `MidiFile` as a format-1 Standard MIDI File.
///
/// The caller must run `finalize_sort_by_time` first; tracks with
/// out-of-order events cannot be delta-encoded.
pub fn write_midi_file(file: &MidiFile) -> Vec<u8> {
    let mut out = Vec::new();

    let n_tracks: u16 = file.n_tracks().try_into().unwrap();

    out.extend_from_slice(b"MThd");
    out.extend_from_slice(&6u32.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes());
    out.extend_from_slice(&n_tracks.to_be_bytes());
    out.extend_from_slice(&file.ppqn().as_u16().to_be_bytes());

    for track in file.tracks() {
        write_track_chunk(&mut out, track);
    }

    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::time::DEFAULT_PPQN;

    fn vlq(value: u32) -> Vec<u8> {
        let mut v = Vec::new();
        encode_variable_length(value, &mut v);
        v
    }

    #[test]
    fn variable_length_encoding() {
        assert_eq!(vlq(0), [0x00]);
        assert_eq!(vlq(0x40), [0x40]);
        assert_eq!(vlq(0x7f), [0x7f]);
        assert_eq!(vlq(0x80), [0x81, 0x00]);
        assert_eq!(vlq(0x2000), [0xc0, 0x00]);
        assert_eq!(vlq(0x3fff), [0xff, 0x7f]);
        assert_eq!(vlq(0x4000), [0x81, 0x80, 0x00]);
        assert_eq!(vlq(0x0fff_ffff), [0xff, 0xff, 0xff, 0x7f]);
    }

    #[test]
    fn header_layout() {
        let mut f = MidiFile::new(DEFAULT_PPQN);
        f.add_track();
        f.finalize_sort_by_time();

        let bytes = write_midi_file(&f);

        assert_eq!(&bytes[0..8], b"MThd\x00\x00\x00\x06");
        // format 1, one track, ppqn 48
        assert_eq!(&bytes[8..14], &[0x00, 0x01, 0x00, 0x01, 0x00, 48]);
        assert_eq!(&bytes[14..18], b"MTrk");
    }

    #[test]
    fn empty_track_is_end_of_track_only() {
        let mut f = MidiFile::new(DEFAULT_PPQN);
        f.add_track();
        f.finalize_sort_by_time();

        let bytes = write_midi_file(&f);
        // delta 0 + FF 2F 00
        assert_eq!(&bytes[18..], &[0x00, 0x00, 0x00, 0x04, 0x00, 0xff, 0x2f, 0x00]);
    }

    #[test]
    fn tempo_meta_bytes() {
        let mut v = Vec::new();
        write_message(
            &mut v,
            &MidiMessage::Tempo {
                microseconds_per_quarter: 500_000,
            },
        );
        assert_eq!(v, [0xff, 0x51, 0x03, 0x07, 0xa1, 0x20]);
    }

    #[test]
    fn time_signature_meta_bytes() {
        let mut v = Vec::new();
        write_message(
            &mut v,
            &MidiMessage::TimeSignature {
                numerator: 3,
                denominator: 8,
            },
        );
        assert_eq!(v, [0xff, 0x58, 0x04, 3, 3, 24, 8]);
    }

    #[test]
    fn pitch_bend_bytes() {
        let mut v = Vec::new();
        write_message(
            &mut v,
            &MidiMessage::PitchBend {
                channel: 2,
                value: 0x2000,
            },
        );
        assert_eq!(v, [0xe2, 0x00, 0x40]);
    }
}
