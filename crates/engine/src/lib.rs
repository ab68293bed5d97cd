//! Sequence decoding and MIDI conversion engine

// SPDX-FileCopyrightText: © 2023 Marcus Rowe <undisbeliever@gmail.com>
//
// SPDX-License-Identifier: MIT

pub mod byte_source;
pub mod config;
pub mod decoder;
pub mod engine;
pub mod errors;
pub mod event;
pub mod formats;
pub mod midi;
pub mod passes;
pub mod scale;
pub mod smf;
pub mod time;
pub mod track;

pub use byte_source::{ByteSource, Endian};
pub use config::ConversionOptions;
pub use decoder::{FormatDecoder, SequenceLayout};
pub use engine::{Conversion, SequenceEngine, TrackFailure};
pub use event::{EventKind, EventRecord};
pub use midi::MidiFile;
pub use passes::{Pass, PassSink};
pub use time::{Ppqn, TickCounter};
pub use track::TrackCursor;
