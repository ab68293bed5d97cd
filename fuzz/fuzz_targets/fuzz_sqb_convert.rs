#![no_main]

use libfuzzer_sys::fuzz_target;

use engine::byte_source::ByteSource;
use engine::config::ConversionOptions;
use engine::engine::SequenceEngine;
use engine::formats::sqb::SqbDecoder;
use engine::smf::write_midi_file;

// The converter must reject or truncate arbitrary input, never panic.
fuzz_target!(|data: &[u8]| {
    let source = ByteSource::new(data.to_vec(), 0);

    let engine = SequenceEngine::new(&source, SqbDecoder::new(), &ConversionOptions::default());
    if let Ok(engine) = engine {
        let conversion = engine.convert();
        let _ = write_midi_file(&conversion.midi);
    }
});
