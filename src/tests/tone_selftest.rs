use crate::tone::{ToneGenerator, constant_pcm16, correlation, decode_pcm16, rms};

#[test]
fn tone_is_continuous_across_buffers() {
    let mut whole = ToneGenerator::new(48_000, 2, 1_000.0, 0.5);
    let mut split = ToneGenerator::new(48_000, 2, 1_000.0, 0.5);

    let reference = whole.render(480);
    let mut chunked = split.render(240);
    chunked.extend(split.render(240));

    assert_eq!(reference, chunked);
}

#[test]
fn tone_duplicates_channels_and_hits_expected_level() {
    let mut generator = ToneGenerator::new(48_000, 2, 1_000.0, 0.5);
    let samples = decode_pcm16(&generator.render(4_800));
    for frame in samples.chunks_exact(2) {
        assert_eq!(frame[0], frame[1]);
    }
    let level = rms(&samples);
    let expected = 0.5 / std::f32::consts::SQRT_2;
    assert!((level - expected).abs() < 0.01, "rms {level}, expected {expected}");
}

#[test]
fn correlation_detects_inversion() {
    let mut generator = ToneGenerator::new(8_000, 1, 440.0, 0.8);
    let tone = decode_pcm16(&generator.render(800));
    let inverted: Vec<i16> = tone.iter().map(|&s| -s).collect();

    assert!(correlation(&tone, &tone) > 0.999);
    assert!(correlation(&tone, &inverted) < -0.999);
    assert_eq!(correlation(&tone, &decode_pcm16(&constant_pcm16(0, 800))), 0.0);
}
