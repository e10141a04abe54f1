use std::env;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bgm_kit::tone::{self, ToneGenerator};
use bgm_kit::{
    FileOutputs, FileTrack, MemoryOutputs, MemoryTrack, MixSession, OutputFactory, OutputRoute,
    SessionConfig, SessionStatus, TrackProvider,
};

const USAGE: &str = "Usage: mixctl [options]

Drives a mix session with a synthetic microphone tone and prints the session status.

Options:
  --track <path>        raw PCM16 little-endian background track (default: generated 220 Hz tone)
  --loop                restart the background track when it runs out
  --callbacks <n>       number of 10 ms callbacks to run (default 100)
  --channels <n>        capture channel count (default 2)
  --sample-rate <hz>    capture sample rate (default 44100)
  --tone <hz>           microphone tone frequency (default 440)
  --bg-level <f>        background scale factor (default 1.0)
  --local-level <f>     microphone scale factor (default 1.0)
  --out-dir <dir>       write local playback to <dir>/primary.pcm and <dir>/backup.pcm
  --help                show this message";

struct Options {
    track: Option<PathBuf>,
    looping: bool,
    callbacks: usize,
    channels: u16,
    sample_rate: u32,
    tone_hz: f64,
    background_level: f32,
    local_level: f32,
    out_dir: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            track: None,
            looping: false,
            callbacks: 100,
            channels: 2,
            sample_rate: 44_100,
            tone_hz: 440.0,
            background_level: 1.0,
            local_level: 1.0,
            out_dir: None,
        }
    }
}

fn value<T: std::str::FromStr>(flag: &str, raw: Option<String>) -> Result<T, String> {
    let raw = raw.ok_or_else(|| format!("{flag} needs a value"))?;
    raw.parse()
        .map_err(|_| format!("invalid value '{raw}' for {flag}"))
}

fn parse_args() -> Result<Option<Options>, String> {
    let mut options = Options::default();
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--track" => options.track = Some(value::<PathBuf>(&arg, args.next())?),
            "--loop" => options.looping = true,
            "--callbacks" => options.callbacks = value(&arg, args.next())?,
            "--channels" => options.channels = value(&arg, args.next())?,
            "--sample-rate" => options.sample_rate = value(&arg, args.next())?,
            "--tone" => options.tone_hz = value(&arg, args.next())?,
            "--bg-level" => options.background_level = value(&arg, args.next())?,
            "--local-level" => options.local_level = value(&arg, args.next())?,
            "--out-dir" => options.out_dir = Some(value::<PathBuf>(&arg, args.next())?),
            "--help" | "-h" => return Ok(None),
            other => return Err(format!("unknown argument '{other}'")),
        }
    }
    Ok(Some(options))
}

fn print_status(status: &SessionStatus) {
    println!("Track       : {}", status.track);
    match status.format {
        Some(format) => println!(
            "Format      : {} ch @ {} Hz, {} bytes/callback",
            format.channels, format.sample_rate, format.buffer_size
        ),
        None => println!("Format      : not negotiated"),
    }
    println!("Looping     : {}", if status.looping { "yes" } else { "no" });
    println!(
        "Levels      : background={:.2} local={:.2}",
        status.background_level, status.local_level
    );
    println!("Mixed       : {} callbacks", status.frames_mixed);
    println!("Passed      : {} callbacks", status.frames_passed_through);
    println!("Restarts    : {}", status.track_restarts);
    println!(
        "Buffers     : pending={} pooled={}",
        status.pending_frames, status.pooled_buffers
    );
    if let Some(state) = status.playback_state {
        println!("Playback    : {state:?}");
    }
    if let Some(stats) = status.playback {
        println!(
            "Queue       : enqueued={} played={} dropped={} write_errors={} allocated={}",
            stats.frames_enqueued,
            stats.frames_played,
            stats.frames_dropped,
            stats.write_errors,
            stats.buffers_allocated,
        );
    }
}

fn run(options: Options) -> Result<(), String> {
    let provider: Arc<dyn TrackProvider> = match &options.track {
        Some(path) => Arc::new(FileTrack::new(path)),
        None => {
            let mut generator = ToneGenerator::new(options.sample_rate, options.channels, 220.0, 0.5);
            let samples = generator.render(options.sample_rate as usize);
            Arc::new(MemoryTrack::new("tone-220hz", samples))
        }
    };

    let memory = MemoryOutputs::new();
    let outputs: Arc<dyn OutputFactory> = match &options.out_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|err| format!("{}: {err}", dir.display()))?;
            Arc::new(FileOutputs::new(dir))
        }
        None => Arc::new(memory.clone()),
    };

    let config = SessionConfig::default()
        .with_looping(options.looping)
        .with_levels(options.background_level, options.local_level);
    let interval = config.callback_interval;
    let session = MixSession::new(provider, outputs, config);
    if !session.start() {
        eprintln!("mixctl: background track unavailable, microphone passes through");
    }

    let mut mic = ToneGenerator::new(options.sample_rate, options.channels, options.tone_hz, 0.5);
    let frames_per_callback = (options.sample_rate / session.config().callbacks_per_second()) as usize;
    let mut last_mixed = None;
    for _ in 0..options.callbacks {
        let mut frame = mic.render(frames_per_callback);
        if session
            .process(options.channels, options.sample_rate, &mut frame)
            .is_mixed()
        {
            last_mixed = Some(frame);
        }
        thread::sleep(interval);
    }

    if let Some(err) = session.take_playback_error() {
        eprintln!("mixctl: {err}");
    }
    print_status(&session.status());
    let result = session.stop_and_wait(Duration::from_secs(1));
    if let Some(frame) = last_mixed {
        println!("Mix RMS     : {:.3}", tone::rms(&tone::decode_pcm16(&frame)));
    }
    if options.out_dir.is_none() {
        for route in OutputRoute::ALL {
            println!("Output {:<8}: {} bytes", route.as_str(), memory.captured(route).len());
        }
    }
    result.map_err(|err| err.to_string())
}

fn main() {
    bgm_kit::init_tracing();
    let options = match parse_args() {
        Ok(Some(options)) => options,
        Ok(None) => {
            println!("{USAGE}");
            return;
        }
        Err(err) => {
            eprintln!("mixctl: {err}");
            process::exit(1);
        }
    };

    if let Err(err) = run(options) {
        eprintln!("mixctl: {err}");
        process::exit(1);
    }
}
