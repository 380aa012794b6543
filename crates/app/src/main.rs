use std::{
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use clap::{Parser, Subcommand};
use crossbeam_channel::{bounded, Receiver};
use metronome_core::{
    AudioConfig, ClickSink, ClickVariant, Controller, MetronomeConfig, MetronomeError, TapConfig,
    TapEstimator, TimeSignature,
};
use tracing_subscriber::EnvFilter;

fn main() -> metronome_core::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Run {
            bpm,
            time_signature,
            duration,
            config,
        } => run_metronome(config.as_deref(), bpm, time_signature, duration),
        Commands::Tap { max_taps, timeout } => run_tap(max_taps, timeout),
        Commands::Info { config } => print_info(config.as_deref()),
    };

    if let Err(err) = &result {
        if err.is_fatal() {
            tracing::error!(%err, "fatal metronome failure");
        }
    }
    result
}

fn load_config(path: Option<&Path>) -> metronome_core::Result<MetronomeConfig> {
    match path {
        Some(path) => {
            tracing::debug!(?path, "loading settings");
            MetronomeConfig::from_json_str(&std::fs::read_to_string(path)?)
        }
        None => Ok(MetronomeConfig::default()),
    }
}

fn run_metronome(
    config: Option<&Path>,
    bpm: Option<u32>,
    time_signature: Option<TimeSignature>,
    duration: Option<f64>,
) -> metronome_core::Result<()> {
    let config = load_config(config)?;
    let sink = ConsoleSink::new(config.audio);
    let mut controller = Controller::new(&config, sink)?;

    if let Some(bpm) = bpm {
        controller.set_tempo(bpm)?;
    }
    if let Some(signature) = time_signature {
        controller.set_time_signature(signature.beats_per_bar, signature.beat_unit)?;
    }

    let tempo = controller.scheduler().tempo();
    tracing::info!(bpm = tempo.bpm, time_signature = %tempo.time_signature, "starting metronome");
    controller.start()?;

    match duration {
        Some(seconds) => {
            let duration = Duration::try_from_secs_f64(seconds).map_err(|_| {
                MetronomeError::InvalidArgument(format!("invalid duration: {seconds}"))
            })?;
            controller.run_for(duration);
        }
        None => {
            let quit = watch_for_quit(io::BufReader::new(io::stdin()));
            while quit.try_recv().is_err() {
                controller.run_for(Duration::from_millis(50));
            }
        }
    }

    controller.stop()?;
    controller.pump();
    tracing::info!(beats = controller.scheduler().current_beat(), "metronome finished");
    Ok(())
}

/// Signals once a line is entered on `input` or it closes.
fn watch_for_quit<R>(mut input: R) -> Receiver<()>
where
    R: BufRead + Send + 'static,
{
    let (quit_tx, quit_rx) = bounded::<()>(1);
    thread::spawn(move || {
        let mut line = String::new();
        let _ = input.read_line(&mut line);
        let _ = quit_tx.send(());
    });
    quit_rx
}

fn run_tap(max_taps: usize, timeout: f64) -> metronome_core::Result<()> {
    let mut taps = TapEstimator::with_config(TapConfig {
        max_taps,
        timeout_seconds: timeout,
    })?;

    println!("Press Enter for each tap, Ctrl-D to finish.");
    let mut last = None;
    for line in io::stdin().lock().lines() {
        let line = line?;
        if line.trim() == "r" {
            taps.reset();
            println!("reset");
            continue;
        }
        match taps.tap() {
            Some(bpm) => {
                println!("{bpm} BPM ({} taps)", taps.tap_count());
                last = Some(bpm);
            }
            None => println!("tap again..."),
        }
    }

    if let Some(bpm) = last {
        tracing::info!(bpm, "final tap tempo");
    }
    Ok(())
}

fn print_info(config: Option<&Path>) -> metronome_core::Result<()> {
    let config = load_config(config)?;
    println!("{}", config.to_json_string()?);
    Ok(())
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let _ = tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .try_init();
}

/// Writes each click to stdout; a stand-in for an audio backend.
#[derive(Debug)]
struct ConsoleSink {
    audio: AudioConfig,
    out: io::Stdout,
}

impl ConsoleSink {
    fn new(audio: AudioConfig) -> Self {
        Self {
            audio,
            out: io::stdout(),
        }
    }
}

impl ClickSink for ConsoleSink {
    fn play_click(&mut self, variant: ClickVariant) -> metronome_core::Result<()> {
        let label = match variant {
            ClickVariant::Accented => "TICK",
            ClickVariant::Regular => "tock",
        };
        if self.audio.gain_for(variant) <= 0.0 {
            return Ok(());
        }
        let mut out = self.out.lock();
        writeln!(out, "{label} \x07")
            .and_then(|()| out.flush())
            .map_err(|err| MetronomeError::Sink(err.to_string()))
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Precise command line metronome", long_about = None)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Click at the configured tempo.
    Run {
        /// Tempo in beats per minute (40-240).
        #[arg(short, long)]
        bpm: Option<u32>,
        /// Time signature such as 4/4 or 7/8.
        #[arg(short, long, value_parser = parse_time_signature)]
        time_signature: Option<TimeSignature>,
        /// Stop after this many seconds instead of waiting for Enter.
        #[arg(short, long)]
        duration: Option<f64>,
        /// JSON settings file.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Estimate a tempo from Enter presses on stdin ("r" resets).
    Tap {
        #[arg(long, default_value_t = 8)]
        max_taps: usize,
        /// Seconds of inactivity after which old taps are forgotten.
        #[arg(long, default_value_t = 2.0)]
        timeout: f64,
    },
    /// Print the effective settings as JSON.
    Info {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn parse_time_signature(value: &str) -> Result<TimeSignature, String> {
    value.parse().map_err(|err: MetronomeError| err.to_string())
}
