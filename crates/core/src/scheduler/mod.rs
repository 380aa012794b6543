//! Drift-free beat scheduling.
//!
//! A [`BeatScheduler`] owns a dedicated timing thread that fires beats at
//! absolute deadlines (`deadline += period`, never `now + period`), so
//! per-iteration jitter never accumulates. The thread waits on a condition
//! variable and wakes up as soon as [`BeatScheduler::stop`] raises the stop
//! signal.
//!
//! Beats are never delivered by calling user code on the timing thread. Each
//! [`BeatEvent`] is pushed into an unbounded channel; the receiving end is
//! drained either by the caller ([`BeatScheduler::subscribe`]) or by a
//! dispatch thread running a callback ([`BeatScheduler::on_beat`]).

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use crate::{
    config::{SettingsProvider, DEFAULT_STOP_TIMEOUT_MS},
    tempo::{self, BeatEvent, BeatInfo, TempoSpec, TimeSignature},
    MetronomeError, Result,
};

/// Tempo changes smaller than this do not reschedule the loop.
const DURATION_EPSILON: Duration = Duration::from_millis(1);

/// Timing diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TimingStats {
    /// Period the timing loop is currently using.
    pub beat_duration: Duration,
    /// Time left until the next committed deadline, if the loop is running.
    pub time_to_next_beat: Option<Duration>,
    pub thread_alive: bool,
}

/// State shared between the caller and the timing thread.
#[derive(Debug)]
struct Shared {
    tempo: Mutex<TempoSpec>,
    running: AtomicBool,
    current_beat: AtomicU64,
    sink: Mutex<Option<Sender<BeatEvent>>>,
    timing: Mutex<LoopTiming>,
}

#[derive(Debug, Clone, Copy)]
struct LoopTiming {
    beat_duration: Duration,
    next_deadline: Option<Instant>,
}

impl Shared {
    fn new(spec: TempoSpec) -> Self {
        Self {
            tempo: Mutex::new(spec),
            running: AtomicBool::new(false),
            current_beat: AtomicU64::new(0),
            sink: Mutex::new(None),
            timing: Mutex::new(LoopTiming {
                beat_duration: spec.beat_duration(),
                next_deadline: None,
            }),
        }
    }

    fn tempo(&self) -> TempoSpec {
        *self.tempo.lock()
    }

    fn emit(&self, event: BeatEvent) {
        if let Some(sink) = self.sink.lock().as_ref() {
            // A receiver that went away is the sink's problem, not ours.
            if sink.send(event).is_err() {
                trace!(beat = event.beat_index, "beat receiver dropped");
            }
        }
    }

    fn publish_timing(&self, beat_duration: Duration, next_deadline: Option<Instant>) {
        *self.timing.lock() = LoopTiming {
            beat_duration,
            next_deadline,
        };
    }
}

/// One-shot cancellation flag the timing loop can sleep on.
#[derive(Debug, Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    condvar: Condvar,
}

impl StopSignal {
    fn raise(&self) {
        *self.stopped.lock() = true;
        self.condvar.notify_all();
    }

    fn is_raised(&self) -> bool {
        *self.stopped.lock()
    }

    /// Sleeps until `deadline` or until the signal is raised. Returns `true`
    /// if the signal was raised.
    fn wait_until(&self, deadline: Instant) -> bool {
        let mut stopped = self.stopped.lock();
        while !*stopped {
            if self.condvar.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }
        *stopped
    }
}

/// Handle on a running timing thread. `done` disconnects when the thread
/// exits, including by unwinding.
#[derive(Debug)]
struct Worker {
    stop: Arc<StopSignal>,
    done: Receiver<()>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn halt(self, timeout: Duration) -> Result<()> {
        self.stop.raise();

        if let Err(RecvTimeoutError::Timeout) = self.done.recv_timeout(timeout) {
            error!(
                ?timeout,
                "timing thread ignored its stop signal; the thread is leaked"
            );
            return Err(MetronomeError::SchedulerStopFailure { timeout });
        }

        self.handle.join().map_err(|_| {
            error!("timing thread panicked");
            MetronomeError::msg("timing thread panicked")
        })
    }
}

/// Owns tempo and meter state and the thread that fires beats.
#[derive(Debug)]
pub struct BeatScheduler {
    shared: Arc<Shared>,
    worker: Option<Worker>,
    stop_timeout: Duration,
}

impl BeatScheduler {
    /// Creates a stopped scheduler at 120 BPM in 4/4.
    pub fn new() -> Self {
        Self::build(TempoSpec::default(), Duration::from_millis(DEFAULT_STOP_TIMEOUT_MS))
    }

    pub fn with_tempo(spec: TempoSpec) -> Result<Self> {
        spec.validate()?;
        Ok(Self::build(
            spec,
            Duration::from_millis(DEFAULT_STOP_TIMEOUT_MS),
        ))
    }

    /// Creates a scheduler from externally stored settings.
    pub fn from_settings(settings: &impl SettingsProvider) -> Result<Self> {
        let spec = settings.initial_tempo();
        spec.validate()?;
        Self::build(spec, Duration::ZERO).with_stop_timeout(settings.stop_timeout())
    }

    /// Overrides the bound `stop()` waits for the timing thread. A zero
    /// bound would report every healthy stop as a failure and is rejected.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Result<Self> {
        if timeout.is_zero() {
            return Err(MetronomeError::invalid("stop timeout must be non-zero"));
        }
        self.stop_timeout = timeout;
        Ok(self)
    }

    fn build(spec: TempoSpec, stop_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared::new(spec)),
            worker: None,
            stop_timeout,
        }
    }

    /// Sets the tempo. The running loop picks the new period up after the
    /// deadline it has already committed to.
    pub fn set_tempo(&self, bpm: u32) -> Result<()> {
        let bpm = tempo::validate_bpm(bpm)?;
        let mut spec = self.shared.tempo.lock();
        if spec.bpm != bpm {
            debug!(from = spec.bpm, to = bpm, "tempo changed");
            spec.bpm = bpm;
        }
        Ok(())
    }

    /// Sets the time signature. Downbeats follow the new bar length from
    /// the next emitted beat.
    pub fn set_time_signature(&self, numerator: u32, denominator: u32) -> Result<()> {
        let signature = TimeSignature::new(numerator, denominator)?;
        let mut spec = self.shared.tempo.lock();
        if spec.time_signature != signature {
            debug!(from = %spec.time_signature, to = %signature, "time signature changed");
            spec.time_signature = signature;
        }
        Ok(())
    }

    /// Starts firing beats from index 0. No-op if already running.
    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            debug!("start ignored, metronome already running");
            return Ok(());
        }

        self.shared.current_beat.store(0, Ordering::Release);
        self.shared.running.store(true, Ordering::Release);

        let stop = Arc::new(StopSignal::default());
        let (done_tx, done) = bounded::<()>(1);
        let shared = Arc::clone(&self.shared);
        let signal = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("metronome-timing".to_string())
            .spawn(move || {
                let _done = done_tx;
                run_timing_loop(&shared, &signal);
                shared.publish_timing(shared.tempo().beat_duration(), None);
                debug!("timing loop exited");
            })
            .map_err(|err| {
                self.shared.running.store(false, Ordering::Release);
                MetronomeError::Spawn(err)
            })?;

        let spec = self.shared.tempo();
        info!(bpm = spec.bpm, time_signature = %spec.time_signature, "metronome started");
        self.worker = Some(Worker { stop, done, handle });
        Ok(())
    }

    /// Stops the timing thread and waits for it to exit. Once this returns
    /// `Ok`, no further beat is emitted. No-op if already stopped.
    ///
    /// A [`MetronomeError::SchedulerStopFailure`] means the thread did not
    /// exit within the stop timeout and is a fatal internal error.
    pub fn stop(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };

        self.shared.running.store(false, Ordering::Release);
        worker.halt(self.stop_timeout)?;
        info!(beats = self.current_beat(), "metronome stopped");
        Ok(())
    }

    /// Rewinds the beat counter to 0 without stopping.
    pub fn reset_beat_counter(&self) {
        self.shared.current_beat.store(0, Ordering::Release);
    }

    /// Delivers beats to the returned receiver, replacing any previous
    /// registration. The caller drains it on whichever thread it needs.
    pub fn subscribe(&mut self) -> Receiver<BeatEvent> {
        let (tx, rx) = unbounded();
        self.install_sink(Some(tx));
        rx
    }

    /// Invokes `callback` for every beat, in order, on a dedicated dispatch
    /// thread. Replaces any previous registration; the previous dispatcher
    /// finishes its queued beats and exits.
    pub fn on_beat<F>(&mut self, mut callback: F) -> Result<()>
    where
        F: FnMut(BeatEvent) + Send + 'static,
    {
        let (tx, rx) = unbounded::<BeatEvent>();
        thread::Builder::new()
            .name("metronome-dispatch".to_string())
            .spawn(move || {
                for event in rx.iter() {
                    callback(event);
                }
                debug!("beat dispatcher exited");
            })
            .map_err(MetronomeError::Spawn)?;
        self.install_sink(Some(tx));
        Ok(())
    }

    /// Drops the current beat registration.
    pub fn clear_beat_sink(&mut self) {
        self.install_sink(None);
    }

    fn install_sink(&self, sink: Option<Sender<BeatEvent>>) {
        let previous = std::mem::replace(&mut *self.shared.sink.lock(), sink);
        drop(previous);
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn tempo(&self) -> TempoSpec {
        self.shared.tempo()
    }

    pub fn bpm(&self) -> u32 {
        self.tempo().bpm
    }

    pub fn time_signature(&self) -> TimeSignature {
        self.tempo().time_signature
    }

    /// `60 / bpm` for the configured tempo.
    pub fn beat_duration(&self) -> Duration {
        self.tempo().beat_duration()
    }

    /// Index of the next beat to fire.
    pub fn current_beat(&self) -> u64 {
        self.shared.current_beat.load(Ordering::Acquire)
    }

    /// One-based position of the current beat within its bar.
    pub fn beat_in_bar(&self) -> u32 {
        self.time_signature().position_in_bar(self.current_beat()) + 1
    }

    pub fn beat_info(&self) -> BeatInfo {
        BeatInfo::new(self.current_beat(), self.tempo(), self.is_running())
    }

    pub fn timing_stats(&self) -> TimingStats {
        let timing = *self.shared.timing.lock();
        TimingStats {
            beat_duration: timing.beat_duration,
            time_to_next_beat: timing
                .next_deadline
                .map(|deadline| deadline.saturating_duration_since(Instant::now())),
            thread_alive: self
                .worker
                .as_ref()
                .is_some_and(|worker| !worker.handle.is_finished()),
        }
    }
}

impl Default for BeatScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BeatScheduler {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            error!(%err, "failed to stop metronome on drop");
        }
    }
}

fn run_timing_loop(shared: &Shared, stop: &StopSignal) {
    let mut beat_duration = shared.tempo().beat_duration();
    let mut next_deadline = Instant::now() + beat_duration;
    shared.publish_timing(beat_duration, Some(next_deadline));

    while !stop.is_raised() {
        if next_deadline > Instant::now() && stop.wait_until(next_deadline) {
            break;
        }
        if stop.is_raised() {
            break;
        }

        next_deadline = resync_deadline(next_deadline, beat_duration, Instant::now());

        let spec = shared.tempo();
        let beat_index = shared.current_beat.load(Ordering::Acquire);
        let event = BeatEvent {
            beat_index,
            is_downbeat: spec.time_signature.is_downbeat(beat_index),
        };
        trace!(beat = beat_index, downbeat = event.is_downbeat, "beat");
        shared.emit(event);

        // Lose the increment rather than the reset if the counter was
        // rewound while this beat was in flight.
        let _ = shared.current_beat.compare_exchange(
            beat_index,
            beat_index + 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        next_deadline += beat_duration;

        let target = shared.tempo().beat_duration();
        if target.max(beat_duration) - target.min(beat_duration) > DURATION_EPSILON {
            beat_duration = target;
        }
        shared.publish_timing(beat_duration, Some(next_deadline));
    }
}

/// Moves a deadline that fell more than one period behind `now` (e.g. after
/// the process was suspended) up to `now`, so missed beats are skipped
/// instead of fired in a burst.
fn resync_deadline(next_deadline: Instant, beat_duration: Duration, now: Instant) -> Instant {
    if now > next_deadline + beat_duration {
        warn!(
            behind = ?now.duration_since(next_deadline),
            "timing loop fell behind, skipping missed beats"
        );
        now
    } else {
        next_deadline
    }
}
