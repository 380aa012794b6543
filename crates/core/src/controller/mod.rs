//! Thin glue between user actions, the scheduler, the tap estimator and a
//! click sink. Beats are drained on the thread that owns the controller, so
//! the sink never runs on the timing thread.

use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    clock::{Clock, MonotonicClock},
    config::MetronomeConfig,
    scheduler::BeatScheduler,
    tap::TapEstimator,
    tempo::{BeatEvent, MAX_BPM, MIN_BPM},
    Result,
};

/// Which click sound to play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClickVariant {
    /// First beat of a bar.
    Accented,
    Regular,
}

impl From<BeatEvent> for ClickVariant {
    fn from(event: BeatEvent) -> Self {
        if event.is_downbeat {
            Self::Accented
        } else {
            Self::Regular
        }
    }
}

/// Something that can make a click sound. Failures are logged by the
/// controller and never reach the scheduler.
pub trait ClickSink {
    fn play_click(&mut self, variant: ClickVariant) -> Result<()>;
}

impl<F> ClickSink for F
where
    F: FnMut(ClickVariant) -> Result<()>,
{
    fn play_click(&mut self, variant: ClickVariant) -> Result<()> {
        self(variant)
    }
}

#[derive(Debug)]
pub struct Controller<S, C = MonotonicClock> {
    scheduler: BeatScheduler,
    taps: TapEstimator<C>,
    beats: Receiver<BeatEvent>,
    sink: S,
    last_beat: Option<BeatEvent>,
}

impl<S: ClickSink> Controller<S> {
    pub fn new(config: &MetronomeConfig, sink: S) -> Result<Self> {
        Self::with_clock(config, sink, MonotonicClock)
    }
}

impl<S: ClickSink, C: Clock> Controller<S, C> {
    /// Builds a controller whose tap estimator reads time from `clock`.
    pub fn with_clock(config: &MetronomeConfig, sink: S, clock: C) -> Result<Self> {
        config.validate()?;
        let mut scheduler = BeatScheduler::from_settings(config)?;
        let beats = scheduler.subscribe();
        Ok(Self {
            scheduler,
            taps: TapEstimator::with_clock(config.tap, clock),
            beats,
            sink,
            last_beat: None,
        })
    }

    pub fn scheduler(&self) -> &BeatScheduler {
        &self.scheduler
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Most recent beat handed to the sink, for a visual indicator.
    pub fn last_beat(&self) -> Option<BeatEvent> {
        self.last_beat
    }

    /// Starts a fresh run. Beats left over from a previous run that were
    /// never pumped are discarded.
    pub fn start(&mut self) -> Result<()> {
        if self.scheduler.is_running() {
            return Ok(());
        }
        self.beats.try_iter().for_each(drop);
        self.last_beat = None;
        self.scheduler.start()
    }

    pub fn stop(&mut self) -> Result<()> {
        self.scheduler.stop()
    }

    /// Starts a stopped metronome or stops a running one. Returns whether it
    /// is running afterwards.
    pub fn toggle(&mut self) -> Result<bool> {
        if self.scheduler.is_running() {
            self.stop()?;
        } else {
            self.start()?;
        }
        Ok(self.scheduler.is_running())
    }

    pub fn set_tempo(&mut self, bpm: u32) -> Result<()> {
        self.scheduler.set_tempo(bpm)
    }

    pub fn set_time_signature(&mut self, numerator: u32, denominator: u32) -> Result<()> {
        self.scheduler.set_time_signature(numerator, denominator)
    }

    pub fn increase_tempo(&mut self) -> Result<u32> {
        self.nudge_tempo(1)
    }

    pub fn decrease_tempo(&mut self) -> Result<u32> {
        self.nudge_tempo(-1)
    }

    fn nudge_tempo(&mut self, delta: i64) -> Result<u32> {
        let bpm = (i64::from(self.scheduler.bpm()) + delta)
            .clamp(i64::from(MIN_BPM), i64::from(MAX_BPM)) as u32;
        self.scheduler.set_tempo(bpm)?;
        Ok(bpm)
    }

    /// Registers a tap and, once there is an estimate, applies it as the
    /// new tempo.
    pub fn tap(&mut self) -> Result<Option<u32>> {
        let estimate = self.taps.tap();
        if let Some(bpm) = estimate {
            self.scheduler.set_tempo(bpm)?;
        }
        Ok(estimate)
    }

    pub fn reset_taps(&mut self) {
        self.taps.reset();
    }

    pub fn tap_count(&self) -> usize {
        self.taps.tap_count()
    }

    /// Plays every beat that is already waiting. Returns how many were handled.
    pub fn pump(&mut self) -> usize {
        let pending: Vec<BeatEvent> = self.beats.try_iter().collect();
        for event in &pending {
            self.dispatch(*event);
        }
        pending.len()
    }

    /// Plays beats as they arrive until `duration` has elapsed.
    pub fn run_for(&mut self, duration: Duration) -> usize {
        let deadline = Instant::now() + duration;
        let mut handled = 0;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.beats.recv_timeout(remaining) {
                Ok(event) => {
                    self.dispatch(event);
                    handled += 1;
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("beat channel closed");
                    break;
                }
            }
        }
        handled
    }

    fn dispatch(&mut self, event: BeatEvent) {
        self.last_beat = Some(event);
        let variant = ClickVariant::from(event);
        if let Err(err) = self.sink.play_click(variant) {
            warn!(beat = event.beat_index, %err, "click sink failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::{clock::ManualClock, MetronomeError, TempoSpec};

    #[derive(Debug, Default)]
    struct RecordingSink {
        clicks: Vec<ClickVariant>,
    }

    impl ClickSink for RecordingSink {
        fn play_click(&mut self, variant: ClickVariant) -> Result<()> {
            self.clicks.push(variant);
            Ok(())
        }
    }

    fn silent(_: ClickVariant) -> Result<()> {
        Ok(())
    }

    fn unplugged(_: ClickVariant) -> Result<()> {
        Err(MetronomeError::Sink("device unplugged".to_string()))
    }

    fn fast_config() -> MetronomeConfig {
        MetronomeConfig {
            tempo: TempoSpec {
                bpm: 240,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn plays_accent_on_the_downbeat() {
        let mut controller = Controller::new(&fast_config(), RecordingSink::default()).unwrap();

        controller.start().unwrap();
        let handled = controller.run_for(Duration::from_millis(1_100));
        controller.stop().unwrap();
        let handled = handled + controller.pump();

        assert_eq!(handled, 4);
        assert_eq!(
            controller.last_beat(),
            Some(BeatEvent {
                beat_index: 3,
                is_downbeat: false
            })
        );
        assert_eq!(
            controller.sink().clicks,
            vec![
                ClickVariant::Accented,
                ClickVariant::Regular,
                ClickVariant::Regular,
                ClickVariant::Regular
            ]
        );
    }

    #[test]
    fn failing_sink_does_not_stop_the_metronome() {
        let mut controller = Controller::new(&fast_config(), unplugged).unwrap();

        controller.start().unwrap();
        let handled = controller.run_for(Duration::from_millis(600));
        assert!(controller.scheduler().is_running());
        controller.stop().unwrap();

        assert_eq!(handled, 2);
    }

    #[test]
    fn pump_drains_pending_beats_on_the_caller_thread() {
        let mut controller = Controller::new(&fast_config(), RecordingSink::default()).unwrap();

        controller.start().unwrap();
        thread::sleep(Duration::from_millis(600));
        controller.stop().unwrap();

        assert_eq!(controller.pump(), 2);
        assert_eq!(controller.pump(), 0);
        assert_eq!(controller.sink().clicks.len(), 2);
    }

    #[test]
    fn restart_discards_unplayed_beats() {
        let mut controller = Controller::new(&fast_config(), RecordingSink::default()).unwrap();

        controller.start().unwrap();
        thread::sleep(Duration::from_millis(600));
        controller.stop().unwrap();
        controller.start().unwrap();

        assert_eq!(controller.pump(), 0);
        assert_eq!(controller.last_beat(), None);
        assert!(controller.sink().clicks.is_empty());

        let handled = controller.run_for(Duration::from_millis(350));
        controller.stop().unwrap();
        assert_eq!(handled, 1);
        assert_eq!(
            controller.last_beat(),
            Some(BeatEvent {
                beat_index: 0,
                is_downbeat: true
            })
        );
        assert_eq!(controller.sink().clicks, vec![ClickVariant::Accented]);
    }

    #[test]
    fn start_while_running_keeps_pending_beats() {
        let mut controller = Controller::new(&fast_config(), RecordingSink::default()).unwrap();

        controller.start().unwrap();
        thread::sleep(Duration::from_millis(350));
        controller.start().unwrap();
        controller.stop().unwrap();

        assert_eq!(controller.pump(), 1);
    }

    #[test]
    fn toggle_flips_running_state() {
        let mut controller = Controller::new(&MetronomeConfig::default(), silent).unwrap();
        assert!(controller.toggle().unwrap());
        assert!(controller.scheduler().is_running());
        assert!(!controller.toggle().unwrap());
        assert!(!controller.scheduler().is_running());
    }

    #[test]
    fn nudging_saturates_at_the_limits() {
        let mut controller = Controller::new(&fast_config(), silent).unwrap();
        assert_eq!(controller.increase_tempo().unwrap(), 240);
        assert_eq!(controller.decrease_tempo().unwrap(), 239);

        controller.set_tempo(40).unwrap();
        assert_eq!(controller.decrease_tempo().unwrap(), 40);
        assert_eq!(controller.increase_tempo().unwrap(), 41);
    }

    #[test]
    fn invalid_input_keeps_previous_values() {
        let mut controller = Controller::new(&MetronomeConfig::default(), silent).unwrap();
        assert!(controller.set_tempo(300).is_err());
        assert!(controller.set_time_signature(5, 5).is_err());
        assert_eq!(controller.scheduler().tempo(), TempoSpec::default());
    }

    #[test]
    fn taps_set_the_tempo() {
        let clock = ManualClock::new();
        let mut controller =
            Controller::with_clock(&MetronomeConfig::default(), silent, clock.clone()).unwrap();

        assert_eq!(controller.tap().unwrap(), None);
        clock.advance_secs(0.75);
        assert_eq!(controller.tap().unwrap(), Some(80));
        assert_eq!(controller.scheduler().bpm(), 80);
        assert_eq!(controller.tap_count(), 2);

        controller.reset_taps();
        assert_eq!(controller.tap_count(), 0);
    }

    #[test]
    fn click_variant_follows_downbeat() {
        let downbeat = BeatEvent {
            beat_index: 0,
            is_downbeat: true,
        };
        assert_eq!(ClickVariant::from(downbeat), ClickVariant::Accented);
        let offbeat = BeatEvent {
            beat_index: 1,
            is_downbeat: false,
        };
        assert_eq!(ClickVariant::from(offbeat), ClickVariant::Regular);
    }
}
