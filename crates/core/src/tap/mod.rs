use std::{collections::VecDeque, time::Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    clock::{Clock, MonotonicClock},
    tempo::{MAX_BPM, MIN_BPM},
    MetronomeError, Result,
};

/// Tuning for [`TapEstimator`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TapConfig {
    /// Size of the sliding window of recent taps.
    pub max_taps: usize,
    /// Taps older than this are forgotten.
    pub timeout_seconds: f64,
}

impl TapConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_taps < 2 {
            return Err(MetronomeError::invalid(format!(
                "tap window needs at least 2 taps, got {}",
                self.max_taps
            )));
        }
        if !(self.timeout_seconds.is_finite() && self.timeout_seconds > 0.0) {
            return Err(MetronomeError::invalid(format!(
                "tap timeout must be a positive number of seconds, got {}",
                self.timeout_seconds
            )));
        }
        Ok(())
    }
}

impl Default for TapConfig {
    fn default() -> Self {
        Self {
            max_taps: 8,
            timeout_seconds: 2.0,
        }
    }
}

/// Turns irregular taps into a BPM estimate by averaging the intervals of a
/// sliding window of recent taps.
#[derive(Debug)]
pub struct TapEstimator<C = MonotonicClock> {
    config: TapConfig,
    taps: VecDeque<Instant>,
    clock: C,
}

impl TapEstimator<MonotonicClock> {
    pub fn new() -> Self {
        Self::with_clock(TapConfig::default(), MonotonicClock)
    }

    pub fn with_config(config: TapConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_clock(config, MonotonicClock))
    }
}

impl Default for TapEstimator<MonotonicClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> TapEstimator<C> {
    /// Builds an estimator reading time from `clock`. The config is assumed
    /// valid; use [`TapConfig::validate`] for untrusted input.
    pub fn with_clock(config: TapConfig, clock: C) -> Self {
        Self {
            taps: VecDeque::with_capacity(config.max_taps + 1),
            config,
            clock,
        }
    }

    /// Registers a tap at the current time and returns the estimate, or
    /// `None` while fewer than two taps are retained.
    pub fn tap(&mut self) -> Option<u32> {
        let now = self.clock.now();

        let timeout = self.config.timeout_seconds;
        self.taps
            .retain(|&tap| now.saturating_duration_since(tap).as_secs_f64() < timeout);

        self.taps.push_back(now);
        while self.taps.len() > self.config.max_taps.max(2) {
            self.taps.pop_front();
        }

        let bpm = self.estimate();
        debug!(taps = self.taps.len(), ?bpm, "tap registered");
        bpm
    }

    /// Forgets every recorded tap.
    pub fn reset(&mut self) {
        self.taps.clear();
    }

    pub fn tap_count(&self) -> usize {
        self.taps.len()
    }

    fn estimate(&self) -> Option<u32> {
        let (first, last) = (self.taps.front()?, self.taps.back()?);
        let intervals = self.taps.len().checked_sub(1).filter(|n| *n > 0)?;

        // The mean of consecutive intervals telescopes to the overall span.
        let mean = last.duration_since(*first).as_secs_f64() / intervals as f64;
        let bpm = if mean > 0.0 {
            (60.0 / mean).round()
        } else {
            f64::from(MAX_BPM)
        };
        Some(bpm.clamp(f64::from(MIN_BPM), f64::from(MAX_BPM)) as u32)
    }
}
