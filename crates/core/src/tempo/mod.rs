//! Tempo and meter values shared by the scheduler, the tap estimator and the
//! controller.

use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{MetronomeError, Result};

pub const MIN_BPM: u32 = 40;
pub const MAX_BPM: u32 = 240;
pub const DEFAULT_BPM: u32 = 120;

pub const MIN_BEATS_PER_BAR: u32 = 1;
pub const MAX_BEATS_PER_BAR: u32 = 16;
pub const BEAT_UNITS: [u32; 4] = [2, 4, 8, 16];

/// Rejects any tempo outside `[MIN_BPM, MAX_BPM]`.
pub fn validate_bpm(bpm: u32) -> Result<u32> {
    if (MIN_BPM..=MAX_BPM).contains(&bpm) {
        Ok(bpm)
    } else {
        Err(MetronomeError::invalid(format!(
            "tempo must be between {MIN_BPM} and {MAX_BPM} BPM, got {bpm}"
        )))
    }
}

/// Length of one beat at `bpm`.
pub fn beat_duration(bpm: u32) -> Duration {
    Duration::from_secs_f64(60.0 / f64::from(bpm.max(1)))
}

/// Time signature, e.g. 3/4 or 7/8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeSignature {
    pub beats_per_bar: u32,
    pub beat_unit: u32,
}

impl TimeSignature {
    /// Builds a validated time signature. The numerator must lie in `[1, 16]`
    /// and the denominator must be one of 2, 4, 8 or 16.
    pub fn new(beats_per_bar: u32, beat_unit: u32) -> Result<Self> {
        if !(MIN_BEATS_PER_BAR..=MAX_BEATS_PER_BAR).contains(&beats_per_bar) {
            return Err(MetronomeError::invalid(format!(
                "time signature numerator must be {MIN_BEATS_PER_BAR}-{MAX_BEATS_PER_BAR}, got {beats_per_bar}"
            )));
        }
        if !BEAT_UNITS.contains(&beat_unit) {
            return Err(MetronomeError::invalid(format!(
                "time signature denominator must be 2, 4, 8, or 16, got {beat_unit}"
            )));
        }
        Ok(Self {
            beats_per_bar,
            beat_unit,
        })
    }

    pub fn common_time() -> Self {
        Self {
            beats_per_bar: 4,
            beat_unit: 4,
        }
    }

    /// Returns `true` when the beat at `beat_index` opens a bar.
    pub fn is_downbeat(&self, beat_index: u64) -> bool {
        self.position_in_bar(beat_index) == 0
    }

    /// Zero-based position of `beat_index` within its bar.
    pub fn position_in_bar(&self, beat_index: u64) -> u32 {
        (beat_index % u64::from(self.beats_per_bar.max(1))) as u32
    }
}

impl Default for TimeSignature {
    fn default() -> Self {
        Self::common_time()
    }
}

impl fmt::Display for TimeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.beats_per_bar, self.beat_unit)
    }
}

impl FromStr for TimeSignature {
    type Err = MetronomeError;

    fn from_str(s: &str) -> Result<Self> {
        let (numerator, denominator) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| MetronomeError::invalid(format!("expected N/D, got {s:?}")))?;
        let parse = |part: &str| {
            part.trim()
                .parse::<u32>()
                .map_err(|_| MetronomeError::invalid(format!("not a number: {part:?}")))
        };
        Self::new(parse(numerator)?, parse(denominator)?)
    }
}

/// Tempo plus meter. Instances handed out by this crate are always within
/// range; out-of-range requests are rejected wholesale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TempoSpec {
    pub bpm: u32,
    pub time_signature: TimeSignature,
}

impl TempoSpec {
    pub fn new(bpm: u32, time_signature: TimeSignature) -> Result<Self> {
        let spec = Self {
            bpm,
            time_signature,
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Checks every field. Useful for values that arrive through
    /// deserialization and bypassed the constructors.
    pub fn validate(&self) -> Result<()> {
        validate_bpm(self.bpm)?;
        TimeSignature::new(self.time_signature.beats_per_bar, self.time_signature.beat_unit)?;
        Ok(())
    }

    pub fn beat_duration(&self) -> Duration {
        beat_duration(self.bpm)
    }
}

impl Default for TempoSpec {
    fn default() -> Self {
        Self {
            bpm: DEFAULT_BPM,
            time_signature: TimeSignature::default(),
        }
    }
}

/// A single fired beat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeatEvent {
    pub beat_index: u64,
    pub is_downbeat: bool,
}

/// Snapshot of the scheduler for display purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BeatInfo {
    pub current_beat: u64,
    pub beats_per_bar: u32,
    /// One-based position within the bar.
    pub beat_in_bar: u32,
    pub is_downbeat: bool,
    pub is_running: bool,
    pub bpm: u32,
    #[serde(serialize_with = "serialize_display")]
    pub time_signature: TimeSignature,
}

impl BeatInfo {
    pub(crate) fn new(current_beat: u64, spec: TempoSpec, is_running: bool) -> Self {
        let signature = spec.time_signature;
        Self {
            current_beat,
            beats_per_bar: signature.beats_per_bar,
            beat_in_bar: signature.position_in_bar(current_beat) + 1,
            is_downbeat: signature.is_downbeat(current_beat),
            is_running,
            bpm: spec.bpm,
            time_signature: signature,
        }
    }
}

fn serialize_display<S: serde::Serializer>(
    value: &TimeSignature,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}
