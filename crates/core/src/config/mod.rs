use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{controller::ClickVariant, tap::TapConfig, MetronomeError, Result, TempoSpec};

/// Supplies the values a metronome starts with. Storage is the
/// implementor's concern.
pub trait SettingsProvider {
    fn initial_tempo(&self) -> TempoSpec;

    fn stop_timeout(&self) -> Duration {
        Duration::from_millis(DEFAULT_STOP_TIMEOUT_MS)
    }
}

pub const DEFAULT_STOP_TIMEOUT_MS: u64 = 1_000;

/// Top-level configuration structure for the metronome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetronomeConfig {
    pub tempo: TempoSpec,
    pub tap: TapConfig,
    pub audio: AudioConfig,
    /// Upper bound on how long `stop()` waits for the timing thread.
    pub stop_timeout_ms: u64,
}

impl Default for MetronomeConfig {
    fn default() -> Self {
        Self {
            tempo: TempoSpec::default(),
            tap: TapConfig::default(),
            audio: AudioConfig::default(),
            stop_timeout_ms: DEFAULT_STOP_TIMEOUT_MS,
        }
    }
}

impl MetronomeConfig {
    /// Parses a JSON settings document. Missing fields take their defaults;
    /// present fields must be in range.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.tempo.validate()?;
        self.tap.validate()?;
        self.audio.validate()?;
        if self.stop_timeout_ms == 0 {
            return Err(MetronomeError::invalid("stop timeout must be non-zero"));
        }
        Ok(())
    }
}

impl SettingsProvider for MetronomeConfig {
    fn initial_tempo(&self) -> TempoSpec {
        self.tempo
    }

    fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Levels handed to the click sink.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub volume: f32,
    pub accent_volume: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            volume: 0.8,
            accent_volume: 1.0,
        }
    }
}

impl AudioConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [("volume", self.volume), ("accent_volume", self.accent_volume)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(MetronomeError::invalid(format!(
                    "{name} must be between 0.0 and 1.0, got {value}"
                )));
            }
        }
        Ok(())
    }

    pub fn gain_for(&self, variant: ClickVariant) -> f32 {
        match variant {
            ClickVariant::Accented => self.accent_volume,
            ClickVariant::Regular => self.volume,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TimeSignature;

    #[test]
    fn empty_document_yields_defaults() {
        let config = MetronomeConfig::from_json_str("{}").unwrap();
        assert_eq!(config, MetronomeConfig::default());
        assert_eq!(config.initial_tempo().bpm, 120);
        assert_eq!(config.tap.max_taps, 8);
        assert_eq!(config.stop_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn partial_document_overrides_fields() {
        let config = MetronomeConfig::from_json_str(
            r#"{"tempo": {"bpm": 90, "time_signature": {"beats_per_bar": 6, "beat_unit": 8}},
                "audio": {"volume": 0.5}}"#,
        )
        .unwrap();
        assert_eq!(config.tempo.bpm, 90);
        assert_eq!(config.tempo.time_signature, TimeSignature::new(6, 8).unwrap());
        assert_eq!(config.audio.volume, 0.5);
        assert_eq!(config.audio.accent_volume, 1.0);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        for doc in [
            r#"{"tempo": {"bpm": 300}}"#,
            r#"{"tempo": {"time_signature": {"beats_per_bar": 4, "beat_unit": 3}}}"#,
            r#"{"tap": {"max_taps": 0}}"#,
            r#"{"audio": {"volume": 1.5}}"#,
            r#"{"stop_timeout_ms": 0}"#,
        ] {
            assert!(
                matches!(
                    MetronomeConfig::from_json_str(doc),
                    Err(MetronomeError::InvalidArgument(_))
                ),
                "{doc}"
            );
        }
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        assert!(matches!(
            MetronomeConfig::from_json_str("{"),
            Err(MetronomeError::Config(_))
        ));
    }

    #[test]
    fn gain_depends_on_variant() {
        let audio = AudioConfig::default();
        assert_eq!(audio.gain_for(ClickVariant::Accented), 1.0);
        assert_eq!(audio.gain_for(ClickVariant::Regular), 0.8);
    }

    #[test]
    fn round_trips_through_json_text() {
        let config = MetronomeConfig::default();
        let text = config.to_json_string().unwrap();
        assert_eq!(MetronomeConfig::from_json_str(&text).unwrap(), config);
    }
}
