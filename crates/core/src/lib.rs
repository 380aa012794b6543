//! Core library for the Tempo metronome.
//!
//! The crate holds the parts of the metronome that need to be exact: the
//! beat scheduler that decides when each click fires, and the tap estimator
//! that turns human taps into a tempo. Windowing, audio output and settings
//! storage live outside; they plug in through [`ClickSink`] and
//! [`SettingsProvider`].

pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod scheduler;
pub mod tap;
pub mod tempo;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{AudioConfig, MetronomeConfig, SettingsProvider};
pub use controller::{ClickSink, ClickVariant, Controller};
pub use error::{MetronomeError, Result};
pub use scheduler::{BeatScheduler, TimingStats};
pub use tap::{TapConfig, TapEstimator};
pub use tempo::{BeatEvent, BeatInfo, TempoSpec, TimeSignature};
