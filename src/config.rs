use crate::pipeline::MediaKind;
use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables of the engine core.
///
/// Defaults match the timings the pipeline was designed around; a partial
/// JSON document only overrides the fields it names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Nominal tick of the quantum scheduler and acknowledgement poll period.
    pub timing_period_ms: u64,
    /// Wait between cycles of a dedicated worker thread when idle.
    pub idle_wait_ms: u64,
    /// Ticks between two scheduler self-calibrations.
    pub calibration_ticks: u32,
    /// Ceiling of decoded video samples queued per stage.
    pub video_cache_count: usize,
    /// Ceiling of decoded audio samples queued per stage.
    pub audio_cache_count: usize,
    /// Samples per channel in one audio block.
    pub audio_block_len: u32,
    /// Encoder (re)initialization attempts before the stage gives up.
    pub encoder_init_attempts: u32,
    /// Reopen attempts for network sources before the reader gives up.
    pub source_reopen_attempts: u32,
    /// Backoff after a hung codec device.
    pub device_hang_backoff_ms: u64,
    /// Consecutive sink write failures before the sink is reopened.
    pub sink_failure_budget: u32,
    /// Sink reopens without a successful write before the sink gives up.
    pub sink_reopen_attempts: u32,
    /// Decoder resets without a successful decode before the source gives up.
    pub decoder_reset_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timing_period_ms: 15,
            idle_wait_ms: 20,
            calibration_ticks: 60,
            video_cache_count: 6,
            audio_cache_count: 12,
            audio_block_len: 1024,
            encoder_init_attempts: 10,
            source_reopen_attempts: 20,
            device_hang_backoff_ms: 100,
            sink_failure_budget: 10,
            sink_reopen_attempts: 3,
            decoder_reset_attempts: 10,
        }
    }
}

impl EngineConfig {
    /// Parse and validate a JSON configuration document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig =
            serde_json::from_str(json).context("failed to parse engine configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.timing_period_ms > 0, "timing_period_ms must be positive");
        ensure!(self.calibration_ticks > 0, "calibration_ticks must be positive");
        ensure!(self.video_cache_count > 0, "video_cache_count must be positive");
        ensure!(self.audio_cache_count > 0, "audio_cache_count must be positive");
        ensure!(self.audio_block_len > 0, "audio_block_len must be positive");
        Ok(())
    }

    pub fn timing_period(&self) -> Duration {
        Duration::from_millis(self.timing_period_ms)
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }

    pub fn device_hang_backoff(&self) -> Duration {
        Duration::from_millis(self.device_hang_backoff_ms)
    }

    /// Queue ceiling for samples of the given kind.
    pub fn cache_count(&self, kind: MediaKind) -> usize {
        match kind {
            MediaKind::Video => self.video_cache_count,
            MediaKind::Audio => self.audio_cache_count,
        }
    }
}

/// Returns a version as specified in Cargo.toml
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
