pub mod capture;
pub mod engine;
pub mod error;
pub mod module;
pub mod output;
pub mod pipeline;
pub mod utils;

use std::path::{Path, PathBuf};
use std::time::Duration;

use arc_swap::ArcSwap;
use capture::{CaptureSync, ImageSpec, PixelFormat};
use pipeline::BlockingBehavior;
use serde::{Deserialize, Serialize};

pub use error::{Error, Result};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub capture: CaptureConfig,
    pub output: OutputConfig,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    pub fps: f32,
    pub format: PixelFormat,
    pub buffer_count: usize,
    pub turbo: bool,              // Skip completeness checks on captured slots
    pub sync: CaptureSync,        // Wait for DMA to settle before handing out a slot
    pub when_empty: BlockingBehavior,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub enabled: bool, // false: capture-only pipeline
    pub width: u32,
    pub height: u32,
    pub fps: f32,
    pub format: PixelFormat,
    pub buffer_count: usize,
    pub send_depth: usize, // Frames queued for transmission before send overflows
    pub when_empty: BlockingBehavior,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub module: String,
    pub instance: String,
    pub library: Option<PathBuf>, // Shared object holding `module`; built-ins when unset
    pub cpu_affinity: Option<usize>,
    pub max_cycles: Option<u64>,
}

impl CaptureConfig {
    pub fn spec(&self) -> ImageSpec {
        ImageSpec {
            width: self.width,
            height: self.height,
            format: self.format,
            fps: self.fps,
        }
    }
}

impl OutputConfig {
    pub fn spec(&self) -> ImageSpec {
        ImageSpec {
            width: self.width,
            height: self.height,
            format: self.format,
            fps: self.fps,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture: CaptureConfig {
                width: 320,
                height: 240,
                fps: 30.0,
                format: PixelFormat::Yuyv,
                buffer_count: 4,
                turbo: false,
                sync: CaptureSync::Settled,
                when_empty: BlockingBehavior::Block,
            },
            output: OutputConfig {
                enabled: true,
                width: 320,
                height: 240,
                fps: 30.0,
                format: PixelFormat::Yuyv,
                buffer_count: 4,
                send_depth: 1,
                when_empty: BlockingBehavior::Block,
            },
            engine: EngineConfig {
                module: "PassThrough".into(),
                instance: "passthrough0".into(),
                library: None,
                cpu_affinity: None,
                max_cycles: None,
            },
        }
    }
}

impl Config {
    /// Defaults, overlaid by an optional TOML file, overlaid by `FRAMELINK_*` env vars
    /// (e.g. `FRAMELINK_CAPTURE__FPS=15`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("FRAMELINK")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize::<Config>()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would leave a device without slots or pacing
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::Config(config::ConfigError::Message(msg)));
        if self.capture.buffer_count == 0 {
            return invalid("capture.buffer_count must be at least 1".into());
        }
        if !(self.capture.fps > 0.0 && Duration::try_from_secs_f32(1.0 / self.capture.fps).is_ok()) {
            return invalid(format!("capture.fps out of range: {}", self.capture.fps));
        }
        if self.output.enabled {
            if self.output.buffer_count == 0 {
                return invalid("output.buffer_count must be at least 1".into());
            }
            if self.output.send_depth == 0 {
                return invalid("output.send_depth must be at least 1".into());
            }
        }
        Ok(())
    }
}
