//! Units shipped with the crate

use std::io::Write;
use std::sync::{Arc, Mutex};

use tracing::debug;

use super::loader::{EntryPoints, StaticRegistry};
use super::{
    Module, ModuleBase, SharedModule, UserInterface, PROTOCOL_VERSION_MAJOR,
    PROTOCOL_VERSION_MINOR,
};
use crate::capture::{InputFrame, PixelFormat};
use crate::error::{Error, Result};
use crate::output::OutputFrame;

pub(crate) fn register(registry: &mut StaticRegistry) {
    registry.register(
        "PassThrough",
        EntryPoints::native(PassThrough::create, version_major, version_minor),
    );
    registry.register(
        "FrameStats",
        EntryPoints::native(FrameStats::create, version_major, version_minor),
    );
}

fn version_major() -> i32 {
    PROTOCOL_VERSION_MAJOR
}

fn version_minor() -> i32 {
    PROTOCOL_VERSION_MINOR
}

/// Copies each input frame into the output frame.
///
/// With a divider of `n`, only every n-th input produces an output.
pub struct PassThrough {
    base: ModuleBase,
    divider: u32,
    count: u64,
}

impl PassThrough {
    pub fn new(instance: &str) -> Self {
        Self {
            base: ModuleBase::new(instance),
            divider: 1,
            count: 0,
        }
    }

    pub fn create(instance: &str) -> SharedModule {
        Arc::new(Mutex::new(Self::new(instance)))
    }
}

impl Module for PassThrough {
    fn base(&self) -> &ModuleBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ModuleBase {
        &mut self.base
    }

    fn process(&mut self, mut input: InputFrame, mut output: OutputFrame) -> Result<()> {
        self.count += 1;
        let inimg = input.get(input.sync_hint())?;
        if self.count % u64::from(self.divider) != 0 {
            return Ok(());
        }

        let outimg = output.get()?;
        if inimg.spec.format != outimg.spec.format
            || inimg.width() != outimg.width()
            || inimg.height() != outimg.height()
        {
            return Err(Error::module(format!(
                "cannot pass {}x{} {:?} through to {}x{} {:?}",
                inimg.width(),
                inimg.height(),
                inimg.format(),
                outimg.width(),
                outimg.height(),
                outimg.format()
            )));
        }

        let n = inimg.bytes_used();
        outimg.pixels_mut()[..n].copy_from_slice(&inimg.pixels()[..n]);
        outimg.set_bytes_used(n);

        // Let the camera have its buffer back before the output goes out
        input.done()?;
        output.send()
    }

    fn parse_serial(&mut self, cmd: &str, ui: &mut dyn UserInterface) -> Result<()> {
        let mut words = cmd.split_whitespace();
        match (words.next(), words.next(), words.next()) {
            (Some("divider"), Some(n), None) => {
                let n: u32 = n
                    .parse()
                    .ok()
                    .filter(|&n| n > 0)
                    .ok_or_else(|| Error::module(format!("invalid divider: {n}")))?;
                self.divider = n;
                ui.write_string(&format!("divider set to {n}"));
                debug!("[{}] divider = {}", self.base.instance(), n);
                Ok(())
            }
            _ => Err(Error::UnsupportedCommand),
        }
    }

    fn supported_commands(&self, os: &mut dyn Write) -> std::io::Result<()> {
        writeln!(os, "divider <n> - send one output frame every <n> input frames")
    }
}

/// Reports the mean luminance of each captured frame over serial
pub struct FrameStats {
    base: ModuleBase,
    frames: u64,
}

impl FrameStats {
    pub fn new(instance: &str) -> Self {
        Self {
            base: ModuleBase::new(instance),
            frames: 0,
        }
    }

    pub fn create(instance: &str) -> SharedModule {
        Arc::new(Mutex::new(Self::new(instance)))
    }
}

/// Average of the luma samples in a frame
fn mean_luma(format: PixelFormat, pixels: &[u8]) -> Result<f64> {
    let (sum, n) = match format {
        PixelFormat::Grey | PixelFormat::Nv12 => {
            (pixels.iter().map(|&p| u64::from(p)).sum::<u64>(), pixels.len())
        }
        // Y0 U Y1 V
        PixelFormat::Yuyv => (
            pixels.iter().step_by(2).map(|&p| u64::from(p)).sum::<u64>(),
            pixels.len().div_ceil(2),
        ),
        other => return Err(Error::module(format!("no luma channel in {other:?}"))),
    };
    if n == 0 {
        return Ok(0.0);
    }
    Ok(sum as f64 / n as f64)
}

impl Module for FrameStats {
    fn base(&self) -> &ModuleBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ModuleBase {
        &mut self.base
    }

    fn process_input(&mut self, mut input: InputFrame) -> Result<()> {
        let img = input.get(input.sync_hint())?;
        let mean = {
            let px = img.pixels();
            let luma = match img.format() {
                // Only the Y plane
                PixelFormat::Nv12 => &px[..img.stride() * img.height() as usize],
                _ => &px[..],
            };
            mean_luma(img.format(), luma)?
        };
        input.done()?;

        self.frames += 1;
        self.send_serial(&format!("MEAN {} {:.1}", self.frames, mean));
        Ok(())
    }

    fn parse_serial(&mut self, cmd: &str, ui: &mut dyn UserInterface) -> Result<()> {
        match cmd.trim() {
            "reset" => {
                self.frames = 0;
                Ok(())
            }
            "count" => {
                ui.write_string(&self.frames.to_string());
                Ok(())
            }
            _ => Err(Error::UnsupportedCommand),
        }
    }

    fn supported_commands(&self, os: &mut dyn Write) -> std::io::Result<()> {
        writeln!(os, "reset - restart the frame counter")?;
        writeln!(os, "count - show frames processed since the last reset")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ReplyBuffer;

    #[test]
    fn luma_of_yuyv_skips_chroma() {
        let px = [100u8, 0, 200, 255];
        assert_eq!(mean_luma(PixelFormat::Yuyv, &px).unwrap(), 150.0);
        assert!(mean_luma(PixelFormat::Rgb24, &px).is_err());
    }

    #[test]
    fn divider_command() {
        let mut m = PassThrough::new("p");
        let mut ui = ReplyBuffer::default();
        m.parse_serial("divider 5", &mut ui).unwrap();
        assert_eq!(m.divider, 5);
        assert_eq!(ui.0, "divider set to 5\n");
        assert!(matches!(m.parse_serial("divider 0", &mut ui), Err(Error::Module(_))));
        assert!(matches!(m.parse_serial("divide 2", &mut ui), Err(Error::UnsupportedCommand)));
    }

    #[test]
    fn stats_commands() {
        let mut m = FrameStats::new("s");
        m.frames = 7;
        let mut ui = ReplyBuffer::default();
        m.parse_serial("count", &mut ui).unwrap();
        m.parse_serial("reset", &mut ui).unwrap();
        assert_eq!(ui.0, "7\n");
        assert_eq!(m.frames, 0);

        let mut help = Vec::new();
        m.supported_commands(&mut help).unwrap();
        assert!(String::from_utf8(help).unwrap().starts_with("reset"));
    }

    #[test]
    fn builtins_are_registered() {
        let reg = StaticRegistry::with_builtins();
        assert_eq!(reg.names(), vec!["FrameStats", "PassThrough"]);
    }
}
