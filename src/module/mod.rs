//! Processing-unit protocol.
//!
//! A module is driven once per captured frame by the engine. It receives the
//! frame handles by value and is free to fail at any point: the handles give
//! their buffers back when they are dropped, and the engine moves on to the
//! next frame.
//!
//! Which `process` variant is called depends on the active configuration:
//! [`Module::process`] when an output stage exists, [`Module::process_input`]
//! when capture is the only stage. Input and output rates need not match; a
//! module that emits one output every five inputs keeps its own counter and
//! simply leaves the [`OutputFrame`] untouched on the other four calls.

use std::io::Write;
use std::sync::{Arc, Mutex};

use flume::Sender;
use tracing::trace;

use crate::capture::InputFrame;
use crate::error::{Error, Result};
use crate::output::OutputFrame;

pub mod builtin;
pub mod loader;

pub use loader::{DynamicLibrary, EntryPoints, LoadedModule, ModuleLoader, ModuleSource, StaticRegistry};

/// Protocol version modules are built against. Majors must match to load.
pub const PROTOCOL_VERSION_MAJOR: i32 = 1;
pub const PROTOCOL_VERSION_MINOR: i32 = 2;

/// Shared handle the host keeps on a loaded module
pub type SharedModule = Arc<Mutex<dyn Module>>;

/// A side channel a command arrived on; replies written here go back to its sender
pub trait UserInterface {
    fn write_string(&mut self, s: &str);
}

/// Collects replies in memory
#[derive(Debug, Default)]
pub struct ReplyBuffer(pub String);

impl UserInterface for ReplyBuffer {
    fn write_string(&mut self, s: &str) {
        self.0.push_str(s);
        if !s.ends_with('\n') {
            self.0.push('\n');
        }
    }
}

/// State every module carries: its instance name and outbound serial sink
#[derive(Debug, Default)]
pub struct ModuleBase {
    instance: String,
    serout: Option<Sender<String>>,
}

impl ModuleBase {
    pub fn new(instance: &str) -> Self {
        Self {
            instance: instance.to_string(),
            serout: None,
        }
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn attach_serial(&mut self, serout: Sender<String>) {
        self.serout = Some(serout);
    }

    pub fn detach_serial(&mut self) {
        self.serout = None;
    }

    /// Forward a line to the serial sink, if one is attached
    pub fn send_serial(&self, text: &str) {
        match &self.serout {
            Some(tx) => {
                if tx.send(text.to_string()).is_err() {
                    trace!("[{}] serial sink closed", self.instance);
                }
            }
            None => trace!("[{}] no serial sink, dropping: {}", self.instance, text),
        }
    }
}

/// A frame-by-frame processing unit
pub trait Module: Send {
    fn base(&self) -> &ModuleBase;

    fn base_mut(&mut self) -> &mut ModuleBase;

    /// Process one captured frame and (optionally) produce one output frame
    fn process(&mut self, input: InputFrame, output: OutputFrame) -> Result<()> {
        let _ = (input, output);
        Err(Error::NotImplemented("process(input, output)"))
    }

    /// Process one captured frame when there is no output stage
    fn process_input(&mut self, input: InputFrame) -> Result<()> {
        let _ = input;
        Err(Error::NotImplemented("process(input)"))
    }

    /// Send a line of results out of the serial side channel
    fn send_serial(&self, text: &str) {
        self.base().send_serial(text);
    }

    /// Handle a command the engine did not recognize.
    ///
    /// Return `Ok` when handled; the engine acknowledges with `OK`. Errors
    /// are shown to the user after an `ERR` prefix.
    fn parse_serial(&mut self, cmd: &str, ui: &mut dyn UserInterface) -> Result<()> {
        let _ = (cmd, ui);
        Err(Error::UnsupportedCommand)
    }

    /// Human-readable description of the commands `parse_serial` accepts
    fn supported_commands(&self, os: &mut dyn Write) -> std::io::Result<()> {
        writeln!(os, "None")
    }
}
