//! Reference orchestrator: drives the loaded module once per captured frame

use std::fmt::Write as _;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use flume::{Receiver, Sender};
use tracing::{debug, error, info, instrument, warn};

use crate::capture::{CaptureSync, InputFrame, VideoInput};
use crate::error::{Error, Result};
use crate::module::{LoadedModule, Module, ReplyBuffer};
use crate::output::{OutputFrame, VideoOutput};
use crate::{utils, Config};

/// Counters kept by the engine
#[derive(Debug, Default, Clone)]
pub struct EngineStats {
    pub cycles: u64,
    pub failures: u64,
    /// Polls that found no frame to process
    pub idle: u64,
    pub last_error: Option<String>,
}

/// Pause after a poll that found no frame
const IDLE_BACKOFF: Duration = Duration::from_millis(10);

const BUILTIN_HELP: &str = "\
help - show this message
info - show the current pipeline
ping - check that the engine is alive";

pub struct Engine {
    camera: Arc<dyn VideoInput>,
    gadget: Option<Arc<dyn VideoOutput>>,
    module: LoadedModule,
    serout: Sender<String>,
    turbo: bool,
    sync: CaptureSync,
    cpu_affinity: Option<usize>,
    max_cycles: Option<u64>,
    stats: EngineStats,
}

impl Engine {
    /// Capture-only engine; module serial output goes to `serout`
    pub fn new(camera: Arc<dyn VideoInput>, module: LoadedModule, serout: Sender<String>) -> Self {
        {
            let mut m = module.module.lock().unwrap_or_else(PoisonError::into_inner);
            m.base_mut().attach_serial(serout.clone());
        }
        Self {
            camera,
            gadget: None,
            module,
            serout,
            turbo: false,
            sync: CaptureSync::Settled,
            cpu_affinity: None,
            max_cycles: None,
            stats: EngineStats::default(),
        }
    }

    pub fn with_output(mut self, gadget: Arc<dyn VideoOutput>) -> Self {
        self.gadget = Some(gadget);
        self
    }

    pub fn with_config(mut self, config: &Config) -> Self {
        self.turbo = config.capture.turbo;
        self.sync = config.capture.sync;
        self.cpu_affinity = config.engine.cpu_affinity;
        self.max_cycles = config.engine.max_cycles;
        self
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    fn module(&self) -> MutexGuard<'_, dyn Module + 'static> {
        // A panic inside process leaves the module usable for the next frame
        self.module
            .module
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one frame through the module.
    ///
    /// Whatever the module does, both frame handles are dropped before this
    /// returns, so their buffers are back with the devices. Failures are
    /// counted, logged and returned; they never stop the engine. A poll that
    /// finds the devices empty or stopped is counted as idle, not as a cycle.
    pub fn run_cycle(&mut self) -> Result<()> {
        let start = Instant::now();
        let input = InputFrame::new(self.camera.clone(), self.turbo).with_sync_hint(self.sync);
        let output = self.gadget.clone().map(OutputFrame::new);

        let outcome = {
            let mut module = self.module();
            catch_unwind(AssertUnwindSafe(|| match output {
                Some(output) => module.process(input, output),
                None => module.process_input(input),
            }))
        };
        let result = match outcome {
            Ok(result) => result,
            Err(payload) => Err(Error::module(format!(
                "module panicked: {}",
                utils::panic_message(payload.as_ref())
            ))),
        };

        if let Err(e) = &result {
            if e.is_idle() {
                self.stats.idle += 1;
                metrics::counter!("framelink_idle_polls_total").increment(1);
                debug!("No frame this poll: {}", e);
                return result;
            }
        }

        self.stats.cycles += 1;
        metrics::counter!("framelink_cycles_total").increment(1);
        metrics::histogram!("framelink_process_time_us").record(start.elapsed().as_micros() as f64);

        if let Err(e) = &result {
            self.stats.failures += 1;
            self.stats.last_error = Some(e.to_string());
            metrics::counter!("framelink_cycle_failures_total").increment(1);
            if e.is_recoverable() {
                warn!("Cycle {}: {}", self.stats.cycles, e);
            } else {
                error!("Cycle {}: {}", self.stats.cycles, e);
            }
        }
        result
    }

    /// Answer one line received on the command channel
    #[instrument(skip(self))]
    pub fn handle_command(&mut self, line: &str) -> String {
        let cmd = line.trim();
        match cmd {
            "" => String::new(),
            "help" => self.help(),
            "info" => self.info(),
            "ping" => "ALIVE".to_string(),
            _ => {
                let mut ui = ReplyBuffer::default();
                let result = self.module().parse_serial(cmd, &mut ui);
                match result {
                    Ok(()) => {
                        ui.0.push_str("OK");
                        ui.0
                    }
                    Err(e) => format!("ERR Unsupported module-specific command [{cmd}]: {e}"),
                }
            }
        }
    }

    fn help(&self) -> String {
        let mut out = format!("GENERAL COMMANDS:\n{BUILTIN_HELP}\n\nMODULE-SPECIFIC COMMANDS:\n");
        let mut custom = Vec::new();
        if let Err(e) = self.module().supported_commands(&mut custom) {
            warn!("Module failed to list its commands: {}", e);
        }
        out.push_str(&String::from_utf8_lossy(&custom));
        out.truncate(out.trim_end().len());
        out
    }

    fn info(&self) -> String {
        let cam = self.camera.spec();
        let mut out = format!(
            "INFO: CAM {:?} {}x{} @ {}fps",
            cam.format, cam.width, cam.height, cam.fps
        );
        match &self.gadget {
            Some(g) => {
                let s = g.spec();
                let _ = write!(out, " -> OUT {:?} {}x{} @ {}fps", s.format, s.width, s.height, s.fps);
            }
            None => out.push_str(" -> OUT NONE"),
        }
        let _ = write!(
            out,
            " MOD {} ({}) cycles={} failures={} idle={}",
            self.module.name,
            self.module().base().instance(),
            self.stats.cycles,
            self.stats.failures,
            self.stats.idle
        );
        out
    }

    /// Cycle until `stop` is raised or `max_cycles` is reached, answering
    /// commands between frames.
    pub fn run(&mut self, stop: &AtomicBool, commands: &Receiver<String>) -> EngineStats {
        if let Some(core) = self.cpu_affinity {
            utils::pin_current_thread(core);
        }
        info!("Engine running module {}", self.module.name);

        while !stop.load(Ordering::Acquire) {
            for line in commands.try_iter() {
                let reply = self.handle_command(&line);
                if !reply.is_empty() && self.serout.send(reply).is_err() {
                    debug!("Serial output closed");
                }
            }

            if let Err(e) = self.run_cycle() {
                if e.is_idle() {
                    std::thread::sleep(IDLE_BACKOFF);
                }
            }

            if self.max_cycles.is_some_and(|max| self.stats.cycles >= max) {
                info!("Reached {} cycles", self.stats.cycles);
                break;
            }
        }

        info!(
            "Engine stopped after {} cycles ({} failed, {} idle polls)",
            self.stats.cycles, self.stats.failures, self.stats.idle
        );
        self.stats.clone()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.module().base_mut().detach_serial();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::input::tests::MockCamera;
    use crate::module::{ModuleBase, UserInterface};
    use std::sync::Mutex;

    struct Flaky {
        base: ModuleBase,
        calls: u32,
    }

    impl Module for Flaky {
        fn base(&self) -> &ModuleBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut ModuleBase {
            &mut self.base
        }

        fn process_input(&mut self, mut input: InputFrame) -> Result<()> {
            self.calls += 1;
            input.get(CaptureSync::Settled)?;
            match self.calls {
                2 => Err(Error::module("bad frame")),
                3 => panic!("detector crashed"),
                _ => {
                    self.send_serial("ok");
                    Ok(())
                }
            }
        }

        fn parse_serial(&mut self, cmd: &str, ui: &mut dyn UserInterface) -> Result<()> {
            if cmd == "calls" {
                ui.write_string(&self.calls.to_string());
                return Ok(());
            }
            Err(Error::UnsupportedCommand)
        }
    }

    fn engine(cam: Arc<MockCamera>) -> (Engine, Receiver<String>) {
        let module = LoadedModule::from_shared(
            "Flaky",
            Arc::new(Mutex::new(Flaky {
                base: ModuleBase::new("flaky0"),
                calls: 0,
            })),
        );
        let (tx, rx) = flume::unbounded();
        (Engine::new(cam, module, tx), rx)
    }

    #[test]
    fn failures_and_panics_are_absorbed() {
        let cam = Arc::new(MockCamera::new());
        let (mut engine, serout) = engine(cam.clone());

        assert!(engine.run_cycle().is_ok());
        assert!(matches!(engine.run_cycle(), Err(Error::Module(_))));
        let err = engine.run_cycle().unwrap_err();
        assert!(err.to_string().contains("detector crashed"));
        assert!(engine.run_cycle().is_ok());

        assert_eq!(engine.stats().cycles, 4);
        assert_eq!(engine.stats().failures, 2);
        assert_eq!(cam.gets.load(Ordering::SeqCst), 4);
        assert_eq!(cam.releases.load(Ordering::SeqCst), 4);
        assert_eq!(serout.try_iter().count(), 2);
    }

    #[test]
    fn starved_polls_are_idle_not_failures() {
        let mut cam = MockCamera::new();
        cam.starved = true;
        let cam = Arc::new(cam);
        let (mut engine, _serout) = engine(cam.clone());

        assert!(matches!(engine.run_cycle(), Err(Error::QueueStarved)));
        assert_eq!(engine.stats().cycles, 0);
        assert_eq!(engine.stats().failures, 0);
        assert_eq!(engine.stats().idle, 1);
        assert!(engine.stats().last_error.is_none());
        assert_eq!(cam.releases.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn run_backs_off_while_starved() {
        let mut cam = MockCamera::new();
        cam.starved = true;
        let (engine, _serout) = engine(Arc::new(cam));
        let mut config = Config::default();
        config.engine.max_cycles = Some(10_000);
        let mut engine = engine.with_config(&config);

        let stop = Arc::new(AtomicBool::new(false));
        let stopper = {
            let stop = stop.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(100));
                stop.store(true, Ordering::Release);
            })
        };
        let (_cmd_tx, cmd_rx) = flume::unbounded::<String>();
        let stats = engine.run(&stop, &cmd_rx);
        stopper.join().unwrap();

        assert_eq!(stats.cycles, 0);
        assert_eq!(stats.failures, 0);
        assert!(stats.idle > 0 && stats.idle < 100, "{} idle polls", stats.idle);
    }

    #[test]
    fn commands_route_to_builtins_then_module() {
        let cam = Arc::new(MockCamera::new());
        let (mut engine, _serout) = engine(cam);
        engine.run_cycle().unwrap();

        assert_eq!(engine.handle_command("ping"), "ALIVE");
        assert_eq!(engine.handle_command("calls"), "1\nOK");
        assert_eq!(
            engine.handle_command("launch"),
            "ERR Unsupported module-specific command [launch]: Unsupported command"
        );
        let help = engine.handle_command("help");
        assert!(help.contains("ping - check"));
        assert!(help.ends_with("MODULE-SPECIFIC COMMANDS:\nNone"));
        assert!(engine.handle_command("info").contains("OUT NONE"));
    }

    #[test]
    fn run_stops_at_max_cycles() {
        let cam = Arc::new(MockCamera::new());
        let (engine, _serout) = engine(cam.clone());
        let mut config = Config::default();
        config.engine.max_cycles = Some(5);
        let mut engine = engine.with_config(&config);

        let (cmd_tx, cmd_rx) = flume::unbounded();
        cmd_tx.send("ping".to_string()).unwrap();
        let stats = engine.run(&AtomicBool::new(false), &cmd_rx);
        assert_eq!(stats.cycles, 5);
        assert_eq!(cam.releases.load(Ordering::SeqCst), 5);
    }
}
