//! framelink: camera -> module -> host link, driven from the terminal

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use color_eyre::Result;
use framelink::capture::MemoryCamera;
use framelink::engine::Engine;
use framelink::module::{DynamicLibrary, ModuleLoader, StaticRegistry};
use framelink::output::MemoryGadget;
use framelink::Config;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("framelink=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .with_writer(std::io::stderr)
        .init();

    info!("framelink launching...");

    // Load configuration
    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(path.as_deref())?;
    framelink::CONFIG.store(Arc::new(config.clone()));

    // Load the processing module
    let loader = ModuleLoader::new();
    let module = match &config.engine.library {
        Some(lib) => {
            let lib = DynamicLibrary::open(lib)?;
            loader.load(&lib, &config.engine.module, &config.engine.instance)?
        }
        None => loader.load(
            &StaticRegistry::with_builtins(),
            &config.engine.module,
            &config.engine.instance,
        )?,
    };

    // Devices
    let camera = Arc::new(
        MemoryCamera::new(
            config.capture.spec(),
            config.capture.buffer_count,
            config.capture.when_empty,
        )?
        .paced(),
    );
    camera.stream_on()?;

    let (link_tx, link_rx) = flume::bounded::<Bytes>(config.output.buffer_count.max(1));
    let gadget = if config.output.enabled {
        Some(Arc::new(MemoryGadget::new(
            config.output.spec(),
            config.output.buffer_count,
            config.output.send_depth,
            config.output.when_empty,
            Some(link_tx),
        )?))
    } else {
        drop(link_tx);
        None
    };

    // Set up serial and command channels
    let (serout_tx, serout_rx) = flume::unbounded::<String>();
    let (cmd_tx, cmd_rx) = flume::unbounded::<String>();

    let mut engine = Engine::new(camera.clone(), module, serout_tx).with_config(&config);
    if let Some(gadget) = &gadget {
        engine = engine.with_output(gadget.clone());
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut engine_task = {
        let stop = stop.clone();
        tokio::task::spawn_blocking(move || engine.run(&stop, &cmd_rx))
    };

    // Host link: stand-in for the USB host
    tokio::spawn(async move {
        let mut frames = 0u64;
        while let Ok(frame) = link_rx.recv_async().await {
            frames += 1;
            if frames % 100 == 0 {
                debug!(frames, bytes = frame.len(), "Host link");
            }
        }
    });

    // Serial output
    tokio::spawn(async move {
        while let Ok(line) = serout_rx.recv_async().await {
            println!("{line}");
        }
    });

    // Serial input; a plain thread so a pending read never holds up shutdown
    std::thread::Builder::new()
        .name("serial-in".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines().map_while(|l| l.ok()) {
                if cmd_tx.send(line).is_err() {
                    break;
                }
            }
        })?;

    let stats = tokio::select! {
        stats = &mut engine_task => stats?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping");
            stop.store(true, Ordering::Release);
            // Unblock the engine if it is waiting on a device
            camera.stream_off()?;
            if let Some(gadget) = &gadget {
                gadget.disconnect();
            }
            engine_task.await?
        }
    };

    if let Some(gadget) = &gadget {
        if !gadget.wait_idle(Duration::from_secs(1)) {
            warn!("Output buffers still in flight at shutdown");
        }
        info!("Transmitted {} frames", gadget.transmitted());
    }
    info!(
        "framelink shutting down after {} cycles ({} failed, {} idle polls)",
        stats.cycles, stats.failures, stats.idle
    );
    Ok(())
}
