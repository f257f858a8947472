use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use framelink::capture::{CaptureSync, ImageSpec, InputFrame, MemoryCamera, PixelFormat};
use framelink::engine::Engine;
use framelink::module::{ModuleLoader, StaticRegistry};
use framelink::output::{MemoryGadget, OutputFrame};
use framelink::pipeline::BlockingBehavior;
use framelink::{Config, Error, Result};

fn spec() -> ImageSpec {
    ImageSpec {
        width: 16,
        height: 4,
        format: PixelFormat::Grey,
        fps: 30.0,
    }
}

fn devices() -> (Arc<MemoryCamera>, Arc<MemoryGadget>, flume::Receiver<Bytes>) {
    let camera = Arc::new(MemoryCamera::new(spec(), 2, BlockingBehavior::Block).unwrap());
    camera.stream_on().unwrap();
    let (link_tx, link_rx) = flume::unbounded();
    // Send queue as deep as the pool so a send never overflows
    let gadget =
        Arc::new(MemoryGadget::new(spec(), 2, 2, BlockingBehavior::Block, Some(link_tx)).unwrap());
    (camera, gadget, link_rx)
}

fn cycle(camera: &Arc<MemoryCamera>, gadget: &Arc<MemoryGadget>, fail: bool) -> Result<()> {
    let mut input = InputFrame::new(camera.clone(), false);
    let mut output = OutputFrame::new(gadget.clone());

    let inimg = input.get(CaptureSync::Settled)?;
    let outimg = output.get()?;
    let n = inimg.bytes_used();
    outimg.pixels_mut()[..n].copy_from_slice(&inimg.pixels()[..n]);
    outimg.set_bytes_used(n);

    if fail {
        return Err(Error::module("injected failure"));
    }
    input.done()?;
    output.send()
}

#[test]
fn five_cycles_leak_no_slots() {
    let (camera, gadget, link) = devices();

    for i in 0..5 {
        let result = cycle(&camera, &gadget, i == 2);
        assert_eq!(result.is_err(), i == 2, "cycle {i}");
        assert_eq!(camera.held(), 0, "capture slot leaked in cycle {i}");
        assert!(gadget.wait_idle(Duration::from_secs(2)), "output slot leaked in cycle {i}");
    }

    // The failed cycle's output frame was still sent when it was dropped
    assert_eq!(gadget.transmitted(), 5);
    let frames: Vec<Bytes> = link.try_iter().collect();
    assert_eq!(frames.len(), 5);
    assert!(frames.iter().all(|f| f.len() == spec().frame_size()));

    camera.stream_off().unwrap();
}

#[test]
fn engine_drives_passthrough_end_to_end() {
    let (camera, gadget, link) = devices();
    let module = ModuleLoader::new()
        .load(&StaticRegistry::with_builtins(), "PassThrough", "pass0")
        .unwrap();

    let mut config = Config::default();
    config.engine.max_cycles = Some(5);
    let (serout_tx, serout_rx) = flume::unbounded();
    let (cmd_tx, cmd_rx) = flume::unbounded();
    cmd_tx.send("divider 1".to_string()).unwrap();

    let mut engine = Engine::new(camera.clone(), module, serout_tx)
        .with_output(gadget.clone())
        .with_config(&config);
    let stats = engine.run(&AtomicBool::new(false), &cmd_rx);

    assert_eq!(stats.cycles, 5);
    assert_eq!(stats.failures, 0);
    assert_eq!(camera.held(), 0);
    assert!(gadget.wait_idle(Duration::from_secs(2)));
    assert_eq!(link.try_iter().count(), 5);
    assert_eq!(serout_rx.try_recv().unwrap(), "divider set to 1\nOK");

    camera.stream_off().unwrap();
}

#[test]
fn version_mismatch_is_rejected_before_creation() {
    let loader = ModuleLoader::with_host_version(2, 0);
    let err = loader
        .load(&StaticRegistry::with_builtins(), "PassThrough", "pass0")
        .err()
        .unwrap();
    assert!(matches!(err, Error::VersionMismatch { found_major: 1, .. }));
}
