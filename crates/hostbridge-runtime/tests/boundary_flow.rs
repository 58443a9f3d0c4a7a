//! A hosted program on the thread backend driving all four boundary primitives.

use hostbridge_runtime::{
    AudioBridge, AudioBuffer, AudioConfig, Bridges, DrawCommand, Frame, GraphicsShim,
    HostEvent, HostedContext, HostedProcess, InputBridge, InputConfig, LaunchSpec, LifecycleSignal, LogTail,
    ManualDevice, NativeCommand, PixelFormat, RecordingWindow, RuntimeBackend, Samples,
    ShimConfig, SyntheticEvent, Termination, ThreadBackend, WindowEvent, WindowInfo, WindowLog,
};
use hostbridge_runtime::audio::DeviceFormat;
use hostbridge_schema::{parse_profile_str, GraphicsBackend};
use std::sync::Arc;
use std::time::{Duration, Instant};

const PROFILE: &str = r#"
name = "flow"

[[rules]]
trigger = { kind = "virtual_key", name = "fire" }
action = { kind = "key", code = 70 }
"#;

fn wait(process: &mut dyn HostedProcess) -> Termination {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(t) = process.try_wait().unwrap() {
            return t;
        }
        assert!(Instant::now() < deadline, "hosted program did not finish");
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn spec() -> LaunchSpec {
    LaunchSpec {
        bundle_id: "game".to_owned(),
        version: "1.0.0".to_owned(),
        bundle_root: std::env::temp_dir(),
        entry_point: None,
        args: vec![],
        libraries: vec![],
    }
}

/// Waits for the "fire" key, draws one quad, plays one buffer and quits.
fn hosted_game(ctx: HostedContext) -> i32 {
    let boundary = &ctx.boundary;
    boundary.report_lifecycle_event(LifecycleSignal::Ready);
    loop {
        match boundary.next_input(Duration::from_millis(20)) {
            Some(SyntheticEvent::Key {
                code: 70,
                pressed: true,
            }) => break,
            Some(_) => {}
            None if ctx.exit_requested() => return 1,
            None => {}
        }
    }
    let frame = Frame {
        generation: boundary.surface_generation(),
        commands: vec![
            DrawCommand::ClearColor([0.0, 0.0, 0.0, 1.0]),
            DrawCommand::DrawArrays {
                mode: hostbridge_runtime::Primitive::Quads,
                first: 0,
                count: 4,
            },
        ],
    };
    if !boundary.submit_frame(frame) {
        return 2;
    }
    let Ok(buffer) = AudioBuffer::new(48_000, 2, Samples::F32(vec![0.25; 8])) else {
        return 3;
    };
    boundary.push_audio_buffer(buffer);
    ctx.log.push("level loaded");
    boundary.report_lifecycle_event(LifecycleSignal::ExitRequested);
    0
}

#[test]
fn hosted_program_uses_every_bridge() {
    let log = WindowLog::default();
    let graphics = GraphicsShim::start(
        ShimConfig {
            backend: GraphicsBackend::Gles,
            render_scale: 1.0,
            frame_queue_depth: 2,
        },
        None,
    )
    .unwrap();
    graphics.attach_surface(Box::new(RecordingWindow::new(
        1,
        WindowInfo {
            width: 1280,
            height: 720,
            format: PixelFormat::Rgba8888,
        },
        Arc::clone(&log),
    )));
    let (input, inbox) = InputBridge::new(
        parse_profile_str(PROFILE).unwrap(),
        InputConfig {
            render_scale: 1.0,
            queue_capacity: 32,
        },
    )
    .unwrap();
    let device = Arc::new(ManualDevice::new(
        "speaker",
        DeviceFormat {
            sample_rate: 48_000,
            channels: 2,
        },
    ));
    let audio = AudioBridge::new(device.clone(), AudioConfig::default());
    let mut bridges = Bridges::new(graphics, input, inbox, audio);

    let (lifecycle_tx, lifecycle_rx) = crossbeam_channel::unbounded();
    let tail = LogTail::new(16);
    let ctx = HostedContext::new(Arc::new(bridges.boundary(lifecycle_tx)), tail.clone());
    let backend = ThreadBackend::new(hosted_game);
    let mut process = backend.spawn(&spec(), ctx).unwrap();

    assert_eq!(
        lifecycle_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        LifecycleSignal::Ready
    );
    bridges.input.push_input_event(&HostEvent::VirtualKey {
        name: "fire".to_owned(),
        pressed: true,
    });

    assert_eq!(wait(process.as_mut()), Termination::Exited { code: 0 });
    assert_eq!(
        lifecycle_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
        LifecycleSignal::ExitRequested
    );
    assert_eq!(tail.lines(), vec!["level loaded"]);

    assert!(bridges.graphics.flush(Duration::from_secs(5)));
    assert_eq!(bridges.graphics.stats().presented, 1);
    let presented = log
        .lock()
        .unwrap()
        .iter()
        .find_map(|e| match e {
            WindowEvent::Presented { commands, .. } => Some(commands.clone()),
            _ => None,
        })
        .unwrap();
    assert!(presented
        .iter()
        .any(|c| matches!(c, NativeCommand::DrawIndexed { indices, .. } if indices.len() == 6)));

    assert_eq!(device.pull(4), vec![0.25; 8]);
    bridges.release();
    assert!(log
        .lock()
        .unwrap()
        .contains(&WindowEvent::Released { window: 1 }));
}

#[test]
fn host_events_parse_from_json() {
    let event: HostEvent = serde_json::from_str(
        r#"{"kind":"touch","pointer":0,"phase":"down","x":12.5,"y":40.0}"#,
    )
    .unwrap();
    assert_eq!(
        event,
        HostEvent::Touch {
            pointer: 0,
            phase: hostbridge_runtime::TouchPhase::Down,
            x: 12.5,
            y: 40.0,
        }
    );
    let signal = serde_json::to_string(&LifecycleSignal::Message {
        text: "saving".to_owned(),
    })
    .unwrap();
    assert_eq!(signal, r#"{"kind":"message","text":"saving"}"#);
}
