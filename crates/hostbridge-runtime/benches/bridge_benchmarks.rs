use criterion::{criterion_group, criterion_main, Criterion};
use hostbridge_runtime::audio::convert;
use hostbridge_runtime::graphics::translator_for;
use hostbridge_runtime::{
    AudioBuffer, ControllerAxes, DrawCommand, HostEvent, InputBridge, InputConfig, InputSource, Primitive,
    Samples, TouchPhase,
};
use hostbridge_runtime::audio::DeviceFormat;
use hostbridge_schema::{parse_profile_str, GraphicsBackend};

const PROFILE: &str = r#"
name = "bench"

[[rules]]
trigger = { kind = "touch_region", x = 0.0, y = 0.0, width = 200.0, height = 200.0 }
action = { kind = "key", code = 87 }

[[rules]]
trigger = { kind = "touch_region", x = 200.0, y = 0.0, width = 200.0, height = 200.0 }
action = { kind = "gamepad_button", button = "a" }
"#;

fn bench_input_translation(c: &mut Criterion) {
    let config = InputConfig {
        render_scale: 0.75,
        queue_capacity: 1024,
    };
    let (bridge, _rx) = InputBridge::new(parse_profile_str(PROFILE).unwrap(), config).unwrap();
    let touches: Vec<HostEvent> = (0..64)
        .map(|i| HostEvent::Touch {
            pointer: 0,
            phase: match i {
                0 => TouchPhase::Down,
                63 => TouchPhase::Up,
                _ => TouchPhase::Move,
            },
            x: 600.0 + i as f32,
            y: 400.0,
        })
        .collect();
    c.bench_function("input_translate_touch_stream_64", |b| {
        b.iter(|| {
            for event in &touches {
                criterion::black_box(bridge.translate(event));
            }
        });
    });

    let motion = HostEvent::ControllerMotion {
        source: InputSource::Gamepad,
        axes: ControllerAxes {
            x: 0.5,
            y: -0.1,
            z: 0.3,
            rz: 0.0,
            left_trigger: 0.9,
            right_trigger: 0.0,
        },
    };
    c.bench_function("input_translate_controller_motion", |b| {
        b.iter(|| criterion::black_box(bridge.translate(&motion)));
    });
}

fn bench_audio_conversion(c: &mut Criterion) {
    let samples: Vec<i16> = (0..2048).map(|i| (i * 13 % 65536 - 32768) as i16).collect();
    let buffer = AudioBuffer::new(22_050, 1, Samples::I16(samples)).unwrap();
    let target = DeviceFormat {
        sample_rate: 48_000,
        channels: 2,
    };
    let mut converter = convert::Converter::new(target);
    c.bench_function("audio_convert_22k_mono_to_48k_stereo", |b| {
        b.iter(|| criterion::black_box(converter.convert(&buffer)));
    });
}

fn bench_draw_translation(c: &mut Criterion) {
    let frame: Vec<DrawCommand> = (0..256)
        .map(|i| DrawCommand::DrawArrays {
            mode: if i % 2 == 0 {
                Primitive::Quads
            } else {
                Primitive::Triangles
            },
            first: i * 4,
            count: 4,
        })
        .collect();
    for backend in [GraphicsBackend::Gles, GraphicsBackend::Vulkan] {
        let mut translator = translator_for(backend);
        c.bench_function(&format!("graphics_translate_256_draws_{backend}"), |b| {
            b.iter(|| criterion::black_box(translator.translate(&frame)));
        });
    }
}

criterion_group!(
    benches,
    bench_input_translation,
    bench_audio_conversion,
    bench_draw_translation
);
criterion_main!(benches);
