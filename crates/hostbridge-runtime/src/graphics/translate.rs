//! Desktop-style draw calls to native command streams.
//!
//! Both targets keep the submission order of a frame. Primitives the device API
//! lacks are expanded into indexed triangles; polygon fill modes are dropped.

use super::{Capability, DrawCommand, NativeCommand, PipelineState, PolygonMode, Primitive, Topology};
use hostbridge_schema::GraphicsBackend;
use tracing::trace;

pub trait Translator: Send {
    fn backend(&self) -> GraphicsBackend;

    /// Translate one frame's commands, in order.
    fn translate(&mut self, commands: &[DrawCommand]) -> Vec<NativeCommand>;
}

pub fn translator_for(backend: GraphicsBackend) -> Box<dyn Translator> {
    match backend {
        GraphicsBackend::Gles => Box::new(GlesTranslator),
        GraphicsBackend::Vulkan => Box::new(VulkanTranslator::default()),
    }
}

/// `(b, b+1, b+2), (b, b+2, b+3)` for each complete quad of `vertices`.
fn quads_to_triangles(vertices: &[u32]) -> Vec<u32> {
    vertices
        .chunks_exact(4)
        .flat_map(|q| [q[0], q[1], q[2], q[0], q[2], q[3]])
        .collect()
}

fn fan_to_triangles(vertices: &[u32]) -> Vec<u32> {
    if vertices.len() < 3 {
        return Vec::new();
    }
    vertices
        .windows(2)
        .skip(1)
        .flat_map(|w| [vertices[0], w[0], w[1]])
        .collect()
}

fn sequence(first: u32, count: u32) -> Vec<u32> {
    (first..first.saturating_add(count)).collect()
}

fn topology(mode: Primitive) -> Topology {
    match mode {
        Primitive::Points => Topology::Points,
        Primitive::Lines => Topology::Lines,
        Primitive::LineStrip => Topology::LineStrip,
        Primitive::Triangles | Primitive::Quads => Topology::Triangles,
        Primitive::TriangleStrip | Primitive::QuadStrip => Topology::TriangleStrip,
        Primitive::TriangleFan | Primitive::Polygon => Topology::TriangleFan,
    }
}

/// OpenGL ES: state calls pass through; quads become indexed triangles,
/// quad strips triangle strips, polygons triangle fans.
pub struct GlesTranslator;

impl GlesTranslator {
    fn draw(mode: Primitive, vertices: Option<&[u32]>, first: u32, count: u32) -> Option<NativeCommand> {
        let topo = topology(mode);
        match (mode, vertices) {
            (Primitive::Quads, v) => {
                let indices = quads_to_triangles(&v.map_or_else(|| sequence(first, count), <[u32]>::to_vec));
                (!indices.is_empty()).then_some(NativeCommand::DrawIndexed {
                    topology: Topology::Triangles,
                    indices,
                })
            }
            (_, Some(v)) => Some(NativeCommand::DrawIndexed {
                topology: topo,
                indices: v.to_vec(),
            }),
            (_, None) => Some(NativeCommand::Draw {
                topology: topo,
                first,
                count,
            }),
        }
    }
}

impl Translator for GlesTranslator {
    fn backend(&self) -> GraphicsBackend {
        GraphicsBackend::Gles
    }

    fn translate(&mut self, commands: &[DrawCommand]) -> Vec<NativeCommand> {
        let mut out = Vec::with_capacity(commands.len());
        for cmd in commands {
            match cmd {
                DrawCommand::Viewport {
                    x,
                    y,
                    width,
                    height,
                } => out.push(NativeCommand::Viewport {
                    x: *x,
                    y: *y,
                    width: *width,
                    height: *height,
                }),
                DrawCommand::ClearColor(c) => out.push(NativeCommand::ClearColor(*c)),
                DrawCommand::Clear { color, depth } => out.push(NativeCommand::Clear {
                    color: *color,
                    depth: *depth,
                }),
                DrawCommand::Enable(cap) => out.push(NativeCommand::SetCapability {
                    cap: *cap,
                    enabled: true,
                }),
                DrawCommand::Disable(cap) => out.push(NativeCommand::SetCapability {
                    cap: *cap,
                    enabled: false,
                }),
                DrawCommand::UseProgram(p) => out.push(NativeCommand::UseProgram(*p)),
                DrawCommand::BindTexture(t) => out.push(NativeCommand::BindTexture(*t)),
                DrawCommand::PolygonMode(mode) => {
                    if *mode != PolygonMode::Fill {
                        trace!("gles: dropping polygon mode {mode:?}");
                    }
                }
                DrawCommand::DrawArrays { mode, first, count } => {
                    out.extend(Self::draw(*mode, None, *first, *count));
                }
                DrawCommand::DrawElements { mode, indices } => {
                    out.extend(Self::draw(*mode, Some(indices), 0, 0));
                }
            }
        }
        out
    }
}

/// Vulkan: draws are recorded inside one render pass per frame, fixed-function
/// state folds into pipeline binds, and fans are expanded since portability
/// implementations may lack them.
#[derive(Default)]
pub struct VulkanTranslator {
    program: u32,
    blend: bool,
    depth_test: bool,
    cull_face: bool,
    scissor_test: bool,
}

impl VulkanTranslator {
    fn set(&mut self, cap: Capability, enabled: bool) {
        match cap {
            Capability::Blend => self.blend = enabled,
            Capability::DepthTest => self.depth_test = enabled,
            Capability::CullFace => self.cull_face = enabled,
            Capability::ScissorTest => self.scissor_test = enabled,
        }
    }

    fn pipeline(&self, topology: Topology) -> PipelineState {
        PipelineState {
            program: self.program,
            topology,
            blend: self.blend,
            depth_test: self.depth_test,
            cull_face: self.cull_face,
            scissor_test: self.scissor_test,
        }
    }

    fn lower(mode: Primitive, vertices: Option<&[u32]>, first: u32, count: u32) -> Option<(Topology, NativeCommand)> {
        let expand = |f: fn(&[u32]) -> Vec<u32>| {
            let indices = f(&vertices.map_or_else(|| sequence(first, count), <[u32]>::to_vec));
            (!indices.is_empty()).then_some((
                Topology::Triangles,
                NativeCommand::DrawIndexed {
                    topology: Topology::Triangles,
                    indices,
                },
            ))
        };
        match mode {
            Primitive::Quads => expand(quads_to_triangles),
            Primitive::TriangleFan | Primitive::Polygon => expand(fan_to_triangles),
            other => {
                let topo = topology(other);
                Some(match vertices {
                    Some(v) => (
                        topo,
                        NativeCommand::DrawIndexed {
                            topology: topo,
                            indices: v.to_vec(),
                        },
                    ),
                    None => (
                        topo,
                        NativeCommand::Draw {
                            topology: topo,
                            first,
                            count,
                        },
                    ),
                })
            }
        }
    }
}

impl Translator for VulkanTranslator {
    fn backend(&self) -> GraphicsBackend {
        GraphicsBackend::Vulkan
    }

    fn translate(&mut self, commands: &[DrawCommand]) -> Vec<NativeCommand> {
        let mut out = Vec::with_capacity(commands.len() + 2);
        out.push(NativeCommand::BeginRenderPass);
        // Pipeline bindings do not survive command buffers.
        let mut bound: Option<PipelineState> = None;
        for cmd in commands {
            match cmd {
                DrawCommand::Viewport {
                    x,
                    y,
                    width,
                    height,
                } => out.push(NativeCommand::Viewport {
                    x: *x,
                    y: *y,
                    width: *width,
                    height: *height,
                }),
                DrawCommand::ClearColor(c) => out.push(NativeCommand::ClearColor(*c)),
                DrawCommand::Clear { color, depth } => out.push(NativeCommand::Clear {
                    color: *color,
                    depth: *depth,
                }),
                DrawCommand::Enable(cap) => self.set(*cap, true),
                DrawCommand::Disable(cap) => self.set(*cap, false),
                DrawCommand::UseProgram(p) => self.program = *p,
                DrawCommand::BindTexture(t) => out.push(NativeCommand::BindTexture(*t)),
                DrawCommand::PolygonMode(mode) => {
                    if *mode != PolygonMode::Fill {
                        trace!("vulkan: dropping polygon mode {mode:?}");
                    }
                }
                DrawCommand::DrawArrays { mode, first, count } => {
                    if let Some((topo, draw)) = Self::lower(*mode, None, *first, *count) {
                        let state = self.pipeline(topo);
                        if bound != Some(state) {
                            out.push(NativeCommand::BindPipeline(state));
                            bound = Some(state);
                        }
                        out.push(draw);
                    }
                }
                DrawCommand::DrawElements { mode, indices } => {
                    if let Some((topo, draw)) = Self::lower(*mode, Some(indices), 0, 0) {
                        let state = self.pipeline(topo);
                        if bound != Some(state) {
                            out.push(NativeCommand::BindPipeline(state));
                            bound = Some(state);
                        }
                        out.push(draw);
                    }
                }
            }
        }
        out.push(NativeCommand::EndRenderPass);
        out
    }
}
