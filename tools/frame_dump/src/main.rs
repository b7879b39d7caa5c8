use std::cell::{Cell, RefCell};
use std::env;
use std::mem;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::mpsc;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Quat, Vec2, Vec3};
use rustc_hash::FxHashMap;
use wgpu::util::DeviceExt;

use rift_core::layers::LayerMask;
use rift_core::portal::{Portal, PortalId, PortalSet};
use rift_gpu::composite::{CompositeParams, PortalCompositor, FULL_UV_RECT, STENCIL_DEPTH_FORMAT};
use rift_gpu::headless::HeadlessGpu;
use rift_gpu::pool::{GpuTargetPool, POOL_DEPTH_FORMAT};
use rift_render::backend::{
    CullError, CullRequest, CullToken, PaintContext, PainterRegistry, RenderState, RenderTargets,
    SceneBackend, SurfacePainter, TargetDesc, TargetHandle,
};
use rift_render::camera::EyeCamera;
use rift_render::graph::RenderGraph;
use rift_render::pass::PortalPassStack;
use rift_render::settings::{RenderSettings, RenderStrategy};

const COLOR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
const SKY_COLOR: wgpu::Color = wgpu::Color {
    r: 0.35,
    g: 0.55,
    b: 0.8,
    a: 1.0,
};

fn main() {
    let _ = tracing_subscriber::fmt().with_target(false).try_init();

    let mut out_path = PathBuf::from("dump.png");
    let mut size = (1280u32, 720u32);
    let mut settings = RenderSettings {
        shadows: false,
        ..RenderSettings::default()
    };

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--out" => {
                let Some(value) = args.next() else {
                    eprintln!("--out expects a path argument");
                    std::process::exit(2);
                };
                out_path = PathBuf::from(value);
            }
            "--size" => {
                let Some(value) = args.next() else {
                    eprintln!("--size expects a WxH argument");
                    std::process::exit(2);
                };
                match parse_size(&value) {
                    Some(parsed) => size = parsed,
                    None => {
                        eprintln!("invalid size '{value}', expected e.g. 1280x720");
                        std::process::exit(2);
                    }
                }
            }
            "--strategy" => {
                let Some(value) = args.next() else {
                    eprintln!("--strategy expects 'stencil' or 'texture'");
                    std::process::exit(2);
                };
                match value.as_str() {
                    "stencil" => settings.strategy = RenderStrategy::Stencil,
                    "texture" => settings.strategy = RenderStrategy::Texture,
                    other => {
                        eprintln!("unknown strategy '{other}'");
                        std::process::exit(2);
                    }
                }
            }
            "--depth" => {
                let Some(value) = args.next() else {
                    eprintln!("--depth expects a numeric argument");
                    std::process::exit(2);
                };
                match value.parse::<u32>() {
                    Ok(parsed) => settings.max_recursion_depth = parsed,
                    Err(err) => {
                        eprintln!("invalid depth '{value}': {err}");
                        std::process::exit(2);
                    }
                }
            }
            "--help" | "-h" => {
                println!(
                    "Usage: frame_dump [--out <png>] [--size <WxH>] \
                     [--strategy stencil|texture] [--depth <u32>]"
                );
                return;
            }
            other => {
                eprintln!("unknown argument: {other}");
                std::process::exit(2);
            }
        }
    }

    if let Err(err) = run(&out_path, size, settings) {
        eprintln!("frame_dump error: {err}");
        std::process::exit(1);
    }
}

fn parse_size(value: &str) -> Option<(u32, u32)> {
    let (w, h) = value.split_once('x')?;
    let w = w.parse().ok().filter(|w| *w > 0)?;
    let h = h.parse().ok().filter(|h| *h > 0)?;
    Some((w, h))
}

fn run(out_path: &std::path::Path, size: (u32, u32), settings: RenderSettings) -> Result<(), String> {
    let gpu = HeadlessGpu::new().map_err(|err| format!("gpu init failed: {err}"))?;
    let settings = settings.sanitize();
    let (width, height) = size;

    let (set, extents) = demo_portals();
    let eye = EyeCamera {
        aspect: width as f32 / height as f32,
        ..EyeCamera::looking(Vec3::new(0.0, 1.6, 6.0), Vec3::NEG_Z, Vec3::Y)
    };

    let mut graph = RenderGraph::new();
    graph.build(&set, &[eye], LayerMask::all(), &settings.graph_limits());
    let root = *graph
        .roots()
        .first()
        .ok_or_else(|| "graph build produced no root".to_string())?;

    let shared = Rc::new(FrameShared::new(&gpu, width, height, extents));
    *shared.encoder.borrow_mut() = Some(gpu.device.create_command_encoder(
        &wgpu::CommandEncoderDescriptor {
            label: Some("Frame Dump Encoder"),
        },
    ));

    let mut backend = GpuSceneBackend {
        shared: Rc::clone(&shared),
        next_token: 0,
    };
    let mut targets = SharedTargets {
        shared: Rc::clone(&shared),
    };
    let mut painters = PainterRegistry::with_fallback(Box::new(PortalQuadPainter {
        shared: Rc::clone(&shared),
    }));

    let mut stack = PortalPassStack::new(settings);
    let stats = stack.execute(
        &graph,
        root,
        size,
        &set,
        &mut backend,
        &mut targets,
        &mut painters,
    );

    let encoder = shared
        .encoder
        .borrow_mut()
        .take()
        .ok_or_else(|| "frame encoder went missing".to_string())?;
    let pixels = read_back(&gpu, encoder, &shared.color_texture, width, height)?;

    let image = image::RgbaImage::from_raw(width, height, pixels)
        .ok_or_else(|| "readback produced a short pixel buffer".to_string())?;
    image
        .save(out_path)
        .map_err(|err| format!("failed to write {}: {err}", out_path.display()))?;

    println!("Wrote {} ({width}x{height})", out_path.display());
    println!(
        "Views drawn: {} (skipped {}, truncated {})",
        stats.drawn_nodes, stats.skipped_nodes, stats.truncated_nodes
    );
    println!(
        "Portal passes: {} pushed / {} popped, {} pooled targets",
        stats.pushes, stats.pops, stats.pooled_targets
    );
    if stats.contract_violations > 0 {
        eprintln!("contract violations: {}", stats.contract_violations);
    }

    Ok(())
}

/// Two linked portals: an entry ahead of the camera and an exit across the
/// map, yawed so the view through the entry looks down a different aisle.
fn demo_portals() -> (PortalSet, FxHashMap<PortalId, Vec2>) {
    let mut set = PortalSet::new();
    let half = Vec2::new(1.0, 1.2);

    let entry = set.insert(Portal::new(
        Mat4::from_translation(Vec3::new(0.0, 1.2, 0.0)),
        half,
    ));
    let exit = set.insert(Portal::new(
        Mat4::from_rotation_translation(
            Quat::from_rotation_y(135.0_f32.to_radians()),
            Vec3::new(8.0, 1.2, -6.0),
        ),
        half,
    ));
    set.link(entry, exit);

    let mut extents = FxHashMap::default();
    extents.insert(entry, half);
    extents.insert(exit, half);
    (set, extents)
}

// --- GPU frame state shared by the backend, target pool and painter seams ---

struct FrameShared {
    device: wgpu::Device,
    queue: wgpu::Queue,
    encoder: RefCell<Option<wgpu::CommandEncoder>>,
    color_texture: wgpu::Texture,
    color_view: wgpu::TextureView,
    depth_view: wgpu::TextureView,
    pool: RefCell<GpuTargetPool>,
    compositor: PortalCompositor,
    scene: DemoScene,
    pipelines: ScenePipelines,
    extents: FxHashMap<PortalId, Vec2>,
    main_cleared: Cell<bool>,
    /// Handles leased since their last clear. The first scene draw into one
    /// clears it instead of loading stale contents.
    fresh_targets: RefCell<Vec<TargetHandle>>,
}

impl FrameShared {
    fn new(gpu: &HeadlessGpu, width: u32, height: u32, extents: FxHashMap<PortalId, Vec2>) -> Self {
        let color_texture = gpu.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Frame Dump Color Texture"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: COLOR_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let color_view = color_texture.create_view(&wgpu::TextureViewDescriptor::default());

        let depth_texture = gpu.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Frame Dump Depth Texture"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: STENCIL_DEPTH_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });
        let depth_view = depth_texture.create_view(&wgpu::TextureViewDescriptor::default());

        Self {
            device: gpu.device.clone(),
            queue: gpu.queue.clone(),
            encoder: RefCell::new(None),
            color_texture,
            color_view,
            depth_view,
            pool: RefCell::new(GpuTargetPool::new(gpu.device.clone())),
            compositor: PortalCompositor::new(&gpu.device, COLOR_FORMAT),
            scene: DemoScene::new(&gpu.device),
            pipelines: ScenePipelines::new(&gpu.device),
            extents,
            main_cleared: Cell::new(false),
            fresh_targets: RefCell::new(Vec::new()),
        }
    }

    fn draw_scene(&self, state: &RenderState) {
        let params = self
            .pipelines
            .params_bind_group(&self.device, state.projection * state.view);

        let clear = match state.target {
            None => !self.main_cleared.replace(true),
            Some(handle) => {
                let mut fresh = self.fresh_targets.borrow_mut();
                match fresh.iter().position(|h| *h == handle) {
                    Some(index) => {
                        fresh.remove(index);
                        true
                    }
                    None => false,
                }
            }
        };

        let pool = self.pool.borrow();
        let mut encoder_ref = self.encoder.borrow_mut();
        let Some(encoder) = encoder_ref.as_mut() else {
            return;
        };
        let (color_view, depth_view, main) = match state.target {
            None => (&self.color_view, &self.depth_view, true),
            Some(handle) => match (pool.color_view(handle), pool.depth_view(handle)) {
                (Some(color), Some(depth)) => (color, depth, false),
                _ => return,
            },
        };

        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Scene Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: color_view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: if clear {
                        wgpu::LoadOp::Clear(SKY_COLOR)
                    } else {
                        wgpu::LoadOp::Load
                    },
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: depth_view,
                depth_ops: Some(wgpu::Operations {
                    load: if clear {
                        wgpu::LoadOp::Clear(1.0)
                    } else {
                        wgpu::LoadOp::Load
                    },
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: main.then_some(wgpu::Operations {
                    load: if clear {
                        wgpu::LoadOp::Clear(0)
                    } else {
                        wgpu::LoadOp::Load
                    },
                    store: wgpu::StoreOp::Store,
                }),
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        });

        if main {
            pass.set_pipeline(&self.pipelines.main);
            pass.set_stencil_reference(state.stencil_ref);
        } else {
            pass.set_pipeline(&self.pipelines.offscreen);
        }
        pass.set_bind_group(0, &params, &[]);
        self.scene.draw(&mut pass);
    }

    /// Stencil entry for one portal: raise the silhouette, open its depth.
    fn mask_surface(&self, ctx: &PaintContext) {
        let Some(params) = self.surface_params(ctx) else {
            return;
        };

        let mut encoder_ref = self.encoder.borrow_mut();
        let Some(encoder) = encoder_ref.as_mut() else {
            return;
        };
        let mut pass = self.begin_main_pass(encoder, "Portal Mask Pass");
        self.compositor
            .draw_mask_write(&mut pass, &params, ctx.state.stencil_ref, ctx.stencil_ref);
    }

    fn paint_surface(&self, ctx: &PaintContext) {
        let Some(params) = self.surface_params(ctx) else {
            return;
        };

        match ctx.source {
            // texture strategy: sample the child's pooled target onto the quad
            Some(handle) => {
                let pool = self.pool.borrow();
                let Some(view) = pool.color_view(handle) else {
                    return;
                };
                let source = self.compositor.source_bind_group(&self.device, view);

                let mut encoder_ref = self.encoder.borrow_mut();
                let Some(encoder) = encoder_ref.as_mut() else {
                    return;
                };
                let (color_view, depth_view, main) = match ctx.state.target {
                    None => (&self.color_view, &self.depth_view, true),
                    Some(parent) => match (pool.color_view(parent), pool.depth_view(parent)) {
                        (Some(color), Some(depth)) => (color, depth, false),
                        _ => return,
                    },
                };

                let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("Portal Surface Pass"),
                    color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                        view: color_view,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Load,
                            store: wgpu::StoreOp::Store,
                        },
                    })],
                    depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                        view: depth_view,
                        depth_ops: Some(wgpu::Operations {
                            load: wgpu::LoadOp::Load,
                            store: wgpu::StoreOp::Store,
                        }),
                        stencil_ops: main.then_some(wgpu::Operations {
                            load: wgpu::LoadOp::Load,
                            store: wgpu::StoreOp::Store,
                        }),
                    }),
                    timestamp_writes: None,
                    occlusion_query_set: None,
                });
                self.compositor.draw_surface(&mut pass, &params, &source, !main);
            }
            // stencil strategy: lower the mask and heal the surface depth
            None => {
                let mut encoder_ref = self.encoder.borrow_mut();
                let Some(encoder) = encoder_ref.as_mut() else {
                    return;
                };
                let mut pass = self.begin_main_pass(encoder, "Portal Restore Pass");
                self.compositor
                    .draw_mask_restore(&mut pass, &params, ctx.stencil_ref);
            }
        }
    }

    /// Quad parameters under the parent view, or `None` for a portal this
    /// frame never registered.
    fn surface_params(&self, ctx: &PaintContext) -> Option<wgpu::BindGroup> {
        let half = self.extents.get(&ctx.portal).copied()?;
        Some(self.compositor.params_bind_group(
            &self.device,
            &CompositeParams {
                view_proj: ctx.state.projection * ctx.state.view,
                model: PortalCompositor::surface_model(ctx.surface, half),
                uv_rect: FULL_UV_RECT,
            },
        ))
    }

    fn begin_main_pass<'e>(
        &self,
        encoder: &'e mut wgpu::CommandEncoder,
        label: &str,
    ) -> wgpu::RenderPass<'e> {
        encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some(label),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &self.color_view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Load,
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: &self.depth_view,
                depth_ops: Some(wgpu::Operations {
                    load: wgpu::LoadOp::Load,
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: Some(wgpu::Operations {
                    load: wgpu::LoadOp::Load,
                    store: wgpu::StoreOp::Store,
                }),
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        })
    }
}

struct GpuSceneBackend {
    shared: Rc<FrameShared>,
    next_token: u32,
}

impl SceneBackend for GpuSceneBackend {
    fn cull(&mut self, _request: &CullRequest) -> Result<CullToken, CullError> {
        let token = CullToken(self.next_token);
        self.next_token += 1;
        Ok(token)
    }

    fn prepare_shadows(&mut self, _state: &RenderState, _token: CullToken) -> bool {
        true
    }

    fn draw_scene(&mut self, state: &RenderState, _token: Option<CullToken>, _shadows: bool) {
        self.shared.draw_scene(state);
    }
}

struct SharedTargets {
    shared: Rc<FrameShared>,
}

impl RenderTargets for SharedTargets {
    fn request(&mut self, desc: &TargetDesc) -> TargetHandle {
        let handle = self.shared.pool.borrow_mut().request(desc);
        self.shared.fresh_targets.borrow_mut().push(handle);
        handle
    }

    fn release(&mut self, handle: TargetHandle) {
        self.shared.pool.borrow_mut().release(handle);
    }
}

struct PortalQuadPainter {
    shared: Rc<FrameShared>,
}

impl SurfacePainter for PortalQuadPainter {
    fn mask(&mut self, ctx: &PaintContext, _backend: &mut dyn SceneBackend) {
        self.shared.mask_surface(ctx);
    }

    fn paint(&mut self, ctx: &PaintContext, _backend: &mut dyn SceneBackend) {
        self.shared.paint_surface(ctx);
    }
}

// --- demo scene geometry and pipelines ---

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct SceneVertex {
    position: [f32; 3],
    color: [f32; 3],
}

impl SceneVertex {
    fn desc() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: mem::size_of::<SceneVertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &[
                wgpu::VertexAttribute {
                    offset: 0,
                    shader_location: 0,
                    format: wgpu::VertexFormat::Float32x3,
                },
                wgpu::VertexAttribute {
                    offset: mem::size_of::<[f32; 3]>() as wgpu::BufferAddress,
                    shader_location: 1,
                    format: wgpu::VertexFormat::Float32x3,
                },
            ],
        }
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct SceneUniform {
    view_proj: [[f32; 4]; 4],
}

struct ScenePipelines {
    main: wgpu::RenderPipeline,
    offscreen: wgpu::RenderPipeline,
    params_bind_group_layout: wgpu::BindGroupLayout,
}

impl ScenePipelines {
    fn new(device: &wgpu::Device) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Dump Scene Shader"),
            source: wgpu::ShaderSource::Wgsl(
                include_str!(concat!(
                    env!("CARGO_MANIFEST_DIR"),
                    "/../../assets/shaders/dump_scene.wgsl"
                ))
                .into(),
            ),
        });

        let params_bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Scene Params Bind Group Layout"),
                entries: &[wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                }],
            });
        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Scene Pipeline Layout"),
            bind_group_layouts: &[&params_bind_group_layout],
            push_constant_ranges: &[],
        });

        // scene fragments only land where the stencil equals the active
        // view's reference; pooled targets have no stencil to gate on
        let stencil_gate = wgpu::StencilFaceState {
            compare: wgpu::CompareFunction::Equal,
            fail_op: wgpu::StencilOperation::Keep,
            depth_fail_op: wgpu::StencilOperation::Keep,
            pass_op: wgpu::StencilOperation::Keep,
        };
        let pipeline = |label: &str, depth_format: wgpu::TextureFormat, stencil: wgpu::StencilState| {
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(label),
                layout: Some(&layout),
                vertex: wgpu::VertexState {
                    module: &shader,
                    entry_point: Some("vs_main"),
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    buffers: &[SceneVertex::desc()],
                },
                fragment: Some(wgpu::FragmentState {
                    module: &shader,
                    entry_point: Some("fs_main"),
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: COLOR_FORMAT,
                        blend: Some(wgpu::BlendState::REPLACE),
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    strip_index_format: None,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode: Some(wgpu::Face::Back),
                    unclipped_depth: false,
                    polygon_mode: wgpu::PolygonMode::Fill,
                    conservative: false,
                },
                depth_stencil: Some(wgpu::DepthStencilState {
                    format: depth_format,
                    depth_write_enabled: true,
                    depth_compare: wgpu::CompareFunction::LessEqual,
                    stencil,
                    bias: wgpu::DepthBiasState::default(),
                }),
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            })
        };

        let main = pipeline(
            "Scene Pipeline (Main)",
            STENCIL_DEPTH_FORMAT,
            wgpu::StencilState {
                front: stencil_gate,
                back: stencil_gate,
                read_mask: 0xFF,
                write_mask: 0,
            },
        );
        let offscreen = pipeline(
            "Scene Pipeline (Offscreen)",
            POOL_DEPTH_FORMAT,
            wgpu::StencilState::default(),
        );

        Self {
            main,
            offscreen,
            params_bind_group_layout,
        }
    }

    fn params_bind_group(&self, device: &wgpu::Device, view_proj: Mat4) -> wgpu::BindGroup {
        let uniform = SceneUniform {
            view_proj: view_proj.to_cols_array_2d(),
        };
        let buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Scene Params Buffer"),
            contents: bytemuck::bytes_of(&uniform),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Scene Params Bind Group"),
            layout: &self.params_bind_group_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: buffer.as_entire_binding(),
            }],
        })
    }
}

struct DemoScene {
    vertex_buffer: wgpu::Buffer,
    index_buffer: wgpu::Buffer,
    index_count: u32,
}

impl DemoScene {
    fn new(device: &wgpu::Device) -> Self {
        let (vertices, indices) = build_demo_geometry();
        let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Demo Scene Vertex Buffer"),
            contents: bytemuck::cast_slice(&vertices),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let index_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Demo Scene Index Buffer"),
            contents: bytemuck::cast_slice(&indices),
            usage: wgpu::BufferUsages::INDEX,
        });
        Self {
            vertex_buffer,
            index_buffer,
            index_count: indices.len() as u32,
        }
    }

    fn draw<'a>(&'a self, pass: &mut wgpu::RenderPass<'a>) {
        pass.set_vertex_buffer(0, self.vertex_buffer.slice(..));
        pass.set_index_buffer(self.index_buffer.slice(..), wgpu::IndexFormat::Uint16);
        pass.draw_indexed(0..self.index_count, 0, 0..1);
    }
}

/// A floor and a handful of boxes, with per-face shading baked into the
/// vertex colors. The red and blue boxes flank the exit so the view through
/// the entry reads unmistakably as the other side.
fn build_demo_geometry() -> (Vec<SceneVertex>, Vec<u16>) {
    let mut vertices = Vec::new();
    let mut indices = Vec::new();

    let floor = [
        Vec3::new(-20.0, 0.0, 20.0),
        Vec3::new(20.0, 0.0, 20.0),
        Vec3::new(20.0, 0.0, -20.0),
        Vec3::new(-20.0, 0.0, -20.0),
    ];
    push_quad(&mut vertices, &mut indices, floor, [0.45, 0.5, 0.4]);

    push_box(
        &mut vertices,
        &mut indices,
        Vec3::new(-2.0, 0.5, -2.0),
        Vec3::splat(0.5),
        [0.2, 0.7, 0.25],
    );
    push_box(
        &mut vertices,
        &mut indices,
        Vec3::new(6.5, 0.5, -8.0),
        Vec3::splat(0.5),
        [0.85, 0.2, 0.2],
    );
    push_box(
        &mut vertices,
        &mut indices,
        Vec3::new(10.0, 0.75, -5.0),
        Vec3::new(0.5, 0.75, 0.5),
        [0.2, 0.35, 0.85],
    );

    (vertices, indices)
}

fn push_quad(
    vertices: &mut Vec<SceneVertex>,
    indices: &mut Vec<u16>,
    corners: [Vec3; 4],
    color: [f32; 3],
) {
    let base = vertices.len() as u16;
    for corner in corners {
        vertices.push(SceneVertex {
            position: corner.to_array(),
            color,
        });
    }
    indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
}

fn push_box(
    vertices: &mut Vec<SceneVertex>,
    indices: &mut Vec<u16>,
    center: Vec3,
    half: Vec3,
    color: [f32; 3],
) {
    // (normal, brightness) per face, counter-clockwise seen from outside
    let faces: [(Vec3, f32); 6] = [
        (Vec3::Y, 1.0),
        (Vec3::NEG_Y, 0.4),
        (Vec3::Z, 0.8),
        (Vec3::NEG_Z, 0.7),
        (Vec3::X, 0.6),
        (Vec3::NEG_X, 0.55),
    ];

    for (normal, brightness) in faces {
        let up = if normal.y.abs() > 0.5 { Vec3::Z } else { Vec3::Y };
        let right = up.cross(normal).normalize();
        let up = normal.cross(right).normalize();
        let face_center = center + normal * (half * normal.abs()).length();
        let r = right * (half * right.abs()).length();
        let u = up * (half * up.abs()).length();

        let shaded = [
            color[0] * brightness,
            color[1] * brightness,
            color[2] * brightness,
        ];
        push_quad(
            vertices,
            indices,
            [
                face_center - r - u,
                face_center + r - u,
                face_center + r + u,
                face_center - r + u,
            ],
            shaded,
        );
    }
}

// --- readback ---

fn read_back(
    gpu: &HeadlessGpu,
    mut encoder: wgpu::CommandEncoder,
    texture: &wgpu::Texture,
    width: u32,
    height: u32,
) -> Result<Vec<u8>, String> {
    let unpadded_bytes_per_row = width * 4;
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    let padded_bytes_per_row = unpadded_bytes_per_row.div_ceil(align) * align;

    let staging = gpu.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("Frame Dump Staging Buffer"),
        size: (padded_bytes_per_row * height) as u64,
        usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        mapped_at_creation: false,
    });

    encoder.copy_texture_to_buffer(
        wgpu::TexelCopyTextureInfo {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        wgpu::TexelCopyBufferInfo {
            buffer: &staging,
            layout: wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(padded_bytes_per_row),
                rows_per_image: Some(height),
            },
        },
        wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
    );
    gpu.queue.submit(std::iter::once(encoder.finish()));

    let slice = staging.slice(..);
    let (sender, receiver) = mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = sender.send(result);
    });
    gpu.device
        .poll(wgpu::PollType::Wait)
        .map_err(|err| format!("device poll failed: {err}"))?;
    receiver
        .recv()
        .map_err(|err| format!("map callback never fired: {err}"))?
        .map_err(|err| format!("failed to map readback buffer: {err}"))?;

    let data = slice.get_mapped_range();
    let mut pixels = Vec::with_capacity((unpadded_bytes_per_row * height) as usize);
    for row in 0..height as usize {
        let start = row * padded_bytes_per_row as usize;
        pixels.extend_from_slice(&data[start..start + unpadded_bytes_per_row as usize]);
    }
    drop(data);
    staging.unmap();

    Ok(pixels)
}
