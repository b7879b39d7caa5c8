use std::mem;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3};
use wgpu::util::DeviceExt;

use crate::pool::POOL_DEPTH_FORMAT;

/// The main target carries stencil for the masking strategy; pooled targets
/// do not.
pub const STENCIL_DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth24PlusStencil8;

/// Pushes the quad slightly off the portal plane so it never z-fights the
/// wall it sits on.
const SURFACE_OFFSET: f32 = 0.01;

pub const FULL_UV_RECT: [f32; 4] = [0.0, 0.0, 1.0, 1.0];

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct CompositeVertex {
    position: [f32; 3],
    uv: [f32; 2],
}

impl CompositeVertex {
    fn desc() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: mem::size_of::<CompositeVertex>() as wgpu::BufferAddress,
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
                    format: wgpu::VertexFormat::Float32x2,
                },
            ],
        }
    }
}

/// One quad draw's worth of parameters.
#[derive(Debug, Clone, Copy)]
pub struct CompositeParams {
    pub view_proj: Mat4,
    pub model: Mat4,
    /// Offset and extent of the sampled region, in texture uv space.
    pub uv_rect: [f32; 4],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct CompositeUniform {
    view_proj: [[f32; 4]; 4],
    model: [[f32; 4]; 4],
    uv_rect: [f32; 4],
}

impl From<&CompositeParams> for CompositeUniform {
    fn from(params: &CompositeParams) -> Self {
        Self {
            view_proj: params.view_proj.to_cols_array_2d(),
            model: params.model.to_cols_array_2d(),
            uv_rect: params.uv_rect,
        }
    }
}

/// Draws portal surfaces. Under the texture strategy the surface pipelines
/// sample a pooled color target onto the quad; under the stencil strategy
/// the mask pipelines carve the quad's silhouette into the main target's
/// stencil on push and heal depth and stencil back on pop.
pub struct PortalCompositor {
    surface_main_pipeline: wgpu::RenderPipeline,
    surface_offscreen_pipeline: wgpu::RenderPipeline,
    mask_write_pipeline: wgpu::RenderPipeline,
    depth_reset_pipeline: wgpu::RenderPipeline,
    mask_restore_pipeline: wgpu::RenderPipeline,
    params_bind_group_layout: wgpu::BindGroupLayout,
    texture_bind_group_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    vertex_buffer: wgpu::Buffer,
    index_buffer: wgpu::Buffer,
    index_count: u32,
}

impl PortalCompositor {
    pub fn new(device: &wgpu::Device, color_format: wgpu::TextureFormat) -> Self {
        let composite_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Portal Composite Shader"),
            source: wgpu::ShaderSource::Wgsl(
                include_str!(concat!(
                    env!("CARGO_MANIFEST_DIR"),
                    "/../../assets/shaders/portal_composite.wgsl"
                ))
                .into(),
            ),
        });
        let mask_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Portal Mask Shader"),
            source: wgpu::ShaderSource::Wgsl(
                include_str!(concat!(
                    env!("CARGO_MANIFEST_DIR"),
                    "/../../assets/shaders/portal_mask.wgsl"
                ))
                .into(),
            ),
        });

        let params_bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Composite Params Bind Group Layout"),
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

        let texture_bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Composite Texture Bind Group Layout"),
                entries: &[
                    wgpu::BindGroupLayoutEntry {
                        binding: 0,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Texture {
                            multisampled: false,
                            view_dimension: wgpu::TextureViewDimension::D2,
                            sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 1,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                        count: None,
                    },
                ],
            });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Composite Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let surface_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Composite Surface Pipeline Layout"),
            bind_group_layouts: &[&params_bind_group_layout, &texture_bind_group_layout],
            push_constant_ranges: &[],
        });
        let mask_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Composite Mask Pipeline Layout"),
            bind_group_layouts: &[&params_bind_group_layout],
            push_constant_ranges: &[],
        });

        let surface_pipeline = |label: &str, depth_format: wgpu::TextureFormat| {
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(label),
                layout: Some(&surface_layout),
                vertex: wgpu::VertexState {
                    module: &composite_shader,
                    entry_point: Some("vs_main"),
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    buffers: &[CompositeVertex::desc()],
                },
                fragment: Some(wgpu::FragmentState {
                    module: &composite_shader,
                    entry_point: Some("fs_main"),
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: color_format,
                        blend: Some(wgpu::BlendState::ALPHA_BLENDING),
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    strip_index_format: None,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode: None,
                    unclipped_depth: false,
                    polygon_mode: wgpu::PolygonMode::Fill,
                    conservative: false,
                },
                depth_stencil: Some(wgpu::DepthStencilState {
                    format: depth_format,
                    depth_write_enabled: false,
                    depth_compare: wgpu::CompareFunction::LessEqual,
                    stencil: wgpu::StencilState::default(),
                    bias: wgpu::DepthBiasState::default(),
                }),
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            })
        };

        let surface_main_pipeline =
            surface_pipeline("Composite Surface Pipeline (Main)", STENCIL_DEPTH_FORMAT);
        let surface_offscreen_pipeline =
            surface_pipeline("Composite Surface Pipeline (Offscreen)", POOL_DEPTH_FORMAT);

        let mask_pipeline = |label: &str,
                             fs_entry: &str,
                             stencil_pass_op: wgpu::StencilOperation,
                             depth_compare: wgpu::CompareFunction,
                             depth_write: bool| {
            let face = wgpu::StencilFaceState {
                compare: wgpu::CompareFunction::Equal,
                fail_op: wgpu::StencilOperation::Keep,
                depth_fail_op: wgpu::StencilOperation::Keep,
                pass_op: stencil_pass_op,
            };
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(label),
                layout: Some(&mask_layout),
                vertex: wgpu::VertexState {
                    module: &mask_shader,
                    entry_point: Some("vs_main"),
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    buffers: &[CompositeVertex::desc()],
                },
                fragment: Some(wgpu::FragmentState {
                    module: &mask_shader,
                    entry_point: Some(fs_entry),
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: color_format,
                        blend: None,
                        write_mask: wgpu::ColorWrites::empty(),
                    })],
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    strip_index_format: None,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode: None,
                    unclipped_depth: false,
                    polygon_mode: wgpu::PolygonMode::Fill,
                    conservative: false,
                },
                depth_stencil: Some(wgpu::DepthStencilState {
                    format: STENCIL_DEPTH_FORMAT,
                    depth_write_enabled: depth_write,
                    depth_compare,
                    stencil: wgpu::StencilState {
                        front: face,
                        back: face,
                        read_mask: 0xFF,
                        write_mask: 0xFF,
                    },
                    bias: wgpu::DepthBiasState::default(),
                }),
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            })
        };

        // Entry: raise the silhouette where the quad survives the parent's
        // depth, then push the silhouette's depth to the far plane so the
        // child view draws through it.
        let mask_write_pipeline = mask_pipeline(
            "Composite Mask Write Pipeline",
            "fs_main",
            wgpu::StencilOperation::IncrementClamp,
            wgpu::CompareFunction::LessEqual,
            false,
        );
        let depth_reset_pipeline = mask_pipeline(
            "Composite Depth Reset Pipeline",
            "fs_far",
            wgpu::StencilOperation::Keep,
            wgpu::CompareFunction::Always,
            true,
        );
        // Exit: lower the silhouette back and rewrite the quad's own depth
        // over it so the parent view occludes correctly behind the portal.
        let mask_restore_pipeline = mask_pipeline(
            "Composite Mask Restore Pipeline",
            "fs_main",
            wgpu::StencilOperation::DecrementClamp,
            wgpu::CompareFunction::Always,
            true,
        );

        let vertices = [
            CompositeVertex {
                position: [-1.0, -1.0, 0.0],
                uv: [0.0, 1.0],
            },
            CompositeVertex {
                position: [1.0, -1.0, 0.0],
                uv: [1.0, 1.0],
            },
            CompositeVertex {
                position: [1.0, 1.0, 0.0],
                uv: [1.0, 0.0],
            },
            CompositeVertex {
                position: [-1.0, 1.0, 0.0],
                uv: [0.0, 0.0],
            },
        ];
        let indices: [u16; 6] = [0, 1, 2, 0, 2, 3];
        let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Composite Quad Vertex Buffer"),
            contents: bytemuck::cast_slice(&vertices),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let index_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Composite Quad Index Buffer"),
            contents: bytemuck::cast_slice(&indices),
            usage: wgpu::BufferUsages::INDEX,
        });

        Self {
            surface_main_pipeline,
            surface_offscreen_pipeline,
            mask_write_pipeline,
            depth_reset_pipeline,
            mask_restore_pipeline,
            params_bind_group_layout,
            texture_bind_group_layout,
            sampler,
            vertex_buffer,
            index_buffer,
            index_count: indices.len() as u32,
        }
    }

    /// Local-to-world of the unit quad placed over a portal surface.
    pub fn surface_model(pose: Mat4, half_extents: Vec2) -> Mat4 {
        pose * Mat4::from_translation(Vec3::Z * SURFACE_OFFSET)
            * Mat4::from_scale(Vec3::new(
                half_extents.x.max(0.001),
                half_extents.y.max(0.001),
                1.0,
            ))
    }

    /// Uploads one draw's parameters. A fresh buffer per draw keeps every
    /// quad in a multi-pass encoder on its own data.
    pub fn params_bind_group(
        &self,
        device: &wgpu::Device,
        params: &CompositeParams,
    ) -> wgpu::BindGroup {
        let uniform = CompositeUniform::from(params);
        let buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Composite Params Buffer"),
            contents: bytemuck::bytes_of(&uniform),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Composite Params Bind Group"),
            layout: &self.params_bind_group_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: buffer.as_entire_binding(),
            }],
        })
    }

    pub fn source_bind_group(
        &self,
        device: &wgpu::Device,
        view: &wgpu::TextureView,
    ) -> wgpu::BindGroup {
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Composite Source Bind Group"),
            layout: &self.texture_bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
            ],
        })
    }

    pub fn draw_surface<'a>(
        &'a self,
        render_pass: &mut wgpu::RenderPass<'a>,
        params: &'a wgpu::BindGroup,
        source: &'a wgpu::BindGroup,
        offscreen: bool,
    ) {
        let pipeline = if offscreen {
            &self.surface_offscreen_pipeline
        } else {
            &self.surface_main_pipeline
        };
        render_pass.set_pipeline(pipeline);
        render_pass.set_bind_group(0, params, &[]);
        render_pass.set_bind_group(1, source, &[]);
        self.draw_quad(render_pass);
    }

    /// Stencil entry. Raises `parent_ref` pixels under the quad to the
    /// child's reference and opens depth behind them.
    pub fn draw_mask_write<'a>(
        &'a self,
        render_pass: &mut wgpu::RenderPass<'a>,
        params: &'a wgpu::BindGroup,
        parent_ref: u32,
        child_ref: u32,
    ) {
        render_pass.set_stencil_reference(parent_ref);
        render_pass.set_pipeline(&self.mask_write_pipeline);
        render_pass.set_bind_group(0, params, &[]);
        self.draw_quad(render_pass);

        render_pass.set_stencil_reference(child_ref);
        render_pass.set_pipeline(&self.depth_reset_pipeline);
        render_pass.set_bind_group(0, params, &[]);
        self.draw_quad(render_pass);
    }

    /// Stencil exit. Lowers `child_ref` pixels back to the parent and
    /// rewrites the portal surface's depth over the child's scene.
    pub fn draw_mask_restore<'a>(
        &'a self,
        render_pass: &mut wgpu::RenderPass<'a>,
        params: &'a wgpu::BindGroup,
        child_ref: u32,
    ) {
        render_pass.set_stencil_reference(child_ref);
        render_pass.set_pipeline(&self.mask_restore_pipeline);
        render_pass.set_bind_group(0, params, &[]);
        self.draw_quad(render_pass);
    }

    fn draw_quad<'a>(&'a self, render_pass: &mut wgpu::RenderPass<'a>) {
        render_pass.set_vertex_buffer(0, self.vertex_buffer.slice(..));
        render_pass.set_index_buffer(self.index_buffer.slice(..), wgpu::IndexFormat::Uint16);
        render_pass.draw_indexed(0..self.index_count, 0, 0..1);
    }
}
