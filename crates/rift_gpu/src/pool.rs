use tracing::debug;

use rift_render::backend::{RenderTargets, TargetDesc, TargetFormat, TargetHandle};

/// Pooled offscreen targets carry their own depth, separate from the main
/// target's depth-stencil.
pub const POOL_DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

pub fn color_format_of(format: TargetFormat) -> wgpu::TextureFormat {
    match format {
        TargetFormat::Rgba8 => wgpu::TextureFormat::Rgba8Unorm,
        TargetFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub created: u32,
    pub reused: u32,
    pub live: u32,
    pub peak: u32,
}

struct PoolSlot {
    desc: TargetDesc,
    _color: wgpu::Texture,
    color_view: wgpu::TextureView,
    _depth: wgpu::Texture,
    depth_view: wgpu::TextureView,
    leased: bool,
}

/// Offscreen target pool backing the texture strategy. Released targets are
/// kept around and handed back to the next request with the same
/// description, so a steady frame allocates nothing after warm-up.
pub struct GpuTargetPool {
    device: wgpu::Device,
    slots: Vec<Option<PoolSlot>>,
    stats: PoolStats,
}

impl GpuTargetPool {
    pub fn new(device: wgpu::Device) -> Self {
        Self {
            device,
            slots: Vec::new(),
            stats: PoolStats::default(),
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    pub fn color_view(&self, handle: TargetHandle) -> Option<&wgpu::TextureView> {
        self.slot(handle).map(|slot| &slot.color_view)
    }

    pub fn depth_view(&self, handle: TargetHandle) -> Option<&wgpu::TextureView> {
        self.slot(handle).map(|slot| &slot.depth_view)
    }

    pub fn desc(&self, handle: TargetHandle) -> Option<TargetDesc> {
        self.slot(handle).map(|slot| slot.desc)
    }

    /// Drops every target that is not currently leased. Call on resize or
    /// when the portal set shrinks for good.
    pub fn trim(&mut self) {
        for slot in &mut self.slots {
            if slot.as_ref().is_some_and(|s| !s.leased) {
                *slot = None;
            }
        }
    }

    fn slot(&self, handle: TargetHandle) -> Option<&PoolSlot> {
        self.slots.get(handle.0 as usize).and_then(|s| s.as_ref())
    }

    fn create_slot(&self, desc: &TargetDesc) -> PoolSlot {
        let size = wgpu::Extent3d {
            width: desc.width.max(1),
            height: desc.height.max(1),
            depth_or_array_layers: desc.layers.max(1),
        };

        let color = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Portal Pool Color Texture"),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: color_format_of(desc.format),
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let color_view = color.create_view(&wgpu::TextureViewDescriptor::default());

        let depth = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Portal Pool Depth Texture"),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: POOL_DEPTH_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });
        let depth_view = depth.create_view(&wgpu::TextureViewDescriptor::default());

        PoolSlot {
            desc: *desc,
            _color: color,
            color_view,
            _depth: depth,
            depth_view,
            leased: true,
        }
    }
}

impl RenderTargets for GpuTargetPool {
    fn request(&mut self, desc: &TargetDesc) -> TargetHandle {
        self.stats.live += 1;
        self.stats.peak = self.stats.peak.max(self.stats.live);

        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(existing) = slot {
                if !existing.leased && existing.desc == *desc {
                    existing.leased = true;
                    self.stats.reused += 1;
                    return TargetHandle(index as u32);
                }
            }
        }

        self.stats.created += 1;
        debug!(
            "Creating pooled target {}x{} ({:?})",
            desc.width, desc.height, desc.format
        );
        let slot = self.create_slot(desc);
        let index = match self.slots.iter().position(|s| s.is_none()) {
            Some(index) => {
                self.slots[index] = Some(slot);
                index
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        TargetHandle(index as u32)
    }

    fn release(&mut self, handle: TargetHandle) {
        if let Some(slot) = self.slots.get_mut(handle.0 as usize).and_then(|s| s.as_mut()) {
            slot.leased = false;
            self.stats.live = self.stats.live.saturating_sub(1);
        }
    }
}
