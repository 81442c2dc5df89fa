//! Batched closest-hit ray queries on the GPU.
//!
//! The kernel source is composed once at construction: a constants preamble
//! generated from the world configuration, followed by the static WGSL.

use moltrace_bvh::BvhBuilder;
use moltrace_core::constants::{ATOM_OCCUPIED_BIT, NO_ATOM, UNASSIGNED_SLOT, VOXEL_GROUP_SIZE};
use moltrace_core::grid::VoxelGrid;
use moltrace_core::ElementTable;

use moltrace_bvh::memory::SLOT_HEADER_WORDS;

use crate::error::GpuError;
use crate::gpu::{SlotLayout, StructureBuffers};
use crate::ray::{Ray, RayHit};

/// Threads per workgroup of the query kernel.
pub const QUERY_WORKGROUP_SIZE: u32 = 64;

/// GPU-uploadable ray. Must match Ray in ray_query.wgsl.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GpuRay {
    pub origin: [f32; 3],
    pub t_max: f32,
    pub direction: [f32; 3],
    pub _pad: u32,
}

impl GpuRay {
    pub fn new(ray: &Ray, t_max: f32) -> Self {
        Self {
            origin: ray.origin.to_array(),
            t_max,
            direction: ray.direction.to_array(),
            _pad: 0,
        }
    }
}

/// Query result. Must match Hit in ray_query.wgsl.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GpuHit {
    pub atom_id: u32,
    pub distance: f32,
}

impl GpuHit {
    pub fn to_hit(self) -> Option<RayHit> {
        (self.atom_id != NO_ATOM).then_some(RayHit {
            atom_id: self.atom_id,
            distance: self.distance,
        })
    }
}

/// Per-dispatch uniforms. Must match QueryParams in ray_query.wgsl.
/// Radii are indexed by element code, four per vector.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct QueryParams {
    pub ray_count: u32,
    pub _pad: [u32; 3],
    pub radii: [[f32; 4]; 64],
}

impl QueryParams {
    pub fn new(elements: &ElementTable) -> Self {
        let mut radii = [[0.0; 4]; 64];
        for (code, r) in elements.radii().into_iter().enumerate().take(256) {
            radii[code / 4][code % 4] = r;
        }
        Self {
            ray_count: 0,
            _pad: [0; 3],
            radii,
        }
    }
}

/// Compose the kernel source for one world configuration and its largest
/// atom radius.
pub fn shader_source(grid: &VoxelGrid, layout: SlotLayout, max_radius: f32) -> String {
    let world_min = grid.world_min();
    let fine_margin = (max_radius / grid.fine_width()).ceil() as i32;
    let constants_preamble = format!(
        "const GRID_DIMENSION: i32 = {};\n\
         const GROUP_DIMENSION: i32 = {};\n\
         const VOXEL_GROUP_SIZE: i32 = {};\n\
         const FINE_DIMENSION: i32 = {};\n\
         const FINE_MARGIN: i32 = {};\n\
         const COARSE_WIDTH: f32 = {:?};\n\
         const FINE_WIDTH: f32 = {:?};\n\
         const WORLD_MIN: vec3<f32> = vec3<f32>({:?}, {:?}, {:?});\n\
         const HEADER_WORDS: u32 = {}u;\n\
         const SLOT_HEADER_WORDS: u32 = {}u;\n\
         const LARGE_WORDS: u32 = {}u;\n\
         const SMALL_WORDS: u32 = {}u;\n\
         const NO_ATOM: u32 = {}u;\n\
         const UNASSIGNED_SLOT: u32 = {}u;\n\
         const OCCUPIED_BIT: u32 = {}u;\n\
         const TRAVERSAL_SLACK: f32 = {:?};\n\
         const WORKGROUP_SIZE: u32 = {}u;\n",
        grid.dimension(),
        grid.group_dimension(),
        VOXEL_GROUP_SIZE,
        grid.fine_dimension(),
        fine_margin,
        grid.coarse_width(),
        grid.fine_width(),
        world_min.x,
        world_min.y,
        world_min.z,
        layout.header_words,
        SLOT_HEADER_WORDS,
        layout.large_words,
        layout.small_words,
        NO_ATOM,
        UNASSIGNED_SLOT,
        ATOM_OCCUPIED_BIT,
        2.0 * max_radius,
        QUERY_WORKGROUP_SIZE,
    );
    let ray_query_wgsl = include_str!("../../../shaders/bvh/ray_query.wgsl");
    format!("{constants_preamble}\n{ray_query_wgsl}")
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Create the ray-query compute pipeline.
pub fn create_query_pipeline(
    device: &wgpu::Device,
    bind_group_layout: &wgpu::BindGroupLayout,
    shader_source: &str,
) -> wgpu::ComputePipeline {
    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("ray-query-shader"),
        source: wgpu::ShaderSource::Wgsl(shader_source.into()),
    });

    let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("ray-query-pipeline-layout"),
        bind_group_layouts: &[bind_group_layout],
        push_constant_ranges: &[],
    });

    device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some("ray-query-pipeline"),
        layout: Some(&layout),
        module: &module,
        entry_point: Some("main"),
        compilation_options: Default::default(),
        cache: None,
    })
}

/// Owns the query pipeline and its per-batch buffers. All buffers are
/// created at construction for `capacity` rays.
pub struct RayQueryKernel {
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    params_buffer: wgpu::Buffer,
    ray_buffer: wgpu::Buffer,
    hit_buffer: wgpu::Buffer,
    staging_buffer: wgpu::Buffer,
    params: QueryParams,
    capacity: u32,
}

impl RayQueryKernel {
    pub fn new(device: &wgpu::Device, builder: &BvhBuilder, capacity: u32) -> Self {
        let layout = SlotLayout::of(builder.memory());
        let source = shader_source(builder.grid(), layout, builder.elements().max_radius());

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("ray-query-bgl"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                storage_entry(1, true),
                storage_entry(2, false),
                storage_entry(3, true),
                storage_entry(4, true),
                storage_entry(5, true),
                storage_entry(6, true),
                storage_entry(7, true),
                storage_entry(8, true),
            ],
        });
        let pipeline = create_query_pipeline(device, &bind_group_layout, &source);

        let capacity = capacity.max(1);
        let ray_bytes = capacity as u64 * std::mem::size_of::<GpuRay>() as u64;
        let hit_bytes = capacity as u64 * std::mem::size_of::<GpuHit>() as u64;

        let params_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("ray-query-params"),
            size: std::mem::size_of::<QueryParams>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let ray_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("ray-query-rays"),
            size: ray_bytes,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let hit_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("ray-query-hits"),
            size: hit_bytes,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let staging_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("ray-query-staging"),
            size: hit_bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        log::info!("RayQueryKernel: capacity {} rays", capacity);

        Self {
            pipeline,
            bind_group_layout,
            params_buffer,
            ray_buffer,
            hit_buffer,
            staging_buffer,
            params: QueryParams::new(builder.elements()),
            capacity,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Trace a batch and block until the hits are read back.
    pub fn trace(
        &mut self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        structure: &StructureBuffers,
        rays: &[GpuRay],
    ) -> Result<Vec<GpuHit>, GpuError> {
        if rays.len() > self.capacity as usize {
            return Err(GpuError::TooManyRays {
                count: rays.len(),
                capacity: self.capacity,
            });
        }
        if rays.is_empty() {
            return Ok(Vec::new());
        }
        let count = rays.len() as u32;
        self.params.ray_count = count;
        queue.write_buffer(&self.params_buffer, 0, bytemuck::bytes_of(&self.params));
        queue.write_buffer(&self.ray_buffer, 0, bytemuck::cast_slice(rays));

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("ray-query-bind-group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.params_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: self.ray_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: self.hit_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: structure.assigned_slots().as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: structure.group_counts().as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 5,
                    resource: structure.headers().as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 6,
                    resource: structure.large_refs().as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 7,
                    resource: structure.small_refs().as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 8,
                    resource: structure.atoms().as_entire_binding(),
                },
            ],
        });

        let hit_bytes = count as u64 * std::mem::size_of::<GpuHit>() as u64;
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("ray-query-encoder"),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("ray-query-pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(count.div_ceil(QUERY_WORKGROUP_SIZE), 1, 1);
        }
        encoder.copy_buffer_to_buffer(&self.hit_buffer, 0, &self.staging_buffer, 0, hit_bytes);
        queue.submit(std::iter::once(encoder.finish()));

        let slice = self.staging_buffer.slice(..hit_bytes);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        device.poll(wgpu::Maintain::Wait);

        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(GpuError::Readback {
                    label: "ray-query-staging",
                    message: e.to_string(),
                })
            }
            Err(e) => {
                return Err(GpuError::Readback {
                    label: "ray-query-staging",
                    message: e.to_string(),
                })
            }
        }
        let data = slice.get_mapped_range();
        let hits: Vec<GpuHit> = bytemuck::cast_slice(&data).to_vec();
        drop(data);
        self.staging_buffer.unmap();
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use moltrace_core::WorldConfig;

    #[test]
    fn test_gpu_struct_sizes() {
        assert_eq!(std::mem::size_of::<GpuRay>(), 32);
        assert_eq!(std::mem::size_of::<GpuHit>(), 8);
        assert_eq!(std::mem::size_of::<QueryParams>(), 16 + 64 * 16);
    }

    #[test]
    fn test_params_radii_by_element() {
        let elements = ElementTable::default();
        let params = QueryParams::new(&elements);
        let carbon = moltrace_core::element::CARBON as usize;
        assert_eq!(params.radii[carbon / 4][carbon % 4], elements.radius(carbon as u8));
        assert!(params.radii.iter().flatten().all(|&r| r > 0.0));
    }

    #[test]
    fn test_no_atom_is_a_miss() {
        let miss = GpuHit {
            atom_id: NO_ATOM,
            distance: 0.0,
        };
        assert_eq!(miss.to_hit(), None);
        let hit = GpuHit {
            atom_id: 4,
            distance: 1.5,
        };
        assert_eq!(hit.to_hit().map(|h| h.atom_id), Some(4));
    }

    #[test]
    fn test_shader_source_preamble() {
        let config = WorldConfig {
            world_dimension: 32.0,
            memory_slot_count: 4,
            ..WorldConfig::default()
        };
        let builder = BvhBuilder::new(config, ElementTable::default()).unwrap();
        let layout = SlotLayout::of(builder.memory());
        let source = shader_source(builder.grid(), layout, builder.elements().max_radius());
        assert!(source.contains("const GRID_DIMENSION: i32 = 16;"));
        assert!(source.contains("const FINE_WIDTH: f32 = 0.25;"));
        assert!(source.contains("const WORLD_MIN: vec3<f32> = vec3<f32>(-16.0, -16.0, -16.0);"));
        assert!(source.contains("const SMALL_WORDS: u32 = 10240u;"));
        // Potassium reaches two fine cells past its voxel.
        assert!(source.contains("const FINE_MARGIN: i32 = 2;"));
        assert!(source.contains("const OCCUPIED_BIT: u32 = 2147483648u;"));
        assert!(source.contains("fn main("));
    }

    #[cfg(feature = "gpu_tests")]
    mod gpu {
        use super::*;
        use crate::ray::cast_ray;
        use glam::Vec3;
        use moltrace_core::element::CARBON;
        use moltrace_core::types::{Atom, Transaction};

        fn device() -> Option<(wgpu::Device, wgpu::Queue)> {
            let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
            let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            }))?;
            pollster::block_on(adapter.request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("query-test-device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            ))
            .ok()
        }

        #[test]
        fn test_gpu_matches_cpu_queries() {
            let Some((device, queue)) = device() else {
                return;
            };
            let config = WorldConfig {
                world_dimension: 32.0,
                memory_slot_count: 16,
                atom_capacity: 256,
                ..WorldConfig::default()
            };
            let mut builder = BvhBuilder::new(config, ElementTable::default()).unwrap();
            let structure = StructureBuffers::new(&device, &builder);
            structure.upload_all(&queue, &builder);

            let mut tx = Transaction::default();
            tx.add(0, Atom::new(Vec3::ZERO, CARBON));
            tx.add(1, Atom::new(Vec3::new(5.0, 1.0, 1.0), CARBON));
            tx.add(2, Atom::new(Vec3::new(1.95, 9.0, 1.0), CARBON));
            let report = builder.update(&tx).unwrap();
            structure.upload_frame(&queue, &builder, &tx, &report);

            let rays = [
                Ray::new(Vec3::new(-5.0, 0.01, 0.01), Vec3::X),
                Ray::new(Vec3::new(9.0, 1.0, 1.0), -Vec3::X),
                Ray::new(Vec3::new(-5.0, 3.0, 0.0), Vec3::X),
                // Crosses only the part of atom 2 outside its voxel.
                Ray::new(Vec3::new(2.05, 5.0, 1.0), Vec3::Y),
            ];
            let gpu_rays: Vec<GpuRay> = rays.iter().map(|r| GpuRay::new(r, 100.0)).collect();
            let mut kernel = RayQueryKernel::new(&device, &builder, 64);
            let hits = kernel.trace(&device, &queue, &structure, &gpu_rays).unwrap();

            let view = builder.view();
            for (ray, hit) in rays.iter().zip(&hits) {
                let expected = cast_ray(&view, ray, 100.0);
                assert_eq!(hit.to_hit().map(|h| h.atom_id), expected.map(|h| h.atom_id));
            }
            assert_eq!(hits[0].atom_id, 0);
            assert_eq!(hits[1].atom_id, 1);
            assert_eq!(hits[2].atom_id, NO_ATOM);
            assert_eq!(hits[3].atom_id, 2);
        }
    }
}
