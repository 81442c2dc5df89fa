use std::time::Instant;

use glam::Vec3;

use moltrace_bvh::{BvhBuilder, FrameReport, PassTimings};
use moltrace_core::{ElementTable, WorldConfig};
use moltrace_render::{cast_ray, GpuError, GpuRay, Ray, RayQueryKernel, StructureBuffers};

use crate::scenes::{SceneConfig, SceneDriver};

/// Query rays per frame edge. Rays form an orthographic grid looking down +z.
const QUERY_GRID: u32 = 64;

/// Timing data for a single benchmark run.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TimingSeries {
    pub mean_ms: f64,
    pub median_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

/// Mean time spent in each build pass.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct PassBreakdown {
    pub upload_ms: f64,
    pub remove_ms: f64,
    pub insert_ms: f64,
    pub schedule_ms: f64,
    pub size_ms: f64,
    pub allocate_ms: f64,
    pub scatter_ms: f64,
}

impl PassBreakdown {
    fn accumulate(&mut self, t: &PassTimings) {
        self.upload_ms += t.upload_ms;
        self.remove_ms += t.remove_ms;
        self.insert_ms += t.insert_ms;
        self.schedule_ms += t.schedule_ms;
        self.size_ms += t.size_ms;
        self.allocate_ms += t.allocate_ms;
        self.scatter_ms += t.scatter_ms;
    }

    fn scaled(mut self, factor: f64) -> Self {
        self.upload_ms *= factor;
        self.remove_ms *= factor;
        self.insert_ms *= factor;
        self.schedule_ms *= factor;
        self.size_ms *= factor;
        self.allocate_ms *= factor;
        self.scatter_ms *= factor;
        self
    }
}

/// Result of a single scene benchmark.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BenchmarkResult {
    pub scene_name: String,
    pub atom_count: u32,
    pub assigned_slots: u32,
    pub frame_count: u32,
    /// Frames that ended in a crash and were recovered with a full rebuild.
    pub crash_frames: u32,
    /// Incremental structure updates, excluding the initial build.
    pub timings: TimingSeries,
    pub passes: PassBreakdown,
    /// CPU closest-hit queries for the whole ray grid.
    pub cpu_query: TimingSeries,
    /// Upload plus GPU closest-hit queries, when a device was available.
    pub gpu_query: Option<TimingSeries>,
    pub cpu_hits: u32,
}

/// Device and queue used for GPU query timing.
pub struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
}

impl GpuContext {
    /// Initialize wgpu natively. Blocks on async adapter request.
    pub fn new() -> Result<Self, GpuError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or(GpuError::NoAdapter)?;

        log::info!("Benchmark adapter: {}", adapter.get_info().name);

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("bench-device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))?;

        Ok(Self { device, queue })
    }
}

/// Per-run GPU state: the structure mirror and the query kernel.
struct GpuQuery<'a> {
    context: &'a GpuContext,
    structure: StructureBuffers,
    kernel: RayQueryKernel,
    rays: Vec<GpuRay>,
}

/// Runs structure-update benchmarks on the host, with optional GPU queries.
pub struct BenchmarkRunner {
    config: WorldConfig,
    frame_count: u32,
    gpu: Option<GpuContext>,
}

impl BenchmarkRunner {
    pub fn new(config: WorldConfig, frame_count: u32, gpu: Option<GpuContext>) -> Self {
        Self {
            config,
            frame_count,
            gpu,
        }
    }

    /// Run a single benchmark scene and return timing results.
    pub fn run_scene(
        &self,
        scene: &SceneConfig,
    ) -> Result<BenchmarkResult, Box<dyn std::error::Error>> {
        log::info!(
            "Running scene '{}' ({} atoms, {} frames)...",
            scene.name,
            scene.atom_count(),
            self.frame_count
        );

        let mut builder = BvhBuilder::new(self.config.clone(), ElementTable::default())?;
        let mut driver = SceneDriver::new(scene, self.config.atom_capacity);

        let initial = driver.transaction();
        let report = builder.update(&initial)?;
        let mut crash_frames = 0;
        if recover(&mut builder, &report) {
            crash_frames += 1;
        }
        let stats = builder.stats();
        log::info!(
            "  Initial build: {:.2}ms, {} slots, {} fine references",
            report.timings.total_ms,
            stats.assigned_slots,
            stats.total_fine_references
        );

        let rays = query_rays(driver.half_extent());
        let mut gpu = match &self.gpu {
            Some(context) => {
                let structure = StructureBuffers::new(&context.device, &builder);
                structure.upload_all(&context.queue, &builder);
                let kernel = RayQueryKernel::new(&context.device, &builder, rays.len() as u32);
                Some(GpuQuery {
                    context,
                    structure,
                    kernel,
                    rays: rays.iter().map(|r| GpuRay::new(r, f32::INFINITY)).collect(),
                })
            }
            None => None,
        };

        let frames = self.frame_count as usize;
        let mut frame_times = Vec::with_capacity(frames);
        let mut cpu_times = Vec::with_capacity(frames);
        let mut gpu_times = Vec::with_capacity(frames);
        let mut passes = PassBreakdown::default();
        let mut cpu_hits = 0;

        for frame in 1..=self.frame_count {
            driver.advance(frame);
            let tx = driver.transaction();
            let report = builder.update(&tx)?;
            frame_times.push(report.timings.total_ms);
            passes.accumulate(&report.timings);
            let rebuilt = recover(&mut builder, &report);
            if rebuilt {
                crash_frames += 1;
            }

            let start = Instant::now();
            let view = builder.view();
            cpu_hits = rays
                .iter()
                .filter(|r| cast_ray(&view, r, f32::INFINITY).is_some())
                .count() as u32;
            cpu_times.push(start.elapsed().as_secs_f64() * 1000.0);

            if let Some(q) = gpu.as_mut() {
                let start = Instant::now();
                if rebuilt {
                    q.structure.upload_all(&q.context.queue, &builder);
                } else {
                    q.structure.upload_frame(&q.context.queue, &builder, &tx, &report);
                }
                q.kernel
                    .trace(&q.context.device, &q.context.queue, &q.structure, &q.rays)?;
                gpu_times.push(start.elapsed().as_secs_f64() * 1000.0);
            }
        }

        let timings = compute_timings(&frame_times);
        log::info!(
            "  Done: mean={:.2}ms, p95={:.2}ms, p99={:.2}ms, {} crash frames",
            timings.mean_ms,
            timings.p95_ms,
            timings.p99_ms,
            crash_frames
        );

        Ok(BenchmarkResult {
            scene_name: scene.name.to_string(),
            atom_count: driver.store().len(),
            assigned_slots: builder.stats().assigned_slots,
            frame_count: self.frame_count,
            crash_frames,
            timings,
            passes: passes.scaled(1.0 / self.frame_count.max(1) as f64),
            cpu_query: compute_timings(&cpu_times),
            gpu_query: (!gpu_times.is_empty()).then(|| compute_timings(&gpu_times)),
            cpu_hits,
        })
    }
}

/// Log a crashed frame and rebuild. Returns whether a rebuild happened.
fn recover(builder: &mut BvhBuilder, report: &FrameReport) -> bool {
    let Some(crash) = report.crash else {
        return false;
    };
    log::warn!(
        "  Frame {} crashed: {}",
        report.frame_id,
        crash.describe(builder.config())
    );
    builder.clear_crash_record();
    builder.rebuild_from_scratch();
    true
}

/// Orthographic grid of rays over the scene's xy footprint, looking down +z.
fn query_rays(half_extent: f32) -> Vec<Ray> {
    let span = 2.0 * half_extent;
    let step = span / QUERY_GRID as f32;
    let mut rays = Vec::with_capacity((QUERY_GRID * QUERY_GRID) as usize);
    for j in 0..QUERY_GRID {
        for i in 0..QUERY_GRID {
            let origin = Vec3::new(
                -half_extent + (i as f32 + 0.5) * step,
                -half_extent + (j as f32 + 0.5) * step,
                -half_extent - 1.0,
            );
            rays.push(Ray::new(origin, Vec3::Z));
        }
    }
    rays
}

pub fn compute_timings(times: &[f64]) -> TimingSeries {
    if times.is_empty() {
        return TimingSeries {
            mean_ms: 0.0,
            median_ms: 0.0,
            p95_ms: 0.0,
            p99_ms: 0.0,
            min_ms: 0.0,
            max_ms: 0.0,
        };
    }

    let mut sorted = times.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let n = sorted.len();
    let mean = sorted.iter().sum::<f64>() / n as f64;
    let median = if n % 2 == 0 {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    } else {
        sorted[n / 2]
    };
    let p95 = sorted[((n as f64 * 0.95) as usize).min(n - 1)];
    let p99 = sorted[((n as f64 * 0.99) as usize).min(n - 1)];

    TimingSeries {
        mean_ms: mean,
        median_ms: median,
        p95_ms: p95,
        p99_ms: p99,
        min_ms: sorted[0],
        max_ms: sorted[n - 1],
    }
}
