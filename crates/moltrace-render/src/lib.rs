pub mod dda;
pub mod error;
pub mod gpu;
pub mod query;
pub mod ray;

pub use dda::{ray_box, CellSpan, GridWalk};
pub use error::GpuError;
pub use gpu::StructureBuffers;
pub use query::{GpuHit, GpuRay, QueryParams, RayQueryKernel};
pub use ray::{cast_ray, cast_ray_with_stats, intersect_sphere, Ray, RayHit, TraversalStats};
