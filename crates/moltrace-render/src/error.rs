use thiserror::Error;

#[derive(Debug, Error)]
pub enum GpuError {
    #[error("no suitable GPU adapter found")]
    NoAdapter,

    #[error("failed to create device: {0}")]
    Device(#[from] wgpu::RequestDeviceError),

    #[error("readback of '{label}' failed: {message}")]
    Readback { label: &'static str, message: String },

    #[error("{count} rays exceed the query capacity of {capacity}")]
    TooManyRays { count: usize, capacity: u32 },
}
