pub mod allocator;
pub mod atoms;
pub mod builder;
pub mod compute;
pub mod crash;
pub mod memory;
pub mod passes;
pub mod ring;
pub mod scheduler;
pub mod view;

pub use builder::{BvhBuilder, FrameReport, PassTimings, StructureStats};
pub use crash::{CrashBuffer, CrashRecord};
pub use memory::{FineRange, SlotHeader};
pub use view::{SlotContents, StructureView};
