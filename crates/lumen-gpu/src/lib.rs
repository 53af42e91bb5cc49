//! Vulkan resource, pipeline and barrier layer for Lumen.
//!
//! This crate provides:
//! - Dedicated-memory buffer and image allocation via gpu-allocator
//! - Graphics pipeline building for dynamic rendering and multiview
//! - Descriptor set layouts, budgeted pools and validated writes
//! - Image layout tracking and synchronization2 barrier batches
//! - A command-recording seam with an in-memory log for inspection
//! - Frame-in-flight fences and command buffers

pub mod barrier;
pub mod capabilities;
pub mod command;
pub mod config;
pub mod context;
pub mod descriptors;
pub mod error;
pub mod memory;
pub mod pipeline;
pub mod shader;
pub mod sync;

pub use barrier::{
    BarrierBatch, BarrierSequencer, BarrierStep, ImageAccess, ImageId, ImageState,
    TransitionRequest,
};
pub use capabilities::{GpuCapabilities, GpuVendor};
pub use command::{
    AttachmentDesc, ClearValue, CommandLog, CommandSink, ImageCopyDesc, RecordedCommand,
    RenderingDesc, VulkanRecorder,
};
pub use config::GpuConfig;
pub use context::DeviceContext;
pub use descriptors::{
    BindingDesc, DescriptorKind, DescriptorPool, DescriptorSetInstance, DescriptorSetLayout,
    DescriptorSetLayoutBuilder, DescriptorWriter, PoolBudget, PoolCapacity,
};
pub use error::{GpuError, Result};
pub use memory::{
    AllocatorStats, BufferUsage, DeviceAllocator, DeviceBuffer, DeviceImage, ImageDesc,
    SamplerDesc,
};
pub use pipeline::{
    DepthStencilConfig, GraphicsPipeline, PipelineBuilder, PipelineLayout, VertexInputLayout,
};
pub use sync::{FrameRing, FrameSlots, FrameSync, FrameToken};
