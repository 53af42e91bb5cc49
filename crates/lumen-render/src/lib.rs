//! Frame orchestration and concrete render passes for Lumen.
//!
//! `record_pass` turns a [`PassRecipe`] into barriers, copies and draws in a
//! fixed order. The forward and cubemap passes build their recipes on top.

pub mod cubemap;
pub mod forward;
pub mod mesh;
pub mod pass;
pub mod uniforms;

pub use cubemap::{CubemapFormatPass, CubemapPassDesc, CubemapSource};
pub use forward::{ForwardPass, ForwardPassDesc, MeshBuffers};
pub use mesh::MeshData;
pub use pass::{
    record_pass, AttachmentOp, DrawOp, ImageCopyOp, IndexBinding, PassPipeline, PassRecipe,
    PassReport, RenderRegion, TargetView, VertexBinding,
};
pub use uniforms::{ExtentUniforms, LightUniforms, MvpUniforms};
