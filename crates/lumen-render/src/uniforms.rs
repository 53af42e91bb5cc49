//! Uniform buffer layouts.
//!
//! Matrices are column-major `glam::Mat4` uploaded as-is, which matches the
//! default `column_major` packing of GLSL and HLSL uniform blocks. Vertices
//! are transformed as `view_proj * model * position`.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

/// Per-frame transform block (binding 0, vertex stage).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct MvpUniforms {
    pub view_proj: Mat4,
    pub model: Mat4,
}

impl MvpUniforms {
    /// Where the sphere sits unless the host moves it.
    pub const DEFAULT_MODEL_OFFSET: Vec3 = Vec3::new(6.0, 0.0, 0.0);

    pub fn new(view_proj: Mat4, model: Mat4) -> Self {
        Self { view_proj, model }
    }

    /// Default model placement with the given camera.
    pub fn with_default_model(view_proj: Mat4) -> Self {
        Self::new(view_proj, Mat4::from_translation(Self::DEFAULT_MODEL_OFFSET))
    }

    /// Clip-space position of an object-space point, as the vertex shader computes it.
    pub fn clip_position(&self, position: Vec3) -> Vec4 {
        self.view_proj * self.model * position.extend(1.0)
    }
}

impl Default for MvpUniforms {
    fn default() -> Self {
        Self::with_default_model(Mat4::IDENTITY)
    }
}

/// Shared light block (binding 1, fragment stage).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct LightUniforms {
    /// xyz position, w unused.
    pub positions: [Vec4; 4],
}

impl Default for LightUniforms {
    fn default() -> Self {
        Self {
            positions: [
                Vec4::new(-1.0, 1.0, -1.0, 0.0),
                Vec4::new(-1.0, 1.0, 1.0, 0.0),
                Vec4::new(-1.0, -1.0, -1.0, 0.0),
                Vec4::new(-1.0, -1.0, 1.0, 0.0),
            ],
        }
    }
}

/// Output size block of the cubemap pass (binding 1, fragment stage).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ExtentUniforms {
    pub width: f32,
    pub height: f32,
}

impl From<vk::Extent2D> for ExtentUniforms {
    fn from(extent: vk::Extent2D) -> Self {
        Self {
            width: extent.width as f32,
            height: extent.height as f32,
        }
    }
}

/// Size of a uniform block, as a descriptor range.
pub fn block_size<T: Pod>() -> u64 {
    std::mem::size_of::<T>() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn block_sizes_match_shader_layouts() {
        assert_eq!(block_size::<MvpUniforms>(), 128);
        assert_eq!(block_size::<LightUniforms>(), 64);
        assert_eq!(block_size::<ExtentUniforms>(), 8);
    }

    #[test]
    fn view_proj_comes_first() {
        let mvp = MvpUniforms::new(Mat4::from_scale(Vec3::splat(2.0)), Mat4::IDENTITY);
        let floats: &[f32] = bytemuck::cast_slice(std::slice::from_ref(&mvp));
        assert_eq!(floats[0], 2.0);
        assert_eq!(floats[16], 1.0);
    }

    #[test]
    fn matrices_are_uploaded_column_major() {
        let mvp = MvpUniforms::default();
        let floats: &[f32] = bytemuck::cast_slice(std::slice::from_ref(&mvp));
        // Translation lives in the fourth column.
        assert_eq!(&floats[16 + 12..16 + 15], &[6.0, 0.0, 0.0]);
    }

    #[test]
    fn default_model_translates_sphere() {
        let clip = MvpUniforms::default().clip_position(Vec3::new(1.0, 0.0, 0.0));
        assert_relative_eq!(clip.x, 7.0);
        assert_relative_eq!(clip.w, 1.0);
    }

    #[test]
    fn default_lights() {
        let lights = LightUniforms::default();
        for light in lights.positions {
            assert_relative_eq!(light.x, -1.0);
            assert_relative_eq!(light.y.abs(), 1.0);
            assert_relative_eq!(light.z.abs(), 1.0);
        }
    }

    #[test]
    fn extent_from_vulkan() {
        let extent = ExtentUniforms::from(vk::Extent2D {
            width: 512,
            height: 256,
        });
        assert_relative_eq!(extent.width, 512.0);
        assert_relative_eq!(extent.height, 256.0);
    }
}
