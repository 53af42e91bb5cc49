//! Interleaved triangle meshes.

use glam::Vec3;
use lumen_gpu::{GpuError, Result};
use std::collections::HashMap;

/// Floats per vertex: position xyz, normal xyz.
pub const FLOATS_PER_VERTEX: usize = 6;

/// Bytes per vertex in the vertex buffer.
pub const VERTEX_STRIDE: u32 = (FLOATS_PER_VERTEX * std::mem::size_of::<f32>()) as u32;

/// Byte offset of the normal inside a vertex.
pub const NORMAL_OFFSET: u32 = (3 * std::mem::size_of::<f32>()) as u32;

/// Validated vertex and index arrays.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshData {
    vertices: Vec<f32>,
    indices: Vec<u32>,
}

impl MeshData {
    /// Validate interleaved `(pos, normal)` vertices and a triangle list.
    pub fn new(vertices: Vec<f32>, indices: Vec<u32>) -> Result<Self> {
        if vertices.is_empty() || vertices.len() % FLOATS_PER_VERTEX != 0 {
            return Err(GpuError::InvalidState(format!(
                "vertex data has {} floats, expected a non-zero multiple of {FLOATS_PER_VERTEX}",
                vertices.len()
            )));
        }
        if indices.is_empty() || indices.len() % 3 != 0 {
            return Err(GpuError::InvalidState(format!(
                "index count {} is not a non-zero multiple of 3",
                indices.len()
            )));
        }

        let vertex_count = vertices.len() / FLOATS_PER_VERTEX;
        if let Some(&bad) = indices.iter().find(|&&i| i as usize >= vertex_count) {
            return Err(GpuError::InvalidState(format!(
                "index {bad} out of range for {vertex_count} vertices"
            )));
        }

        Ok(Self { vertices, indices })
    }

    /// Unit icosphere; one subdivision gives 42 vertices and 80 triangles.
    pub fn icosphere(subdivisions: u32) -> Self {
        let t = (1.0 + 5.0_f32.sqrt()) / 2.0;
        let mut positions: Vec<Vec3> = [
            (-1.0, t, 0.0),
            (1.0, t, 0.0),
            (-1.0, -t, 0.0),
            (1.0, -t, 0.0),
            (0.0, -1.0, t),
            (0.0, 1.0, t),
            (0.0, -1.0, -t),
            (0.0, 1.0, -t),
            (t, 0.0, -1.0),
            (t, 0.0, 1.0),
            (-t, 0.0, -1.0),
            (-t, 0.0, 1.0),
        ]
        .into_iter()
        .map(|(x, y, z)| Vec3::new(x, y, z).normalize())
        .collect();

        let mut faces: Vec<[u32; 3]> = vec![
            [0, 11, 5],
            [0, 5, 1],
            [0, 1, 7],
            [0, 7, 10],
            [0, 10, 11],
            [1, 5, 9],
            [5, 11, 4],
            [11, 10, 2],
            [10, 7, 6],
            [7, 1, 8],
            [3, 9, 4],
            [3, 4, 2],
            [3, 2, 6],
            [3, 6, 8],
            [3, 8, 9],
            [4, 9, 5],
            [2, 4, 11],
            [6, 2, 10],
            [8, 6, 7],
            [9, 8, 1],
        ];

        for _ in 0..subdivisions {
            let mut midpoints: HashMap<(u32, u32), u32> = HashMap::new();
            let mut midpoint = |a: u32, b: u32, positions: &mut Vec<Vec3>| {
                *midpoints.entry((a.min(b), a.max(b))).or_insert_with(|| {
                    let mid = (positions[a as usize] + positions[b as usize]).normalize();
                    positions.push(mid);
                    (positions.len() - 1) as u32
                })
            };

            faces = faces
                .iter()
                .flat_map(|&[a, b, c]| {
                    let ab = midpoint(a, b, &mut positions);
                    let bc = midpoint(b, c, &mut positions);
                    let ca = midpoint(c, a, &mut positions);
                    [[a, ab, ca], [b, bc, ab], [c, ca, bc], [ab, bc, ca]]
                })
                .collect();
        }

        // On a unit sphere the normal is the position.
        let vertices = positions
            .iter()
            .flat_map(|p| [p.x, p.y, p.z, p.x, p.y, p.z])
            .collect();
        let indices = faces.into_iter().flatten().collect();

        Self { vertices, indices }
    }

    pub fn vertices(&self) -> &[f32] {
        &self.vertices
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len() / FLOATS_PER_VERTEX
    }

    pub fn index_count(&self) -> u32 {
        self.indices.len() as u32
    }

    /// Vertex data as uploaded.
    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    /// Index data as uploaded.
    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn sphere_buffer_sizes() {
        let sphere = MeshData::icosphere(1);
        assert_eq!(sphere.vertex_count(), 42);
        assert_eq!(sphere.index_count(), 240);
        assert_eq!(sphere.vertex_bytes().len(), 42 * 6 * 4);
        assert_eq!(sphere.index_bytes().len(), 240 * 4);
    }

    #[test]
    fn sphere_vertices_are_on_unit_sphere() {
        let sphere = MeshData::icosphere(1);
        for v in sphere.vertices().chunks_exact(FLOATS_PER_VERTEX) {
            let p = Vec3::new(v[0], v[1], v[2]);
            assert_relative_eq!(p.length(), 1.0, epsilon = 1e-5);
            assert_relative_eq!(p.dot(Vec3::new(v[3], v[4], v[5])), 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn generated_sphere_passes_validation() {
        let sphere = MeshData::icosphere(2);
        let checked = MeshData::new(sphere.vertices().to_vec(), sphere.indices().to_vec());
        assert_eq!(checked.unwrap(), sphere);
    }

    #[test]
    fn malformed_meshes_are_rejected() {
        assert!(MeshData::new(vec![0.0; 7], vec![0, 0, 0]).is_err());
        assert!(MeshData::new(vec![0.0; 12], vec![0, 1]).is_err());
        assert!(MeshData::new(vec![0.0; 12], vec![0, 1, 2]).is_err());
        assert!(MeshData::new(vec![0.0; 18], vec![0, 1, 2]).is_ok());
    }

    #[test]
    fn layout_constants() {
        assert_eq!(VERTEX_STRIDE, 24);
        assert_eq!(NORMAL_OFFSET, 12);
    }
}
