//! SPIR-V loading.

use crate::error::{GpuError, Result};
use ash::vk;
use std::path::Path;

/// First word of every SPIR-V module.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Convert raw bytecode into aligned words.
///
/// Accepts either byte order of the magic number.
pub fn bytes_to_spirv(bytes: &[u8]) -> Result<Vec<u32>> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return Err(GpuError::ShaderLoad(format!(
            "SPIR-V size {} is not a non-zero multiple of 4",
            bytes.len()
        )));
    }

    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();

    match words[0] {
        SPIRV_MAGIC => Ok(words),
        magic if magic.swap_bytes() == SPIRV_MAGIC => {
            Ok(words.into_iter().map(u32::swap_bytes).collect())
        }
        magic => Err(GpuError::ShaderLoad(format!(
            "bad SPIR-V magic {magic:#010x}"
        ))),
    }
}

/// Read a `.spv` file.
pub fn load_spirv_file(path: impl AsRef<Path>) -> Result<Vec<u32>> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)
        .map_err(|e| GpuError::ShaderLoad(format!("{}: {e}", path.display())))?;
    bytes_to_spirv(&bytes)
}

/// Create a shader module.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_shader_module(device: &ash::Device, code: &[u32]) -> Result<vk::ShaderModule> {
    let info = vk::ShaderModuleCreateInfo::default().code(code);
    device
        .create_shader_module(&info, None)
        .map_err(|e| GpuError::ShaderCompilation(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module_bytes(magic: [u8; 4]) -> Vec<u8> {
        let mut bytes = magic.to_vec();
        bytes.extend_from_slice(&0x0001_0300_u32.to_le_bytes());
        bytes
    }

    #[test]
    fn little_endian_module_loads() {
        let words = bytes_to_spirv(&module_bytes([0x03, 0x02, 0x23, 0x07])).unwrap();
        assert_eq!(words[0], SPIRV_MAGIC, "Invalid SPIR-V magic number");
        assert_eq!(words[1], 0x0001_0300);
    }

    #[test]
    fn big_endian_module_is_swapped() {
        let mut bytes = vec![0x07, 0x23, 0x02, 0x03];
        bytes.extend_from_slice(&0x0001_0300_u32.to_be_bytes());
        let words = bytes_to_spirv(&bytes).unwrap();
        assert_eq!(words, vec![SPIRV_MAGIC, 0x0001_0300]);
    }

    #[test]
    fn unaligned_or_foreign_bytes_are_rejected() {
        assert!(matches!(
            bytes_to_spirv(&[0x03, 0x02, 0x23]),
            Err(GpuError::ShaderLoad(_))
        ));
        assert!(bytes_to_spirv(&[]).is_err());
        assert!(bytes_to_spirv(&module_bytes(*b"\x7fELF")).is_err());
    }

    #[test]
    fn missing_file_is_a_load_error() {
        assert!(matches!(
            load_spirv_file("does/not/exist.spv"),
            Err(GpuError::ShaderLoad(_))
        ));
    }
}
