use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::fs::File;
use std::path::Path;

use ash::vk::{ShaderModule, ShaderModuleCreateInfo, ShaderStageFlags};
use ash::Device;
use byteorder::ReadBytesExt;

use crate::error::{Error, Result, VkResultExt};

/// Reads a compiled SPIR-V binary as native-endian 32-bit words.
pub fn load_spirv(path: &Path) -> Result<Vec<u32>> {
    let shader_error = |source| Error::Shader {
        path: path.to_path_buf(),
        source,
    };

    let file = File::open(path).map_err(shader_error)?;
    let meta = file.metadata().map_err(shader_error)?;
    let mut buf_reader = std::io::BufReader::new(file);

    let mut buffer = vec![0; (meta.len() / 4) as usize];
    buf_reader
        .read_u32_into::<byteorder::NativeEndian>(&mut buffer[..])
        .map_err(shader_error)?;

    Ok(buffer)
}

pub struct ShaderLibraryEntry {
    module: ShaderModule,
    stage: ShaderStageFlags,
    entry_point: CString,
}

impl ShaderLibraryEntry {
    pub fn module(&self) -> ShaderModule {
        self.module
    }

    pub fn stage(&self) -> ShaderStageFlags {
        self.stage
    }

    pub fn entry_point(&self) -> &CStr {
        &self.entry_point
    }
}

/// Named shader modules, destroyed together with the library.
pub struct ShaderLibrary {
    device: Device,
    entries: HashMap<String, ShaderLibraryEntry>,
}

impl ShaderLibrary {
    pub fn new(device: &Device) -> Self {
        Self {
            device: device.clone(),
            entries: HashMap::new(),
        }
    }

    pub fn add_spirv(
        &mut self,
        stage: ShaderStageFlags,
        name: &str,
        entry_point: &str,
        code: &[u32],
    ) -> Result<()> {
        let info = ShaderModuleCreateInfo::builder().code(code);
        let module = unsafe { self.device.create_shader_module(&info, None) }
            .call("vkCreateShaderModule")?;

        let previous = self.entries.insert(
            String::from(name),
            ShaderLibraryEntry {
                module,
                entry_point: CString::new(entry_point).unwrap_or_default(),
                stage,
            },
        );
        if let Some(previous) = previous {
            unsafe { self.device.destroy_shader_module(previous.module, None) };
        }
        Ok(())
    }

    pub fn add_file(
        &mut self,
        stage: ShaderStageFlags,
        name: &str,
        entry_point: &str,
        path: &Path,
    ) -> Result<()> {
        let spirv = load_spirv(path)?;
        tracing::debug!(path = %path.display(), words = spirv.len(), "loaded shader");
        self.add_spirv(stage, name, entry_point, &spirv)
    }

    pub fn get(&self, name: &str) -> Option<&ShaderLibraryEntry> {
        self.entries.get(name)
    }
}

impl Drop for ShaderLibrary {
    fn drop(&mut self) {
        for entry in self.entries.values() {
            unsafe { self.device.destroy_shader_module(entry.module, None) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reads_native_endian_words() {
        let dir = std::env::temp_dir().join(format!("vk_utils_spirv_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("words.spv");
        let words: [u32; 3] = [0x0723_0203, 0x0001_0500, 42];
        let mut file = File::create(&path).unwrap();
        for word in words {
            file.write_all(&word.to_ne_bytes()).unwrap();
        }
        drop(file);

        assert_eq!(load_spirv(&path).unwrap(), words.to_vec());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_file_names_the_path() {
        let path = Path::new("/definitely/not/here.spv");
        match load_spirv(path) {
            Err(Error::Shader { path: reported, .. }) => assert_eq!(reported, path),
            other => panic!("unexpected result: {:?}", other.map(|w| w.len())),
        }
    }
}
