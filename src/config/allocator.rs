use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use super::invalid;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AllocatorConfig {
    /// First candidate port (inclusive)
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,

    /// Last candidate port (inclusive)
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,

    /// Host used for the bind test of candidate ports
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Parent of every node and backup directory.
    /// Falls back to the system temp dir when unset.
    #[serde(default)]
    pub base_dir: Option<PathBuf>,

    /// Leading component of generated directory names
    #[serde(default = "default_dir_prefix")]
    pub dir_prefix: String,

    /// Leave directories on disk after release (post-mortem debugging)
    #[serde(default)]
    pub keep_dirs: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            bind_host: default_bind_host(),
            base_dir: None,
            dir_prefix: default_dir_prefix(),
            keep_dirs: false,
        }
    }
}

impl AllocatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.port_range_start == 0 {
            return Err(invalid("allocator.port_range_start cannot be 0"));
        }
        if self.port_range_start > self.port_range_end {
            return Err(invalid(format!(
                "allocator port range is empty: {}..={}",
                self.port_range_start, self.port_range_end
            )));
        }
        if self.dir_prefix.is_empty() || self.dir_prefix.contains(std::path::MAIN_SEPARATOR) {
            return Err(invalid(format!(
                "allocator.dir_prefix must be a single non-empty path component, got {:?}",
                self.dir_prefix
            )));
        }
        if let Some(dir) = &self.base_dir {
            if dir.as_os_str().is_empty() {
                return Err(invalid("allocator.base_dir path cannot be empty"));
            }
        }
        Ok(())
    }

    pub fn base_dir(&self) -> PathBuf {
        self.base_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn port_count(&self) -> usize {
        (self.port_range_end - self.port_range_start) as usize + 1
    }
}

fn default_port_range_start() -> u16 {
    15432
}
fn default_port_range_end() -> u16 {
    25432
}
fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}
fn default_dir_prefix() -> String {
    "testbed".to_string()
}
