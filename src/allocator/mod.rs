//! Port and directory reservations for concurrently running instances.
//!
//! Every live node and backup holds a [`Lease`]. The registry shared by a
//! harness guarantees that no two leases carry the same port or directory;
//! reservation and release each happen inside one critical section.


use std::collections::HashSet;
use std::fs::DirBuilder;
use std::io::ErrorKind;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use nanoid::nanoid;
use parking_lot::Mutex;
use rand::Rng;
use tracing::debug;
use tracing::warn;

use crate::file_io::remove_dir_if_exists;
use crate::net::is_port_free;
use crate::AllocationError;
use crate::AllocatorConfig;
use crate::Result;

const DIR_SUFFIX_LEN: usize = 8;
const DIR_SUFFIX_ALPHABET: [char; 36] = [
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v',
    'w', 'x', 'y', 'z', '0', '1', '2', '3', '4', '5', '6', '7', '8', '9',
];
const DIR_ATTEMPTS: usize = 16;

#[derive(Debug, Default)]
struct Registry {
    ports: HashSet<u16>,
    dirs: HashSet<PathBuf>,
}

/// Hands out leases; clones share one registry.
#[derive(Debug, Clone)]
pub struct ResourceAllocator {
    config: AllocatorConfig,
    registry: Arc<Mutex<Registry>>,
}

impl ResourceAllocator {
    pub fn new(config: AllocatorConfig) -> Self {
        Self {
            config,
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Port plus private directory for a server instance.
    pub fn allocate(
        &self,
        name: &str,
    ) -> Result<Lease> {
        let mut lease = self.allocate_dir(name)?;
        self.attach_port(&mut lease)?;
        Ok(lease)
    }

    /// Private directory only (backups, dumps).
    pub fn allocate_dir(
        &self,
        name: &str,
    ) -> Result<Lease> {
        let base = self.config.base_dir();
        std::fs::create_dir_all(&base).map_err(|source| AllocationError::Directory {
            path: base.clone(),
            source,
        })?;

        let label = sanitize(name);
        for _ in 0..DIR_ATTEMPTS {
            let suffix = nanoid!(DIR_SUFFIX_LEN, &DIR_SUFFIX_ALPHABET);
            let path = base.join(format!("{}-{}-{}", self.config.dir_prefix, label, suffix));

            let mut registry = self.registry.lock();
            if registry.dirs.contains(&path) {
                continue;
            }
            match DirBuilder::new().mode(0o700).create(&path) {
                Ok(()) => {
                    registry.dirs.insert(path.clone());
                    debug!("reserved directory {:?}", path);
                    return Ok(Lease {
                        port: None,
                        dir: path,
                        keep_dir: self.config.keep_dirs,
                        registry: self.registry.clone(),
                        released: false,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(source) => return Err(AllocationError::Directory { path, source }.into()),
            }
        }

        Err(AllocationError::Directory {
            path: base,
            source: std::io::Error::new(ErrorKind::AlreadyExists, "no unused directory name found"),
        }
        .into())
    }

    /// Adds a port to a directory-only lease. No-op when it already has one.
    pub fn attach_port(
        &self,
        lease: &mut Lease,
    ) -> Result<u16> {
        if let Some(port) = lease.port {
            return Ok(port);
        }
        let port = self.reserve_port()?;
        lease.port = Some(port);
        Ok(port)
    }

    fn reserve_port(&self) -> Result<u16> {
        let start = self.config.port_range_start;
        let count = self.config.port_count();
        let offset = rand::thread_rng().gen_range(0..count);

        let mut registry = self.registry.lock();
        for i in 0..count {
            let port = start + ((offset + i) % count) as u16;
            if registry.ports.contains(&port) {
                continue;
            }
            if is_port_free(&self.config.bind_host, port) {
                registry.ports.insert(port);
                debug!("reserved port {}", port);
                return Ok(port);
            }
        }

        warn!("no free port in {}..={}", start, self.config.port_range_end);
        Err(AllocationError::ResourceExhausted {
            start,
            end: self.config.port_range_end,
        }
        .into())
    }

    pub fn reserved_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.registry.lock().ports.iter().copied().collect();
        ports.sort_unstable();
        ports
    }

    pub fn reserved_dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = self.registry.lock().dirs.iter().cloned().collect();
        dirs.sort();
        dirs
    }
}

/// Exclusive claim on a directory and, for server instances, a port.
///
/// Released exactly once: by [`Lease::release`] or on drop.
#[derive(Debug)]
pub struct Lease {
    port: Option<u16>,
    dir: PathBuf,
    keep_dir: bool,
    registry: Arc<Mutex<Registry>>,
    released: bool,
}

impl Lease {
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Frees the port and directory name; the directory is removed from
    /// disk unless `keep_dirs` was configured.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        {
            let mut registry = self.registry.lock();
            if let Some(port) = self.port {
                registry.ports.remove(&port);
            }
            registry.dirs.remove(&self.dir);
        }

        if self.keep_dir {
            debug!("keeping {:?}", self.dir);
        } else if let Err(e) = remove_dir_if_exists(&self.dir) {
            warn!("failed to remove {:?}: {}", self.dir, e);
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release();
    }
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "node".to_string()
    } else {
        cleaned
    }
}
