//! Shared context of every node and backup: configuration, resource
//! allocator, tool resolver and client backend.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::run_checked;
use crate::ClientBackend;
use crate::Error;
use crate::HarnessConfig;
use crate::Lease;
use crate::NodeBuilder;
use crate::PgBackend;
use crate::ResourceAllocator;
use crate::Result;
use crate::ServerVersion;
use crate::Tool;
use crate::ToolResolver;

pub(crate) const DATA_DIR: &str = "data";
pub(crate) const LOGS_DIR: &str = "logs";
pub(crate) const TOOLS_LOG: &str = "tools.log";

/// Entry point: builds nodes that share one port/directory registry.
///
/// Cheap to clone; clones share state.
pub struct Harness<B: ClientBackend = PgBackend> {
    inner: Arc<Inner<B>>,
}

struct Inner<B> {
    config: HarnessConfig,
    allocator: ResourceAllocator,
    tools: ToolResolver,
    backend: B,
    username: String,
    node_seq: AtomicU64,
    initdb_template: Mutex<Option<Lease>>,
}

impl Harness<PgBackend> {
    pub fn new(config: HarnessConfig) -> Result<Self> {
        Self::with_backend(config, PgBackend)
    }

    /// Configuration from `CONFIG_PATH` and `TESTBED__*` variables.
    pub fn from_env() -> Result<Self> {
        Self::new(HarnessConfig::new()?)
    }
}

impl<B: ClientBackend> Harness<B> {
    pub fn with_backend(
        config: HarnessConfig,
        backend: B,
    ) -> Result<Self> {
        let config = config.validate()?;
        let allocator = ResourceAllocator::new(config.allocator.clone());
        let tools = ToolResolver::new(&config.tools, config.timeouts.tool());
        let username = config.server.username();

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                allocator,
                tools,
                backend,
                username,
                node_seq: AtomicU64::new(1),
                initdb_template: Mutex::new(None),
            }),
        })
    }

    pub fn node(&self) -> NodeBuilder<B> {
        NodeBuilder::new(self.clone())
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.inner.config
    }

    pub fn allocator(&self) -> &ResourceAllocator {
        &self.inner.allocator
    }

    pub fn tools(&self) -> &ToolResolver {
        &self.inner.tools
    }

    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    /// Database superuser of every node.
    pub fn username(&self) -> &str {
        &self.inner.username
    }

    pub async fn server_version(&self) -> Result<ServerVersion> {
        self.inner.tools.server_version().await
    }

    pub(crate) fn next_node_name(&self) -> String {
        let seq = self.inner.node_seq.fetch_add(1, Ordering::Relaxed);
        format!("testbed-{}-{}", std::process::id(), seq)
    }

    /// Data directory produced by one plain `initdb` run, created on first use
    /// and reused for the lifetime of the harness.
    pub(crate) async fn initdb_template(&self) -> Result<PathBuf> {
        let mut template = self.inner.initdb_template.lock().await;
        if let Some(lease) = template.as_ref() {
            return Ok(lease.dir().join(DATA_DIR));
        }

        let lease = self.inner.allocator.allocate_dir("initdb-template")?;
        let data_dir = lease.dir().join(DATA_DIR);
        let cmd = self
            .inner
            .tools
            .command(Tool::Initdb)
            .await
            .arg("-D")
            .arg(&data_dir)
            .arg("-N")
            .arg("-U")
            .arg(&self.inner.username)
            .log_to(lease.dir().join(LOGS_DIR).join(TOOLS_LOG));
        run_checked(&cmd, self.inner.config.timeouts.tool(), Error::Init).await?;
        info!("cached initdb template at {:?}", data_dir);

        *template = Some(lease);
        Ok(data_dir)
    }
}

impl<B: ClientBackend> Clone for Harness<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B: ClientBackend> fmt::Debug for Harness<B> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Harness")
            .field("config", &self.inner.config)
            .field("username", &self.inner.username)
            .field("reserved_ports", &self.inner.allocator.reserved_ports())
            .finish()
    }
}
