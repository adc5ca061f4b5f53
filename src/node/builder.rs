//! Fluent construction of a [`Node`].
//!
//! ```ignore
//! let harness = Harness::from_env()?;
//! let mut node = harness
//!     .node()
//!     .name("primary")
//!     .allow_streaming(true)
//!     .setting("max_connections", "20")
//!     .build()?;
//! node.initialize().await?;
//! node.start().await?;
//! ```

use tracing::debug;

use super::Node;
use super::NodeOptions;
use crate::ClientBackend;
use crate::Harness;
use crate::PgBackend;
use crate::Result;

pub struct NodeBuilder<B: ClientBackend = PgBackend> {
    harness: Harness<B>,
    name: Option<String>,
    options: NodeOptions,
}

impl<B: ClientBackend> NodeBuilder<B> {
    pub fn new(harness: Harness<B>) -> Self {
        Self {
            harness,
            name: None,
            options: NodeOptions::default(),
        }
    }

    /// Human-readable label; `testbed-<pid>-<n>` when not set.
    pub fn name(
        mut self,
        name: impl Into<String>,
    ) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn options(
        mut self,
        options: NodeOptions,
    ) -> Self {
        self.options = options;
        self
    }

    /// Server setting layered over the harness defaults.
    pub fn setting(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.options.overrides.insert(name.into(), value.into());
        self
    }

    pub fn allow_streaming(
        mut self,
        allow: bool,
    ) -> Self {
        self.options.allow_streaming = allow;
        self
    }

    pub fn unix_sockets(
        mut self,
        enabled: bool,
    ) -> Self {
        self.options.unix_sockets = enabled;
        self
    }

    pub fn initdb_params<I, S>(
        mut self,
        params: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.initdb_params = params.into_iter().map(Into::into).collect();
        self
    }

    /// Reserves a port and directory; the node starts `Uninitialized`.
    pub fn build(self) -> Result<Node<B>> {
        let name = self.name.unwrap_or_else(|| self.harness.next_node_name());
        let lease = self.harness.allocator().allocate(&name)?;
        debug!("[{}] allocated {:?}", name, lease);
        Node::new(self.harness, name, lease, self.options)
    }
}
