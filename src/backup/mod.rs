//! Physical backups and the nodes spawned from them.
//!
//! A [`Backup`] is a `pg_basebackup` snapshot of a running node held in its
//! own leased directory. Nodes are spawned from it either by copying the
//! snapshot (the backup stays usable) or by taking the directory over, which
//! exhausts the backup. Replicas additionally get upstream connection info and
//! a standby marker matching the server version.


use std::fmt;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::time::SystemTime;

use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::errors::path_error;
use crate::file_io::copy_dir_all;
use crate::harness::DATA_DIR;
use crate::harness::LOGS_DIR;
use crate::harness::TOOLS_LOG;
use crate::materializer::StandbyMarker;
use crate::materializer::Upstream;
use crate::run_checked;
use crate::BackupError;
use crate::ClientBackend;
use crate::Harness;
use crate::Lease;
use crate::Node;
use crate::NodeOptions;
use crate::Operation;
use crate::PgBackend;
use crate::Result;
use crate::Tool;

/// `pg_basebackup -X` mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WalMethod {
    /// No WAL included; the snapshot needs an archive to be consistent
    None,
    /// WAL collected at the end of the backup
    #[default]
    Fetch,
    /// WAL streamed over a second connection while the backup runs
    Stream,
}

impl WalMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalMethod::None => "none",
            WalMethod::Fetch => "fetch",
            WalMethod::Stream => "stream",
        }
    }
}

impl fmt::Display for WalMethod {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    pub wal_method: WalMethod,
    /// Role `pg_basebackup` connects as; the harness user when unset
    pub username: Option<String>,
}

/// Controls [`Backup::spawn_replica`].
#[derive(Debug, Clone, Copy)]
pub struct ReplicaOptions {
    /// Hand the snapshot directory over instead of copying it
    pub destroy: bool,
    /// Start the replica before returning it
    pub auto_start: bool,
}

impl Default for ReplicaOptions {
    fn default() -> Self {
        Self {
            destroy: true,
            auto_start: false,
        }
    }
}

/// Point-in-time copy of a running node's data directory.
pub struct Backup<B: ClientBackend = PgBackend> {
    harness: Harness<B>,
    /// `None` once handed over to a node or cleaned up
    lease: Option<Lease>,
    source: Upstream,
    node_options: NodeOptions,
    wal_method: WalMethod,
    username: String,
    created_at: SystemTime,
}

impl<B: ClientBackend> Backup<B> {
    /// Runs `pg_basebackup` against `node` into a freshly allocated directory.
    pub async fn create(
        node: &Node<B>,
        options: BackupOptions,
    ) -> Result<Self> {
        if node.state().next(Operation::Backup).is_none() {
            return Err(BackupError::SourceNotRunning {
                node: node.name().to_string(),
                state: node.state(),
            }
            .into());
        }

        let harness = node.harness().clone();
        let lease = harness.allocator().allocate_dir(&format!("{}-backup", node.name()))?;
        let data_dir = lease.dir().join(DATA_DIR);
        let username = options.username.unwrap_or_else(|| harness.username().to_string());

        let cmd = harness
            .tools()
            .command(Tool::PgBasebackup)
            .await
            .arg("-p")
            .arg(node.port().to_string())
            .arg("-h")
            .arg(node.host())
            .arg("-U")
            .arg(&username)
            .arg("-D")
            .arg(&data_dir)
            .arg("-X")
            .arg(options.wal_method.as_str())
            .log_to(lease.dir().join(LOGS_DIR).join(TOOLS_LOG));
        run_checked(&cmd, harness.config().timeouts.backup(), |f| BackupError::Tool(f).into()).await?;

        info!(
            "[{}] backup taken into {:?} (wal method {})",
            node.name(),
            data_dir,
            options.wal_method
        );

        Ok(Self {
            source: Upstream {
                node_name: node.name().to_string(),
                host: node.host().to_string(),
                port: node.port(),
                username: username.clone(),
                application_name: String::new(),
            },
            harness,
            lease: Some(lease),
            node_options: node.options().clone(),
            wal_method: options.wal_method,
            username,
            created_at: SystemTime::now(),
        })
    }

    /// Name of the node the snapshot was taken from.
    pub fn source_name(&self) -> &str {
        &self.source.node_name
    }

    pub fn source_port(&self) -> u16 {
        self.source.port
    }

    pub fn wal_method(&self) -> WalMethod {
        self.wal_method
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// False once the snapshot was handed over or cleaned up.
    pub fn is_available(&self) -> bool {
        self.lease.is_some()
    }

    /// Snapshot data directory while available.
    pub fn data_dir(&self) -> Option<PathBuf> {
        self.lease.as_ref().map(|l| l.dir().join(DATA_DIR))
    }

    /// `Initialized` node over the snapshot. With `destroy` the directory is
    /// moved into the node and the backup becomes exhausted.
    pub async fn spawn_primary(
        &mut self,
        name: &str,
        destroy: bool,
    ) -> Result<Node<B>> {
        self.spawn(name, destroy, None)
    }

    /// Like [`Backup::spawn_primary`], configured to stream from the source.
    /// Not started unless `options.auto_start`; catching up is left to
    /// [`Node::catchup`].
    pub async fn spawn_replica(
        &mut self,
        name: &str,
        options: ReplicaOptions,
    ) -> Result<Node<B>> {
        if !self.is_available() {
            return Err(BackupError::Exhausted.into());
        }

        let marker = if self.harness.server_version().await?.uses_standby_signal() {
            StandbyMarker::SignalFile
        } else {
            StandbyMarker::RecoveryConf
        };
        let upstream = Upstream {
            application_name: name.to_string(),
            ..self.source.clone()
        };

        let mut node = self.spawn(name, options.destroy, Some((upstream, marker)))?;
        if options.auto_start {
            node.start().await?;
        }
        Ok(node)
    }

    fn spawn(
        &mut self,
        name: &str,
        destroy: bool,
        replica: Option<(Upstream, StandbyMarker)>,
    ) -> Result<Node<B>> {
        let Some(snapshot) = self.lease.as_ref() else {
            return Err(BackupError::Exhausted.into());
        };
        let snapshot_data = snapshot.dir().join(DATA_DIR);

        // port and directory first, so a failed allocation keeps the backup intact
        let lease = self.harness.allocator().allocate(name)?;
        let node_data = lease.dir().join(DATA_DIR);

        if destroy {
            hand_over(&snapshot_data, &node_data)?;
            self.lease = None;
            debug!("[{}] took over backup of {}", name, self.source.node_name);
        } else {
            copy_dir_all(&snapshot_data, &node_data).map_err(|source| BackupError::Copy {
                from: snapshot_data.clone(),
                source,
            })?;
            debug!("[{}] copied backup of {}", name, self.source.node_name);
        }

        Node::from_data_dir(
            self.harness.clone(),
            name.to_string(),
            lease,
            self.node_options.clone(),
            replica,
        )
    }

    /// Removes the snapshot directory if still owned. Idempotent.
    pub fn cleanup(&mut self) {
        if let Some(mut lease) = self.lease.take() {
            lease.release();
            info!("backup of {} cleaned up", self.source.node_name);
        }
    }
}

/// Moves the snapshot; falls back to a copy when the rename crosses devices.
fn hand_over(
    from: &Path,
    to: &Path,
) -> Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!("rename {:?} -> {:?} failed ({}), copying instead", from, to, e);
            copy_dir_all(from, to).map_err(|source| BackupError::Copy {
                from: from.to_path_buf(),
                source,
            })?;
            fs::remove_dir_all(from).map_err(|e| path_error(from, e))
        }
    }
}

impl<B: ClientBackend> fmt::Debug for Backup<B> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Backup")
            .field("source", &self.source.node_name)
            .field("dir", &self.lease.as_ref().map(|l| l.dir()))
            .field("wal_method", &self.wal_method)
            .field("available", &self.is_available())
            .finish()
    }
}
