use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::NodeOptions;
use super::NodeState;
use super::Operation;
use super::PollOptions;
use crate::errors::path_error;
use crate::file_io::copy_dir_all;
use crate::file_io::file_tail;
use crate::file_io::remove_dir_if_exists;
use crate::harness::DATA_DIR;
use crate::harness::LOGS_DIR;
use crate::harness::TOOLS_LOG;
use crate::materializer;
use crate::materializer::ServerSettings;
use crate::materializer::StandbyMarker;
use crate::materializer::Upstream;
use crate::run;
use crate::run_checked;
use crate::wait_for_liveness;
use crate::Backup;
use crate::BackupOptions;
use crate::CatchupError;
use crate::ClientBackend;
use crate::ConnectTarget;
use crate::Connection;
use crate::ConnectionError;
use crate::Error;
use crate::Harness;
use crate::Lease;
use crate::PgBackend;
use crate::ProcessOutput;
use crate::QueryError;
use crate::QueryResult;
use crate::ReplicaOptions;
use crate::Result;
use crate::Row;
use crate::ServerProcess;
use crate::Session;
use crate::ShutdownMode;
use crate::StateError;
use crate::StopOutcome;
use crate::SystemError;
use crate::Tool;
use crate::ToolCommand;
use crate::Value;
use crate::WalMethod;

pub(crate) const SERVER_LOG: &str = "postgresql.log";
const DEFAULT_DB: &str = "postgres";
const CATCHUP_INTERVAL: Duration = Duration::from_millis(100);

/// One PostgreSQL server instance with an exclusively owned port and
/// directory.
///
/// Dropping a node that is still running sends an immediate shutdown and
/// removes its directory; call [`Node::destroy`] for an orderly teardown.
pub struct Node<B: ClientBackend = PgBackend> {
    name: String,
    harness: Harness<B>,
    lease: Lease,
    port: u16,
    state: NodeState,
    options: NodeOptions,
    process: Option<ServerProcess>,
    replica: Option<(Upstream, StandbyMarker)>,
}

impl<B: ClientBackend> Node<B> {
    pub(crate) fn new(
        harness: Harness<B>,
        name: String,
        mut lease: Lease,
        options: NodeOptions,
    ) -> Result<Self> {
        let port = harness.allocator().attach_port(&mut lease)?;
        Ok(Self {
            name,
            harness,
            lease,
            port,
            state: NodeState::Uninitialized,
            options,
            process: None,
            replica: None,
        })
    }

    /// Node over a data directory that already holds a cluster (restored
    /// from a backup). Comes back `Initialized` with its configuration
    /// rendered for the new port.
    pub(crate) fn from_data_dir(
        harness: Harness<B>,
        name: String,
        lease: Lease,
        options: NodeOptions,
        replica: Option<(Upstream, StandbyMarker)>,
    ) -> Result<Self> {
        let mut node = Self::new(harness, name, lease, options)?;
        node.replica = replica;
        node.create_logs_dir()?;
        node.render_config()?;
        node.state = NodeState::Initialized;
        info!("[{}] restored from backup on port {}", node.name, node.port);
        Ok(node)
    }

    // ---------------------------------------------------------------
    // Inspection

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn host(&self) -> &str {
        &self.harness.config().server.host
    }

    pub fn base_dir(&self) -> &Path {
        self.lease.dir()
    }

    pub fn data_dir(&self) -> PathBuf {
        self.base_dir().join(DATA_DIR)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir().join(LOGS_DIR)
    }

    /// Server stdout and stderr.
    pub fn log_file(&self) -> PathBuf {
        self.logs_dir().join(SERVER_LOG)
    }

    /// Command lines and output of every tool run for this node.
    pub fn tools_log(&self) -> PathBuf {
        self.logs_dir().join(TOOLS_LOG)
    }

    /// Server process id; 0 unless running.
    pub fn pid(&self) -> u32 {
        self.process.as_ref().map(ServerProcess::pid).unwrap_or(0)
    }

    pub fn options(&self) -> &NodeOptions {
        &self.options
    }

    /// Source of a replica.
    pub fn upstream(&self) -> Option<&Upstream> {
        self.replica.as_ref().map(|(upstream, _)| upstream)
    }

    pub fn harness(&self) -> &Harness<B> {
        &self.harness
    }

    pub fn log_tail(
        &self,
        lines: usize,
    ) -> Result<Vec<String>> {
        file_tail(&self.log_file(), lines)
    }

    fn check(
        &self,
        op: Operation,
    ) -> Result<NodeState> {
        self.state.next(op).ok_or_else(|| {
            StateError::Node {
                node: self.name.clone(),
                operation: op.as_str(),
                state: self.state,
            }
            .into()
        })
    }

    fn require_data(
        &self,
        operation: &'static str,
    ) -> Result<()> {
        if self.state.has_data() {
            Ok(())
        } else {
            Err(StateError::Node {
                node: self.name.clone(),
                operation,
                state: self.state,
            }
            .into())
        }
    }

    // ---------------------------------------------------------------
    // Lifecycle

    /// Creates the cluster with `initdb` (or from the cached template) and
    /// renders its configuration.
    pub async fn initialize(&mut self) -> Result<()> {
        let next = self.check(Operation::Initialize)?;

        self.create_logs_dir()?;
        if let Err(e) = self.prepare_data_dir().await {
            error!("[{}] initialize failed: {}", self.name, e);
            if let Err(cleanup) = remove_dir_if_exists(&self.data_dir()) {
                warn!("[{}] failed to remove partial data dir: {}", self.name, cleanup);
            }
            return Err(e);
        }

        self.state = next;
        info!("[{}] initialized at {:?}", self.name, self.data_dir());
        Ok(())
    }

    async fn prepare_data_dir(&self) -> Result<()> {
        let data_dir = self.data_dir();

        if self.harness.config().tools.cache_initdb && self.options.initdb_params.is_empty() {
            let template = self.harness.initdb_template().await?;
            copy_dir_all(&template, &data_dir).map_err(|e| path_error(&data_dir, e))?;
            debug!("[{}] copied initdb template {:?}", self.name, template);
        } else {
            let cmd = self
                .tool(Tool::Initdb)
                .await
                .arg("-D")
                .arg(&data_dir)
                .arg("-N")
                .arg("-U")
                .arg(self.harness.username())
                .args(&self.options.initdb_params);
            run_checked(&cmd, self.harness.config().timeouts.tool(), Error::Init).await?;
        }

        self.render_config()
    }

    /// Spawns the server and waits until it accepts connections.
    ///
    /// On failure the process is killed and the state is left unchanged.
    pub async fn start(&mut self) -> Result<()> {
        let next = self.check(Operation::Start)?;
        let config = self.harness.config();

        let cmd = self
            .tool(Tool::Postgres)
            .await
            .arg("-D")
            .arg(self.data_dir())
            .arg("-p")
            .arg(self.port.to_string());
        let mut process = ServerProcess::spawn(&cmd, &self.log_file())?;

        let target = self.target(DEFAULT_DB);
        let target = &target;
        let backend = self.harness.backend();
        let liveness = wait_for_liveness(
            &mut process,
            self.port,
            &config.retry.liveness,
            config.timeouts.startup(),
            move || probe(backend, target),
        )
        .await;

        if let Err(e) = liveness {
            error!("[{}] failed to start: {}", self.name, e);
            if let Err(kill) = process.stop(ShutdownMode::Immediate, config.timeouts.stop()).await {
                warn!("[{}] failed to kill server after failed start: {}", self.name, kill);
            }
            return Err(e);
        }

        info!("[{}] running on port {} (pid {})", self.name, self.port, process.pid());
        self.process = Some(process);
        self.state = next;
        Ok(())
    }

    /// Stops the server with the configured shutdown mode, escalating to
    /// SIGKILL after `timeouts.stop_timeout_ms`.
    pub async fn stop(&mut self) -> Result<StopOutcome> {
        let next = self.check(Operation::Stop)?;
        let config = self.harness.config();

        let outcome = match self.process.as_mut() {
            Some(process) => {
                process
                    .stop(config.server.shutdown_mode, config.timeouts.stop())
                    .await?
            }
            None => StopOutcome::AlreadyExited { exit_code: None },
        };

        self.process = None;
        self.state = next;
        info!("[{}] stopped: {:?}", self.name, outcome);
        Ok(outcome)
    }

    /// `stop()` then `start()`; a failed start leaves the node `Stopped`.
    pub async fn restart(&mut self) -> Result<()> {
        self.check(Operation::Restart)?;
        self.stop().await?;
        self.start().await
    }

    /// Re-renders the configuration and signals the server to re-read it.
    pub async fn reload(&mut self) -> Result<()> {
        self.check(Operation::Reload)?;
        self.render_config()?;
        if let Some(process) = &self.process {
            process.reload()?;
        }
        debug!("[{}] reloaded", self.name);
        Ok(())
    }

    /// Best-effort stop, then releases port and directory. Idempotent.
    pub async fn destroy(&mut self) {
        if self.state == NodeState::Destroyed {
            return;
        }

        if let Some(mut process) = self.process.take() {
            let config = self.harness.config();
            match process.stop(config.server.shutdown_mode, config.timeouts.stop()).await {
                Ok(outcome) => debug!("[{}] stopped for destroy: {:?}", self.name, outcome),
                Err(e) => {
                    warn!("[{}] stop during destroy failed: {}", self.name, e);
                    process.abandon();
                }
            }
        }

        self.lease.release();
        self.state = NodeState::Destroyed;
        info!("[{}] destroyed", self.name);
    }

    // ---------------------------------------------------------------
    // Configuration

    /// Sets a server setting; written to disk immediately when the cluster
    /// exists. Running servers pick it up on [`Node::reload`] or restart.
    pub fn set_setting(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<()> {
        if self.state == NodeState::Destroyed {
            return Err(StateError::Node {
                node: self.name.clone(),
                operation: "configure",
                state: self.state,
            }
            .into());
        }
        self.options.overrides.insert(name.into(), value.into());
        if self.state.has_data() {
            self.render_config()?;
        }
        Ok(())
    }

    /// Appends a raw line to a file in the data directory. Lines appended to
    /// `postgresql.conf` are replaced on the next render (reload, restore).
    pub fn append_conf(
        &self,
        file: &str,
        line: &str,
    ) -> Result<()> {
        self.require_data("append configuration to")?;
        materializer::append(&self.data_dir(), file, line)
    }

    fn server_settings(&self) -> ServerSettings {
        let server = &self.harness.config().server;
        ServerSettings {
            port: self.port,
            listen_address: server.host.clone(),
            socket_dir: self.options.unix_sockets.then(std::env::temp_dir),
            defaults: server.default_settings.clone(),
            overrides: self.options.overrides.clone(),
            allow_streaming: self.options.allow_streaming,
            auth_method: server.auth_method.clone(),
            replica: self.replica.clone(),
        }
    }

    fn render_config(&self) -> Result<()> {
        materializer::render(&self.data_dir(), &self.server_settings())
    }

    fn create_logs_dir(&self) -> Result<()> {
        let logs = self.logs_dir();
        std::fs::create_dir_all(&logs).map_err(|e| path_error(&logs, e))
    }

    // ---------------------------------------------------------------
    // Client access

    fn target(
        &self,
        dbname: &str,
    ) -> ConnectTarget {
        let config = self.harness.config();
        ConnectTarget {
            host: config.server.host.clone(),
            port: self.port,
            user: self.harness.username().to_string(),
            dbname: dbname.to_string(),
            application_name: None,
            connect_timeout: config.timeouts.connect(),
        }
    }

    /// Opens a client session; fails with [`ConnectionError::NodeNotRunning`]
    /// unless the node is running.
    pub async fn connect(
        &self,
        dbname: &str,
    ) -> Result<Connection<B::Session>> {
        if self.state.next(Operation::Connect).is_none() {
            return Err(ConnectionError::NodeNotRunning {
                node: self.name.clone(),
                state: self.state,
            }
            .into());
        }
        let session = self.harness.backend().connect(&self.target(dbname)).await?;
        Ok(Connection::new(session, &self.name, dbname))
    }

    /// Runs one statement on a fresh connection.
    pub async fn query(
        &self,
        dbname: &str,
        sql: &str,
        params: &[Value],
    ) -> Result<QueryResult> {
        let mut conn = self.connect(dbname).await?;
        let result = conn.query(sql, params).await;
        let closed = conn.close().await;
        let result = result?;
        closed?;
        Ok(result)
    }

    /// Rows of one statement run on a fresh connection.
    pub async fn execute(
        &self,
        dbname: &str,
        sql: &str,
        params: &[Value],
    ) -> Result<Vec<Row>> {
        Ok(self.query(dbname, sql, params).await?.rows)
    }

    async fn tool(
        &self,
        tool: Tool,
    ) -> ToolCommand {
        self.harness.tools().command(tool).await.log_to(self.tools_log())
    }

    async fn psql_command(
        &self,
        dbname: &str,
    ) -> ToolCommand {
        self.tool(Tool::Psql)
            .await
            .args(["-X", "-A", "-t", "-q", "-v", "ON_ERROR_STOP=1"])
            .arg("-h")
            .arg(self.host())
            .arg("-p")
            .arg(self.port.to_string())
            .arg("-U")
            .arg(self.harness.username())
            .arg("-d")
            .arg(dbname)
    }

    /// Runs `query` through `psql`; a non-zero exit is returned, not raised.
    pub async fn psql(
        &self,
        dbname: &str,
        query: &str,
    ) -> Result<ProcessOutput> {
        self.check(Operation::Query)?;
        let cmd = self.psql_command(dbname).await.arg("-c").arg(query);
        run(&cmd, self.harness.config().timeouts.tool()).await
    }

    /// `psql` output, failing with [`Error::Tool`] on a non-zero exit.
    pub async fn safe_psql(
        &self,
        dbname: &str,
        query: &str,
    ) -> Result<String> {
        self.check(Operation::Query)?;
        let cmd = self.psql_command(dbname).await.arg("-c").arg(query);
        let output = run_checked(&cmd, self.harness.config().timeouts.tool(), Error::Tool).await?;
        Ok(output.stdout)
    }

    /// Re-runs `query` until the first cell of its first row equals
    /// `options.expected`.
    pub async fn poll_query_until(
        &self,
        dbname: &str,
        query: &str,
        options: PollOptions,
    ) -> Result<()> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.query(dbname, query, &[]).await {
                Ok(result) => {
                    if !result.has_result_set() {
                        if options.expected.is_none() {
                            return Ok(());
                        }
                        return Err(QueryError::NoResultSet(query.to_string()).into());
                    }
                    let Some(row) = result.rows.first() else {
                        return Err(QueryError::NoRows(query.to_string()).into());
                    };
                    let Some(cell) = row.first() else {
                        return Err(QueryError::NoColumns(query.to_string()).into());
                    };
                    if Some(cell) == options.expected.as_ref() {
                        debug!("[{}] poll matched after {} attempts", self.name, attempts);
                        return Ok(());
                    }
                }
                Err(Error::Connection(e)) if e.is_programming_error() && !options.raise_programming_error => {
                    debug!("[{}] poll attempt {}: {}", self.name, attempts, e);
                }
                Err(e) => return Err(e),
            }

            if options.max_attempts != 0 && attempts >= options.max_attempts {
                return Err(QueryError::PollExhausted {
                    query: query.to_string(),
                    expected: options
                        .expected
                        .as_ref()
                        .map(Value::to_string)
                        .unwrap_or_else(|| "no result set".to_string()),
                    attempts,
                }
                .into());
            }
            sleep(options.sleep).await;
        }
    }

    /// Waits until this replica has replayed everything its upstream had
    /// written when the call started.
    pub async fn catchup(&self) -> Result<()> {
        let Some((upstream, _)) = &self.replica else {
            return Err(CatchupError::NoUpstream(self.name.clone()).into());
        };
        self.check(Operation::Query)?;

        let version = self.harness.server_version().await?;
        let (current_fn, replay_fn) = if version.uses_wal_naming() {
            ("pg_current_wal_lsn()", "pg_last_wal_replay_lsn()")
        } else {
            ("pg_current_xlog_location()", "pg_last_xlog_replay_location()")
        };

        let lsn = self
            .read_lsn(upstream, current_fn)
            .await
            .map_err(|e| CatchupError::Position {
                node: upstream.node_name.clone(),
                reason: e.to_string(),
            })?;
        debug!("[{}] catching up with {} at {}", self.name, upstream.node_name, lsn);

        let startup = self.harness.config().timeouts.startup();
        let options = PollOptions {
            expected: Some(Value::Bool(true)),
            max_attempts: (startup.as_millis() / CATCHUP_INTERVAL.as_millis()).max(1) as usize,
            sleep: CATCHUP_INTERVAL,
            raise_programming_error: true,
        };
        self.poll_query_until(DEFAULT_DB, &format!("SELECT '{lsn}'::pg_lsn <= {replay_fn}"), options)
            .await
    }

    async fn read_lsn(
        &self,
        upstream: &Upstream,
        function: &str,
    ) -> Result<String> {
        let target = ConnectTarget {
            host: upstream.host.clone(),
            port: upstream.port,
            user: upstream.username.clone(),
            dbname: DEFAULT_DB.to_string(),
            application_name: None,
            connect_timeout: self.harness.config().timeouts.connect(),
        };
        let mut session = self.harness.backend().connect(&target).await?;
        let result = session.query(&format!("SELECT {function}::text"), &[]).await;
        session.close();

        match result?.scalar() {
            Some(Value::Text(lsn)) => Ok(lsn.clone()),
            other => Err(SystemError::UnexpectedOutput(format!("WAL position {:?}", other)).into()),
        }
    }

    // ---------------------------------------------------------------
    // Tools on top of a running server

    /// Plain-format `pg_dump` of `dbname` into a freshly allocated directory,
    /// removed when the returned [`Dump`] is dropped.
    pub async fn dump(
        &self,
        dbname: &str,
    ) -> Result<Dump> {
        self.check(Operation::Query)?;
        let lease = self.harness.allocator().allocate_dir(&format!("{}-dump", self.name))?;
        let file = lease.dir().join(format!("{dbname}.sql"));

        let cmd = self
            .tool(Tool::PgDump)
            .await
            .arg("-h")
            .arg(self.host())
            .arg("-p")
            .arg(self.port.to_string())
            .arg("-U")
            .arg(self.harness.username())
            .arg("-d")
            .arg(dbname)
            .arg("-f")
            .arg(&file);
        run_checked(&cmd, self.harness.config().timeouts.tool(), Error::Tool).await?;

        info!("[{}] dumped {} into {:?}", self.name, dbname, file);
        Ok(Dump { lease, file })
    }

    /// Feeds a SQL script (typically a [`Dump`]) to `psql`.
    pub async fn restore(
        &self,
        dbname: &str,
        script: &Path,
    ) -> Result<()> {
        self.check(Operation::Query)?;
        let cmd = self.psql_command(dbname).await.arg("-f").arg(script);
        run_checked(&cmd, self.harness.config().timeouts.tool(), Error::Tool).await?;
        Ok(())
    }

    /// `pg_controldata` output as a `field -> value` map.
    pub async fn control_data(&self) -> Result<BTreeMap<String, String>> {
        self.require_data("read control data of")?;
        let cmd = self
            .tool(Tool::PgControldata)
            .await
            .env("LC_ALL", "C")
            .arg("-D")
            .arg(self.data_dir());
        let output = run_checked(&cmd, self.harness.config().timeouts.tool(), Error::Tool).await?;

        Ok(output
            .stdout
            .lines()
            .filter_map(|line| line.split_once(':'))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect())
    }

    pub async fn backup(
        &self,
        options: BackupOptions,
    ) -> Result<Backup<B>> {
        Backup::create(self, options).await
    }

    /// Streaming backup turned straight into an `Initialized` replica.
    pub async fn replicate(
        &self,
        name: &str,
    ) -> Result<Node<B>> {
        let mut backup = self
            .backup(BackupOptions {
                wal_method: WalMethod::Stream,
                ..BackupOptions::default()
            })
            .await?;
        backup.spawn_replica(name, ReplicaOptions::default()).await
    }
}

async fn probe<B: ClientBackend>(
    backend: &B,
    target: &ConnectTarget,
) -> Result<()> {
    let mut session = backend.connect(target).await?;
    session.close();
    Ok(())
}

impl<B: ClientBackend> Drop for Node<B> {
    fn drop(&mut self) {
        if let Some(process) = self.process.as_mut() {
            warn!("[{}] dropped while running, sending immediate shutdown", self.name);
            process.abandon();
        }
    }
}

impl<B: ClientBackend> fmt::Debug for Node<B> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("port", &self.port)
            .field("base_dir", &self.lease.dir())
            .field("pid", &self.pid())
            .finish()
    }
}

/// SQL script written by [`Node::dump`].
#[derive(Debug)]
pub struct Dump {
    lease: Lease,
    file: PathBuf,
}

impl Dump {
    pub fn path(&self) -> &Path {
        &self.file
    }

    pub fn dir(&self) -> &Path {
        self.lease.dir()
    }
}
