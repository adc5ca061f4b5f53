use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_postgres::types::ToSql;
use tokio_postgres::Client;
use tokio_postgres::NoTls;
use tracing::debug;

use super::ClientBackend;
use super::ConnectTarget;
use super::QueryResult;
use super::Session;
use super::Value;
use crate::ConnectionError;
use crate::Result;

/// `tokio-postgres` over plain TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgBackend;

#[async_trait]
impl ClientBackend for PgBackend {
    type Session = PgSession;

    async fn connect(
        &self,
        target: &ConnectTarget,
    ) -> Result<PgSession> {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&target.host)
            .port(target.port)
            .user(&target.user)
            .dbname(&target.dbname)
            .connect_timeout(target.connect_timeout);
        if let Some(name) = &target.application_name {
            config.application_name(name);
        }

        let handshake = |reason: String| ConnectionError::Handshake {
            host: target.host.clone(),
            port: target.port,
            reason,
        };

        let (client, connection) = timeout(target.connect_timeout, config.connect(NoTls))
            .await
            .map_err(|_| handshake(format!("timed out after {:?}", target.connect_timeout)))?
            .map_err(|e| handshake(e.to_string()))?;

        let port = target.port;
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("connection to port {} ended: {}", port, e);
            }
        });

        Ok(PgSession {
            client: Some(client),
            driver: Some(driver),
        })
    }
}

/// One server session; the protocol driver runs as a spawned task until the
/// client half is dropped.
#[derive(Debug)]
pub struct PgSession {
    client: Option<Client>,
    driver: Option<JoinHandle<()>>,
}

impl PgSession {
    fn client(&self) -> Result<&Client> {
        match &self.client {
            Some(client) if !client.is_closed() => Ok(client),
            _ => Err(ConnectionError::Closed.into()),
        }
    }
}

#[async_trait]
impl Session for PgSession {
    async fn query(
        &mut self,
        sql: &str,
        params: &[Value],
    ) -> Result<QueryResult> {
        let client = self.client()?;
        let statement = client.prepare(sql).await?;
        let columns: Vec<String> = statement.columns().iter().map(|c| c.name().to_string()).collect();

        let bound: Vec<&(dyn ToSql + Sync)> = params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        let rows = client.query(&statement, &bound).await?;

        let mut decoded = Vec::with_capacity(rows.len());
        for row in rows {
            let mut cells = Vec::with_capacity(row.len());
            for i in 0..row.len() {
                cells.push(row.try_get::<_, Value>(i)?);
            }
            decoded.push(cells);
        }

        Ok(QueryResult { columns, rows: decoded })
    }

    async fn batch_execute(
        &mut self,
        sql: &str,
    ) -> Result<()> {
        self.client()?.batch_execute(sql).await?;
        Ok(())
    }

    fn close(&mut self) {
        // dropping the client sends Terminate; the driver then completes
        self.client.take();
        self.driver.take();
    }

    fn is_closed(&self) -> bool {
        self.client.as_ref().map(Client::is_closed).unwrap_or(true)
    }
}
