//! PgBouncer administration over its unix socket. The admin console speaks
//! the simple query protocol only, so every command goes through
//! `simple_query`/`batch_execute` on a short-lived connection.

use std::io::Write;

use anyhow::Context;
use camino::Utf8PathBuf;
use tokio_postgres::{NoTls, SimpleQueryMessage};
use tracing::debug;

/// Error code PgBouncer returns when asked to PAUSE/RESUME while already in
/// the requested state. Both conditions are successes for our purposes.
const POOLER_ERROR_CODE: &str = "08P01";
const ALREADY_PAUSED: &str = "already suspended/paused";
const ALREADY_RESUMED: &str = "pooler is not paused/suspended";

/// Placeholder in the config template that takes the primary's address.
const HOST_PLACEHOLDER: &str = "{Host}";

#[derive(Debug, Clone)]
pub struct AdminOptions {
    pub user: String,
    pub password: String,
    pub database: String,
    pub socket_dir: Utf8PathBuf,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct PgBouncer {
    pub config_file: Utf8PathBuf,
    pub config_template_file: Utf8PathBuf,
    pub admin: AdminOptions,
}

/// One row of `SHOW DATABASES`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolerDatabase {
    pub name: String,
    pub host: String,
    pub port: String,
    pub current_connections: i64,
}

impl PgBouncer {
    /// Renders the config template with the given host and atomically
    /// replaces the config file, so a concurrently starting PgBouncer never
    /// reads a half-written config.
    pub fn generate_config(&self, host: &str) -> anyhow::Result<()> {
        let template = std::fs::read_to_string(&self.config_template_file)
            .context("failed to read PgBouncer config template file")?;
        let rendered = template.replace(HOST_PLACEHOLDER, host);

        let config_dir = self
            .config_file
            .parent()
            .context("config file has no parent directory")?;
        let mut staged = tempfile::NamedTempFile::new_in(config_dir)
            .context("failed to create staging file for PgBouncer config")?;
        staged
            .write_all(rendered.as_bytes())
            .context("failed to write PgBouncer config")?;
        staged
            .persist(&self.config_file)
            .context("failed to replace PgBouncer config")?;

        Ok(())
    }

    /// Buffers new queries while waiting for in-flight ones to finish.
    /// Success if PgBouncer is already paused.
    pub async fn pause(&self) -> anyhow::Result<()> {
        match self.execute("PAUSE;").await {
            Err(err) if is_pooler_noop(&err, ALREADY_PAUSED) => Ok(()),
            result => result.context("failed to pause PgBouncer"),
        }
    }

    /// Lifts any pause. Success if PgBouncer is not paused.
    pub async fn resume(&self) -> anyhow::Result<()> {
        match self.execute("RESUME;").await {
            Err(err) if is_pooler_noop(&err, ALREADY_RESUMED) => Ok(()),
            result => result.context("failed to resume PgBouncer"),
        }
    }

    /// Rejects new client connections on the given databases, defaulting to
    /// every database except the admin console's.
    pub async fn disable(&self, databases: &[String]) -> anyhow::Result<()> {
        let databases = if databases.is_empty() {
            self.show_databases()
                .await?
                .into_iter()
                .map(|db| db.name)
                .filter(|name| name != &self.admin.database)
                .collect()
        } else {
            databases.to_vec()
        };

        for database in databases {
            self.execute(&format!("DISABLE {database};"))
                .await
                .with_context(|| format!("failed to disable database {database}"))?;
        }

        Ok(())
    }

    /// Asks PgBouncer to reread its config and apply setting changes live.
    pub async fn reload(&self) -> anyhow::Result<()> {
        self.execute("RELOAD;")
            .await
            .context("failed to reload PgBouncer")
    }

    /// The most basic of liveness probes against the admin console.
    pub async fn connect(&self) -> anyhow::Result<()> {
        self.execute("SHOW VERSION;")
            .await
            .context("failed to connect to PgBouncer")
    }

    /// `SHOW DATABASES`, with columns resolved by name. The console makes no
    /// guarantee about column ordering across versions.
    pub async fn show_databases(&self) -> anyhow::Result<Vec<PoolerDatabase>> {
        let client = self.client().await.context("failed to connect to PgBouncer")?;
        let messages = client
            .simple_query("SHOW DATABASES;")
            .await
            .context("SHOW DATABASES failed")?;

        let mut databases = Vec::new();
        for message in messages {
            let SimpleQueryMessage::Row(row) = message else {
                continue;
            };

            let column = |name: &str| {
                row.columns()
                    .iter()
                    .position(|c| c.name() == name)
                    .with_context(|| format!("SHOW DATABASES has no column {name}"))
            };

            databases.push(PoolerDatabase {
                name: row.get(column("name")?).unwrap_or_default().to_string(),
                host: row.get(column("host")?).unwrap_or_default().to_string(),
                port: row.get(column("port")?).unwrap_or_default().to_string(),
                current_connections: row
                    .get(column("current_connections")?)
                    .unwrap_or("0")
                    .parse()
                    .context("current_connections is not a number")?,
            });
        }

        Ok(databases)
    }

    async fn execute(&self, statement: &str) -> Result<(), tokio_postgres::Error> {
        let client = self.client().await?;
        client.batch_execute(statement).await
    }

    async fn client(&self) -> Result<tokio_postgres::Client, tokio_postgres::Error> {
        let (client, connection) = tokio_postgres::Config::new()
            .user(&self.admin.user)
            .password(&self.admin.password)
            .dbname(&self.admin.database)
            .host_path(self.admin.socket_dir.as_std_path())
            .port(self.admin.port)
            .connect(NoTls)
            .await?;

        // The driver ends when the client is dropped; anything it reports
        // after that is connection teardown noise.
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                debug!("PgBouncer admin connection error: {err}");
            }
        });

        Ok(client)
    }
}

fn is_pooler_noop(err: &tokio_postgres::Error, expected_message: &str) -> bool {
    err.as_db_error()
        .is_some_and(|db| is_pooler_noop_parts(db.code().code(), db.message(), expected_message))
}

fn is_pooler_noop_parts(code: &str, message: &str, expected_message: &str) -> bool {
    code == POOLER_ERROR_CODE && message == expected_message
}
