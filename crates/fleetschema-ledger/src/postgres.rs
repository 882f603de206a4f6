//! PostgresLedger — ledger kept in the target Postgres database.
//!
//! Each operation opens a short-lived connection, does its work and drops
//! it; nothing is held between heartbeat ticks. The bookkeeping tables and
//! functions come from the embedded `sql/base_schema.sql`.

use std::time::Duration;

use async_trait::async_trait;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, Config, NoTls};
use tracing::{debug, info, warn};

use crate::error::{LedgerError, LedgerResult};
use crate::ledger::{DatabaseProvisioner, SchemaLedger};
use crate::types::*;

/// Bookkeeping tables and routines, applied by the bootstrapper.
pub const BASE_SCHEMA: &str = include_str!("../sql/base_schema.sql");

/// Database used for server-level statements such as `CREATE DATABASE`.
const MAINTENANCE_DATABASE: &str = "postgres";

/// Ledger stored in a Postgres database.
#[derive(Clone)]
pub struct PostgresLedger {
    config: Config,
    database: String,
}

impl PostgresLedger {
    /// Build a ledger for `database` from a libpq-style connection string.
    ///
    /// Any database named in `url` is replaced by `database`.
    pub fn new(url: &str, database: &str) -> LedgerResult<Self> {
        let mut config: Config = url
            .parse()
            .map_err(|e: tokio_postgres::Error| LedgerError::Config(e.to_string()))?;
        config.dbname(database);
        Ok(Self {
            config,
            database: database.to_string(),
        })
    }

    async fn connect(&self) -> LedgerResult<Client> {
        connect_with(&self.config).await
    }

    async fn connect_maintenance(&self) -> LedgerResult<Client> {
        let mut config = self.config.clone();
        config.dbname(MAINTENANCE_DATABASE);
        connect_with(&config).await
    }

    async fn upsert_status(
        client: &Client,
        version: SchemaVersion,
        status: SchemaVersionStatus,
    ) -> LedgerResult<()> {
        client
            .execute(
                "SELECT upsert_schema_version($1, $2)",
                &[&version, &status.as_str()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }
}

async fn connect_with(config: &Config) -> LedgerResult<Client> {
    let (client, connection) = config
        .connect(NoTls)
        .await
        .map_err(|e| LedgerError::Connect(describe(&e)))?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!(error = %describe(&e), "postgres connection closed with error");
        }
    });

    Ok(client)
}

fn describe(e: &tokio_postgres::Error) -> String {
    match e.as_db_error() {
        Some(db) => format!("{}: {}", db.code().code(), db.message()),
        None => e.to_string(),
    }
}

fn query_err(e: tokio_postgres::Error) -> LedgerError {
    if is_missing_bookkeeping(&e) {
        LedgerError::MissingBaseSchema
    } else {
        LedgerError::Query(describe(&e))
    }
}

/// The bookkeeping function or table has not been created yet.
fn is_missing_bookkeeping(e: &tokio_postgres::Error) -> bool {
    matches!(
        e.code(),
        Some(code) if *code == SqlState::UNDEFINED_FUNCTION || *code == SqlState::UNDEFINED_TABLE
    )
}

/// Quote an identifier for interpolation into DDL.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[async_trait]
impl SchemaLedger for PostgresLedger {
    async fn current_schema_version(&self) -> LedgerResult<SchemaVersion> {
        let client = self.connect().await?;
        match client
            .query_one("SELECT select_current_schema_version()", &[])
            .await
        {
            Ok(row) => {
                let version: Option<i32> = row.try_get(0).map_err(query_err)?;
                Ok(version.unwrap_or(0))
            }
            Err(e) if is_missing_bookkeeping(&e) => {
                debug!("version bookkeeping absent, reporting version 0");
                Ok(0)
            }
            Err(e) => Err(query_err(e)),
        }
    }

    async fn execute_script_and_complete_version(
        &self,
        script: &str,
        version: SchemaVersion,
        is_full_snapshot: bool,
    ) -> LedgerResult<()> {
        let mut client = self.connect().await?;
        let existing = client
            .query_opt(
                "SELECT status FROM schema_version WHERE version = $1",
                &[&version],
            )
            .await
            .map_err(query_err)?;
        if let Some(row) = existing {
            let status: String = row.try_get(0).map_err(query_err)?;
            if status.parse::<SchemaVersionStatus>()? == SchemaVersionStatus::Completed {
                info!(version, database = %self.database, "version already completed, script skipped");
                return Ok(());
            }
        }
        if !is_full_snapshot {
            Self::upsert_status(&client, version, SchemaVersionStatus::Started).await?;
        }

        let outcome = async {
            let tx = client.transaction().await?;
            tx.batch_execute(script).await?;
            tx.execute(
                "SELECT upsert_schema_version($1, $2)",
                &[&version, &SchemaVersionStatus::Completed.as_str()],
            )
            .await?;
            tx.commit().await
        }
        .await;

        match outcome {
            Ok(()) => {
                info!(version, is_full_snapshot, database = %self.database, "schema version committed");
                Ok(())
            }
            Err(e) => {
                // Dropping the transaction above has already queued a ROLLBACK.
                let message = describe(&e);
                warn!(version, error = %message, "schema script rolled back");
                Self::upsert_status(&client, version, SchemaVersionStatus::Failed).await?;
                Err(LedgerError::Script { version, message })
            }
        }
    }

    async fn delete_version_record(
        &self,
        version: SchemaVersion,
        status: SchemaVersionStatus,
    ) -> LedgerResult<bool> {
        let client = self.connect().await?;
        let deleted = client
            .execute(
                "DELETE FROM schema_version WHERE version = $1 AND status = $2",
                &[&version, &status.as_str()],
            )
            .await
            .map_err(query_err)?;
        Ok(deleted > 0)
    }

    async fn version_records(&self) -> LedgerResult<Vec<SchemaVersionRecord>> {
        let client = self.connect().await?;
        let rows = match client
            .query("SELECT version, status FROM schema_version ORDER BY version", &[])
            .await
        {
            Ok(rows) => rows,
            Err(e) if is_missing_bookkeeping(&e) => return Ok(Vec::new()),
            Err(e) => return Err(query_err(e)),
        };

        rows.iter()
            .map(|row| {
                let version: i32 = row.try_get(0).map_err(query_err)?;
                let status: &str = row.try_get(1).map_err(query_err)?;
                Ok(SchemaVersionRecord {
                    version,
                    status: status.parse()?,
                })
            })
            .collect()
    }

    async fn base_schema_exists(&self) -> LedgerResult<bool> {
        let client = self.connect().await?;
        let row = client
            .query_one(
                "SELECT to_regprocedure('select_current_schema_version()') IS NOT NULL",
                &[],
            )
            .await
            .map_err(query_err)?;
        row.try_get(0).map_err(query_err)
    }

    async fn initialize_base_schema(&self) -> LedgerResult<()> {
        let client = self.connect().await?;
        client.batch_execute(BASE_SCHEMA).await.map_err(query_err)?;
        info!(database = %self.database, "base schema applied");
        Ok(())
    }

    async fn instance_registration_exists(&self) -> LedgerResult<bool> {
        let client = self.connect().await?;
        match client
            .query_one("SELECT EXISTS (SELECT 1 FROM instance_schema)", &[])
            .await
        {
            Ok(row) => row.try_get(0).map_err(query_err),
            Err(e) if is_missing_bookkeeping(&e) => Ok(false),
            Err(e) => Err(query_err(e)),
        }
    }

    async fn upsert_instance_registration(
        &self,
        name: &str,
        supported: VersionRange,
        ttl: Duration,
    ) -> LedgerResult<SchemaVersion> {
        let ttl_secs = i32::try_from(ttl.as_secs()).unwrap_or(i32::MAX);
        let client = self.connect().await?;
        let row = client
            .query_one(
                "SELECT upsert_instance_schema($1, $2, $3, $4)",
                &[&name, &supported.min(), &supported.max(), &ttl_secs],
            )
            .await
            .map_err(query_err)?;
        row.try_get(0).map_err(query_err)
    }

    async fn delete_expired_registrations(&self) -> LedgerResult<u64> {
        let client = self.connect().await?;
        let row = client
            .query_one("SELECT delete_expired_instance_schema()", &[])
            .await
            .map_err(query_err)?;
        let deleted: i32 = row.try_get(0).map_err(query_err)?;
        Ok(deleted.max(0) as u64)
    }

    async fn live_registrations(&self) -> LedgerResult<Vec<InstanceRegistration>> {
        let client = self.connect().await?;
        let rows = match client
            .query(
                "SELECT name, min_version, max_version, current_version, \
                 extract(epoch FROM expires_at)::bigint \
                 FROM instance_schema WHERE expires_at > now() ORDER BY name",
                &[],
            )
            .await
        {
            Ok(rows) => rows,
            Err(e) if is_missing_bookkeeping(&e) => return Ok(Vec::new()),
            Err(e) => return Err(query_err(e)),
        };

        rows.iter()
            .map(|row| {
                let expires_at: i64 = row.try_get(4).map_err(query_err)?;
                Ok(InstanceRegistration {
                    name: row.try_get(0).map_err(query_err)?,
                    min_supported_version: row.try_get(1).map_err(query_err)?,
                    max_supported_version: row.try_get(2).map_err(query_err)?,
                    current_version: row.try_get(3).map_err(query_err)?,
                    expires_at: expires_at.max(0) as u64,
                })
            })
            .collect()
    }
}

#[async_trait]
impl DatabaseProvisioner for PostgresLedger {
    fn database_name(&self) -> &str {
        &self.database
    }

    async fn database_exists(&self) -> LedgerResult<bool> {
        let client = self.connect_maintenance().await?;
        let row = client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)",
                &[&self.database],
            )
            .await
            .map_err(query_err)?;
        row.try_get(0).map_err(query_err)
    }

    async fn can_create_database(&self) -> LedgerResult<bool> {
        let client = self.connect_maintenance().await?;
        let row = client
            .query_one(
                "SELECT rolcreatedb OR rolsuper FROM pg_roles WHERE rolname = current_user",
                &[],
            )
            .await
            .map_err(query_err)?;
        row.try_get(0).map_err(query_err)
    }

    async fn create_database(&self) -> LedgerResult<()> {
        let client = self.connect_maintenance().await?;
        let statement = format!("CREATE DATABASE {}", quote_identifier(&self.database));
        client.batch_execute(&statement).await.map_err(query_err)?;
        info!(database = %self.database, "database created");
        Ok(())
    }
}
