// ABOUTME: PostgreSQL backend - tokio-postgres driven from a private runtime behind a blocking API
// ABOUTME: Rows stream from the server one at a time; TLS is used when sslmode asks for it

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures::StreamExt;
use postgres_native_tls::MakeTlsConnector;
use rust_decimal::Decimal;
use std::pin::Pin;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio_postgres::types::{FromSql, ToSql, Type};
use tokio_postgres::{Client, NoTls, Row, RowStream};

use super::{ColumnDescription, Connector, RowSource, SourceConnection, TableDescription};
use crate::config::{properties, SourceConfig};
use crate::error::ExtractorError;
use crate::types::{SqlParam, SqlValue, Statement};
use crate::utils::sanitize_url;

const DESCRIBE_COLUMNS: &str = "SELECT table_catalog::text, table_schema::text, table_name::text, \
     column_name::text, data_type::text, udt_name::text, column_default::text, is_identity::text \
     FROM information_schema.columns \
     WHERE lower(table_name) = lower($1::text) \
     AND lower(table_schema) = lower(COALESCE($2::text, current_schema()::text)) \
     ORDER BY ordinal_position";

// Redshift's information_schema predates identity columns.
const DESCRIBE_COLUMNS_REDSHIFT: &str = "SELECT table_catalog::text, table_schema::text, \
     table_name::text, column_name::text, data_type::text, udt_name::text, column_default::text, \
     'NO'::text \
     FROM information_schema.columns \
     WHERE lower(table_name) = lower($1::text) \
     AND lower(table_schema) = lower(COALESCE($2::text, current_schema()::text)) \
     ORDER BY ordinal_position";

/// Opens PostgreSQL (and Redshift) connections.
///
/// The engine is synchronous, so every connector owns a small tokio runtime
/// that drives the driver. Do not call into it from inside another runtime's
/// worker thread; use `spawn_blocking` there.
pub struct PostgresConnector {
    config: tokio_postgres::Config,
    tls: bool,
    redshift: bool,
    runtime: Arc<Runtime>,
}

impl PostgresConnector {
    pub fn accepts(normalized: &str) -> bool {
        ["postgresql:", "postgres:", "redshift:"]
            .iter()
            .any(|scheme| normalized.starts_with(scheme))
    }

    /// Parse the connection string and apply credentials. Does not connect.
    pub fn from_config(config: &SourceConfig) -> crate::Result<Self> {
        let url = postgres_url(&config.connection_string);
        let mut pg_config: tokio_postgres::Config = url.parse().map_err(|e| {
            ExtractorError::configuration(
                properties::CONNECTION_STRING,
                format!(
                    "Invalid PostgreSQL connection string '{}': {}",
                    sanitize_url(&config.connection_string),
                    e
                ),
            )
        })?;
        if let Some(user) = config.user.as_deref().filter(|u| !u.is_empty()) {
            pg_config.user(user);
        }
        if let Some(password) = config.password.as_deref().filter(|p| !p.is_empty()) {
            pg_config.password(password);
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("postgres-source")
            .enable_all()
            .build()
            .map_err(|e| ExtractorError::database("starting the PostgreSQL driver", e.into()))?;

        Ok(Self {
            config: pg_config,
            tls: requires_tls(&url),
            redshift: normalized_scheme_is_redshift(&config.connection_string),
            runtime: Arc::new(runtime),
        })
    }
}

fn normalized_scheme_is_redshift(connection_string: &str) -> bool {
    crate::utils::normalize_connection_string(connection_string).starts_with("redshift:")
}

/// Drop a `jdbc:` prefix and map `redshift://` onto the PostgreSQL scheme.
fn postgres_url(connection_string: &str) -> String {
    let trimmed = connection_string.trim();
    let without_jdbc = match trimmed.get(..5) {
        Some(prefix) if prefix.eq_ignore_ascii_case("jdbc:") => &trimmed[5..],
        _ => trimmed,
    };
    match without_jdbc.get(..9) {
        Some(prefix) if prefix.eq_ignore_ascii_case("redshift:") => {
            format!("postgresql:{}", &without_jdbc[9..])
        }
        _ => without_jdbc.to_string(),
    }
}

fn requires_tls(url: &str) -> bool {
    let lower = url.to_lowercase();
    ["sslmode=require", "sslmode=verify-ca", "sslmode=verify-full"]
        .iter()
        .any(|mode| lower.contains(mode))
}

impl Connector for PostgresConnector {
    fn connect(&self) -> Result<Box<dyn SourceConnection>> {
        let client = if self.tls {
            let connector = native_tls::TlsConnector::builder()
                .build()
                .context("Failed to build TLS connector")?;
            let (client, connection) = self
                .runtime
                .block_on(self.config.connect(MakeTlsConnector::new(connector)))
                .context("Failed to connect to PostgreSQL over TLS")?;
            self.runtime.spawn(async move {
                if let Err(e) = connection.await {
                    tracing::warn!("PostgreSQL connection closed with error: {}", e);
                }
            });
            client
        } else {
            let (client, connection) = self
                .runtime
                .block_on(self.config.connect(NoTls))
                .context("Failed to connect to PostgreSQL")?;
            self.runtime.spawn(async move {
                if let Err(e) = connection.await {
                    tracing::warn!("PostgreSQL connection closed with error: {}", e);
                }
            });
            client
        };

        Ok(Box::new(PostgresConnection {
            client,
            runtime: Arc::clone(&self.runtime),
            redshift: self.redshift,
        }))
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}

pub struct PostgresConnection {
    client: Client,
    runtime: Arc<Runtime>,
    redshift: bool,
}

/// Any value the typed conversions do not cover, as its raw wire bytes.
struct RawValue(Vec<u8>);

impl<'a> FromSql<'a> for RawValue {
    fn from_sql(
        _ty: &Type,
        raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        Ok(RawValue(raw.to_vec()))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

fn column_value(row: &Row, idx: usize, ty: &Type) -> Result<SqlValue> {
    let value = match *ty {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx)?.map(SqlValue::Bool),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)?
            .map(|v| SqlValue::Int(v.into())),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)?
            .map(|v| SqlValue::Int(v.into())),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx)?.map(SqlValue::Int),
        Type::OID => row
            .try_get::<_, Option<u32>>(idx)?
            .map(|v| SqlValue::Int(v.into())),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)?
            .map(|v| SqlValue::Float(v.into())),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx)?.map(SqlValue::Float),
        Type::NUMERIC => row
            .try_get::<_, Option<Decimal>>(idx)?
            .map(|d| SqlValue::Text(d.to_string())),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
            row.try_get::<_, Option<String>>(idx)?.map(SqlValue::Text)
        }
        Type::BYTEA => row.try_get::<_, Option<Vec<u8>>>(idx)?.map(SqlValue::Bytes),
        Type::DATE => row.try_get::<_, Option<NaiveDate>>(idx)?.map(SqlValue::Date),
        Type::TIME => row.try_get::<_, Option<NaiveTime>>(idx)?.map(SqlValue::Time),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(SqlValue::Timestamp),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map(SqlValue::TimestampTz),
        Type::UUID => row
            .try_get::<_, Option<uuid::Uuid>>(idx)?
            .map(|u| SqlValue::Text(u.to_string())),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(idx)?
            .map(|j| SqlValue::Text(j.to_string())),
        _ => row
            .try_get::<_, Option<RawValue>>(idx)?
            .map(|raw| SqlValue::Bytes(raw.0)),
    };
    Ok(value.unwrap_or(SqlValue::Null))
}

fn convert_row(row: &Row) -> Result<Vec<SqlValue>> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, column)| {
            column_value(row, idx, column.type_())
                .with_context(|| format!("Failed to read column '{}'", column.name()))
        })
        .collect()
}

fn to_pg_param(param: &SqlParam, ty: &Type) -> Box<dyn ToSql + Sync + Send> {
    match param {
        SqlParam::Int(v) => match *ty {
            Type::INT2 => Box::new((*v).clamp(i16::MIN.into(), i16::MAX.into()) as i16),
            Type::INT4 => Box::new((*v).clamp(i32::MIN.into(), i32::MAX.into()) as i32),
            Type::NUMERIC => Box::new(Decimal::from(*v)),
            _ => Box::new(*v),
        },
        SqlParam::Timestamp(ts) => match *ty {
            Type::TIMESTAMPTZ => Box::new(ts.and_utc()),
            _ => Box::new(*ts),
        },
    }
}

struct PostgresRows {
    columns: Vec<String>,
    stream: Pin<Box<RowStream>>,
    runtime: Arc<Runtime>,
}

impl RowSource for PostgresRows {
    fn column_names(&self) -> &[String] {
        &self.columns
    }

    fn next_row(&mut self) -> Result<Option<Vec<SqlValue>>> {
        match self.runtime.block_on(self.stream.next()) {
            Some(row) => {
                let row = row.context("Failed to fetch row")?;
                convert_row(&row).map(Some)
            }
            None => Ok(None),
        }
    }
}

impl SourceConnection for PostgresConnection {
    fn describe_table(
        &mut self,
        schema: Option<&str>,
        table: &str,
    ) -> Result<Option<TableDescription>> {
        let query = if self.redshift {
            DESCRIBE_COLUMNS_REDSHIFT
        } else {
            DESCRIBE_COLUMNS
        };
        let rows = self
            .runtime
            .block_on(self.client.query(query, &[&table, &schema]))
            .with_context(|| format!("Failed to read columns of '{}'", table))?;
        let Some(first) = rows.first() else {
            return Ok(None);
        };

        let catalog: Option<String> = first.try_get(0)?;
        let schema: Option<String> = first.try_get(1)?;
        let name: String = first.try_get(2)?;
        let columns = rows
            .iter()
            .map(|row| -> Result<ColumnDescription> {
                let data_type: String = row.try_get(4)?;
                let udt_name: String = row.try_get(5)?;
                let is_identity: Option<String> = row.try_get(7)?;
                // ARRAY and USER-DEFINED say nothing useful; the udt name does.
                let type_name = match data_type.as_str() {
                    "ARRAY" | "USER-DEFINED" => udt_name,
                    _ => data_type,
                };
                Ok(ColumnDescription {
                    name: row.try_get(3)?,
                    type_name,
                    default_value: row.try_get(6)?,
                    auto_increment: Some(is_identity.as_deref() == Some("YES")),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(TableDescription {
            catalog,
            schema,
            name,
            columns,
        }))
    }

    fn query(&mut self, statement: &Statement) -> Result<Box<dyn RowSource>> {
        tracing::trace!("PostgreSQL query: {}", statement.sql);
        let prepared = self
            .runtime
            .block_on(self.client.prepare(&statement.sql))
            .with_context(|| format!("Failed to prepare query: {}", statement.sql))?;

        let params: Vec<Box<dyn ToSql + Sync + Send>> = statement
            .params
            .iter()
            .zip(prepared.params())
            .map(|(param, ty)| to_pg_param(param, ty))
            .collect();
        let columns = prepared
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();

        let stream = self
            .runtime
            .block_on(
                self.client
                    .query_raw(&prepared, params.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync))),
            )
            .context("Failed to execute query")?;

        Ok(Box::new(PostgresRows {
            columns,
            stream: Box::pin(stream),
            runtime: Arc::clone(&self.runtime),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postgres_url() {
        assert_eq!(
            postgres_url("jdbc:postgresql://localhost:5432/shop"),
            "postgresql://localhost:5432/shop"
        );
        assert_eq!(
            postgres_url("redshift://cluster:5439/dev"),
            "postgresql://cluster:5439/dev"
        );
        assert_eq!(postgres_url(" postgres://h/db "), "postgres://h/db");
    }

    #[test]
    fn test_requires_tls() {
        assert!(requires_tls("postgresql://h/db?sslmode=require"));
        assert!(requires_tls("postgresql://h/db?SSLMODE=verify-full"));
        assert!(!requires_tls("postgresql://h/db?sslmode=prefer"));
        assert!(!requires_tls("postgresql://h/db"));
    }

    #[test]
    fn test_from_config_applies_credentials_without_connecting() {
        let config = SourceConfig::new("jdbc:postgresql://db.internal:6543/shop", "orders")
            .with_credentials("reader", "secret");
        let connector = PostgresConnector::from_config(&config).unwrap();
        assert_eq!(connector.config.get_user(), Some("reader"));
        assert_eq!(connector.config.get_password(), Some(&b"secret"[..]));
        assert!(!connector.tls);
        assert!(!connector.redshift);
    }

    #[test]
    fn test_from_config_rejects_garbage() {
        let config = SourceConfig::new("postgresql://host:notaport/db", "orders");
        let err = PostgresConnector::from_config(&config).err().unwrap();
        assert_eq!(err.property_errors()[0].property, properties::CONNECTION_STRING);
    }
}
