//! PostgreSQL backend adapter.

use std::collections::HashMap;

use bytes::BytesMut;
use postgres::types::{IsNull, ToSql, Type, to_sql_checked};
use snafu::{ResultExt, ensure};

use crate::config::BackendConfig;
use crate::db::{
    BackendTypes, DbAdapter, DbError, InvalidIdentifierSnafu, PrivilegeDeniedSnafu,
    TypeMismatchSnafu, UnknownTableSnafu, ValueCountSnafu, VectorJsonSnafu, create_table_sql,
    insert_sql, marshal,
};
use crate::schema::{METADATA_FIELDS, NMETA, Schema, valid_identifier};
use crate::uri::resolve_service;
use crate::value::{Value, ValueKind};

/// Allocation floor for the scratch slots; wide enough for any rendered
/// 64-bit integer.
const MAX_DIGITS: usize = 32;

const DEFAULT_PORT: u16 = 5432;

/// The maintenance database used to probe for and create experiment
/// databases.
const ADMIN_DB: &str = "postgres";

const METADATA_DDL: &str =
    "CREATE TABLE IF NOT EXISTS _experiment_metadata (id SERIAL PRIMARY KEY, key TEXT, value TEXT);";
const SENDERS_DDL: &str =
    "CREATE TABLE IF NOT EXISTS _senders (id SERIAL PRIMARY KEY, name TEXT);";

/// PostgreSQL typemap. Unsigned kinds are promoted to the next signed
/// width; `uint64` shares the 64-bit column, so values above `i64::MAX`
/// round-trip as negative. Vectors are stored as JSON text.
///
/// Order matters: backend-to-kind lookups return the first match, so
/// `INT4` reads back as `long`.
const TYPEMAP: &[(ValueKind, &str, usize)] = &[
    (ValueKind::Long, "INT4", 4),
    (ValueKind::Double, "FLOAT8", 8),
    (ValueKind::String, "TEXT", 0),
    (ValueKind::Blob, "BYTEA", 0),
    (ValueKind::Int32, "INT4", 4),
    (ValueKind::UInt32, "INT8", 8),
    (ValueKind::Int64, "INT8", 8),
    (ValueKind::UInt64, "BIGINT", 8),
    (ValueKind::Guid, "BIGINT", 8),
    (ValueKind::Bool, "BOOLEAN", 1),
    (ValueKind::VectorDouble, "TEXT", 0),
    (ValueKind::VectorInt32, "TEXT", 0),
    (ValueKind::VectorUInt32, "TEXT", 0),
    (ValueKind::VectorInt64, "TEXT", 0),
    (ValueKind::VectorUInt64, "TEXT", 0),
    (ValueKind::VectorBool, "TEXT", 0),
];

/// The connection-free half of the PostgreSQL backend.
#[derive(Clone, Copy, Debug)]
pub struct PsqlTypes;

impl BackendTypes for PsqlTypes {
    fn backend_name(&self) -> &'static str {
        "psql"
    }

    fn kind_to_backend(&self, kind: ValueKind) -> &'static str {
        TYPEMAP
            .iter()
            .find(|(k, _, _)| *k == kind)
            .map_or("TEXT", |(_, name, _)| name)
    }

    fn backend_to_kind(&self, name: &str) -> Option<ValueKind> {
        TYPEMAP
            .iter()
            .find(|(_, n, _)| n.eq_ignore_ascii_case(name))
            .map(|(kind, _, _)| *kind)
    }

    fn kind_size(&self, kind: ValueKind) -> usize {
        TYPEMAP
            .iter()
            .find(|(k, _, _)| *k == kind)
            .map_or(0, |(_, _, size)| *size)
    }

    fn primary_key_type(&self) -> &'static str {
        "SERIAL PRIMARY KEY"
    }

    fn prepared_var(&self, order: usize) -> String {
        format!("${order}")
    }
}

/// A raw binary parameter: the scratch slot already holds the backend wire
/// encoding for the column type, so it is copied out verbatim.
#[derive(Debug)]
struct RawParam<'a> {
    bytes: &'a [u8],
}

impl ToSql for RawParam<'_> {
    fn to_sql(
        &self,
        _ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        out.extend_from_slice(self.bytes);
        Ok(IsNull::No)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn stmt_err(source: postgres::Error) -> DbError {
    DbError::TransactionAborted { source }
}

fn quote_conninfo(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn connect(config: &BackendConfig, dbname: &str) -> Result<postgres::Client, DbError> {
    let dest = format!("{}:{}/{}", config.host, config.port, dbname);
    let conninfo = format!(
        "host='{}' port='{}' user='{}' password='{}' dbname='{}' {}",
        quote_conninfo(&config.host),
        resolve_service(&config.port, DEFAULT_PORT),
        quote_conninfo(&config.user),
        quote_conninfo(&config.pass),
        quote_conninfo(dbname),
        config.conninfo_extra,
    );
    let mut pg: postgres::Config =
        conninfo
            .parse()
            .map_err(|source| DbError::ConnectionFailed {
                dest: dest.clone(),
                source,
            })?;

    let channel = dbname.to_owned();
    pg.notice_callback(move |notice| match notice.severity() {
        "ERROR" | "FATAL" | "PANIC" => {
            error!(message = "Backend notice.", database = %channel, notice = %notice.message());
        }
        "WARNING" => {
            warn!(message = "Backend notice.", database = %channel, notice = %notice.message());
        }
        _ => {
            debug!(message = "Backend notice.", database = %channel, notice = %notice.message());
        }
    });

    pg.connect(postgres::NoTls)
        .map_err(|source| DbError::ConnectionFailed { dest, source })
}

/// Start-up check: the backend is reachable and the configured role can
/// create databases. Both failures are fatal to the collector.
pub fn backend_setup(config: &BackendConfig) -> Result<(), DbError> {
    info!(
        message = "Sending experiment data to PostgreSQL.",
        host = %config.host,
        port = %config.port,
        user = %config.user,
    );
    let mut client = connect(config, ADMIN_DB)?;
    let row = client
        .query_opt(
            "SELECT rolcreatedb FROM pg_roles WHERE rolname=$1",
            &[&config.user],
        )
        .map_err(stmt_err)?;
    match row {
        Some(row) if row.get::<_, bool>(0) => {
            debug!(message = "Role has CREATE DATABASE privileges.", user = %config.user);
            Ok(())
        }
        _ => PrivilegeDeniedSnafu {
            user: config.user.clone(),
        }
        .fail(),
    }
}

/// Opens or creates the named experiment database and returns a connected
/// adapter with the sidecar tables in place.
pub fn connect_database(config: &BackendConfig, name: &str) -> Result<PsqlAdapter, DbError> {
    ensure!(valid_identifier(name), InvalidIdentifierSnafu { name });

    let mut maintenance = connect(config, ADMIN_DB)?;
    let exists = maintenance
        .query_opt("SELECT datname FROM pg_database WHERE datname=$1", &[&name])
        .map_err(stmt_err)?;
    if exists.is_none() {
        info!(message = "Database does not exist; creating it.", database = %name);
        maintenance
            .batch_execute(&format!("CREATE DATABASE \"{name}\";"))
            .map_err(stmt_err)?;
    }
    drop(maintenance);

    let mut client = connect(config, name)?;
    // The metadata sidecar must exist before any user table does.
    client.batch_execute(METADATA_DDL).map_err(stmt_err)?;
    client.batch_execute(SENDERS_DDL).map_err(stmt_err)?;

    Ok(PsqlAdapter {
        client,
        name: name.to_owned(),
        config: config.clone(),
        tables: HashMap::new(),
    })
}

struct PsqlTable {
    insert_name: String,
    insert_sql: String,
    statement: Option<postgres::Statement>,
    /// One preallocated scratch slot per column; strings and blobs grow on
    /// demand and stay grown.
    slots: Vec<BytesMut>,
}

pub struct PsqlAdapter {
    client: postgres::Client,
    name: String,
    config: BackendConfig,
    tables: HashMap<String, PsqlTable>,
}

impl BackendTypes for PsqlAdapter {
    fn backend_name(&self) -> &'static str {
        PsqlTypes.backend_name()
    }

    fn kind_to_backend(&self, kind: ValueKind) -> &'static str {
        PsqlTypes.kind_to_backend(kind)
    }

    fn backend_to_kind(&self, name: &str) -> Option<ValueKind> {
        PsqlTypes.backend_to_kind(name)
    }

    fn kind_size(&self, kind: ValueKind) -> usize {
        PsqlTypes.kind_size(kind)
    }

    fn primary_key_type(&self) -> &'static str {
        PsqlTypes.primary_key_type()
    }

    fn prepared_var(&self, order: usize) -> String {
        PsqlTypes.prepared_var(order)
    }
}

impl DbAdapter for PsqlAdapter {
    fn stmt(&mut self, sql: &str) -> Result<(), DbError> {
        trace!(message = "Executing statement.", database = %self.name, sql = %sql);
        self.client.batch_execute(sql).map_err(stmt_err)
    }

    fn table_create(&mut self, schema: &Schema, shallow: bool) -> Result<(), DbError> {
        debug!(
            message = "Creating table.",
            database = %self.name,
            table = %schema.name,
            shallow = %shallow,
        );
        if self.tables.contains_key(&schema.name) {
            warn!(
                message = "BUG: recreating table handle.",
                database = %self.name,
                table = %schema.name,
            );
        }

        if !shallow {
            let ddl = create_table_sql(schema, &PsqlTypes);
            self.client.batch_execute(&ddl).map_err(stmt_err)?;
        }

        let insert = insert_sql(schema, &PsqlTypes);
        let insert_name = format!("OMLInsert-{}", schema.name);
        debug!(
            message = "Preparing insert statement.",
            database = %self.name,
            statement = %insert_name,
            sql = %insert,
        );
        let statement = self.client.prepare(&insert).map_err(stmt_err)?;

        let mut slots = Vec::with_capacity(NMETA + schema.fields.len());
        for (_, kind) in METADATA_FIELDS {
            slots.push(BytesMut::with_capacity(
                PsqlTypes.kind_size(kind).max(MAX_DIGITS),
            ));
        }
        for field in &schema.fields {
            slots.push(BytesMut::with_capacity(
                PsqlTypes.kind_size(field.kind).max(MAX_DIGITS),
            ));
        }

        self.tables.insert(
            schema.name.clone(),
            PsqlTable {
                insert_name,
                insert_sql: insert,
                statement: Some(statement),
                slots,
            },
        );
        Ok(())
    }

    fn table_free(&mut self, table: &str) {
        self.tables.remove(table);
    }

    fn clear_prepared(&mut self) {
        for table in self.tables.values_mut() {
            table.statement = None;
        }
    }

    fn insert(
        &mut self,
        schema: &Schema,
        sender_id: i32,
        seq_no: i32,
        time_client: f64,
        time_server: f64,
        values: &[Value],
    ) -> Result<(), DbError> {
        let Some(table) = self.tables.get_mut(&schema.name) else {
            return UnknownTableSnafu {
                table: schema.name.clone(),
            }
            .fail();
        };
        ensure!(
            values.len() == schema.fields.len(),
            ValueCountSnafu {
                table: schema.name.clone(),
                expected: schema.fields.len(),
                got: values.len(),
            }
        );

        marshal::put_i32(&mut table.slots[0], sender_id);
        marshal::put_i32(&mut table.slots[1], seq_no);
        marshal::put_f64(&mut table.slots[2], time_client);
        marshal::put_f64(&mut table.slots[3], time_server);

        for (index, (value, field)) in values.iter().zip(&schema.fields).enumerate() {
            ensure!(
                value.kind() == field.kind,
                TypeMismatchSnafu {
                    table: schema.name.clone(),
                    column: field.name.clone(),
                    index,
                    expected: field.kind,
                    found: value.kind(),
                }
            );
            let slot = &mut table.slots[NMETA + index];
            match value {
                Value::Long(v) | Value::Int32(v) => marshal::put_i32(slot, *v),
                Value::UInt32(v) => marshal::put_u32(slot, *v),
                Value::Int64(v) => marshal::put_i64(slot, *v),
                Value::UInt64(v) | Value::Guid(v) => marshal::put_u64(slot, *v),
                Value::Double(v) => marshal::put_f64(slot, *v),
                Value::Bool(v) => marshal::put_bool(slot, *v),
                Value::String(v) => marshal::put_text(slot, v),
                Value::Blob(v) => marshal::put_blob(slot, v),
                Value::VectorDouble(v) => {
                    marshal::put_json_vector(slot, v).context(VectorJsonSnafu)?;
                }
                Value::VectorInt32(v) => {
                    marshal::put_json_vector(slot, v).context(VectorJsonSnafu)?;
                }
                Value::VectorUInt32(v) => {
                    marshal::put_json_vector(slot, v).context(VectorJsonSnafu)?;
                }
                Value::VectorInt64(v) => {
                    marshal::put_json_vector(slot, v).context(VectorJsonSnafu)?;
                }
                Value::VectorUInt64(v) => {
                    marshal::put_json_vector(slot, v).context(VectorJsonSnafu)?;
                }
                Value::VectorBool(v) => {
                    marshal::put_json_vector(slot, v).context(VectorJsonSnafu)?;
                }
            }
        }

        let statement = match table.statement.clone() {
            Some(statement) => statement,
            None => {
                debug!(
                    message = "Re-preparing insert statement.",
                    database = %self.name,
                    statement = %table.insert_name,
                );
                let prepared = self.client.prepare(&table.insert_sql).map_err(stmt_err)?;
                table.statement = Some(prepared.clone());
                prepared
            }
        };

        let params: Vec<RawParam<'_>> = table
            .slots
            .iter()
            .map(|slot| RawParam { bytes: slot })
            .collect();
        let refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        if let Err(source) = self.client.execute(&statement, &refs) {
            error!(
                message = "Insert failed; dropping the row.",
                database = %self.name,
                table = %schema.name,
                error = %source,
            );
            return Err(stmt_err(source));
        }
        Ok(())
    }

    fn add_sender_id(&mut self, name: &str) -> Result<i32, DbError> {
        if let Some(row) = self
            .client
            .query_opt("SELECT id FROM _senders WHERE name=$1", &[&name])
            .map_err(stmt_err)?
        {
            return Ok(row.get(0));
        }

        let row = self
            .client
            .query_one("SELECT MAX(id) FROM _senders", &[])
            .map_err(stmt_err)?;
        let id = row.get::<_, Option<i32>>(0).map_or(0, |max| max + 1);
        self.client
            .execute(
                "INSERT INTO _senders (name, id) VALUES ($1, $2)",
                &[&name, &id],
            )
            .map_err(stmt_err)?;
        debug!(message = "Allocated sender id.", database = %self.name, sender = %name, id = %id);
        Ok(id)
    }

    fn get_metadata(&mut self, key: &str) -> Result<Option<String>, DbError> {
        let rows = self
            .client
            .query("SELECT value FROM _experiment_metadata WHERE key=$1", &[&key])
            .map_err(stmt_err)?;
        if rows.len() > 1 {
            warn!(
                message = "Metadata lookup matched more than one row.",
                database = %self.name,
                key = %key,
            );
        }
        Ok(rows.first().map(|row| row.get(0)))
    }

    fn set_metadata(&mut self, key: &str, value: &str) -> Result<(), DbError> {
        if self.get_metadata(key)?.is_some() {
            self.client
                .execute(
                    "UPDATE _experiment_metadata SET value=$1 WHERE key=$2",
                    &[&value, &key],
                )
                .map_err(stmt_err)?;
        } else {
            self.client
                .execute(
                    "INSERT INTO _experiment_metadata (key, value) VALUES ($1, $2)",
                    &[&key, &value],
                )
                .map_err(stmt_err)?;
        }
        Ok(())
    }

    fn uri(&self) -> String {
        format!(
            "postgresql://{}@{}:{}/{}",
            self.config.user,
            self.config.host,
            resolve_service(&self.config.port, DEFAULT_PORT),
            self.name,
        )
    }

    fn table_list(&mut self) -> Result<Vec<Schema>, DbError> {
        let rows = self
            .client
            .query(
                "SELECT tablename FROM pg_tables \
                 WHERE tablename NOT LIKE 'pg%' AND tablename NOT LIKE 'sql%'",
                &[],
            )
            .map_err(stmt_err)?;
        let names: Vec<String> = rows.iter().map(|row| row.get(0)).collect();

        if !names.iter().any(|name| name == "_experiment_metadata") {
            debug!(
                message = "No metadata sidecar found; assuming a fresh database.",
                database = %self.name,
            );
            return Ok(Vec::new());
        }

        let mut schemas = Vec::new();
        for name in names {
            if name == "_senders" || name == "_experiment_metadata" {
                continue;
            }
            match self.get_metadata(&format!("table_{name}"))? {
                None => {
                    warn!(
                        message = "No stored schema for table; ignoring it.",
                        database = %self.name,
                        table = %name,
                    );
                }
                Some(text) => match Schema::parse(&text) {
                    Ok(schema) => schemas.push(schema),
                    Err(error) => {
                        warn!(
                            message = "Could not parse stored schema; ignoring table.",
                            database = %self.name,
                            table = %name,
                            stored = %text,
                            %error,
                        );
                    }
                },
            }
        }
        Ok(schemas)
    }

    fn release(&mut self) {
        self.tables.clear();
        debug!(message = "Backend released.", database = %self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::{PsqlTypes, quote_conninfo};
    use crate::db::BackendTypes;
    use crate::value::{ALL_KINDS, ValueKind};

    #[test]
    fn typemap_is_total() {
        for kind in ALL_KINDS {
            assert!(!PsqlTypes.kind_to_backend(kind).is_empty());
        }
    }

    #[test]
    fn unsigned_kinds_are_promoted() {
        assert_eq!(PsqlTypes.kind_to_backend(ValueKind::UInt32), "INT8");
        assert_eq!(PsqlTypes.kind_to_backend(ValueKind::UInt64), "BIGINT");
        assert_eq!(PsqlTypes.kind_size(ValueKind::UInt32), 8);
    }

    #[test]
    fn vectors_are_stored_as_text() {
        assert_eq!(PsqlTypes.kind_to_backend(ValueKind::VectorDouble), "TEXT");
        assert_eq!(PsqlTypes.kind_size(ValueKind::VectorInt64), 0);
    }

    #[test]
    fn backend_type_lookup_returns_the_first_match() {
        // INT4 is both `long` and `int32`; the legacy tag wins.
        assert_eq!(PsqlTypes.backend_to_kind("INT4"), Some(ValueKind::Long));
        assert_eq!(PsqlTypes.backend_to_kind("int4"), Some(ValueKind::Long));
        assert_eq!(PsqlTypes.backend_to_kind("FLOAT8"), Some(ValueKind::Double));
        assert_eq!(PsqlTypes.backend_to_kind("JSONB"), None);
    }

    #[test]
    fn placeholders_are_dollar_numbered() {
        assert_eq!(PsqlTypes.prepared_var(1), "$1");
        assert_eq!(PsqlTypes.prepared_var(12), "$12");
    }

    #[test]
    fn conninfo_values_are_escaped() {
        assert_eq!(quote_conninfo("plain"), "plain");
        assert_eq!(quote_conninfo("it's"), "it\\'s");
        assert_eq!(quote_conninfo("back\\slash"), "back\\\\slash");
    }
}
