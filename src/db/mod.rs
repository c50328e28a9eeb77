//! Backend-neutral database layer.
//!
//! A [`Database`] is the per-experiment namespace: it owns a backend
//! adapter, the set of tables created so far, and the wall-clock commit
//! window. The backend itself is reached through the [`DbAdapter`]
//! capability set; only the PostgreSQL adapter ships today, but everything
//! in this module is backend-agnostic.

mod marshal;
pub mod psql;

use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use snafu::{Snafu, ensure};

use crate::schema::{METADATA_FIELDS, Schema};
use crate::value::{Value, ValueKind};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DbError {
    #[snafu(display("could not connect to the backend at {dest}: {source}"))]
    ConnectionFailed {
        dest: String,
        source: postgres::Error,
    },
    #[snafu(display("role {user:?} lacks CREATE DATABASE privileges"))]
    PrivilegeDenied { user: String },
    #[snafu(display("invalid database or table identifier {name:?}"))]
    InvalidIdentifier { name: String },
    #[snafu(display("statement failed, transaction aborted: {source}"))]
    TransactionAborted { source: postgres::Error },
    #[snafu(display(
        "value {index} has kind {found} but column {column:?} of {table:?} is {expected}"
    ))]
    TypeMismatch {
        table: String,
        column: String,
        index: usize,
        expected: ValueKind,
        found: ValueKind,
    },
    #[snafu(display("table {table:?} exists with a different schema"))]
    SchemaConflict { table: String },
    #[snafu(display("row for {table:?} has {got} values, its schema has {expected}"))]
    ValueCount {
        table: String,
        expected: usize,
        got: usize,
    },
    #[snafu(display("table {table:?} was never created"))]
    UnknownTable { table: String },
    #[snafu(display("could not serialise vector value: {source}"))]
    VectorJson { source: serde_json::Error },
}

/// The pure, connection-free part of a backend: its typemap and placeholder
/// syntax.
pub trait BackendTypes {
    fn backend_name(&self) -> &'static str;

    /// Column type for a value kind.
    fn kind_to_backend(&self, kind: ValueKind) -> &'static str;

    /// Value kind for a column type name, if the backend knows it.
    fn backend_to_kind(&self, name: &str) -> Option<ValueKind>;

    /// Fixed storage size of a kind, or 0 for variable-length kinds.
    fn kind_size(&self, kind: ValueKind) -> usize;

    /// Column type of the backend-assigned primary key.
    fn primary_key_type(&self) -> &'static str;

    /// Placeholder token for the 1-based parameter `order`.
    fn prepared_var(&self, order: usize) -> String;
}

/// The capability set a storage backend provides to the collector.
///
/// All entry points take the adapter exclusively; callers serialise on the
/// owning [`Database`]'s mutex.
pub trait DbAdapter: BackendTypes + Send {
    /// Executes a plain statement (transaction control, DDL).
    fn stmt(&mut self, sql: &str) -> Result<(), DbError>;

    /// Creates the physical table unless `shallow`, and always sets up the
    /// per-table insert machinery (scratch slots, prepared statement).
    fn table_create(&mut self, schema: &Schema, shallow: bool) -> Result<(), DbError>;

    /// Drops the per-table handles; the physical table stays.
    fn table_free(&mut self, table: &str);

    /// Drops every cached prepared statement; they are re-prepared lazily.
    fn clear_prepared(&mut self);

    /// Appends one row through the table's prepared statement.
    fn insert(
        &mut self,
        schema: &Schema,
        sender_id: i32,
        seq_no: i32,
        time_client: f64,
        time_server: f64,
        values: &[Value],
    ) -> Result<(), DbError>;

    fn add_sender_id(&mut self, name: &str) -> Result<i32, DbError>;

    fn get_metadata(&mut self, key: &str) -> Result<Option<String>, DbError>;

    fn set_metadata(&mut self, key: &str, value: &str) -> Result<(), DbError>;

    /// Renders `scheme://user@host:port/name` for this database.
    fn uri(&self) -> String;

    /// Reconstructs the schemas of all user tables from the metadata
    /// sidecar.
    fn table_list(&mut self) -> Result<Vec<Schema>, DbError>;

    /// Ends the session. Idempotent.
    fn release(&mut self);
}

/// Builds the `CREATE TABLE` statement for a schema: backend-assigned
/// primary key, the four implicit metadata columns, then the user columns.
pub(crate) fn create_table_sql(schema: &Schema, types: &dyn BackendTypes) -> String {
    let mut sql = format!(
        "CREATE TABLE \"{}\" (oml_tuple_id {}",
        schema.name,
        types.primary_key_type()
    );
    for (name, kind) in METADATA_FIELDS {
        let _ = write!(sql, ", {} {}", name, types.kind_to_backend(kind));
    }
    for field in &schema.fields {
        let _ = write!(sql, ", \"{}\" {}", field.name, types.kind_to_backend(field.kind));
    }
    sql.push_str(");");
    sql
}

/// Builds the placeholdered `INSERT` statement for a schema.
pub(crate) fn insert_sql(schema: &Schema, types: &dyn BackendTypes) -> String {
    let mut sql = format!("INSERT INTO \"{}\" (", schema.name);
    let mut order = 0;
    for (name, _) in METADATA_FIELDS {
        if order > 0 {
            sql.push_str(", ");
        }
        sql.push_str(name);
        order += 1;
    }
    for field in &schema.fields {
        let _ = write!(sql, ", \"{}\"", field.name);
        order += 1;
    }
    sql.push_str(") VALUES (");
    for i in 1..=order {
        if i > 1 {
            sql.push_str(", ");
        }
        sql.push_str(&types.prepared_var(i));
    }
    sql.push_str(");");
    sql
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}

/// A per-experiment database: one backend connection, the created tables,
/// and the commit window.
pub struct Database {
    name: String,
    adapter: Box<dyn DbAdapter>,
    /// Tables created in this session, by name.
    tables: HashMap<String, Schema>,
    /// Tables known from a previous run, reconstructed from the sidecar.
    known: HashMap<String, Schema>,
    /// Experiment epoch, in unix seconds; `oml_ts_server` is relative to it.
    start_time: f64,
    last_commit: Instant,
    commit_interval: Duration,
    closed: bool,
}

impl Database {
    /// Opens the database over an already-connected adapter: restores the
    /// experiment epoch and known tables, then begins the first transaction.
    pub fn open(
        name: impl Into<String>,
        mut adapter: Box<dyn DbAdapter>,
        commit_interval: Duration,
    ) -> Result<Self, DbError> {
        let name = name.into();
        info!(
            message = "Accessing database.",
            database = %name,
            backend = %adapter.backend_name(),
        );

        let start_time = match adapter.get_metadata("start_time")? {
            Some(text) => match text.parse() {
                Ok(epoch) => epoch,
                Err(_) => {
                    warn!(
                        message = "Stored start_time is unreadable; restarting the epoch.",
                        database = %name,
                        stored = %text,
                    );
                    let now = unix_now();
                    adapter.set_metadata("start_time", &format!("{now:.0}"))?;
                    now
                }
            },
            None => {
                let now = unix_now();
                adapter.set_metadata("start_time", &format!("{now:.0}"))?;
                now
            }
        };

        let known = adapter
            .table_list()?
            .into_iter()
            .map(|schema| (schema.name.clone(), schema))
            .collect();

        adapter.stmt("BEGIN;")?;

        Ok(Self {
            name,
            adapter,
            tables: HashMap::new(),
            known,
            start_time,
            last_commit: Instant::now(),
            commit_interval,
            closed: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    pub fn uri(&self) -> String {
        self.adapter.uri()
    }

    /// Binds `schema` to a table, creating it on first reference.
    ///
    /// A table already present (from this run or a previous one) must match
    /// the incoming schema exactly; anything else is a conflict and the
    /// stream is rejected.
    pub fn table(&mut self, schema: &Schema) -> Result<(), DbError> {
        if let Some(existing) = self.tables.get(&schema.name) {
            ensure!(
                existing == schema,
                SchemaConflictSnafu {
                    table: schema.name.clone()
                }
            );
            return Ok(());
        }

        let shallow = match self.known.get(&schema.name) {
            Some(stored) => {
                ensure!(
                    stored == schema,
                    SchemaConflictSnafu {
                        table: schema.name.clone()
                    }
                );
                true
            }
            None => false,
        };

        // DDL and prepares are transaction-sensitive; start from a clean one.
        self.reopen_transaction();
        self.adapter.table_create(schema, shallow)?;
        if !shallow {
            self.adapter
                .set_metadata(&schema.metadata_key(), &schema.to_string())?;
        }
        self.tables.insert(schema.name.clone(), schema.clone());
        Ok(())
    }

    /// Appends one tuple. `oml_ts_server` is stamped here, relative to the
    /// experiment epoch.
    ///
    /// A failed row is dropped and reported; the transaction is reopened so
    /// subsequent rows continue.
    pub fn insert(
        &mut self,
        table: &str,
        sender_id: i32,
        seq_no: i32,
        time_client: f64,
        values: &[Value],
    ) -> Result<(), DbError> {
        if self.last_commit.elapsed() >= self.commit_interval {
            self.reopen_transaction();
        }
        let time_server = unix_now() - self.start_time;

        let Some(schema) = self.tables.get(table) else {
            return UnknownTableSnafu { table }.fail();
        };
        match self
            .adapter
            .insert(schema, sender_id, seq_no, time_client, time_server, values)
        {
            Ok(()) => Ok(()),
            Err(error) => {
                self.reopen_transaction();
                Err(error)
            }
        }
    }

    pub fn add_sender_id(&mut self, name: &str) -> Result<i32, DbError> {
        self.adapter.add_sender_id(name)
    }

    pub fn get_metadata(&mut self, key: &str) -> Result<Option<String>, DbError> {
        self.adapter.get_metadata(key)
    }

    pub fn set_metadata(&mut self, key: &str, value: &str) -> Result<(), DbError> {
        self.adapter.set_metadata(key, value)
    }

    /// Commits the current transaction and opens the next window.
    fn reopen_transaction(&mut self) {
        if let Err(error) = self.adapter.stmt("COMMIT;") {
            warn!(
                message = "Commit failed; rolling back.",
                database = %self.name,
                %error,
            );
            if let Err(error) = self.adapter.stmt("ROLLBACK;") {
                warn!(message = "Rollback failed.", database = %self.name, %error);
            }
            // A failed transaction invalidates session prepared plans on
            // some backends.
            self.adapter.clear_prepared();
        }
        if let Err(error) = self.adapter.stmt("BEGIN;") {
            warn!(
                message = "Could not reopen transaction.",
                database = %self.name,
                %error,
            );
        }
        self.last_commit = Instant::now();
    }

    /// Commits outstanding work and closes the backend session. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(error) = self.adapter.stmt("COMMIT;") {
            warn!(
                message = "Final commit failed.",
                database = %self.name,
                %error,
            );
        }
        let names: Vec<String> = self.tables.keys().cloned().collect();
        for name in names {
            self.adapter.table_free(&name);
        }
        self.adapter.release();
        info!(message = "Database closed.", database = %self.name);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::{BackendTypes, Database, DbAdapter, DbError, create_table_sql, insert_sql};
    use crate::db::psql::PsqlTypes;
    use crate::schema::Schema;
    use crate::value::{Value, ValueKind};

    #[derive(Default)]
    struct Calls {
        stmts: Vec<String>,
        created: Vec<(String, bool)>,
        metadata: Vec<(String, String)>,
        inserted: Vec<(String, i32, i32, f64, f64)>,
        cleared: usize,
        released: bool,
    }

    #[derive(Clone, Default)]
    struct MockAdapter {
        calls: Arc<Mutex<Calls>>,
        stored_tables: Vec<Schema>,
        stored_start_time: Option<String>,
        fail_inserts: bool,
    }

    impl MockAdapter {
        fn calls(&self) -> Arc<Mutex<Calls>> {
            Arc::clone(&self.calls)
        }
    }

    impl BackendTypes for MockAdapter {
        fn backend_name(&self) -> &'static str {
            "mock"
        }

        fn kind_to_backend(&self, _kind: ValueKind) -> &'static str {
            "TEXT"
        }

        fn backend_to_kind(&self, _name: &str) -> Option<ValueKind> {
            None
        }

        fn kind_size(&self, _kind: ValueKind) -> usize {
            0
        }

        fn primary_key_type(&self) -> &'static str {
            "SERIAL PRIMARY KEY"
        }

        fn prepared_var(&self, order: usize) -> String {
            format!("${order}")
        }
    }

    impl DbAdapter for MockAdapter {
        fn stmt(&mut self, sql: &str) -> Result<(), DbError> {
            self.calls.lock().unwrap().stmts.push(sql.to_owned());
            Ok(())
        }

        fn table_create(&mut self, schema: &Schema, shallow: bool) -> Result<(), DbError> {
            self.calls
                .lock()
                .unwrap()
                .created
                .push((schema.name.clone(), shallow));
            Ok(())
        }

        fn table_free(&mut self, _table: &str) {}

        fn clear_prepared(&mut self) {
            self.calls.lock().unwrap().cleared += 1;
        }

        fn insert(
            &mut self,
            schema: &Schema,
            sender_id: i32,
            seq_no: i32,
            time_client: f64,
            time_server: f64,
            _values: &[Value],
        ) -> Result<(), DbError> {
            if self.fail_inserts {
                return Err(DbError::UnknownTable {
                    table: schema.name.clone(),
                });
            }
            self.calls.lock().unwrap().inserted.push((
                schema.name.clone(),
                sender_id,
                seq_no,
                time_client,
                time_server,
            ));
            Ok(())
        }

        fn add_sender_id(&mut self, _name: &str) -> Result<i32, DbError> {
            Ok(0)
        }

        fn get_metadata(&mut self, key: &str) -> Result<Option<String>, DbError> {
            if key == "start_time" {
                return Ok(self.stored_start_time.clone());
            }
            Ok(None)
        }

        fn set_metadata(&mut self, key: &str, value: &str) -> Result<(), DbError> {
            self.calls
                .lock()
                .unwrap()
                .metadata
                .push((key.to_owned(), value.to_owned()));
            Ok(())
        }

        fn uri(&self) -> String {
            "mock://nowhere".into()
        }

        fn table_list(&mut self) -> Result<Vec<Schema>, DbError> {
            Ok(self.stored_tables.clone())
        }

        fn release(&mut self) {
            self.calls.lock().unwrap().released = true;
        }
    }

    fn probe_schema() -> Schema {
        Schema::parse("probe a:int32 b:double").unwrap()
    }

    #[test]
    fn create_table_sql_lists_key_metadata_and_user_columns() {
        let schema = Schema::parse("probe a:int32 b:double c:string d:vector_double").unwrap();
        assert_eq!(
            create_table_sql(&schema, &PsqlTypes),
            "CREATE TABLE \"probe\" (oml_tuple_id SERIAL PRIMARY KEY, \
             oml_sender_id INT4, oml_seq INT4, oml_ts_client FLOAT8, oml_ts_server FLOAT8, \
             \"a\" INT4, \"b\" FLOAT8, \"c\" TEXT, \"d\" TEXT);"
        );
    }

    #[test]
    fn insert_sql_numbers_placeholders_from_one() {
        let schema = probe_schema();
        assert_eq!(
            insert_sql(&schema, &PsqlTypes),
            "INSERT INTO \"probe\" (oml_sender_id, oml_seq, oml_ts_client, oml_ts_server, \
             \"a\", \"b\") VALUES ($1, $2, $3, $4, $5, $6);"
        );
    }

    #[test]
    fn open_persists_a_fresh_epoch_and_begins() {
        let adapter = MockAdapter::default();
        let calls = adapter.calls();

        let db = Database::open("exp1", Box::new(adapter), Duration::from_secs(1)).unwrap();
        assert!(db.start_time() > 0.0);

        let calls = calls.lock().unwrap();
        assert_eq!(calls.stmts, vec!["BEGIN;"]);
        assert_eq!(calls.metadata.len(), 1);
        assert_eq!(calls.metadata[0].0, "start_time");
    }

    #[test]
    fn open_reuses_a_stored_epoch() {
        let adapter = MockAdapter {
            stored_start_time: Some("1700000000".into()),
            ..MockAdapter::default()
        };
        let calls = adapter.calls();

        let db = Database::open("exp1", Box::new(adapter), Duration::from_secs(1)).unwrap();
        assert!((db.start_time() - 1_700_000_000.0).abs() < f64::EPSILON);
        assert!(calls.lock().unwrap().metadata.is_empty());
    }

    #[test]
    fn first_reference_creates_deep_then_records_the_schema() {
        let adapter = MockAdapter::default();
        let calls = adapter.calls();
        let mut db = Database::open("exp1", Box::new(adapter), Duration::from_secs(1)).unwrap();

        db.table(&probe_schema()).unwrap();
        // A second reference with the same schema is a no-op.
        db.table(&probe_schema()).unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(calls.created, vec![("probe".to_owned(), false)]);
        assert!(
            calls
                .metadata
                .iter()
                .any(|(k, v)| k == "table_probe" && v == "probe a:int32 b:double")
        );
    }

    #[test]
    fn known_table_with_matching_schema_is_created_shallow() {
        let adapter = MockAdapter {
            stored_tables: vec![probe_schema()],
            ..MockAdapter::default()
        };
        let calls = adapter.calls();
        let mut db = Database::open("exp1", Box::new(adapter), Duration::from_secs(1)).unwrap();

        db.table(&probe_schema()).unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(calls.created, vec![("probe".to_owned(), true)]);
        // The schema is already on record; nothing is rewritten.
        assert!(calls.metadata.iter().all(|(k, _)| k != "table_probe"));
    }

    #[test]
    fn mismatched_schema_is_a_conflict() {
        let adapter = MockAdapter {
            stored_tables: vec![probe_schema()],
            ..MockAdapter::default()
        };
        let mut db = Database::open("exp1", Box::new(adapter), Duration::from_secs(1)).unwrap();

        let other = Schema::parse("probe a:int32 b:string").unwrap();
        assert!(matches!(
            db.table(&other),
            Err(DbError::SchemaConflict { .. })
        ));
    }

    #[test]
    fn insert_stamps_server_time_and_respects_the_window() {
        let adapter = MockAdapter::default();
        let calls = adapter.calls();
        // Zero grain: every insert reopens the transaction.
        let mut db = Database::open("exp1", Box::new(adapter), Duration::ZERO).unwrap();
        db.table(&probe_schema()).unwrap();

        db.insert("probe", 7, 42, 1.5, &[Value::Int32(-1), Value::Double(3.14)])
            .unwrap();
        db.insert("probe", 7, 43, 1.6, &[Value::Int32(0), Value::Double(2.71)])
            .unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(calls.inserted.len(), 2);
        let (_, sender, seq, t_client, t_server) = calls.inserted[0].clone();
        assert_eq!((sender, seq), (7, 42));
        assert!((t_client - 1.5).abs() < f64::EPSILON);
        assert!(t_server >= 0.0 && t_server < 60.0);

        let commits = calls.stmts.iter().filter(|s| *s == "COMMIT;").count();
        assert!(commits >= 2);
    }

    #[test]
    fn failed_insert_reopens_and_later_rows_continue() {
        let adapter = MockAdapter {
            fail_inserts: true,
            ..MockAdapter::default()
        };
        let calls = adapter.calls();
        let mut db =
            Database::open("exp1", Box::new(adapter), Duration::from_secs(3600)).unwrap();
        db.table(&probe_schema()).unwrap();

        let result = db.insert("probe", 1, 1, 0.0, &[Value::Int32(1), Value::Double(0.0)]);
        assert!(result.is_err());

        // The window was reopened after the failure.
        let stmts = &calls.lock().unwrap().stmts;
        assert_eq!(stmts.last().map(String::as_str), Some("BEGIN;"));
    }

    #[test]
    fn insert_into_unknown_table_is_refused() {
        let adapter = MockAdapter::default();
        let mut db = Database::open("exp1", Box::new(adapter), Duration::from_secs(1)).unwrap();
        assert!(matches!(
            db.insert("ghost", 1, 1, 0.0, &[]),
            Err(DbError::UnknownTable { .. })
        ));
    }

    #[test]
    fn close_commits_and_releases() {
        let adapter = MockAdapter::default();
        let calls = adapter.calls();
        let mut db = Database::open("exp1", Box::new(adapter), Duration::from_secs(1)).unwrap();
        db.close();
        // A second close is a no-op.
        db.close();

        let calls = calls.lock().unwrap();
        assert!(calls.released);
        assert_eq!(calls.stmts.last().map(String::as_str), Some("COMMIT;"));
    }
}
