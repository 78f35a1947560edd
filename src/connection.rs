//! Recording database connection wrapper.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use sea_orm::{
    AccessMode, ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbBackend, DbErr,
    ExecResult, IsolationLevel, QueryResult, Statement, StreamTrait, TransactionError,
    TransactionTrait,
};
use tracing::{field, Instrument, Span};

use crate::config::InspectorConfig;
use crate::identity::{ConnectionKey, IdentitySlot, QueryKey, TransactionKey, UpstreamHandle};
use crate::recorder::Recorder;
use crate::statement::{Bracket, StatementInfo};

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

fn db_system(backend: DbBackend) -> &'static str {
    match backend {
        DbBackend::Postgres => "postgresql",
        DbBackend::MySql => "mysql",
        DbBackend::Sqlite => "sqlite",
    }
}

/// What a statement turns into on the timeline.
enum Role {
    Query(QueryKey),
    Begin(TransactionKey),
    End(TransactionKey),
}

/// In-flight bookkeeping for one statement.
struct Pending {
    key: ConnectionKey,
    role: Role,
    recorded_sql: String,
    span: Span,
    start: Instant,
}

/// Shared by every clone of a connection and every transaction opened on it.
/// Carries the stable key; the last owner to go away releases the connection.
#[derive(Debug)]
struct Lease {
    native_id: String,
    slot: IdentitySlot,
    recorder: Arc<Recorder>,
    config: Arc<InspectorConfig>,
    transactions: AtomicU64,
    // Transactions opened by plain `BEGIN` statements, innermost last. The
    // pool does not say which physical connection ran a statement, so a
    // `COMMIT` closes the newest one.
    statement_transactions: Mutex<Vec<TransactionKey>>,
}

impl UpstreamHandle for Lease {
    fn native_id(&self) -> String {
        self.native_id.clone()
    }

    fn identity_slot(&self) -> Option<&IdentitySlot> {
        Some(&self.slot)
    }
}

impl Lease {
    fn acquire(backend: DbBackend, recorder: Arc<Recorder>, config: InspectorConfig) -> Arc<Self> {
        let native_id = format!(
            "{}-{}",
            db_system(backend),
            NEXT_HANDLE.fetch_add(1, Ordering::Relaxed)
        );
        let lease = Arc::new(Self {
            native_id,
            slot: IdentitySlot::new(),
            recorder,
            config: Arc::new(config),
            transactions: AtomicU64::new(0),
            statement_transactions: Mutex::new(Vec::new()),
        });
        let key = lease.key();
        lease.recorder.connection_acquired(&key);
        tracing::debug!(connection = %key, native_id = %lease.native_id, "Inspecting connection");
        lease
    }

    fn key(&self) -> ConnectionKey {
        self.recorder.resolver().resolve(self)
    }

    fn release(&self) {
        if let Some(key) = self.slot.get() {
            self.recorder.connection_released(key);
        }
    }

    /// Register a statement with the recorder before it runs.
    fn start(&self, key: ConnectionKey, backend: DbBackend, sql: &str) -> Pending {
        let info = StatementInfo::parse(sql);
        let span = tracing::info_span!(
            "db.query",
            otel.name = %info.label(),
            db.system = %db_system(backend),
            db.operation = %info.operation,
            db.connection_id = %key,
            db.sql.table = field::Empty,
            db.rows_affected = field::Empty,
            db.duration_ms = field::Empty,
            otel.status_code = field::Empty,
            error.message = field::Empty,
            slow_query = field::Empty,
        );
        if let Some(table) = &info.table {
            span.record("db.sql.table", table.as_str());
        }

        let bracket = if self.config.route_transaction_statements {
            info.bracket()
        } else {
            Bracket::None
        };
        let role = match bracket {
            Bracket::Open => {
                let tx = TransactionKey::generate();
                self.recorder.transaction_started(&key, &tx);
                self.statement_transactions.lock().push(tx.clone());
                Role::Begin(tx)
            }
            Bracket::Close => {
                let tx = self
                    .statement_transactions
                    .lock()
                    .pop()
                    .unwrap_or_else(TransactionKey::generate);
                Role::End(tx)
            }
            Bracket::None => {
                let query = QueryKey::generate();
                self.recorder.query_started(&key, &query);
                Role::Query(query)
            }
        };

        let recorded_sql = if self.config.capture_statements {
            sql.to_string()
        } else {
            info.label()
        };

        Pending {
            key,
            role,
            recorded_sql,
            span,
            start: Instant::now(),
        }
    }

    /// Close out a statement, whatever its outcome.
    fn finish<T>(&self, pending: Pending, result: &Result<T, DbErr>, row_count: Option<u64>) {
        let Pending {
            key,
            role,
            recorded_sql,
            span,
            start,
        } = pending;
        let elapsed = start.elapsed();
        let duration_ms = i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX);
        span.record("db.duration_ms", duration_ms);
        if let Some(count) = row_count {
            span.record("db.rows_affected", count);
        }

        match role {
            Role::Query(query) => self.recorder.query_ended(&key, &query, recorded_sql),
            Role::Begin(tx) => {
                // A BEGIN that failed never opened anything.
                if result.is_err() {
                    self.statement_transactions.lock().retain(|open| open != &tx);
                    self.recorder.transaction_ended(&key, &tx);
                }
            }
            Role::End(tx) => self.recorder.transaction_ended(&key, &tx),
        }

        if elapsed > self.config.slow_query_threshold {
            span.record("slow_query", true);
            let threshold_ms =
                i64::try_from(self.config.slow_query_threshold.as_millis()).unwrap_or(i64::MAX);
            tracing::warn!(
                parent: &span,
                duration_ms = duration_ms,
                threshold_ms = threshold_ms,
                "Slow query detected"
            );
        }

        match result {
            Ok(_) => {
                span.record("otel.status_code", "OK");
            }
            Err(e) => {
                span.record("otel.status_code", "ERROR");
                span.record("error.message", e.to_string().as_str());
                tracing::error!(parent: &span, error = %e, "Database query failed");
            }
        }
    }

    fn transaction_span(&self, backend: DbBackend, key: &ConnectionKey) -> Span {
        tracing::info_span!(
            "db.transaction",
            otel.name = "TRANSACTION",
            db.system = %db_system(backend),
            db.operation = "TRANSACTION",
            db.connection_id = %key,
            otel.status_code = field::Empty,
            error.message = field::Empty,
        )
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release();
    }
}

/// A SeaORM `DatabaseConnection` that reports its activity to a [`Recorder`].
///
/// Implements `ConnectionTrait`, `StreamTrait` and `TransactionTrait`, so it
/// can be used anywhere a `DatabaseConnection` is. Every statement becomes a
/// query on the timeline; plain `BEGIN`/`COMMIT`/`ROLLBACK` statements become
/// transaction brackets instead.
///
/// Clones share the underlying connection and one timeline row. The row is
/// closed when the last clone is dropped or [`close`](Self::close) is called.
///
/// # Example
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use sea_orm::Database;
/// use sea_orm_inspector::{InspectedConnection, Recorder};
///
/// let recorder = Arc::new(Recorder::new());
/// let db = Database::connect("postgres://localhost/mydb").await?;
/// let inspected = InspectedConnection::wrap(db, recorder.clone());
///
/// let cakes = Cake::find().all(&inspected).await?;
/// println!("{}", recorder.snapshot_json()?);
/// ```
#[derive(Debug, Clone)]
pub struct InspectedConnection {
    inner: Arc<DatabaseConnection>,
    lease: Arc<Lease>,
}

impl InspectedConnection {
    /// Wrap a connection with the given configuration and record it as
    /// acquired.
    pub fn new(
        connection: DatabaseConnection,
        recorder: Arc<Recorder>,
        config: InspectorConfig,
    ) -> Self {
        let lease = Lease::acquire(connection.get_database_backend(), recorder, config);
        Self {
            inner: Arc::new(connection),
            lease,
        }
    }

    /// Wrap a connection with default configuration.
    pub fn wrap(connection: DatabaseConnection, recorder: Arc<Recorder>) -> Self {
        Self::new(connection, recorder, InspectorConfig::default())
    }

    /// The stable key of this connection's timeline row.
    pub fn key(&self) -> ConnectionKey {
        self.lease.key()
    }

    pub fn inner(&self) -> &DatabaseConnection {
        &self.inner
    }

    pub fn recorder(&self) -> &Arc<Recorder> {
        &self.lease.recorder
    }

    pub fn config(&self) -> &InspectorConfig {
        &self.lease.config
    }

    /// Consume the wrapper and return the inner `DatabaseConnection`.
    ///
    /// Fails, handing the wrapper back, while other clones still share it.
    pub fn into_inner(self) -> Result<DatabaseConnection, Self> {
        let Self { inner, lease } = self;
        Arc::try_unwrap(inner).map_err(|inner| Self { inner, lease })
    }

    /// Record the release and close the underlying connection.
    ///
    /// The connection itself is only closed by the last clone; earlier
    /// clones just end the timeline row.
    pub async fn close(self) -> Result<(), DbErr> {
        self.lease.release();
        match Arc::try_unwrap(self.inner) {
            Ok(inner) => inner.close().await,
            Err(_) => {
                tracing::debug!("Connection still shared by other clones; left open");
                Ok(())
            }
        }
    }

    /// Begin a transaction whose statements are recorded on this
    /// connection's row.
    pub async fn begin_inspected(&self) -> Result<InspectedTransaction, DbErr> {
        let inner = self.inner.begin().await?;
        Ok(self.attach_transaction(inner))
    }

    /// Like [`begin_inspected`](Self::begin_inspected) with explicit isolation
    /// level and access mode.
    pub async fn begin_inspected_with_config(
        &self,
        isolation_level: Option<IsolationLevel>,
        access_mode: Option<AccessMode>,
    ) -> Result<InspectedTransaction, DbErr> {
        let inner = self
            .inner
            .begin_with_config(isolation_level, access_mode)
            .await?;
        Ok(self.attach_transaction(inner))
    }

    fn attach_transaction(&self, inner: DatabaseTransaction) -> InspectedTransaction {
        let seq = self.lease.transactions.fetch_add(1, Ordering::Relaxed);
        let transaction = InspectedTransaction {
            inner,
            guard: TransactionGuard {
                lease: self.lease.clone(),
                native_id: format!("{}/tx{}", self.lease.native_id, seq),
                key: TransactionKey::generate(),
                finished: false,
            },
        };
        let connection = transaction.connection_key();
        self.lease
            .recorder
            .transaction_started(&connection, &transaction.guard.key);
        transaction
    }
}

impl UpstreamHandle for InspectedConnection {
    fn native_id(&self) -> String {
        self.lease.native_id.clone()
    }

    fn identity_slot(&self) -> Option<&IdentitySlot> {
        Some(&self.lease.slot)
    }
}

impl AsRef<DatabaseConnection> for InspectedConnection {
    fn as_ref(&self) -> &DatabaseConnection {
        &self.inner
    }
}

#[async_trait]
impl ConnectionTrait for InspectedConnection {
    fn get_database_backend(&self) -> DbBackend {
        self.inner.get_database_backend()
    }

    async fn execute(&self, stmt: Statement) -> Result<ExecResult, DbErr> {
        let pending = self
            .lease
            .start(self.key(), self.get_database_backend(), &stmt.sql);
        let span = pending.span.clone();

        let result = self.inner.execute(stmt).instrument(span).await;

        let row_count = result.as_ref().ok().map(|r| r.rows_affected());
        self.lease.finish(pending, &result, row_count);

        result
    }

    async fn execute_unprepared(&self, sql: &str) -> Result<ExecResult, DbErr> {
        let pending = self.lease.start(self.key(), self.get_database_backend(), sql);
        let span = pending.span.clone();

        let result = self.inner.execute_unprepared(sql).instrument(span).await;

        let row_count = result.as_ref().ok().map(|r| r.rows_affected());
        self.lease.finish(pending, &result, row_count);

        result
    }

    async fn query_one(&self, stmt: Statement) -> Result<Option<QueryResult>, DbErr> {
        let pending = self
            .lease
            .start(self.key(), self.get_database_backend(), &stmt.sql);
        let span = pending.span.clone();

        let result = self.inner.query_one(stmt).instrument(span).await;

        let row_count = result.as_ref().ok().map(|opt| u64::from(opt.is_some()));
        self.lease.finish(pending, &result, row_count);

        result
    }

    async fn query_all(&self, stmt: Statement) -> Result<Vec<QueryResult>, DbErr> {
        let pending = self
            .lease
            .start(self.key(), self.get_database_backend(), &stmt.sql);
        let span = pending.span.clone();

        let result = self.inner.query_all(stmt).instrument(span).await;

        let row_count = result.as_ref().ok().map(|rows| rows.len() as u64);
        self.lease.finish(pending, &result, row_count);

        result
    }

    fn support_returning(&self) -> bool {
        self.inner.support_returning()
    }

    fn is_mock_connection(&self) -> bool {
        self.inner.is_mock_connection()
    }
}

impl StreamTrait for InspectedConnection {
    type Stream<'a> = <DatabaseConnection as StreamTrait>::Stream<'a>;

    /// The query is ended once the stream is open; rows pulled afterwards are
    /// not part of its interval.
    fn stream<'a>(
        &'a self,
        stmt: Statement,
    ) -> Pin<Box<dyn Future<Output = Result<Self::Stream<'a>, DbErr>> + 'a + Send>> {
        let pending = self
            .lease
            .start(self.key(), self.get_database_backend(), &stmt.sql);

        Box::pin(async move {
            let span = pending.span.clone();
            let result = self.inner.stream(stmt).instrument(span).await;
            self.lease.finish(pending, &result, None);
            result
        })
    }
}

/// `begin`/`begin_with_config` hand back a plain `DatabaseTransaction`, which
/// cannot report to the recorder; use
/// [`InspectedConnection::begin_inspected`] to see the statements of a
/// transaction. The closure-style `transaction` methods record the bracket
/// around the callback.
#[async_trait]
impl TransactionTrait for InspectedConnection {
    async fn begin(&self) -> Result<DatabaseTransaction, DbErr> {
        self.inner.begin().await
    }

    async fn begin_with_config(
        &self,
        isolation_level: Option<IsolationLevel>,
        access_mode: Option<AccessMode>,
    ) -> Result<DatabaseTransaction, DbErr> {
        self.inner
            .begin_with_config(isolation_level, access_mode)
            .await
    }

    async fn transaction<F, T, E>(&self, callback: F) -> Result<T, TransactionError<E>>
    where
        F: for<'c> FnOnce(
                &'c DatabaseTransaction,
            ) -> Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'c>>
            + Send,
        T: Send,
        E: std::fmt::Display + std::fmt::Debug + Send,
    {
        let key = self.key();
        let tx = TransactionKey::generate();
        let span = self.lease.transaction_span(self.get_database_backend(), &key);

        self.lease.recorder.transaction_started(&key, &tx);
        let result = self
            .inner
            .transaction(callback)
            .instrument(span.clone())
            .await;
        self.lease.recorder.transaction_ended(&key, &tx);

        match &result {
            Ok(_) => {
                span.record("otel.status_code", "OK");
            }
            Err(e) => {
                span.record("otel.status_code", "ERROR");
                span.record("error.message", format!("{:?}", e).as_str());
            }
        }

        result
    }

    async fn transaction_with_config<F, T, E>(
        &self,
        callback: F,
        isolation_level: Option<IsolationLevel>,
        access_mode: Option<AccessMode>,
    ) -> Result<T, TransactionError<E>>
    where
        F: for<'c> FnOnce(
                &'c DatabaseTransaction,
            ) -> Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'c>>
            + Send,
        T: Send,
        E: std::fmt::Display + std::fmt::Debug + Send,
    {
        let key = self.key();
        let tx = TransactionKey::generate();
        let span = self.lease.transaction_span(self.get_database_backend(), &key);

        self.lease.recorder.transaction_started(&key, &tx);
        let result = self
            .inner
            .transaction_with_config(callback, isolation_level, access_mode)
            .instrument(span.clone())
            .await;
        self.lease.recorder.transaction_ended(&key, &tx);

        match &result {
            Ok(_) => {
                span.record("otel.status_code", "OK");
            }
            Err(e) => {
                span.record("otel.status_code", "ERROR");
                span.record("error.message", format!("{:?}", e).as_str());
            }
        }

        result
    }
}

/// Ends the transaction on the timeline exactly once, including when the
/// transaction is dropped without commit or rollback.
#[derive(Debug)]
struct TransactionGuard {
    lease: Arc<Lease>,
    native_id: String,
    key: TransactionKey,
    finished: bool,
}

impl TransactionGuard {
    fn finish(&mut self, outcome: &'static str) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Some(connection) = self.lease.slot.get() {
            self.lease.recorder.transaction_ended(connection, &self.key);
            tracing::debug!(connection = %connection, transaction = %self.key, outcome, "Transaction finished");
        }
    }
}

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        self.finish("dropped");
    }
}

/// A transaction opened through [`InspectedConnection::begin_inspected`].
///
/// The transaction is a different object from the connection that opened it,
/// but it resolves to the same stable key, so its statements land on the
/// connection's row.
#[derive(Debug)]
pub struct InspectedTransaction {
    inner: DatabaseTransaction,
    guard: TransactionGuard,
}

impl InspectedTransaction {
    /// Stable key of the connection this transaction runs on.
    pub fn connection_key(&self) -> ConnectionKey {
        self.guard.lease.recorder.resolver().resolve(self)
    }

    pub fn transaction_key(&self) -> &TransactionKey {
        &self.guard.key
    }

    pub fn inner(&self) -> &DatabaseTransaction {
        &self.inner
    }

    pub async fn commit(self) -> Result<(), DbErr> {
        let Self { inner, mut guard } = self;
        let result = inner.commit().await;
        guard.finish("commit");
        result
    }

    pub async fn rollback(self) -> Result<(), DbErr> {
        let Self { inner, mut guard } = self;
        let result = inner.rollback().await;
        guard.finish("rollback");
        result
    }
}

impl UpstreamHandle for InspectedTransaction {
    fn native_id(&self) -> String {
        self.guard.native_id.clone()
    }

    fn identity_slot(&self) -> Option<&IdentitySlot> {
        Some(&self.guard.lease.slot)
    }
}

#[async_trait]
impl ConnectionTrait for InspectedTransaction {
    fn get_database_backend(&self) -> DbBackend {
        self.inner.get_database_backend()
    }

    async fn execute(&self, stmt: Statement) -> Result<ExecResult, DbErr> {
        let pending = self.guard.lease.start(
            self.connection_key(),
            self.get_database_backend(),
            &stmt.sql,
        );
        let span = pending.span.clone();

        let result = self.inner.execute(stmt).instrument(span).await;

        let row_count = result.as_ref().ok().map(|r| r.rows_affected());
        self.guard.lease.finish(pending, &result, row_count);

        result
    }

    async fn execute_unprepared(&self, sql: &str) -> Result<ExecResult, DbErr> {
        let pending = self
            .guard
            .lease
            .start(self.connection_key(), self.get_database_backend(), sql);
        let span = pending.span.clone();

        let result = self.inner.execute_unprepared(sql).instrument(span).await;

        let row_count = result.as_ref().ok().map(|r| r.rows_affected());
        self.guard.lease.finish(pending, &result, row_count);

        result
    }

    async fn query_one(&self, stmt: Statement) -> Result<Option<QueryResult>, DbErr> {
        let pending = self.guard.lease.start(
            self.connection_key(),
            self.get_database_backend(),
            &stmt.sql,
        );
        let span = pending.span.clone();

        let result = self.inner.query_one(stmt).instrument(span).await;

        let row_count = result.as_ref().ok().map(|opt| u64::from(opt.is_some()));
        self.guard.lease.finish(pending, &result, row_count);

        result
    }

    async fn query_all(&self, stmt: Statement) -> Result<Vec<QueryResult>, DbErr> {
        let pending = self.guard.lease.start(
            self.connection_key(),
            self.get_database_backend(),
            &stmt.sql,
        );
        let span = pending.span.clone();

        let result = self.inner.query_all(stmt).instrument(span).await;

        let row_count = result.as_ref().ok().map(|rows| rows.len() as u64);
        self.guard.lease.finish(pending, &result, row_count);

        result
    }

    fn support_returning(&self) -> bool {
        self.inner.support_returning()
    }

    fn is_mock_connection(&self) -> bool {
        self.inner.is_mock_connection()
    }
}

impl StreamTrait for InspectedTransaction {
    type Stream<'a> = <DatabaseTransaction as StreamTrait>::Stream<'a>;

    fn stream<'a>(
        &'a self,
        stmt: Statement,
    ) -> Pin<Box<dyn Future<Output = Result<Self::Stream<'a>, DbErr>> + 'a + Send>> {
        let pending = self.guard.lease.start(
            self.connection_key(),
            self.get_database_backend(),
            &stmt.sql,
        );

        Box::pin(async move {
            let span = pending.span.clone();
            let result = self.inner.stream(stmt).instrument(span).await;
            self.guard.lease.finish(pending, &result, None);
            result
        })
    }
}

/// Extension trait for wrapping database connections.
pub trait InspectorExt {
    /// Record this connection's activity into `recorder`.
    fn with_inspector(self, recorder: Arc<Recorder>) -> InspectedConnection;

    /// Same as [`with_inspector`](Self::with_inspector) with a custom
    /// configuration.
    fn with_inspector_config(
        self,
        recorder: Arc<Recorder>,
        config: InspectorConfig,
    ) -> InspectedConnection;
}

impl InspectorExt for DatabaseConnection {
    fn with_inspector(self, recorder: Arc<Recorder>) -> InspectedConnection {
        InspectedConnection::wrap(self, recorder)
    }

    fn with_inspector_config(
        self,
        recorder: Arc<Recorder>,
        config: InspectorConfig,
    ) -> InspectedConnection {
        InspectedConnection::new(self, recorder, config)
    }
}
