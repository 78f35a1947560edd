//! The in-memory event recorder.
//!
//! Notifications arrive from many tasks, in no guaranteed order, sometimes
//! twice and sometimes never. Every operation therefore finds-or-creates the
//! connection it targets and treats stale or repeated end events as no-ops.
//! The whole recording sits behind one mutex, taken exactly once per
//! operation, so a snapshot never sees a half-written interval.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::identity::{ConnectionKey, IdentityResolver, QueryKey, TransactionKey};
use crate::recording::{Connection, Interval, Query, Recording, Transaction};

/// Positions of a connection and of everything recorded on it.
#[derive(Debug)]
struct Slot {
    position: usize,
    queries: HashMap<QueryKey, usize>,
    transactions: HashMap<TransactionKey, usize>,
}

impl Slot {
    fn new(position: usize) -> Self {
        Self {
            position,
            queries: HashMap::new(),
            transactions: HashMap::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Store {
    recording: Recording,
    index: HashMap<ConnectionKey, Slot>,
}

impl Store {
    /// Find-or-create the connection for `key`, with its lookup tables.
    fn entry(&mut self, key: &ConnectionKey, now: i64) -> (&mut Connection, &mut Slot) {
        let connections = &mut self.recording.connections;
        let slot = self.index.entry(key.clone()).or_insert_with(|| {
            let position = connections.len();
            connections.push(Connection::new(key.clone(), now));
            tracing::debug!(connection = %key, "Connection first observed");
            Slot::new(position)
        });
        (&mut connections[slot.position], slot)
    }
}

/// Append-only timeline of connections, queries and transactions.
///
/// Share it as `Arc<Recorder>` between the ingestion side and whatever
/// serves snapshots.
///
/// # Example
///
/// ```rust
/// use sea_orm_inspector::{ConnectionKey, QueryKey, Recorder};
///
/// let recorder = Recorder::new();
/// let conn = ConnectionKey::from("c1");
/// let query = QueryKey::from("q1");
///
/// recorder.connection_acquired(&conn);
/// recorder.query_started(&conn, &query);
/// recorder.query_ended(&conn, &query, "SELECT 1");
///
/// let snapshot = recorder.snapshot();
/// assert_eq!(snapshot.connections[0].queries[0].sql.as_deref(), Some("SELECT 1"));
/// ```
#[derive(Debug)]
pub struct Recorder {
    store: Mutex<Store>,
    clock: Arc<dyn Clock>,
    resolver: IdentityResolver,
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}

impl Recorder {
    /// Create a recorder driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a recorder driven by a custom clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            store: Mutex::new(Store::default()),
            clock,
            resolver: IdentityResolver::new(),
        }
    }

    /// The resolver that issues stable keys for this recorder's connections.
    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    pub fn now(&self) -> i64 {
        self.clock.now_millis()
    }

    /// Ensure a connection exists for `key`.
    ///
    /// The first acquisition ever observed stamps the recording start.
    pub fn connection_acquired(&self, key: &ConnectionKey) {
        let now = self.now();
        let mut store = self.store.lock();
        if store.recording.start_time.is_none() {
            store.recording.start_time = Some(now);
        }
        store.entry(key, now);
        tracing::debug!(connection = %key, "Connection acquired");
    }

    /// Mark the connection as released. Only the first release counts.
    pub fn connection_released(&self, key: &ConnectionKey) {
        let now = self.now();
        let mut store = self.store.lock();
        let (connection, _) = store.entry(key, now);
        if connection.end_time.is_none() {
            connection.end_time = Some(now);
            tracing::debug!(connection = %key, "Connection released");
        } else {
            tracing::trace!(connection = %key, "Duplicate release ignored");
        }
    }

    /// Record the start of a query.
    ///
    /// A start for a query key already present on the connection is ignored,
    /// so redelivered starts never produce a second row.
    pub fn query_started(&self, connection: &ConnectionKey, query: &QueryKey) {
        let now = self.now();
        let mut store = self.store.lock();
        let (conn, slot) = store.entry(connection, now);
        if slot.queries.contains_key(query) {
            tracing::trace!(connection = %connection, query = %query, "Duplicate query start ignored");
            return;
        }
        slot.queries.insert(query.clone(), conn.queries.len());
        conn.queries.push(Query::new(query.clone(), now));
        tracing::trace!(connection = %connection, query = %query, "Query started");
    }

    /// Finalize a query with its SQL text.
    ///
    /// Unknown or already-ended queries are left alone.
    pub fn query_ended(&self, connection: &ConnectionKey, query: &QueryKey, sql: impl Into<String>) {
        let now = self.now();
        let mut store = self.store.lock();
        let (conn, slot) = store.entry(connection, now);
        match slot.queries.get(query).copied() {
            Some(i) if conn.queries[i].end_time.is_none() => {
                let q = &mut conn.queries[i];
                q.end_time = Some(now);
                q.sql = Some(sql.into());
                tracing::trace!(connection = %connection, query = %query, "Query ended");
            }
            Some(_) => {
                tracing::trace!(connection = %connection, query = %query, "Query already ended");
            }
            None => {
                tracing::trace!(connection = %connection, query = %query, "End for unknown query ignored");
            }
        }
    }

    /// Record the start of a transaction. Repeated starts for the same key are
    /// ignored.
    pub fn transaction_started(&self, connection: &ConnectionKey, transaction: &TransactionKey) {
        let now = self.now();
        let mut store = self.store.lock();
        let (conn, slot) = store.entry(connection, now);
        if slot.transactions.contains_key(transaction) {
            tracing::trace!(connection = %connection, transaction = %transaction, "Duplicate transaction start ignored");
            return;
        }
        slot.transactions.insert(transaction.clone(), conn.transactions.len());
        conn.transactions.push(Transaction::new(transaction.clone(), now));
        tracing::debug!(connection = %connection, transaction = %transaction, "Transaction started");
    }

    /// Close a transaction.
    ///
    /// The open transaction with the given key is closed when there is one.
    /// Otherwise (unknown key, or that transaction already ended) the end
    /// lands on the most recently started transaction that is still open.
    /// Without any open transaction this is a no-op.
    pub fn transaction_ended(&self, connection: &ConnectionKey, transaction: &TransactionKey) {
        let now = self.now();
        let mut store = self.store.lock();
        let (conn, slot) = store.entry(connection, now);
        let matched = slot
            .transactions
            .get(transaction)
            .copied()
            .filter(|&i| conn.transactions[i].is_open());
        let target = matched.or_else(|| conn.transactions.iter().rposition(|t| t.is_open()));

        match target {
            Some(i) => {
                let open = &mut conn.transactions[i];
                if matched.is_none() {
                    tracing::debug!(
                        connection = %connection,
                        transaction = %transaction,
                        closed = %open.id,
                        "Transaction end attributed to last open transaction"
                    );
                }
                open.end_time = Some(now);
                tracing::debug!(connection = %connection, transaction = %open.id, "Transaction ended");
            }
            None => {
                tracing::trace!(connection = %connection, transaction = %transaction, "No open transaction to end");
            }
        }
    }

    /// A detached copy of the full recording.
    pub fn snapshot(&self) -> Recording {
        self.store.lock().recording.clone()
    }

    /// Serialize the current recording to JSON.
    ///
    /// The copy is taken first, so a failure here never touches recorded
    /// state.
    pub fn snapshot_json(&self) -> Result<String> {
        self.snapshot().to_json()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::recording::Interval;

    fn recorder() -> (Arc<ManualClock>, Recorder) {
        let clock = Arc::new(ManualClock::new(1_000));
        let recorder = Recorder::with_clock(clock.clone());
        (clock, recorder)
    }

    fn c(key: &str) -> ConnectionKey {
        ConnectionKey::from(key)
    }

    fn q(key: &str) -> QueryKey {
        QueryKey::from(key)
    }

    fn t(key: &str) -> TransactionKey {
        TransactionKey::from(key)
    }

    #[test]
    fn test_single_query_lifecycle() {
        let (clock, recorder) = recorder();

        recorder.connection_acquired(&c("c1"));
        clock.advance(5);
        recorder.query_started(&c("c1"), &q("q1"));
        clock.advance(12);
        recorder.query_ended(&c("c1"), &q("q1"), "SELECT 1");

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.connections.len(), 1);
        let conn = &snapshot.connections[0];
        assert_eq!(conn.id, c("c1"));
        assert_eq!(conn.queries.len(), 1);
        let query = &conn.queries[0];
        assert_eq!(query.sql.as_deref(), Some("SELECT 1"));
        assert!(query.end_time.unwrap() > query.start_time);
    }

    #[test]
    fn test_start_time_stamped_once_on_first_acquire() {
        let (clock, recorder) = recorder();

        recorder.query_started(&c("c0"), &q("q0"));
        assert_eq!(recorder.snapshot().start_time, None);

        clock.advance(10);
        recorder.connection_acquired(&c("c1"));
        clock.advance(10);
        recorder.connection_acquired(&c("c2"));

        assert_eq!(recorder.snapshot().start_time, Some(1_010));
    }

    #[test]
    fn test_acquire_is_idempotent() {
        let (clock, recorder) = recorder();

        recorder.connection_acquired(&c("c1"));
        clock.advance(100);
        recorder.connection_acquired(&c("c1"));

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.connections.len(), 1);
        assert_eq!(snapshot.connections[0].start_time, 1_000);
    }

    #[test]
    fn test_release_end_time_is_monotonic() {
        let (clock, recorder) = recorder();

        recorder.connection_acquired(&c("c1"));
        clock.advance(20);
        recorder.connection_released(&c("c1"));
        clock.advance(20);
        recorder.query_started(&c("c1"), &q("late"));
        recorder.query_ended(&c("c1"), &q("late"), "SELECT 2");
        recorder.connection_released(&c("c1"));

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.connections[0].end_time, Some(1_020));
        assert_eq!(snapshot.connections[0].queries.len(), 1);
    }

    #[test]
    fn test_release_of_unknown_connection_creates_it() {
        let (_, recorder) = recorder();

        recorder.connection_released(&c("ghost"));

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.connections.len(), 1);
        assert_eq!(snapshot.connections[0].end_time, Some(1_000));
    }

    #[test]
    fn test_query_end_is_not_reassigned() {
        let (clock, recorder) = recorder();

        recorder.query_started(&c("c1"), &q("q1"));
        clock.advance(3);
        recorder.query_ended(&c("c1"), &q("q1"), "SELECT 1");
        clock.advance(50);
        recorder.query_ended(&c("c1"), &q("q1"), "SELECT 999");

        let query = recorder.snapshot().connections[0].queries[0].clone();
        assert_eq!(query.end_time, Some(1_003));
        assert_eq!(query.sql.as_deref(), Some("SELECT 1"));
    }

    #[test]
    fn test_end_for_unknown_query_is_noop() {
        let (_, recorder) = recorder();

        recorder.connection_acquired(&c("c1"));
        recorder.query_ended(&c("c1"), &q("never-started"), "SELECT 1");

        assert!(recorder.snapshot().connections[0].queries.is_empty());
    }

    #[test]
    fn test_duplicate_query_start_is_deduplicated() {
        let (clock, recorder) = recorder();

        recorder.query_started(&c("c1"), &q("q1"));
        clock.advance(7);
        recorder.query_started(&c("c1"), &q("q1"));
        clock.advance(7);
        recorder.query_ended(&c("c1"), &q("q1"), "SELECT 1");

        let queries = recorder.snapshot().connections[0].queries.clone();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].start_time, 1_000);
        assert_eq!(queries[0].end_time, Some(1_014));
    }

    #[test]
    fn test_same_query_key_on_different_connections() {
        let (_, recorder) = recorder();

        recorder.query_started(&c("c1"), &q("q1"));
        recorder.query_started(&c("c2"), &q("q1"));
        recorder.query_ended(&c("c2"), &q("q1"), "SELECT 2");

        let snapshot = recorder.snapshot();
        assert!(snapshot.connections[0].queries[0].is_open());
        assert!(!snapshot.connections[1].queries[0].is_open());
    }

    #[test]
    fn test_transaction_end_without_open_is_noop() {
        let (_, recorder) = recorder();

        recorder.transaction_started(&c("other"), &t("t-other"));
        recorder.transaction_ended(&c("c1"), &t("stray"));

        let snapshot = recorder.snapshot();
        let c1 = snapshot.connection(&c("c1")).unwrap();
        assert!(c1.transactions.is_empty());
        let other = snapshot.connection(&c("other")).unwrap();
        assert!(other.transactions[0].is_open());
    }

    #[test]
    fn test_transaction_end_targets_last_open() {
        let (clock, recorder) = recorder();

        recorder.transaction_started(&c("c1"), &t("t1"));
        clock.advance(1);
        recorder.transaction_ended(&c("c1"), &t("t1"));
        clock.advance(1);
        recorder.transaction_started(&c("c1"), &t("t2"));
        clock.advance(1);
        recorder.transaction_ended(&c("c1"), &t("whatever"));
        clock.advance(1);
        recorder.transaction_ended(&c("c1"), &t("t2"));

        let txs = recorder.snapshot().connections[0].transactions.clone();
        assert_eq!(txs[0].end_time, Some(1_001));
        assert_eq!(txs[1].end_time, Some(1_003));
    }

    #[test]
    fn test_overlapping_transactions_end_by_key() {
        let (clock, recorder) = recorder();

        recorder.transaction_started(&c("c1"), &t("first"));
        clock.advance(1);
        recorder.transaction_started(&c("c1"), &t("second"));
        clock.advance(1);
        recorder.transaction_ended(&c("c1"), &t("first"));

        let snapshot = recorder.snapshot();
        let conn = &snapshot.connections[0];
        assert_eq!(conn.transaction(&t("first")).unwrap().end_time, Some(1_002));
        assert!(conn.transaction(&t("second")).unwrap().is_open());

        clock.advance(5);
        recorder.transaction_ended(&c("c1"), &t("second"));

        let snapshot = recorder.snapshot();
        let conn = &snapshot.connections[0];
        assert_eq!(conn.transaction(&t("first")).unwrap().end_time, Some(1_002));
        assert_eq!(conn.transaction(&t("second")).unwrap().end_time, Some(1_007));
    }

    #[test]
    fn test_repeated_end_for_closed_key_falls_back_to_last_open() {
        let (clock, recorder) = recorder();

        recorder.transaction_started(&c("c1"), &t("t1"));
        recorder.transaction_started(&c("c1"), &t("t2"));
        clock.advance(1);
        recorder.transaction_ended(&c("c1"), &t("t2"));
        clock.advance(1);
        recorder.transaction_ended(&c("c1"), &t("t2"));

        let conn = recorder.snapshot().connections[0].clone();
        assert_eq!(conn.transaction(&t("t2")).unwrap().end_time, Some(1_001));
        assert_eq!(conn.transaction(&t("t1")).unwrap().end_time, Some(1_002));
    }

    #[test]
    fn test_query_lookup_across_many_queries() {
        let (clock, recorder) = recorder();

        for i in 0..1_000 {
            recorder.query_started(&c("c1"), &q(&format!("q{i}")));
        }
        clock.advance(3);
        recorder.query_ended(&c("c1"), &q("q0"), "SELECT 0");
        recorder.query_started(&c("c1"), &q("q500"));

        let conn = recorder.snapshot().connections[0].clone();
        assert_eq!(conn.queries.len(), 1_000);
        assert_eq!(conn.queries[0].end_time, Some(1_003));
        assert!(conn.queries[1..].iter().all(|q| q.is_open()));
    }

    #[test]
    fn test_out_of_nesting_order_ends() {
        let (clock, recorder) = recorder();

        recorder.transaction_started(&c("c1"), &t("t1"));
        clock.advance(1);
        recorder.query_started(&c("c1"), &q("q1"));
        clock.advance(1);
        recorder.transaction_ended(&c("c1"), &t("t1"));
        clock.advance(1);
        recorder.query_ended(&c("c1"), &q("q1"), "X");

        let conn = recorder.snapshot().connections[0].clone();
        assert_eq!(conn.transactions[0].end_time, Some(1_002));
        assert_eq!(conn.queries[0].end_time, Some(1_003));
        assert_eq!(conn.queries[0].sql.as_deref(), Some("X"));
    }

    #[test]
    fn test_scripted_sequence_counts_and_ordering() {
        let (clock, recorder) = recorder();
        let n = 5;

        for i in 0..n {
            let conn = c(&format!("c{i}"));
            recorder.connection_acquired(&conn);
            clock.advance(1);
            recorder.transaction_started(&conn, &t(&format!("t{i}")));
            recorder.query_started(&conn, &q(&format!("q{i}")));
            clock.advance(2);
            recorder.query_ended(&conn, &q(&format!("q{i}")), format!("SELECT {i}"));
            recorder.transaction_ended(&conn, &t(&format!("t{i}")));
            clock.advance(1);
            recorder.connection_released(&conn);
        }

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.connections.len(), n);
        assert_eq!(snapshot.queries().count(), n);
        let transactions: Vec<_> = snapshot
            .connections
            .iter()
            .flat_map(|c| c.transactions.iter())
            .collect();
        assert_eq!(transactions.len(), n);

        for conn in &snapshot.connections {
            assert!(conn.start_time <= conn.end_time.unwrap());
            for query in &conn.queries {
                assert!(query.start_time <= query.end_time.unwrap());
            }
            for tx in &conn.transactions {
                assert!(tx.start_time <= tx.end_time.unwrap());
            }
        }
    }

    #[test]
    fn test_snapshot_is_detached() {
        let (_, recorder) = recorder();
        recorder.connection_acquired(&c("c1"));

        let mut snapshot = recorder.snapshot();
        snapshot.connections.clear();

        assert_eq!(recorder.snapshot().connections.len(), 1);
    }

    #[test]
    fn test_concurrent_ingestion() {
        let recorder = Arc::new(Recorder::new());
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let recorder = recorder.clone();
                std::thread::spawn(move || {
                    let conn = c(&format!("c{worker}"));
                    recorder.connection_acquired(&conn);
                    for i in 0..50 {
                        let query = q(&format!("q{i}"));
                        recorder.query_started(&conn, &query);
                        recorder.query_ended(&conn, &query, "SELECT 1");
                    }
                    recorder.connection_released(&conn);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.connections.len(), 8);
        assert_eq!(snapshot.queries().count(), 400);
        assert!(snapshot.queries().all(|q| !q.is_open()));
    }
}
