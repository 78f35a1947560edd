//! The timeline data model.
//!
//! A [`Recording`] owns connections, and each [`Connection`] owns the queries
//! and transactions observed on it. Every timestamp is in milliseconds since
//! the Unix epoch. Values handed out by [`Recorder::snapshot`] are detached
//! copies; changing them does not affect the recorder.
//!
//! [`Recorder::snapshot`]: crate::Recorder::snapshot

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::identity::{ConnectionKey, QueryKey, TransactionKey};

/// Anything with a start and an optional end.
pub trait Interval {
    fn start_time(&self) -> i64;
    fn end_time(&self) -> Option<i64>;

    /// `true` while no end has been recorded.
    fn is_open(&self) -> bool {
        self.end_time().is_none()
    }

    /// Elapsed milliseconds, or `None` while still open.
    fn duration_ms(&self) -> Option<i64> {
        self.end_time().map(|end| end - self.start_time())
    }
}

/// Root aggregate of everything observed by one recorder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recording {
    /// Stamped at the first explicit connection acquisition, never rewritten.
    pub start_time: Option<i64>,
    pub connections: Vec<Connection>,
}

impl Recording {
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn connection(&self, key: &ConnectionKey) -> Option<&Connection> {
        self.connections.iter().find(|c| &c.id == key)
    }

    /// Every query across all connections, in connection order.
    pub fn queries(&self) -> impl Iterator<Item = &Query> {
        self.connections.iter().flat_map(|c| c.queries.iter())
    }

    /// Time zero of the timeline.
    ///
    /// Falls back to the earliest connection start when only implicit
    /// connections (never explicitly acquired) have been seen.
    pub fn origin(&self) -> Option<i64> {
        self.start_time
            .or_else(|| self.connections.iter().map(|c| c.start_time).min())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// One logical database connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: ConnectionKey,
    pub start_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    pub queries: Vec<Query>,
    pub transactions: Vec<Transaction>,
}

impl Connection {
    pub(crate) fn new(id: ConnectionKey, start_time: i64) -> Self {
        Self {
            id,
            start_time,
            end_time: None,
            queries: Vec::new(),
            transactions: Vec::new(),
        }
    }

    pub fn query(&self, key: &QueryKey) -> Option<&Query> {
        self.queries.iter().find(|q| &q.id == key)
    }

    pub fn transaction(&self, key: &TransactionKey) -> Option<&Transaction> {
        self.transactions.iter().find(|t| &t.id == key)
    }

    /// The most recently started transaction that is still open.
    pub fn open_transaction(&self) -> Option<&Transaction> {
        self.transactions.iter().rev().find(|t| t.is_open())
    }
}

impl Interval for Connection {
    fn start_time(&self) -> i64 {
        self.start_time
    }

    fn end_time(&self) -> Option<i64> {
        self.end_time
    }
}

/// One statement executed on a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    pub id: QueryKey,
    pub start_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    /// Set together with `end_time`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
}

impl Query {
    pub(crate) fn new(id: QueryKey, start_time: i64) -> Self {
        Self {
            id,
            start_time,
            end_time: None,
            sql: None,
        }
    }
}

impl Interval for Query {
    fn start_time(&self) -> i64 {
        self.start_time
    }

    fn end_time(&self) -> Option<i64> {
        self.end_time
    }
}

/// A transaction bracket on a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: TransactionKey,
    pub start_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
}

impl Transaction {
    pub(crate) fn new(id: TransactionKey, start_time: i64) -> Self {
        Self {
            id,
            start_time,
            end_time: None,
        }
    }
}

impl Interval for Transaction {
    fn start_time(&self) -> i64 {
        self.start_time
    }

    fn end_time(&self) -> Option<i64> {
        self.end_time
    }
}
