//! # sea-orm-inspector
//!
//! A live timeline of what your SeaORM connections are doing.
//!
//! Wrap a connection and every statement, transaction and connection
//! lifetime is recorded into an in-memory [`Recorder`]. The recording can be
//! snapshotted at any moment, including while queries are still in flight,
//! and projected into pixel coordinates for a dashboard.
//!
//! ## Features
//!
//! - **Drop-in Wrapper**: `InspectedConnection` implements SeaORM's connection traits
//! - **Out-of-order Safe**: every recorder operation finds-or-creates its target and
//!   ignores stale or repeated end events
//! - **Stable Identities**: a connection keeps one timeline row even when a
//!   transaction presents it as a different object
//! - **Timeline Projection**: pure time-to-pixel mapping with grid lines
//! - **HTTP Endpoint**: optional axum router serving snapshots (feature `server`)
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sea_orm::Database;
//! use sea_orm_inspector::prelude::*;
//!
//! let recorder = Arc::new(Recorder::new());
//! let db = Database::connect("postgres://localhost/mydb")
//!     .await?
//!     .with_inspector(recorder.clone());
//!
//! let cakes = Cake::find().all(&db).await?;
//!
//! let timeline = Projector::default().project(&recorder.snapshot(), recorder.now());
//! ```
//!
//! ## Snapshot Format
//!
//! ```json
//! { "startTime": 1700000000000,
//!   "connections": [{ "id": "…", "startTime": 1700000000000, "endTime": 1700000000500,
//!                     "queries": [{ "id": "…", "startTime": 1700000000010,
//!                                   "endTime": 1700000000020, "sql": "SELECT 1" }],
//!                     "transactions": [{ "id": "…", "startTime": 1700000000005 }] }] }
//! ```
//!
//! Fields without a value (`endTime` of open intervals, `sql` of running
//! queries) are omitted.

mod clock;
mod config;
mod connection;
mod error;
mod identity;
mod projector;
mod recorder;
mod recording;
pub mod statement;

#[cfg(feature = "server")]
pub mod server;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::InspectorConfig;
pub use connection::{InspectedConnection, InspectedTransaction, InspectorExt};
pub use error::{InspectorError, Result};
pub use identity::{
    ConnectionKey, IdentityResolver, IdentitySlot, QueryKey, TransactionKey, UpstreamHandle,
};
pub use projector::{Bar, GridLine, Layer, Projector, Row, Timeline};
pub use recorder::Recorder;
pub use recording::{Connection, Interval, Query, Recording, Transaction};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        InspectedConnection, InspectorConfig, InspectorExt, Projector, Recorder, Recording,
    };
}
