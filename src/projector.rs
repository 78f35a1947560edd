//! Projection of a recording into screen-space geometry.
//!
//! Everything here is a pure function of a [`Recording`] snapshot and an
//! explicit `now`. Open intervals extend to `now`.

use serde::Serialize;

use crate::config::InspectorConfig;
use crate::identity::ConnectionKey;
use crate::recording::{Interval, Recording};

/// Drawing layer of a bar. Declaration order is the z-order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Layer {
    Connection,
    Transaction,
    Query,
}

/// One rectangle on the timeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Bar {
    pub layer: Layer,
    pub id: String,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    /// Still in flight; the bar currently ends at `now`.
    pub open: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// One connection's lane.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Row {
    pub connection: ConnectionKey,
    pub y: f64,
    pub height: f64,
    /// Bars sorted back to front.
    pub bars: Vec<Bar>,
}

/// A vertical guide line.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GridLine {
    /// Absolute time of the line.
    pub time: i64,
    pub x: f64,
    pub label: String,
}

/// Complete renderable geometry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Timeline {
    pub origin: i64,
    pub now: i64,
    pub width: f64,
    pub height: f64,
    pub rows: Vec<Row>,
    pub grid: Vec<GridLine>,
    /// Baseline for grid labels, below the last row.
    pub label_y: f64,
}

/// Maps the time domain onto the pixel domain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projector {
    scale_ms_per_px: f64,
    grid_interval_ms: i64,
    row_height: f64,
}

impl Default for Projector {
    fn default() -> Self {
        Self::new(&InspectorConfig::default())
    }
}

impl Projector {
    pub fn new(config: &InspectorConfig) -> Self {
        Self {
            scale_ms_per_px: config.scale_ms_per_px,
            grid_interval_ms: i64::try_from(config.grid_interval.as_millis())
                .unwrap_or(i64::MAX)
                .max(1),
            row_height: config.row_height,
        }
    }

    /// Pixels covered by `millis` of elapsed time.
    pub fn relative_x(&self, millis: i64) -> f64 {
        millis as f64 / self.scale_ms_per_px
    }

    /// X coordinate of `timestamp`, or of `now` when the timestamp is absent.
    pub fn absolute_x(&self, origin: i64, timestamp: Option<i64>, now: i64) -> f64 {
        self.relative_x(timestamp.unwrap_or(now) - origin)
    }

    /// Horizontal extent of an interval; open intervals run to `now`.
    pub fn width<I: Interval + ?Sized>(&self, interval: &I, origin: i64, now: i64) -> f64 {
        let end = self.absolute_x(origin, interval.end_time(), now);
        let start = self.absolute_x(origin, Some(interval.start_time()), now);
        (end - start).max(0.0)
    }

    /// Guides every grid interval from `origin` through `now`, labelled with
    /// elapsed time.
    pub fn grid_lines(&self, origin: i64, now: i64) -> Vec<GridLine> {
        let total = now - origin;
        let mut lines = Vec::new();
        let mut elapsed = 0;
        while elapsed < total {
            lines.push(GridLine {
                time: origin + elapsed,
                x: self.relative_x(elapsed),
                label: format!("{elapsed}ms"),
            });
            elapsed += self.grid_interval_ms;
        }
        lines
    }

    /// Lay out the whole recording as seen at `now`.
    pub fn project(&self, recording: &Recording, now: i64) -> Timeline {
        let origin = recording.origin().unwrap_or(now);
        let inset = self.row_height / 6.0;

        let rows: Vec<Row> = recording
            .connections
            .iter()
            .enumerate()
            .map(|(index, connection)| {
                let y = index as f64 * self.row_height;
                let mut bars = Vec::with_capacity(
                    1 + connection.transactions.len() + connection.queries.len(),
                );

                bars.push(Bar {
                    layer: Layer::Connection,
                    id: connection.id.to_string(),
                    x: self.absolute_x(origin, Some(connection.start_time), now),
                    y,
                    width: self.width(connection, origin, now),
                    height: self.row_height,
                    open: connection.is_open(),
                    label: None,
                });

                bars.extend(connection.transactions.iter().map(|tx| Bar {
                    layer: Layer::Transaction,
                    id: tx.id.to_string(),
                    x: self.absolute_x(origin, Some(tx.start_time), now),
                    y,
                    width: self.width(tx, origin, now),
                    height: self.row_height,
                    open: tx.is_open(),
                    label: None,
                }));

                bars.extend(connection.queries.iter().map(|query| Bar {
                    layer: Layer::Query,
                    id: query.id.to_string(),
                    x: self.absolute_x(origin, Some(query.start_time), now),
                    y: y + inset,
                    width: self.width(query, origin, now),
                    height: self.row_height - 2.0 * inset,
                    open: query.is_open(),
                    label: query.sql.clone(),
                }));

                Row {
                    connection: connection.id.clone(),
                    y,
                    height: self.row_height,
                    bars,
                }
            })
            .collect();

        let lanes = rows.len() as f64;
        Timeline {
            origin,
            now,
            width: self.relative_x(now - origin).max(0.0),
            height: self.row_height * (lanes + 3.0),
            grid: self.grid_lines(origin, now),
            label_y: self.row_height * (lanes + 2.0),
            rows,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{QueryKey, TransactionKey};
    use crate::recording::{Connection, Query, Transaction};
    use std::time::Duration;

    fn recording() -> Recording {
        Recording {
            start_time: Some(10_000),
            connections: vec![
                Connection {
                    id: ConnectionKey::from("c1"),
                    start_time: 10_000,
                    end_time: Some(10_400),
                    queries: vec![Query {
                        id: QueryKey::from("q1"),
                        start_time: 10_100,
                        end_time: Some(10_150),
                        sql: Some("SELECT 1".into()),
                    }],
                    transactions: vec![Transaction {
                        id: TransactionKey::from("t1"),
                        start_time: 10_050,
                        end_time: Some(10_200),
                    }],
                },
                Connection {
                    id: ConnectionKey::from("c2"),
                    start_time: 10_200,
                    end_time: None,
                    queries: vec![Query {
                        id: QueryKey::from("q2"),
                        start_time: 10_300,
                        end_time: None,
                        sql: None,
                    }],
                    transactions: vec![],
                },
            ],
        }
    }

    #[test]
    fn test_relative_and_absolute_x() {
        let projector = Projector::default();

        assert_eq!(projector.relative_x(100), 50.0);
        assert_eq!(projector.absolute_x(1_000, Some(1_200), 5_000), 100.0);
        assert_eq!(projector.absolute_x(1_000, None, 1_400), 200.0);
    }

    #[test]
    fn test_width_of_open_interval_runs_to_now() {
        let projector = Projector::default();
        let query = Query {
            id: QueryKey::from("q"),
            start_time: 1_100,
            end_time: None,
            sql: None,
        };

        assert_eq!(projector.width(&query, 1_000, 1_500), 200.0);
    }

    #[test]
    fn test_grid_lines_cadence_and_labels() {
        let projector = Projector::default();
        let lines = projector.grid_lines(10_000, 11_200);

        let labels: Vec<_> = lines.iter().map(|l| l.label.as_str()).collect();
        assert_eq!(labels, ["0ms", "500ms", "1000ms"]);
        assert_eq!(lines[1].time, 10_500);
        assert_eq!(lines[1].x, 250.0);
    }

    #[test]
    fn test_grid_follows_configured_interval() {
        let config = InspectorConfig::default().with_grid_interval(Duration::from_secs(1));
        let lines = Projector::new(&config).grid_lines(0, 3_000);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[2].label, "2000ms");
    }

    #[test]
    fn test_project_rows_and_z_order() {
        let timeline = Projector::default().project(&recording(), 10_500);

        assert_eq!(timeline.origin, 10_000);
        assert_eq!(timeline.width, 250.0);
        assert_eq!(timeline.height, 150.0);
        assert_eq!(timeline.label_y, 120.0);
        assert_eq!(timeline.rows.len(), 2);
        assert_eq!(timeline.rows[1].y, 30.0);

        let layers: Vec<_> = timeline.rows[0].bars.iter().map(|b| b.layer).collect();
        assert_eq!(layers, [Layer::Connection, Layer::Transaction, Layer::Query]);
        assert!(layers.windows(2).all(|w| w[0] <= w[1]));

        let query = &timeline.rows[0].bars[2];
        assert_eq!(query.x, 50.0);
        assert_eq!(query.width, 25.0);
        assert_eq!(query.y, 5.0);
        assert_eq!(query.height, 20.0);
        assert_eq!(query.label.as_deref(), Some("SELECT 1"));
    }

    #[test]
    fn test_project_open_intervals_extend_to_now() {
        let timeline = Projector::default().project(&recording(), 10_500);
        let row = &timeline.rows[1];

        let connection = &row.bars[0];
        assert!(connection.open);
        assert_eq!(connection.x, 100.0);
        assert_eq!(connection.width, 150.0);

        let query = &row.bars[1];
        assert!(query.open);
        assert_eq!(query.width, 100.0);
    }

    #[test]
    fn test_project_empty_recording() {
        let timeline = Projector::default().project(&Recording::default(), 42);

        assert!(timeline.rows.is_empty());
        assert!(timeline.grid.is_empty());
        assert_eq!(timeline.width, 0.0);
        assert_eq!(timeline.origin, 42);
    }
}
