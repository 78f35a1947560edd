//! Configuration for recording and timeline projection.

use std::time::Duration;

/// Configuration options for the inspector.
///
/// # Example
///
/// ```rust
/// use sea_orm_inspector::InspectorConfig;
/// use std::time::Duration;
///
/// let config = InspectorConfig::default()
///     .with_statement_capture(true)
///     .with_slow_query_threshold(Duration::from_millis(100))
///     .with_grid_interval(Duration::from_secs(1));
/// ```
#[derive(Debug, Clone)]
pub struct InspectorConfig {
    /// Whether to store the full SQL text of each query.
    /// When disabled only a label such as `"SELECT users"` is kept.
    /// Default: `true`
    pub capture_statements: bool,

    /// Whether `BEGIN`/`COMMIT`/`ROLLBACK` issued as plain statements are
    /// routed to the transaction timeline instead of being recorded as queries.
    /// Default: `true`
    pub route_transaction_statements: bool,

    /// Queries exceeding this duration are logged at WARN level.
    /// Default: 500ms
    pub slow_query_threshold: Duration,

    /// Milliseconds of wall-clock time per horizontal pixel.
    /// Default: 2.0
    pub scale_ms_per_px: f64,

    /// Spacing between vertical grid lines.
    /// Default: 500ms
    pub grid_interval: Duration,

    /// Height of one connection row in pixels.
    /// Default: 30.0
    pub row_height: f64,
}

impl Default for InspectorConfig {
    fn default() -> Self {
        Self {
            capture_statements: true,
            route_transaction_statements: true,
            slow_query_threshold: Duration::from_millis(500),
            scale_ms_per_px: 2.0,
            grid_interval: Duration::from_millis(500),
            row_height: 30.0,
        }
    }
}

impl InspectorConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable storing full SQL text.
    ///
    /// **Security Warning**: captured SQL is served verbatim by the snapshot
    /// endpoint. Disable it wherever statements may embed credentials or PII.
    pub fn with_statement_capture(mut self, enabled: bool) -> Self {
        self.capture_statements = enabled;
        self
    }

    /// Enable or disable routing of transaction bracket statements.
    pub fn with_transaction_statement_routing(mut self, enabled: bool) -> Self {
        self.route_transaction_statements = enabled;
        self
    }

    /// Set the threshold for slow query warnings.
    pub fn with_slow_query_threshold(mut self, threshold: Duration) -> Self {
        self.slow_query_threshold = threshold;
        self
    }

    /// Set the horizontal scale. Non-positive and non-finite values are ignored.
    pub fn with_scale(mut self, ms_per_px: f64) -> Self {
        if ms_per_px.is_finite() && ms_per_px > 0.0 {
            self.scale_ms_per_px = ms_per_px;
        }
        self
    }

    /// Set the grid line cadence. A zero interval is ignored.
    pub fn with_grid_interval(mut self, interval: Duration) -> Self {
        if !interval.is_zero() {
            self.grid_interval = interval;
        }
        self
    }

    /// Set the height of one connection row. Non-positive and non-finite
    /// values are ignored.
    pub fn with_row_height(mut self, height: f64) -> Self {
        if height.is_finite() && height > 0.0 {
            self.row_height = height;
        }
        self
    }

    /// Development preset: full SQL, eager slow-query warnings.
    pub fn development() -> Self {
        Self {
            capture_statements: true,
            slow_query_threshold: Duration::from_millis(100),
            ..Self::default()
        }
    }

    /// Production preset: labels only, coarser grid.
    pub fn production() -> Self {
        Self {
            capture_statements: false,
            slow_query_threshold: Duration::from_secs(1),
            grid_interval: Duration::from_secs(1),
            ..Self::default()
        }
    }
}
