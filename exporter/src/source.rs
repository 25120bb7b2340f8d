//! Streaming delivery of report rows from the database.
//!
//! Rows arrive one at a time through a pull interface: not polling is the
//! backpressure, dropping the handle releases the pool slot. Startup
//! failures (bad procedure, permissions, connect errors) are distinct from
//! mid-stream failures so callers can still send a structured error response
//! while nothing has been written.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_postgres::types::ToSql;
use tokio_postgres::{CancelToken, NoTls, Row, RowStream};
use tracing::warn;

use crate::pool::{PoolError, PoolManager};
use crate::xlsx::Cell;

/// The row-source contract: one result set with exactly these columns, in
/// server order. Decimal values are projected to text so their precision
/// survives the trip.
pub const REPORT_QUERY: &str = concat!(
    r#"SELECT "IntColumn", "BigIntColumn", "DecimalColumn"::text AS "DecimalColumn", "#,
    r#""FloatColumn", "BitColumn", "GuidColumn", "DateColumn", "VarcharColumn", "#,
    r#""TextColumn", "JsonColumn" FROM sp_generate_data($1)"#
);

/// Columns in the projection above.
const REPORT_COLUMN_COUNT: usize = 10;

pub const QUERY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("report query failed to start: {0}")]
    Start(tokio_postgres::Error),
    #[error("report query did not start within {}s", QUERY_TIMEOUT.as_secs())]
    StartTimeout,
    #[error("row stream failed: {0}")]
    Read(tokio_postgres::Error),
    #[error("could not decode report row: {0}")]
    Decode(tokio_postgres::Error),
}

impl SourceError {
    /// The driver-level error, if any, for pool-reset classification.
    pub fn as_db_error(&self) -> Option<&tokio_postgres::Error> {
        match self {
            SourceError::Start(e) | SourceError::Read(e) | SourceError::Decode(e) => Some(e),
            SourceError::Pool(_) | SourceError::StartTimeout => None,
        }
    }
}

/// Pull interface the export pipeline drives. The live implementation
/// streams from the database; tests substitute an in-process generator.
#[async_trait]
pub trait ReportSource: Send {
    /// The next row in result-set order, already projected to worksheet
    /// column order; `None` after the last row. Nothing is delivered once
    /// the source is cancelled or has failed.
    async fn next_row(&mut self) -> Option<Result<Vec<Cell>, SourceError>>;

    /// Stops row production and releases upstream resources. Idempotent.
    async fn cancel(&mut self);
}

pub struct RowSource {
    rows: Pin<Box<RowStream>>,
    // held for the lifetime of the stream; dropping it returns the pool slot
    _client: deadpool_postgres::Object,
    cancel: CancelToken,
    cancelled: bool,
    done: bool,
}

impl RowSource {
    /// Checks a connection out of the pool and starts the report query in
    /// streaming mode.
    pub async fn start(pool: &PoolManager, row_count: i64) -> Result<RowSource, SourceError> {
        let client = pool.acquire().await?;
        let cancel = client.cancel_token();
        let params: &[&(dyn ToSql + Sync)] = &[&row_count];
        let rows = tokio::time::timeout(
            QUERY_TIMEOUT,
            client.query_raw(REPORT_QUERY, slice_iter(params)),
        )
        .await
        .map_err(|_| SourceError::StartTimeout)?
        .map_err(SourceError::Start)?;
        Ok(RowSource {
            rows: Box::pin(rows),
            _client: client,
            cancel,
            cancelled: false,
            done: false,
        })
    }
}

#[async_trait]
impl ReportSource for RowSource {
    async fn next_row(&mut self) -> Option<Result<Vec<Cell>, SourceError>> {
        if self.cancelled || self.done {
            return None;
        }
        match self.rows.next().await {
            Some(Ok(row)) => match row_to_cells(&row) {
                Ok(cells) => Some(Ok(cells)),
                Err(e) => {
                    self.done = true;
                    Some(Err(SourceError::Decode(e)))
                }
            },
            Some(Err(e)) => {
                self.done = true;
                Some(Err(SourceError::Read(e)))
            }
            None => {
                self.done = true;
                None
            }
        }
    }

    /// Asks the server to stop producing rows. A failed cancel request is
    /// logged and otherwise ignored, since dropping the source releases the
    /// connection either way.
    async fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        if let Err(e) = self.cancel.cancel_query(NoTls).await {
            warn!("failed to cancel report query: {e}");
        }
    }
}

/// Projects one database row into worksheet column order.
fn row_to_cells(row: &Row) -> Result<Vec<Cell>, tokio_postgres::Error> {
    fn opt<T>(v: Option<T>, f: impl FnOnce(T) -> Cell) -> Cell {
        v.map(f).unwrap_or(Cell::Null)
    }

    let mut cells = Vec::with_capacity(REPORT_COLUMN_COUNT);
    cells.push(opt(row.try_get::<_, Option<i32>>(0)?, |v| {
        Cell::Int(v as i64)
    }));
    cells.push(opt(row.try_get::<_, Option<i64>>(1)?, Cell::Int));
    // decimal arrives as text (see the projection) and passes through intact
    cells.push(opt(row.try_get::<_, Option<String>>(2)?, Cell::Number));
    cells.push(opt(row.try_get::<_, Option<f64>>(3)?, Cell::Float));
    cells.push(opt(row.try_get::<_, Option<bool>>(4)?, Cell::Bool));
    cells.push(opt(row.try_get::<_, Option<uuid::Uuid>>(5)?, |v| {
        Cell::Text(v.to_string())
    }));
    cells.push(opt(
        row.try_get::<_, Option<chrono::NaiveDateTime>>(6)?,
        |v| Cell::Text(v.format("%Y-%m-%d %H:%M:%S").to_string()),
    ));
    cells.push(opt(row.try_get::<_, Option<String>>(7)?, Cell::Text));
    cells.push(opt(row.try_get::<_, Option<String>>(8)?, Cell::Text));
    cells.push(opt(row.try_get::<_, Option<serde_json::Value>>(9)?, |v| {
        Cell::Text(v.to_string())
    }));
    Ok(cells)
}

fn slice_iter<'a>(
    s: &'a [&'a (dyn ToSql + Sync)],
) -> impl ExactSizeIterator<Item = &'a dyn ToSql> + 'a {
    s.iter().map(|s| *s as _)
}
