//! The export pipeline: database rows in, spreadsheet bytes out.
//!
//! One export is a three-stage cooperative pipeline. An async feed loop
//! pulls rows off a [`ReportSource`] and hands them over a bounded channel
//! to a blocking encoder thread, which commits each row to the streaming
//! XLSX writer whose sink is the HTTP response body channel. Both channels
//! are bounded, so a slow client stalls the encoder, the stalled encoder
//! stops the feed loop, and the unpolled row stream stops reading from the
//! database socket; bytes in flight stay capped at the channel depths.
//!
//! Four things can end an export: the source finishing, the source failing,
//! the encoder/sink failing, and the client going away. Exactly one of them
//! gets to run terminal bookkeeping, chosen by a compare-and-set guard.

use std::io::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use utils::http::endpoint::ChannelWriter;

use crate::memory;
use crate::metrics::{
    EXPORTS_COMPLETED, EXPORTS_FAILED, EXPORTS_IN_FLIGHT, EXPORT_DURATION, EXPORT_PEAK_RSS,
    ROWS_STREAMED,
};
use crate::pool::{is_fatal_transport_error, PoolManager};
use crate::source::{ReportSource, SourceError};
use crate::xlsx::{Cell, Column, SheetSchema, XlsxError, XlsxStreamWriter};

pub const SHEET_NAME: &str = "Report";

/// Memory is sampled on the encoder thread every this many committed rows.
pub const MEMORY_SAMPLE_INTERVAL: u64 = 5_000;

/// Response chunks of roughly this size...
pub const SINK_BUFFER_BYTES: usize = 64 * 1024;
/// ...at most this many of them buffered; together the high-water mark of
/// bytes in flight towards one client.
pub const SINK_CHANNEL_DEPTH: usize = 4;

/// Rows decoded but not yet committed to the encoder.
const ROW_CHANNEL_DEPTH: usize = 16;

/// Worksheet column order; matches the row-source contract.
pub const REPORT_COLUMNS: &[(&str, f64)] = &[
    ("IntColumn", 12.0),
    ("BigIntColumn", 20.0),
    ("DecimalColumn", 18.0),
    ("FloatColumn", 18.0),
    ("BitColumn", 10.0),
    ("GuidColumn", 38.0),
    ("DateColumn", 20.0),
    ("VarcharColumn", 24.0),
    ("TextColumn", 40.0),
    ("JsonColumn", 40.0),
];

pub fn report_schema() -> SheetSchema {
    SheetSchema {
        sheet_name: SHEET_NAME.to_string(),
        columns: REPORT_COLUMNS
            .iter()
            .map(|(header, width)| Column {
                header: (*header).to_string(),
                width: *width,
            })
            .collect(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Encode(#[from] XlsxError),
    #[error("client disconnected mid-export")]
    ClientDisconnect,
    #[error("export aborted after upstream failure")]
    SourceAborted,
}

impl ExportError {
    /// Failure classification used for metrics labels and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ExportError::Source(_) | ExportError::SourceAborted => "database",
            ExportError::Encode(XlsxError::SinkClosed) | ExportError::ClientDisconnect => {
                "disconnect"
            }
            ExportError::Encode(_) => "export",
        }
    }

    pub fn as_db_error(&self) -> Option<&tokio_postgres::Error> {
        match self {
            ExportError::Source(e) => e.as_db_error(),
            _ => None,
        }
    }
}

/// First terminal path to `arm` wins; everything later becomes a no-op.
pub struct StreamGuard(AtomicBool);

impl StreamGuard {
    pub fn new() -> Self {
        StreamGuard(AtomicBool::new(false))
    }

    pub fn arm(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_armed(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for StreamGuard {
    fn default() -> Self {
        Self::new()
    }
}

enum RowEvent {
    Row(Vec<Cell>),
    /// Upstream failed: do not finalize, poison pending.
    Abort,
}

/// Drives one export to its terminal state. Headers are on the wire by the
/// time this runs, so failures here never produce a JSON body: the response
/// stream is poisoned instead and the client sees an aborted transfer.
pub async fn drive(
    mut source: impl ReportSource,
    writer: ChannelWriter,
    pool: Arc<PoolManager>,
) {
    let started = std::time::Instant::now();
    EXPORTS_IN_FLIGHT.inc();
    let guard = StreamGuard::new();

    let (row_tx, row_rx) = mpsc::channel::<RowEvent>(ROW_CHANNEL_DEPTH);
    // a clone of the body channel, watched for the client going away
    let disconnect = writer.tx.clone();
    let encoder = tokio::task::spawn_blocking(move || encode_rows(row_rx, writer));

    let mut upstream_failure: Option<ExportError> = None;
    let mut fed_rows: u64 = 0;
    loop {
        tokio::select! {
            // the response body was dropped: the client is gone, stop
            // pulling rows right away instead of on the next failed flush
            _ = disconnect.closed() => {
                upstream_failure = Some(ExportError::ClientDisconnect);
                break;
            }
            next = source.next_row() => match next {
                Some(Ok(cells)) => {
                    if row_tx.send(RowEvent::Row(cells)).await.is_err() {
                        // encoder is gone; its join result has the story
                        break;
                    }
                    fed_rows += 1;
                }
                Some(Err(e)) => {
                    upstream_failure = Some(e.into());
                    break;
                }
                None => break,
            }
        }
    }
    if upstream_failure.is_some() {
        // tell the encoder to bail out instead of finalizing a clean archive
        let _ = row_tx.send(RowEvent::Abort).await;
    }
    drop(row_tx);

    let (writer, encode_result) = match encoder.await {
        Ok(output) => output,
        Err(e) => {
            error!("export encoder task panicked: {e}");
            source.cancel().await;
            EXPORTS_FAILED.with_label_values(&["internal"]).inc();
            EXPORTS_IN_FLIGHT.dec();
            return;
        }
    };

    let terminal: Result<u64, ExportError> = match (upstream_failure, encode_result) {
        (Some(primary), secondary) => {
            if let Err(e) = secondary {
                debug!("suppressed secondary export failure: {e:#}");
            }
            Err(primary)
        }
        (None, Err(e)) => Err(e),
        (None, Ok(rows)) => Ok(rows),
    };

    match terminal {
        Ok(rows) if guard.arm() => {
            ROWS_STREAMED.inc_by(rows);
            EXPORTS_COMPLETED.inc();
            EXPORT_DURATION.observe(started.elapsed().as_secs_f64());
            info!(
                rows,
                bytes = writer.flushed_bytes(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "export complete"
            );
        }
        Err(e) if guard.arm() => {
            // release the server-side query before anything else
            source.cancel().await;
            // poison the response stream; if any bytes were still buffered
            // the client now sees an aborted transfer, never a clean end of
            // a truncated archive. Best effort: the socket may already be
            // gone, which is fine.
            let _ = writer
                .tx
                .send(Err(std::io::ErrorKind::ConnectionAborted.into()))
                .await;
            if let Some(db) = e.as_db_error() {
                if is_fatal_transport_error(db) {
                    // fire-and-forget: close_and_reset never fails, and the
                    // spawned task owns its errors end to end
                    let pool = pool.clone();
                    tokio::spawn(async move { pool.close_and_reset().await });
                }
            }
            EXPORTS_FAILED.with_label_values(&[e.kind()]).inc();
            warn!(
                rows_fed = fed_rows,
                kind = e.kind(),
                "export failed: {e:#}"
            );
        }
        _ => debug!("terminal action already taken for this export"),
    }
    EXPORTS_IN_FLIGHT.dec();
}

/// Blocking half of the pipeline: commits rows to the spreadsheet encoder
/// and finalizes the archive when the channel closes cleanly. Runs on a
/// `spawn_blocking` thread because the sink write blocks for slow clients.
fn encode_rows(
    mut rows: mpsc::Receiver<RowEvent>,
    mut writer: ChannelWriter,
) -> (ChannelWriter, Result<u64, ExportError>) {
    let result = encode_rows_inner(&mut rows, &mut writer);
    (writer, result)
}

fn encode_rows_inner(
    rows: &mut mpsc::Receiver<RowEvent>,
    writer: &mut ChannelWriter,
) -> Result<u64, ExportError> {
    let schema = report_schema();
    let mut xlsx = XlsxStreamWriter::open(&mut *writer, &schema)?;
    let mut committed: u64 = 0;
    let mut peak_rss: u64 = 0;
    loop {
        match rows.blocking_recv() {
            Some(RowEvent::Row(cells)) => {
                xlsx.add_row(&cells)?;
                committed += 1;
                if committed % MEMORY_SAMPLE_INTERVAL == 0 {
                    if let Some(sample) = memory::sample() {
                        peak_rss = peak_rss.max(sample.rss_bytes);
                    }
                }
            }
            Some(RowEvent::Abort) => return Err(ExportError::SourceAborted),
            None => break,
        }
    }
    // end of rows: only now is the archive structure closed out
    let sink = xlsx.finalize()?;
    sink.flush().map_err(XlsxError::from)?;
    if peak_rss > 0 {
        EXPORT_PEAK_RSS.set(peak_rss as i64);
    }
    Ok(committed)
}

/// In-memory rendition of the same workbook, for the buffered endpoint.
/// Rows were already collected; encoding is pure CPU work.
pub fn encode_buffered(rows: Vec<Vec<Cell>>) -> Result<Vec<u8>, ExportError> {
    let schema = report_schema();
    let mut xlsx = XlsxStreamWriter::open(Vec::new(), &schema)?;
    for cells in &rows {
        xlsx.add_row(cells)?;
    }
    Ok(xlsx.finalize()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use crate::config::DbConf;
    use crate::pool::PoolError;

    #[test]
    fn guard_admits_exactly_one_terminal_path() {
        let guard = StreamGuard::new();
        assert!(!guard.is_armed());
        assert!(guard.arm());
        assert!(!guard.arm());
        assert!(guard.is_armed());
    }

    #[test]
    fn guard_under_concurrent_arming() {
        let guard = Arc::new(StreamGuard::new());
        let winners: usize = std::thread::scope(|s| {
            (0..8)
                .map(|_| {
                    let guard = guard.clone();
                    s.spawn(move || usize::from(guard.arm()))
                })
                .collect::<Vec<_>>()
                .into_iter()
                .map(|h| h.join().unwrap())
                .sum()
        });
        assert_eq!(winners, 1);
    }

    /// In-process row generator standing in for the database: `fail_after`
    /// rows turns the next pull into a mid-stream error.
    struct SyntheticSource {
        remaining: u64,
        fail_after: Option<u64>,
        produced: u64,
        cancelled: bool,
        cancels: Arc<AtomicU32>,
    }

    impl SyntheticSource {
        fn new(rows: u64, fail_after: Option<u64>) -> (Self, Arc<AtomicU32>) {
            let cancels = Arc::new(AtomicU32::new(0));
            (
                SyntheticSource {
                    remaining: rows,
                    fail_after,
                    produced: 0,
                    cancelled: false,
                    cancels: cancels.clone(),
                },
                cancels,
            )
        }

        fn cells(i: u64) -> Vec<Cell> {
            vec![
                Cell::Int(i as i64),
                Cell::Int(i as i64 * 10),
                Cell::Number(format!("{i}.25")),
                Cell::Float(i as f64),
                Cell::Bool(i % 2 == 0),
                Cell::Text(format!("guid-{i}")),
                Cell::Text("2024-03-07 09:30:05".to_string()),
                Cell::Text(format!("name-{i}")),
                Cell::Text("row text".to_string()),
                Cell::Null,
            ]
        }
    }

    #[async_trait::async_trait]
    impl ReportSource for SyntheticSource {
        async fn next_row(&mut self) -> Option<Result<Vec<Cell>, SourceError>> {
            if self.cancelled {
                return None;
            }
            if Some(self.produced) == self.fail_after {
                return Some(Err(SourceError::Pool(PoolError::ShuttingDown)));
            }
            if self.produced == self.remaining {
                return None;
            }
            self.produced += 1;
            Some(Ok(Self::cells(self.produced)))
        }

        async fn cancel(&mut self) {
            self.cancelled = true;
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn idle_pool() -> Arc<PoolManager> {
        Arc::new(PoolManager::new(DbConf {
            host: "127.0.0.1".to_string(),
            port: 1,
            user: "report".to_string(),
            password: "report".to_string(),
            dbname: "reportdb".to_string(),
            max_connections: 1,
            min_connections: 1,
        }))
    }

    /// Drains the response channel like a client would: bytes received, and
    /// the error kind if the stream was poisoned.
    fn spawn_collector(
        mut rx: mpsc::Receiver<std::io::Result<bytes::Bytes>>,
    ) -> tokio::task::JoinHandle<(Vec<u8>, Option<std::io::ErrorKind>)> {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let mut poison = None;
            while let Some(chunk) = rx.recv().await {
                match chunk {
                    Ok(bytes) => buf.write_all(&bytes).unwrap(),
                    Err(e) => {
                        poison = Some(e.kind());
                        break;
                    }
                }
            }
            (buf, poison)
        })
    }

    fn is_complete_archive(bytes: &[u8]) -> bool {
        bytes.len() >= 22 && &bytes[bytes.len() - 22..bytes.len() - 18] == b"PK\x05\x06"
    }

    #[tokio::test]
    async fn drive_streams_a_complete_archive_from_a_synthetic_source() {
        let (source, cancels) = SyntheticSource::new(3, None);
        let (tx, rx) = mpsc::channel(SINK_CHANNEL_DEPTH);
        let collector = spawn_collector(rx);

        drive(source, ChannelWriter::new(SINK_BUFFER_BYTES, tx), idle_pool()).await;

        let (archive, poison) = collector.await.unwrap();
        assert_eq!(poison, None);
        assert!(is_complete_archive(&archive));
        // the source finished on its own; no cancel round-trip was made
        assert_eq!(cancels.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn mid_stream_failure_aborts_the_transfer_and_cancels_the_source() {
        let (source, cancels) = SyntheticSource::new(200, Some(50));
        let (tx, rx) = mpsc::channel(SINK_CHANNEL_DEPTH);
        let collector = spawn_collector(rx);

        drive(source, ChannelWriter::new(SINK_BUFFER_BYTES, tx), idle_pool()).await;

        let (received, poison) = collector.await.unwrap();
        // the stream was poisoned, so the client sees an aborted transfer,
        // and whatever made it out is not a finished archive
        assert_eq!(poison, Some(std::io::ErrorKind::ConnectionAborted));
        assert!(!is_complete_archive(&received));
        // exactly one terminal handler ran, and it cancelled the source
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn client_disconnect_cancels_the_source_promptly() {
        let (source, cancels) = SyntheticSource::new(1_000_000, None);
        let (tx, rx) = mpsc::channel(SINK_CHANNEL_DEPTH);
        // the client goes away before reading a single chunk
        drop(rx);

        tokio::time::timeout(
            Duration::from_secs(5),
            drive(source, ChannelWriter::new(SINK_BUFFER_BYTES, tx), idle_pool()),
        )
        .await
        .expect("drive must notice the disconnect without draining the source");

        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn clean_channel_close_finalizes_the_archive() {
        let (row_tx, row_rx) = mpsc::channel::<RowEvent>(4);
        let (tx, rx) = mpsc::channel(64);
        let writer = ChannelWriter::new(SINK_BUFFER_BYTES, tx);
        let collector = spawn_collector(rx);
        drop(row_tx); // no rows at all
        let (writer, result) = tokio::task::spawn_blocking(move || encode_rows(row_rx, writer))
            .await
            .unwrap();
        assert_eq!(result.unwrap(), 0);
        // release the writer's sender so the drain below terminates
        drop(writer);

        let (archive, poison) = collector.await.unwrap();
        assert_eq!(poison, None);
        assert!(is_complete_archive(&archive));
    }

    #[tokio::test]
    async fn abort_skips_finalization() {
        let (row_tx, row_rx) = mpsc::channel::<RowEvent>(4);
        let (tx, rx) = mpsc::channel(64);
        let writer = ChannelWriter::new(SINK_BUFFER_BYTES, tx);
        let collector = spawn_collector(rx);
        row_tx.send(RowEvent::Abort).await.unwrap();
        drop(row_tx);
        let (writer, result) = tokio::task::spawn_blocking(move || encode_rows(row_rx, writer))
            .await
            .unwrap();
        assert!(matches!(result.unwrap_err(), ExportError::SourceAborted));
        drop(writer);

        let (received, _poison) = collector.await.unwrap();
        assert!(!is_complete_archive(&received));
    }

    #[test]
    fn buffered_encoding_round_trip() {
        let bytes = encode_buffered(Vec::new()).unwrap();
        assert_eq!(&bytes[0..2], b"PK");
        assert!(is_complete_archive(&bytes));

        let rows = vec![SyntheticSource::cells(1), SyntheticSource::cells(2)];
        let bytes = encode_buffered(rows).unwrap();
        assert!(is_complete_archive(&bytes));
    }

    #[test]
    fn schema_matches_the_contract_width() {
        assert_eq!(report_schema().columns.len(), 10);
        assert_eq!(report_schema().columns[0].header, "IntColumn");
        assert_eq!(report_schema().columns[9].header, "JsonColumn");
    }
}
