use std::io;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use datapull::{
    log_app_bind, log_app_start, log_recovery, DatasetParams, DatasetRegistry, HttpReply,
    IngestionOrchestrator, LoggingConfig, RemoteClient, RemoteConfig, RemoteTransport, Sleeper,
    SqliteRegistry, TableStore, TaskKind, TransportError, DEFAULT_TIME_END, DEFAULT_TIME_START,
};
use serde_json::Value;
use tracing::dispatcher::with_default;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriter;

#[derive(Clone, Default)]
struct SharedWriter {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedWriter {
    fn output_string(&self) -> String {
        let bytes = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        String::from_utf8_lossy(&bytes).to_string()
    }
}

struct SharedWriterGuard {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        out.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_logs(max_level: Level, f: impl FnOnce()) -> String {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_ansi(false)
        .with_max_level(max_level)
        .with_writer(writer.clone())
        .finish();
    let dispatch = tracing::Dispatch::new(subscriber);

    with_default(&dispatch, f);
    writer.output_string()
}

fn events(logs: &str) -> Vec<Value> {
    logs.lines()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .collect()
}

/// Column "101" always refuses connections, every other call returns one row.
struct PartialOutage;

impl RemoteTransport for PartialOutage {
    fn post_form(
        &self,
        _url: &str,
        form: &[(&str, &str)],
        _timeout: Duration,
    ) -> Result<HttpReply, TransportError> {
        let packet: Value = serde_json::from_str(form[0].1).expect("packet should be JSON");
        if packet["params"]["row_id"] == 101 {
            return Err(TransportError::connect("connection refused"));
        }
        if packet["params"]["current_date"] == "20250911" {
            return Ok(HttpReply {
                status: 200,
                body: String::new(),
            });
        }
        Ok(HttpReply {
            status: 200,
            body: "[[1757437200000, 1.0]]".to_string(),
        })
    }
}

struct NoSleep;

impl Sleeper for NoSleep {
    fn sleep(&self, _duration: Duration) {}
}

fn orchestrator(dir: &std::path::Path) -> IngestionOrchestrator {
    let registry: Arc<dyn DatasetRegistry> =
        Arc::new(SqliteRegistry::open_in_memory().expect("in-memory registry should open"));
    let client = RemoteClient::with_transport(
        RemoteConfig::new("https://remote.test", "token", "key"),
        Arc::new(PartialOutage),
    )
    .with_sleeper(Arc::new(NoSleep));
    IngestionOrchestrator::new(registry, client, TableStore::new(dir), 1)
}

fn params(features: &[&str]) -> DatasetParams {
    DatasetParams {
        name: "boiler".to_string(),
        task_kind: TaskKind::Anomaly,
        description: String::new(),
        features: features.iter().map(|f| f.to_string()).collect(),
        target: None,
        start_date: "20250910".to_string(),
        end_date: "20250911".to_string(),
        time_start: DEFAULT_TIME_START.to_string(),
        time_end: DEFAULT_TIME_END.to_string(),
    }
}

#[test]
fn failed_run_logs_retries_skipped_days_and_failure() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let orchestrator = orchestrator(dir.path());
    orchestrator
        .registry()
        .create(&params(&["100", "101"]))
        .expect("dataset should be created");

    let logs = capture_logs(Level::INFO, || {
        orchestrator
            .run("boiler")
            .expect_err("column 101 has no data");
    });

    assert!(logs.contains("\"event\":\"pipeline.run.started\""));
    assert!(logs.contains("\"event\":\"remote.history.empty\""));
    assert!(logs.contains("\"event\":\"remote.retry.attempt\""));
    assert!(logs.contains("\"event\":\"remote.retries_exhausted\""));
    assert!(logs.contains("\"event\":\"range.day.skipped\""));

    let failed = events(&logs)
        .into_iter()
        .find(|event| event["fields"]["event"] == "pipeline.run.failed")
        .expect("run failure should be logged");
    assert_eq!(failed["level"], "ERROR");
    assert_eq!(failed["fields"]["dataset"], "boiler");
    assert_eq!(failed["fields"]["error_kind"], "no_data_retrieved");
}

#[test]
fn events_below_the_orchestrator_name_the_dataset() {
    for workers in [1, 2] {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let orchestrator = orchestrator(dir.path()).with_workers(workers);
        orchestrator
            .registry()
            .create(&params(&["100", "101"]))
            .expect("dataset should be created");

        let logs = capture_logs(Level::DEBUG, || {
            orchestrator
                .run("boiler")
                .expect_err("column 101 has no data");
        });

        let nested: Vec<Value> = events(&logs)
            .into_iter()
            .filter(|event| {
                let name = event["fields"]["event"].as_str().unwrap_or_default();
                name.starts_with("range.") || name.starts_with("remote.")
            })
            .collect();
        for name in [
            "range.day.skipped",
            "range.column.fetched",
            "remote.retries_exhausted",
            "remote.history.empty",
        ] {
            assert!(
                nested.iter().any(|event| event["fields"]["event"] == name),
                "missing {name} with {workers} worker(s)"
            );
        }
        for event in &nested {
            assert_eq!(
                event["span"]["dataset"], "boiler",
                "event without dataset span: {event}"
            );
        }
    }
}

#[test]
fn successful_run_logs_summary_event() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let orchestrator = orchestrator(dir.path());
    orchestrator
        .registry()
        .create(&params(&["100"]))
        .expect("dataset should be created");

    let logs = capture_logs(Level::INFO, || {
        orchestrator.run("boiler").expect("run should succeed");
    });

    let succeeded = events(&logs)
        .into_iter()
        .find(|event| event["fields"]["event"] == "pipeline.run.succeeded")
        .expect("success should be logged");
    assert_eq!(succeeded["fields"]["rows"], 1);
    assert_eq!(succeeded["fields"]["interval_minutes"], 0);
    assert!(logs.contains("\"event\":\"storage.table.written\""));
}

#[test]
fn lifecycle_helpers_emit_baseline_events() {
    let logs = capture_logs(Level::INFO, || {
        let cfg = LoggingConfig::default();
        log_app_start("ingest_server", &cfg);
        log_app_bind(
            "ingest_server",
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080),
        );
        log_recovery(&["boiler".to_string()]);
        log_recovery(&[]);
    });

    assert!(logs.contains("\"event\":\"app.start\""));
    assert!(logs.contains("\"event\":\"app.bind\""));
    assert!(logs.contains("\"event\":\"pipeline.recovery.orphans_failed\""));
    assert!(logs.contains("\"event\":\"pipeline.recovery.clean\""));
}
