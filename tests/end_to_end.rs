//! A workflow against an on-disk SQLite store, run twice like two separate
//! invocations of the worker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::NaiveDate;
use lerelais::phase::{DateWindow, FetchError, Phase, PhaseConfig};
use lerelais::rapprochement::{DateRange, SequenceRange};
use lerelais::stockage::{DataKind, WorkItemId};
use lerelais::{Fetcher, PhasedWorkflow, Reconciler, SqliteStore, Store, UniverseFilter, WorkflowConfig};
use tempfile::TempDir;

struct CountingFetcher {
    calls: AtomicUsize,
    missing_sequence: u32,
}

impl Fetcher for CountingFetcher {
    fn fetch(&self, kind: DataKind, id: &WorkItemId) -> Result<String, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if id.sequence == self.missing_sequence {
            return Err(FetchError::NotFound);
        }
        Ok(format!("{{\"kind\":\"{}\",\"item\":\"{}\"}}", kind, id))
    }
}

fn workflow_config(dir: &TempDir) -> WorkflowConfig {
    let start = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
    let end = NaiveDate::from_ymd_opt(2024, 2, 4).unwrap();
    WorkflowConfig::new(
        dir.path().join("state/workflow.json"),
        vec!["01".into(), "02".into(), "03".into()],
        DateRange::new(start, end).unwrap(),
        SequenceRange::new(1, 5).unwrap(),
    )
    .with_today(NaiveDate::from_ymd_opt(2024, 9, 1).unwrap())
    .with_phases(vec![
        (Phase::Programs, PhaseConfig::new(4, DateWindow::Unrestricted)),
        (Phase::Results, PhaseConfig::new(6, DateWindow::PastOnly)),
    ])
}

#[tokio::test(flavor = "multi_thread")]
async fn second_invocation_fetches_only_what_failed() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("relais.db");

    let first = CountingFetcher {
        calls: AtomicUsize::new(0),
        missing_sequence: 5,
    };
    let first = Arc::new(first);
    {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&db).unwrap());
        let report = PhasedWorkflow::new(workflow_config(&dir), store, first.clone())
            .run(false)
            .await
            .unwrap();

        // 3 facilities x 4 days x 5 sequences, per phase
        assert_eq!(first.calls.load(Ordering::SeqCst), 120);
        assert_eq!(report.processed(), 96);
        assert_eq!(report.errored(), 24);
        assert!(!report.stopped);
    }

    let second = Arc::new(CountingFetcher {
        calls: AtomicUsize::new(0),
        missing_sequence: 0,
    });
    let store = Arc::new(SqliteStore::open(&db).unwrap());
    let report = PhasedWorkflow::new(workflow_config(&dir), store.clone(), second.clone())
        .run(false)
        .await
        .unwrap();

    assert_eq!(second.calls.load(Ordering::SeqCst), 24);
    assert_eq!(report.processed(), 24);
    assert_eq!(report.errored(), 0);

    for kind in [DataKind::Programs, DataKind::Results] {
        let filter = UniverseFilter::new(
            kind,
            ["01", "02", "03"],
            DateRange::new(
                NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 2, 4).unwrap(),
            )
            .unwrap(),
            SequenceRange::new(1, 5).unwrap(),
        )
        .unwrap();
        let reconciliation = Reconciler::new(store.clone()).reconcile(&filter).unwrap();
        assert!(reconciliation.missing.is_empty(), "{kind}");
    }
}
