//! Test Harness
//!
//! A full engine over a temp-dir store with the canned fetcher and a
//! hand-driven clock, plus helpers that drive a document through the whole
//! ingestion pipeline deterministically: tasks are drained on the calling
//! thread and countdowns are satisfied by advancing the clock, not by
//! sleeping.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tempfile::TempDir;

use alexandria_core::{
    Engine, FetchedDocument, Gateways, ManualClock, Resource, ResourceOverrides, Settings,
    StaticFetcher,
};

/// An engine wired for tests: temp store, canned fetcher, manual clock,
/// no worker pool.
pub struct TestEngine {
    /// The engine under test
    pub engine: Arc<Engine>,
    /// The fetcher serving canned documents
    pub fetcher: Arc<StaticFetcher>,
    /// The injected clock
    pub clock: Arc<ManualClock>,
    _dir: TempDir,
}

impl TestEngine {
    /// Fresh engine in a temp directory.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let settings = Settings {
            database_path: Some(dir.path().join("alexandria.db")),
            ..Default::default()
        };
        let fetcher = Arc::new(StaticFetcher::new());
        let fetcher_dyn: Arc<dyn alexandria_core::ContentFetcher> = fetcher.clone();
        let clock = Arc::new(ManualClock::starting_at(Utc::now()));
        let clock_dyn: Arc<dyn alexandria_core::Clock> = clock.clone();

        let mut gateways = Gateways::local(&settings);
        gateways.clock = clock_dyn;

        let engine = Engine::open_with(settings, fetcher_dyn, gateways).expect("open engine");
        Self {
            engine,
            fetcher,
            clock,
            _dir: dir,
        }
    }

    /// Register a canned document and ingest its URL, draining the task
    /// queue until the pipeline and enrichment settle. Returns the stored
    /// resource.
    pub fn ingest_document(&self, url: &str, document: FetchedDocument) -> Resource {
        self.fetcher.register(url, document);
        let resource = self
            .engine
            .ingest
            .ingest(url, &ResourceOverrides::default())
            .expect("ingest accepted");
        self.drain();
        self.engine
            .resources
            .get(&resource.id)
            .expect("resource stored")
    }

    /// Drain every runnable task; countdowns and retry backoffs are
    /// satisfied by stepping the manual clock forward.
    pub fn drain(&self) {
        for _ in 0..100 {
            let processed = self.engine.run_pending_tasks(1000).expect("drain tasks");
            if processed == 0 {
                let stats = self.engine.kernel.queue.stats().expect("queue stats");
                if stats.queued == 0 && stats.running == 0 {
                    return;
                }
                // Tasks are waiting on a countdown or backoff
                self.clock.advance(Duration::seconds(60));
            }
        }
        panic!("task queue did not settle");
    }

    /// A plausible article document.
    pub fn article(title: &str, description: &str, body: &str) -> FetchedDocument {
        FetchedDocument {
            final_url: String::new(),
            title: Some(title.to_string()),
            description: Some(description.to_string()),
            text: body.to_string(),
            language: Some("en".to_string()),
            ..Default::default()
        }
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}
