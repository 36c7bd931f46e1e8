// 🚦 Ingest Pipeline - Orchestrates fetch → map → resolve → store per source
// Sources run sequentially and fail independently: one source's outage
// never blocks the others, and every run leaves a ledger row behind.

use crate::fetcher::{PageFetcher, PageTransport, ThreadSleeper};
use crate::mapper::map_record;
use crate::resolver::EntityRegistry;
use crate::schema::DateWindow;
use crate::sources::{parse_page, SourceConfig, SourceId};
use crate::store::{RunCounts, RunStatus, Store, StoreError};

// ============================================================================
// RUN SUMMARY
// ============================================================================

/// What one per-source run amounted to, for reporting.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub source: SourceId,
    pub status: RunStatus,
    pub counts: RunCounts,
    pub error: Option<String>,
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct Pipeline<T: PageTransport> {
    store: Store,
    registry: EntityRegistry,
    transport: T,
    sleeper: ThreadSleeper,
}

impl<T: PageTransport> Pipeline<T> {
    /// Build a pipeline over an opened store: reconcile runs a crashed
    /// process left behind, then rebuild the registry from disk.
    pub fn new(store: Store, transport: T) -> Result<Self, StoreError> {
        store.reconcile_stale_runs()?;
        let registry = store.load_registry()?;
        Ok(Pipeline {
            store,
            registry,
            transport,
            sleeper: ThreadSleeper,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    /// Run every configured source over the window, sequentially.
    /// A failing source yields a failed summary; the rest still run.
    pub fn run_sources(
        &mut self,
        configs: &[SourceConfig],
        window: DateWindow,
    ) -> Vec<RunSummary> {
        configs
            .iter()
            .map(|config| self.run_source(config, window))
            .collect()
    }

    /// One complete per-source run: ledger open, fetch/map/resolve/store
    /// loop, registry snapshot, ledger close.
    pub fn run_source(&mut self, config: &SourceConfig, window: DateWindow) -> RunSummary {
        tracing::info!(
            source = config.id.as_str(),
            start = %window.start,
            end = %window.end,
            "starting ingest run"
        );

        let run = match self.store.start_run(config.id, window) {
            Ok(run) => run,
            Err(e) => {
                tracing::error!(source = config.id.as_str(), error = %e, "could not open run");
                return RunSummary {
                    run_id: String::new(),
                    source: config.id,
                    status: RunStatus::Failed,
                    counts: RunCounts::default(),
                    error: Some(e.to_string()),
                };
            }
        };

        let mut counts = RunCounts::default();
        let mut run_error: Option<String> = None;

        // Split borrows: the fetcher holds the transport while the loop
        // body writes to the store and registry.
        let Pipeline {
            store,
            registry,
            transport,
            sleeper,
        } = self;

        let fetcher = PageFetcher::new(&*transport, &*sleeper, config, window);
        for result in fetcher {
            let page = match result {
                Ok(page) => page,
                Err(e) => {
                    // Terminates the page sequence; everything ingested
                    // from earlier pages stays
                    tracing::error!(source = config.id.as_str(), error = %e, "fetch failed");
                    run_error = Some(e.to_string());
                    break;
                }
            };

            counts.pages_fetched += 1;
            if let Err(e) = store.insert_raw_page(&run.id, &page) {
                run_error = Some(e.to_string());
                break;
            }

            let parsed = match parse_page(config.id, &page.body) {
                Ok(parsed) => parsed,
                Err(e) => {
                    // Transport already validated the body; a failure here
                    // means the source changed shape mid-run
                    tracing::error!(
                        source = config.id.as_str(),
                        page = page.page_index,
                        error = %e,
                        "page body no longer parses"
                    );
                    run_error = Some(format!("page {} unparseable: {e}", page.page_index));
                    break;
                }
            };

            for record in parsed.records {
                counts.records_fetched += 1;
                match map_record(record) {
                    Ok(event) => {
                        counts.records_mapped += 1;
                        let resolution = registry.resolve(&event);
                        if resolution.is_new_entity {
                            counts.entities_created += 1;
                        } else {
                            counts.entities_merged += 1;
                        }
                        if let Err(e) = store.upsert_event(&resolution.entity_id, &event) {
                            run_error = Some(e.to_string());
                            break;
                        }
                    }
                    Err(e) => {
                        // Bad record is skipped and counted, never fatal
                        counts.mapping_failures += 1;
                        tracing::warn!(source = config.id.as_str(), error = %e, "record rejected");
                    }
                }
            }
            if run_error.is_some() {
                break;
            }
        }

        if let Err(e) = self.store.save_registry(&self.registry) {
            tracing::error!(error = %e, "registry snapshot failed");
            run_error.get_or_insert_with(|| e.to_string());
        }

        // Nothing fetched and an error: total failure. Error after some
        // progress, or rejected records: partial. Otherwise clean.
        let status = if run_error.is_some() && counts.pages_fetched == 0 {
            RunStatus::Failed
        } else if run_error.is_some() || counts.mapping_failures > 0 {
            RunStatus::Partial
        } else {
            RunStatus::Succeeded
        };

        if let Err(e) = self
            .store
            .finish_run(&run.id, status, &counts, run_error.as_deref())
        {
            tracing::error!(run_id = %run.id, error = %e, "could not finalize run");
        }

        tracing::info!(
            source = config.id.as_str(),
            run_id = %run.id,
            status = status.as_str(),
            pages = counts.pages_fetched,
            fetched = counts.records_fetched,
            mapped = counts.records_mapped,
            rejected = counts.mapping_failures,
            "run finished"
        );

        RunSummary {
            run_id: run.id,
            source: config.id,
            status,
            counts,
            error: run_error,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
