// 🔁 Sync Runner - one run, and the loop that repeats it
// resolve changes → parse → build → dispatch → checkpoint
//
// The checkpoint only moves after every object of the run was accepted by the
// sink; any abort leaves it untouched so the next run retries the same work.

use crate::changes::{blob_url, ChangeSetResolver, Repository};
use crate::checkpoint::{Checkpoint, CheckpointStore, StateStorage};
use crate::config::Config;
use crate::dispatch::BundleDispatcher;
use crate::record::{Record, RecordParser};
use crate::sink::{Sink, WorkHandle};
use crate::stix::{GraphObject, ObjectGraphBuilder};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info, warn};

// ============================================================================
// RUN STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    ResolvingChanges,
    Parsing,
    Building,
    Dispatching,
    Checkpointing,
    Aborted,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::ResolvingChanges => "resolving_changes",
            RunState::Parsing => "parsing",
            RunState::Building => "building",
            RunState::Dispatching => "dispatching",
            RunState::Checkpointing => "checkpointing",
            RunState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// What one successful run did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub revision: String,
    pub previous_revision: Option<String>,
    pub changed_paths: usize,
    pub records_parsed: usize,
    pub records_rejected: usize,
    pub objects_sent: usize,
    pub chunks_sent: usize,
}

// ============================================================================
// RUNNER OPTIONS
// ============================================================================

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub name: String,
    /// Used to build provenance URLs
    pub repo_url: String,
    pub subtree: PathBuf,
    pub extension: String,
    pub origin_key: String,
    pub score: u8,
    pub chunk_size: usize,
    pub interval: Duration,
}

impl RunnerOptions {
    pub fn from_config(config: &Config) -> Self {
        RunnerOptions {
            name: config.connector.name.clone(),
            repo_url: config.repo.url.clone(),
            subtree: config.repo.subtree.clone(),
            extension: config.repo.extension.clone(),
            origin_key: config.connector.origin_key.clone(),
            score: config.connector.default_score,
            chunk_size: config.connector.chunk_size,
            interval: config.run_interval(),
        }
    }
}

impl Default for RunnerOptions {
    fn default() -> Self {
        RunnerOptions::from_config(&Config::default())
    }
}

// ============================================================================
// SYNC RUNNER
// ============================================================================

pub struct SyncRunner<R: Repository, S: Sink, T: StateStorage> {
    repo: R,
    sink: S,
    checkpoints: CheckpointStore<T>,
    resolver: ChangeSetResolver,
    parser: RecordParser,
    dispatcher: BundleDispatcher,
    options: RunnerOptions,
    state: RunState,
}

impl<R: Repository, S: Sink, T: StateStorage> SyncRunner<R, S, T> {
    pub fn new(repo: R, sink: S, storage: T, options: RunnerOptions) -> Self {
        SyncRunner {
            repo,
            sink,
            checkpoints: CheckpointStore::new(storage),
            resolver: ChangeSetResolver::new(options.subtree.clone(), &options.extension),
            parser: RecordParser::new(options.origin_key.clone()),
            dispatcher: BundleDispatcher::new(options.chunk_size),
            options,
            state: RunState::Idle,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    pub fn checkpoints(&self) -> &CheckpointStore<T> {
        &self.checkpoints
    }

    fn transition(&mut self, next: RunState) {
        debug!(from = %self.state, to = %next, "Run state change");
        self.state = next;
    }

    /// Execute one run, marking the sink's work record completed or failed
    #[tracing::instrument(skip(self), fields(connector = %self.options.name))]
    pub fn run_once(&mut self) -> Result<RunSummary> {
        let started = Utc::now();
        info!("Starting {} run", self.options.name);

        let work_name = format!("{} run @ {}", self.options.name, started.to_rfc3339());
        let work = match self.sink.begin_work(&work_name) {
            Ok(work) => work,
            Err(e) => {
                self.transition(RunState::Aborted);
                return Err(e.context("Failed to start work"));
            }
        };

        match self.execute(started) {
            Ok(summary) => {
                let message = format!(
                    "{} connector successfully run, storing last_revision={}",
                    self.options.name, summary.revision
                );
                self.finish(&work, Ok(&message));
                self.transition(RunState::Idle);
                Ok(summary)
            }
            Err(e) => {
                let failed_in = self.state;
                self.transition(RunState::Aborted);
                let message = format!("{} run failed while {}: {:#}", self.options.name, failed_in, e);
                error!("{}", message);
                self.finish(&work, Err(&message));
                Err(e)
            }
        }
    }

    fn finish(&mut self, work: &WorkHandle, outcome: std::result::Result<&str, &str>) {
        let result = match outcome {
            Ok(message) => {
                info!("{}", message);
                self.sink.complete_work(work, message)
            }
            Err(message) => self.sink.fail_work(work, message),
        };
        if let Err(e) = result {
            warn!(work_id = %work.id, "Failed to update work status: {:#}", e);
        }
    }

    fn execute(&mut self, started: DateTime<Utc>) -> Result<RunSummary> {
        // 1. Resolve the change set
        self.transition(RunState::ResolvingChanges);
        self.repo.sync().context("Failed to update repository")?;
        let current = self.repo.current_revision()?;
        let previous = self
            .checkpoints
            .load()?
            .and_then(|cp| cp.last_revision);

        info!(
            "Last revision in state: {}, current revision: {}",
            previous.as_deref().unwrap_or("<none>"),
            current
        );

        let paths = self
            .resolver
            .resolve(&self.repo, previous.as_deref(), &current)?;
        info!("Found {} record files to process this run", paths.len());

        // 2. Parse (per-record failures are logged by the parser and skipped)
        self.transition(RunState::Parsing);
        let root = self.repo.root().to_path_buf();
        let records: Vec<(PathBuf, Record)> = paths
            .iter()
            .filter_map(|path| {
                self.parser
                    .parse(&root.join(path))
                    .map(|record| (path.clone(), record))
            })
            .collect();
        let rejected = paths.len() - records.len();
        if rejected > 0 {
            warn!("{} of {} record files were skipped", rejected, paths.len());
        }

        // 3. Build the object graph
        self.transition(RunState::Building);
        let builder = ObjectGraphBuilder::new(self.options.score, started);
        let mut objects: Vec<GraphObject> = Vec::with_capacity(records.len() * 3);
        for (path, record) in &records {
            let url = blob_url(&self.options.repo_url, &current, path);
            let triple = builder.build(record, &url);
            if triple.is_empty() {
                continue;
            }
            objects.extend(triple);
        }

        // 4. Dispatch
        self.transition(RunState::Dispatching);
        let report = if objects.is_empty() {
            info!("No new objects to send this run");
            Default::default()
        } else {
            self.dispatcher.dispatch(&mut self.sink, &objects)?
        };

        // 5. Checkpoint
        self.transition(RunState::Checkpointing);
        let checkpoint = Checkpoint::new(current.clone(), Utc::now());
        self.checkpoints.save(&checkpoint)?;
        info!("State updated: last_revision={}", current);

        Ok(RunSummary {
            revision: current,
            previous_revision: previous,
            changed_paths: paths.len(),
            records_parsed: records.len(),
            records_rejected: rejected,
            objects_sent: report.objects_sent,
            chunks_sent: report.chunks_sent,
        })
    }

    /// Run forever: one guarded run, then sleep for the configured interval
    pub fn run_forever(&mut self) -> ! {
        info!("Starting {} connector main loop", self.options.name);
        loop {
            if let Err(e) = self.run_once() {
                error!("Error during processing: {:#}", e);
            }
            info!(
                "Sleeping for {} seconds before next run",
                self.options.interval.as_secs()
            );
            std::thread::sleep(self.options.interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryStateStorage;
    use crate::dispatch::Bundle;
    use std::path::Path;

    struct StaticRepository {
        root: PathBuf,
        revision: String,
        fail_sync: bool,
    }

    impl Repository for StaticRepository {
        fn sync(&self) -> Result<()> {
            if self.fail_sync {
                anyhow::bail!("network unreachable");
            }
            Ok(())
        }

        fn current_revision(&self) -> Result<String> {
            Ok(self.revision.clone())
        }

        fn changed_paths(&self, _from: Option<&str>, _to: &str, _subtree: &Path) -> Result<Vec<PathBuf>> {
            Ok(Vec::new())
        }

        fn root(&self) -> &Path {
            &self.root
        }
    }

    #[derive(Default)]
    struct NullSink {
        completed: Vec<String>,
        failed: Vec<String>,
    }

    impl Sink for NullSink {
        fn begin_work(&mut self, name: &str) -> Result<WorkHandle> {
            Ok(WorkHandle::new(name))
        }

        fn send_bundle(&mut self, _bundle: &Bundle) -> Result<()> {
            Ok(())
        }

        fn complete_work(&mut self, _work: &WorkHandle, message: &str) -> Result<()> {
            self.completed.push(message.to_string());
            Ok(())
        }

        fn fail_work(&mut self, _work: &WorkHandle, message: &str) -> Result<()> {
            self.failed.push(message.to_string());
            Ok(())
        }
    }

    fn repo(fail_sync: bool) -> StaticRepository {
        StaticRepository {
            root: PathBuf::from("/nonexistent"),
            revision: "rev-1".to_string(),
            fail_sync,
        }
    }

    #[test]
    fn test_empty_change_set_still_checkpoints() {
        let mut runner = SyncRunner::new(repo(false), NullSink::default(), MemoryStateStorage::new(), RunnerOptions::default());

        let summary = runner.run_once().unwrap();

        assert_eq!(summary.objects_sent, 0);
        assert_eq!(summary.chunks_sent, 0);
        assert_eq!(runner.state(), RunState::Idle);
        let cp = runner.checkpoints().load().unwrap().unwrap();
        assert_eq!(cp.last_revision.as_deref(), Some("rev-1"));
        assert!(runner.sink().completed[0].contains("last_revision=rev-1"));
    }

    #[test]
    fn test_sync_failure_aborts_without_checkpoint() {
        let mut runner = SyncRunner::new(repo(true), NullSink::default(), MemoryStateStorage::new(), RunnerOptions::default());

        let err = runner.run_once().unwrap_err();

        assert!(format!("{:#}", err).contains("network unreachable"));
        assert_eq!(runner.state(), RunState::Aborted);
        assert_eq!(runner.checkpoints().load().unwrap(), None);
        assert!(runner.sink().completed.is_empty());
        assert!(runner.sink().failed[0].contains("resolving_changes"));
    }

    #[test]
    fn test_run_state_display() {
        assert_eq!(RunState::ResolvingChanges.to_string(), "resolving_changes");
        assert_eq!(RunState::Aborted.to_string(), "aborted");
    }
}
