// Malicious-Package Feed Connector - Core Library
// Incrementally turns a versioned OSV record tree into STIX bundles for a knowledge store

pub mod db;
pub mod config;
pub mod changes;     // Change-set resolution against the record tree
pub mod record;      // Record parsing and validation
pub mod stix;        // Deterministic object graph
pub mod dispatch;    // Chunked bundle delivery
pub mod sink;        // Knowledge-store boundary + SQLite spool
pub mod checkpoint;  // Last processed revision
pub mod runner;      // Run orchestration and loop

// Re-export commonly used types
pub use db::{
    SyncEvent, open_database, setup_database, record_event, events_for_subject, events_for_work,
};
pub use config::{Config, ConnectorConfig, RepoConfig};
pub use changes::{
    ChangeSetResolver, Repository, GitRepository,
    blob_url, normalize_subtree, walk_files,
};
pub use record::{Record, RecordParser, RecordRejection, DEFAULT_SUMMARY};
pub use stix::{
    GraphObject, FileObservable, Indicator, Relationship, ExternalReference,
    ObjectGraphBuilder, TLP_CLEAR_ID,
    indicator_pattern, observable_id, indicator_id, relationship_id,
};
pub use dispatch::{Bundle, BundleDispatcher, DispatchError, DispatchReport, DEFAULT_CHUNK_SIZE};
pub use sink::{Sink, SpoolSink, WorkHandle, WorkRecord, WorkStatus};
pub use checkpoint::{
    Checkpoint, CheckpointStore, StateStorage,
    MemoryStateStorage, SqliteStateStorage,
};
pub use runner::{RunState, RunSummary, RunnerOptions, SyncRunner};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
