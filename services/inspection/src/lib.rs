//! Fuel Inspection Service
//!
//! Derives inspection records from the PLC event log of a fuel-element
//! inspection machine. Every tick the PLC gateway delivers lands in an
//! append-only raw event table; this service groups ticks into inspection
//! cycles, waits for the camera photos of each cycle to settle in a staging
//! folder, moves them into a per-cycle folder and materializes exactly one
//! inspection per cycle.
//!
//! ## Guarantees
//!
//! - **Exactly-once output**: one inspection per `{cycle_name}-{ec}` product
//!   code, one photo link per `(inspection, filename)`
//! - **Safe concurrency**: a cycle's events are claimed all-or-nothing before
//!   any side effect, so overlapping passes never both finalize it
//! - **Crash tolerance**: photo moves and inspection writes are idempotent;
//!   an interrupted cycle is rebuilt from unprocessed events and retried
//!
//! ## Architecture
//!
//! ```text
//! PLC gateway              PostgreSQL                      Filesystem
//! ┌──────────────┐        ┌──────────────┐                ┌──────────────┐
//! │ JSON ticks   │───────▶│ raw_events   │                │ STAGING/     │
//! └──────────────┘        └──────────────┘                └──────────────┘
//!                                │                               │
//!                                ▼                               │
//!                         ┌──────────────┐                       │
//!                         │ Cycle        │                       │
//!                         │ Detector     │                       │
//!                         └──────────────┘                       │
//!                                │                               │
//!                                ▼                               ▼
//!                         ┌──────────────┐                ┌──────────────┐
//!                         │ Settlement   │───────────────▶│ Photo        │
//!                         │ Gate         │                │ Correlator   │
//!                         └──────────────┘                └──────────────┘
//!                                                                │
//!                         ┌──────────────┐                       │
//!                         │ inspections  │◀──────────────────────┤
//!                         │ photos       │   Inspection          ▼
//!                         │ machine_stats│   Materializer  ┌──────────────┐
//!                         └──────────────┘                 │ PROCESSED/   │
//!                                                          │  {cycle-ec}/ │
//!                                                          └──────────────┘
//! ```

pub mod config;
pub mod cycle_detector;
pub mod db;
pub mod diagnostics;
pub mod event_store;
pub mod fields;
pub mod inspection_store;
pub mod materializer;
pub mod photo_correlator;
pub mod pipeline;
pub mod scheduler;
pub mod settlement;

pub use config::Config;
pub use cycle_detector::{
    Cycle, CycleDetector, CycleKey, CycleState, Detection, DiscardReason, Scan,
};
pub use diagnostics::{diagnose, DiagnosticReport};
pub use event_store::{
    Appended, EventCursor, EventStore, MemoryEventStore, PgEventStore, RawEvent, StoreError,
};
pub use fields::{ExtractedFields, ParseError, PlcTimestamp};
pub use inspection_store::{
    Inspection, InspectionRepository, InspectionStatus, MachineStats, MemoryInspectionRepository,
    PgInspectionRepository, PhotoLink, PhotoWindow, RepositoryError,
};
pub use materializer::{InspectionMaterializer, Materialized};
pub use photo_correlator::{CorrelatedPhoto, PhotoCorrelator, PhotoError, StagedPhoto};
pub use pipeline::{PassSummary, Pipeline, PipelineError, PipelineOptions};
pub use scheduler::{RunLoop, RunLoopHandle};
pub use settlement::{SettlementDecision, SettlementGate};
