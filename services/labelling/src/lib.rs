//! Labelling Service
//!
//! Ranked frame selection service for video thumbnail labelling. Labellers
//! pick their top three frames (rank 1, 2, 3) for each video extracted into
//! the media tree; picks are stored per labeller in PostgreSQL, drive the
//! list of videos still to label, and are exported for analysis.
//!
//! ## Features
//!
//! - **Ranked Selection Engine**: every write keeps a video's picks an
//!   injective mapping from ranks to frames; moving a frame to a new rank
//!   clears its old one
//! - **Per-Key Serialization**: concurrent requests for the same labeller and
//!   video are applied one at a time, with conflicting writes retried
//! - **Progress Tracking**: videos with any pick drop out of the labeller's
//!   to-do list
//! - **Deterministic Export**: JSON or CSV rows sorted by actor, category,
//!   video and rank
//!
//! ## Architecture
//!
//! ```text
//! Identity proxy          Labelling API                 PostgreSQL
//! ┌──────────────┐       ┌──────────────┐             ┌──────────────┐
//! │ x-labeller   │──────▶│ axum router  │             │ selections   │
//! └──────────────┘       └──────────────┘             └──────────────┘
//!                               │                            ▲
//!         ┌─────────────────────┼───────────────────┐        │
//!         ▼                     ▼                   ▼        │
//! ┌──────────────┐       ┌──────────────┐    ┌──────────────┐│
//! │ Media        │       │ Rank         │    │ Progress /   ││
//! │ Catalog      │       │ Assignment   │───▶│ Export       ││
//! └──────────────┘       └──────────────┘    └──────────────┘│
//!   frames tree                 │                   │        │
//!                               └───────────────────┴────────┘
//!                                    Selection Store
//! ```

pub mod api;
pub mod assignment;
pub mod config;
pub mod export;
pub mod media_catalog;
pub mod memory_store;
pub mod postgres_store;
pub mod progress;
pub mod selection;
pub mod selection_store;
pub mod service;

pub use api::{create_router, start_api_server, Actor, ApiError, AppState, SelectionResponse};
pub use assignment::RankAssignmentService;
pub use config::Config;
pub use export::{ExportRow, ExportService, EXPORT_COLUMNS};
pub use media_catalog::{CatalogError, FsMediaCatalog, MediaCatalog};
pub use memory_store::MemorySelectionStore;
pub use postgres_store::PgSelectionStore;
pub use progress::ProgressTracker;
pub use selection::{Rank, RankMapping, SelectionError, SelectionKey};
pub use selection_store::{FlatSelection, SelectionFilter, SelectionStore, StoreError, StoreOp};
pub use service::{LabellingError, LabellingService};
