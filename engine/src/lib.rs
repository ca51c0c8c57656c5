//! Ferry's mirroring engine.
//!
//! Copies container images between Docker Distribution v2 registries, a
//! local content-addressed store, and static export trees served by a
//! plain web server. The [`Manager`] is the embedding surface: queue
//! [`UploadTask`]s (directly or via the declarative planner), run them on
//! a worker pool, and use the one-shot helpers for tag discovery,
//! inspection, and deletion.

pub mod copier;
pub mod dedup;
pub mod digest;
pub mod export;
pub mod manager;
pub mod manifest;
pub mod modifier;
pub mod planner;
pub mod pool;
pub mod reference;
pub mod registry;
pub mod store;
pub mod task;

pub use copier::Copier;
pub use dedup::{DedupIndex, DedupScope};
pub use export::FilesystemExporter;
pub use manager::{CancelHandle, ImageDetails, Manager, RunSummary};
pub use manifest::{Manifest, ManifestKind};
pub use modifier::{ImageBuilder, ImageModifier, ModifierRegistry, ModifyRequest};
pub use planner::{Plan, UploadPlanner};
pub use pool::WorkerPool;
pub use reference::{ImageReference, RefScheme};
pub use registry::{RegistryClient, RegistrySecurity};
pub use store::{LayerStore, LocalImage};
pub use task::{Cleanup, TaskOutcome, TaskResult, UploadTask};
