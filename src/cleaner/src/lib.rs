//! Cleaner for insert-only tables.
//!
//! Aborts writes whose writer has gone away, deletes the artifacts of aborted
//! writes, and advances each table's watermark over resolved writes so their
//! records can be purged.

pub mod clock;
pub mod locator;
pub mod metrics;
pub mod policy;
pub mod reconciler;
pub mod scheduler;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use clock::{ManualClock, SystemClock, TimeSource};
pub use locator::{ArtifactLocator, DeletionOutcome, ObjectStoreArtifactLocator};
pub use metrics::{CleanerMetrics, MetricsSummary};
pub use policy::{PolicyError, TimeoutPolicy, WriteStatus};
pub use reconciler::{PassReport, ReconcileError, Reconciler};
pub use scheduler::{CleanerScheduler, SweepReport, TableFailure};
