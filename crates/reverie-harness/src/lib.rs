//! An in-memory worker for exercising controllers without spawning a
//! process.
//!
//! [`MockWorker`] sits on the far end of an in-memory channel pair and
//! answers the controller's calls: it acknowledges initialization,
//! records every call it receives, and settles `javascript` evaluations
//! from a scripted queue of outcomes. [`MockLauncher`] plugs it into
//! [`reverie::WorkerLauncher`], and the [`MockWorkerProbe`] lets a test
//! inspect what the controller actually asked for.

mod launcher;
mod worker;

pub use launcher::{MockLauncher, MockWorkerProbe};
pub use worker::{EvalOutcome, MockWorker, MockWorkerBuilder, RecordedCall};
