//! Orchestration engine for small DAGs of remote HPC jobs.
//!
//! Build a [`WorkflowGraph`] of [`Step`]s, hand it to the [`Orchestrator`]
//! together with a [`RunConfig`], and the run is driven to a terminal
//! [`RunReport`]: ready steps are submitted through a [`JobDriver`], polled
//! until terminal, their outputs fetched into the [`ArtifactStore`], and
//! local steps executed once their inputs are available.

pub mod artifacts;
pub mod diagnostics;
pub mod errors;
pub mod events;
pub mod graph;
pub mod lifecycle;
pub mod lint;
pub mod orchestrator;
pub mod poll;
pub mod profile;
pub mod report;
pub mod runtime;

pub use artifacts::*;
pub use diagnostics::*;
pub use errors::*;
pub use events::*;
pub use graph::*;
pub use lifecycle::*;
pub use lint::*;
pub use orchestrator::*;
pub use poll::*;
pub use profile::*;
pub use report::*;
pub use runtime::*;
