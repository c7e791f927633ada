//! Remote execution for hpcflow: a secure-shell transport, Torque/PBS and
//! Slurm adapters, and [`RemoteJobDriver`], the [`hpcflow_core::JobDriver`]
//! that ties them together.

pub mod driver;
pub mod errors;
pub mod local;
pub mod scheduler;
pub mod ssh;
pub mod transport;

pub use driver::*;
pub use errors::*;
pub use local::*;
pub use scheduler::*;
pub use ssh::*;
pub use transport::*;
