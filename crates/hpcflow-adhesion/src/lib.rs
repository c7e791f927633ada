pub mod errors;
pub mod outcar;
pub mod record;
pub mod task;
pub mod vasp;
pub mod workflow;

pub use errors::*;
pub use outcar::*;
pub use record::*;
pub use task::*;
pub use vasp::*;
pub use workflow::*;
