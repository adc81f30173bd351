// Runtime: dispatcher context and the PIM / fallback path policy

pub mod policy;
#[allow(clippy::module_inception)]
pub mod runtime;

pub use policy::{Activation, Decision, FusedGemv, GemvOperands, Infeasible, KernelMode};
pub use runtime::{DispatchStats, Operation, Runtime, RuntimeState};
