pub mod buffer;
pub mod bundle;
pub mod config;
pub mod error;
pub mod executor;
pub mod layout;
pub mod memdomain;
pub mod runtime;
pub mod shell;
pub mod topology;
pub mod utils;
pub mod workload;

pub use buffer::{BufferDesc, CopyKind, DataHandle, MemPtr, OpKind, PimBuffer, Precision, Residency, Shape4};
pub use config::{AppConfig, RuntimeKind};
pub use error::{PimError, PimResult};
pub use executor::{Executor, SoftExecutor, StreamId};
pub use runtime::{Activation, Decision, KernelMode, Operation, Runtime};
pub use topology::Topology;
pub use utils::log::init_log;
