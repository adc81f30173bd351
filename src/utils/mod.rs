// Logging: env_logger setup and quiet switch
pub mod log;
// Dispatch trace: one JSON object per dispatched operation
pub mod trace;
