// Mem Domain: backend memory API, per-device PIM heaps and the buffer manager

pub mod backend;
pub mod heap;
pub mod manager;

pub use backend::{EmulatedBackend, MemoryBackend};
pub use heap::FragmentAllocator;
pub use manager::MemoryManager;
