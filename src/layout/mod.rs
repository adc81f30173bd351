// Layout: bank-interleaved data placement for PIM execution

pub mod gemv;
pub mod odometer;

pub use gemv::{GemvLayout, GranuleOrder, LayoutConverter, Placement};
pub use odometer::{Cursor, Odometer};
