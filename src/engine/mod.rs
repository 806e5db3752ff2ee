//! Dispatch engine: the loop, its worker cycle, and the work it runs.

pub mod dispatch;
mod task;
mod work;
mod worker;

pub use dispatch::{DispatchLoop, DispatchLoopBuilder, LoopHandle};
