//! # dispatch-loop
//!
//! A thread-affine dispatch loop: one dedicated worker thread that runs work
//! submitted from any number of threads, one item at a time, ordered by due
//! time and then by submission order.
//!
//! - `post` fires and forgets; failures go to unhandled-failure observers.
//! - `send` blocks for the result, and runs inline when called from the
//!   worker thread itself.
//! - `send_async` and `spawn` return a [`Pending`] that resolves through the
//!   caller's resumption context.
//!
//! ```no_run
//! use dispatch_loop::DispatchLoop;
//!
//! let dispatch = DispatchLoop::builder().thread_name("ui").start()?;
//! let answer = dispatch.send(|| 6 * 7)?;
//! assert_eq!(answer, 42);
//! # Ok::<(), dispatch_loop::Error>(())
//! ```

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod failure;
pub mod model;
mod queue;
pub mod sink;
pub mod telemetry;

pub use engine::{DispatchLoop, DispatchLoopBuilder, LoopHandle};
pub use error::{Error, Result};
pub use executor::{Executor, InlineExecutor, ThreadExecutor, TokioExecutor};
pub use failure::{FailureOrigin, ObserverId, UnhandledFailure};
pub use model::{LoopId, LoopState};
pub use sink::Pending;
