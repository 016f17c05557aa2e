//! Time-windowed request batching.
//!
//! Callers hand single items to a [`BatchDispatcher`]; items arriving within
//! one window are admitted into the same [`Batch`], sent to a [`BulkHandler`]
//! in one call, and the outputs are scattered back to each caller by position.

pub mod batch;
pub mod dispatcher;
pub mod error;
pub mod handler;

pub use batch::{AdmitRejected, Batch, BatchState, Token};
pub use dispatcher::{BatchDispatcher, DispatcherConfig};
pub use error::BatchError;
pub use handler::{BulkFn, BulkHandler};
