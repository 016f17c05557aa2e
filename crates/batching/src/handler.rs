//! The bulk-processing seam a [`BatchDispatcher`](crate::BatchDispatcher) calls
//! once per closed batch.

use crate::error::BatchError;
use async_trait::async_trait;
use std::future::Future;

/// Processes every input of one batch in a single call.
///
/// Implementations must return exactly one output per input, in input order.
/// A length mismatch is treated as a failure of the whole batch.
#[async_trait]
pub trait BulkHandler<I, O>: Send + Sync {
    async fn handle_batch(&self, inputs: Vec<I>) -> Result<Vec<O>, BatchError>;
}

/// Adapts an async closure into a [`BulkHandler`].
pub struct BulkFn<F>(pub F);

#[async_trait]
impl<I, O, F, Fut> BulkHandler<I, O> for BulkFn<F>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(Vec<I>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<O>, BatchError>> + Send + 'static,
{
    async fn handle_batch(&self, inputs: Vec<I>) -> Result<Vec<O>, BatchError> {
        (self.0)(inputs).await
    }
}
