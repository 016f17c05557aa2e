//! A single time-windowed batch and its `Open → Closed → Returned` lifecycle.

use crate::error::BatchError;
use crate::handler::BulkHandler;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

/// Unique per-request key used to find a caller's output after the merged call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(Uuid);

impl Token {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for Token {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    /// Accepting new items.
    Open,
    /// Window elapsed; bulk call in flight, or the bulk call failed.
    Closed,
    /// Outputs available.
    Returned,
}

/// Admission was refused because the batch is no longer open.
/// Carries the payload back so the caller can retry on a fresh batch.
#[derive(Debug)]
pub struct AdmitRejected<I>(pub I);

struct Slots<I, O> {
    state: BatchState,
    /// Admission order is the order inputs are handed to the bulk call.
    inputs: Vec<(Token, I)>,
    dispatched: usize,
    outputs: Option<HashMap<Token, O>>,
    failure: Option<BatchError>,
    detached: HashSet<Token>,
}

/// Pending inputs collected during one window, plus their eventual outputs.
///
/// Any number of callers [`admit`](Batch::admit) and [`wait`](Batch::wait);
/// exactly one task drives [`run_window`](Batch::run_window).
pub struct Batch<I, O> {
    id: Uuid,
    slots: Mutex<Slots<I, O>>,
    settled: watch::Sender<bool>,
}

impl<I, O> Default for Batch<I, O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I, O> Batch<I, O> {
    pub fn new() -> Self {
        let (settled, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4(),
            slots: Mutex::new(Slots {
                state: BatchState::Open,
                inputs: Vec::new(),
                dispatched: 0,
                outputs: None,
                failure: None,
                detached: HashSet::new(),
            }),
            settled,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> BatchState {
        self.slots.lock().state
    }

    /// Inputs currently admitted, or the number handed to the bulk call once closed.
    pub fn len(&self) -> usize {
        let slots = self.slots.lock();
        match slots.state {
            BatchState::Open => slots.inputs.len(),
            _ => slots.dispatched,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add `payload` under `token`. Fails fast once the batch has left `Open`.
    pub fn admit(&self, token: Token, payload: I) -> Result<(), AdmitRejected<I>> {
        let mut slots = self.slots.lock();
        if slots.state != BatchState::Open {
            return Err(AdmitRejected(payload));
        }
        slots.inputs.push((token, payload));
        Ok(())
    }

    /// Detach a caller that stopped waiting.
    ///
    /// While open the input is dropped before it reaches the bulk call; later
    /// its output is discarded. Other callers' outputs are untouched.
    pub fn detach(&self, token: Token) {
        let mut slots = self.slots.lock();
        match slots.state {
            BatchState::Open => {
                if let Some(pos) = slots.inputs.iter().position(|(t, _)| *t == token) {
                    slots.inputs.remove(pos);
                }
            }
            BatchState::Closed => {
                slots.detached.insert(token);
            }
            BatchState::Returned => {
                if let Some(outputs) = slots.outputs.as_mut() {
                    outputs.remove(&token);
                }
            }
        }
    }

    fn settle(&self) {
        self.settled.send_replace(true);
    }
}

impl<I, O> Batch<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Keep the batch open for `window`, then close it and make the bulk call.
    ///
    /// Outputs are matched to tokens by position. On failure the batch stays
    /// `Closed`, every waiter is woken with the error, and the error is
    /// returned to the caller driving the window.
    pub async fn run_window(
        &self,
        window: Duration,
        handler: &dyn BulkHandler<I, O>,
    ) -> Result<(), BatchError> {
        tokio::time::sleep(window).await;

        let (tokens, inputs): (Vec<Token>, Vec<I>) = {
            let mut slots = self.slots.lock();
            slots.state = BatchState::Closed;
            slots.dispatched = slots.inputs.len();
            std::mem::take(&mut slots.inputs).into_iter().unzip()
        };

        if inputs.is_empty() {
            debug!(batch_id = %self.id, "Batch closed with no pending inputs");
            self.finish(tokens, Vec::new());
            return Ok(());
        }

        debug!(batch_id = %self.id, size = inputs.len(), "Batch closed, dispatching bulk call");
        metrics::histogram!("batch.size").record(inputs.len() as f64);

        let outcome = match handler.handle_batch(inputs).await {
            Ok(outputs) if outputs.len() == tokens.len() => Ok(outputs),
            Ok(outputs) => Err(BatchError::CardinalityMismatch {
                expected: tokens.len(),
                got: outputs.len(),
            }),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(outputs) => {
                self.finish(tokens, outputs);
                Ok(())
            }
            Err(e) => {
                metrics::counter!("batch.failures").increment(1);
                self.slots.lock().failure = Some(e.clone());
                self.settle();
                Err(e)
            }
        }
    }

    fn finish(&self, tokens: Vec<Token>, outputs: Vec<O>) {
        {
            let mut slots = self.slots.lock();
            let detached = std::mem::take(&mut slots.detached);
            let outputs = tokens
                .into_iter()
                .zip(outputs)
                .filter(|(token, _)| !detached.contains(token))
                .collect();
            slots.outputs = Some(outputs);
            slots.state = BatchState::Returned;
        }
        self.settle();
    }

    /// Wait until the batch settles and take this caller's output.
    ///
    /// Resolves to [`BatchError::Timeout`] if nothing settles within `deadline`.
    pub async fn wait(&self, token: Token, deadline: Duration) -> Result<O, BatchError> {
        let mut settled = self.settled.subscribe();
        let signalled = tokio::time::timeout(deadline, settled.wait_for(|done| *done))
            .await
            .map(|res| res.is_ok());

        match signalled {
            Ok(true) => {}
            Ok(false) => return Err(BatchError::MissingOutput),
            Err(_) => {
                metrics::counter!("batch.wait_timeouts").increment(1);
                self.detach(token);
                return Err(BatchError::Timeout(deadline.as_millis() as u64));
            }
        }

        let mut slots = self.slots.lock();
        match slots.state {
            BatchState::Returned => slots
                .outputs
                .as_mut()
                .and_then(|outputs| outputs.remove(&token))
                .ok_or(BatchError::MissingOutput),
            _ => Err(slots.failure.clone().unwrap_or(BatchError::MissingOutput)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::BulkFn;

    fn times_ten() -> BulkFn<impl Fn(Vec<u32>) -> std::future::Ready<Result<Vec<u32>, BatchError>>> {
        BulkFn(
            |inputs: Vec<u32>| -> std::future::Ready<Result<Vec<u32>, BatchError>> {
                std::future::ready(Ok(inputs.into_iter().map(|x| x * 10).collect()))
            },
        )
    }

    #[tokio::test]
    async fn test_outputs_follow_admission_order() {
        let batch = Batch::<u32, u32>::new();
        let tokens: Vec<Token> = (0..5).map(|_| Token::new()).collect();
        for (i, token) in tokens.iter().enumerate() {
            batch.admit(*token, i as u32).unwrap();
        }
        assert_eq!(batch.len(), 5);

        batch.run_window(Duration::ZERO, &times_ten()).await.unwrap();
        assert_eq!(batch.state(), BatchState::Returned);

        for (i, token) in tokens.iter().enumerate() {
            let out = batch.wait(*token, Duration::from_secs(1)).await.unwrap();
            assert_eq!(out, i as u32 * 10);
        }
    }

    #[tokio::test]
    async fn test_admit_fails_fast_after_close() {
        let batch = Batch::<u32, u32>::new();
        batch.admit(Token::new(), 1).unwrap();
        batch.run_window(Duration::ZERO, &times_ten()).await.unwrap();

        let rejected = batch.admit(Token::new(), 7).unwrap_err();
        assert_eq!(rejected.0, 7);
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_leaves_batch_closed_and_wakes_waiters() {
        let batch = Batch::<u32, u32>::new();
        let token = Token::new();
        batch.admit(token, 1).unwrap();

        let failing = BulkFn(|_: Vec<u32>| {
            std::future::ready(Err::<Vec<u32>, _>(BatchError::Backend("refused".into())))
        });
        let err = batch.run_window(Duration::ZERO, &failing).await.unwrap_err();
        assert_eq!(err, BatchError::Backend("refused".into()));
        assert_eq!(batch.state(), BatchState::Closed);

        let waited = batch.wait(token, Duration::from_secs(1)).await;
        assert_eq!(waited, Err(BatchError::Backend("refused".into())));
    }

    #[tokio::test]
    async fn test_short_output_is_a_failure() {
        let batch = Batch::<u32, u32>::new();
        let first = Token::new();
        batch.admit(first, 1).unwrap();
        batch.admit(Token::new(), 2).unwrap();

        let short = BulkFn(|_: Vec<u32>| std::future::ready(Ok::<Vec<u32>, BatchError>(vec![10])));
        let err = batch.run_window(Duration::ZERO, &short).await.unwrap_err();
        assert_eq!(
            err,
            BatchError::CardinalityMismatch {
                expected: 2,
                got: 1
            }
        );
        assert_eq!(batch.state(), BatchState::Closed);
        assert!(batch.wait(first, Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_detach_while_open_drops_input() {
        let batch = Batch::<u32, u32>::new();
        let keep = Token::new();
        let gone = Token::new();
        batch.admit(keep, 1).unwrap();
        batch.admit(gone, 2).unwrap();
        batch.detach(gone);
        assert_eq!(batch.len(), 1);

        batch.run_window(Duration::ZERO, &times_ten()).await.unwrap();
        assert_eq!(batch.wait(keep, Duration::from_secs(1)).await, Ok(10));
        assert_eq!(
            batch.wait(gone, Duration::from_secs(1)).await,
            Err(BatchError::MissingOutput)
        );
    }

    #[tokio::test]
    async fn test_empty_batch_skips_bulk_call() {
        let batch = Batch::<u32, u32>::new();
        let never = BulkFn(|_: Vec<u32>| -> std::future::Ready<Result<Vec<u32>, BatchError>> {
            panic!("bulk call must not run for an empty batch")
        });
        batch.run_window(Duration::ZERO, &never).await.unwrap();
        assert_eq!(batch.state(), BatchState::Returned);
        assert!(batch.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_when_batch_never_settles() {
        let batch = Batch::<u32, u32>::new();
        let token = Token::new();
        batch.admit(token, 1).unwrap();

        let err = batch.wait(token, Duration::from_millis(250)).await.unwrap_err();
        assert_eq!(err, BatchError::Timeout(250));
        assert!(batch.is_empty());
    }
}
