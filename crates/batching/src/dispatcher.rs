//! Window-timed dispatcher: one entry point per item, one bulk call per window.
//!
//! [`BatchDispatcher::submit`] hides the batch mechanics from callers: it admits
//! the item into the currently open [`Batch`] (creating one if needed), and the
//! first admission into a new batch spawns the task that closes it when the
//! window elapses.

use crate::batch::{AdmitRejected, Batch, BatchState, Token};
use crate::error::BatchError;
use crate::handler::BulkHandler;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Timing knobs for a [`BatchDispatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// How long a batch stays open after its first admission.
    pub window: Duration,
    /// How long a caller waits past the window before giving up.
    pub wait_timeout: Duration,
}

impl DispatcherConfig {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            wait_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    fn deadline(&self) -> Duration {
        self.window.saturating_add(self.wait_timeout)
    }
}

/// Aggregates concurrent `submit` calls into timed batches for one bulk handler.
pub struct BatchDispatcher<I, O> {
    name: String,
    config: DispatcherConfig,
    handler: Arc<dyn BulkHandler<I, O>>,
    current: Mutex<Option<Arc<Batch<I, O>>>>,
}

impl<I, O> BatchDispatcher<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub fn new(
        name: impl Into<String>,
        config: DispatcherConfig,
        handler: Arc<dyn BulkHandler<I, O>>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            handler,
            current: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> DispatcherConfig {
        self.config
    }

    /// State of the most recently created batch, if any.
    pub fn current_state(&self) -> Option<BatchState> {
        self.current.lock().as_ref().map(|batch| batch.state())
    }

    /// Submit one item and wait for its individual result.
    ///
    /// Dropping the returned future detaches the caller from its batch without
    /// disturbing the other callers.
    pub async fn submit(&self, payload: I) -> Result<O, BatchError> {
        let token = Token::new();
        let batch = self.admit(token, payload)?;

        let mut guard = DetachOnDrop {
            batch: &batch,
            token,
            armed: true,
        };
        let result = batch.wait(token, self.config.deadline()).await;
        guard.armed = false;
        result
    }

    /// Admit into the open batch, or open a new one.
    ///
    /// The slot lock serialises lookup, creation and admission, so at most one
    /// batch is open per dispatcher. A batch that closed between creation and
    /// this call rejects the item, which then goes into a fresh batch. The fresh
    /// batch is admitted into before its window task exists, so it cannot reject.
    fn admit(&self, token: Token, payload: I) -> Result<Arc<Batch<I, O>>, BatchError> {
        let mut current = self.current.lock();

        let payload = match current.as_ref() {
            Some(batch) => match batch.admit(token, payload) {
                Ok(()) => return Ok(batch.clone()),
                Err(AdmitRejected(payload)) => payload,
            },
            None => payload,
        };

        let batch = Arc::new(Batch::new());
        if batch.admit(token, payload).is_err() {
            return Err(BatchError::AdmissionFailed);
        }
        *current = Some(batch.clone());
        self.spawn_window(batch.clone());
        Ok(batch)
    }

    fn spawn_window(&self, batch: Arc<Batch<I, O>>) {
        let handler = self.handler.clone();
        let window = self.config.window;
        let name = self.name.clone();

        metrics::counter!("batch.opened", "endpoint" => name.clone()).increment(1);
        debug!(endpoint = %name, batch_id = %batch.id(), window_ms = window.as_millis() as u64, "Batch opened");

        tokio::spawn(async move {
            if let Err(e) = batch.run_window(window, handler.as_ref()).await {
                warn!(
                    endpoint = %name,
                    batch_id = %batch.id(),
                    size = batch.len(),
                    error = %e,
                    "Batch failed"
                );
            }
        });
    }
}

struct DetachOnDrop<'a, I, O> {
    batch: &'a Batch<I, O>,
    token: Token,
    armed: bool,
}

impl<I, O> Drop for DetachOnDrop<'_, I, O> {
    fn drop(&mut self) {
        if self.armed {
            debug!(batch_id = %self.batch.id(), token = %self.token, "Caller detached from batch");
            self.batch.detach(self.token);
        }
    }
}
