use std::sync::Mutex;

use eventlog_events::{Projection, ProjectionRunner};

use crate::event_store::{ReadFilter, StoredEvent};

/// Error returned by consumer-supplied code.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A named consumer of the global event order.
///
/// Delivery is at-least-once. After a crash between applying a batch and
/// checkpointing it, the same events are handed to `apply` again, so applying
/// an event twice must have the same effect as applying it once.
#[async_trait::async_trait]
pub trait ConsumerHandler: Send + Sync {
    /// Checkpoint key. Must be stable across restarts.
    fn name(&self) -> &str;

    /// Events this consumer wants. Checkpoints still advance past everything
    /// else in the log.
    fn filter(&self) -> ReadFilter {
        ReadFilter::all()
    }

    async fn apply(&self, event: &StoredEvent) -> Result<(), HandlerError>;

    /// Make the effects of every applied event durable. The checkpoint is
    /// only written after this returns `Ok`.
    async fn flush(&self) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Drop all derived state ahead of a rebuild.
    async fn clear(&self) -> Result<(), HandlerError>;
}

/// Adapts an in-process [`Projection`] to a [`ConsumerHandler`].
#[derive(Debug)]
pub struct ProjectionConsumer<P>
where
    P: Projection,
{
    name: String,
    filter: ReadFilter,
    runner: Mutex<ProjectionRunner<P>>,
}

impl<P> ProjectionConsumer<P>
where
    P: Projection,
{
    pub fn new(name: impl Into<String>, runner: ProjectionRunner<P>) -> Self {
        let filter = match runner.cursor().org_id() {
            Some(org_id) => ReadFilter::all().org(org_id),
            None => ReadFilter::all(),
        };
        Self {
            name: name.into(),
            filter,
            runner: Mutex::new(runner),
        }
    }

    pub fn with_filter(mut self, filter: ReadFilter) -> Self {
        if let Some(org_id) = self.filter.org_id {
            self.filter = ReadFilter { org_id: Some(org_id), ..filter };
        } else {
            self.filter = filter;
        }
        self
    }

    /// Read the projection under the lock.
    pub fn with_projection<R>(&self, f: impl FnOnce(&P) -> R) -> Result<R, HandlerError> {
        let runner = self.runner.lock().map_err(|_| "projection lock poisoned")?;
        Ok(f(runner.projection()))
    }

    pub fn into_projection(self) -> Result<P, HandlerError> {
        let runner = self.runner.into_inner().map_err(|_| "projection lock poisoned")?;
        Ok(runner.into_projection())
    }
}

#[async_trait::async_trait]
impl<P> ConsumerHandler for ProjectionConsumer<P>
where
    P: Projection + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn filter(&self) -> ReadFilter {
        self.filter.clone()
    }

    async fn apply(&self, event: &StoredEvent) -> Result<(), HandlerError> {
        let envelope = event.to_envelope();
        let mut runner = self.runner.lock().map_err(|_| "projection lock poisoned")?;
        runner.apply(&envelope)?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), HandlerError> {
        let mut runner = self.runner.lock().map_err(|_| "projection lock poisoned")?;
        runner.reset();
        Ok(())
    }
}
