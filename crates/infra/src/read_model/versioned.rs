//! Read-your-writes reads over eventually consistent read models.

use std::marker::PhantomData;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use super::{ReadModel, ReadModelError, ReadRepository, find_optional};
use crate::event_store::EventStore;

/// Per-call read requirements.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadContext {
    /// Lowest version the caller already knows about, e.g. the version
    /// returned by the command that just ran.
    pub min_version: Option<u64>,
    /// How long a stale read may keep waiting.
    pub deadline: Option<Instant>,
}

impl ReadContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_version(mut self, version: u64) -> Self {
        self.min_version = Some(version);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }
}

/// Wraps a read repository so reads can wait for projections to catch up.
pub struct VersionedReadRepository<M, R, S> {
    repository: R,
    events: S,
    poll_interval: Duration,
    _model: PhantomData<fn() -> M>,
}

impl<M, R, S> VersionedReadRepository<M, R, S>
where
    M: ReadModel,
    R: ReadRepository<M>,
    S: EventStore,
{
    pub fn new(repository: R, events: S) -> Self {
        Self {
            repository,
            events,
            poll_interval: Duration::from_millis(10),
            _model: PhantomData,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    /// Read `id`, waiting until the model reflects every event the history
    /// holds from `ctx.min_version` on.
    ///
    /// Without a minimum version this is a plain `find`, and so is a read whose
    /// history scan fails. Without a deadline a stale model fails right away
    /// with [`ReadModelError::MinVersionNotReached`].
    pub async fn find_with_min_version(&self, id: &str, ctx: &ReadContext) -> Result<M, ReadModelError> {
        let Some(min_version) = ctx.min_version else {
            return self.repository.find(id).await;
        };

        // Scan the history from the known watermark only.
        let history = match self.events.load_from(id, min_version).await {
            Ok(history) => history,
            Err(err) => {
                warn!(id, min_version, error = %err, "event history unavailable, reading without version check");
                return self.repository.find(id).await;
            }
        };
        let target = history
            .iter()
            .map(|record| record.aggregate().version)
            .fold(min_version, u64::max);

        loop {
            let current = find_optional(&self.repository, id).await?;
            let found = current.as_ref().map(ReadModel::version);
            if let Some(model) = current.filter(|model| model.version() >= target) {
                return Ok(model);
            }

            let expired = match ctx.deadline {
                Some(deadline) => Instant::now() + self.poll_interval > deadline,
                None => true,
            };
            if expired {
                return Err(ReadModelError::MinVersionNotReached {
                    id: id.to_string(),
                    min_version: target,
                    found,
                });
            }

            debug!(id, target, found, "read model behind, waiting");
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
