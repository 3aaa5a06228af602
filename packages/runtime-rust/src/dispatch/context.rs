//! Stateful invocation context: drives one handler invocation for one
//! message.
//!
//! For sagas the sequence is:
//!
//! 1. resolve the correlation key from the message
//! 2. ensure a state record exists (start triggers create one)
//! 3. lock the record's resource
//! 4. hydrate the state under the lock
//! 5. invoke the handler, catching errors and panics
//! 6. save the state and the completion marker, fenced on the lease
//! 7. release the lease on every exit path
//! 8. if the saga completed, lock again, delete the record, release
//!
//! A record carrying the completion marker is treated as absent: later
//! messages cannot materialize it, and a start trigger replaces it with a
//! fresh instance. Messages the handler emitted are flushed to the bus once
//! the state has been saved.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use simplebus_core::mapping::{decode_state, encode_state, synthesize_state};
use simplebus_core::{
    AnyMessage, CorrelationKey, Dispatch, Handle, Handler, Message, Outbox, Saga,
};
use tracing::{debug, info, warn};

use super::correlation::CorrelationRegistry;
use crate::error::BusError;
use crate::lock::{DistributedLock, Lease};
use crate::storage::{SaveOutcome, StateRecord, StateStore, StateUpdate};
use crate::transport::ServiceBus;

/// Attempts to pin down a saga instance before giving up. Each retry means
/// the instance was deleted or replaced while this invocation waited for the
/// lock.
const MAX_HYDRATE_ATTEMPTS: u32 = 3;

/// Collaborators an invocation runs against.
#[derive(Clone)]
pub struct DispatchEnv {
    pub store: Arc<dyn StateStore>,
    pub lock: DistributedLock,
    pub correlations: Arc<CorrelationRegistry>,
    pub bus: Arc<dyn ServiceBus>,
}

/// How one handler invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Invocation {
    pub handler: &'static str,
    /// The handler returned an error or panicked. The failure was logged
    /// and swallowed.
    pub failed: bool,
    /// The saga marked itself completed and its state was deleted.
    pub completed: bool,
}

/// Runs handler invocations against a [`DispatchEnv`].
#[derive(Clone)]
pub struct StatefulContext {
    env: DispatchEnv,
}

impl StatefulContext {
    #[must_use]
    pub fn new(env: DispatchEnv) -> Self {
        Self { env }
    }

    #[must_use]
    pub fn env(&self) -> &DispatchEnv {
        &self.env
    }

    /// Invokes a handler without state: no correlation, locking, or
    /// persistence.
    ///
    /// # Errors
    ///
    /// Only flushing the outbox can fail; handler errors are swallowed.
    pub async fn run_stateless<H, M>(&self, mut handler: H, message: &M) -> Result<Invocation, BusError>
    where
        H: Handle<M>,
        M: Message,
    {
        let mut outbox = Outbox::new();
        let failed = !invoke_guarded(&mut handler, message, &mut outbox).await;
        self.flush(outbox).await?;
        Ok(Invocation {
            handler: std::any::type_name::<H>(),
            failed,
            completed: false,
        })
    }

    /// Invokes saga `S` for `message`.
    ///
    /// # Errors
    ///
    /// - [`BusError::MissingMapping`] if `S` has no mapping entry for `M`
    /// - [`BusError::CannotMaterialize`] if no state exists and `M` is not a
    ///   start trigger
    /// - [`BusError::LeaseLost`] if the lease expired before the save
    /// - [`BusError::Store`] / [`BusError::Codec`] on store or codec failure
    pub async fn run_saga<S, M>(&self, mut saga: S, message: &M) -> Result<Invocation, BusError>
    where
        S: Saga + Handle<M>,
        M: Message,
    {
        let key = self.correlate::<S, M>(message)?;
        let (lease, record) = self.lock_instance::<S, M>(&key).await?;

        let locked = self.invoke_locked(&mut saga, message, &record, &lease).await;
        let released = self.env.lock.release(lease).await;
        let (outbox, failed) = locked?;
        released?;

        self.flush(outbox).await?;

        let completed = saga.is_completed();
        if completed {
            self.sweep(&key, &record).await?;
        }

        Ok(Invocation {
            handler: std::any::type_name::<S>(),
            failed,
            completed,
        })
    }

    fn correlate<S, M>(&self, message: &M) -> Result<CorrelationKey, BusError>
    where
        S: Saga,
        M: Message,
    {
        let missing = || BusError::MissingMapping {
            saga_type: S::SAGA_TYPE,
            message_type: M::MESSAGE_TYPE,
        };
        let map = self.env.correlations.get(S::SAGA_TYPE).ok_or_else(missing)?;
        map.correlate(message)?.ok_or_else(missing)
    }

    fn is_start_trigger<S: Saga>(&self, message_type: &str) -> bool {
        self.env
            .correlations
            .get(S::SAGA_TYPE)
            .is_some_and(|map| map.is_start_trigger(message_type))
    }

    /// Steps 2 to 4: find or create the record, lock it, re-read it under
    /// the lock. Completed records are never returned.
    async fn lock_instance<S, M>(&self, key: &CorrelationKey) -> Result<(Lease, StateRecord), BusError>
    where
        S: Saga,
        M: Message,
    {
        let store = &self.env.store;
        let cannot_materialize = || BusError::CannotMaterialize {
            saga_type: S::SAGA_TYPE,
            message_type: M::MESSAGE_TYPE,
            key: key.clone(),
        };

        let start_trigger = self.is_start_trigger::<S>(M::MESSAGE_TYPE);

        for attempt in 1..=MAX_HYDRATE_ATTEMPTS {
            let existing = store.get(key).await?;
            let live = existing.as_ref().is_some_and(|record| !record.completed);
            if !live && !start_trigger {
                return Err(cannot_materialize());
            }
            if existing.is_none() {
                let document = synthesize_state::<S::State>(key)?;
                let now = self.env.lock.clock().now();
                let outcome = store
                    .create(key, StateRecord::new(S::SAGA_TYPE, document, now))
                    .await?;
                debug!(%key, ?outcome, "saga state materialized");
            }

            let Some(lease) = self.env.lock.lock(key).await? else {
                debug!(%key, attempt, "saga state vanished before lock");
                continue;
            };

            match store.get(key).await {
                Ok(Some(record)) if record.resource_id == lease.resource_id => {
                    if !record.completed {
                        return Ok((lease, record));
                    }
                    let replaced = if start_trigger {
                        store.delete(&record.resource_id).await.map(drop)
                    } else {
                        Ok(())
                    };
                    self.env.lock.release(lease).await?;
                    replaced?;
                    if !start_trigger {
                        return Err(cannot_materialize());
                    }
                    debug!(%key, attempt, "completed saga instance replaced by a new start");
                }
                Ok(_) => {
                    debug!(%key, attempt, "saga instance changed while waiting for lock");
                    self.env.lock.release(lease).await?;
                }
                Err(e) => {
                    self.env.lock.release(lease).await?;
                    return Err(e.into());
                }
            }
        }

        if start_trigger {
            Err(BusError::Store(anyhow::anyhow!(
                "saga instance {key} kept changing under contention"
            )))
        } else {
            Err(cannot_materialize())
        }
    }

    /// Steps 4 to 6, with the lease held. Returns the outbox and whether the
    /// handler failed.
    async fn invoke_locked<S, M>(
        &self,
        saga: &mut S,
        message: &M,
        record: &StateRecord,
        lease: &Lease,
    ) -> Result<(Outbox, bool), BusError>
    where
        S: Saga + Handle<M>,
        M: Message,
    {
        let state: S::State = decode_state(&record.document)?;
        saga.saga_data_mut().assign(state);

        let mut outbox = Outbox::new();
        let failed = !invoke_guarded(saga, message, &mut outbox).await;

        let Some(state) = saga.saga_data_mut().take() else {
            warn!(saga = S::SAGA_TYPE, "state slot emptied by handler, nothing to save");
            return Ok((outbox, failed));
        };
        let update = StateUpdate {
            document: encode_state(&state)?,
            completed: saga.is_completed(),
        };
        let now = self.env.lock.clock().now();
        match self
            .env
            .store
            .save(&record.resource_id, update, &lease.fence(now), now)
            .await?
        {
            SaveOutcome::Saved => Ok((outbox, failed)),
            SaveOutcome::Fenced => Err(BusError::LeaseLost {
                resource: record.resource_id.to_string(),
            }),
            SaveOutcome::Missing => {
                warn!(resource = %record.resource_id, "saga state deleted while locked, save skipped");
                Ok((outbox, failed))
            }
        }
    }

    /// Step 8: delete completed state under a fresh lease.
    async fn sweep(&self, key: &CorrelationKey, record: &StateRecord) -> Result<(), BusError> {
        let lease = self.env.lock.acquire(&record.resource_id).await?;
        let deleted = self.env.store.delete(&record.resource_id).await;
        let released = self.env.lock.release(lease).await;
        let deleted = deleted?;
        released?;
        info!(%key, resource = %record.resource_id, deleted, "saga completed");
        Ok(())
    }

    async fn flush(&self, mut outbox: Outbox) -> Result<(), BusError> {
        for dispatch in outbox.drain() {
            match dispatch {
                Dispatch::Send(envelope) => self.env.bus.send(envelope).await?,
                Dispatch::Retry { envelope, delay } => self.env.bus.retry(envelope, delay).await?,
            }
        }
        Ok(())
    }
}

/// Step 5. Runs the handler and contains any failure. Returns `true` on
/// success.
async fn invoke_guarded<H, M>(handler: &mut H, message: &M, outbox: &mut Outbox) -> bool
where
    H: Handle<M>,
    M: Message,
{
    let result = AssertUnwindSafe(handler.handle(message, outbox))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(anyhow::anyhow!("handler panicked: {}", panic_text(&*panic))));

    let Err(error) = result else {
        return true;
    };

    let handler_name = std::any::type_name::<H>();
    warn!(
        handler = handler_name,
        message_type = M::MESSAGE_TYPE,
        error = %error,
        "handler failed"
    );
    metrics::counter!("simplebus_handler_failures_total", "message_type" => M::MESSAGE_TYPE)
        .increment(1);
    if let Some(hook) = Handler::error_hook(handler) {
        hook.on_handler_error(message as &dyn AnyMessage, &error);
    }
    false
}

fn panic_text(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
