//! Saga base abstraction: identity, typed state slot, and completion flag.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StateSlotEmpty;
use crate::handler::{Handle, Handler};
use crate::mapping::StateMapper;
use crate::message::Message;

/// Durable state owned by one saga instance.
///
/// Persisted as a JSON document between invocations. `Default` is the state
/// a start trigger synthesizes before the correlation field is filled in.
pub trait SagaState: Serialize + DeserializeOwned + Default + Send + Sync + 'static {}

impl<T> SagaState for T where T: Serialize + DeserializeOwned + Default + Send + Sync + 'static {}

/// State slot and completion flag embedded in every saga.
///
/// The invocation context assigns the slot before calling the handler and
/// takes the (possibly mutated) state back out afterwards. The completion
/// flag starts unset and can only ever be set.
#[derive(Debug)]
pub struct SagaData<T> {
    state: Option<T>,
    completed: bool,
}

impl<T> Default for SagaData<T> {
    fn default() -> Self {
        Self {
            state: None,
            completed: false,
        }
    }
}

impl<T> SagaData<T> {
    /// Empty slot, not completed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Places hydrated state into the slot.
    pub fn assign(&mut self, state: T) {
        self.state = Some(state);
    }

    /// Removes the state from the slot.
    pub fn take(&mut self) -> Option<T> {
        self.state.take()
    }

    #[must_use]
    pub fn get(&self) -> Option<&T> {
        self.state.as_ref()
    }

    pub fn get_mut(&mut self) -> Option<&mut T> {
        self.state.as_mut()
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Sets the completion flag. There is no way to clear it.
    pub fn mark_completed(&mut self) {
        self.completed = true;
    }
}

/// A handler type with durable, correlation-keyed state.
///
/// ```rust,ignore
/// pub struct PublishAgentWorkflow {
///     data: SagaData<PublishAgentState>,
/// }
///
/// impl Saga for PublishAgentWorkflow {
///     const SAGA_TYPE: &'static str = "publish-agent";
///     type State = PublishAgentState;
///
///     fn configure_mapping(mapper: &mut StateMapper<Self>) {
///         mapper
///             .start_with::<PublishAgent>("id", "identifier")
///             .map::<CorpusCreated>("id", "identifier");
///     }
///
///     fn saga_data(&self) -> &SagaData<Self::State> { &self.data }
///     fn saga_data_mut(&mut self) -> &mut SagaData<Self::State> { &mut self.data }
/// }
/// ```
pub trait Saga: Handler + Sized {
    /// Stable saga type name. Scopes stored state records.
    const SAGA_TYPE: &'static str;

    /// The saga's durable state.
    type State: SagaState;

    /// Declares, for every handled message type, which message field carries
    /// the correlation value and which state field it binds to.
    ///
    /// Called exactly once per saga type, when the saga is registered.
    fn configure_mapping(mapper: &mut StateMapper<Self>);

    fn saga_data(&self) -> &SagaData<Self::State>;

    fn saga_data_mut(&mut self) -> &mut SagaData<Self::State>;

    /// Hydrated state.
    ///
    /// # Errors
    ///
    /// Returns [`StateSlotEmpty`] if called outside an invocation.
    fn state(&self) -> Result<&Self::State, StateSlotEmpty> {
        self.saga_data().get().ok_or(StateSlotEmpty {
            saga_type: Self::SAGA_TYPE,
        })
    }

    /// Hydrated state, mutably.
    ///
    /// # Errors
    ///
    /// Returns [`StateSlotEmpty`] if called outside an invocation.
    fn state_mut(&mut self) -> Result<&mut Self::State, StateSlotEmpty> {
        self.saga_data_mut().get_mut().ok_or(StateSlotEmpty {
            saga_type: Self::SAGA_TYPE,
        })
    }

    /// Marks this saga instance finished; its state is deleted after the
    /// current invocation.
    fn mark_as_completed(&mut self) {
        self.saga_data_mut().mark_completed();
    }

    fn is_completed(&self) -> bool {
        self.saga_data().is_completed()
    }
}

/// Declares `M` as a start trigger of the saga.
///
/// Only start triggers may create saga state when none exists for the
/// message's correlation value.
pub trait StartedBy<M: Message>: Handle<M> {}
