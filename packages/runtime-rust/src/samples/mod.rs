//! Reference workflows built on the bus.
//!
//! Each module declares its messages, one saga, and the stateless task
//! handlers that stand in for external work. Task handlers sleep for a
//! configurable [`WorkDelay`] before replying.

use std::time::Duration;

use simplebus_core::ConfigError;

use crate::dispatch::HandlerRegistry;

/// Declares a sample message: a plain struct with public fields and a wire
/// name.
macro_rules! sample_message {
    ($(#[$meta:meta])* $name:ident = $wire:literal { $($field:ident : $ty:ty),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
        pub struct $name {
            $(pub $field: $ty),*
        }

        impl simplebus_core::Message for $name {
            const MESSAGE_TYPE: &'static str = $wire;
        }
    };
}

pub mod import_evaluator;
pub mod publish_agent;
pub mod train_models;

/// Simulated duration of the external work a task handler stands in for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkDelay(pub Duration);

impl WorkDelay {
    pub async fn perform(self) {
        if !self.0.is_zero() {
            tokio::time::sleep(self.0).await;
        }
    }
}

/// Registers every sample workflow.
///
/// # Errors
///
/// Returns the first [`ConfigError`] raised by a registration.
pub fn register_all(registry: &HandlerRegistry, work: WorkDelay) -> Result<(), ConfigError> {
    publish_agent::register(registry, work)?;
    import_evaluator::register(registry, work)?;
    train_models::register(registry)?;
    Ok(())
}
