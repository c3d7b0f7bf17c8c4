pub mod context;
pub mod executor;
pub mod providers;
pub mod race;
pub mod relay;
pub mod service;
pub mod types;

// Re-export core types at crate root for convenience.
pub use context::{ContextEnricher, DuckDuckGoEnricher, NoContext};
pub use executor::{AttemptExecutor, AttemptOutcome, AttemptOutput};
pub use providers::{AiProvider, ProviderError};
pub use race::{
    AttemptSnapshot, AttemptState, PolicyError, RaceCoordinator, RaceError, RaceEvent,
    RacePolicy, RaceRequest, RaceResult,
};
pub use relay::{OutEvent, StreamRelay};
pub use service::{ChatReply, ChatService};
pub use types::*;
