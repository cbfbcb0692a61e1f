/// Run domain models
pub mod flow_instance;

/// Domain events
pub mod events;

/// Flow definition domain models
pub mod flow_definition;

/// Step graph nodes
pub mod step;

/// Compiled expressions
pub mod expression;

/// Collaborator and repository interfaces
pub mod repository;

/// Shared state module
pub mod shared_state;
