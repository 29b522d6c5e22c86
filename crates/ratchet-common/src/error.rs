use thiserror::Error;

/// A task submission that can never enter the queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Task id must not be empty")]
    EmptyId,

    #[error("Task {id} has an empty description")]
    EmptyDescription { id: String },

    #[error("Task {id} has an empty completion sentinel")]
    EmptySentinel { id: String },

    #[error("Task {id} has iteration budget {budget}; it must be greater than zero")]
    NonPositiveBudget { id: String, budget: i64 },

    #[error("Task {id} depends on itself")]
    SelfDependency { id: String },

    #[error("Task {id} already exists")]
    DuplicateId { id: String },

    #[error("Dependency cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },
}
