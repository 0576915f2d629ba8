pub mod checkers;
pub mod engine;
pub mod error;
pub mod query;
pub mod traverse;

pub use checkers::{Checker, JoinSpec, JoinStep, WhereSpec};
pub use engine::{Engine, EngineBuilder, Principal, Subject};
pub use error::{AuthzError, Result};
pub use query::Select;
pub use traverse::{treefy_paths, PathTree, Resolved, Step, StepValue, Traverser};
