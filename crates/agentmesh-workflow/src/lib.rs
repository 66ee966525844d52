//! agentmesh-workflow - validated, dependency-ordered, transactional workflows

pub mod definition;
pub mod executor;
pub mod graph;
pub mod manager;
pub mod repository;
pub mod run;
pub mod transaction;
pub mod validate;

pub use definition::{InputBinding, StepDefinition, WorkflowDefinition};
pub use executor::{output_predicate, step_iri, Services, FACTS_KEY, STEP_RUN_CLASS};
pub use graph::StepGraph;
pub use manager::{Submission, WorkflowManager};
pub use repository::{FileRepository, MemoryRepository, RunRepository};
pub use run::{RunReport, RunState, RunStatus, StepState, StepStatus};
pub use transaction::{Transaction, TransactionState, UndoEntry};
pub use validate::{check_structure, validate};
