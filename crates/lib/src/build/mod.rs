//! Build value model and execution.
//!
//! A build starts from a [`BuildDefinition`] (what to build, with unresolved
//! input references) or its [`BuildKey`]. Resolving the inputs' hashes and
//! sizes turns it into a [`BuildAction`], whose key addresses the cache.
//! Running the action's [`BuildFunction`] over the resolved [`BuildInputs`]
//! produces a [`BuildOutput`].
//!
//! Every record is immutable once built and identified by the hash of its
//! canonical serialization, so equal requests share keys across processes.
//!
//! # Submodules
//!
//! - [`job`] - per-build state machine
//! - [`scheduler`] - dispatch of asynchronous job stages
//! - [`session`] - jobs sharing a resolver and cache
//! - [`system`] - process-wide registries

mod action;
mod definition;
mod error;
mod function;
mod inputs;
pub mod job;
mod key;
mod output;
mod policy;
mod resolver;
pub mod scheduler;
pub mod session;
pub mod system;
mod worker;

pub use action::{BuildAction, BuildActionBuilder, BuildInputMeta};
pub use definition::{BuildDefinition, BuildDefinitionBuilder, DefinitionInputs};
pub use error::{BuilderError, RecordError, RegistryError, SessionError};
pub use function::{BuildConfigContext, BuildContext, BuildFunction, BuildFunctionRegistry};
pub use inputs::{BuildInputs, BuildInputsBuilder};
pub use job::{BuildCompleteCallback, BuildCompleteParams, BuildJob, BuildJobState};
pub use key::{BuildActionKey, BuildKey, BuildValueKey, ValueId, is_valid_function_name};
pub use output::{BuildDiagnostic, BuildOutput, BuildOutputBuilder, BuildPayload, DiagnosticLevel};
pub use policy::{BuildPolicy, BuildRequestPolicy, BuildStatusFlags};
pub use resolver::{BuildInputResolver, InputFilter, InputSource, MemoryInputResolver, ResolveError};
pub use scheduler::{BuildScheduler, BuildStage, InlineScheduler, ScheduledStep, SchedulerParams, TokioScheduler};
pub use session::BuildSession;
pub use system::BuildSystem;
pub use worker::{BuildWorker, BuildWorkerRegistry, NoWorkers, RemoteBuildResult, StaticWorkerRegistry};
