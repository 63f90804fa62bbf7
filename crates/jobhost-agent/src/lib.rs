//! Job submission and supervision agent.
//!
//! Jobs are shell entrypoints run as their own process group, one supervisor
//! task per job, with state kept in a shared [`JobRegistry`].

#[cfg(not(unix))]
compile_error!("jobhost-agent relies on Unix process groups and only builds on Unix targets");

pub mod barrier;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod health_service;
pub mod job_service;
pub mod log_sink;
pub mod manager;
pub mod materializer;
pub mod process_runner;
pub mod registry;
mod supervisor;

pub use barrier::StartBarrier;
pub use config::AgentConfig;
pub use dispatcher::{Dispatcher, LocalDispatcher, SupervisorExit, SupervisorExitKind, SupervisorRef};
pub use error::{JobError, Result};
pub use manager::{JobManager, LogChunk, SubmitOptions};
pub use materializer::{LocalMaterializer, MaterializedEnv, Materializer};
pub use registry::JobRegistry;
pub use supervisor::{JOB_ID_ENV_VAR, JOB_ID_METADATA_KEY, JOB_METADATA_ENV_VAR};
