//! Shared domain types for the Repobox runner.
//!
//! These types cross the boundary between the runner and the front end
//! that enqueues jobs, so their string forms are part of the wire contract.

pub mod models;

pub use models::{
    EnvelopeError, Job, JobMessage, JobRecord, JobStatus, JobUpdate, OutputLine, OutputStream,
    SessionState, SessionStatus,
};
