//! Workflow invocation: request/result types, response decoding and the
//! retrying controller.

pub mod controller;
pub mod decoder;
mod types;

pub use controller::{
    AttemptOutcome, DEFAULT_IDENTITY, InvocationState, WorkflowClient, next_state,
};
pub use decoder::{DecodeError, StreamLine, classify_line, decode_blocking, decode_stream};
pub use types::{
    DeliveryMode, Fields, InvocationError, InvocationResult, StreamEvent, WorkflowRequest,
};
