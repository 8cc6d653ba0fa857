//! The invocation dispatcher and its execution strategies: direct compute
//! invocation, HTTP redirect, and asynchronous tasks.

pub mod compute;
pub mod functions;
pub mod logs;
pub mod redirect;
pub mod service;
pub mod types;

pub use compute::{ComputeBackend, ComputeError, ComputeInvocation, HttpComputeBackend};
pub use functions::{FunctionRegistry, FunctionRegistryError};
pub use redirect::{RedirectClient, RedirectError};
pub use service::{DispatchReport, DispatcherSettings, InvocationDispatcher, InvocationRequest};
pub use types::{
    DispatchOutcome, FunctionSummary, FunctionTarget, InvocationError, ResponseBody,
    ResponseSource,
};
