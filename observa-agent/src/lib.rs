//! Agent runtime: sync scheduler + event forwarder + control socket.

mod error;
pub mod paths;
pub mod protocol;
mod runtime;

pub use error::AgentError;
pub use protocol::{
    request_status, request_stop, request_sync, send_request, AgentRequest, AgentResponse,
};
pub use runtime::{run, start_blocking, AgentContext, AgentState};
