//! MCP gateway: per-tenant HTTP surface, confirmation correlation, and the
//! JSON-RPC face for external AI clients.

pub mod confirmations;
pub mod endpoints;
pub mod gateway;
pub mod protocol;

pub use confirmations::{ConfirmationOutcome, ConfirmationRecord, ConfirmationStore};
pub use endpoints::{EndpointRegistry, McpEndpoint};
pub use gateway::{router, serve, GatewayState};
