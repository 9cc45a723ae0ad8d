//! Agent forwarding bookkeeping
//!
//! The framework only remembers whether the client asked for agent
//! forwarding on this connection. Opening the agent channel back to the
//! client is left to handlers.

use crate::context::Context;

/// Channel request type asking the server to forward the client's agent.
pub const AGENT_REQUEST_TYPE: &str = "auth-agent-req@openssh.com";

/// Channel type the server opens to reach the forwarded agent.
pub const AGENT_CHANNEL_TYPE: &str = "auth-agent@openssh.com";

const AGENT_REQUESTED_KEY: &str = "auth-agent-req";

/// Mark agent forwarding as requested for the whole connection.
pub async fn set_agent_requested(ctx: &Context) {
    ctx.set_value(AGENT_REQUESTED_KEY, true).await;
}

/// Whether any channel on this connection requested agent forwarding.
pub async fn agent_requested(ctx: &Context) -> bool {
    ctx.value::<bool>(AGENT_REQUESTED_KEY).await.unwrap_or(false)
}
