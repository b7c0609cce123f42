//! HTTP and SSE surface for exrun runs.
//!
//! Exposes the run-resource contract of [`exrun_runs::RunService`] as JSON
//! routes wrapped in a `{code, msg, data}` envelope, plus server-sent event
//! streams for a run's log and for the run list.

mod run_api;

pub use run_api::{
    build_run_api_router, run_gateway_server, RunGatewayServerConfig, RunGatewayState,
    BRIDGE_PAGE_ENDPOINT, DEFAULT_PING_INTERVAL,
};
