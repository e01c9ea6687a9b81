//! Coordinator process configuration (§6, §9 ambient config section),
//! grounded on the teacher's `bpmn-lite-server/src/main.rs` CLI-arg/env
//! fallback, generalized from hand-rolled arg scanning to `clap` derive +
//! env, as the teacher's sibling `rust/` workspace does.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "choreo-coordinator", about = "Workflow choreography coordinator process")]
pub struct Config {
    /// Postgres connection string for the Artifact Store. Falls back to an
    /// in-memory store if unset (or if the `postgres` feature is disabled).
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Redis connection string for the Hot Store and task dispatch. Falls
    /// back to an in-memory store if unset (or if the `redis` feature is
    /// disabled) — single-process only, for local development and tests.
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// Structural safety cap on `agent`-typed nodes a patch reload may
    /// introduce (§4.5 step 7).
    #[arg(long, env = "AGENT_NODE_LIMIT", default_value_t = 5)]
    pub agent_node_limit: usize,

    /// How long the completion-signal consumer blocks waiting for the next
    /// signal before re-checking for a shutdown request (§5).
    #[arg(long, env = "SIGNAL_POLL_TIMEOUT_MS", default_value_t = 5000)]
    pub signal_poll_timeout_ms: u64,
}

impl Config {
    pub fn parse_from_env() -> Self {
        Config::parse()
    }
}
