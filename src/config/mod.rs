//! Configuration for the supervisor and the per-agent server.

mod providers;
mod schema;

pub use providers::{consume_env_key, key_env_var, provider_base_url, KNOWN_PROVIDERS};
pub use schema::{RunMode, TinycrabOptions};
