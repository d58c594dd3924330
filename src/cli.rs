//! CLI argument parsing using clap.

use clap::Parser;

use im_bridge::bridge::{BridgeConfig, DEFAULT_COMMAND_BUFFER, DEFAULT_QUERY_LIMIT};

/// IM Bridge - Serve messaging sessions to a host over JSON lines on stdio
#[derive(Parser, Debug, Clone)]
#[command(name = "im-bridge")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Enable verbose/debug logging
    #[arg(short, long, env = "IM_BRIDGE_VERBOSE")]
    pub verbose: bool,

    /// Log filter directives, overrides --verbose (e.g. "im_bridge=trace")
    #[arg(long, value_name = "FILTER", env = "IM_BRIDGE_LOG")]
    pub log_filter: Option<String>,

    /// Commands queued before callers have to wait
    #[arg(long, default_value_t = DEFAULT_COMMAND_BUFFER, env = "IM_BRIDGE_COMMAND_BUFFER")]
    pub command_buffer: usize,

    /// Page size for queries that do not name one
    #[arg(long, default_value_t = DEFAULT_QUERY_LIMIT, env = "IM_BRIDGE_QUERY_LIMIT")]
    pub default_query_limit: u32,

    /// Events buffered per client before a slow session starts dropping them
    #[arg(long, default_value = "256", env = "IM_BRIDGE_EVENT_BUFFER")]
    pub event_buffer: usize,
}

impl Args {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            command_buffer: self.command_buffer,
            default_query_limit: self.default_query_limit,
        }
    }
}
