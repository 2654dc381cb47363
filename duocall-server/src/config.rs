use std::{net::IpAddr, time::Duration};

use clap::Parser;

/// Relay server for two-party calls.
#[derive(Clone, Debug, Parser)]
#[command(version, about)]
pub struct Config {
    #[arg(long, env = "DUOCALL_HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,
    #[arg(long, env = "DUOCALL_PORT", default_value_t = 3001)]
    pub port: u16,
    /// Calls untouched for this long are forgotten.
    #[arg(long, env = "DUOCALL_CALL_TTL_SECS", default_value_t = 600)]
    pub call_ttl_secs: u64,
    #[arg(long, env = "DUOCALL_SWEEP_INTERVAL_SECS", default_value_t = 60)]
    pub sweep_interval_secs: u64,
}

impl Config {
    pub fn call_ttl(&self) -> Duration {
        Duration::from_secs(self.call_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}
