use std::path::PathBuf;

use clap::Parser;

use crate::{config::DEFAULT_CONFIG_PATH, daemon::DaemonOptions};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "drm-lease-manager",
    version,
    about = "Hands out DRM leases of display outputs to client processes"
)]
pub struct Args {
    /// DRM device to partition into leases.
    #[arg(default_value = "/dev/dri/card0")]
    pub device: PathBuf,

    /// Path to the lease configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Enable verbose debug messages.
    #[arg(short, long)]
    pub verbose: bool,

    /// Allow lease transfer to new clients.
    #[arg(short = 't', long)]
    pub lease_transfer: bool,

    /// Don't close the lease when its client crashes.
    #[arg(short, long)]
    pub keep_on_crash: bool,
}

impl Args {
    pub fn daemon_options(&self) -> DaemonOptions {
        DaemonOptions {
            allow_transfer: self.lease_transfer,
            keep_on_crash: self.keep_on_crash,
        }
    }

    pub fn default_log_filter(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else {
            "info"
        }
    }
}
