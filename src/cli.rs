// CLI definitions using clap

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use thiserror::Error;
use usbwatch_core::{is_valid_topic, DeviceFilter};

#[derive(Parser)]
#[command(name = "usbwatch")]
#[command(author, version, about = "Watch USB devices being attached and detached")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Config file (default: <config dir>/usbwatch/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Listener poll interval in milliseconds (10-1000)
    #[arg(long, global = true, value_name = "MS")]
    pub poll_interval: Option<u64>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List attached USB devices
    #[command(visible_aliases = ["ls", "l"])]
    List {
        #[command(flatten)]
        filter: FilterArgs,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Print devices as they are attached and detached until Ctrl-C
    #[command(visible_aliases = ["watch", "w"])]
    Monitor {
        #[command(flatten)]
        filter: FilterArgs,

        /// Only print events published under this topic (repeatable),
        /// e.g. add, remove:1256, change:1256:20539
        #[arg(long, value_name = "TOPIC", value_parser = parse_topic)]
        topic: Vec<String>,

        /// Print JSON lines instead of text
        #[arg(long)]
        json: bool,

        /// Do not print the devices attached at startup
        #[arg(long)]
        no_initial: bool,
    },

    /// Show the config file, or create it with defaults
    Config {
        /// Write the default config if none exists
        #[arg(long)]
        init: bool,

        /// With --init, overwrite an existing file
        #[arg(long, requires = "init")]
        force: bool,
    },
}

/// VID/PID selection shared by list and monitor
#[derive(Args, Clone, Copy, Debug, Default)]
pub struct FilterArgs {
    /// Vendor ID in hex (e.g. 04e8 or 0x04e8)
    #[arg(long, value_name = "ID", value_parser = parse_id)]
    pub vid: Option<u16>,

    /// Product ID in hex; requires --vid
    #[arg(long, value_name = "ID", value_parser = parse_id, requires = "vid")]
    pub pid: Option<u16>,
}

impl FilterArgs {
    pub fn to_filter(self) -> DeviceFilter {
        DeviceFilter::new(self.vid.unwrap_or(0), self.pid.unwrap_or(0))
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ArgError {
    #[error("empty ID")]
    EmptyId,
    #[error("'{0}' is not a 16-bit hex ID")]
    InvalidId(String),
    #[error("'{0}' is not a topic (expected add|remove|change[:vid[:pid]] in decimal)")]
    InvalidTopic(String),
}

/// Parse a USB ID given in hex, with or without a `0x` prefix
pub fn parse_id(s: &str) -> Result<u16, ArgError> {
    let s = s.trim();
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    if digits.is_empty() {
        return Err(ArgError::EmptyId);
    }
    u16::from_str_radix(digits, 16).map_err(|_| ArgError::InvalidId(s.to_string()))
}

pub fn parse_topic(s: &str) -> Result<String, ArgError> {
    if is_valid_topic(s) {
        Ok(s.to_string())
    } else {
        Err(ArgError::InvalidTopic(s.to_string()))
    }
}
