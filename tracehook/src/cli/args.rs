//! CLI argument definitions

use clap::Parser;

use crate::config::EngineSettings;
use crate::domain::{EngineError, FilterMode, Pid};
use crate::engine::filter::FilterEntry;

#[derive(Parser, Debug)]
#[command(
    name = "tracehook",
    about = "Observe syscalls, manage hardware breakpoints and read process memory",
    after_help = "\
EXAMPLES:
    tracehook --simulate get_status                     Status of the simulated host
    tracehook --simulate add_filter:name:app get_status Filter, then status
    sudo tracehook bp_set:0x7f001000:exec:4:1234 bp_list
    sudo tracehook mem_read:1234:7ffd1c000000:64
    sudo tracehook --watch 30 bp_set:0x7f001000:exec:4  Set, then pump hits for 30s
    echo help | tracehook --simulate --stdin"
)]
pub struct Args {
    /// Control commands, run in order (`help` lists them)
    #[arg(value_name = "COMMAND")]
    pub commands: Vec<String>,

    /// Read further commands from stdin, one per line
    #[arg(long)]
    pub stdin: bool,

    /// Use the simulated host instead of the running system
    #[arg(long)]
    pub simulate: bool,

    /// Print replies and status as JSON
    #[arg(long)]
    pub json: bool,

    /// After the commands, deliver breakpoint hits for N seconds (0 = don't)
    #[arg(long, value_name = "SECS", default_value = "0")]
    pub watch: u64,

    /// Start in blacklist mode
    #[arg(long)]
    pub blacklist: bool,

    /// Install a name filter at startup (repeatable)
    #[arg(long = "filter-name", value_name = "NAME")]
    pub filter_names: Vec<String>,

    /// Install a pid filter at startup (repeatable)
    #[arg(long = "filter-pid", value_name = "PID")]
    pub filter_pids: Vec<i32>,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Startup settings described by the flags
    ///
    /// # Errors
    /// `InvalidArgument` for a non-positive pid, an empty name or too many filters
    pub fn settings(&self) -> Result<EngineSettings, EngineError> {
        let mut filters = Vec::new();
        for pid in &self.filter_pids {
            if *pid <= 0 {
                return Err(EngineError::InvalidArgument(format!("Invalid PID: {pid}")));
            }
            filters.push(FilterEntry::pid(Pid(*pid)));
        }
        for name in &self.filter_names {
            if name.is_empty() {
                return Err(EngineError::InvalidArgument("Filter name is empty".to_string()));
            }
            filters.push(FilterEntry::name(name));
        }

        let settings = EngineSettings {
            filter_mode: if self.blacklist { FilterMode::Blacklist } else { FilterMode::Whitelist },
            filters,
            ..EngineSettings::default()
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Nothing to do: no commands, no stdin and no watch window
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && !self.stdin && self.watch == 0
    }
}
