//! CLI argument parsing

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "strix")]
#[command(author, version, about = "Autonomous security-testing agent runtime")]
pub struct Args {
    /// Target path, URL, git repository, or IP address
    #[arg(long)]
    pub target: String,

    /// Scan depth (quick, standard, deep)
    #[arg(long, default_value = "standard")]
    pub scan_mode: String,

    /// Unattended mode: fail agents on fatal model errors instead of
    /// pausing them for operator input
    #[arg(short = 'n', long)]
    pub non_interactive: bool,

    /// Name for the run directory under strix_runs/
    #[arg(long)]
    pub run_name: Option<String>,

    /// Knowledge modules to attach to the root agent (comma-separated, max 5)
    #[arg(long)]
    pub modules: Option<String>,
}

impl Args {
    pub fn parse_modules(&self) -> Vec<String> {
        self.modules
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}
