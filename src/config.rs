use clap::Parser;

/// How upstream pipeline stages are scheduled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StageScheduling {
    /// Every stage runs at once; the orchestrator only waits for exec to succeed.
    #[default]
    Concurrent,
    /// Each upstream stage must exit before the next one starts. Output larger
    /// than the pipe buffer blocks the writer forever.
    Sequential,
}

#[derive(Parser, Debug)]
#[command(name = "pipesh", version, about = "pipesh - pipeline execution shell")]
pub struct Cli {
    /// Run a single line and exit with its status
    #[arg(short = 'c', long = "command", value_name = "LINE")]
    pub command: Option<String>,

    /// Wait for each upstream stage to exit before starting the next
    #[arg(long)]
    pub sequential: bool,

    /// Print debug diagnostics to stderr
    #[arg(short, long, env = "PIPESH_DEBUG")]
    pub debug: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Settings {
    pub scheduling: StageScheduling,
    pub debug: bool,
}

impl From<&Cli> for Settings {
    fn from(cli: &Cli) -> Self {
        Self {
            scheduling: if cli.sequential {
                StageScheduling::Sequential
            } else {
                StageScheduling::Concurrent
            },
            debug: cli.debug,
        }
    }
}
