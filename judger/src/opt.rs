use clap::{Parser, Subcommand};
use std::{net::SocketAddr, path::PathBuf};

#[derive(Parser, Debug, Clone)]
#[clap(name = "codejudge", version)]
pub struct Opts {
    #[clap(subcommand)]
    pub cmd: SubCmd,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCmd {
    /// Run as a long-running worker polling a remote queue
    #[clap(name = "work")]
    Work(WorkSubCmd),

    /// Own the submission queue and serve the internal API
    #[clap(name = "serve")]
    Serve(ServeSubCmd),

    /// Judge a single source file in local environment
    #[clap(name = "run")]
    Run(RunSubCmd),
}

#[derive(Parser, Debug, Clone)]
pub struct WorkSubCmd {
    /// The queue owner's host (include port if needed)
    #[clap(required = true)]
    pub host: String,

    /// Worker configuration file
    #[clap(long, short)]
    pub config: Option<PathBuf>,

    /// Access token
    #[clap(long, short)]
    pub token: Option<String>,

    /// Path of cache folder, defaults to ~/.codejudge/
    #[clap(long = "cache-folder", value_name = "path")]
    pub cache_folder: Option<PathBuf>,

    /// Number of submissions judged at the same time
    #[clap(long, short = 'n')]
    pub concurrency: Option<usize>,

    /// Connect with https
    #[clap(long)]
    pub ssl: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct ServeSubCmd {
    /// Server configuration file
    #[clap(long, short)]
    pub config: Option<PathBuf>,

    /// Address to listen on
    #[clap(long)]
    pub bind: Option<SocketAddr>,

    /// Token workers must present
    #[clap(long, short)]
    pub token: Option<String>,

    /// JSON file with initial problems and submissions
    #[clap(long)]
    pub seed: Option<PathBuf>,

    /// Number of worker tasks to run inside this process
    #[clap(long, short = 'n')]
    pub workers: Option<usize>,

    /// Configuration file of the in-process workers
    #[clap(long = "worker-config", value_name = "path")]
    pub worker_config: Option<PathBuf>,

    /// Accept requests from any network
    #[clap(long = "allow-any-network")]
    pub allow_any_network: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct RunSubCmd {
    /// The source file to judge
    #[clap(value_name = "source")]
    pub source: PathBuf,

    /// JSON file describing the problem
    #[clap(long, short)]
    pub problem: PathBuf,

    /// Worker configuration file, for sandbox settings
    #[clap(long, short)]
    pub config: Option<PathBuf>,
}
