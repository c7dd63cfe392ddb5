use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "stashd",
    about = "Replicating HTTP file store for opaque blobs grouped into drawers"
)]
pub struct Config {
    /// Listen address.
    #[arg(long, default_value = "localhost:8080")]
    pub listen: String,

    /// Path to the database file.
    #[arg(long, default_value = "./data.db")]
    pub datafile: PathBuf,

    /// User name for operations requiring authentication.
    #[arg(long, default_value = "admin")]
    pub user: String,

    /// Password for operations requiring authentication.
    /// Can also be set via STASHD_PASS.
    #[arg(long, env = "STASHD_PASS", default_value = "")]
    pub pass: String,

    /// Front-facing URL for file delivery, e.g. http://localhost:8080.
    #[arg(long)]
    pub frontend: Option<String>,

    /// Parent server URL to replicate from, e.g. http://otherserver:8080.
    #[arg(long)]
    pub parent: Option<String>,

    /// Accept uploads and deletions even though this instance replicates
    /// from a parent server.
    #[arg(long)]
    pub forceparent: bool,
}
