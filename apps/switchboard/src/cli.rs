use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "switchboard")]
#[command(about = "Agent conversation sync relay")]
pub struct Cli {
    /// Listen port (overrides SWITCHBOARD_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Redis connection URL (overrides REDIS_URL)
    #[arg(long)]
    pub redis_url: Option<String>,
}
