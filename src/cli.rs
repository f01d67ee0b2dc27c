use clap::Parser;

#[derive(Parser)]
#[command(name = "marketwatch", about = "2dehands.be listing-monitoring scheduler")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config/default.toml")]
    pub config: String,
}
