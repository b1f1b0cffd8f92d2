use bittorrent_cache::create::create_torrent;
use bittorrent_cache::dot_torrent::DotTorrent;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
#[clap(rename_all = "snake_case")]
pub enum Command {
    Download {
        torrent: PathBuf,
    },
    Create {
        path: PathBuf,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bittorrent_cache::logging::init();
    let args = Args::parse();
    match args.command {
        Command::Download { mut torrent } => {
            torrent.set_extension("torrent");
            let dot_torrent = DotTorrent::read(torrent).await?;
            let files = dot_torrent.download_all().await?;
            let output = dot_torrent.info.name;
            tokio::fs::write(output, files.into_iter().next().expect("always one file").bytes()).await?
        }
        Command::Create { path } => {
            create_torrent(path).await?
        }
    }
    Ok(())
}