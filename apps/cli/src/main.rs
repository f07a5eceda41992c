//! MeshHarvest CLI — grid-driven 3D building model harvester.
//!
//! Crawls a map listing service over a GeoJSON grid, downloads the
//! referenced OBJ models and textures, and converts them via Blender.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
