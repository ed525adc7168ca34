use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Instant;

use tilewright::config::Config;
use tilewright::stats::{JsonSummaryWriter, StatisticsWriter};
use tilewright::tiles::TileGrid;
use tilewright::transform::BuiltinTransform;
use tilewright::{emit, graph, ingest, transit, validate};

#[derive(Parser)]
#[command(name = "tilewright")]
#[command(about = "Compile OSM extracts and transit schedules into routing graph tiles", long_about = None)]
struct Cli {
    /// Build configuration JSON
    #[arg(short, long)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline: ingest, splice, tile, emit, validate, transit
    Build {
        /// Input PBF extract
        input: PathBuf,
    },
    /// Re-run validation over an existing tile set
    Validate,
    /// Re-run transit splicing over an existing tile set
    Transit,
}

fn run_validation(config: &Config, grid: &TileGrid, level: u8) -> Result<()> {
    println!("\nValidating tiles...");
    let start = Instant::now();
    let stats = validate::validate_tiles(config.tile_dir(), grid, level, config.concurrency())?;

    let tasks_path = config.tile_dir().join("defect_tasks.json");
    stats.roulette_data.write_tasks(&tasks_path)?;
    println!("  ✓ wrote {}", tasks_path.display());

    if let Some(db_path) = &config.mjolnir.statistics {
        let mut writer = JsonSummaryWriter::new(db_path);
        writer.write(&stats)?;
        println!("  ✓ wrote statistics summary next to {}", db_path.display());
    }
    println!("Validation took {:.2}s", start.elapsed().as_secs_f64());
    Ok(())
}

fn run_transit(config: &Config, grid: &TileGrid, level: u8) -> Result<()> {
    println!("\nSplicing transit...");
    let start = Instant::now();
    let anchor = Utc::now().date_naive();
    transit::build_transit(config, grid, level, anchor)?;
    println!("Transit took {:.2}s", start.elapsed().as_secs_f64());
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let config = Config::from_file(&cli.config)?;
    let level_config = config.local_level();
    let grid = TileGrid::new(level_config.tiles.size);
    let level = level_config.level;

    match cli.command {
        Commands::Build { input } => {
            let total = Instant::now();

            println!("Ingesting {}...", input.display());
            let start = Instant::now();
            let mut transform = BuiltinTransform::from_config(config.tagtransform.as_ref());
            let graph_input = ingest::run_ingest(&input, &config, &mut transform)?;
            println!("Ingest took {:.2}s", start.elapsed().as_secs_f64());

            println!("\nConstructing edges...");
            let start = Instant::now();
            let ingest::GraphInput {
                ways,
                mut nodes,
                strings,
                intersections,
                estimated_edges,
            } = graph_input;
            let edges = graph::construct_edges(&ways, &mut nodes, &intersections, estimated_edges);
            println!("  ✓ {} edges", edges.len());
            // The splicer was the last consumer of the presence bitsets.
            drop(intersections);

            graph::sort_edges_from_nodes(&mut nodes, &edges);
            println!("  ✓ edges sorted");

            let tiled = graph::tile_nodes(&mut nodes, &grid, level);
            println!("  ✓ {} occupied tiles", tiled.len());
            println!("Graph construction took {:.2}s", start.elapsed().as_secs_f64());

            println!("\nEmitting tiles...");
            let start = Instant::now();
            let bytes = emit::build_local_tiles(
                config.tile_dir(),
                &grid,
                level,
                &ways,
                &nodes,
                &edges,
                &tiled,
                &strings,
                config.concurrency(),
            )?;
            println!("  ✓ {} bytes written", bytes);
            println!("Emission took {:.2}s", start.elapsed().as_secs_f64());

            run_validation(&config, &grid, level)?;
            run_transit(&config, &grid, level)?;

            println!("\n✅ Build complete in {:.2}s", total.elapsed().as_secs_f64());
        }
        Commands::Validate => {
            run_validation(&config, &grid, level)?;
        }
        Commands::Transit => {
            run_transit(&config, &grid, level)?;
        }
    }

    Ok(())
}
