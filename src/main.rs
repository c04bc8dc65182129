pub mod cache;
pub mod config;
pub mod counties;
pub mod data;
pub mod error;
pub mod fetch;
pub mod processing;
pub mod render;
pub mod server;
pub mod table;
pub mod types;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use types::CountyLayer;

/// Writes the map and pivot table. A failed fetch still produces an all-grey
/// map and an empty table so the outputs always reflect the latest run.
async fn run_generate(app_config: &config::AppConfig, year: Option<u16>) -> anyhow::Result<()> {
    // 1. Fetch statistics and load geometry; neither depends on the other
    let fetcher = fetch::Fetcher::new(app_config.api.clone())?;
    let (dataset, layer) = tokio::join!(fetcher.fetch(), data::load_layer(&app_config.geometry));
    let dataset = dataset.unwrap_or_else(|e| {
        warn!("Failed to fetch natural growth data: {}; writing outputs without values", e);
        fetch::Dataset::default()
    });
    let layer = layer.unwrap_or_else(|e| {
        warn!("{}; using placeholder county list", e);
        CountyLayer::placeholder()
    });

    let year = year
        .or_else(|| app_config.api.latest_year())
        .or_else(|| processing::available_years(&dataset.observations).last().copied())
        .ok_or_else(|| anyhow!("No year given and none configured"))?;

    // 2. Join
    let values = processing::aggregate_by_county(&dataset.observations, year);
    let joined = processing::join(&layer, &values);

    // 3. Render map and table
    let options = render::RenderOptions::from(&app_config.output).with_title(format!("Loomulik iive {year}"));
    let map = render::render(&joined, &options)?;
    map.save(&app_config.output.map)?;

    let pivot = processing::pivot(&dataset.observations, year, &app_config.api.sexes);
    let table_path = &app_config.output.table;
    if let Some(parent) = table_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(table_path)
        .with_context(|| format!("Failed to create table file: {:?}", table_path))?;
    table::write_pivot_csv(&pivot, &app_config.api, file)?;

    info!(
        "{} counties, {} with data, total natural growth {} in {} ({:?}, labels {})",
        joined.len(),
        joined.iter().filter(|c| c.value.is_some()).count(),
        pivot.grand_total(),
        year,
        map.kind,
        if map.labelled { "drawn" } else { "skipped" }
    );
    Ok(())
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch the statistics, join them to the county map and write the map and table
    Generate {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        /// Year to render; defaults to the latest configured year
        #[arg(short, long)]
        year: Option<u16>,
    },
    /// Serve the interactive dashboard
    Serve {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Generate { config, year } => {
            info!("Generating map with config: {:?}", config);
            let app_config = config::AppConfig::load_or_default(config)?;
            run_generate(&app_config, *year).await?;
            info!("Generation complete!");
        }
        Commands::Serve { config } => {
            info!("Serving dashboard with config: {:?}", config);
            let app_config = config::AppConfig::load_or_default(config)?;
            server::start_server(app_config).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::post, Router};

    const PAYLOAD: &str = "\"Aasta\",\"Maakond\",\"Sugu\",\"Loomulik iive\"\n\
                           2023,39,2,120\n2023,39,3,-30\n2023,37,2,500\n";

    async fn fake_stat_api(status: StatusCode) -> String {
        let app = Router::new().route("/stat", post(move || async move { (status, PAYLOAD) }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/stat")
    }

    async fn config_for(status: StatusCode, name: &str) -> (config::AppConfig, PathBuf) {
        let dir = std::env::temp_dir().join(format!("iive_map_generate_{}_{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);

        let mut app_config = config::AppConfig::default();
        app_config.api.url = fake_stat_api(status).await;
        app_config.geometry.path = None;
        app_config.geometry.urls.clear();
        app_config.output.map = dir.join("out/map.png");
        app_config.output.table = dir.join("out/table.csv");
        app_config.output.width = 300;
        app_config.output.height = 200;
        (app_config, dir)
    }

    #[tokio::test]
    async fn generate_writes_map_and_pivot() {
        let (app_config, dir) = config_for(StatusCode::OK, "ok").await;

        run_generate(&app_config, Some(2023)).await.unwrap();

        let png = std::fs::read(&app_config.output.map).unwrap();
        assert_eq!(&png[..4], b"\x89PNG");
        assert_eq!(
            std::fs::read_to_string(&app_config.output.table).unwrap(),
            "county,Mehed,Naised,total\nHarju maakond,500,,500\nHiiu maakond,120,-30,90\n"
        );
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn generate_survives_fetch_failure() {
        let (app_config, dir) = config_for(StatusCode::INTERNAL_SERVER_ERROR, "down").await;

        run_generate(&app_config, None).await.unwrap();

        assert!(app_config.output.map.exists());
        assert_eq!(
            std::fs::read_to_string(&app_config.output.table).unwrap(),
            "county,total\n"
        );
        std::fs::remove_dir_all(dir).unwrap();
    }
}
