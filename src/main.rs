use anyhow::bail;
use colored::Colorize;
use netbench::{
    aggregate,
    battery::{run_battery, DockerProbeRunner, ModeResult},
    charts,
    clap_args::{self, Commands},
    config::{Config, ModeSpec},
    provision,
    store::{self, ComparisonStore},
};
use std::path::Path;
use term_table::{row::Row, table_cell::TableCell, Table, TableStyle};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = clap_args::parse();

    let default_level = if args.verbose {
        "netbench=debug"
    } else {
        "netbench=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match args.command {
        Commands::Init => {
            Config::write_example_to_file(Path::new("./netbench.toml"))?;
            println!("{}", "netbench.toml created!".green());
            Ok(())
        }
        Commands::Serve { mode } => serve(&args.file, &mode).await,
        Commands::Run { mode } => run(&args.file, &mode).await,
        Commands::Report => report(&args.file),
    }
}

async fn serve(file: &Path, mode: &str) -> anyhow::Result<()> {
    let cfg = Config::try_from_path(file)?;
    let spec = cfg.find_mode(mode)?;
    let docker = provision::connect()?;

    let addr = provision::provision_serve(&docker, &cfg, spec).await?;

    println!("\n{}", " Server ready ".reversed().green());
    println!("mode:           {}", spec.name);
    println!("target address: {}", addr);
    println!(
        "leave this endpoint running and start `netbench run {}` on the client machine",
        spec.name
    );
    Ok(())
}

async fn run(file: &Path, mode: &str) -> anyhow::Result<()> {
    let cfg = Config::try_from_path(file)?;
    let spec = cfg.find_mode(mode)?;
    let docker = provision::connect()?;

    // an interrupt mid-battery skips the store entirely; only the teardown
    // below is guaranteed
    let outcome = tokio::select! {
        res = benchmark_mode(&docker, &cfg, spec) => res,
        _ = tokio::signal::ctrl_c() => Err(anyhow::anyhow!("interrupted, aborting run")),
    };

    provision::teardown(&docker, &cfg).await;

    let result = outcome?;

    let store_path = cfg.experiment.store_path();
    let store = store::save_result(&store_path, &spec.name, result)?;
    info!("saved {} result to {}", spec.name, store_path.display());

    print_summary(&store);

    if store.is_complete(&cfg.experiment.modes) {
        charts::render_all(&store, &cfg)?;
        println!(
            "\n{} comparison complete, charts written to {}",
            "✓".green(),
            cfg.experiment.results_dir.display()
        );
    } else {
        println!(
            "\n{} {} saved; still waiting on modes: {}",
            "✓".green(),
            spec.name,
            store.missing(&cfg.experiment.modes).join(", ")
        );
    }
    Ok(())
}

async fn benchmark_mode(
    docker: &bollard::Docker,
    cfg: &Config,
    spec: &ModeSpec,
) -> anyhow::Result<ModeResult> {
    let endpoint = provision::provision(docker, cfg, spec).await?;
    let runner = DockerProbeRunner::new(cfg.experiment.image.clone(), endpoint.client_env.clone());
    provision::await_ready(&runner, &endpoint.addr, &cfg.timing).await?;
    Ok(run_battery(&runner, &endpoint.addr, &cfg.timing).await)
}

fn report(file: &Path) -> anyhow::Result<()> {
    let cfg = Config::try_from_path(file)?;
    let store = ComparisonStore::load(&cfg.experiment.store_path())?;

    if !store.is_complete(&cfg.experiment.modes) {
        bail!(
            "comparison is incomplete; missing modes: {}",
            store.missing(&cfg.experiment.modes).join(", ")
        );
    }

    print_summary(&store);
    charts::render_all(&store, &cfg)?;
    println!(
        "\n{} charts written to {}",
        "✓".green(),
        cfg.experiment.results_dir.display()
    );
    Ok(())
}

fn print_summary(store: &ComparisonStore) {
    println!("\n{}", " Comparison ".reversed().green());

    let mut table_rows = vec![Row::new(vec![
        TableCell::builder("Mode".bold()).build(),
        TableCell::builder("Runs".bold()).build(),
        TableCell::builder("Avg (Gbps)".bold()).build(),
        TableCell::builder("CPU (%)".bold()).build(),
        TableCell::builder("P99 median (µs)".bold()).build(),
        TableCell::builder("Jitter (ms)".bold()).build(),
        TableCell::builder("Loss (%)".bold()).build(),
        TableCell::builder("Dropped".bold()).build(),
    ])];

    for entry in store.entries() {
        let efficiency = aggregate::efficiency(&entry.result);
        let latency = aggregate::latency_box(&entry.result.latency_samples);

        table_rows.push(Row::new(vec![
            TableCell::new(&entry.mode),
            TableCell::new(entry.result.throughput_runs.len().to_string()),
            TableCell::new(
                efficiency
                    .map(|e| format!("{:.3}", e.throughput_gbps))
                    .unwrap_or("--".to_string()),
            ),
            TableCell::new(
                efficiency
                    .map(|e| format!("{:.1}", e.cpu_percent))
                    .unwrap_or("--".to_string()),
            ),
            TableCell::new(
                latency
                    .map(|l| format!("{:.1}", l.median))
                    .unwrap_or("--".to_string()),
            ),
            TableCell::new(
                entry
                    .result
                    .udp
                    .map(|u| format!("{:.3}", u.jitter_ms))
                    .unwrap_or("--".to_string()),
            ),
            TableCell::new(
                entry
                    .result
                    .udp
                    .map(|u| format!("{:.2}", u.lost_percent))
                    .unwrap_or("--".to_string()),
            ),
            TableCell::new(entry.result.dropped.total().to_string()),
        ]));
    }

    let table = Table::builder()
        .rows(table_rows)
        .style(TableStyle::rounded())
        .build();

    println!("{}", table.render());
}
