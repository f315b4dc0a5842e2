use clap::Parser;
use flipbook_capture::{
    apply_overrides, install_prometheus_exporter, read_config_file, setup_logging, Cli,
    CliRunner, Config,
};
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let args = Cli::parse();

    setup_logging(args.verbose);

    info!("Starting flipbook-capture v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args).await?;

    if let Some(addr) = args.metrics_addr {
        install_prometheus_exporter(addr)?;
    }

    let runner = CliRunner::new(config, &args)?;
    let printer = runner.spawn_event_printer();

    // Ctrl-C cancels in-flight documents; the command still winds down the pool
    let result = {
        let run = runner.run(args.command);
        tokio::pin!(run);
        tokio::select! {
            result = &mut run => result,
            _ = signal::ctrl_c() => {
                warn!("Received interrupt, cancelling in-flight documents");
                runner.interrupt();
                run.await
            }
        }
    };

    runner.finish(printer).await;

    if let Err(e) = result {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }

    info!("flipbook-capture stopped");
    Ok(())
}

async fn load_config(args: &Cli) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => read_config_file(path).await?,
        None => Config::default(),
    };

    apply_overrides(&mut config, args);
    config.validate()?;

    info!("Configuration loaded successfully");
    info!("Concurrency limit: {}", config.concurrency_limit);
    info!("Settle delay: {:?}", config.settle_delay);
    info!("Books folder: {}", config.books_root().display());

    Ok(config)
}
