use crate::{
    validate_flipbook_url, ClusterManager, Config, StopMode, StructuredEvent,
};
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const PRINTER_FLUSH: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "flipbook-capture")]
#[command(about = "Capture online flipbooks page by page with headless Chrome")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, help = "Configuration file path (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Documents processed at the same time")]
    pub concurrency: Option<usize>,

    #[arg(long, help = "Downloads root; books land in <output>/<namespace>/book")]
    pub output: Option<PathBuf>,

    #[arg(long, help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, help = "Settle delay before each page capture, in milliseconds")]
    pub settle_ms: Option<u64>,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, help = "Print every outcome event as one JSON line on stdout")]
    pub events_json: bool,

    #[arg(long, help = "Serve Prometheus metrics on this address")]
    pub metrics_addr: Option<SocketAddr>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Capture the given documents, then exit
    Capture {
        #[arg(short, long = "url", required = true, help = "Document URL (repeatable)")]
        urls: Vec<String>,
    },

    /// Capture every document listed in a file
    Batch {
        #[arg(short, long, help = "Input file containing URLs (one per line)")]
        input: PathBuf,
    },

    /// Read URLs from stdin until EOF; `stop` drains the queue, `stop!` cancels it
    Watch,

    /// Validate configuration
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },
}

/// Fold command-line overrides into `config`.
pub fn apply_overrides(config: &mut Config, args: &Cli) {
    if let Some(concurrency) = args.concurrency {
        config.concurrency_limit = concurrency;
    }
    if let Some(output) = &args.output {
        config.downloads_root = Some(output.clone());
    }
    if let Some(chrome_path) = &args.chrome_path {
        config.chrome_path = Some(chrome_path.clone());
    }
    if let Some(settle_ms) = args.settle_ms {
        config.settle_delay = Duration::from_millis(settle_ms);
    }
}

pub async fn read_config_file(path: &Path) -> anyhow::Result<Config> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let config: Config = serde_json::from_str(&content)
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(config)
}

pub struct CliRunner {
    pub config: Config,
    pub cluster: Arc<ClusterManager>,
    events_json: bool,
    interrupted: CancellationToken,
}

impl CliRunner {
    pub fn new(config: Config, args: &Cli) -> anyhow::Result<Self> {
        let cluster = Arc::new(ClusterManager::with_chrome(config.clone())?);
        Ok(Self::with_cluster(config, cluster, args.events_json))
    }

    pub fn with_cluster(config: Config, cluster: Arc<ClusterManager>, events_json: bool) -> Self {
        Self {
            config,
            cluster,
            events_json,
            interrupted: CancellationToken::new(),
        }
    }

    pub async fn run(&self, command: Commands) -> anyhow::Result<()> {
        match command {
            Commands::Capture { urls } => self.run_capture(urls).await,
            Commands::Batch { input } => self.run_batch(&input).await,
            Commands::Watch => self.run_watch().await,
            Commands::Validate { config } => self.validate_config(&config).await,
        }
    }

    /// Cancel everything in flight; the running command then winds down.
    pub fn interrupt(&self) {
        self.interrupted.cancel();
        self.cluster.cancel_all();
    }

    pub async fn run_capture(&self, urls: Vec<String>) -> anyhow::Result<()> {
        self.cluster.start().await?;
        let accepted = self.submit_all(urls);
        info!("Queued {} documents", accepted);

        self.cluster.stop(StopMode::Graceful).await;
        self.print_summary();
        Ok(())
    }

    pub async fn run_batch(&self, input: &Path) -> anyhow::Result<()> {
        let urls = self.read_urls_from_file(input).await?;
        info!("Loaded {} URLs from {}", urls.len(), input.display());
        if urls.is_empty() {
            bail!("no URLs found in {}", input.display());
        }

        self.run_capture(urls).await
    }

    pub async fn run_watch(&self) -> anyhow::Result<()> {
        self.cluster.start().await?;
        info!("Reading document URLs from stdin");

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mode = loop {
            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = self.interrupted.cancelled() => break StopMode::Immediate,
            };

            match line.as_deref().map(str::trim) {
                None => break StopMode::Graceful,
                Some("") => continue,
                Some("stop") => break StopMode::Graceful,
                Some("stop!") => break StopMode::Immediate,
                Some(url) => {
                    self.submit_one(url);
                }
            }
        };

        self.cluster.stop(mode).await;
        self.print_summary();
        Ok(())
    }

    pub async fn validate_config(&self, config_path: &Path) -> anyhow::Result<()> {
        println!("Validating configuration: {}", config_path.display());

        let config = read_config_file(config_path).await?;
        config.validate()?;

        println!("Configuration is valid:");
        println!("  Concurrency: {}", config.concurrency_limit);
        println!("  Session timeout: {:?}", config.session_timeout);
        println!("  Capture retries: {}", config.max_capture_retries);
        println!("  Task retries: {}", config.task_retry_limit);
        println!("  Settle delay: {:?}", config.settle_delay);
        println!(
            "  Viewport: {}x{} @{}",
            config.viewport.width, config.viewport.height, config.viewport.device_scale_factor
        );
        println!("  Books folder: {}", config.books_root().display());

        Ok(())
    }

    /// Submit every valid URL; invalid ones are logged and skipped.
    pub fn submit_all(&self, urls: Vec<String>) -> usize {
        urls.iter()
            .take_while(|_| !self.interrupted.is_cancelled())
            .filter(|url| self.submit_one(url))
            .count()
    }

    fn submit_one(&self, url: &str) -> bool {
        if let Err(e) = validate_flipbook_url(url, &self.config.url_prefix) {
            error!("Rejected {}: {}", url, e);
            return false;
        }
        match self.cluster.submit(url) {
            Ok(_) => true,
            Err(e) => {
                error!("Could not queue {}: {}", url, e);
                false
            }
        }
    }

    pub async fn read_urls_from_file(&self, path: &Path) -> anyhow::Result<Vec<String>> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Ok(parse_url_list(&content))
    }

    /// Forward outcome events to stdout as JSON lines, if requested.
    pub fn spawn_event_printer(&self) -> Option<JoinHandle<()>> {
        if !self.events_json {
            return None;
        }

        let mut events = self.cluster.subscribe();
        Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => print_event(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Event printer fell behind, skipped {} events", skipped)
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }))
    }

    /// Release the pool and let the event printer flush what it has buffered.
    /// Returns `false` if the printer had to be cut off.
    pub async fn finish(self, printer: Option<JoinHandle<()>>) -> bool {
        // The channel closes once the last reporter clone is gone.
        drop(self);
        let Some(mut printer) = printer else {
            return true;
        };
        if timeout(PRINTER_FLUSH, &mut printer).await.is_ok() {
            return true;
        }
        warn!("Event printer did not finish, dropping remaining events");
        printer.abort();
        false
    }

    pub fn print_summary(&self) {
        let snapshot = self.cluster.metrics().snapshot();
        let stats = self.cluster.stats();

        println!("Capture summary:");
        println!("  Documents completed: {}", snapshot.documents_completed);
        println!("  Documents unsupported: {}", snapshot.documents_unsupported);
        println!("  Documents failed: {}", snapshot.documents_failed);
        println!("  Pages captured: {}", snapshot.pages_captured);
        println!("  Pages abandoned: {}", snapshot.pages_abandoned);
        println!("  Capture retries: {}", snapshot.capture_retries);
        println!("  Task retries: {}", snapshot.task_retries);
        println!("  Peak concurrency: {}", stats.peak_active);
        println!("  Books folder: {}", self.config.books_root().display());
    }
}

fn print_event(event: &StructuredEvent) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{line}"),
        Err(e) => error!("Could not serialise event {}: {}", event.seq, e),
    }
}

/// One URL per line; blank lines and `#` comments are skipped.
pub fn parse_url_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| line.to_string())
        .collect()
}

pub fn setup_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
