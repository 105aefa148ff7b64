//! FluxLite CLI
//!
//! Live force-plate stream conditioning and offline gain analysis.

use anyhow::Context;
use clap::{Parser, Subcommand};
use crossbeam_channel::Receiver;
use fluxlite_core::{
    core::{replay_lines_draining, Pipeline, PipelineEvent},
    gain::{ArchivedOutputs, CoefSweep, GainRunConfig, GainRunner, OutputProvider},
    telemetry::{create_shared_stats, create_shared_stats_with_persistence, SharedStats, Stats},
    transport::{EventSink, NullSink, TransportSession},
    Config, VERSION,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Inbound queue depth between the transport and the pipeline.
const INBOUND_CAPACITY: usize = 10_000;

#[derive(Parser)]
#[command(name = "fluxlite")]
#[command(version = VERSION)]
#[command(about = "Force-plate stream conditioning and gain analysis", long_about = None)]
struct Cli {
    /// Config file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the backend and condition the live stream
    Live {
        /// Backend host
        #[arg(long)]
        host: Option<String>,

        /// Backend port
        #[arg(long)]
        port: Option<u16>,

        /// EWMA decay factor in (0, 1]
        #[arg(long)]
        alpha: Option<f64>,

        /// Frames kept per virtual device
        #[arg(long)]
        cache_size: Option<usize>,

        /// Log every conditioned sample at info level
        #[arg(long)]
        samples: bool,
    },

    /// Sweep temperature coefficients over archived sessions
    Gain {
        /// Root directory of archived discrete temperature sessions
        #[arg(long)]
        data_root: PathBuf,

        /// Output directory for gain_rows.csv and gain_summary.csv
        #[arg(long, default_value = "gain_analysis_output")]
        out_dir: PathBuf,

        /// Directory of pre-processed outputs (defaults to the data root)
        #[arg(long)]
        processed_dir: Option<PathBuf>,

        /// Process archives through the backend's HTTP endpoint
        #[arg(long)]
        backend: bool,

        /// Cache for backend outputs (defaults under out-dir)
        #[arg(long)]
        cache_dir: Option<PathBuf>,

        /// Backend host for --backend
        #[arg(long)]
        host: Option<String>,

        /// Backend HTTP port for --backend
        #[arg(long)]
        port: Option<u16>,

        /// Room temperature baseline (F)
        #[arg(long)]
        room_temp_f: Option<f64>,

        /// Coefficient sweep, `start:stop:step` or a comma list
        #[arg(long)]
        coef_sweep: Option<String>,

        /// Minimum |inputChangePct| (percent) for a row to count
        #[arg(long)]
        epsilon_pct: Option<f64>,

        /// Worker threads (0 = available parallelism)
        #[arg(long)]
        workers: Option<usize>,

        /// Only process the first N archives (0 = all)
        #[arg(long)]
        limit_files: Option<usize>,
    },

    /// Replay a recorded envelope log through the pipeline
    Replay {
        /// Newline-delimited `{"event", "data"}` file
        path: PathBuf,
    },

    /// Show persisted statistics
    Status,

    /// Show configuration
    Config,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(Config::config_path);
    let config = Config::load_from(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    match cli.command {
        Commands::Live {
            host,
            port,
            alpha,
            cache_size,
            samples,
        } => {
            let mut config = config;
            if let Some(host) = host {
                config.connection.host = host;
            }
            if let Some(port) = port {
                config.connection.port = port;
            }
            if let Some(alpha) = alpha {
                config.pipeline.conditioner.alpha = alpha;
            }
            if let Some(cache_size) = cache_size {
                config.pipeline.aggregator.cache_size = cache_size;
            }
            cmd_live(config, samples)
        }
        Commands::Gain {
            data_root,
            out_dir,
            processed_dir,
            backend,
            cache_dir,
            host,
            port,
            room_temp_f,
            coef_sweep,
            epsilon_pct,
            workers,
            limit_files,
        } => {
            let settings = &config.gain;
            let run = GainRunConfig {
                sweep: CoefSweep::parse(coef_sweep.as_deref().unwrap_or(&settings.sweep))?,
                room_temp_f: room_temp_f.unwrap_or(settings.room_temp_f),
                epsilon_pct: epsilon_pct.unwrap_or(settings.epsilon_pct),
                workers: workers.unwrap_or(settings.workers),
                limit_files,
                data_root,
                out_dir,
            };
            let provider: Arc<dyn OutputProvider> = if backend {
                let host = host.unwrap_or_else(|| config.connection.host.clone());
                let port = port.unwrap_or(config.connection.port);
                let cache_dir = cache_dir.unwrap_or_else(|| run.out_dir.join("cache"));
                http_provider(&config, &run, &host, port, cache_dir)?
            } else {
                let processed = processed_dir.unwrap_or_else(|| run.data_root.clone());
                Arc::new(ArchivedOutputs::new(run.data_root.clone(), processed))
            };
            cmd_gain(run, provider)
        }
        Commands::Replay { path } => cmd_replay(config, path),
        Commands::Status => {
            cmd_status(&config);
            Ok(())
        }
        Commands::Config => {
            cmd_config(&config, &config_path)?;
            Ok(())
        }
    }
}

fn cmd_live(config: Config, log_samples: bool) -> anyhow::Result<()> {
    config.validate()?;
    if let Err(e) = config.ensure_directories() {
        warn!("Could not create data directory: {}", e);
    }

    println!("FluxLite v{VERSION}");
    println!("  Backend: {}", config.connection.address());
    println!("  Cache size: {} frames", config.pipeline.aggregator.cache_size);
    println!("  EWMA alpha: {}", config.pipeline.conditioner.alpha);
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let stats = create_shared_stats_with_persistence(config.stats_path());
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting async runtime")?;

    let (inbound_tx, inbound_rx) = crossbeam_channel::bounded(INBOUND_CAPACITY);
    let session = {
        let _guard = runtime.enter();
        Arc::new(TransportSession::connect(&config.connection, inbound_tx))
    };

    let sink: Arc<dyn EventSink> = session.clone();
    let (mut pipeline, events) = Pipeline::new(config.pipeline.clone(), sink, stats.clone())?;

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("setting Ctrl+C handler")?;

    let observer = spawn_observer(events, log_samples)?;
    let flusher = spawn_stats_flusher(stats.clone(), running.clone(), config.stats_flush_interval)?;

    let handled = pipeline.run(&inbound_rx, &running);
    running.store(false, Ordering::SeqCst);

    runtime.block_on(session.shutdown());
    drop(pipeline);
    let _ = observer.join();
    let _ = flusher.join();

    if let Err(e) = stats.save() {
        warn!("Could not save stats: {}", e);
    }
    println!();
    println!("Handled {handled} events");
    println!("{}", stats.summary());
    Ok(())
}

/// Log observer events on a background thread until the pipeline is dropped.
fn spawn_observer(
    events: Receiver<PipelineEvent>,
    log_samples: bool,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("observer".to_string())
        .spawn(move || {
            for event in events.iter() {
                match event {
                    PipelineEvent::Sample(sample) => {
                        let line = format!(
                            "{} {} fz={:.1}N cop={:?} r={:.1}px",
                            sample.group_id,
                            sample.role,
                            sample.sample.fz_n,
                            sample.sample.cop_mm,
                            sample.sample.radius_px
                        );
                        if log_samples {
                            info!("{}", line);
                        } else {
                            debug!("{}", line);
                        }
                    }
                    PipelineEvent::Connection(state) => info!("Connection: {:?}", state),
                    PipelineEvent::DynamoConfig(dynamo) => info!(
                        "Dynamo config: sampling {} Hz, emission {} Hz",
                        dynamo.sampling_rate, dynamo.emission_rate
                    ),
                    PipelineEvent::Capture(t) => info!(
                        "Capture {} ({}): {:?} -> {:?}",
                        t.group_id, t.capture_type, t.from, t.to
                    ),
                    PipelineEvent::Groups { groups, removed } => {
                        info!("Groups: {} known, {} removed", groups.len(), removed.len())
                    }
                    PipelineEvent::Model(kind, payload) => info!("Model {:?}: {}", kind, payload),
                    PipelineEvent::Battery(payload) => debug!("Battery: {}", payload),
                    PipelineEvent::BackendError(payload) => warn!("Backend error: {}", payload),
                }
            }
        })
}

/// Persist stats every `interval` while `running` is set.
fn spawn_stats_flusher(
    stats: SharedStats,
    running: Arc<AtomicBool>,
    interval: Duration,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("stats-flush".to_string())
        .spawn(move || {
            let mut last = Instant::now();
            while running.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(100));
                if last.elapsed() >= interval {
                    if let Err(e) = stats.save() {
                        warn!("Could not save stats: {}", e);
                    }
                    last = Instant::now();
                }
            }
        })
}

#[cfg(feature = "http-backend")]
fn http_provider(
    config: &Config,
    run: &GainRunConfig,
    host: &str,
    port: u16,
    cache_dir: PathBuf,
) -> anyhow::Result<Arc<dyn OutputProvider>> {
    let backend = fluxlite_core::gain::HttpBackend::new(
        host,
        port,
        run.room_temp_f,
        run.data_root.clone(),
        cache_dir,
        config.gain.backend_timeout,
    )?;
    info!("Using backend {}", backend.url());
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "http-backend"))]
fn http_provider(
    _config: &Config,
    _run: &GainRunConfig,
    _host: &str,
    _port: u16,
    _cache_dir: PathBuf,
) -> anyhow::Result<Arc<dyn OutputProvider>> {
    anyhow::bail!("--backend requires the http-backend feature")
}

fn cmd_gain(run: GainRunConfig, provider: Arc<dyn OutputProvider>) -> anyhow::Result<()> {
    println!("Gain analysis");
    println!("  Data root: {}", run.data_root.display());
    println!("  Coefficients: {:?}", run.sweep.values());
    println!("  Room temperature: {} F", run.room_temp_f);
    println!();

    let stats = create_shared_stats();
    let result = GainRunner::new(run, provider, stats.clone()).run()?;

    println!(
        "Processed {} files ({} skipped)",
        result.files_processed, result.files_skipped
    );
    println!(
        "Rows: {} valid, {} degenerate input, {} missing output",
        result.totals.valid, result.totals.degenerate_input, result.totals.missing_output
    );
    println!("Summary groups: {}", result.summary.len());
    println!("Wrote {}", result.reports.rows.display());
    println!("Wrote {}", result.reports.summary.display());
    if result.totals.valid == 0 {
        warn!("No valid gain rows; check processed outputs and epsilon");
    }
    Ok(())
}

fn cmd_replay(config: Config, path: PathBuf) -> anyhow::Result<()> {
    let content =
        std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    let stats = create_shared_stats();
    let (mut pipeline, events) = Pipeline::new(config.pipeline, Arc::new(NullSink), stats.clone())?;

    let mut samples = 0u64;
    let handled = replay_lines_draining(&mut pipeline, &events, content.lines(), |event| match event {
        PipelineEvent::Sample(_) => samples += 1,
        other => debug!("{:?}", other),
    });

    println!("Replayed {handled} events, {samples} samples");
    println!("{}", stats.summary());
    Ok(())
}

fn cmd_status(config: &Config) {
    let path = config.stats_path();
    if !path.exists() {
        println!("No previous session data found.");
        return;
    }
    let stats = Stats::with_persistence(path);
    println!("{}", stats.summary());
}

fn cmd_config(config: &Config, path: &std::path::Path) -> anyhow::Result<()> {
    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {}", path.display());
    println!();
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
