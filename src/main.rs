//! Focus Sentinel CLI
//!
//! Camera and screen focus sensor with distraction alerts.

use anyhow::Context;
use clap::{Parser, Subcommand};
use crossbeam_channel::RecvTimeoutError;
use focus_sentinel::{
    capture::{CommandCapture, FileCapture, ImageCapture},
    config::Config,
    sinks::{ChannelNotifier, EventSink, JsonlEventSink, NullEventSink},
    transparency::{create_shared_log_with_persistence, PersistedStats},
    Classifier, FocusPipeline, LabelTaxonomy, Notification, PRIVACY_DECLARATION, VERSION,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "focus-sentinel")]
#[command(version = VERSION)]
#[command(about = "Camera and screen focus sensor with distraction alerts", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a focus tracking session
    Start {
        /// Command whose stdout is one camera image (e.g. an ffmpeg invocation)
        #[arg(long, conflicts_with = "camera_file")]
        camera_cmd: Option<String>,

        /// Image file re-read on every tick as the camera image
        #[arg(long)]
        camera_file: Option<PathBuf>,

        /// Command whose stdout is one screenshot
        #[arg(long, conflicts_with = "screen_file")]
        screen_cmd: Option<String>,

        /// Image file re-read on every tick as the screenshot
        #[arg(long)]
        screen_file: Option<PathBuf>,

        /// Classifier endpoint URL (overrides config)
        #[arg(long)]
        endpoint: Option<String>,

        /// Classifier bearer token (overrides config)
        #[arg(long)]
        token: Option<String>,

        /// Capture interval in seconds (overrides config)
        #[arg(long)]
        interval: Option<u64>,

        /// JSON label taxonomy to use instead of the built-in one
        #[arg(long)]
        taxonomy: Option<PathBuf>,
    },

    /// Pause capturing
    Pause,

    /// Resume capturing
    Resume,

    /// Show current status and cumulative statistics
    Status,

    /// Display privacy declaration
    Privacy,

    /// Show configuration
    Config,

    /// Print a label taxonomy as JSON
    Taxonomy {
        /// Validate and print this taxonomy file instead of the built-in one
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

fn main() {
    init_tracing();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Start {
            camera_cmd,
            camera_file,
            screen_cmd,
            screen_file,
            endpoint,
            token,
            interval,
            taxonomy,
        } => cmd_start(StartArgs {
            camera_cmd,
            camera_file,
            screen_cmd,
            screen_file,
            endpoint,
            token,
            interval,
            taxonomy,
        }),
        Commands::Pause => cmd_pause(),
        Commands::Resume => cmd_resume(),
        Commands::Status => {
            cmd_status();
            Ok(())
        }
        Commands::Privacy => {
            cmd_privacy();
            Ok(())
        }
        Commands::Config => cmd_config(),
        Commands::Taxonomy { file } => cmd_taxonomy(file),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("focus_sentinel=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

struct StartArgs {
    camera_cmd: Option<String>,
    camera_file: Option<PathBuf>,
    screen_cmd: Option<String>,
    screen_file: Option<PathBuf>,
    endpoint: Option<String>,
    token: Option<String>,
    interval: Option<u64>,
    taxonomy: Option<PathBuf>,
}

fn cmd_start(args: StartArgs) -> anyhow::Result<()> {
    println!("Focus Sentinel v{VERSION}");
    println!();

    // Load or create configuration
    let mut config = Config::load().unwrap_or_else(|e| {
        eprintln!("Warning: Could not load config ({e}), using defaults");
        Config::default()
    });
    if let Some(secs) = args.interval {
        config.scheduler.interval = Duration::from_secs(secs);
    }
    if args.endpoint.is_some() {
        config.classifier.endpoint = args.endpoint;
    }
    if args.token.is_some() {
        config.classifier.token = args.token;
    }
    if let Err(e) = config.ensure_directories() {
        eprintln!("Warning: Could not create directories: {e}");
    }

    // The taxonomy is fixed for the whole session.
    let taxonomy = match &args.taxonomy {
        Some(path) => LabelTaxonomy::from_json_file(path)
            .with_context(|| format!("Could not load taxonomy from {path:?}"))?,
        None => LabelTaxonomy::default(),
    };

    let camera = build_capture("camera", args.camera_cmd, args.camera_file)?
        .context("No camera source: pass --camera-cmd or --camera-file")?;
    let screen = build_capture("screen", args.screen_cmd, args.screen_file)?;

    let classifier = build_classifier(&config)?;

    let events: Arc<dyn EventSink> = match JsonlEventSink::for_session(&config.export_path) {
        Ok(sink) => {
            println!("  Event log: {:?}", sink.path());
            Arc::new(sink)
        }
        Err(e) => {
            eprintln!("Warning: Could not open event log: {e}");
            Arc::new(NullEventSink)
        }
    };

    println!("  Camera: {}", camera.name());
    println!(
        "  Screen: {}",
        match &screen {
            Some(s) if config.scheduler.screen_capture => s.name().to_string(),
            _ => "disabled".to_string(),
        }
    );
    println!("  Interval: {}s", config.scheduler.effective_interval().as_secs());
    println!(
        "  Voting window: {} samples over at least {} min",
        config.voting.window_size, config.voting.min_span_minutes
    );
    println!("  Labels: {}", taxonomy.len());
    println!();

    // Set up transparency log
    let transparency_log =
        create_shared_log_with_persistence(config.data_path.join("transparency.json"));

    let (notifier, notifications) = ChannelNotifier::new(64);
    let mut paused = config.paused;

    let mut pipeline = FocusPipeline::new(
        config,
        taxonomy,
        camera,
        screen,
        classifier,
        events,
        Arc::new(notifier),
        transparency_log.clone(),
    )?;
    pipeline.start().context("Could not start focus tracking")?;

    if paused {
        println!("Capturing is currently paused.");
        println!("Run `focus-sentinel resume` to start capturing.");
        println!();
    }
    println!("Press Ctrl+C to stop");
    println!();

    // Set up Ctrl+C handler
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("Error setting Ctrl+C handler")?;

    let mut last_config_check = Instant::now();

    while running.load(Ordering::SeqCst) {
        // Periodically reload config so `focus-sentinel pause/resume` can control a running agent.
        if last_config_check.elapsed() >= Duration::from_secs(1) {
            if let Ok(cfg) = Config::load() {
                if cfg.paused != paused {
                    paused = cfg.paused;
                    println!();
                    if paused {
                        println!("Pausing capture...");
                        pipeline.pause();
                    } else {
                        println!("Resuming capture...");
                        pipeline.resume();
                    }
                }
            }
            last_config_check = Instant::now();
        }

        match notifications.recv_timeout(Duration::from_millis(100)) {
            Ok(notification) => print_notification(&notification),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    println!();
    println!("Stopping focus tracking...");
    pipeline.stop()?;

    // The final episode, if any, is reported during stop.
    for notification in notifications.try_iter() {
        print_notification(&notification);
    }

    // Save transparency log
    if let Err(e) = transparency_log.save() {
        eprintln!("Warning: Could not save transparency log: {e}");
    }

    // Final stats
    println!();
    println!("{}", transparency_log.summary());
    Ok(())
}

fn print_notification(notification: &Notification) {
    println!(
        "[{}] {}: {}",
        notification.at.with_timezone(&chrono::Local).format("%H:%M:%S"),
        notification.title,
        notification.message
    );
}

fn build_capture(
    kind: &str,
    cmd: Option<String>,
    file: Option<PathBuf>,
) -> anyhow::Result<Option<Box<dyn ImageCapture>>> {
    if let Some(line) = cmd {
        let capture = CommandCapture::from_command_line(&line)
            .with_context(|| format!("Empty {kind} capture command"))?;
        return Ok(Some(Box::new(capture)));
    }
    Ok(file.map(|path| Box::new(FileCapture::new(path)) as Box<dyn ImageCapture>))
}

#[cfg(feature = "http")]
fn build_classifier(config: &Config) -> anyhow::Result<Arc<dyn Classifier>> {
    use focus_sentinel::classifier::{HttpClassifier, HttpClassifierConfig};

    let endpoint = config
        .classifier
        .endpoint
        .clone()
        .context("No classifier endpoint: pass --endpoint or set classifier.endpoint in config")?;

    let classifier = HttpClassifier::new(HttpClassifierConfig::new(
        endpoint.clone(),
        config.classifier.token.clone(),
        config.workers.request_timeout,
    ))?;
    println!("  Classifier: {endpoint}");
    println!("  Device ID: {}", classifier.device_id());
    Ok(Arc::new(classifier))
}

#[cfg(not(feature = "http"))]
fn build_classifier(_config: &Config) -> anyhow::Result<Arc<dyn Classifier>> {
    anyhow::bail!("No classifier available: rebuild with the `http` feature")
}

fn cmd_pause() -> anyhow::Result<()> {
    let mut config = Config::load().unwrap_or_default();
    config.paused = true;
    config.save().context("Error saving config")?;
    println!("Capturing paused. Use 'focus-sentinel resume' to continue.");
    Ok(())
}

fn cmd_resume() -> anyhow::Result<()> {
    let mut config = Config::load().unwrap_or_default();
    config.paused = false;
    config.save().context("Error saving config")?;
    println!("Capturing resumed.");
    Ok(())
}

fn cmd_status() {
    let config = Config::load().unwrap_or_default();

    println!("Focus Sentinel Status");
    println!("=====================");
    println!();

    // Show config
    println!("Configuration:");
    println!(
        "  Classifier: {}",
        config
            .classifier
            .endpoint
            .as_deref()
            .unwrap_or("not configured")
    );
    println!(
        "  Screen capture: {}",
        if config.scheduler.screen_capture {
            "enabled"
        } else {
            "disabled"
        }
    );
    println!(
        "  Interval: {}s",
        config.scheduler.effective_interval().as_secs()
    );
    println!("  Paused: {}", config.paused);
    println!();

    // Load and show transparency stats if available
    let stats_path = config.data_path.join("transparency.json");
    let persisted = std::fs::read_to_string(&stats_path)
        .ok()
        .and_then(|content| serde_json::from_str::<PersistedStats>(&content).ok());

    match persisted {
        Some(persisted) => {
            let stats = persisted.stats;
            println!("Cumulative Statistics:");
            println!("  Capture ticks: {}", stats.ticks);
            println!("  Capture failures: {}", stats.capture_failures);
            println!("  Images classified: {}", stats.classifications_ok);
            println!("  Classification failures: {}", stats.classification_failures);
            println!("  State transitions: {}", stats.transitions);
            println!("  Confirmed distractions: {}", stats.confirmed_events);
            println!("  Micro-break suggestions: {}", stats.overload_suggestions);
            println!(
                "  Last updated: {}",
                persisted.last_updated.format("%Y-%m-%d %H:%M:%S UTC")
            );
        }
        None => println!("No previous session data found."),
    }
}

fn cmd_privacy() {
    println!("{PRIVACY_DECLARATION}");
}

fn cmd_config() -> anyhow::Result<()> {
    let config = Config::load().unwrap_or_default();

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn cmd_taxonomy(file: Option<PathBuf>) -> anyhow::Result<()> {
    let taxonomy = match file {
        Some(path) => LabelTaxonomy::from_json_file(&path)
            .with_context(|| format!("Invalid taxonomy {path:?}"))?,
        None => LabelTaxonomy::default(),
    };
    println!("{}", serde_json::to_string_pretty(&taxonomy)?);
    Ok(())
}
