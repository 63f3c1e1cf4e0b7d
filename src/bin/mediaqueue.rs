use clap::{Args, Parser, Subcommand};
use mediaqueue_engine::classify::{classify_youtube_url, SourceKind};
use mediaqueue_engine::config::{load_engine_config, save_engine_config, EngineConfig};
use mediaqueue_engine::locate::{tool_status, SystemToolLocator, ToolKind};
use mediaqueue_engine::paths::AppPaths;
use mediaqueue_engine::{
    Engine, EventKind, JobEvent, JobRequest, JobStatus, OutputKind, QueueKind,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mediaqueue")]
#[command(version)]
#[command(about = "Queue YouTube downloads and local media conversions, run them in the background.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// App data directory (bundled tools, config, job logs).
    /// Defaults to $MEDIAQUEUE_BASE_DIR or the platform data directory.
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Enqueue jobs, run both queues and report progress until every job finished.
    Run(RunArgs),
    /// Show where each external tool resolves to.
    Tools,
    /// Print the effective engine config; `--init` writes it to disk.
    Config {
        #[arg(long)]
        init: bool,
    },
}

#[derive(Args)]
struct RunArgs {
    /// YouTube video or playlist URL to download (repeatable).
    #[arg(short = 'd', long = "download")]
    downloads: Vec<String>,

    /// Local media file to convert (repeatable).
    #[arg(short = 'c', long = "convert")]
    conversions: Vec<String>,

    /// Output kind: video (mp4) or audio (mp3).
    #[arg(short = 'f', long, default_value = "video")]
    format: String,

    /// Destination directory.
    #[arg(short = 'o', long, default_value = ".")]
    dest: PathBuf,

    /// Re-encode to the most widely playable codecs.
    #[arg(long)]
    compat: bool,

    /// yt-dlp download rate limit, e.g. 4M.
    #[arg(long)]
    rate_limit: Option<String>,

    /// Print events as JSON lines.
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode, String> {
    let paths = cli.base_dir.or_else(default_base_dir).map(AppPaths::new);
    let mut config = match paths.as_ref() {
        Some(p) => load_engine_config(&p.engine_config_path()).map_err(|e| e.to_string())?,
        None => EngineConfig::default(),
    };
    if let Some(p) = paths.as_ref() {
        config.base_dir = Some(p.base_dir.clone());
    }

    match cli.command {
        Commands::Tools => {
            let locator = SystemToolLocator::new(config.paths(), config.tool_overrides.clone());
            for tool in [ToolKind::YtDlp, ToolKind::Ffmpeg, ToolKind::Ffprobe] {
                let status = tool_status(&locator, tool);
                match (status.path, status.version) {
                    (Some(path), version) => println!(
                        "{tool:8} {} ({})",
                        path.display(),
                        version.as_deref().unwrap_or("version unknown")
                    ),
                    (None, _) => println!("{tool:8} missing"),
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config { init } => {
            let json = serde_json::to_string_pretty(&config).map_err(|e| e.to_string())?;
            println!("{json}");
            if init {
                let p = paths
                    .as_ref()
                    .ok_or_else(|| "could not determine base dir; pass --base-dir".to_string())?;
                save_engine_config(&p.engine_config_path(), &config).map_err(|e| e.to_string())?;
                println!("Wrote {}", p.engine_config_path().display());
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run(args) => run_queues(config, args),
    }
}

fn run_queues(mut config: EngineConfig, args: RunArgs) -> Result<ExitCode, String> {
    if args.downloads.is_empty() && args.conversions.is_empty() {
        return Err("nothing to do; pass --download <url> or --convert <file>".to_string());
    }
    if args.rate_limit.is_some() {
        config.rate_limit = args.rate_limit.clone();
    }

    let output = OutputKind::parse(&args.format).map_err(|e| e.to_string())?;
    let engine = Engine::new(config).map_err(|e| e.to_string())?;

    let jobs = [
        (QueueKind::Download, &args.downloads),
        (QueueKind::Conversion, &args.conversions),
    ];
    for (kind, sources) in jobs {
        for source in sources {
            let request =
                JobRequest::new(source.clone(), output, args.dest.clone()).with_compatibility(args.compat);
            let is_playlist = kind == QueueKind::Download
                && classify_youtube_url(source) == SourceKind::YouTubePlaylist;
            let enqueued = if is_playlist {
                engine.enqueue_playlist(request)
            } else {
                engine.enqueue(kind, request).map(|id| vec![id])
            };
            match enqueued {
                Ok(ids) => tracing::debug!(queue = %kind, jobs = ids.len(), "enqueued"),
                Err(e) => eprintln!("skipping {source}: {e}"),
            }
        }
        if !engine.queue(kind).is_empty() {
            engine.queue(kind).start().map_err(|e| e.to_string())?;
        }
    }

    let interrupted = Arc::new(AtomicBool::new(false));
    let interrupted_clone = interrupted.clone();
    let _ = ctrlc::set_handler(move || {
        interrupted_clone.store(true, Ordering::SeqCst);
    });

    let mut cancelling = false;
    let mut failed = 0usize;
    let mut report = |events: Vec<JobEvent>| {
        for event in events {
            if event.status == JobStatus::Failed && event.is_state_change() {
                failed += 1;
            }
            print_event(&event, args.json);
        }
    };
    loop {
        report(engine.events().wait_for(Duration::from_millis(250)));

        if interrupted.load(Ordering::SeqCst) && !cancelling {
            cancelling = true;
            eprintln!("cancelling all jobs...");
            for kind in [QueueKind::Download, QueueKind::Conversion] {
                for job in engine.queue(kind).snapshot() {
                    if !job.status.is_terminal() {
                        engine.queue(kind).cancel(job.id);
                    }
                }
            }
        }

        if !engine.has_unfinished() {
            break;
        }
    }

    // Workers publish the final state change after the store update.
    engine.shutdown();
    report(engine.events().drain());
    Ok(if failed > 0 || cancelling {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn print_event(event: &JobEvent, json: bool) {
    if json {
        if let Ok(line) = serde_json::to_string(event) {
            println!("{line}");
        }
        return;
    }

    let label = format!("[{} #{}]", event.queue, event.job_id);
    match event.kind {
        EventKind::Progress => {
            let mut line = format!("{label} {:5.1}%", event.progress);
            if let Some(rate) = event.rate.as_deref() {
                line.push_str(&format!(" {rate}"));
            }
            if let Some(eta) = event.eta_secs {
                line.push_str(&format!(" eta {eta}s"));
            }
            println!("{line}");
        }
        EventKind::StateChanged => match (event.status, &event.error, &event.output_path) {
            (JobStatus::Failed, Some(error), _) => println!("{label} failed: {error}"),
            (JobStatus::Completed, _, Some(path)) => {
                println!("{label} completed: {}", path.display())
            }
            (status, _, _) => println!("{label} {status}"),
        },
    }
}

fn default_base_dir() -> Option<PathBuf> {
    if let Ok(v) = std::env::var("MEDIAQUEUE_BASE_DIR") {
        let t = v.trim();
        if !t.is_empty() {
            return Some(PathBuf::from(t));
        }
    }

    if cfg!(windows) {
        if let Ok(appdata) = std::env::var("APPDATA") {
            let t = appdata.trim();
            if !t.is_empty() {
                return Some(PathBuf::from(t).join("mediaqueue"));
            }
        }
    }

    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        let t = xdg.trim();
        if !t.is_empty() {
            return Some(PathBuf::from(t).join("mediaqueue"));
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        let t = home.trim();
        if !t.is_empty() {
            return Some(PathBuf::from(t).join(".local/share/mediaqueue"));
        }
    }

    None
}
