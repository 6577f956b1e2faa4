use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tally_camera::{CameraEventListener, FfmpegGrabber, TcpConnector};
use tally_core::{
    EmbeddingIndex, FaceProvider, MockFaceProvider, OnnxFaceProvider, RecognitionEngine,
};
use tracing_subscriber::EnvFilter;

mod clock;
mod config;
mod dispatcher;
mod gate;
mod model;
mod routing;
mod store;

use clock::DefaultClock;
use config::{Config, ProviderKind, RecognitionConfig};
use dispatcher::SnapshotDispatcher;
use gate::AttendanceGate;
use routing::SnapshotRouter;
use store::{AttendanceStore, SqliteStore};

#[derive(Parser)]
#[command(name = "tallyd", about = "Camera-driven attendance tracking daemon", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the snapshot dispatcher and, if enabled, the camera listener
    Run,
    /// Process every image in a directory and wait for completion
    Process {
        /// Directory holding snapshot images
        dir: PathBuf,
    },
    /// Recognize one image and print the outcome as JSON
    Recognize {
        /// Image file
        file: PathBuf,
    },
    /// Print who is currently in the office
    Status,
    /// Print one employee's presence
    Presence {
        employee_id: i64,
    },
    /// Print attendance events for a day range, newest first
    History {
        /// First day, `YYYY-MM-DD` (UTC); defaults to today
        #[arg(long)]
        from: Option<NaiveDate>,
        /// Last day, inclusive; defaults to `from`
        #[arg(long)]
        to: Option<NaiveDate>,
        /// Only this employee's events
        #[arg(long)]
        employee: Option<i64>,
    },
    /// Print days present and hours worked by one employee
    Stats {
        employee_id: i64,
        /// First day, `YYYY-MM-DD` (UTC); defaults to today
        #[arg(long)]
        from: Option<NaiveDate>,
        /// Last day, inclusive; defaults to `from`
        #[arg(long)]
        to: Option<NaiveDate>,
    },
    /// Record a manual exit (ignores the entry cooldown)
    Exit {
        employee_id: i64,
    },
    /// Seed employees and embeddings from a JSON file
    Import {
        /// `[{"full_name": "...", "embeddings": [[...]]}]`
        file: PathBuf,
    },
}

/// Long-lived components, constructed once and shared by reference.
struct Services {
    config: Config,
    store: Arc<SqliteStore>,
    engine: RecognitionEngine,
    gate: Arc<AttendanceGate>,
    dispatcher: SnapshotDispatcher,
}

impl Services {
    async fn open(config: Config) -> Result<Self> {
        let store = Arc::new(
            SqliteStore::open(&config.storage.db_path)
                .await
                .context("failed to open attendance database")?,
        );
        let clock = Arc::new(DefaultClock);

        let provider = build_provider(&config.recognition)?;
        let engine = RecognitionEngine::new(
            provider,
            config.recognition.thresholds(),
            config.recognition.metric,
        );
        let thresholds = engine.thresholds();
        tracing::info!(
            provider = engine.provider_name(),
            ready = engine.is_ready(),
            metric = ?config.recognition.metric,
            match_distance = thresholds.match_distance,
            low_confidence_distance = thresholds.low_confidence_distance,
            "recognition engine initialized"
        );

        let gate = Arc::new(AttendanceGate::new(
            store.clone(),
            clock.clone(),
            config.attendance.cooldown(),
        ));
        let router = SnapshotRouter::new(config.routing.clone(), &config.storage.recognized_dir);
        let dispatcher = SnapshotDispatcher::new(
            engine.clone(),
            gate.clone(),
            store.clone(),
            router,
            clock,
            config.dispatcher.max_concurrent,
        );

        Ok(Self {
            config,
            store,
            engine,
            gate,
            dispatcher,
        })
    }
}

/// Select the face provider once, at startup.
fn build_provider(config: &RecognitionConfig) -> Result<Arc<dyn FaceProvider>> {
    match config.provider {
        ProviderKind::Mock => {
            tracing::warn!("using mock face provider; every image matches a fixed embedding");
            Ok(Arc::new(MockFaceProvider::default()))
        }
        ProviderKind::Onnx => {
            let provider = OnnxFaceProvider::load(&config.model_dir).with_context(|| {
                format!("failed to load face models from {}", config.model_dir.display())
            })?;
            Ok(Arc::new(provider))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;
    let services = Services::open(config).await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(services).await,
        Commands::Process { dir } => process_dir(&services, &dir).await,
        Commands::Recognize { file } => recognize(&services, &file).await,
        Commands::Status => print_json(&services.gate.office_status().await?),
        Commands::Presence { employee_id } => {
            print_json(&services.gate.employee_status(employee_id).await?)
        }
        Commands::History { from, to, employee } => {
            let (from, to) = day_range(from, to)?;
            print_json(&services.gate.history(from, to, employee).await?)
        }
        Commands::Stats { employee_id, from, to } => {
            let (from, to) = day_range(from, to)?;
            print_json(&services.gate.stats(from, to, employee_id).await?)
        }
        Commands::Exit { employee_id } => {
            let trace_id = format!("manual-{}", uuid::Uuid::new_v4());
            let event = services.gate.record_exit(employee_id, &trace_id).await?;
            print_json(&event)
        }
        Commands::Import { file } => import(&services, &file).await,
    }
}

async fn run(services: Services) -> Result<()> {
    tracing::info!("tallyd starting");

    let camera = &services.config.camera;
    let connector = Arc::new(TcpConnector::new(
        camera.host.clone(),
        camera.event_port,
        camera.connect_timeout(),
    ));
    let grabber = Arc::new(FfmpegGrabber::new(camera.rtsp_source(), &camera.snapshot_dir));
    let mut listener = CameraEventListener::new(camera.listener_config(), connector, grabber);
    listener.start(Arc::new(services.dispatcher.clone()));

    tracing::info!("tallyd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("tallyd shutting down");

    listener.stop().await;
    services.dispatcher.shutdown().await;

    tracing::info!("tallyd stopped");
    Ok(())
}

/// `[from 00:00, day after to 00:00)` in UTC.
fn day_range(from: Option<NaiveDate>, to: Option<NaiveDate>) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let from = from.unwrap_or_else(|| Utc::now().date_naive());
    let to = to.unwrap_or(from);
    if to < from {
        bail!("--to ({to}) is before --from ({from})");
    }
    let end = to.succ_opt().context("date out of range")?;
    Ok((
        from.and_time(chrono::NaiveTime::MIN).and_utc(),
        end.and_time(chrono::NaiveTime::MIN).and_utc(),
    ))
}

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

async fn process_dir(services: &Services, dir: &Path) -> Result<()> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("failed to read {}", dir.display()))?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_file() && is_image(&path) {
            files.push(path);
        }
    }
    files.sort();

    tracing::info!(dir = %dir.display(), count = files.len(), "reprocessing snapshots");
    for path in files {
        services.dispatcher.submit(path);
    }
    services.dispatcher.shutdown().await;
    Ok(())
}

async fn recognize(services: &Services, file: &Path) -> Result<()> {
    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    let index = EmbeddingIndex::from_entries(services.store.load_all_active_embeddings().await?);
    let outcome = services.engine.recognize(&bytes, &index).await;
    print_json(&outcome)
}

#[derive(Debug, Deserialize)]
struct ImportRecord {
    full_name: String,
    #[serde(default = "default_active")]
    is_active: bool,
    #[serde(default)]
    model_version: Option<String>,
    embeddings: Vec<Vec<f32>>,
}

fn default_active() -> bool {
    true
}

async fn import(services: &Services, file: &Path) -> Result<()> {
    let text = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    let records: Vec<ImportRecord> =
        serde_json::from_str(&text).with_context(|| format!("invalid import file {}", file.display()))?;

    for record in &records {
        if record.embeddings.iter().any(|e| e.is_empty()) {
            bail!("employee {:?} has an empty embedding", record.full_name);
        }
    }

    let mut embeddings = 0;
    for record in records {
        let id = services
            .store
            .insert_employee(&record.full_name, record.is_active)
            .await?;
        let version = record.model_version.as_deref().unwrap_or("imported");
        for vector in &record.embeddings {
            services.store.insert_embedding(id, vector, version).await?;
            embeddings += 1;
        }
        tracing::info!(employee_id = id, name = %record.full_name, "employee imported");
    }

    tracing::info!(embeddings, "import complete");
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
