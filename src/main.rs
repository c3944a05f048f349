use std::io::IsTerminal;
use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{self, RandomIdGenerator, Sampler},
    Resource,
};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::prelude::*;

use filegate::api::{self, AppState};
use filegate::config::Settings;
use filegate::pg_database::PostgresDatabase;
use filegate::queue::RedisScanQueue;
use filegate::rate_limit::RedisRateLimiter;
use filegate::s3_client::S3BlobStore;
use filegate::scanner::ScanWorker;
use filegate::service::UploadCoordinator;

#[derive(Debug, Parser)]
#[command(version)]
struct Opt {
    /// Host name to listen on.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port number to listen on.
    #[arg(long, default_value = "8000")]
    port: u16,

    /// Opentelemetry endpoint (http://ip:port)
    #[arg(long)]
    otlp_endpoint: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP API (default).
    Serve,
    /// Run the scan worker pull loop.
    ScanWorker,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let opt = Opt::parse();
    setup_tracing(&opt)?;

    let settings = Arc::new(Settings::from_env()?);

    let store = Arc::new(PostgresDatabase::connect(&settings).await?);

    let blob = S3BlobStore::new(&settings);
    blob.ensure_bucket(&settings.s3_bucket).await?;
    let blob = Arc::new(blob);

    let redis_client = redis::Client::open(settings.redis_url.as_str())?;
    let redis_conn = redis::aio::ConnectionManager::new(redis_client).await?;
    let queue = RedisScanQueue::new(redis_conn.clone());

    match opt.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let coordinator = Arc::new(UploadCoordinator::new(
                Arc::clone(&settings),
                store.clone(),
                blob,
                Arc::new(queue),
            ));
            let state = AppState {
                settings: Arc::clone(&settings),
                store,
                coordinator,
                limiter: Arc::new(RedisRateLimiter::new(redis_conn)),
            };

            let listener = tokio::net::TcpListener::bind((opt.host.as_str(), opt.port)).await?;
            let local_addr = listener.local_addr()?;
            info!("server is running at http://{local_addr}");

            axum::serve(
                listener,
                api::router(state).into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown_signal())
            .await?;

            info!("server is stopped");
        }
        Command::ScanWorker => {
            let worker = ScanWorker::new(store, blob);
            info!("scan worker is running");
            tokio::select! {
                () = worker.run(queue) => {}
                () = shutdown_signal() => {}
            }
            info!("scan worker is stopped");
        }
    }

    Ok(())
}

fn setup_tracing(args: &Opt) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    if args.otlp_endpoint.is_none() {
        use tracing_subscriber::EnvFilter;

        let env_filter = EnvFilter::from_default_env();
        let enable_color = std::io::stdout().is_terminal();

        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(env_filter)
            .with_ansi(enable_color)
            .init();
        return Ok(());
    }

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(&args.otlp_endpoint.clone().unwrap())
                .with_timeout(Duration::from_secs(3)),
        )
        .with_trace_config(
            trace::config()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_max_events_per_span(64)
                .with_max_attributes_per_span(16)
                .with_resource(Resource::new(vec![KeyValue::new("service.name", "filegate")])),
        )
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    let fmt_layer = tracing_subscriber::fmt::layer();
    let opentelemetry = tracing_opentelemetry::layer().with_tracer(tracer);
    let registry = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::filter::LevelFilter::DEBUG)
        .with(fmt_layer)
        .with(opentelemetry);
    registry.try_init()?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
