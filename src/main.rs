mod comments;
mod config;
mod constants;
mod domain;
mod estimate;
mod export;
mod jobs;
mod materialize;
mod models;
mod routes;
mod services;
mod storage;

use apalis_sql::postgres::PostgresStorage;
use google_cloud_storage::client::Storage;
use sqlx::postgres::PgPoolOptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use config::Config;
use jobs::{ApalisDispatcher, Dispatcher, MaterializeJob};
use materialize::Materializer;
use services::metadata::{MetadataStore, PgMetadataStore};
use services::youtube::{CommentSource, YouTubeClient};
use storage::{ArtifactStore, GcsArtifactStore, LocalArtifactStore};

pub struct AppState {
    pub metadata: Arc<dyn MetadataStore>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub comments: Arc<dyn CommentSource>,
    pub dispatcher: Arc<dyn Dispatcher>,
    /// Set when exports live on local disk and are served by /media
    pub local_storage_path: Option<PathBuf>,
    pub job_lease_seconds: i64,
    pub starting_credits: i64,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn build_artifact_store(config: &Config) -> Arc<dyn ArtifactStore> {
    if let Some(path) = &config.local_storage_path {
        tracing::info!(path = %path.display(), "using local artifact storage");
        return Arc::new(LocalArtifactStore::new(
            path.clone(),
            &config.public_base_url,
        ));
    }

    // GCS client uses GOOGLE_APPLICATION_CREDENTIALS env var
    let gcs = Storage::builder()
        .build()
        .await
        .expect("Failed to create GCS client");
    tracing::info!(bucket = %config.bucket_name, "using GCS artifact storage");
    Arc::new(GcsArtifactStore::new(
        gcs,
        &config.bucket_name,
        config.storage_timeout,
    ))
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = Config::from_env().expect("Invalid configuration");

    let connect_options = config
        .pg_connect_options()
        .expect("Invalid DATABASE_URL");
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(connect_options)
        .await
        .expect("Failed to connect to database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    // Run apalis migrations
    PostgresStorage::setup(&pool)
        .await
        .expect("Failed to set up apalis storage");
    let job_storage: PostgresStorage<MaterializeJob> = PostgresStorage::new(pool.clone());

    let metadata: Arc<dyn MetadataStore> = Arc::new(PgMetadataStore::new(pool));
    let artifacts = build_artifact_store(&config).await;
    let comments: Arc<dyn CommentSource> = Arc::new(
        YouTubeClient::new(
            &config.youtube_api_key,
            &config.youtube_base_url,
            config.upstream_timeout,
        )
        .expect("Failed to create YouTube client"),
    );

    let materializer = Arc::new(Materializer::new(
        metadata.clone(),
        artifacts.clone(),
        comments.clone(),
        config.retention(),
        config.job_lease_seconds,
    ));
    tokio::spawn(jobs::run_materialize_worker(
        job_storage.clone(),
        materializer,
    ));

    let state = Arc::new(AppState {
        metadata,
        artifacts,
        comments,
        dispatcher: Arc::new(ApalisDispatcher::new(job_storage)),
        local_storage_path: config.local_storage_path.clone(),
        job_lease_seconds: config.job_lease_seconds,
        starting_credits: config.starting_credits,
    });

    let app = routes::build_router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| panic!("Failed to bind to {}: {}", addr, e));

    tracing::info!("Listening on http://{}", addr);
    axum::serve(listener, app).await.expect("Server failed");
}
