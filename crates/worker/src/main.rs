use std::sync::Arc;

use anyhow::Context;

use transcriber_infra::WorkerSettings;
use transcriber_infra::jobs::{PostgresJobStore, WorkerLoop};
use transcriber_infra::pipeline::{TranscriptionPipeline, WhisperCliEngine};
use transcriber_infra::queue;

fn main() -> anyhow::Result<()> {
    // A missing .env file is fine; real deployments set the environment directly.
    let _ = dotenvy::dotenv();
    transcriber_observability::init();

    let settings = WorkerSettings::from_env().context("invalid worker configuration")?;
    tracing::info!(
        worker = %settings.worker_name,
        database = %settings.redacted_database_url(),
        redis = %settings.redis_url,
        model = %settings.whisper_model,
        language = %settings.whisper_language,
        "starting transcription worker"
    );

    queue::check_liveness(&settings.redis_url)
        .with_context(|| format!("redis at {} is not reachable", settings.redis_url))?;

    let store = PostgresJobStore::open(&settings.database_url).context("failed to connect to postgres")?;

    let engine = WhisperCliEngine::from_command_line(&settings.whisper_bin, settings.whisper_model.clone())
        .context("invalid WHISPER_BIN")?;
    engine
        .probe()
        .with_context(|| format!("whisper command `{}` is not usable", settings.whisper_bin))?;
    tracing::info!(model = %engine.model(), "whisper engine ready");

    let pipeline = TranscriptionPipeline::new(Arc::new(engine), settings.whisper_language.clone())
        .with_engine_timeout(settings.engine_timeout);

    WorkerLoop::new(store, pipeline, settings.loop_config()).run();
    Ok(())
}
