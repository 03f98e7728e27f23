use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use concert_pipeline::config::Config;
use concert_pipeline::context::Ctx;
use concert_pipeline::domain::{Artist, FollowedArtist, PassionLevel};
use concert_pipeline::error::PipelineError;
use concert_pipeline::job::{discovery_start, run_job};
use concert_pipeline::pipeline::Pipeline;
use concert_pipeline::router::replay_dead_letters;
use concert_pipeline::shutdown::{release_fn, Phase, ShutdownPlan};
use concert_pipeline::{logging, observability};

/// Time allowed for releasing backends after a one-shot command.
const TEARDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "concert_pipeline")]
#[command(about = "Event-driven concert discovery, venue resolution and enrichment")]
#[command(version)]
struct Cli {
    /// Config file; defaults to $CONCERT_PIPELINE_CONFIG or config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover concerts for every followed artist, then sweep venue enrichment
    Job {
        /// Keep running, once per enrichment.sweep_interval_secs
        #[arg(long)]
        repeat: bool,
    },
    /// Run the event handlers until Ctrl-C
    Consume,
    /// Enrich venues that are still pending
    Sweep,
    /// Move dead-lettered envelopes back to their original topic
    ReplayDeadLetters {
        /// Stop after the poison topic has been quiet this long
        #[arg(long, default_value_t = 2000)]
        idle_ms: u64,
    },
    /// Register an artist and a user's follow
    Follow {
        #[arg(long)]
        user: String,
        #[arg(long)]
        artist_id: String,
        #[arg(long)]
        artist_name: String,
        /// must_go, local_only or keep_an_eye
        #[arg(long, default_value = "keep_an_eye")]
        passion: String,
        #[arg(long)]
        official_site: Option<String>,
        #[arg(long)]
        mbid: Option<String>,
    },
}

fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received; stopping");
            token.cancel();
        }
    });
}

async fn teardown(pipeline: &Pipeline, mut plan: ShutdownPlan, deadline: Duration) {
    pipeline.register_shutdown(&mut plan);
    let report = plan.execute(deadline).await;
    if !report.is_clean() {
        warn!(
            failures = report.failures.len(),
            aborted_at = report.aborted_at.map(|p| p.as_str()).unwrap_or("-"),
            "Shutdown was not clean"
        );
    }
}

async fn run_job_command(pipeline: &Pipeline, root: CancellationToken, repeat: bool) -> Result<()> {
    let config = pipeline.config();
    let discovery = pipeline.discovery(pipeline.concert_searcher()?);
    let enricher = pipeline.enricher(pipeline.place_chain()?);
    let interval = Duration::from_secs(config.enrichment.sweep_interval_secs);

    loop {
        let ctx = Ctx::new(root.child_token());
        let from = discovery_start(Utc::now().date_naive(), config.discovery.from_offset_days);
        match run_job(&ctx, &discovery, &enricher, from, config.enrichment.retry_failed).await {
            Ok(report) => {
                println!("📊 Job results:");
                println!(
                    "   Artists searched: {}/{}",
                    report.discovery.artists_searched, report.discovery.artists_total
                );
                println!("   Discovery events published: {}", report.discovery.events_published);
                println!("   Concerts found: {}", report.discovery.concerts_found);
                println!("   Venues enriched: {} (failed {})", report.sweep.enriched, report.sweep.failed);
                if report.discovery_aborted() {
                    println!("⚠️  Discovery stopped early: search service looks unhealthy");
                }
            }
            Err(PipelineError::Cancelled) => break,
            Err(e) if repeat => error!("Job run failed: {}", e),
            Err(e) => return Err(e.into()),
        }

        if !repeat {
            break;
        }
        info!("Next job run in {:?}", interval);
        tokio::select! {
            _ = root.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    Ok(())
}

async fn consume(pipeline: &Pipeline) -> Result<()> {
    let router = pipeline.router()?;
    let grace = router.config().shutdown_grace;
    let shutdown = CancellationToken::new();

    let mut task = tokio::spawn(router.run(shutdown.clone()));
    println!("🎧 Consuming events; press Ctrl-C to stop");
    let finished = tokio::select! {
        res = &mut task => Some(res),
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received; draining router");
            None
        }
    };
    shutdown.cancel();

    let pending = Arc::new(Mutex::new(None));
    match finished {
        Some(Ok(Ok(()))) => info!("Router stopped on its own"),
        Some(Ok(Err(e))) => error!("Router failed: {}", e),
        Some(Err(e)) => error!("Router task failed: {}", e),
        None => *pending.lock().await = Some(task),
    }

    let mut plan = ShutdownPlan::new();
    plan.register(
        Phase::Drain,
        release_fn("router", move || {
            let pending = Arc::clone(&pending);
            async move {
                if let Some(task) = pending.lock().await.take() {
                    task.await
                        .map_err(|e| PipelineError::transport(format!("router task failed: {e}")))??;
                }
                Ok::<(), PipelineError>(())
            }
        }),
    );
    teardown(pipeline, plan, grace + TEARDOWN_DEADLINE).await;
    Ok(())
}

async fn follow(
    pipeline: &Pipeline,
    user: String,
    artist: Artist,
    passion: &str,
) -> Result<()> {
    let passion = PassionLevel::parse(passion).ok_or_else(|| anyhow!("unknown passion level '{passion}'"))?;
    let storage = pipeline.storage();

    match storage.get_artist(&artist.id).await? {
        Some(existing) => {
            info!(artist_id = %existing.id, "Artist already registered");
            if let Some(mbid) = &artist.mbid {
                storage.backfill_artist_mbid(&artist.id, mbid).await?;
            }
        }
        None => storage.create_artist(&artist).await?,
    }
    storage
        .follow_artist(&FollowedArtist {
            user_id: user.clone(),
            artist_id: artist.id.clone(),
            passion,
        })
        .await?;
    println!("✅ {} now follows {} ({})", user, artist.name, passion.as_str());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    logging::init_logging();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("loading configuration")?;

    if let Some(addr) = config.metrics_addr()? {
        observability::init_metrics(addr)?;
    }

    let pipeline = Pipeline::open(config).context("opening pipeline backends")?;
    let root = CancellationToken::new();

    let outcome = match cli.command {
        Commands::Job { repeat } => {
            cancel_on_ctrl_c(root.clone());
            run_job_command(&pipeline, root.clone(), repeat).await
        }
        Commands::Consume => return consume(&pipeline).await,
        Commands::Sweep => {
            cancel_on_ctrl_c(root.clone());
            let enricher = pipeline.enricher(pipeline.place_chain()?);
            let report = enricher
                .sweep(&Ctx::new(root.child_token()), pipeline.config().enrichment.retry_failed)
                .await;
            report
                .map(|r| {
                    println!(
                        "📍 Sweep examined {} venues: {} enriched, {} failed, {} errors",
                        r.examined, r.enriched, r.failed, r.errors
                    );
                })
                .map_err(Into::into)
        }
        Commands::ReplayDeadLetters { idle_ms } => {
            cancel_on_ctrl_c(root.clone());
            let transport = pipeline.transport();
            replay_dead_letters(
                &Ctx::new(root.child_token()),
                transport.as_ref(),
                &pipeline.config().poison_topic(),
                Duration::from_millis(idle_ms),
            )
            .await
            .map(|r| println!("♻️  Replayed {} dead letters ({} unroutable)", r.replayed, r.unroutable))
            .map_err(Into::into)
        }
        Commands::Follow {
            user,
            artist_id,
            artist_name,
            passion,
            official_site,
            mbid,
        } => {
            let mut artist = Artist::new(artist_id, artist_name);
            artist.official_site = official_site;
            artist.mbid = mbid;
            follow(&pipeline, user, artist, &passion).await
        }
    };

    teardown(&pipeline, ShutdownPlan::new(), TEARDOWN_DEADLINE).await;
    outcome
}
