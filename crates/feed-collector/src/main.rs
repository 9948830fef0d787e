//! 시장 데이터 수집기 CLI.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use feed_collector::{
    resolve_series, Collector, CollectorSettings, CollectorSlot, ResilienceSupervisor,
    SecretsClient, SupervisedComponents, SupervisorExit,
};
use feed_core::{init_logging, AppConfig, LogConfig};
use feed_data::{CacheSink, CandleCache, IngestionProcessor, TimescaleStore};
use feed_exchange::{ExchangeDataSource, SyntheticDataSource};
use secrecy::ExposeSecret;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "feed-collector")]
#[command(about = "Resilient OHLCV market data collector", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// 설정 파일 경로 (TOML/YAML/JSON)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// 로그 레벨 (trace, debug, info, warn, error). 설정 파일보다 우선
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// 스트리밍 + 갭 복구 + 감독 루프 실행 (종료 신호까지)
    Run,

    /// 갭 복구 패스를 한 번만 실행
    HealOnce,

    /// 헬스 체크를 한 번 실행하고 JSON으로 출력
    Health,
}

/// 조립된 런타임 구성 요소.
struct App {
    components: SupervisedComponents,
    synthetic: Option<Arc<Collector>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref()).context("설정 로드 실패")?;

    let mut log_config = LogConfig::from(&config.logging);
    if let Some(level) = cli.log_level {
        log_config.level = level;
    }
    init_logging(log_config).map_err(|e| anyhow::anyhow!("logging init failed: {e}"))?;

    info!(profile = ?config.profile, "Feed collector 시작");

    let app = build(&config).await?;

    match cli.command {
        Commands::Run => run(&config, app).await,
        Commands::HealOnce => heal_once(&config, app).await,
        Commands::Health => health(&config, app).await,
    }
}

async fn build(config: &AppConfig) -> anyhow::Result<App> {
    let secrets = Arc::new(
        SecretsClient::from_config(&config.secrets)
            .with_required_keys([config.database.url_secret.clone()]),
    );
    let secrets_health = secrets.init().await;
    info!(health = ?secrets_health, "Secrets client initialized");

    let series = resolve_series(&secrets, &config.collector).await?;

    let database_url = secrets
        .get_optional(&config.database.url_secret)
        .await?
        .map(|url| url.expose_secret().to_string())
        .unwrap_or_else(|| config.database.url.clone());
    let store = Arc::new(TimescaleStore::connect(&config.database, &database_url).await?);
    store.ensure_schema().await?;
    info!("데이터베이스 연결 성공");

    let cache = Arc::new(CandleCache::new());
    let processor = Arc::new(IngestionProcessor::new(
        store.clone(),
        Some(cache.clone()),
        config.processor.clone(),
    ));

    let api_key = secrets.get_optional(&config.exchange.api_key_secret).await?;
    let source = Arc::new(ExchangeDataSource::from_config(&config.exchange, api_key)?);
    let settings = CollectorSettings::from(&config.collector);

    let collector = Arc::new(Collector::new(
        source,
        store.clone(),
        processor.clone(),
        processor.clone(),
        series.clone(),
        settings.clone(),
    ));

    // 합성 수집기는 캐시에만 씀 (저장소에는 절대 쓰지 않음)
    let synthetic = config.synthetic_fallback_enabled().then(|| {
        warn!("Synthetic fallback is enabled for this profile");
        Arc::new(Collector::new(
            Arc::new(SyntheticDataSource::new(config.synthetic.clone())),
            store.clone(),
            processor.clone(),
            Arc::new(CacheSink::new(cache.clone())),
            series,
            settings.with_streaming_only(true),
        ))
    });

    Ok(App {
        components: SupervisedComponents {
            secrets,
            store,
            processor,
            cache,
            slot: Arc::new(CollectorSlot::new(collector.clone())),
            collector,
        },
        synthetic,
    })
}

async fn run(config: &AppConfig, app: App) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let checker = ResilienceSupervisor::standard_checker(&config.supervisor, &app.components);
    let mut supervisor = ResilienceSupervisor::new(config.supervisor.clone(), app.components, checker)
        .with_restart_pause(config.collector.restart_pause())
        .with_processor_grace(config.processor.shutdown_grace());
    if let Some(synthetic) = app.synthetic {
        supervisor = supervisor.with_synthetic_fallback(synthetic);
    }

    match supervisor.run(shutdown).await {
        SupervisorExit::Shutdown => {
            info!("Feed collector 종료");
            Ok(())
        }
        SupervisorExit::Fatal(reason) => {
            error!(reason = %reason, "Unrecoverable failure, exiting");
            bail!("unrecoverable failure: {reason}")
        }
    }
}

async fn heal_once(config: &AppConfig, app: App) -> anyhow::Result<()> {
    let stats = app.components.collector.heal_all().await;
    stats.log_summary("heal-once");

    app.components
        .processor
        .shutdown(config.processor.shutdown_grace())
        .await;
    app.components.secrets.close();

    println!("{}", serde_json::to_string_pretty(&stats)?);
    if stats.errors > 0 {
        bail!("{} series failed to heal", stats.errors);
    }
    Ok(())
}

async fn health(config: &AppConfig, app: App) -> anyhow::Result<()> {
    let checker = ResilienceSupervisor::standard_checker(&config.supervisor, &app.components);
    let status = checker.check_all().await;

    app.components
        .processor
        .shutdown(config.processor.shutdown_grace())
        .await;
    app.components.secrets.close();

    println!("{}", serde_json::to_string_pretty(&status)?);
    if !status.healthy {
        bail!(
            "unhealthy: {}",
            status.reason.as_deref().unwrap_or("unknown")
        );
    }
    Ok(())
}

/// SIGINT / SIGTERM을 기다린 뒤 루트 토큰만 취소합니다.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("SIGINT 수신, 종료 중..."),
        _ = terminate => info!("SIGTERM 수신, 종료 중..."),
    }

    shutdown.cancel();
}
