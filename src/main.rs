use tokio_util::sync::CancellationToken;

use xray_load::config::Config;
use xray_load::runner::LoadRunner;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    dotenvy::dotenv().ok();

    let config = Config::load()?;
    tracing::info!(
        base_url = config.platform.base_url,
        repo = config.platform.repo,
        image = %format!("{}:{}", config.image.name, config.image.tag),
        "xray-load starting"
    );

    let report_path = config.report_path.clone();
    let runner = LoadRunner::new(config)?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, stopping users");
                shutdown.cancel();
            }
        });
    }

    let report = runner.run(shutdown).await;
    println!("{}", report.to_json()?);

    if let Some(path) = report_path {
        report
            .persist(&path)
            .await
            .inspect_err(|e| tracing::error!("failed to write report to {}: {e}", path.display()))?;
        tracing::info!(path = %path.display(), "report written");
    }

    tracing::info!(
        iterations = report.iterations,
        scans_completed = report.poll.completed,
        scans_timed_out = report.poll.timed_out,
        scans_failed = report.poll.failed,
        "xray-load finished"
    );
    Ok(())
}
