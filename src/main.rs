use std::env;
use std::sync::Arc;

use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use hono_load::config::LoadConfig;
use hono_load::metrics::RunMetrics;
use hono_load::orchestrator::{LoadTest, RunStatus};
use hono_load::registry::HonoRegistry;
use hono_load::report::{JsonFileSink, LogSink, ReportSink};
use hono_load::sender::Transports;
use hono_load::server::MetricsServer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(feature = "tracing")]
    console_subscriber::init();

    let env = env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info");
    env_logger::init_from_env(env);

    let config = match env::args().nth(1) {
        Some(path) => LoadConfig::from_file(path)?,
        None => LoadConfig::default(),
    }
    .merge_vars(|key| env::var(key).ok())?;

    info!(
        "Load test: {} tenants, {} devices, protocols {:?}",
        config.tenants, config.devices, config.protocols
    );

    let registry = HonoRegistry::new(&config.adapters, config.registration_concurrency)?
        .with_throttle(config.registration_throttle.clone());
    let transports = Transports::new(config.adapters.clone(), config.message_type)?;

    let mut sinks: Vec<Box<dyn ReportSink>> = vec![Box::new(LogSink)];
    if let Some(dir) = &config.report_dir {
        sinks.push(Box::new(JsonFileSink::new(dir.clone())));
    }

    let metrics = Arc::new(RunMetrics::new()?);
    let metrics_addr = config.metrics_addr;

    let test = LoadTest::new(config, Arc::new(registry), Arc::new(transports), Arc::new(sinks))
        .with_metrics(metrics.clone());

    let shutdown = test.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping workers");
            shutdown.cancel();
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Second interrupt received, exiting without a report");
            std::process::exit(130);
        }
    });

    let server_stop = CancellationToken::new();
    let server = metrics_addr.map(|addr| {
        let stop = server_stop.clone();
        tokio::spawn(async move {
            if let Err(e) = MetricsServer::new(metrics).run(addr, stop).await {
                error!("Metrics server stopped: {}", e);
            }
        })
    });

    let report = test.execute().await;

    server_stop.cancel();
    if let Some(server) = server {
        server.await?;
    }

    if report.status == RunStatus::Failed {
        return Err(format!("load test failed: {:?}", report.stop_reason).into());
    }

    Ok(())
}
