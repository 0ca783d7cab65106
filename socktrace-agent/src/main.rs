use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::{error, info};
use prometheus_client::registry::Registry;
use tokio::sync::watch;

use socktrace_agent::config::Config;
use socktrace_agent::metrics::TracerMetrics;
use socktrace_agent::server::serve_metrics;
use socktrace_agent::source::replay::ReplaySource;
use socktrace_agent::source::EventSource;
use socktrace_agent::tables::shared_tables;
use socktrace_agent::tracer::SocketTracer;
use socktrace_agent::utils::init_env;

#[derive(Parser, Debug)]
#[command(name = "socktrace-agent")]
#[command(
    long_about = "Reconstructs HTTP, gRPC and MySQL records from kernel socket probes and appends them to columnar tables."
)]
struct Args {
    /// Directory holding the pinned perf maps exported by the probe loader.
    #[clap(long, default_value = "/sys/fs/bpf/socktrace")]
    maps_dir: PathBuf,
    /// Replay a recorded event dump instead of reading perf buffers.
    #[clap(long)]
    replay: Option<PathBuf>,
    /// Socket address of the Prometheus metrics endpoint.
    #[clap(long, default_value = "0.0.0.0:8080")]
    metrics_addr: String,
    /// Allow/deny substring filters on HTTP response headers, e.g.
    /// "Content-Type:json,-Content-Type:text".
    #[clap(long, default_value = "")]
    http_response_header_filters: String,
    /// Decode gRPC payloads using --descriptor-set.
    #[clap(long)]
    enable_parsing_protobufs: bool,
    /// Protobuf FileDescriptorSet backing gRPC payload decoding.
    #[clap(long)]
    descriptor_set: Option<PathBuf>,
    /// Poll cadence for the kernel buffers, in milliseconds.
    #[clap(long, default_value_t = 100)]
    sampling_period_ms: u64,
    /// Transfer-stage cadence, in milliseconds.
    #[clap(long, default_value_t = 1000)]
    push_period_ms: u64,
    /// Append every raw event, length-prefixed, to this file.
    #[clap(long)]
    perf_buffer_events_output_path: Option<PathBuf>,
    #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
    enable_http_tracing: bool,
    #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
    enable_grpc_tracing: bool,
    #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
    enable_mysql_tracing: bool,
    /// Drop records produced by this process itself.
    #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
    disable_self_tracing: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_env()?;

    let cfg = Config {
        http_response_header_filters: args.http_response_header_filters.clone(),
        enable_parsing_protobufs: args.enable_parsing_protobufs,
        sampling_period: Duration::from_millis(args.sampling_period_ms),
        push_period: Duration::from_millis(args.push_period_ms),
        perf_buffer_events_output_path: args.perf_buffer_events_output_path.clone(),
        enable_http_tracing: args.enable_http_tracing,
        enable_grpc_tracing: args.enable_grpc_tracing,
        enable_mysql_tracing: args.enable_mysql_tracing,
        disable_self_tracing: args.disable_self_tracing,
        descriptor_set_path: args.descriptor_set.clone(),
        ..Config::default()
    };

    let mut registry = Registry::default();
    let metrics = TracerMetrics::new_registered(&mut registry);
    let tables = shared_tables();
    let mut tracer = SocketTracer::new(cfg.clone(), metrics, tables)?;

    let mut source: Box<dyn EventSource + Send> = match &args.replay {
        Some(path) => Box::new(ReplaySource::open(path)?),
        None => open_perf_source(&args, &cfg)?,
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    let engine_shutdown = shutdown.clone();
    let engine = std::thread::Builder::new()
        .name("socktrace-engine".into())
        .spawn(move || {
            if let Err(e) = tracer.run(source.as_mut(), &engine_shutdown) {
                error!("engine failed: {e:#}");
            }
        })?;

    let metrics_addr: SocketAddr = args.metrics_addr.parse().context("bad --metrics-addr")?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(serve_metrics(metrics_addr, Arc::new(registry), shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    shutdown.store(true, Ordering::Relaxed);
    let _ = shutdown_tx.send(true);
    tokio::task::spawn_blocking(move || engine.join())
        .await?
        .map_err(|_| anyhow::anyhow!("engine thread panicked"))?;
    let _ = server.await;
    Ok(())
}

#[cfg(target_os = "linux")]
fn open_perf_source(args: &Args, cfg: &Config) -> anyhow::Result<Box<dyn EventSource + Send>> {
    use socktrace_agent::source::perf::PerfEventSource;
    Ok(Box::new(PerfEventSource::open(
        &args.maps_dir,
        cfg.perf_buffer_events_output_path.as_deref(),
    )?))
}

#[cfg(not(target_os = "linux"))]
fn open_perf_source(_args: &Args, _cfg: &Config) -> anyhow::Result<Box<dyn EventSource + Send>> {
    anyhow::bail!("live tracing requires Linux; use --replay with a recorded dump")
}
