use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use gilgate_core::monitor::spawn_monitor;
use gilgate_core::{Gateway, GatewayConfig, GatewayConfigBuilder, GatewayOptions, NativeEngine};
use gilgate_http::{GatewayServer, HttpServerConfig, HttpServerConfigBuilder, shutdown_signal};
use tokio_util::sync::CancellationToken;

mod demo;

use demo::DemoApp;

#[derive(Parser, Debug)]
#[command(name = "gilgate", version)]
#[command(about = "gilgate - a scheduling gateway for single-lock application engines")]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Json, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Json,
    Pretty,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the gateway with the built-in demo application
    Serve(ServeArgs),
    /// Resolve and validate configuration, then print it
    Config(ServeArgs),
}

/// Flags override `GILGATE_*` environment variables
#[derive(Args, Debug, Clone, Default)]
struct ServeArgs {
    /// Public listen address
    #[arg(long)]
    listen: Option<SocketAddr>,
    /// Admin API address
    #[arg(long)]
    admin: Option<SocketAddr>,
    /// Number of request workers
    #[arg(long)]
    workers: Option<usize>,
    /// Maximum pending requests before the lowest priority one is dropped
    #[arg(long)]
    max_queue_length: Option<usize>,
    /// Seconds a request may wait for and spend in a worker
    #[arg(long)]
    request_timeout_secs: Option<u64>,
    /// Seconds a background task may run
    #[arg(long)]
    background_timeout_secs: Option<u64>,
    /// Priority at or below which requests wait for an idle engine
    #[arg(long, allow_hyphen_values = true)]
    low_priority_threshold: Option<i64>,
    /// Bytes of each request body buffered before scheduling
    #[arg(long)]
    request_buffer_length: Option<usize>,
    /// Threads allowed inside the demo engine at once
    #[arg(long, default_value_t = 1)]
    engine_concurrency: usize,
}

impl ServeArgs {
    fn gateway_config(&self) -> Result<GatewayConfig, Box<dyn Error>> {
        let mut builder = GatewayConfigBuilder::from_env()?;
        if let Some(workers) = self.workers {
            builder = builder.workers(workers);
        }
        if let Some(length) = self.max_queue_length {
            builder = builder.max_queue_length(length);
        }
        if let Some(secs) = self.request_timeout_secs {
            builder = builder.request_timeout_secs(secs);
        }
        if let Some(secs) = self.background_timeout_secs {
            builder = builder.background_timeout_secs(secs);
        }
        if let Some(threshold) = self.low_priority_threshold {
            builder = builder.low_priority_threshold(threshold);
        }
        if let Some(length) = self.request_buffer_length {
            builder = builder.request_buffer_length(length);
        }
        Ok(builder.build()?)
    }

    fn http_config(&self) -> Result<HttpServerConfig, Box<dyn Error>> {
        let mut builder = HttpServerConfigBuilder::from_env()?;
        if let Some(addr) = self.listen {
            builder = builder.listen_addr(addr);
        }
        if let Some(addr) = self.admin {
            builder = builder.admin_addr(addr);
        }
        Ok(builder.build()?)
    }
}

fn init_tracing(format: LogFormat) {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();
    let env_filter = match "info".parse() {
        Ok(directive) => env_filter.add_directive(directive),
        Err(_) => env_filter,
    };

    let builder = tracing_subscriber::fmt().with_env_filter(env_filter);
    let _ = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
}

async fn serve(args: ServeArgs) -> Result<(), Box<dyn Error>> {
    let config = args.gateway_config()?;
    let http = args.http_config()?;

    let engine = Arc::new(NativeEngine::with_concurrency(
        DemoApp,
        args.engine_concurrency.max(1),
    ));
    let gateway = Gateway::start(config, engine, GatewayOptions::default())?;

    let monitor_stop = CancellationToken::new();
    let monitor = spawn_monitor(Arc::clone(&gateway), monitor_stop.clone())?;

    let result = GatewayServer::new(gateway)
        .serve(http, shutdown_signal())
        .await;

    monitor_stop.cancel();
    if let Err(e) = monitor.await {
        tracing::warn!(error = %e, "Monitor task ended abnormally");
    }
    Ok(result?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Config(args) => {
            let config = args.gateway_config()?;
            let http = args.http_config()?;
            println!("{config:#?}");
            println!("{http:#?}");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_flags_parse() {
        let cli = Cli::try_parse_from([
            "gilgate",
            "--log-format",
            "pretty",
            "serve",
            "--workers",
            "4",
            "--low-priority-threshold",
            "-5000",
            "--listen",
            "127.0.0.1:8081",
        ])
        .unwrap();
        assert_eq!(cli.log_format, LogFormat::Pretty);

        let Commands::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.workers, Some(4));
        assert_eq!(args.low_priority_threshold, Some(-5000));
        assert_eq!(args.listen, Some("127.0.0.1:8081".parse().unwrap()));
        assert_eq!(args.engine_concurrency, 1);
    }

    #[test]
    #[serial]
    fn test_flags_override_defaults() {
        let args = ServeArgs {
            workers: Some(3),
            request_timeout_secs: Some(9),
            ..ServeArgs::default()
        };
        let config = args.gateway_config().unwrap();
        assert_eq!(config.workers.get(), 3);
        assert_eq!(config.request_timeout.as_secs(), 9);
    }

    #[test]
    #[serial]
    fn test_invalid_flag_value_rejected() {
        let args = ServeArgs {
            workers: Some(0),
            ..ServeArgs::default()
        };
        assert!(args.gateway_config().is_err());
    }
}
