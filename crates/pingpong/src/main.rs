//! Pingpong - a service that hosts a ping handler and pings itself.
//!
//! Binds a fixed local address, registers `PingService::ping`, and calls it
//! through its own channel every interval until interrupted.

use anyhow::Result;
use clap::Parser;
use pingpong_core::{
    register_ping_handler, CallInfo, CancellationToken, Channel, ChannelError, PingConfig,
    PingLoop, PingLoopConfig,
};
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "pingpong")]
#[command(about = "Serve PingService and ping it periodically")]
struct Args {
    /// Host to bind to
    #[arg(long, default_value = PingConfig::DEFAULT_HOST)]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = PingConfig::DEFAULT_PORT)]
    port: u16,

    /// Seconds between pings
    #[arg(long, default_value_t = PingConfig::INTERVAL.as_secs())]
    interval_secs: u64,

    /// Deadline for each ping call, in seconds
    #[arg(long, default_value_t = PingConfig::CALL_TIMEOUT.as_secs())]
    timeout_secs: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

impl Args {
    fn loop_config(&self) -> PingLoopConfig {
        PingLoopConfig {
            call_timeout: Duration::from_secs(self.timeout_secs.max(1)),
            interval: Duration::from_secs(self.interval_secs.max(1)),
            ..PingLoopConfig::default()
        }
    }
}

fn on_error(call: &CallInfo, err: &ChannelError) {
    error!(
        service = %call.service,
        method = %call.method,
        remote = %call.remote_addr,
        error = %err,
        "onError handler triggered"
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let channel = Channel::new(PingConfig::SERVICE_NAME);
    register_ping_handler(&channel, PingConfig::SERVICE_NAME);
    channel.on_error(on_error);

    let host_port = format!("{}:{}", args.host, args.port);
    let server = match channel.open(&host_port).await {
        Ok(server) => server,
        Err(e) => {
            error!(host_port = %host_port, error = %e, "Couldn't listen");
            return Err(e.into());
        }
    };

    let shutdown = CancellationToken::new();
    let ping_loop = PingLoop::new(channel, args.loop_config()).with_shutdown(shutdown.clone());
    let pinger = ping_loop.spawn();

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");

    shutdown.cancel();
    let _ = pinger.await;
    server.join().await;

    Ok(())
}
