use anyhow::{Context, Result};
use clap::Parser;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

mod assembler;
mod config;
mod dispatch;
mod hammer;
mod header;
mod packet;
mod rate_limiter;
mod samples;
mod stats;
mod transport;

use config::{DEFAULT_SOURCE_PORT, GeneratorConfig, IPFIX_PORT};
use dispatch::{DEFAULT_CHANNEL_CAPACITY, Shutdown};
use hammer::Hammer;
use packet::Category;
use samples::SampleCatalog;
use transport::{DryRun, RawConn, RawTransport};

#[derive(Parser, Debug)]
#[command(name = "ipfix-hammer")]
#[command(about = "Flood an IPFIX collector with spoofed templates and flow data")]
#[command(version = "1.0.0")]
struct Args {
    /// Collector IPv4 address
    #[arg(short, long, default_value = "127.0.0.1")]
    target: Ipv4Addr,

    /// Collector UDP port
    #[arg(short, long, default_value_t = IPFIX_PORT)]
    port: u16,

    /// UDP source port stamped on every packet
    #[arg(long, default_value_t = DEFAULT_SOURCE_PORT)]
    source_port: u16,

    /// Number of simulated routers; addresses base+1 .. base+(N-1) are used
    #[arg(short, long, default_value = "10")]
    sources: u32,

    /// Base address for the spoofed exporter addresses
    #[arg(long, default_value = "192.168.1.0")]
    source_base: Ipv4Addr,

    /// Template and option-template refresh interval (in seconds)
    #[arg(short = 'i', long, default_value = "10")]
    template_interval: u64,

    /// Rate limit in packets per second (0 = as fast as possible)
    #[arg(short, long, default_value = "0")]
    rate: u64,

    /// Capacity of the queue between producers and the transmitter
    #[arg(long, default_value_t = DEFAULT_CHANNEL_CAPACITY)]
    channel_capacity: usize,

    /// Delay between the first template cycle and the data flood (in milliseconds)
    #[arg(long, default_value = "1000")]
    warmup_ms: u64,

    /// Stop after this many seconds (0 = run until Ctrl+C)
    #[arg(short, long, default_value = "0")]
    duration: u64,

    /// Statistics report interval (in seconds)
    #[arg(long, default_value = "5")]
    stats_interval: u64,

    /// Pin the transmitter thread to this CPU core
    #[arg(long)]
    transmitter_core: Option<usize>,

    /// Build and queue packets but do not put them on the wire
    #[arg(long)]
    dry_run: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn generator_config(&self) -> GeneratorConfig {
        GeneratorConfig {
            max_simulated_sources: self.sources,
            source_base: self.source_base,
            template_interval: Duration::from_secs(self.template_interval),
            target: self.target,
            target_port: self.port,
            source_port: self.source_port,
            rate_limit: self.rate,
            channel_capacity: self.channel_capacity,
            warmup: Duration::from_millis(self.warmup_ms),
            transmitter_core: self.transmitter_core,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .init();

    let config = args.generator_config();
    config.validate().context("Invalid configuration")?;

    info!("Starting IPFIX hammer");
    info!("Target: {}:{}", config.target, config.target_port);
    info!("Simulated sources: {}", config.max_simulated_sources);
    info!("Template interval: {:?}", config.template_interval);
    info!(
        "Rate limit: {}",
        if config.rate_limit == 0 {
            "unlimited".to_string()
        } else {
            format!("{} pps", config.rate_limit)
        }
    );

    let transport: Arc<dyn RawTransport> = if args.dry_run {
        info!("Dry run: packets will not be sent");
        Arc::new(DryRun)
    } else {
        Arc::new(RawConn::new(config.target)?)
    };

    let catalog = SampleCatalog::builtin()?;
    let hammer = Arc::new(Hammer::new(config, catalog, transport)?);
    let shutdown = Shutdown::new();

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl+C, shutting down...");
                    shutdown.cancel();
                }
                Err(e) => warn!("Failed to listen for Ctrl+C: {}", e),
            }
        });
    }

    if args.duration > 0 {
        let shutdown = shutdown.clone();
        let duration = Duration::from_secs(args.duration);
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            info!("Duration reached, stopping");
            shutdown.cancel();
        });
    }

    let stats_handle = {
        let hammer = hammer.clone();
        let report_every = Duration::from_secs(args.stats_interval.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(report_every);
            interval.tick().await;
            let stats = hammer.stats();
            let mut last_packets = 0u64;
            let mut last_time = Instant::now();

            loop {
                interval.tick().await;

                let snapshot = stats.snapshot();
                let now = Instant::now();
                let elapsed = now.duration_since(last_time).as_secs_f64();
                let pps = (snapshot.sent_packets - last_packets) as f64 / elapsed;
                let queue_len = hammer.queue_len();

                info!(
                    "Rate: {} pps - Sent: {} packets / {} bytes - Errors: {} - Sources: {} - Queue: {}",
                    pps as u64,
                    snapshot.sent_packets,
                    snapshot.sent_bytes,
                    snapshot.errors,
                    snapshot.distinct_sources(),
                    queue_len
                );

                if queue_len >= hammer.queue_capacity() {
                    warn!("Dispatch queue is full ({} packets), transmitter is the bottleneck", queue_len);
                }

                last_packets = snapshot.sent_packets;
                last_time = now;
            }
        })
    };

    let start_time = Instant::now();
    let result = {
        let hammer = hammer.clone();
        let shutdown = shutdown.clone();
        tokio::task::spawn_blocking(move || hammer.run(&shutdown)).await?
    };
    stats_handle.abort();
    result?;

    let snapshot = hammer.stats().snapshot();
    let duration = start_time.elapsed();
    let avg_rate = if duration.as_secs_f64() > 0.0 {
        snapshot.sent_packets as f64 / duration.as_secs_f64()
    } else {
        0.0
    };

    info!("======= HAMMER SUMMARY =======");
    info!("Total time: {:.2} seconds", duration.as_secs_f64());
    info!("Packets sent: {}", snapshot.sent_packets);
    info!(
        "Bytes sent: {} ({:.2} MB)",
        snapshot.sent_bytes,
        snapshot.sent_bytes as f64 / (1024.0 * 1024.0)
    );
    for category in Category::ALL {
        info!("Queued {} packets: {}", category, snapshot.enqueued(category));
    }
    info!("Errors: {}", snapshot.errors);
    info!("Average rate: {:.0} packets/second", avg_rate);
    for (source, packets) in &snapshot.per_source {
        info!("  {}: {} packets", source, packets);
    }
    info!("==============================");

    Ok(())
}
