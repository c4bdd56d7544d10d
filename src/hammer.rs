use anyhow::{Context, Result, anyhow};
use crossbeam::channel;
use crossbeam::select;
use crossbeam::thread::{Scope, ScopedJoinHandle};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::assembler::PacketAssembler;
use crate::config::GeneratorConfig;
use crate::dispatch::{DispatchChannel, Shutdown};
use crate::packet::{Category, Packet};
use crate::rate_limiter::RateLimiter;
use crate::samples::SampleCatalog;
use crate::stats::{SourceTally, Stats};
use crate::transport::RawTransport;

/// Floods a collector with IPFIX templates, option templates and data from
/// a set of spoofed exporters.
///
/// Three producers feed one bounded channel drained by a single transmitter:
/// the data flooder loops over its packets as fast as the channel allows,
/// while the two template refreshers resend their packets every
/// `template_interval`.
pub struct Hammer {
    config: GeneratorConfig,
    catalog: SampleCatalog,
    transport: Arc<dyn RawTransport>,
    channel: DispatchChannel,
    stats: Arc<Stats>,
}

/// Cancels the run when a worker leaves its loop for any reason, so a
/// panicking worker cannot leave the others blocked forever.
struct CancelOnExit<'a>(&'a Shutdown);

impl Drop for CancelOnExit<'_> {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

impl Hammer {
    pub fn new(
        config: GeneratorConfig,
        catalog: SampleCatalog,
        transport: Arc<dyn RawTransport>,
    ) -> Result<Self> {
        config.validate()?;
        let channel = DispatchChannel::new(config.channel_capacity)?;

        Ok(Self {
            config,
            catalog,
            transport,
            channel,
            stats: Arc::new(Stats::new()),
        })
    }

    pub fn stats(&self) -> Arc<Stats> {
        self.stats.clone()
    }

    pub fn queue_len(&self) -> usize {
        self.channel.len()
    }

    pub fn queue_capacity(&self) -> usize {
        self.channel.capacity()
    }

    /// Assemble every packet, then run the workers until `shutdown` fires.
    ///
    /// Configuration problems are reported before anything is queued.
    pub fn run(&self, shutdown: &Shutdown) -> Result<()> {
        let sources = self.config.source_set()?;
        let assembler = PacketAssembler::new(
            &self.catalog,
            &sources,
            self.config.target,
            self.config.source_port,
            self.config.target_port,
        );

        let data = assembler.assemble(Category::Data)?;
        let templates = assembler.assemble(Category::Template)?;
        let template_options = assembler.assemble(Category::TemplateOption)?;

        info!(
            "Simulating {} exporters ({} .. {})",
            sources.len(),
            sources[0],
            sources[sources.len() - 1]
        );
        info!(
            "Packets per cycle: {} data, {} template, {} option-template",
            data.len(),
            templates.len(),
            template_options.len()
        );

        crossbeam::scope(|s| -> Result<()> {
            let mut workers = Vec::with_capacity(4);

            workers.push(spawn_worker(s, "transmitter", shutdown, |_| {
                self.transmit(shutdown)
            })?);
            workers.push(spawn_worker(s, "template-refresher", shutdown, |_| {
                self.refresh(Category::Template, &templates, shutdown)
            })?);
            workers.push(spawn_worker(s, "option-refresher", shutdown, |_| {
                self.refresh(Category::TemplateOption, &template_options, shutdown)
            })?);

            // Templates get a head start so collectors can decode the first data
            if shutdown.sleep(self.config.warmup) {
                workers.push(spawn_worker(s, "data-flooder", shutdown, |_| {
                    self.flood(&data, shutdown)
                })?);
            } else {
                debug!("Cancelled during warm-up, data flooder not started");
            }

            let mut panicked = 0;
            for worker in workers {
                if worker.join().is_err() {
                    panicked += 1;
                }
            }
            if panicked > 0 {
                return Err(anyhow!("{} worker thread(s) panicked", panicked));
            }
            Ok(())
        })
        .map_err(|_| anyhow!("worker thread panicked"))??;

        info!("All workers stopped");
        Ok(())
    }

    fn transmit(&self, shutdown: &Shutdown) {
        let _guard = CancelOnExit(shutdown);
        if let Some(core) = self.config.transmitter_core {
            pin_current_thread(core);
        }

        let mut limiter = RateLimiter::new(self.config.rate_limit);
        debug!(
            "Transmitter started ({})",
            if limiter.is_unlimited() {
                "unpaced".to_string()
            } else {
                format!("{} pps", self.config.rate_limit)
            }
        );

        let mut tally = SourceTally::new();
        while let Some(packet) = self.channel.dequeue(shutdown) {
            if !limiter.acquire(shutdown) || shutdown.is_cancelled() {
                break;
            }

            match self.transport.send(packet.bytes()) {
                Ok(bytes_sent) => {
                    self.stats.record_sent(bytes_sent);
                    tally.record(packet.source());
                }
                Err(e) => {
                    let errors = self.stats.record_error();
                    if errors == 1 || errors % 10_000 == 0 {
                        warn!(
                            "Failed to send {} byte {} packet from {} ({} errors so far): {}",
                            packet.len(),
                            packet.category(),
                            packet.source(),
                            errors,
                            e
                        );
                    }
                }
            }

            if tally.is_due() {
                self.stats.flush_sources(&mut tally);
            }
        }
        self.stats.flush_sources(&mut tally);

        debug!("Transmitter shutting down");
    }

    fn flood(&self, packets: &[Packet], shutdown: &Shutdown) {
        let _guard = CancelOnExit(shutdown);
        debug!("Data flooder started, {} packets per cycle", packets.len());

        while self.enqueue_all(Category::Data, packets, shutdown) {}

        debug!("Data flooder shutting down");
    }

    /// Queue the packets once right away, then again on every tick
    fn refresh(&self, category: Category, packets: &[Packet], shutdown: &Shutdown) {
        let _guard = CancelOnExit(shutdown);
        let ticker = channel::tick(self.config.template_interval);
        debug!(
            "{} refresher started, {} packets every {:?}",
            category,
            packets.len(),
            self.config.template_interval
        );

        let mut cycles = 0u64;
        while self.enqueue_all(category, packets, shutdown) {
            cycles += 1;
            debug!("Queued {} cycle #{}", category, cycles);

            select! {
                recv(ticker) -> _ => {},
                recv(shutdown.signal()) -> _ => break,
            }
        }

        debug!("{} refresher shutting down after {} cycles", category, cycles);
    }

    /// Returns `false` when cancelled part way
    fn enqueue_all(&self, category: Category, packets: &[Packet], shutdown: &Shutdown) -> bool {
        for packet in packets {
            if !self.channel.enqueue(packet.clone(), shutdown) {
                return false;
            }
            self.stats.record_enqueued(category, 1);
        }
        true
    }
}

fn spawn_worker<'scope, 'env, F>(
    scope: &'scope Scope<'env>,
    name: &str,
    shutdown: &Shutdown,
    f: F,
) -> Result<ScopedJoinHandle<'scope, ()>>
where
    F: FnOnce(&Scope<'env>) + Send + 'env,
{
    scope
        .builder()
        .name(name.to_string())
        .spawn(f)
        .map_err(|e| {
            // workers already running would otherwise keep the scope open
            shutdown.cancel();
            e
        })
        .with_context(|| format!("Failed to spawn {} thread", name))
}

fn pin_current_thread(core: usize) {
    match core_affinity::get_core_ids() {
        Some(ids) => match ids.into_iter().find(|id| id.id == core) {
            Some(id) => {
                if core_affinity::set_for_current(id) {
                    debug!("Transmitter pinned to CPU core {}", core);
                } else {
                    warn!("Failed to pin transmitter to CPU core {}", core);
                }
            }
            None => warn!("CPU core {} not available, transmitter left unpinned", core),
        },
        None => info!("CPU affinity not supported on this platform, continuing without core pinning"),
    }
}
