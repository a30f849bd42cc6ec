use anyhow::{Context, Result, bail};
use std::time::{Duration, Instant};
use strata_channel::{ChannelError, ChannelOptions, Message, MessageChannel};
use strata_config::{BusConfig, PolicyConfig, QueueKind};
use strata_icc::{AdmissionPolicy, MultiWriterQueue, QueueRegistry, SegmentSpec};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Requests of this kind are echoed; everything else is acknowledged.
const ECHO: i32 = 1;

struct EchoServer {
    channel: MessageChannel,
    poll_interval: Duration,
}

impl EchoServer {
    fn new(channel: MessageChannel) -> Self {
        let poll_interval = channel.options().poll_interval;
        Self {
            channel,
            poll_interval,
        }
    }

    fn handle(&self, req: &Message) -> Result<(), ChannelError> {
        if req.kind == ECHO {
            self.channel.publish(&req.reply(req.body.clone()))?;
        } else {
            self.channel.update_ack(req)?;
        }
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        let mut last = Instant::now();
        let mut served: u64 = 0;

        loop {
            match self.channel.next_message(&[]) {
                Ok(Some(req)) => {
                    self.handle(&req)?;
                    served += 1;
                }
                Ok(None) => std::thread::sleep(self.poll_interval),
                // logged by the channel; the reader is already back in sync
                Err(ChannelError::Gap(_)) => {}
                Err(ChannelError::Malformed { len }) => warn!(len, "dropping malformed request"),
                Err(e) => return Err(e.into()),
            }

            if last.elapsed() >= Duration::from_secs(1) {
                info!(served, resyncs = self.channel.resyncs(), "serve rate (req/s)");
                served = 0;
                last = Instant::now();
            }
        }
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_thread_ids(true).init();
}

fn open_queue(config: &BusConfig, registry: &QueueRegistry, name: &str) -> Result<MultiWriterQueue> {
    let Some(q) = config.queue(name) else {
        bail!("queue '{name}' is not configured");
    };
    if q.kind != QueueKind::MultiWriter {
        bail!("queue '{name}' must be a multi_writer queue");
    }
    let policy = match q.policy {
        PolicyConfig::BestEffort => AdmissionPolicy::BestEffort,
        PolicyConfig::Blocking => AdmissionPolicy::Blocking,
    };
    let spec = SegmentSpec::new(name).in_dir(&config.shm_dir);
    registry
        .get_or_open_shared(&spec, q.capacity, policy)
        .with_context(|| format!("failed to open queue '{name}' in {}", config.shm_dir))
}

fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let (Some(config_path), Some(inbound), Some(outbound)) = (args.next(), args.next(), args.next()) else {
        bail!("usage: strata-echo <config.toml> <inbound> <outbound>");
    };

    let config = BusConfig::load(config_path.as_str())
        .with_context(|| format!("failed to load {config_path}"))?;
    init_tracing(&config.log_level);

    let registry = QueueRegistry::new();
    let requests = open_queue(&config, &registry, &inbound)?;
    let responses = open_queue(&config, &registry, &outbound)?;

    let options = ChannelOptions {
        request_timeout: config.channel.request_timeout(),
        poll_interval: config.channel.poll_interval(),
    };
    info!(%inbound, %outbound, queues = ?registry.names(), "strata-echo serving");

    let mut server = EchoServer::new(MessageChannel::server(&requests, &responses, options));
    server.run()
}
