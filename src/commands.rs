// Command handlers for the relay CLI

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{error, info, warn};

use crate::cli::RelayCommand;
use crate::config::RelayConfig;
use crate::crypto::{self, Keyring, RecipientKey, Representation};
use crate::ingest::{IngestReport, Ingestor, SpoolDir, Submission};
use crate::mail::{self, Header};
use crate::message::Message;
use crate::pump::{self, Deliver, PumpReport};
use crate::queue::Queue;
use crate::remailer::{self, Hop, LayerCompression, Unwrapper};
use crate::smtp;

/// Open queue and keys of one node
pub struct RelayNode {
    pub config: RelayConfig,
    pub queue: Arc<Queue>,
    pub keyring: Keyring,
}

impl RelayNode {
    pub fn open(config: RelayConfig) -> Result<Self> {
        let queue = Queue::open(&config.database)
            .with_context(|| format!("Failed to open queue {}", config.database.display()))?;
        let keyring = config.keyring()?;
        if keyring.is_empty() {
            warn!("No secret keys configured; inbound remailer messages cannot be decrypted");
        } else {
            info!("Loaded keys {}", keyring.key_ids().join(", "));
        }

        Ok(Self {
            config,
            queue: Arc::new(queue),
            keyring,
        })
    }

    pub fn unwrapper(&self) -> Unwrapper {
        Unwrapper::new(self.keyring.clone(), self.config.local_address.clone())
            .with_max_layers(self.config.max_layers)
    }

    /// One pass over the spool directory
    pub fn ingest_pass(&self) -> Result<IngestReport> {
        let mut spool = SpoolDir::open(&self.config.spool_dir)
            .with_context(|| format!("Failed to open spool {}", self.config.spool_dir.display()))?;

        let ingestor = Ingestor::new(self.unwrapper(), self.queue.clone(), &self.config.inbound_queue)
            .with_max_message_size(self.config.max_message_size)
            .with_delete_invalid(self.config.delete_invalid);

        ingestor
            .ingest_mailbox(&mut spool)
            .context("Ingestion pass failed")
    }

    /// One delivery pass over the inbound queue
    pub fn pump_pass(&self) -> Result<PumpReport> {
        let mut delivery = smtp::delivery_for(&self.config.smtp);
        self.pump_pass_with(&mut *delivery)
    }

    /// One delivery pass through `delivery`, `delivery_batch` messages per
    /// queue transaction
    pub fn pump_pass_with<D: Deliver + ?Sized>(&self, delivery: &mut D) -> Result<PumpReport> {
        let report = pump::drain_batched(
            &self.queue,
            &self.config.inbound_queue,
            delivery,
            self.config.delivery_batch,
        )
        .context("Pump pass failed")?;

        if let Some(err) = &report.aborted {
            warn!("Delivery interrupted, remaining messages stay queued: {}", err);
        }
        Ok(report)
    }
}

/// Execute a relay command
pub async fn execute_command(config: RelayConfig, command: RelayCommand) -> Result<()> {
    match command {
        RelayCommand::Run => handle_run(config).await,
        RelayCommand::Ingest => handle_ingest(config).await,
        RelayCommand::Pump => handle_pump(config).await,
        RelayCommand::Submit { from, to } => handle_submit(config, from, to).await,
        RelayCommand::Wrap { to, key, level } => handle_wrap(to, key, level).await,
        RelayCommand::Unwrap => handle_unwrap(config).await,
        RelayCommand::List { queue } => handle_list(config, queue).await,
        RelayCommand::Seal { key, to } => handle_seal(key, to).await,
        RelayCommand::Open => handle_open(config).await,
    }
}

async fn open_node(config: RelayConfig) -> Result<Arc<RelayNode>> {
    let node = tokio::task::spawn_blocking(move || RelayNode::open(config))
        .await
        .context("Node setup task panicked")??;
    Ok(Arc::new(node))
}

async fn read_stdin() -> Result<Vec<u8>> {
    let mut input = Vec::new();
    tokio::io::stdin()
        .read_to_end(&mut input)
        .await
        .context("Failed to read stdin")?;
    Ok(input)
}

async fn write_stdout(data: &[u8]) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(data).await.context("Failed to write stdout")?;
    stdout.flush().await?;
    Ok(())
}

fn load_recipients(paths: &[std::path::PathBuf]) -> Result<Vec<RecipientKey>> {
    paths
        .iter()
        .map(|path| {
            RecipientKey::load(path)
                .with_context(|| format!("Failed to load public key {}", path.display()))
        })
        .collect()
}

async fn run_pass(node: Arc<RelayNode>) -> Result<(IngestReport, PumpReport)> {
    tokio::task::spawn_blocking(move || {
        let ingested = node.ingest_pass()?;
        let pumped = node.pump_pass()?;
        Ok::<_, anyhow::Error>((ingested, pumped))
    })
    .await
    .context("Relay pass task panicked")?
}

async fn handle_run(config: RelayConfig) -> Result<()> {
    let period = Duration::from_secs(config.poll_interval_secs.max(1));
    let node = open_node(config).await?;

    info!("Relay running, polling every {:?}", period);
    let mut interval = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match run_pass(node.clone()).await {
                    Ok((ingested, pumped)) => info!(
                        "Pass complete: {} enqueued, {} delivered",
                        ingested.enqueued, pumped.delivered
                    ),
                    Err(e) => error!("Relay pass failed: {:#}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    Ok(())
}

async fn handle_ingest(config: RelayConfig) -> Result<()> {
    let node = open_node(config).await?;
    let report = tokio::task::spawn_blocking(move || node.ingest_pass())
        .await
        .context("Ingestion task panicked")??;

    println!(
        "Enqueued {}, invalid {}, deferred {}, removed {}",
        report.enqueued, report.invalid, report.deferred, report.deleted
    );
    Ok(())
}

async fn handle_pump(config: RelayConfig) -> Result<()> {
    let node = open_node(config).await?;
    let report = tokio::task::spawn_blocking(move || node.pump_pass())
        .await
        .context("Pump task panicked")??;

    println!(
        "Delivered {}, discarded {} corrupt",
        report.delivered, report.discarded
    );
    if let Some(err) = report.aborted {
        bail!("delivery stopped early: {}", err);
    }
    Ok(())
}

async fn handle_submit(config: RelayConfig, from: String, to: Vec<String>) -> Result<()> {
    let raw = read_stdin().await?;
    let node = open_node(config).await?;

    let key = tokio::task::spawn_blocking(move || {
        let submission = Submission::new(
            node.queue.clone(),
            node.config.inbound_queue.clone(),
            node.config.max_message_size,
        );
        submission.send(&from, &to, raw.as_slice())
    })
    .await
    .context("Submission task panicked")?
    .context("Failed to enqueue message")?;

    println!("Queued as {}", String::from_utf8_lossy(&key));
    Ok(())
}

/// Envelope of the mail on stdin: `From` and every `To` address
fn envelope_from_headers(raw: &[u8]) -> Result<(String, Vec<String>)> {
    let (header, _) = mail::split_message(raw).context("Input is not a mail message")?;

    let from = header.get("From").unwrap_or("").to_string();
    let to: Vec<String> = header
        .get_all("To")
        .into_iter()
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|addr| !addr.is_empty())
        .map(str::to_string)
        .collect();

    if to.is_empty() {
        bail!("message has no To header");
    }
    Ok((from, to))
}

async fn handle_wrap(
    to: Vec<String>,
    keys: Vec<std::path::PathBuf>,
    level: Option<u32>,
) -> Result<()> {
    if to.len() != keys.len() {
        bail!("every --to hop needs exactly one --key ({} vs {})", to.len(), keys.len());
    }

    let raw = read_stdin().await?;
    let (from, recipients) = envelope_from_headers(&raw)?;

    let hops = to
        .into_iter()
        .zip(load_recipients(&keys)?)
        .map(|(address, key)| Hop::new(address, key))
        .collect::<Vec<_>>();

    let original = Message::new(from, recipients, raw);
    let wrapped = remailer::wrap_onion(&original, &hops, LayerCompression::from_level(level))
        .context("Failed to wrap message")?;

    write_stdout(&wrapped.body).await
}

async fn handle_unwrap(config: RelayConfig) -> Result<()> {
    let raw = read_stdin().await?;
    let keyring = config.keyring()?;
    let unwrapper = Unwrapper::new(keyring, config.local_address.clone())
        .with_max_layers(config.max_layers);

    let peeled = unwrapper.unwrap(&raw).context("Failed to unwrap message")?;
    info!(
        "Peeled {} layer(s), forward to {} (latency {})",
        peeled.layers,
        peeled.message.to.join(", "),
        peeled.latent_time.as_deref().unwrap_or("none")
    );

    write_stdout(&peeled.message.body).await
}

async fn handle_list(config: RelayConfig, queue: Option<String>) -> Result<()> {
    let name = queue.unwrap_or_else(|| config.inbound_queue.clone());
    let node = open_node(config).await?;

    let (queues, entries) = tokio::task::spawn_blocking(move || {
        Ok::<_, crate::error::RelayError>((node.queue.list_queues()?, node.queue.snapshot(&name)?))
    })
    .await
    .context("Queue listing task panicked")?
    .context("Failed to read queue")?;

    println!("Queues: {}", queues.join(", "));
    if entries.is_empty() {
        println!("(empty)");
    }
    for entry in entries {
        match entry {
            Ok(entry) => println!(
                "{}  {} -> {}  {} bytes",
                entry.key_str(),
                entry.message.from,
                entry.message.to.join(", "),
                entry.message.size()
            ),
            Err(e) => println!("{}", e),
        }
    }
    Ok(())
}

async fn handle_seal(keys: Vec<std::path::PathBuf>, to: Option<String>) -> Result<()> {
    let raw = read_stdin().await?;
    let recipients = load_recipients(&keys)?;

    let overrides = to.map(|to| {
        let mut header = Header::new();
        header.append("To", to);
        header
    });

    let sealed = crypto::seal_message(&raw, overrides, &recipients).context("Failed to seal message")?;
    write_stdout(&sealed).await
}

async fn handle_open(config: RelayConfig) -> Result<()> {
    let raw = read_stdin().await?;
    let keyring = config.keyring()?;

    let opened = crypto::open_message(&raw, &keyring).context("Failed to open message")?;
    if let (Representation::Header, Some(envelope)) = (opened.representation, &opened.envelope) {
        for (name, value) in envelope.iter() {
            info!("Envelope {}: {}", name, value);
        }
    }

    write_stdout(&opened.original).await
}
