//! Conversion of collector lines into metric entries and their delivery

mod endpoint;
mod entry;
mod transport;

pub use endpoint::{DEFAULT_PORT, Endpoint, EndpointRotation};
pub use entry::{LineParser, MetricEntry, Tags, parse_tags};
pub use transport::{HttpTransport, Transport};

use log::{debug, error, warn};

use crate::config::AgentConfig;
use crate::error::Result;

/// What happened to one batch handed to [`Sender::send`]
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// No valid entries, nothing was sent
    Empty,
    /// Dry-run mode, the entries were printed instead of sent
    DryRun(Vec<MetricEntry>),
    /// The batch was accepted by the endpoint
    Delivered { endpoint: Endpoint, count: usize },
    /// The batch was dropped after a delivery failure
    Failed {
        endpoint: Endpoint,
        count: usize,
        reason: String,
    },
}

impl SendOutcome {
    /// Number of entries that left the agent or would have
    pub fn delivered(&self) -> usize {
        match self {
            SendOutcome::DryRun(entries) => entries.len(),
            SendOutcome::Delivered { count, .. } => *count,
            SendOutcome::Empty | SendOutcome::Failed { .. } => 0,
        }
    }
}

pub struct Sender {
    parser: LineParser,
    rotation: EndpointRotation,
    transport: Box<dyn Transport>,
    dry_run: bool,
    blacklist_on_failure: bool,
}

impl Sender {
    pub fn new(
        parser: LineParser,
        rotation: EndpointRotation,
        transport: Box<dyn Transport>,
    ) -> Self {
        Self {
            parser,
            rotation,
            transport,
            dry_run: false,
            blacklist_on_failure: true,
        }
    }

    /// Print batches instead of sending them
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Blacklist an endpoint after a failed delivery
    pub fn with_blacklist_on_failure(mut self, enabled: bool) -> Self {
        self.blacklist_on_failure = enabled;
        self
    }

    /// Build a sender speaking HTTP from the agent configuration
    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        let parser = LineParser::new(config.global_tags()?, config.max_tags);
        let rotation = EndpointRotation::new(config.endpoints()?)?;
        let transport = HttpTransport::new(&config.http)?;

        Ok(Self::new(parser, rotation, Box::new(transport))
            .with_dry_run(config.dry_run)
            .with_blacklist_on_failure(config.blacklist_on_failure))
    }

    pub fn parser(&self) -> &LineParser {
        &self.parser
    }

    pub fn rotation(&self) -> &EndpointRotation {
        &self.rotation
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Parse a batch of lines and deliver it in one request
    pub async fn send(&mut self, lines: Vec<String>) -> SendOutcome {
        let entries = self.parse_lines(&lines);

        if self.dry_run {
            print_dry_run(&entries);
            return SendOutcome::DryRun(entries);
        }

        if entries.is_empty() {
            debug!("Nothing to send");
            return SendOutcome::Empty;
        }

        let endpoint = self.select_endpoint();
        let count = entries.len();

        match self.transport.deliver(&endpoint, &entries).await {
            Ok(()) => {
                debug!("Delivered {} metrics to {}", count, endpoint);
                SendOutcome::Delivered { endpoint, count }
            }
            Err(e) => {
                error!("Failed to send {} metrics to {}: {:#}", count, endpoint, e);
                if self.blacklist_on_failure {
                    self.rotation.blacklist(&endpoint);
                }
                SendOutcome::Failed {
                    endpoint,
                    count,
                    reason: format!("{:#}", e),
                }
            }
        }
    }

    fn parse_lines(&self, lines: &[String]) -> Vec<MetricEntry> {
        lines
            .iter()
            .filter_map(|line| match self.parser.parse(line) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Skipping malformed line: {:#}", e);
                    None
                }
            })
            .collect()
    }

    /// A single healthy endpoint stays selected; several are rotated per batch
    fn select_endpoint(&mut self) -> Endpoint {
        match self.rotation.current() {
            Some(current) if self.rotation.len() == 1 && !self.rotation.is_blacklisted(current) => {
                current.clone()
            }
            _ => self.rotation.select_next().clone(),
        }
    }
}

fn print_dry_run(entries: &[MetricEntry]) {
    // Going through Value sorts the object keys
    let rendered = serde_json::to_value(entries)
        .and_then(|value| serde_json::to_string_pretty(&value));
    match rendered {
        Ok(json) => println!("Would have sent:\n{}", json),
        Err(e) => error!("Failed to render dry-run batch: {}", e),
    }
}
