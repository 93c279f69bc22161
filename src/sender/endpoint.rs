use log::info;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{AgentError, Result};

/// Port used when an endpoint is given without one
pub const DEFAULT_PORT: u16 = 4242;

/// A destination accepting the delivery protocol
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = AgentError;

    /// Accepts `host`, `host:port`, `[v6addr]` and `[v6addr]:port`
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        let invalid =
            |reason: &str| AgentError::Config(format!("invalid endpoint {:?}: {}", s, reason));

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(|| invalid("unclosed bracket"))?;
            match tail {
                "" => (host, None),
                _ => {
                    let port = tail.strip_prefix(':').ok_or_else(|| invalid("expected :port"))?;
                    (host, Some(port))
                }
            }
        } else {
            match s.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (s, None),
            }
        };

        if host.is_empty() {
            return Err(invalid("empty host"));
        }

        let port = match port {
            Some(port) => port.parse::<u16>().map_err(|_| invalid("bad port"))?,
            None => DEFAULT_PORT,
        };

        Ok(Endpoint::new(host, port))
    }
}

/// Ordered endpoint list with a blacklist and a selection cursor
///
/// The order is shuffled once on creation. Selection walks forward from the
/// cursor, wrapping around and skipping blacklisted endpoints. When every
/// endpoint is blacklisted the blacklist is cleared, the order reshuffled and
/// the first endpoint selected.
#[derive(Debug)]
pub struct EndpointRotation {
    endpoints: Vec<Endpoint>,
    blacklist: HashSet<Endpoint>,
    cursor: Option<usize>,
    rng: StdRng,
}

impl EndpointRotation {
    /// Create a rotation shuffled with OS entropy
    pub fn new(endpoints: Vec<Endpoint>) -> Result<Self> {
        Self::with_rng(endpoints, StdRng::from_os_rng())
    }

    /// Create a rotation shuffled with the given generator
    pub fn with_rng(mut endpoints: Vec<Endpoint>, mut rng: StdRng) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(AgentError::Config("at least one endpoint is required".to_string()).into());
        }

        endpoints.shuffle(&mut rng);

        Ok(Self {
            endpoints,
            blacklist: HashSet::new(),
            cursor: None,
            rng,
        })
    }

    /// Move the cursor to the next healthy endpoint and return it
    pub fn select_next(&mut self) -> &Endpoint {
        let len = self.endpoints.len();
        let start = self.cursor.map_or(0, |cursor| cursor + 1);

        let found = (0..len)
            .map(|offset| (start + offset) % len)
            .find(|&index| !self.blacklist.contains(&self.endpoints[index]));

        let index = match found {
            Some(index) => index,
            None => {
                info!("No more healthy hosts, retry with previously blacklisted");
                self.endpoints.shuffle(&mut self.rng);
                self.blacklist.clear();
                0
            }
        };

        self.cursor = Some(index);
        let endpoint = &self.endpoints[index];
        info!("Selected connection: {}", endpoint);
        endpoint
    }

    /// Endpoint under the cursor, if one was ever selected
    pub fn current(&self) -> Option<&Endpoint> {
        self.cursor.map(|index| &self.endpoints[index])
    }

    /// Exclude an endpoint from selection until the blacklist is exhausted
    pub fn blacklist(&mut self, endpoint: &Endpoint) {
        info!("Blacklisting {} for a while", endpoint);
        self.blacklist.insert(endpoint.clone());
    }

    /// Blacklist the endpoint under the cursor
    pub fn blacklist_current(&mut self) {
        if let Some(endpoint) = self.current().cloned() {
            self.blacklist(&endpoint);
        }
    }

    pub fn is_blacklisted(&self, endpoint: &Endpoint) -> bool {
        self.blacklist.contains(endpoint)
    }

    /// Number of blacklisted endpoints
    pub fn blacklisted(&self) -> usize {
        self.blacklist.len()
    }

    /// Endpoints in their current order
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}
