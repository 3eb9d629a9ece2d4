use std::time::Duration;

use cohort_transport::{Address, Listener, TransportConfig};

use crate::error::{CommunicatorError, Result};
use crate::types::{Rank, Token};

/// Default time budget for rendezvous and every blocking operation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default communicator name.
pub const DEFAULT_NAME: &str = "world";

/// How members find each other during rendezvous.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addressing {
    /// One address per rank; `addresses[0]` is the root and rank `i`
    /// listens on `addresses[i]`.
    Predefined(Vec<Address>),
    /// A well-known root address. Non-root ranks listen on `listen`, or on
    /// an ephemeral sibling of the root address when `None`.
    Dynamic {
        root: Address,
        listen: Option<Address>,
    },
}

/// Everything one member needs to join a communicator.
///
/// ```rust,no_run
/// use std::time::Duration;
/// use cohort_communicator::{Addressing, CommunicatorConfig};
///
/// let root = "tcp://127.0.0.1:25000".parse().unwrap();
/// let config = CommunicatorConfig::new(3, 1, Addressing::Dynamic { root, listen: None })
///     .name("parties")
///     .token(7)
///     .timeout(Duration::from_secs(10));
/// ```
#[derive(Debug)]
pub struct CommunicatorConfig {
    pub(crate) world_size: usize,
    pub(crate) rank: Rank,
    pub(crate) name: String,
    pub(crate) token: Token,
    pub(crate) timeout: Duration,
    pub(crate) addressing: Addressing,
    pub(crate) transport: TransportConfig,
    /// Already-bound listener for this rank, used instead of binding.
    pub(crate) listener: Option<Listener>,
}

impl CommunicatorConfig {
    pub fn new(world_size: usize, rank: Rank, addressing: Addressing) -> Self {
        Self {
            world_size,
            rank,
            name: DEFAULT_NAME.to_string(),
            token: Token::default(),
            timeout: DEFAULT_TIMEOUT,
            addressing,
            transport: TransportConfig::new(),
            listener: None,
        }
    }

    /// Predefined addressing: rank `i` listens on `addresses[i]`.
    pub fn predefined(rank: Rank, addresses: Vec<Address>) -> Self {
        Self::new(addresses.len(), rank, Addressing::Predefined(addresses))
    }

    /// Dynamic addressing around a well-known root.
    pub fn dynamic(world_size: usize, rank: Rank, root: Address) -> Self {
        Self::new(world_size, rank, Addressing::Dynamic { root, listen: None })
    }

    /// Read the member configuration from `COHORT_*` environment variables.
    ///
    /// Required: `COHORT_WORLD_SIZE`, `COHORT_RANK`, and either
    /// `COHORT_ADDRESSES` or `COHORT_ROOT_ADDRESS`. Optional:
    /// `COHORT_ADDRESS`, `COHORT_NAME`, `COHORT_TOKEN`, `COHORT_TIMEOUT`
    /// (seconds) and the TLS variables read by
    /// [`TransportConfig::tls_from_env`].
    pub fn from_env() -> Result<Self> {
        let world_size = required_env("COHORT_WORLD_SIZE")?;
        let rank = required_env("COHORT_RANK")?;

        let addressing = match std::env::var("COHORT_ADDRESSES") {
            Ok(list) => Addressing::Predefined(Address::parse_list(&list)?),
            Err(_) => {
                let root = Address::from_env("COHORT_ROOT_ADDRESS")?.ok_or_else(|| {
                    CommunicatorError::Config(
                        "set COHORT_ADDRESSES or COHORT_ROOT_ADDRESS".to_string(),
                    )
                })?;
                let listen = Address::from_env("COHORT_ADDRESS")?;
                Addressing::Dynamic { root, listen }
            }
        };

        let mut config = Self::new(world_size, rank, addressing)
            .transport(TransportConfig::new().tls_from_env()?);
        if let Ok(name) = std::env::var("COHORT_NAME") {
            config = config.name(name);
        }
        if let Ok(token) = std::env::var("COHORT_TOKEN") {
            config = config.token(Token::parse_env(&token));
        }
        if let Ok(timeout) = std::env::var("COHORT_TIMEOUT") {
            let secs: f64 = timeout.trim().parse().map_err(|_| {
                CommunicatorError::Config(format!("COHORT_TIMEOUT is not a number: {timeout:?}"))
            })?;
            let timeout = Duration::try_from_secs_f64(secs).map_err(|e| {
                CommunicatorError::Config(format!("COHORT_TIMEOUT out of range: {e}"))
            })?;
            config = config.timeout(timeout);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn token(mut self, token: impl Into<Token>) -> Self {
        self.token = token.into();
        self
    }

    /// Time budget for the rendezvous and, afterwards, the communicator's
    /// initial operation timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// Listen on an already-bound socket instead of binding one.
    pub fn listener(mut self, listener: Listener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn addressing(&self) -> &Addressing {
        &self.addressing
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.world_size == 0 {
            return Err(CommunicatorError::Config("world size must be at least 1".into()));
        }
        if self.rank >= self.world_size {
            return Err(CommunicatorError::Config(format!(
                "rank {} out of range for world size {}",
                self.rank, self.world_size
            )));
        }
        if self.timeout.is_zero() {
            return Err(CommunicatorError::Config("timeout must be positive".into()));
        }
        if let Addressing::Predefined(addresses) = &self.addressing {
            if addresses.len() != self.world_size {
                return Err(CommunicatorError::Config(format!(
                    "{} predefined addresses for world size {}",
                    addresses.len(),
                    self.world_size
                )));
            }
        }
        Ok(())
    }

    /// Address every non-root rank dials first.
    pub(crate) fn root_address(&self) -> &Address {
        match &self.addressing {
            Addressing::Predefined(addresses) => &addresses[0],
            Addressing::Dynamic { root, .. } => root,
        }
    }

    /// Address this rank binds when no listener was supplied.
    pub(crate) fn bind_address(&self) -> Address {
        if self.rank == 0 {
            return self.root_address().clone();
        }
        match &self.addressing {
            Addressing::Predefined(addresses) => addresses[self.rank].clone(),
            Addressing::Dynamic { root, listen } => {
                listen.clone().unwrap_or_else(|| root.ephemeral_sibling())
            }
        }
    }
}

fn required_env<T: std::str::FromStr>(var: &str) -> Result<T> {
    let value = std::env::var(var)
        .map_err(|_| CommunicatorError::Config(format!("{var} is not set")))?;
    value
        .trim()
        .parse()
        .map_err(|_| CommunicatorError::Config(format!("{var} is not valid: {value:?}")))
}
