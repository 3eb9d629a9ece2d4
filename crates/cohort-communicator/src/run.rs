//! In-process driver: run every player of a group as a tokio task.
//!
//! Used by tests and the stress harness. Each player connects, runs the
//! supplied closure, and is stopped; its outcome is recorded whether it
//! returned a value, an error, or panicked.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use cohort_transport::{Address, Family, Listener, TlsConfig, TransportConfig};

use crate::config::{CommunicatorConfig, DEFAULT_NAME, DEFAULT_TIMEOUT};
use crate::error::{CommunicatorError, Result};
use crate::types::{Rank, Token};
use crate::Communicator;

/// Group settings for [`run`].
#[derive(Debug, Clone)]
pub struct RunConfig {
    world_size: usize,
    name: String,
    tokens: Vec<Token>,
    timeout: Duration,
    family: Family,
    transport: TransportConfig,
    tls: Option<Vec<TlsConfig>>,
}

impl RunConfig {
    pub fn new(world_size: usize) -> Self {
        Self {
            world_size,
            name: DEFAULT_NAME.to_string(),
            tokens: vec![Token::default(); world_size],
            timeout: DEFAULT_TIMEOUT,
            family: Family::Tcp,
            transport: TransportConfig::new(),
            tls: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Same token for every player.
    pub fn token(mut self, token: impl Into<Token>) -> Self {
        self.tokens = vec![token.into(); self.world_size];
        self
    }

    /// One token per rank.
    pub fn tokens(mut self, tokens: Vec<Token>) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Connect over TCP loopback (default) or Unix sockets.
    pub fn family(mut self, family: Family) -> Self {
        self.family = family;
        self
    }

    pub fn transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// One TLS configuration per rank.
    pub fn tls(mut self, tls: Vec<TlsConfig>) -> Self {
        self.tls = Some(tls);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.world_size == 0 {
            return Err(CommunicatorError::Config("world size must be at least 1".into()));
        }
        if self.tokens.len() != self.world_size {
            return Err(CommunicatorError::Config(format!(
                "{} tokens for {} players",
                self.tokens.len(),
                self.world_size
            )));
        }
        if let Some(tls) = &self.tls {
            if tls.len() != self.world_size {
                return Err(CommunicatorError::Config(format!(
                    "{} tls configurations for {} players",
                    tls.len(),
                    self.world_size
                )));
            }
        }
        Ok(())
    }

    fn player_config(&self, rank: Rank, root: &Address) -> CommunicatorConfig {
        let transport = match &self.tls {
            Some(tls) => self.transport.clone().tls(tls[rank].clone()),
            None => self.transport.clone(),
        };
        CommunicatorConfig::dynamic(self.world_size, rank, root.clone())
            .name(self.name.clone())
            .token(self.tokens[rank].clone())
            .timeout(self.timeout)
            .transport(transport)
    }
}

/// How one player ended.
#[derive(Debug)]
pub enum PlayerOutcome<T> {
    Completed(T),
    /// Connecting failed or the player returned an error.
    Failed(anyhow::Error),
    Panicked(String),
}

impl<T> PlayerOutcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, PlayerOutcome::Completed(_))
    }

    pub fn completed(&self) -> Option<&T> {
        match self {
            PlayerOutcome::Completed(value) => Some(value),
            _ => None,
        }
    }

    /// The communicator error behind a failure, if that is what it was.
    pub fn communicator_error(&self) -> Option<&CommunicatorError> {
        match self {
            PlayerOutcome::Failed(e) => e.downcast_ref::<CommunicatorError>(),
            _ => None,
        }
    }

    pub fn into_result(self) -> anyhow::Result<T> {
        match self {
            PlayerOutcome::Completed(value) => Ok(value),
            PlayerOutcome::Failed(e) => Err(e),
            PlayerOutcome::Panicked(message) => Err(anyhow::anyhow!("player panicked: {message}")),
        }
    }
}

/// Start `world_size` players on this host, run `player` on each, and
/// return one outcome per rank.
///
/// The root listener is bound before any player starts, on a free
/// loopback port or a fresh socket file. Every player's communicator is
/// stopped once `player` returns.
///
/// ```rust,no_run
/// use cohort_communicator::{run, RunConfig};
///
/// # async fn example() -> cohort_communicator::Result<()> {
/// let outcomes = run(RunConfig::new(3), |comm| async move {
///     Ok(comm.allgather(comm.rank()).await?)
/// })
/// .await?;
/// assert!(outcomes.iter().all(|o| o.completed() == Some(&vec![0, 1, 2])));
/// # Ok(())
/// # }
/// ```
pub async fn run<T, F, Fut>(config: RunConfig, player: F) -> Result<Vec<PlayerOutcome<T>>>
where
    T: Send + 'static,
    F: Fn(Arc<Communicator>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    config.validate()?;
    let root = match config.family {
        Family::Tcp => Address::tcp("127.0.0.1", 0),
        Family::File => Address::temporary_file(),
    };
    let listener = Listener::bind(&root).await?;
    let root = listener.local_address()?;
    let mut root_listener = Some(listener);
    tracing::debug!(%root, world_size = config.world_size, "starting players");

    let player = Arc::new(player);
    let mut handles = Vec::with_capacity(config.world_size);
    for rank in 0..config.world_size {
        let mut player_config = config.player_config(rank, &root);
        if rank == 0 {
            if let Some(listener) = root_listener.take() {
                player_config = player_config.listener(listener);
            }
        }
        let player = player.clone();
        handles.push(tokio::spawn(async move {
            let comm = Arc::new(Communicator::connect(player_config).await?);
            let result = player(comm.clone()).await;
            comm.stop().await;
            result
        }));
    }

    let mut outcomes = Vec::with_capacity(handles.len());
    for (rank, handle) in handles.into_iter().enumerate() {
        let outcome = match handle.await {
            Ok(Ok(value)) => PlayerOutcome::Completed(value),
            Ok(Err(e)) => {
                tracing::debug!(rank, "player failed: {e:#}");
                PlayerOutcome::Failed(e)
            }
            Err(e) if e.is_panic() => PlayerOutcome::Panicked(panic_message(e.into_panic())),
            Err(e) => PlayerOutcome::Failed(anyhow::anyhow!("player task cancelled: {e}")),
        };
        outcomes.push(outcome);
    }
    Ok(outcomes)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => message.to_string(),
            Err(_) => "non-string panic payload".to_string(),
        },
    }
}
