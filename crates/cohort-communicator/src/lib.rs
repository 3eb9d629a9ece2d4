//! Cohort group communicator.
//!
//! Forms a mutually connected group of N processes with stable ranks and
//! provides ordered point-to-point messaging, collectives (barrier,
//! broadcast, scatter, gather, allgather), and group reconfiguration
//! (revoke, shrink, split, sub-communicators) on top of `cohort-transport`.
//!
//! Wire format: length-prefixed frames carrying MessagePack payloads.
//!
//! ```rust,no_run
//! use cohort_communicator::{Communicator, CommunicatorConfig};
//!
//! # async fn example() -> cohort_communicator::Result<()> {
//! let root = "tcp://127.0.0.1:25000".parse()?;
//! let comm = Communicator::connect(CommunicatorConfig::dynamic(2, 0, root).token(42)).await?;
//! let value: f64 = comm.broadcast(0, Some(1.23)).await?;
//! comm.stop().await;
//! # Ok(())
//! # }
//! ```

mod collective;
mod communicator;
mod config;
mod connections;
mod dispatch;
mod error;
mod lifecycle;
mod rendezvous;
mod run;
mod stats;
mod timeout;
mod types;

pub use communicator::{Communicator, RecvHandle, SendHandle};
pub use config::{Addressing, CommunicatorConfig, DEFAULT_NAME, DEFAULT_TIMEOUT};
pub use error::{CommunicatorError, Result};
pub use run::{run, PlayerOutcome, RunConfig};
pub use stats::{CommunicatorStats, PeerStats};
pub use timeout::TimeoutGuard;
pub use types::{Rank, Tag, Token, RESERVED_TAG_BASE};

pub use cohort_transport::{Address, Family, TlsConfig, TlsIdentity, TransportConfig};

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
