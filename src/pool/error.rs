use std::fmt;

/// The two kinds of pooled channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Plain,
    Ackable,
}

impl ChannelKind {
    pub fn is_ackable(self) -> bool {
        self == ChannelKind::Ackable
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain => write!(f, "plain"),
            Self::Ackable => write!(f, "ackable"),
        }
    }
}

/// Pool error.
///
/// Broker outages never show up here: the pools retry until the broker comes back.
/// What does show up is misuse (asking for a channel kind the pool was not sized for)
/// and operations racing with, or following, a shutdown.
#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    #[error("The pool has been shut down")]
    Shutdown,
    #[error("The pool was configured without {0} channels")]
    NotConfigured(ChannelKind),
    #[error("Channel {0} was not leased from this pool")]
    ForeignChannel(u64),
    #[error("Failed to build the pool: {0}")]
    Misconfigured(String),
    #[error(transparent)]
    Broker(#[from] anyhow::Error),
}

impl From<lapin::Error> for PoolError {
    fn from(err: lapin::Error) -> Self {
        Self::Broker(err.into())
    }
}

impl From<deadpool::managed::PoolError<PoolError>> for PoolError {
    fn from(err: deadpool::managed::PoolError<PoolError>) -> Self {
        match err {
            deadpool::managed::PoolError::Backend(e) => e,
            deadpool::managed::PoolError::Closed => Self::Shutdown,
            err => Self::Broker(anyhow::anyhow!("{err}")),
        }
    }
}
