//! Error handling for the PBX core

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("SIP error: {0}")]
    Sip(String),

    #[error("RTP error: {0}")]
    Rtp(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("B2BUA error: {0}")]
    B2bua(String),

    #[error("Authentication required")]
    AuthRequired,

    #[error("Bad credential")]
    BadCredential,

    #[error("Extension not registered: {0}")]
    NotRegistered(String),

    #[error("No route for: {0}")]
    NoRoute(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("RTP port pool exhausted")]
    PoolExhausted,

    #[error("SIP transaction timeout")]
    TransactionTimeout,

    #[error("Media inactivity timeout")]
    MediaTimeout,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn network<S: Into<String>>(msg: S) -> Self {
        Self::Network(msg.into())
    }

    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn sip<S: Into<String>>(msg: S) -> Self {
        Self::Sip(msg.into())
    }

    pub fn rtp<S: Into<String>>(msg: S) -> Self {
        Self::Rtp(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn not_supported<S: Into<String>>(msg: S) -> Self {
        Self::NotSupported(msg.into())
    }

    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Self::Parse(msg.into())
    }

    pub fn b2bua<S: Into<String>>(msg: S) -> Self {
        Self::B2bua(msg.into())
    }

    pub fn not_registered<S: Into<String>>(ext: S) -> Self {
        Self::NotRegistered(ext.into())
    }

    pub fn no_route<S: Into<String>>(number: S) -> Self {
        Self::NoRoute(number.into())
    }

    pub fn forbidden<S: Into<String>>(msg: S) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Maps a core error to the SIP status code that should be returned to
    /// the peer that triggered it, per the error-handling design.
    pub fn sip_status(&self) -> u16 {
        match self {
            Error::Parse(_) => 400,
            Error::AuthRequired | Error::BadCredential => 401,
            Error::Forbidden(_) => 403,
            Error::NotRegistered(_) => 480,
            Error::NoRoute(_) => 404,
            Error::PoolExhausted => 503,
            Error::TransactionTimeout => 408,
            Error::MediaTimeout => 500,
            _ => 500,
        }
    }
}
