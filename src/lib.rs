//! Redfire PBX - software private branch exchange
//!
//! Terminates SIP signaling, relays RTP media between endpoints, and
//! coordinates telephony features (voicemail, CDR, trunking, DTMF) through
//! a small set of collaborator interfaces consumed by the call-control core.
//!
//! **Sponsored by [Carrier One Inc](https://carrierone.com) - Professional Telecommunications Solutions**

pub mod config;
pub mod core;
pub mod services;
pub mod error;
pub mod utils;

pub use error::{Error, Result};

/// Gateway version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
