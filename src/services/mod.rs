//! Feature services built on top of the call-control core.

pub mod cdr;
pub mod voicemail;

pub use cdr::{
    BillingConfig, BillingInfo, BillingRate, CallDetailRecord, CdrEvent, CdrService, CdrStorage,
    DisconnectReason, FileCdrStorage, QualityMetrics, RouteType,
};
pub use voicemail::{CallStateQuery, VoicemailMessage, VoicemailService};
