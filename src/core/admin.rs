//! Admin/Control API (§4.12).
//!
//! A narrow in-process interface that feature modules (voicemail IVR,
//! conference mixer, parking, the HTTP admin surface) consume instead of
//! reaching into call internals directly. Modeled the way the existing
//! CDR storage trait is: `async_trait`, object-safe, used behind
//! `Arc<dyn AdminControl>`.

use std::net::SocketAddr;

use async_trait::async_trait;
use serde::Serialize;

use crate::Result;

#[derive(Debug, Clone, Serialize)]
pub struct CallSummary {
    pub call_id: String,
    pub from_extension: String,
    pub to_extension: String,
    pub state: String,
    pub connected_since: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtensionSummary {
    pub number: String,
    pub display_name: String,
    pub registered: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PbxStatus {
    pub running: bool,
    pub registered_extensions: usize,
    pub active_calls: usize,
    pub active_recordings: usize,
    pub active_conferences: usize,
    pub parked_calls: usize,
    pub queued_calls: usize,
}

/// Operations collaborators and the HTTP admin surface use to observe and
/// steer the call-control core. All operations are idempotent where
/// semantically possible (ending an already-ended call is a no-op, not an
/// error) and return structured errors otherwise.
#[async_trait]
pub trait AdminControl: Send + Sync {
    async fn enumerate_active_calls(&self) -> Result<Vec<CallSummary>>;
    async fn end_call(&self, call_id: &str, reason: &str) -> Result<()>;
    async fn transfer_call(&self, call_id: &str, new_destination: &str) -> Result<()>;
    async fn hold_call(&self, call_id: &str) -> Result<()>;
    async fn resume_call(&self, call_id: &str) -> Result<()>;

    /// Allocates a relay slot for a call synthesized by a collaborator
    /// (voicemail IVR answering the diverted leg, conference mixer
    /// bridging a participant) rather than a normal two-party INVITE.
    async fn allocate_synthetic_relay(&self, call_id: &str) -> Result<(u16, u16)>;

    /// Points one leg of `call_id`'s relay at `endpoint` — used by
    /// voicemail/conference/music-on-hold collaborators to inject or
    /// capture media without going through SDP renegotiation.
    async fn inject_media_endpoint(&self, call_id: &str, endpoint: SocketAddr) -> Result<()>;

    async fn enumerate_extensions(&self) -> Result<Vec<ExtensionSummary>>;
    async fn status(&self) -> Result<PbxStatus>;
}

/// Variants of collaborators a dial-plan decision can route to all speak
/// this interface, selected via a tagged enum on the routing decision
/// rather than a concrete pointer.
#[async_trait]
pub trait MediaEndpoint: Send + Sync {
    /// Called when a call is handed to this endpoint. MUST check the
    /// call's current state before starting its interaction loop and
    /// abort cleanly (without logging a successful start) if the call has
    /// already ended.
    async fn accept_call(&self, call_id: &str) -> Result<()>;
    async fn receive_dtmf(&self, call_id: &str, digit: char);
    async fn release(&self, call_id: &str);
}
