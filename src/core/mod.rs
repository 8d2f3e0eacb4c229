//! Call-control core.
//!
//! These modules implement the signaling, media, and routing machinery of
//! the PBX: message parsing, the extension registry, dial-plan routing, the
//! per-call dialog state machine, RTP relay, DTMF, timers, the SIP
//! transaction layer, trunk/DNS-SRV failover, least-cost routing, and the
//! admin control surface. `gateway` wires all of them together.

pub mod admin;
pub mod call;
pub mod dialplan;
pub mod dtmf;
pub mod gateway;
pub mod lcr;
pub mod registry;
pub mod rtp_relay;
pub mod sip_message;
pub mod timer;
pub mod transaction;
pub mod trunk;

pub use gateway::PbxGateway;
