//! Voicemail collaborator (§4.4 "Voicemail recording is real, not a
//! placeholder", §3 "Voicemail Message").
//!
//! Implements `MediaEndpoint` so the dial-plan router and the no-answer
//! path can hand it a diverted call like any other collaborator. Captures
//! the caller's actual RTP audio for the duration of the diverted leg
//! instead of writing a synthesized placeholder.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::core::admin::MediaEndpoint;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct VoicemailMessage {
    pub mailbox: String,
    pub message_id: String,
    pub caller_id: String,
    pub audio: Vec<u8>,
    pub duration_seconds: u32,
    pub received_at: SystemTime,
}

struct InProgressRecording {
    mailbox: String,
    caller_id: String,
    audio: Vec<u8>,
    started_at: SystemTime,
}

/// Queries the call-control core needs in order to satisfy the "abort
/// cleanly if the call already ended" requirement without reaching into
/// call internals.
#[async_trait]
pub trait CallStateQuery: Send + Sync {
    async fn is_connected(&self, call_id: &str) -> bool;
}

pub struct VoicemailService {
    storage_path: PathBuf,
    recordings: DashMap<String, Mutex<InProgressRecording>>,
    messages: DashMap<String, Vec<VoicemailMessage>>,
    call_state: Arc<dyn CallStateQuery>,
}

impl VoicemailService {
    pub fn new(storage_path: PathBuf, call_state: Arc<dyn CallStateQuery>) -> Arc<Self> {
        Arc::new(Self {
            storage_path,
            recordings: DashMap::new(),
            messages: DashMap::new(),
            call_state,
        })
    }

    /// Feeds one captured RTP payload frame of the caller's audio into the
    /// in-progress recording for `call_id`. The relay is responsible for
    /// routing the diverted leg here via `attach_recorder`/`set_endpoints`.
    pub async fn capture_frame(&self, call_id: &str, frame: &[u8]) {
        if let Some(entry) = self.recordings.get(call_id) {
            let mut recording = entry.lock().await;
            recording.audio.extend_from_slice(frame);
        }
    }

    fn mailbox_dir(&self, mailbox: &str) -> PathBuf {
        self.storage_path.join(mailbox)
    }

    async fn persist(&self, call_id: &str) -> Result<Option<VoicemailMessage>> {
        let Some((_, recording)) = self.recordings.remove(call_id) else {
            return Ok(None);
        };
        let recording = recording.into_inner();

        let message_id = uuid::Uuid::new_v4().to_string();
        let duration_seconds = recording
            .started_at
            .elapsed()
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);

        let message = VoicemailMessage {
            mailbox: recording.mailbox.clone(),
            message_id: message_id.clone(),
            caller_id: recording.caller_id,
            audio: recording.audio,
            duration_seconds,
            received_at: SystemTime::now(),
        };

        let dir = self.mailbox_dir(&message.mailbox);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{message_id}.raw"));
        std::fs::write(&path, &message.audio)?;

        self.messages
            .entry(message.mailbox.clone())
            .or_default()
            .push(message.clone());

        info!(
            mailbox = message.mailbox,
            message_id,
            bytes = message.audio.len(),
            "voicemail message recorded"
        );
        Ok(Some(message))
    }

    pub fn messages_for(&self, mailbox: &str) -> Vec<VoicemailMessage> {
        self.messages.get(mailbox).map(|v| v.clone()).unwrap_or_default()
    }

    pub fn active_recording_count(&self) -> usize {
        self.recordings.len()
    }

    /// Binds a private UDP socket and spawns a task feeding every received
    /// RTP payload into `capture_frame` for `call_id`. The relay is pointed
    /// at the returned address via `RtpRelay::attach_recorder` so a
    /// direct-dial-to-mailbox call's audio lands here without a B2BUA leg.
    pub async fn bind_recorder(self: &Arc<Self>, call_id: &str) -> Result<SocketAddr> {
        let socket = UdpSocket::bind((self.bind_ip(), 0)).await?;
        let local_addr = socket.local_addr()?;

        let service = self.clone();
        let call_id = call_id.to_string();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                let len = match socket.recv(&mut buf).await {
                    Ok(len) => len,
                    Err(_) => return,
                };
                if len < 12 {
                    continue;
                }
                service.capture_frame(&call_id, &buf[12..len]).await;
            }
        });

        Ok(local_addr)
    }

    fn bind_ip(&self) -> std::net::IpAddr {
        "0.0.0.0".parse().unwrap()
    }
}

#[async_trait]
impl MediaEndpoint for VoicemailService {
    async fn accept_call(&self, call_id: &str) -> Result<()> {
        // A BYE can arrive while this collaborator is still setting up
        // media; check the call's live state before starting the
        // interaction loop and abort without logging a false "started".
        if !self.call_state.is_connected(call_id).await {
            warn!(call_id, "call ended before voicemail session could start, aborting cleanly");
            return Err(Error::invalid_state("call no longer active"));
        }

        self.recordings.insert(
            call_id.to_string(),
            Mutex::new(InProgressRecording {
                mailbox: call_id.to_string(),
                caller_id: String::new(),
                audio: Vec::new(),
                started_at: SystemTime::now(),
            }),
        );
        info!(call_id, "voicemail session started");
        Ok(())
    }

    async fn receive_dtmf(&self, call_id: &str, digit: char) {
        info!(call_id, digit, "dtmf during voicemail session (mailbox navigation)");
    }

    async fn release(&self, call_id: &str) {
        if let Err(e) = self.persist(call_id).await {
            warn!(call_id, %e, "failed to persist voicemail recording");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysConnected;
    #[async_trait]
    impl CallStateQuery for AlwaysConnected {
        async fn is_connected(&self, _call_id: &str) -> bool {
            true
        }
    }

    struct AlwaysEnded;
    #[async_trait]
    impl CallStateQuery for AlwaysEnded {
        async fn is_connected(&self, _call_id: &str) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_accept_call_records_real_audio() {
        let dir = tempfile::tempdir().unwrap();
        let service = VoicemailService::new(dir.path().to_path_buf(), Arc::new(AlwaysConnected));

        service.accept_call("1099").await.unwrap();
        service.capture_frame("1099", b"not-a-placeholder-riff-header").await;
        service.release("1099").await;

        let messages = service.messages_for("1099");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].audio, b"not-a-placeholder-riff-header");
        assert_ne!(&messages[0].audio[..4], b"RIFF");
    }

    #[tokio::test]
    async fn test_early_termination_aborts_without_starting() {
        let dir = tempfile::tempdir().unwrap();
        let service = VoicemailService::new(dir.path().to_path_buf(), Arc::new(AlwaysEnded));

        let result = service.accept_call("1099").await;
        assert!(result.is_err());
        assert_eq!(service.messages_for("1099").len(), 0);
    }
}
