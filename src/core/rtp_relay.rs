//! RTP Relay (§4.3).
//!
//! Allocates even-numbered RTP/RTCP port pairs from a configured range,
//! binds UDP sockets, and forwards media bidirectionally between the two
//! legs of a call. Packets carrying the negotiated telephone-event payload
//! type are additionally diverted through the RFC 2833 pipeline before
//! being forwarded. Early packets (arriving before both endpoints are
//! known) are buffered up to 32 deep; stale activity trips a media-timeout
//! event back to the Call Manager.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::core::dtmf::Rfc2833Receiver;
use crate::{Error, Result};

const EARLY_BUFFER_CAPACITY: usize = 32;
const MEDIA_INACTIVITY: Duration = Duration::from_secs(30);
const PORT_COOLDOWN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub enum RelayEvent {
    MediaTimeout { call_id: String },
    Dtmf { call_id: String, digit: char, duration: u16 },
}

struct Endpoints {
    caller: Option<SocketAddr>,
    callee: Option<SocketAddr>,
    hold: bool,
}

struct EarlyBuffer {
    packets: VecDeque<Vec<u8>>,
}

impl EarlyBuffer {
    fn new() -> Self {
        Self {
            packets: VecDeque::with_capacity(EARLY_BUFFER_CAPACITY),
        }
    }

    fn push(&mut self, packet: Vec<u8>) {
        if self.packets.len() >= EARLY_BUFFER_CAPACITY {
            self.packets.pop_front();
        }
        self.packets.push_back(packet);
    }

    fn drain(&mut self) -> Vec<Vec<u8>> {
        self.packets.drain(..).collect()
    }
}

struct Slot {
    call_id: String,
    socket: Arc<UdpSocket>,
    rtcp_socket: Arc<UdpSocket>,
    endpoints: RwLock<Endpoints>,
    early_caller: Mutex<EarlyBuffer>,
    early_callee: Mutex<EarlyBuffer>,
    dtmf_payload_type: u8,
    dtmf_receiver: Mutex<Rfc2833Receiver>,
    last_activity: Mutex<Instant>,
    recorder: RwLock<Option<SocketAddr>>,
}

/// Allocates and tears down RTP relay slots, and drives the per-slot
/// forwarder tasks.
pub struct RtpRelay {
    range_start: u16,
    range_end: u16,
    bind_ip: std::net::IpAddr,
    next_port: Mutex<u16>,
    cooling_down: Mutex<HashMap<u16, Instant>>,
    slots: RwLock<HashMap<String, Arc<Slot>>>,
    events: mpsc::UnboundedSender<RelayEvent>,
}

impl RtpRelay {
    pub fn new(
        bind_ip: std::net::IpAddr,
        range_start: u16,
        range_end: u16,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<RelayEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                range_start,
                range_end,
                bind_ip,
                next_port: Mutex::new(range_start),
                cooling_down: Mutex::new(HashMap::new()),
                slots: RwLock::new(HashMap::new()),
                events,
            }),
            events_rx,
        )
    }

    /// Picks the next free even port via round-robin scan, binds the RTP
    /// and RTCP sockets, and starts the forwarder tasks for `call_id`.
    pub async fn allocate(self: &Arc<Self>, call_id: &str, dtmf_payload_type: u8) -> Result<(u16, u16)> {
        let port = self.find_free_port().await?;

        let rtp_addr = SocketAddr::new(self.bind_ip, port);
        let rtcp_addr = SocketAddr::new(self.bind_ip, port + 1);
        let socket = Arc::new(UdpSocket::bind(rtp_addr).await?);
        let rtcp_socket = Arc::new(UdpSocket::bind(rtcp_addr).await?);

        let slot = Arc::new(Slot {
            call_id: call_id.to_string(),
            socket: socket.clone(),
            rtcp_socket: rtcp_socket.clone(),
            endpoints: RwLock::new(Endpoints {
                caller: None,
                callee: None,
                hold: false,
            }),
            early_caller: Mutex::new(EarlyBuffer::new()),
            early_callee: Mutex::new(EarlyBuffer::new()),
            dtmf_payload_type,
            dtmf_receiver: Mutex::new(Rfc2833Receiver::new()),
            last_activity: Mutex::new(Instant::now()),
            recorder: RwLock::new(None),
        });

        self.slots
            .write()
            .await
            .insert(call_id.to_string(), slot.clone());

        tokio::spawn(forwarder_loop(slot, self.events.clone()));
        tokio::spawn(inactivity_watchdog(call_id.to_string(), self.clone()));

        info!(call_id, port, "rtp relay slot allocated");
        Ok((port, port + 1))
    }

    async fn find_free_port(&self) -> Result<u16> {
        let span = (self.range_end - self.range_start) / 2 + 1;
        let mut next = self.next_port.lock().await;
        let mut cooling = self.cooling_down.lock().await;
        let slots = self.slots.read().await;

        cooling.retain(|_, released_at| released_at.elapsed() < PORT_COOLDOWN);

        for _ in 0..span {
            let candidate = *next;
            *next = if candidate + 2 > self.range_end {
                self.range_start
            } else {
                candidate + 2
            };

            if !cooling.contains_key(&candidate) && !port_in_use(&slots, candidate) {
                return Ok(candidate);
            }
        }

        Err(Error::PoolExhausted)
    }

    /// Sets both leg endpoints atomically once SDP negotiation completes on
    /// both sides.
    pub async fn set_endpoints(&self, call_id: &str, caller: SocketAddr, callee: SocketAddr) -> Result<()> {
        let slots = self.slots.read().await;
        let slot = slots
            .get(call_id)
            .ok_or_else(|| Error::invalid_state("no relay slot for call"))?;

        let mut endpoints = slot.endpoints.write().await;
        endpoints.caller = Some(caller);
        endpoints.callee = Some(callee);
        drop(endpoints);

        for (buffer, dest) in [(&slot.early_caller, callee), (&slot.early_callee, caller)] {
            let mut buffer = buffer.lock().await;
            for packet in buffer.drain() {
                let _ = slot.socket.send_to(&packet, dest).await;
            }
        }

        debug!(call_id, %caller, %callee, "relay endpoints set");
        Ok(())
    }

    pub async fn set_hold(&self, call_id: &str, hold: bool) -> Result<()> {
        let slots = self.slots.read().await;
        let slot = slots
            .get(call_id)
            .ok_or_else(|| Error::invalid_state("no relay slot for call"))?;
        slot.endpoints.write().await.hold = hold;
        Ok(())
    }

    /// Returns the RTP port this call's slot is bound to, so callers that
    /// build SDP offers/answers (the gateway) don't need to track it
    /// themselves.
    pub async fn local_port(&self, call_id: &str) -> Result<u16> {
        let slots = self.slots.read().await;
        let slot = slots
            .get(call_id)
            .ok_or_else(|| Error::invalid_state("no relay slot for call"))?;
        Ok(slot.socket.local_addr()?.port())
    }

    pub async fn attach_recorder(&self, call_id: &str, sink: SocketAddr) -> Result<()> {
        let slots = self.slots.read().await;
        let slot = slots
            .get(call_id)
            .ok_or_else(|| Error::invalid_state("no relay slot for call"))?;
        *slot.recorder.write().await = Some(sink);
        Ok(())
    }

    pub async fn detach_recorder(&self, call_id: &str) -> Result<()> {
        let slots = self.slots.read().await;
        let slot = slots
            .get(call_id)
            .ok_or_else(|| Error::invalid_state("no relay slot for call"))?;
        *slot.recorder.write().await = None;
        Ok(())
    }

    /// Closes the sockets and frees the port pair, starting its 5 s
    /// cool-down before it can be reallocated.
    pub async fn release(&self, call_id: &str) -> Result<()> {
        let mut slots = self.slots.write().await;
        if let Some(slot) = slots.remove(call_id) {
            let port = slot.socket.local_addr()?.port();
            self.cooling_down.lock().await.insert(port, Instant::now());
            info!(call_id, port, "rtp relay slot released");
        }
        Ok(())
    }

    async fn touch_activity(&self, call_id: &str) {
        let slots = self.slots.read().await;
        if let Some(slot) = slots.get(call_id) {
            *slot.last_activity.lock().await = Instant::now();
        }
    }
}

fn port_in_use(slots: &HashMap<String, Arc<Slot>>, port: u16) -> bool {
    slots
        .values()
        .any(|s| s.socket.local_addr().map(|a| a.port()) == Ok(port))
}

async fn forwarder_loop(slot: Arc<Slot>, events: mpsc::UnboundedSender<RelayEvent>) {
    let mut buf = [0u8; 2048];
    loop {
        let (len, from) = match slot.socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(_) => return,
        };
        let packet = buf[..len].to_vec();
        *slot.last_activity.lock().await = Instant::now();

        let endpoints = slot.endpoints.read().await;
        let (caller, callee, hold) = (endpoints.caller, endpoints.callee, endpoints.hold);
        drop(endpoints);

        if hold {
            continue;
        }

        let is_from_caller = caller == Some(from);
        let is_from_callee = callee == Some(from);

        if len >= 12 {
            let payload_type = packet[1] & 0x7f;
            if payload_type == slot.dtmf_payload_type && len >= 16 {
                let seq = u16::from_be_bytes([packet[2], packet[3]]);
                let mut receiver = slot.dtmf_receiver.lock().await;
                if let Ok(Some(notification)) = receiver.on_packet(seq, &packet[12..]) {
                    let _ = events.send(RelayEvent::Dtmf {
                        call_id: slot.call_id.clone(),
                        digit: notification.digit,
                        duration: notification.duration,
                    });
                }
            }
        }

        if let Some(recorder) = *slot.recorder.read().await {
            let _ = slot.socket.send_to(&packet, recorder).await;
        }

        match (is_from_caller, is_from_callee, caller, callee) {
            (true, _, _, Some(callee)) => {
                let _ = slot.socket.send_to(&packet, callee).await;
            }
            (_, true, Some(caller), _) => {
                let _ = slot.socket.send_to(&packet, caller).await;
            }
            _ => {
                // Endpoint for this direction not yet known: buffer.
                let buffer = if callee.is_none() {
                    &slot.early_callee
                } else {
                    &slot.early_caller
                };
                buffer.lock().await.push(packet);
            }
        }
    }
}

async fn inactivity_watchdog(call_id: String, relay: Arc<RtpRelay>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    loop {
        ticker.tick().await;
        let slots = relay.slots.read().await;
        let Some(slot) = slots.get(&call_id) else {
            return;
        };
        let idle = slot.last_activity.lock().await.elapsed();
        if idle >= MEDIA_INACTIVITY {
            warn!(call_id, "media inactivity timeout");
            let _ = relay.events.send(RelayEvent::MediaTimeout {
                call_id: call_id.clone(),
            });
            return;
        }
    }
}

// kept for callers that only need to refresh activity without a full packet.
impl RtpRelay {
    pub async fn note_activity(&self, call_id: &str) {
        self.touch_activity(call_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allocate_returns_even_port_pair() {
        let (relay, _rx) = RtpRelay::new("127.0.0.1".parse().unwrap(), 20000, 20010);
        let (rtp, rtcp) = relay.allocate("call-1", 101).await.unwrap();
        assert_eq!(rtp % 2, 0);
        assert_eq!(rtcp, rtp + 1);
    }

    #[tokio::test]
    async fn test_pool_exhaustion_with_two_port_range() {
        let (relay, _rx) = RtpRelay::new("127.0.0.1".parse().unwrap(), 20100, 20101);
        relay.allocate("call-a", 101).await.unwrap();
        let result = relay.allocate("call-b", 101).await;
        assert!(matches!(result, Err(Error::PoolExhausted)));
    }

    #[tokio::test]
    async fn test_release_frees_port_after_cooldown_window_recorded() {
        let (relay, _rx) = RtpRelay::new("127.0.0.1".parse().unwrap(), 20200, 20201);
        relay.allocate("call-a", 101).await.unwrap();
        relay.release("call-a").await.unwrap();
        // Immediately after release the port is in its cool-down window.
        let result = relay.allocate("call-b", 101).await;
        assert!(matches!(result, Err(Error::PoolExhausted)));
    }

    #[tokio::test]
    async fn test_set_endpoints_requires_existing_slot() {
        let (relay, _rx) = RtpRelay::new("127.0.0.1".parse().unwrap(), 20300, 20310);
        let result = relay
            .set_endpoints("missing-call", "127.0.0.1:1".parse().unwrap(), "127.0.0.1:2".parse().unwrap())
            .await;
        assert!(result.is_err());
    }
}
