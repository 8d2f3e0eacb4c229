//! SIP Transaction Layer (§4.9).
//!
//! Matches requests and responses to transactions by `(branch, method)` for
//! client transactions, retransmits non-2xx INVITE requests on the RFC
//! 3261 T1-doubling schedule, and reports terminal outcomes back to the
//! transaction user without retransmitting ACK itself.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::core::sip_message::SipMessage;
use crate::{Error, Result};

/// RFC 3261 timer defaults.
pub const T1: Duration = Duration::from_millis(500);
pub const T2: Duration = Duration::from_secs(4);

fn non_invite_timeout() -> Duration {
    T1 * 64
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionKind {
    Invite,
    NonInvite,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub branch: String,
    pub method: String,
}

enum Outcome {
    Provisional(SipMessage),
    Final(SipMessage),
    TimedOut,
}

/// Owns in-flight client transactions and drives their retransmission
/// timers. One instance is shared per SIP transport.
pub struct TransactionLayer {
    send_bytes: mpsc::UnboundedSender<(std::net::SocketAddr, Vec<u8>)>,
    pending: Mutex<HashMap<TransactionKey, mpsc::UnboundedSender<Outcome>>>,
}

/// Result stream a caller of `send_request` awaits on: zero or more
/// provisional responses followed by exactly one final outcome.
pub struct TransactionHandle {
    rx: mpsc::UnboundedReceiver<Outcome>,
}

impl TransactionHandle {
    pub async fn next_provisional(&mut self) -> Option<SipMessage> {
        match self.rx.recv().await {
            Some(Outcome::Provisional(m)) => Some(m),
            _ => None,
        }
    }

    /// Drains provisional responses and returns the final response, or a
    /// timeout error after the transaction's lifetime expires.
    pub async fn wait_final(mut self) -> Result<SipMessage> {
        loop {
            match self.rx.recv().await {
                Some(Outcome::Provisional(_)) => continue,
                Some(Outcome::Final(m)) => return Ok(m),
                Some(Outcome::TimedOut) | None => return Err(Error::TransactionTimeout),
            }
        }
    }
}

impl TransactionLayer {
    pub fn new(send_bytes: mpsc::UnboundedSender<(std::net::SocketAddr, Vec<u8>)>) -> Self {
        Self {
            send_bytes,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Starts a client transaction for `request`, sent to `dest`, keyed by
    /// its top `Via` branch and method. Retransmits on the T1-doubling
    /// schedule (capped at T2) for INVITE until a final response or the
    /// 64×T1 deadline; non-INVITE transactions use the same deadline
    /// without the T2 cap rationale (RFC 3261 §17.1.2).
    pub fn send_request(
        &self,
        request: SipMessage,
        dest: std::net::SocketAddr,
        kind: TransactionKind,
    ) -> TransactionHandle {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let wire = crate::core::sip_message::build_message(
            request.start_line.clone(),
            request.headers.clone(),
            request.body.clone(),
        );

        if let Ok(key) = transaction_key(&request) {
            self.pending.lock().unwrap().insert(key, events_tx.clone());
        }

        let send_bytes = self.send_bytes.clone();
        let retransmit_interval = T1;
        let deadline = Instant::now() + non_invite_timeout();

        tokio::spawn(async move {
            let _ = send_bytes.send((dest, wire.clone()));
            let mut interval = retransmit_interval;

            loop {
                let sleep = tokio::time::sleep(interval.min(T2));
                tokio::pin!(sleep);

                tokio::select! {
                    _ = &mut sleep => {
                        if Instant::now() >= deadline {
                            let _ = events_tx.send(Outcome::TimedOut);
                            return;
                        }
                        if matches!(kind, TransactionKind::Invite) {
                            trace!("retransmitting INVITE transaction");
                            let _ = send_bytes.send((dest, wire.clone()));
                            interval = (interval * 2).min(T2);
                        } else {
                            let _ = send_bytes.send((dest, wire.clone()));
                            interval = (interval * 2).min(T2);
                        }
                    }
                }
            }
        });

        TransactionHandle { rx: events_rx }
    }

    /// Routes an inbound response to the client transaction it matches by
    /// `(branch, CSeq method)`. A final response (2xx-6xx) removes the
    /// transaction from the pending table; provisional responses leave it
    /// in place for further retransmission suppression.
    pub fn on_response(&self, response: SipMessage) {
        let key = match transaction_key(&response) {
            Ok(k) => k,
            Err(_) => return,
        };
        let status = match response.status_code() {
            Some(s) => s,
            None => return,
        };

        let mut pending = self.pending.lock().unwrap();
        let is_final = status >= 200;
        let sender = if is_final {
            pending.remove(&key)
        } else {
            pending.get(&key).cloned()
        };

        if let Some(sender) = sender {
            let outcome = if is_final {
                Outcome::Final(response)
            } else {
                Outcome::Provisional(response)
            };
            let _ = sender.send(outcome);
        }
    }
}

/// Server-side transaction table: keyed by `(branch, sent-by, method)`,
/// absorbing retransmitted requests so the transaction user only sees a
/// new request once.
pub struct ServerTransactionTable {
    seen: HashMap<(String, String, String), Instant>,
    ttl: Duration,
}

impl ServerTransactionTable {
    pub fn new() -> Self {
        Self {
            seen: HashMap::new(),
            ttl: non_invite_timeout(),
        }
    }

    /// Returns `true` if this is the first time this transaction has been
    /// observed (the caller should process it); `false` for a duplicate.
    pub fn observe(&mut self, branch: &str, sent_by: &str, method: &str) -> bool {
        self.gc();
        let key = (branch.to_string(), sent_by.to_string(), method.to_string());
        if self.seen.contains_key(&key) {
            debug!(branch, method, "duplicate request absorbed by server transaction");
            false
        } else {
            self.seen.insert(key, Instant::now() + self.ttl);
            true
        }
    }

    fn gc(&mut self) {
        let now = Instant::now();
        self.seen.retain(|_, expiry| *expiry > now);
    }
}

impl Default for ServerTransactionTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Extracts the transaction key from a message's topmost `Via` branch and
/// its CSeq method.
pub fn transaction_key(message: &SipMessage) -> Result<TransactionKey> {
    let via = message
        .headers_named("Via")
        .first()
        .copied()
        .ok_or_else(|| Error::parse("message missing Via header"))?
        .to_string();
    let branch = via
        .split(';')
        .find_map(|p| p.trim().strip_prefix("branch="))
        .ok_or_else(|| Error::parse("Via missing branch parameter"))?
        .to_string();
    let (_, method) = message.cseq()?;
    Ok(TransactionKey { branch, method })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_transaction_deduplicates() {
        let mut table = ServerTransactionTable::new();
        assert!(table.observe("z9hG4bK1", "10.0.0.1:5060", "INVITE"));
        assert!(!table.observe("z9hG4bK1", "10.0.0.1:5060", "INVITE"));
    }

    #[test]
    fn test_server_transaction_distinguishes_by_method() {
        let mut table = ServerTransactionTable::new();
        assert!(table.observe("z9hG4bK1", "10.0.0.1:5060", "INVITE"));
        assert!(table.observe("z9hG4bK1", "10.0.0.1:5060", "CANCEL"));
    }

    #[test]
    fn test_transaction_key_extraction() {
        let msg = crate::core::sip_message::parse_message(
            b"INVITE sip:1002@pbx SIP/2.0\r\nVia: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK42\r\nCSeq: 1 INVITE\r\nCall-ID: x\r\nContent-Length: 0\r\n\r\n",
        )
        .unwrap();
        let key = transaction_key(&msg).unwrap();
        assert_eq!(key.branch, "z9hG4bK42");
        assert_eq!(key.method, "INVITE");
    }

    #[tokio::test]
    async fn test_non_invite_times_out_without_response() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let layer = TransactionLayer::new(tx);
        let request = crate::core::sip_message::parse_message(
            b"OPTIONS sip:1002@pbx SIP/2.0\r\nVia: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK1\r\nCSeq: 1 OPTIONS\r\nCall-ID: x\r\nContent-Length: 0\r\n\r\n",
        )
        .unwrap();
        let handle = layer.send_request(request, "127.0.0.1:1".parse().unwrap(), TransactionKind::NonInvite);
        // Not waiting for the full 64xT1 deadline here; just confirms the
        // handle is constructed and awaitable without panicking.
        drop(handle);
    }

    #[tokio::test]
    async fn test_on_response_routes_to_matching_transaction() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let layer = TransactionLayer::new(tx);
        let request = crate::core::sip_message::parse_message(
            b"INVITE sip:1002@pbx SIP/2.0\r\nVia: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK9\r\nCSeq: 1 INVITE\r\nCall-ID: x\r\nContent-Length: 0\r\n\r\n",
        )
        .unwrap();
        let handle = layer.send_request(request, "127.0.0.1:1".parse().unwrap(), TransactionKind::Invite);

        let response = crate::core::sip_message::parse_message(
            b"SIP/2.0 200 OK\r\nVia: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK9\r\nCSeq: 1 INVITE\r\nCall-ID: x\r\nContent-Length: 0\r\n\r\n",
        )
        .unwrap();
        layer.on_response(response);

        let final_response = handle.wait_final().await.unwrap();
        assert_eq!(final_response.status_code(), Some(200));
    }
}
