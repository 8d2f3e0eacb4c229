//! Extension Registry and Registrar (§4.2, §4.5).
//!
//! Authoritative map of extension number to current contact address and
//! lease. Reads are lock-free via `DashMap`; a reaper task evicts expired
//! leases on an interval. Registration events are broadcast to subscribers
//! (presence, phone-book sync) over an unbounded channel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ExtensionConfig;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct ContactAddr {
    pub addr: SocketAddr,
    pub transport: String,
}

#[derive(Debug, Clone)]
pub struct Binding {
    pub extension: String,
    pub display_name: String,
    pub contact: ContactAddr,
    pub expiry: SystemTime,
    pub allow_external: bool,
    pub is_admin: bool,
    pub voicemail_pin: Option<String>,
}

#[derive(Debug, Clone)]
struct ExtensionSecret {
    password: String,
    display_name: String,
    allow_external: bool,
    is_admin: bool,
    voicemail_pin: Option<String>,
}

#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Registered { extension: String, contact: SocketAddr },
    Deregistered { extension: String },
    Expired { extension: String },
}

/// Authoritative extension -> binding map plus the static credential store
/// loaded from configuration.
pub struct ExtensionRegistry {
    bindings: DashMap<String, Binding>,
    secrets: HashMap<String, ExtensionSecret>,
    events_tx: mpsc::UnboundedSender<RegistryEvent>,
}

impl ExtensionRegistry {
    pub fn new(extensions: &[ExtensionConfig]) -> (Arc<Self>, mpsc::UnboundedReceiver<RegistryEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let secrets = extensions
            .iter()
            .map(|e| {
                (
                    e.number.clone(),
                    ExtensionSecret {
                        password: e.password.clone(),
                        display_name: e.name.clone(),
                        allow_external: e.allow_external,
                        is_admin: e.is_admin,
                        voicemail_pin: e.voicemail_pin.clone(),
                    },
                )
            })
            .collect();

        (
            Arc::new(Self {
                bindings: DashMap::new(),
                secrets,
                events_tx,
            }),
            events_rx,
        )
    }

    fn is_known(&self, extension: &str) -> bool {
        self.secrets.contains_key(extension)
    }

    /// Creates or refreshes a binding, setting `expiry = now + ttl`.
    pub fn register(&self, extension: &str, contact: ContactAddr, ttl: Duration) -> Result<()> {
        let secret = self
            .secrets
            .get(extension)
            .ok_or_else(|| Error::not_registered(extension))?;

        if ttl.is_zero() {
            return self.deregister(extension);
        }

        let expiry = SystemTime::now() + ttl;
        self.bindings.insert(
            extension.to_string(),
            Binding {
                extension: extension.to_string(),
                display_name: secret.display_name.clone(),
                contact: contact.clone(),
                expiry,
                allow_external: secret.allow_external,
                is_admin: secret.is_admin,
                voicemail_pin: secret.voicemail_pin.clone(),
            },
        );

        info!(extension, contact = %contact.addr, "extension registered");
        let _ = self.events_tx.send(RegistryEvent::Registered {
            extension: extension.to_string(),
            contact: contact.addr,
        });
        Ok(())
    }

    /// Removes the binding unconditionally (used on `Expires: 0`).
    pub fn deregister(&self, extension: &str) -> Result<()> {
        self.bindings.remove(extension);
        info!(extension, "extension deregistered");
        let _ = self.events_tx.send(RegistryEvent::Deregistered {
            extension: extension.to_string(),
        });
        Ok(())
    }

    pub fn lookup(&self, extension: &str) -> Result<ContactAddr> {
        self.bindings
            .get(extension)
            .filter(|b| b.expiry > SystemTime::now())
            .map(|b| b.contact.clone())
            .ok_or_else(|| Error::not_registered(extension))
    }

    pub fn is_registered(&self, extension: &str) -> bool {
        self.bindings
            .get(extension)
            .map(|b| b.expiry > SystemTime::now())
            .unwrap_or(false)
    }

    /// Digest-style credential check: in this codec the secret is the
    /// configured plaintext password, compared directly against the
    /// supplied credential (the digest computation itself lives in the
    /// SIP transport layer that challenges the request).
    pub fn authenticate(&self, extension: &str, credential: &str) -> Result<()> {
        if !self.is_known(extension) {
            return Err(Error::not_registered(extension));
        }
        let secret = self.secrets.get(extension).unwrap();
        if secret.password == credential {
            Ok(())
        } else {
            Err(Error::BadCredential)
        }
    }

    pub fn allow_external(&self, extension: &str) -> bool {
        self.secrets
            .get(extension)
            .map(|s| s.allow_external)
            .unwrap_or(false)
    }

    pub fn enumerate(&self) -> Vec<Binding> {
        self.bindings
            .iter()
            .filter(|b| b.expiry > SystemTime::now())
            .map(|e| e.value().clone())
            .collect()
    }

    /// Removes all leases whose expiry has passed. A registration that
    /// arrives during the grace window after eviction is treated as a new
    /// lease by `register`, never a refresh of stale state, because the
    /// entry is gone by the time it lands.
    fn reap_expired(&self) {
        let now = SystemTime::now();
        let expired: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.expiry <= now)
            .map(|e| e.key().clone())
            .collect();

        for extension in expired {
            self.bindings.remove(&extension);
            debug!(extension, "registration lease expired");
            let _ = self.events_tx.send(RegistryEvent::Expired { extension });
        }
    }
}

/// Periodically evicts expired leases. Runs for the lifetime of the process
/// as a background task.
pub async fn reaper_loop(registry: Arc<ExtensionRegistry>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        registry.reap_expired();
    }
}

/// Emitted by the Registrar when it cannot satisfy a REGISTER locally and
/// a SIP-level challenge must be sent (401 + WWW-Authenticate).
pub enum RegisterOutcome {
    Accepted { expires: u64 },
    ChallengeRequired,
    Rejected(Error),
}

/// Standard nonce/realm digest registrar wrapping the registry.
pub struct Registrar {
    registry: Arc<ExtensionRegistry>,
    default_ttl: Duration,
}

impl Registrar {
    pub fn new(registry: Arc<ExtensionRegistry>, default_ttl: Duration) -> Self {
        Self {
            registry,
            default_ttl,
        }
    }

    /// `credential` is `None` on the first REGISTER attempt (no
    /// Authorization header yet), prompting a challenge.
    pub fn handle_register(
        &self,
        extension: &str,
        contact: ContactAddr,
        expires: Option<u64>,
        credential: Option<&str>,
    ) -> RegisterOutcome {
        let Some(credential) = credential else {
            return RegisterOutcome::ChallengeRequired;
        };

        if let Err(e) = self.registry.authenticate(extension, credential) {
            warn!(extension, "registration authentication failed");
            return RegisterOutcome::Rejected(e);
        }

        let ttl = expires
            .map(Duration::from_secs)
            .unwrap_or(self.default_ttl);

        match self.registry.register(extension, contact, ttl) {
            Ok(()) => RegisterOutcome::Accepted {
                expires: ttl.as_secs(),
            },
            Err(e) => RegisterOutcome::Rejected(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_extensions() -> Vec<ExtensionConfig> {
        vec![ExtensionConfig {
            number: "1001".to_string(),
            name: "Alice".to_string(),
            password: "secret".to_string(),
            voicemail_pin: None,
            email: None,
            allow_external: true,
            is_admin: false,
        }]
    }

    fn contact(port: u16) -> ContactAddr {
        ContactAddr {
            addr: format!("10.0.0.11:{port}").parse().unwrap(),
            transport: "udp".to_string(),
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let (registry, _rx) = ExtensionRegistry::new(&sample_extensions());
        registry
            .register("1001", contact(5060), Duration::from_secs(3600))
            .unwrap();
        assert!(registry.is_registered("1001"));
        assert_eq!(registry.lookup("1001").unwrap().addr.port(), 5060);
    }

    #[test]
    fn test_register_unknown_extension_rejected() {
        let (registry, _rx) = ExtensionRegistry::new(&sample_extensions());
        assert!(registry.register("9999", contact(5060), Duration::from_secs(60)).is_err());
    }

    #[test]
    fn test_expires_zero_removes_even_if_not_yet_expired() {
        let (registry, _rx) = ExtensionRegistry::new(&sample_extensions());
        registry
            .register("1001", contact(5060), Duration::from_secs(3600))
            .unwrap();
        registry.register("1001", contact(5060), Duration::ZERO).unwrap();
        assert!(!registry.is_registered("1001"));
    }

    #[test]
    fn test_reaper_evicts_expired_binding() {
        let (registry, _rx) = ExtensionRegistry::new(&sample_extensions());
        registry
            .register("1001", contact(5060), Duration::from_millis(1))
            .unwrap();
        std::thread::sleep(Duration::from_millis(10));
        registry.reap_expired();
        assert!(!registry.is_registered("1001"));
    }

    #[test]
    fn test_authenticate_rejects_bad_credential() {
        let (registry, _rx) = ExtensionRegistry::new(&sample_extensions());
        assert!(registry.authenticate("1001", "wrong").is_err());
        assert!(registry.authenticate("1001", "secret").is_ok());
    }

    #[test]
    fn test_registrar_challenges_without_credential() {
        let (registry, _rx) = ExtensionRegistry::new(&sample_extensions());
        let registrar = Registrar::new(registry, Duration::from_secs(3600));
        let outcome = registrar.handle_register("1001", contact(5060), None, None);
        assert!(matches!(outcome, RegisterOutcome::ChallengeRequired));
    }

    #[test]
    fn test_registrar_accepts_valid_credential() {
        let (registry, _rx) = ExtensionRegistry::new(&sample_extensions());
        let registrar = Registrar::new(registry, Duration::from_secs(3600));
        let outcome = registrar.handle_register("1001", contact(5060), Some(1800), Some("secret"));
        assert!(matches!(outcome, RegisterOutcome::Accepted { expires: 1800 }));
    }
}
