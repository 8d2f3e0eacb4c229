//! Trunk Subsystem + DNS-SRV Failover (§4.10).
//!
//! Each trunk resolves its upstream domain via DNS SRV records, grouped by
//! priority tier. Within a tier, selection is a weighted-random cumulative
//! walk per RFC 2782; a tier whose total weight is zero falls back to a
//! uniform choice. Consecutive failures mark a record unavailable; a
//! successful probe resets it.

use std::collections::HashMap;
use std::sync::Mutex;

use rand::Rng;
use tracing::{info, warn};

use crate::config::TrunkEntry;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct SrvRecord {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub target: String,
    pub available: bool,
    pub failure_count: u32,
}

impl SrvRecord {
    pub fn new(priority: u16, weight: u16, port: u16, target: impl Into<String>) -> Self {
        Self {
            priority,
            weight,
            port,
            target: target.into(),
            available: true,
            failure_count: 0,
        }
    }
}

/// A resolved SRV lookup cached by service name, containing only
/// non-empty results.
struct CachedLookup {
    records: Vec<SrvRecord>,
}

pub struct DnsSrvResolver {
    cache: Mutex<HashMap<String, CachedLookup>>,
    max_failures: u32,
}

impl DnsSrvResolver {
    pub fn new(max_failures: u32) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            max_failures,
        }
    }

    /// Primes the cache with a resolved record set. Real DNS resolution is
    /// performed by the caller (e.g. via `trust-dns-resolver` at the
    /// transport edge); this module owns tier/weight selection and the
    /// failure bookkeeping, which is the part the core must get right.
    pub fn prime(&self, service_name: &str, records: Vec<SrvRecord>) {
        if records.is_empty() {
            return;
        }
        self.cache.lock().unwrap().insert(
            service_name.to_string(),
            CachedLookup { records },
        );
    }

    /// Selects the best available target for `service_name`: lowest
    /// priority tier with at least one available record, weighted-random
    /// within that tier.
    pub fn select(&self, service_name: &str) -> Result<(String, u16)> {
        let cache = self.cache.lock().unwrap();
        let lookup = cache
            .get(service_name)
            .ok_or_else(|| Error::no_route(service_name))?;

        let min_priority = lookup
            .records
            .iter()
            .filter(|r| r.available)
            .map(|r| r.priority)
            .min()
            .ok_or_else(|| Error::no_route(service_name))?;

        let tier: Vec<&SrvRecord> = lookup
            .records
            .iter()
            .filter(|r| r.available && r.priority == min_priority)
            .collect();

        let total_weight: u32 = tier.iter().map(|r| r.weight as u32).sum();

        let chosen = if total_weight == 0 {
            let idx = rand::thread_rng().gen_range(0..tier.len());
            tier[idx]
        } else {
            let draw = rand::thread_rng().gen_range(0..=total_weight);
            let mut cumulative = 0u32;
            let mut picked = tier[0];
            for record in &tier {
                cumulative += record.weight as u32;
                if draw <= cumulative {
                    picked = record;
                    break;
                }
            }
            picked
        };

        Ok((chosen.target.clone(), chosen.port))
    }

    /// Records a failed attempt against `target`; marks it unavailable at
    /// `max_failures`.
    pub fn report_failure(&self, service_name: &str, target: &str) {
        let mut cache = self.cache.lock().unwrap();
        if let Some(lookup) = cache.get_mut(service_name) {
            for record in lookup.records.iter_mut().filter(|r| r.target == target) {
                record.failure_count += 1;
                if record.failure_count >= self.max_failures {
                    record.available = false;
                    warn!(service_name, target, "SRV record marked unavailable after repeated failures");
                }
            }
        }
    }

    /// Records a successful probe: resets the failure count and restores
    /// availability.
    pub fn report_success(&self, service_name: &str, target: &str) {
        let mut cache = self.cache.lock().unwrap();
        if let Some(lookup) = cache.get_mut(service_name) {
            for record in lookup.records.iter_mut().filter(|r| r.target == target) {
                if !record.available || record.failure_count > 0 {
                    info!(service_name, target, "SRV record recovered");
                }
                record.failure_count = 0;
                record.available = true;
            }
        }
    }
}

/// Outbound trunk registered to an upstream carrier.
pub struct Trunk {
    pub id: String,
    pub domain: String,
    pub entry: TrunkEntry,
}

pub struct TrunkRegistry {
    trunks: Vec<Trunk>,
    resolver: DnsSrvResolver,
}

impl TrunkRegistry {
    pub fn new(entries: &[TrunkEntry], max_failures: u32) -> Self {
        let trunks = entries
            .iter()
            .map(|e| Trunk {
                id: e.id.clone(),
                domain: e.domain.clone(),
                entry: e.clone(),
            })
            .collect();
        Self {
            trunks,
            resolver: DnsSrvResolver::new(max_failures),
        }
    }

    pub fn trunk(&self, id: &str) -> Option<&Trunk> {
        self.trunks.iter().find(|t| t.id == id)
    }

    pub fn trunks(&self) -> &[Trunk] {
        &self.trunks
    }

    pub fn default_trunk(&self) -> Option<&Trunk> {
        self.trunks.first()
    }

    pub fn resolver(&self) -> &DnsSrvResolver {
        &self.resolver
    }

    fn srv_name(domain: &str, transport: &str) -> String {
        format!("_sip._{transport}.{domain}")
    }

    pub fn service_name_for(&self, trunk: &Trunk) -> String {
        let transport = match trunk.entry.transport {
            crate::config::SipTransport::Tcp => "tcp",
            crate::config::SipTransport::Tls => "tls",
            crate::config::SipTransport::Udp => "udp",
        };
        Self::srv_name(&trunk.domain, transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weighted_selection_prefers_lowest_priority_tier() {
        let resolver = DnsSrvResolver::new(3);
        resolver.prime(
            "_sip._udp.sip.carrier.com",
            vec![
                SrvRecord::new(10, 60, 5060, "primary.carrier.com"),
                SrvRecord::new(20, 40, 5060, "backup.carrier.com"),
            ],
        );

        for _ in 0..20 {
            let (target, _) = resolver.select("_sip._udp.sip.carrier.com").unwrap();
            assert_eq!(target, "primary.carrier.com");
        }
    }

    #[test]
    fn test_failover_after_max_failures() {
        let resolver = DnsSrvResolver::new(3);
        resolver.prime(
            "_sip._udp.sip.carrier.com",
            vec![
                SrvRecord::new(10, 60, 5060, "primary.carrier.com"),
                SrvRecord::new(20, 40, 5060, "backup.carrier.com"),
            ],
        );

        for _ in 0..3 {
            resolver.report_failure("_sip._udp.sip.carrier.com", "primary.carrier.com");
        }

        let (target, _) = resolver.select("_sip._udp.sip.carrier.com").unwrap();
        assert_eq!(target, "backup.carrier.com");
    }

    #[test]
    fn test_recovery_resets_failure_count_and_restores_preference() {
        let resolver = DnsSrvResolver::new(3);
        resolver.prime(
            "_sip._udp.sip.carrier.com",
            vec![
                SrvRecord::new(10, 60, 5060, "primary.carrier.com"),
                SrvRecord::new(20, 40, 5060, "backup.carrier.com"),
            ],
        );

        for _ in 0..3 {
            resolver.report_failure("_sip._udp.sip.carrier.com", "primary.carrier.com");
        }
        resolver.report_success("_sip._udp.sip.carrier.com", "primary.carrier.com");

        let (target, _) = resolver.select("_sip._udp.sip.carrier.com").unwrap();
        assert_eq!(target, "primary.carrier.com");
    }

    #[test]
    fn test_zero_weight_tier_falls_back_to_uniform_choice() {
        let resolver = DnsSrvResolver::new(3);
        resolver.prime(
            "_sip._udp.zero.example.com",
            vec![
                SrvRecord::new(10, 0, 5060, "a.example.com"),
                SrvRecord::new(10, 0, 5060, "b.example.com"),
            ],
        );
        let (target, _) = resolver.select("_sip._udp.zero.example.com").unwrap();
        assert!(target == "a.example.com" || target == "b.example.com");
    }

    #[test]
    fn test_empty_lookup_never_cached() {
        let resolver = DnsSrvResolver::new(3);
        resolver.prime("_sip._udp.empty.example.com", vec![]);
        assert!(resolver.select("_sip._udp.empty.example.com").is_err());
    }
}
