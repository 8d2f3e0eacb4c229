//! Dial-Plan Router (§4.6).
//!
//! Evaluates a dialed number against an ordered set of real, compiled
//! regular expressions and returns the first matching routing decision.
//! Permission checks (e.g. `allow_external`) are applied before returning.

use regex::Regex;

use crate::config::DialplanConfig;
use crate::core::registry::ExtensionRegistry;
use crate::{Error, Result};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingDecision {
    ToExtension(String),
    ToVoicemail(String),
    ToConferenceRoom(String),
    ToParkSlot(String),
    ToPagingZone(String),
    ToTrunk { emergency: bool },
}

pub struct DialPlanRouter {
    internal: Regex,
    conference: Regex,
    voicemail: Regex,
    parking: Regex,
    paging_prefix: String,
    emergency_numbers: Vec<String>,
    registry: Arc<ExtensionRegistry>,
}

impl DialPlanRouter {
    pub fn new(config: &DialplanConfig, registry: Arc<ExtensionRegistry>) -> Result<Self> {
        Ok(Self {
            internal: Regex::new(&config.internal_pattern)
                .map_err(|e| Error::parse(format!("internal_pattern: {e}")))?,
            conference: Regex::new(&config.conference_pattern)
                .map_err(|e| Error::parse(format!("conference_pattern: {e}")))?,
            voicemail: Regex::new(&config.voicemail_pattern)
                .map_err(|e| Error::parse(format!("voicemail_pattern: {e}")))?,
            parking: Regex::new(&config.parking_pattern)
                .map_err(|e| Error::parse(format!("parking_pattern: {e}")))?,
            paging_prefix: config.paging_prefix.clone(),
            emergency_numbers: config.emergency_numbers.clone(),
            registry,
        })
    }

    /// Evaluates patterns in the fixed order laid out by the design:
    /// internal, conference, voicemail, parking, paging, emergency, then
    /// external (left to the caller to hand off to LCR/trunk selection).
    pub fn route(&self, from_ext: &str, dialed_number: &str) -> Result<RoutingDecision> {
        if self.internal.is_match(dialed_number) {
            if self.registry.is_registered(dialed_number) {
                return Ok(RoutingDecision::ToExtension(dialed_number.to_string()));
            }
            return Err(Error::not_registered(dialed_number));
        }

        if self.conference.is_match(dialed_number) {
            return Ok(RoutingDecision::ToConferenceRoom(dialed_number.to_string()));
        }

        if self.voicemail.is_match(dialed_number) {
            let mailbox = dialed_number.trim_start_matches('*').to_string();
            return Ok(RoutingDecision::ToVoicemail(mailbox));
        }

        if self.parking.is_match(dialed_number) {
            return Ok(RoutingDecision::ToParkSlot(dialed_number.to_string()));
        }

        if dialed_number.starts_with(&self.paging_prefix) && !self.paging_prefix.is_empty() {
            return Ok(RoutingDecision::ToPagingZone(dialed_number.to_string()));
        }

        if self.emergency_numbers.iter().any(|n| n == dialed_number) {
            return Ok(RoutingDecision::ToTrunk { emergency: true });
        }

        // External: permission check before handing off to trunk/LCR selection.
        if !self.registry.allow_external(from_ext) {
            return Err(Error::forbidden(format!(
                "{from_ext} is not permitted to dial external numbers"
            )));
        }

        Ok(RoutingDecision::ToTrunk { emergency: false })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExtensionConfig;

    fn router() -> DialPlanRouter {
        let config = DialplanConfig {
            internal_pattern: r"^1\d{3}$".to_string(),
            conference_pattern: r"^2\d{3}$".to_string(),
            voicemail_pattern: r"^\*\d{3}$".to_string(),
            parking_pattern: r"^70\d{2}$".to_string(),
            paging_prefix: "7".to_string(),
            emergency_numbers: vec!["911".to_string(), "112".to_string()],
        };
        let extensions = vec![
            ExtensionConfig {
                number: "1001".to_string(),
                name: "Alice".to_string(),
                password: "x".to_string(),
                voicemail_pin: None,
                email: None,
                allow_external: true,
                is_admin: false,
            },
            ExtensionConfig {
                number: "1002".to_string(),
                name: "Bob".to_string(),
                password: "x".to_string(),
                voicemail_pin: None,
                email: None,
                allow_external: false,
                is_admin: false,
            },
        ];
        let (registry, _rx) = ExtensionRegistry::new(&extensions);
        registry
            .register(
                "1002",
                crate::core::registry::ContactAddr {
                    addr: "10.0.0.12:5060".parse().unwrap(),
                    transport: "udp".to_string(),
                },
                std::time::Duration::from_secs(3600),
            )
            .unwrap();
        DialPlanRouter::new(&config, registry).unwrap()
    }

    #[test]
    fn test_internal_routes_to_registered_extension() {
        let r = router();
        assert_eq!(
            r.route("1001", "1002").unwrap(),
            RoutingDecision::ToExtension("1002".to_string())
        );
    }

    #[test]
    fn test_internal_unregistered_extension_errors() {
        let r = router();
        assert!(r.route("1001", "1003").is_err());
    }

    #[test]
    fn test_voicemail_pattern_strips_star() {
        let r = router();
        assert_eq!(
            r.route("1001", "*099").unwrap(),
            RoutingDecision::ToVoicemail("099".to_string())
        );
    }

    #[test]
    fn test_emergency_number_bypasses_permission_check() {
        let r = router();
        // 1002 has allow_external=false but emergency numbers must still route.
        assert_eq!(
            r.route("1002", "911").unwrap(),
            RoutingDecision::ToTrunk { emergency: true }
        );
    }

    #[test]
    fn test_external_denied_without_permission() {
        let r = router();
        assert!(r.route("1002", "5551234567").is_err());
    }

    #[test]
    fn test_external_allowed_with_permission() {
        let r = router();
        assert_eq!(
            r.route("1001", "5551234567").unwrap(),
            RoutingDecision::ToTrunk { emergency: false }
        );
    }

    #[test]
    fn test_parking_pattern_before_paging() {
        let r = router();
        // "7001" matches the parking pattern AND starts with the paging
        // prefix "7" -- parking, being evaluated first, must win.
        assert_eq!(
            r.route("1001", "7001").unwrap(),
            RoutingDecision::ToParkSlot("7001".to_string())
        );
    }

    #[test]
    fn test_substring_containment_is_not_a_match() {
        let r = router();
        // Contains "1002" as a substring but must not match the internal
        // pattern, which is anchored full-string, not a substring search.
        let decision = r.route("1001", "99991002").unwrap();
        assert_eq!(decision, RoutingDecision::ToTrunk { emergency: false });
    }
}
