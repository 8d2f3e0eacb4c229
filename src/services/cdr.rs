//! Call Detail Record persistence and billing (§3 "Call Detail Record",
//! §4.11's billing-rate arithmetic).
//!
//! The core hands off a finished call's summary once; everything past that
//! — storage, billing-rate lookup, aggregation — belongs to this
//! collaborator. The core holds no CDR state past the hand-off.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RouteType {
    Internal,
    Conference,
    Voicemail,
    Trunk,
    Emergency,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallDetailRecord {
    pub id: String,
    pub call_id: String,
    pub caller: String,
    pub callee: String,
    pub route_type: RouteType,
    pub start_time: DateTime<Utc>,
    pub answer_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: u64,
    pub billable_duration_seconds: u64,
    pub disconnect_reason: Option<DisconnectReason>,
    pub quality_metrics: QualityMetrics,
    pub billing_info: BillingInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DisconnectReason {
    Normal,
    Busy,
    NoAnswer,
    Rejected,
    NetworkError,
    MediaInactivity,
    SystemError,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub rtp_packets_sent: u64,
    pub rtp_packets_received: u64,
    pub rtp_bytes_sent: u64,
    pub rtp_bytes_received: u64,
    pub packet_loss_rate: f32,
    pub jitter_ms: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingInfo {
    pub rate_per_minute: f64,
    pub currency: String,
    pub cost: f64,
    pub billing_increment_seconds: u32,
    pub minimum_charge_seconds: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingRate {
    pub id: String,
    pub prefix: String,
    pub rate_per_minute: f64,
    pub currency: String,
    pub billing_increment: u32,
    pub minimum_charge: u32,
}

#[derive(Debug, Clone)]
pub enum CdrEvent {
    CallStarted { cdr_id: String, call_id: String },
    CallEnded { cdr_id: String, duration: Duration, cost: f64 },
    RateNotFound { called_number: String },
    Error { cdr_id: Option<String>, message: String },
}

#[async_trait::async_trait]
pub trait CdrStorage: Send + Sync {
    async fn store_cdr(&self, cdr: &CallDetailRecord) -> Result<()>;
    async fn get_cdr(&self, cdr_id: &str) -> Result<Option<CallDetailRecord>>;
    async fn query_cdrs(
        &self,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<Vec<CallDetailRecord>>;
}

/// Append-only JSONL file storage with size-based rotation.
pub struct FileCdrStorage {
    base_path: PathBuf,
    rotation_size_mb: u64,
    current_file: Arc<RwLock<Option<std::fs::File>>>,
    current_file_size: Arc<RwLock<u64>>,
}

impl FileCdrStorage {
    pub fn new(base_path: PathBuf, rotation_size_mb: u64) -> Self {
        Self {
            base_path,
            rotation_size_mb,
            current_file: Arc::new(RwLock::new(None)),
            current_file_size: Arc::new(RwLock::new(0)),
        }
    }

    async fn get_current_file(&self) -> Result<()> {
        let needs_new_file = {
            let size = self.current_file_size.read().await;
            let file = self.current_file.read().await;
            file.is_none() || *size >= self.rotation_size_mb * 1024 * 1024
        };

        if needs_new_file {
            std::fs::create_dir_all(&self.base_path)?;
            let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
            let path = self.base_path.join(format!("cdr_{timestamp}.jsonl"));
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            *self.current_file.write().await = Some(file);
            *self.current_file_size.write().await = 0;
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl CdrStorage for FileCdrStorage {
    async fn store_cdr(&self, cdr: &CallDetailRecord) -> Result<()> {
        self.get_current_file().await?;

        let line = serde_json::to_string(cdr)?;
        let bytes_written = line.len() as u64 + 1;

        let mut file_guard = self.current_file.write().await;
        if let Some(file) = file_guard.as_mut() {
            writeln!(file, "{line}")?;
        }
        drop(file_guard);

        *self.current_file_size.write().await += bytes_written;
        Ok(())
    }

    async fn get_cdr(&self, cdr_id: &str) -> Result<Option<CallDetailRecord>> {
        for entry in std::fs::read_dir(&self.base_path)? {
            let path = entry?.path();
            let contents = std::fs::read_to_string(&path)?;
            for line in contents.lines() {
                if let Ok(cdr) = serde_json::from_str::<CallDetailRecord>(line) {
                    if cdr.id == cdr_id {
                        return Ok(Some(cdr));
                    }
                }
            }
        }
        Ok(None)
    }

    async fn query_cdrs(
        &self,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<Vec<CallDetailRecord>> {
        let mut results = Vec::new();
        if !self.base_path.exists() {
            return Ok(results);
        }
        for entry in std::fs::read_dir(&self.base_path)? {
            let path = entry?.path();
            let contents = std::fs::read_to_string(&path)?;
            for line in contents.lines() {
                if let Ok(cdr) = serde_json::from_str::<CallDetailRecord>(line) {
                    if cdr.start_time >= start_time && cdr.start_time <= end_time {
                        results.push(cdr);
                    }
                }
            }
        }
        Ok(results)
    }
}

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub default_rate_per_minute: f64,
    pub default_currency: String,
    pub default_billing_increment: u32,
    pub default_minimum_charge: u32,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            default_rate_per_minute: 0.10,
            default_currency: "USD".to_string(),
            default_billing_increment: 60,
            default_minimum_charge: 60,
        }
    }
}

pub struct CdrService {
    active_cdrs: Arc<DashMap<String, CallDetailRecord>>,
    billing_rates: Arc<RwLock<Vec<BillingRate>>>,
    storage: Arc<dyn CdrStorage>,
    event_tx: mpsc::UnboundedSender<CdrEvent>,
    default_billing_config: BillingConfig,
}

impl CdrService {
    pub fn new(storage: Arc<dyn CdrStorage>, billing_config: BillingConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<CdrEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let service = Arc::new(Self {
            active_cdrs: Arc::new(DashMap::new()),
            billing_rates: Arc::new(RwLock::new(Vec::new())),
            storage,
            event_tx,
            default_billing_config: billing_config,
        });
        service.clone().spawn_finalizer();
        (service, event_rx)
    }

    #[cfg(test)]
    pub fn new_for_test(dir: &Path) -> Arc<Self> {
        let storage = Arc::new(FileCdrStorage::new(dir.to_path_buf(), 100));
        Self::new(storage, BillingConfig::default()).0
    }

    fn spawn_finalizer(self: Arc<Self>) {
        tokio::spawn(async move {
            cdr_finalizer_loop(self.active_cdrs.clone(), self.storage.clone()).await;
        });
    }

    pub async fn start_call_record(&self, call_id: &str, caller: &str, callee: &str, route_type: RouteType) -> String {
        let cdr_id = Uuid::new_v4().to_string();
        let billing_info = self.calculate_billing_info(callee).await;

        let cdr = CallDetailRecord {
            id: cdr_id.clone(),
            call_id: call_id.to_string(),
            caller: caller.to_string(),
            callee: callee.to_string(),
            route_type,
            start_time: Utc::now(),
            answer_time: None,
            end_time: None,
            duration_seconds: 0,
            billable_duration_seconds: 0,
            disconnect_reason: None,
            quality_metrics: QualityMetrics::default(),
            billing_info,
        };

        self.active_cdrs.insert(cdr_id.clone(), cdr);
        let _ = self.event_tx.send(CdrEvent::CallStarted {
            cdr_id: cdr_id.clone(),
            call_id: call_id.to_string(),
        });
        cdr_id
    }

    pub fn update_call_answered(&self, cdr_id: &str) {
        if let Some(mut cdr) = self.active_cdrs.get_mut(cdr_id) {
            cdr.answer_time = Some(Utc::now());
        }
    }

    pub fn update_quality_metrics(&self, cdr_id: &str, metrics: QualityMetrics) {
        if let Some(mut cdr) = self.active_cdrs.get_mut(cdr_id) {
            cdr.quality_metrics = metrics;
        }
    }

    pub async fn finalize_call_record(&self, cdr_id: &str, disconnect_reason: DisconnectReason) -> Result<()> {
        let Some((_, mut cdr)) = self.active_cdrs.remove(cdr_id) else {
            return Ok(());
        };

        let end_time = Utc::now();
        cdr.end_time = Some(end_time);
        cdr.disconnect_reason = Some(disconnect_reason);

        let duration = match cdr.answer_time {
            Some(answered) => end_time.signed_duration_since(answered),
            None => end_time.signed_duration_since(cdr.start_time),
        };
        cdr.duration_seconds = duration.num_seconds().max(0) as u64;
        cdr.billable_duration_seconds = self.calculate_billable_duration(cdr.duration_seconds, &cdr.billing_info);
        cdr.billing_info.cost = self.calculate_call_cost(cdr.billable_duration_seconds, &cdr.billing_info);

        if let Err(e) = self.storage.store_cdr(&cdr).await {
            error!(cdr_id, %e, "failed to store CDR");
            let _ = self.event_tx.send(CdrEvent::Error {
                cdr_id: Some(cdr_id.to_string()),
                message: e.to_string(),
            });
        } else {
            info!(cdr_id, duration = cdr.duration_seconds, cost = cdr.billing_info.cost, "CDR finalized");
            let _ = self.event_tx.send(CdrEvent::CallEnded {
                cdr_id: cdr_id.to_string(),
                duration: Duration::from_secs(cdr.duration_seconds),
                cost: cdr.billing_info.cost,
            });
        }

        Ok(())
    }

    /// Fire-and-forget convenience wrapper for the call-control core: a
    /// call task must not block its own teardown on CDR storage I/O, so
    /// this starts and immediately finalizes a record on a detached task.
    /// Storage errors are logged and swallowed, per the error-handling
    /// design: a lost CDR never blocks a call from completing.
    pub fn finalize_from_call(
        self: &Arc<Self>,
        call_id: &str,
        caller: &str,
        callee: &str,
        _created_at: SystemTime,
        connected_at: Option<SystemTime>,
        _ended_at: SystemTime,
        reason: &str,
    ) {
        let service = self.clone();
        let call_id = call_id.to_string();
        let caller = caller.to_string();
        let callee = callee.to_string();
        let reason = disconnect_reason_for(reason);
        let was_answered = connected_at.is_some();

        tokio::spawn(async move {
            let cdr_id = service.start_call_record(&call_id, &caller, &callee, RouteType::Internal).await;
            if was_answered {
                service.update_call_answered(&cdr_id);
            }
            let _ = service.finalize_call_record(&cdr_id, reason).await;
        });
    }

    async fn calculate_billing_info(&self, called_number: &str) -> BillingInfo {
        let rate = self.find_billing_rate(called_number).await;
        match rate {
            Some(r) => BillingInfo {
                rate_per_minute: r.rate_per_minute,
                currency: r.currency,
                cost: 0.0,
                billing_increment_seconds: r.billing_increment,
                minimum_charge_seconds: r.minimum_charge,
            },
            None => {
                let _ = self.event_tx.send(CdrEvent::RateNotFound {
                    called_number: called_number.to_string(),
                });
                BillingInfo {
                    rate_per_minute: self.default_billing_config.default_rate_per_minute,
                    currency: self.default_billing_config.default_currency.clone(),
                    cost: 0.0,
                    billing_increment_seconds: self.default_billing_config.default_billing_increment,
                    minimum_charge_seconds: self.default_billing_config.default_minimum_charge,
                }
            }
        }
    }

    async fn find_billing_rate(&self, called_number: &str) -> Option<BillingRate> {
        let rates = self.billing_rates.read().await;
        rates
            .iter()
            .filter(|r| called_number.starts_with(&r.prefix))
            .max_by_key(|r| r.prefix.len())
            .cloned()
    }

    fn calculate_billable_duration(&self, actual_duration: u64, billing_info: &BillingInfo) -> u64 {
        let increment = billing_info.billing_increment_seconds as u64;
        let minimum = billing_info.minimum_charge_seconds as u64;
        let duration = actual_duration.max(minimum);
        if increment > 0 {
            duration.div_ceil(increment) * increment
        } else {
            duration
        }
    }

    fn calculate_call_cost(&self, billable_duration: u64, billing_info: &BillingInfo) -> f64 {
        (billable_duration as f64 / 60.0) * billing_info.rate_per_minute
    }

    pub async fn load_billing_rates(&self, rates: Vec<BillingRate>) {
        *self.billing_rates.write().await = rates;
    }

    pub fn active_cdr_count(&self) -> usize {
        self.active_cdrs.len()
    }
}

fn disconnect_reason_for(reason: &str) -> DisconnectReason {
    match reason {
        "bye" => DisconnectReason::Normal,
        "cancel" => DisconnectReason::Rejected,
        "no-answer" => DisconnectReason::NoAnswer,
        "media-inactivity" => DisconnectReason::MediaInactivity,
        "callee-rejected" => DisconnectReason::Rejected,
        _ => DisconnectReason::SystemError,
    }
}

async fn cdr_finalizer_loop(active_cdrs: Arc<DashMap<String, CallDetailRecord>>, storage: Arc<dyn CdrStorage>) {
    let mut ticker = interval(Duration::from_secs(300));
    loop {
        ticker.tick().await;
        let now = Utc::now();
        let max_age = chrono::Duration::hours(24);

        let stale: Vec<String> = active_cdrs
            .iter()
            .filter(|e| now.signed_duration_since(e.value().start_time) > max_age)
            .map(|e| e.key().clone())
            .collect();

        for cdr_id in stale {
            if let Some((_, mut cdr)) = active_cdrs.remove(&cdr_id) {
                cdr.end_time = Some(now);
                cdr.disconnect_reason = Some(DisconnectReason::SystemError);
                cdr.duration_seconds = max_age.num_seconds() as u64;
                if let Err(e) = storage.store_cdr(&cdr).await {
                    error!(cdr_id, %e, "failed to auto-finalize stale CDR");
                } else {
                    warn!(cdr_id, "auto-finalized stale CDR");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_cdr_storage_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileCdrStorage::new(dir.path().to_path_buf(), 100);

        let cdr = CallDetailRecord {
            id: "cdr-1".to_string(),
            call_id: "call-1".to_string(),
            caller: "1001".to_string(),
            callee: "1002".to_string(),
            route_type: RouteType::Internal,
            start_time: Utc::now(),
            answer_time: None,
            end_time: None,
            duration_seconds: 0,
            billable_duration_seconds: 0,
            disconnect_reason: None,
            quality_metrics: QualityMetrics::default(),
            billing_info: BillingInfo {
                rate_per_minute: 0.1,
                currency: "USD".to_string(),
                cost: 0.0,
                billing_increment_seconds: 60,
                minimum_charge_seconds: 60,
            },
        };

        storage.store_cdr(&cdr).await.unwrap();
        let loaded = storage.get_cdr("cdr-1").await.unwrap();
        assert!(loaded.is_some());
        assert_eq!(loaded.unwrap().call_id, "call-1");
    }

    #[test]
    fn test_billing_calculation_applies_minimum_and_rounds_up() {
        let (service, _rx) = CdrService::new(
            Arc::new(FileCdrStorage::new(std::env::temp_dir(), 100)),
            BillingConfig::default(),
        );
        let billing = BillingInfo {
            rate_per_minute: 0.10,
            currency: "USD".to_string(),
            cost: 0.0,
            billing_increment_seconds: 60,
            minimum_charge_seconds: 60,
        };
        assert_eq!(service.calculate_billable_duration(45, &billing), 60);
        assert_eq!(service.calculate_billable_duration(90, &billing), 120);
        assert!((service.calculate_call_cost(120, &billing) - 0.20).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_start_and_finalize_call_record() {
        let dir = tempfile::tempdir().unwrap();
        let service = CdrService::new_for_test(dir.path());
        let cdr_id = service.start_call_record("call-1", "1001", "1002", RouteType::Internal).await;
        service.update_call_answered(&cdr_id);
        service.finalize_call_record(&cdr_id, DisconnectReason::Normal).await.unwrap();
        assert_eq!(service.active_cdr_count(), 0);
    }
}
