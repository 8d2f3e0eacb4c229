//! PBX gateway orchestrator.
//!
//! Wires every collaborator built elsewhere in `core`/`services` into a
//! single SIP ingress point and implements `AdminControl` directly. Nothing
//! downstream of this module knows about sockets; nothing upstream of it
//! knows about dial-plan regexes or relay slots.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::PbxConfig;
use crate::core::admin::{AdminControl, CallSummary, ExtensionSummary, MediaEndpoint, PbxStatus};
use crate::core::call::CallManager;
use crate::core::dialplan::{DialPlanRouter, RoutingDecision};
use crate::core::lcr::{LeastCostRouter, StaticLeastCostRouter, TrunkCandidate};
use crate::core::registry::{reaper_loop, ContactAddr, ExtensionRegistry, RegisterOutcome, Registrar};
use crate::core::rtp_relay::RtpRelay;
use crate::core::sip_message::{self, Header, SipMessage, StartLine};
use crate::core::timer::TimerOwner;
use crate::core::transaction::{ServerTransactionTable, TransactionKind, TransactionLayer};
use crate::core::trunk::{SrvRecord, TrunkRegistry};
use crate::services::cdr::{BillingConfig, CdrService, CdrStorage, FileCdrStorage};
use crate::services::voicemail::{CallStateQuery, VoicemailService};
use crate::{Error, Result};

/// Backs `VoicemailService`'s call-state query without a construction
/// cycle with `CallManager`: created first and handed to voicemail, bound
/// to the manager once it exists.
struct CallStateHandle {
    manager: once_cell::sync::OnceCell<Arc<CallManager>>,
}

impl CallStateHandle {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            manager: once_cell::sync::OnceCell::new(),
        })
    }

    fn bind(&self, manager: Arc<CallManager>) {
        let _ = self.manager.set(manager);
    }
}

#[async_trait]
impl CallStateQuery for CallStateHandle {
    async fn is_connected(&self, call_id: &str) -> bool {
        match self.manager.get() {
            Some(manager) => manager
                .get(call_id)
                .await
                .map(|s| s.state == "CONNECTED")
                .unwrap_or(false),
            None => false,
        }
    }
}

/// What's needed to relay SIP traffic between the two legs of a call the
/// gateway originated, kept outside `CallManager` since the dialog state
/// it needs (Via/From/To/Call-ID of the *original* request, and the
/// resolved destination of the other leg) is transport-layer, not
/// call-state-machine, concern.
#[derive(Clone)]
struct DialogRoute {
    caller_addr: SocketAddr,
    caller_request: SipMessage,
    callee_addr: Option<SocketAddr>,
}

pub struct PbxGateway {
    config: PbxConfig,
    local_ip: String,
    registry: Arc<ExtensionRegistry>,
    registrar: Registrar,
    dialplan: DialPlanRouter,
    relay: Arc<RtpRelay>,
    calls: Arc<CallManager>,
    trunks: Arc<TrunkRegistry>,
    lcr: Option<Arc<dyn LeastCostRouter>>,
    cdr: Arc<CdrService>,
    voicemail: Arc<VoicemailService>,
    transactions: Arc<TransactionLayer>,
    server_transactions: std::sync::Mutex<ServerTransactionTable>,
    sip_socket: Arc<UdpSocket>,
    dialogs: DashMap<String, DialogRoute>,
    running: RwLock<bool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl PbxGateway {
    pub async fn new(config: PbxConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let (registry, registry_events) = ExtensionRegistry::new(&config.extensions);
        let registrar = Registrar::new(registry.clone(), Duration::from_secs(3600));
        let dialplan = DialPlanRouter::new(&config.dialplan, registry.clone())?;

        let bind_ip: IpAddr = config
            .server
            .sip_host
            .parse()
            .unwrap_or_else(|_| "0.0.0.0".parse().unwrap());
        let local_ip = config
            .server
            .external_ip
            .clone()
            .unwrap_or_else(|| config.server.sip_host.clone());

        let (relay, relay_events) =
            RtpRelay::new(bind_ip, config.server.rtp_port_range_start, config.server.rtp_port_range_end);
        let (timers, timer_fired) = crate::core::timer::TimerService::spawn(Duration::from_millis(100));

        let voicemail_root = PathBuf::from(&config.voicemail.storage_path);
        let cdr_root = voicemail_root
            .parent()
            .map(|p| p.join("cdr"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/redfire-pbx/cdr"));
        let storage: Arc<dyn CdrStorage> = Arc::new(FileCdrStorage::new(cdr_root, 100));
        let (cdr, cdr_events) = CdrService::new(storage, BillingConfig::default());

        let call_state = CallStateHandle::new();
        let voicemail = VoicemailService::new(voicemail_root, call_state.clone());

        let calls = CallManager::new(
            relay.clone(),
            timers,
            cdr.clone(),
            voicemail.clone() as Arc<dyn MediaEndpoint>,
            Duration::from_secs(config.voicemail.no_answer_timeout as u64),
            config.features.dtmf.payload_type,
        );
        call_state.bind(calls.clone());

        let trunks = Arc::new(TrunkRegistry::new(
            &config.trunk.trunks,
            config.features.dns_srv_failover.max_failures,
        ));
        if config.features.dns_srv_failover.enabled {
            prime_trunk_srv_records(&trunks).await;
        }

        // Rate tables are a provisioning concern the core doesn't own; this
        // build's config schema only toggles LCR on/off. An empty table
        // means `select_trunk` always returns `None` until a provisioning
        // collaborator feeds it real dial patterns, and routing falls back
        // to the default trunk exactly as if LCR were disabled.
        let lcr: Option<Arc<dyn LeastCostRouter>> = if config.lcr.enabled {
            Some(Arc::new(StaticLeastCostRouter::new(Vec::new(), 60)))
        } else {
            None
        };

        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let transactions = Arc::new(TransactionLayer::new(send_tx));

        let sip_addr = SocketAddr::new(bind_ip, config.server.sip_port);
        let sip_socket = Arc::new(UdpSocket::bind(sip_addr).await?);

        let gateway = Arc::new(Self {
            config,
            local_ip,
            registry,
            registrar,
            dialplan,
            relay,
            calls,
            trunks,
            lcr,
            cdr,
            voicemail,
            transactions,
            server_transactions: std::sync::Mutex::new(ServerTransactionTable::new()),
            sip_socket,
            dialogs: DashMap::new(),
            running: RwLock::new(false),
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        gateway.spawn_support_tasks(send_rx, relay_events, timer_fired, registry_events, cdr_events);

        Ok(gateway)
    }

    fn spawn_support_tasks(
        self: &Arc<Self>,
        mut send_rx: mpsc::UnboundedReceiver<(SocketAddr, Vec<u8>)>,
        mut relay_events: mpsc::UnboundedReceiver<crate::core::rtp_relay::RelayEvent>,
        mut timer_fired: mpsc::UnboundedReceiver<crate::core::timer::TimerFired>,
        mut registry_events: mpsc::UnboundedReceiver<crate::core::registry::RegistryEvent>,
        mut cdr_events: mpsc::UnboundedReceiver<crate::services::cdr::CdrEvent>,
    ) {
        let mut tasks = self.tasks.lock().unwrap();

        let socket = self.sip_socket.clone();
        tasks.push(tokio::spawn(async move {
            while let Some((dest, bytes)) = send_rx.recv().await {
                let _ = socket.send_to(&bytes, dest).await;
            }
        }));

        let gateway = self.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(event) = relay_events.recv().await {
                match event {
                    crate::core::rtp_relay::RelayEvent::MediaTimeout { call_id } => {
                        gateway.calls.deliver_media_timeout(&call_id);
                    }
                    crate::core::rtp_relay::RelayEvent::Dtmf { call_id, digit, .. } => {
                        gateway.calls.deliver_dtmf(&call_id, digit);
                    }
                }
            }
        }));

        let gateway = self.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(fired) = timer_fired.recv().await {
                if let TimerOwner::Call(call_id) = fired.owner {
                    gateway.calls.deliver_no_answer_timeout(&call_id);
                }
            }
        }));

        tasks.push(tokio::spawn(async move {
            while let Some(event) = registry_events.recv().await {
                debug!(?event, "registry event");
            }
        }));

        tasks.push(tokio::spawn(async move {
            while let Some(event) = cdr_events.recv().await {
                debug!(?event, "cdr event");
            }
        }));

        let registry = self.registry.clone();
        tasks.push(tokio::spawn(reaper_loop(registry, Duration::from_secs(10))));
    }

    /// Starts the SIP ingress loop in the background. Returns once the
    /// listener task is spawned; it runs until `stop` is called.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        *self.running.write().await = true;
        info!(addr = ?self.sip_socket.local_addr(), "SIP listener started");

        let gateway = self.clone();
        let handle = tokio::spawn(async move {
            gateway.ingress_loop().await;
        });
        self.tasks.lock().unwrap().push(handle);
        Ok(())
    }

    /// Signals the ingress loop to stop and aborts every background task.
    /// In-flight call tasks are not torn down here; the caller races this
    /// against its own shutdown deadline.
    pub async fn stop(&self) {
        *self.running.write().await = false;
        for handle in self.tasks.lock().unwrap().drain(..) {
            handle.abort();
        }
    }

    pub fn active_call_count(&self) -> usize {
        self.calls.enumerate_active().len()
    }

    async fn ingress_loop(self: Arc<Self>) {
        let mut buf = [0u8; 4096];
        loop {
            if !*self.running.read().await {
                return;
            }
            let (len, from) = match self.sip_socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    error!(%e, "SIP socket recv error");
                    continue;
                }
            };
            let bytes = buf[..len].to_vec();
            let gateway = self.clone();
            tokio::spawn(async move {
                gateway.handle_datagram(bytes, from).await;
            });
        }
    }

    async fn handle_datagram(self: Arc<Self>, bytes: Vec<u8>, from: SocketAddr) {
        let message = match sip_message::parse_message(&bytes) {
            Ok(m) => m,
            Err(e) => {
                warn!(%e, %from, "failed to parse inbound SIP datagram");
                return;
            }
        };

        if !message.is_request() {
            self.transactions.on_response(message);
            return;
        }

        let method = message.method().unwrap_or("").to_string();

        // UDP has no reliable delivery of its own; a retransmitted request
        // (same Via branch + sent-by + method) must be absorbed here, not
        // reprocessed as a second INVITE/BYE/etc.
        if let Some(via) = message.headers_named("Via").first() {
            let mut parts = via.splitn(2, ';');
            let sent_by = parts.next().unwrap_or("").trim().to_string();
            let branch = parts
                .next()
                .and_then(|rest| rest.split(';').find_map(|p| p.trim().strip_prefix("branch=")))
                .unwrap_or("")
                .to_string();
            if !branch.is_empty() && !self.server_transactions.lock().unwrap().observe(&branch, &sent_by, &method) {
                return;
            }
        }
        let result = match method.as_str() {
            "REGISTER" => self.handle_register(message, from).await,
            "INVITE" => self.handle_invite(message, from).await,
            "ACK" => self.handle_ack(message).await,
            "BYE" => self.handle_bye(message, from).await,
            "CANCEL" => self.handle_cancel(message, from).await,
            "OPTIONS" => self.handle_options(message, from).await,
            "INFO" => self.handle_info(message, from).await,
            other => {
                debug!(method = other, %from, "unsupported SIP method");
                self.reply(&message, 501, "Not Implemented", from).await;
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!(%e, method, "error handling SIP request");
        }
    }

    async fn reply(&self, request: &SipMessage, status: u16, reason: &str, dest: SocketAddr) {
        self.reply_with(request, status, reason, dest, Vec::new(), Vec::new()).await;
    }

    async fn reply_with(
        &self,
        request: &SipMessage,
        status: u16,
        reason: &str,
        dest: SocketAddr,
        body: Vec<u8>,
        extra_headers: Vec<Header>,
    ) {
        let mut headers: Vec<Header> = request
            .headers_named("Via")
            .into_iter()
            .map(|v| Header { name: "Via".to_string(), value: v.to_string() })
            .collect();
        if let Some(from) = request.header("From") {
            headers.push(Header { name: "From".to_string(), value: from.to_string() });
        }
        if let Some(to) = request.header("To") {
            let to = if to.contains("tag=") {
                to.to_string()
            } else {
                format!("{to};tag={}", Uuid::new_v4())
            };
            headers.push(Header { name: "To".to_string(), value: to });
        }
        if let Some(call_id) = request.header("Call-ID") {
            headers.push(Header { name: "Call-ID".to_string(), value: call_id.to_string() });
        }
        if let Some(cseq) = request.header("CSeq") {
            headers.push(Header { name: "CSeq".to_string(), value: cseq.to_string() });
        }
        headers.extend(extra_headers);

        let start_line = StartLine::Response {
            version: "SIP/2.0".to_string(),
            status_code: status,
            reason_phrase: reason.to_string(),
        };
        let wire = sip_message::build_message(start_line, headers, body);
        let _ = self.sip_socket.send_to(&wire, dest).await;
    }

    async fn handle_register(self: &Arc<Self>, request: SipMessage, from: SocketAddr) -> Result<()> {
        let to = request.to_uri()?;
        let extension = to.user;

        let expires = request
            .header("Expires")
            .and_then(|v| v.parse::<u64>().ok())
            .or_else(|| {
                request
                    .header("Contact")
                    .and_then(|c| c.split(';').find_map(|p| p.trim().strip_prefix("expires=")))
                    .and_then(|v| v.parse::<u64>().ok())
            });

        let credential = request.header("Authorization").map(|a| a.to_string());
        let contact = ContactAddr { addr: from, transport: "udp".to_string() };

        match self.registrar.handle_register(&extension, contact, expires, credential.as_deref()) {
            RegisterOutcome::Accepted { expires } => {
                let header = Header { name: "Expires".to_string(), value: expires.to_string() };
                self.reply_with(&request, 200, "OK", from, Vec::new(), vec![header]).await;
            }
            RegisterOutcome::ChallengeRequired => {
                let header = Header {
                    name: "WWW-Authenticate".to_string(),
                    value: format!("Digest realm=\"{}\", nonce=\"{}\"", self.local_ip, Uuid::new_v4()),
                };
                self.reply_with(&request, 401, "Unauthorized", from, Vec::new(), vec![header]).await;
            }
            RegisterOutcome::Rejected(e) => {
                self.reply(&request, e.sip_status(), "Rejected", from).await;
            }
        }
        Ok(())
    }

    async fn handle_invite(self: &Arc<Self>, request: SipMessage, from: SocketAddr) -> Result<()> {
        let from_uri = request.from_uri()?;
        let to_uri = request.to_uri()?;
        let from_ext = from_uri.user;
        let dialed_number = to_uri.user;
        let call_id = request.call_id().unwrap_or_default().to_string();
        if call_id.is_empty() {
            self.reply(&request, 400, "Missing Call-ID", from).await;
            return Ok(());
        }

        let caller_sdp = sip_message::parse_sdp(&request.body)?;
        let caller_rtp: SocketAddr = format!("{}:{}", caller_sdp.connection_ip, caller_sdp.audio_port)
            .parse()
            .map_err(|_| Error::parse("invalid caller SDP connection address"))?;

        let decision = match self.dialplan.route(&from_ext, &dialed_number) {
            Ok(d) => d,
            Err(e) => {
                self.reply(&request, e.sip_status(), "Routing Failed", from).await;
                return Ok(());
            }
        };

        match decision {
            RoutingDecision::ToExtension(ext) => {
                self.route_to_extension(call_id, from_ext, ext, request, from, caller_rtp).await
            }
            RoutingDecision::ToVoicemail(mailbox) => {
                self.route_to_voicemail(call_id, from_ext, mailbox, request, from, caller_rtp).await
            }
            RoutingDecision::ToConferenceRoom(_) | RoutingDecision::ToParkSlot(_) | RoutingDecision::ToPagingZone(_) => {
                // The dial-plan decision is real; no conference/parking/
                // paging collaborator is wired into this build. Reject
                // cleanly rather than leaving the caller hanging.
                warn!(call_id, "routing decision has no collaborator configured, rejecting");
                self.reply(&request, 503, "Service Unavailable", from).await;
                Ok(())
            }
            RoutingDecision::ToTrunk { emergency } => {
                self.route_to_trunk(call_id, from_ext, dialed_number, request, from, caller_rtp, emergency).await
            }
        }
    }

    async fn route_to_extension(
        self: &Arc<Self>,
        call_id: String,
        from_ext: String,
        to_ext: String,
        request: SipMessage,
        from: SocketAddr,
        caller_rtp: SocketAddr,
    ) -> Result<()> {
        let callee_contact = match self.registry.lookup(&to_ext) {
            Ok(c) => c,
            Err(e) => {
                self.reply(&request, e.sip_status(), "Not Registered", from).await;
                return Ok(());
            }
        };

        self.calls
            .start_call(call_id.clone(), from_ext, to_ext.clone(), request.clone(), caller_rtp)
            .await?;
        self.dialogs.insert(
            call_id.clone(),
            DialogRoute { caller_addr: from, caller_request: request.clone(), callee_addr: None },
        );
        self.reply(&request, 100, "Trying", from).await;

        let forwarded = self.build_forwarded_invite(&request, &to_ext, &call_id).await?;
        let gateway = self.clone();
        let callee_addr = callee_contact.addr;
        tokio::spawn(async move {
            gateway.relay_invite_to_callee(call_id, forwarded, callee_addr, from).await;
        });

        Ok(())
    }

    async fn route_to_trunk(
        self: &Arc<Self>,
        call_id: String,
        from_ext: String,
        dialed_number: String,
        request: SipMessage,
        from: SocketAddr,
        caller_rtp: SocketAddr,
        emergency: bool,
    ) -> Result<()> {
        let trunk = if emergency {
            // Emergency calls bypass LCR entirely and go straight to the
            // default trunk.
            self.trunks.default_trunk()
        } else {
            self.select_trunk_via_lcr(&dialed_number).await.or_else(|| self.trunks.default_trunk())
        };
        let Some(trunk) = trunk else {
            self.reply(&request, 404, "No Trunk Available", from).await;
            return Ok(());
        };

        let service_name = self.trunks.service_name_for(trunk);
        let (target_host, target_port) = match self.trunks.resolver().select(&service_name) {
            Ok(t) => t,
            Err(e) => {
                warn!(call_id, %e, "no SRV record available for outbound trunk");
                self.reply(&request, 503, "No Route", from).await;
                return Ok(());
            }
        };
        let trunk_addr: SocketAddr = format!("{target_host}:{target_port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::new(self.sip_socket.local_addr().unwrap().ip(), target_port));

        self.calls
            .start_call(call_id.clone(), from_ext, dialed_number.clone(), request.clone(), caller_rtp)
            .await?;
        self.dialogs.insert(
            call_id.clone(),
            DialogRoute { caller_addr: from, caller_request: request.clone(), callee_addr: None },
        );
        self.reply(&request, 100, "Trying", from).await;

        let forwarded = self.build_forwarded_invite(&request, &dialed_number, &call_id).await?;
        let gateway = self.clone();
        tokio::spawn(async move {
            gateway
                .relay_trunk_invite(call_id, forwarded, trunk_addr, from, service_name, target_host)
                .await;
        });

        Ok(())
    }

    /// Consults the injected LCR collaborator, if any, for the cheapest
    /// trunk matching `dialed_number`. Returns `None` on a miss or when no
    /// collaborator is configured, leaving trunk selection to the caller's
    /// fallback.
    async fn select_trunk_via_lcr(&self, dialed_number: &str) -> Option<&crate::core::trunk::Trunk> {
        let lcr = self.lcr.as_ref()?;
        let candidates: Vec<TrunkCandidate> = self
            .trunks
            .trunks()
            .iter()
            .map(|t| TrunkCandidate { trunk_id: t.id.clone() })
            .collect();
        match lcr.select_trunk(dialed_number, &candidates).await {
            Ok(Some(selection)) => self.trunks.trunk(&selection.trunk_id),
            Ok(None) => None,
            Err(e) => {
                warn!(%e, "LCR selection failed, falling back to default trunk");
                None
            }
        }
    }

    async fn relay_trunk_invite(
        self: Arc<Self>,
        call_id: String,
        forwarded: SipMessage,
        trunk_addr: SocketAddr,
        caller_addr: SocketAddr,
        service_name: String,
        target: String,
    ) {
        let handle = self.transactions.send_request(forwarded, trunk_addr, TransactionKind::Invite);
        match handle.wait_final().await {
            Ok(response) => {
                self.trunks.resolver().report_success(&service_name, &target);
                if let Some(mut dialog) = self.dialogs.get_mut(&call_id) {
                    dialog.callee_addr = Some(trunk_addr);
                }
                if let Err(e) = self.calls.on_callee_response(&call_id, response.clone(), trunk_addr) {
                    warn!(call_id, %e, "failed to deliver trunk response to call task");
                }
                self.relay_response_to_caller(&call_id, &response).await;
            }
            Err(e) => {
                self.trunks.resolver().report_failure(&service_name, &target);
                warn!(call_id, %e, "trunk transaction failed, ending call");
                let _ = self.calls.end(&call_id, false);
                if let Some((_, dialog)) = self.dialogs.remove(&call_id) {
                    self.reply(&dialog.caller_request, 503, "Trunk Unavailable", caller_addr).await;
                }
            }
        }
    }

    async fn route_to_voicemail(
        self: &Arc<Self>,
        call_id: String,
        from_ext: String,
        mailbox: String,
        request: SipMessage,
        from: SocketAddr,
        caller_rtp: SocketAddr,
    ) -> Result<()> {
        self.calls
            .start_call(call_id.clone(), from_ext, mailbox, request.clone(), caller_rtp)
            .await?;
        self.dialogs.insert(
            call_id.clone(),
            DialogRoute { caller_addr: from, caller_request: request.clone(), callee_addr: None },
        );

        // A direct dial to a mailbox has no ringing phase: divert straight
        // to the no-answer path, which the call task treats identically to
        // a real timer firing.
        self.calls.deliver_no_answer_timeout(&call_id);

        let recorder_addr = self.voicemail.bind_recorder(&call_id).await?;
        self.relay.attach_recorder(&call_id, recorder_addr).await?;

        match self.relay.local_port(&call_id).await {
            Ok(port) => {
                let codecs = sip_message::default_codec_list(self.config.features.dtmf.payload_type);
                let body = sip_message::build_audio_sdp(
                    &self.local_ip,
                    port,
                    &codecs,
                    self.config.features.dtmf.payload_type,
                    &call_id,
                );
                self.reply_with(&request, 200, "OK", from, body, Vec::new()).await;
            }
            Err(e) => {
                warn!(call_id, %e, "relay slot gone before voicemail could answer");
            }
        }

        Ok(())
    }

    async fn build_forwarded_invite(self: &Arc<Self>, original: &SipMessage, to_ext: &str, call_id: &str) -> Result<SipMessage> {
        let port = self.relay.local_port(call_id).await?;
        let codecs = sip_message::default_codec_list(self.config.features.dtmf.payload_type);
        let body = sip_message::build_audio_sdp(&self.local_ip, port, &codecs, self.config.features.dtmf.payload_type, call_id);

        let branch = format!("z9hG4bK{}", Uuid::new_v4().simple());
        let mut headers = vec![Header {
            name: "Via".to_string(),
            value: format!("SIP/2.0/UDP {}:{};branch={}", self.local_ip, self.config.server.sip_port, branch),
        }];
        if let Some(from) = original.header("From") {
            headers.push(Header { name: "From".to_string(), value: from.to_string() });
        }
        headers.push(Header { name: "To".to_string(), value: format!("<sip:{to_ext}@{}>", self.local_ip) });
        if let Some(cid) = original.header("Call-ID") {
            headers.push(Header { name: "Call-ID".to_string(), value: cid.to_string() });
        }
        headers.push(Header { name: "CSeq".to_string(), value: "1 INVITE".to_string() });
        headers.push(Header {
            name: "Contact".to_string(),
            value: format!("<sip:{}@{}:{}>", to_ext, self.local_ip, self.config.server.sip_port),
        });

        Ok(SipMessage {
            start_line: StartLine::Request {
                method: "INVITE".to_string(),
                uri: format!("sip:{to_ext}@{}", self.local_ip),
                version: "SIP/2.0".to_string(),
            },
            headers,
            body,
        })
    }

    async fn relay_invite_to_callee(self: Arc<Self>, call_id: String, forwarded: SipMessage, callee_addr: SocketAddr, caller_addr: SocketAddr) {
        let handle = self.transactions.send_request(forwarded, callee_addr, TransactionKind::Invite);
        match handle.wait_final().await {
            Ok(response) => {
                if let Some(mut dialog) = self.dialogs.get_mut(&call_id) {
                    dialog.callee_addr = Some(callee_addr);
                }
                if let Err(e) = self.calls.on_callee_response(&call_id, response.clone(), callee_addr) {
                    warn!(call_id, %e, "failed to deliver callee response to call task");
                }
                self.relay_response_to_caller(&call_id, &response).await;
            }
            Err(e) => {
                warn!(call_id, %e, "callee transaction failed, ending call");
                let _ = self.calls.end(&call_id, false);
                if let Some((_, dialog)) = self.dialogs.remove(&call_id) {
                    self.reply(&dialog.caller_request, 408, "Request Timeout", caller_addr).await;
                }
            }
        }
    }

    async fn relay_response_to_caller(&self, call_id: &str, callee_response: &SipMessage) {
        let status = callee_response.status_code().unwrap_or(500);
        let reason = match &callee_response.start_line {
            StartLine::Response { reason_phrase, .. } => reason_phrase.clone(),
            _ => "Unknown".to_string(),
        };

        let body = if status < 300 {
            match self.relay.local_port(call_id).await {
                Ok(port) => {
                    let codecs = sip_message::default_codec_list(self.config.features.dtmf.payload_type);
                    sip_message::build_audio_sdp(&self.local_ip, port, &codecs, self.config.features.dtmf.payload_type, call_id)
                }
                Err(_) => Vec::new(),
            }
        } else {
            Vec::new()
        };

        let Some((dest, caller_request)) = self.dialogs.get(call_id).map(|d| (d.caller_addr, d.caller_request.clone())) else {
            warn!(call_id, "no caller dialog recorded, cannot relay response");
            return;
        };
        self.reply_with(&caller_request, status, &reason, dest, body, Vec::new()).await;
    }

    async fn handle_ack(self: &Arc<Self>, request: SipMessage) -> Result<()> {
        let call_id = request.call_id().unwrap_or_default().to_string();
        if let Some(callee_addr) = self.dialogs.get(&call_id).and_then(|d| d.callee_addr) {
            let wire = sip_message::build_message(request.start_line.clone(), request.headers.clone(), request.body.clone());
            let _ = self.sip_socket.send_to(&wire, callee_addr).await;
        }
        Ok(())
    }

    async fn handle_bye(self: &Arc<Self>, request: SipMessage, from: SocketAddr) -> Result<()> {
        let call_id = request.call_id().unwrap_or_default().to_string();
        let Some((caller_addr, callee_addr)) = self.dialogs.get(&call_id).map(|d| (d.caller_addr, d.callee_addr)) else {
            self.reply(&request, 481, "Call/Transaction Does Not Exist", from).await;
            return Ok(());
        };
        let from_caller = caller_addr == from;
        self.calls.end(&call_id, from_caller)?;

        let forward_target = if from_caller { callee_addr } else { Some(caller_addr) };
        if let Some(dest) = forward_target {
            let wire = sip_message::build_message(request.start_line.clone(), request.headers.clone(), request.body.clone());
            let _ = self.sip_socket.send_to(&wire, dest).await;
        }

        self.reply(&request, 200, "OK", from).await;
        self.dialogs.remove(&call_id);
        Ok(())
    }

    async fn handle_cancel(self: &Arc<Self>, request: SipMessage, from: SocketAddr) -> Result<()> {
        let call_id = request.call_id().unwrap_or_default().to_string();
        let state = self.calls.get(&call_id).await.ok().map(|s| s.state);
        if !matches!(state.as_deref(), Some("RINGING") | Some("EARLY_MEDIA")) {
            self.reply(&request, 481, "Call/Transaction Does Not Exist", from).await;
            return Ok(());
        }

        self.calls.cancel(&call_id)?;
        if let Some(callee_addr) = self.dialogs.get(&call_id).and_then(|d| d.callee_addr) {
            let wire = sip_message::build_message(request.start_line.clone(), request.headers.clone(), request.body.clone());
            let _ = self.sip_socket.send_to(&wire, callee_addr).await;
        }
        self.reply(&request, 200, "OK", from).await;
        Ok(())
    }

    async fn handle_options(self: &Arc<Self>, request: SipMessage, from: SocketAddr) -> Result<()> {
        let allow = Header {
            name: "Allow".to_string(),
            value: "INVITE, ACK, CANCEL, BYE, OPTIONS, REGISTER, INFO".to_string(),
        };
        self.reply_with(&request, 200, "OK", from, Vec::new(), vec![allow]).await;
        Ok(())
    }

    async fn handle_info(self: &Arc<Self>, request: SipMessage, from: SocketAddr) -> Result<()> {
        self.reply(&request, 200, "OK", from).await;
        Ok(())
    }
}

/// Real DNS SRV resolution, performed once at startup for every configured
/// trunk. The failover bookkeeping this feeds stays in `trunk.rs` — this
/// function's only job is to turn a domain into a primed record set.
async fn prime_trunk_srv_records(trunks: &TrunkRegistry) {
    let resolver = match TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()) {
        Ok(r) => r,
        Err(e) => {
            warn!(%e, "failed to construct DNS resolver, trunks have no SRV records until the next reload");
            return;
        }
    };

    for trunk in trunks.trunks() {
        let service_name = trunks.service_name_for(trunk);
        match resolver.srv_lookup(service_name.clone()).await {
            Ok(lookup) => {
                let records: Vec<SrvRecord> = lookup
                    .iter()
                    .map(|r| SrvRecord::new(r.priority(), r.weight(), r.port(), r.target().to_string()))
                    .collect();
                info!(trunk = trunk.id, service_name, count = records.len(), "resolved SRV records for trunk");
                trunks.resolver().prime(&service_name, records);
            }
            Err(e) => {
                warn!(trunk = trunk.id, service_name, %e, "SRV lookup failed");
            }
        }
    }
}

#[async_trait]
impl AdminControl for PbxGateway {
    async fn enumerate_active_calls(&self) -> Result<Vec<CallSummary>> {
        let mut summaries = Vec::new();
        for call_id in self.calls.enumerate_active() {
            if let Ok(summary) = self.calls.get(&call_id).await {
                summaries.push(summary);
            }
        }
        Ok(summaries)
    }

    async fn end_call(&self, call_id: &str, _reason: &str) -> Result<()> {
        self.calls.end(call_id, true)
    }

    async fn transfer_call(&self, call_id: &str, new_destination: &str) -> Result<()> {
        self.calls.transfer(call_id, new_destination).await
    }

    async fn hold_call(&self, call_id: &str) -> Result<()> {
        self.calls.hold(call_id)
    }

    async fn resume_call(&self, call_id: &str) -> Result<()> {
        self.calls.resume(call_id)
    }

    async fn allocate_synthetic_relay(&self, call_id: &str) -> Result<(u16, u16)> {
        self.relay.allocate(call_id, self.config.features.dtmf.payload_type).await
    }

    async fn inject_media_endpoint(&self, call_id: &str, endpoint: SocketAddr) -> Result<()> {
        self.relay.attach_recorder(call_id, endpoint).await
    }

    async fn enumerate_extensions(&self) -> Result<Vec<ExtensionSummary>> {
        Ok(self
            .registry
            .enumerate()
            .into_iter()
            .map(|b| ExtensionSummary {
                number: b.extension.clone(),
                display_name: b.display_name,
                registered: true,
            })
            .collect())
    }

    async fn status(&self) -> Result<PbxStatus> {
        Ok(PbxStatus {
            running: *self.running.read().await,
            registered_extensions: self.registry.enumerate().len(),
            active_calls: self.calls.enumerate_active().len(),
            active_recordings: self.voicemail.active_recording_count(),
            active_conferences: 0,
            parked_calls: 0,
            queued_calls: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(tmp: &std::path::Path) -> PbxConfig {
        let mut config = PbxConfig::default_config();
        config.server.sip_host = "127.0.0.1".to_string();
        config.server.sip_port = 0;
        config.server.rtp_port_range_start = 21000;
        config.server.rtp_port_range_end = 21020;
        config.features.dns_srv_failover.enabled = false;
        config.voicemail.storage_path = tmp.join("voicemail").to_string_lossy().to_string();
        config
    }

    #[tokio::test]
    async fn test_gateway_starts_and_reports_status() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = PbxGateway::new(test_config(dir.path())).await.unwrap();
        gateway.start().await.unwrap();

        let status = gateway.status().await.unwrap();
        assert!(status.running);
        assert_eq!(status.active_calls, 0);
        assert_eq!(status.registered_extensions, 0);

        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_enumerate_extensions_reflects_config() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = PbxGateway::new(test_config(dir.path())).await.unwrap();

        let extensions = gateway.enumerate_extensions().await.unwrap();
        assert_eq!(extensions.len(), 2);
        assert!(extensions.iter().any(|e| e.number == "1001"));
    }

    #[tokio::test]
    async fn test_lcr_disabled_by_default_skips_selection() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = PbxGateway::new(test_config(dir.path())).await.unwrap();
        assert!(gateway.lcr.is_none());
        assert!(gateway.select_trunk_via_lcr("15551234567").await.is_none());
    }

    #[tokio::test]
    async fn test_lcr_enabled_with_empty_table_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.lcr.enabled = true;
        let gateway = PbxGateway::new(config).await.unwrap();

        assert!(gateway.lcr.is_some());
        assert!(gateway.select_trunk_via_lcr("15551234567").await.is_none());
    }

    #[tokio::test]
    async fn test_end_call_on_unknown_call_id_errors() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = PbxGateway::new(test_config(dir.path())).await.unwrap();
        assert!(gateway.end_call("nonexistent-call", "test").await.is_err());
    }
}
