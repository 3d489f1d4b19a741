//! The client orchestrator.
//!
//! A [`FarmClient`] owns the inbound dispatcher, one plain sender for text and
//! product operations, one file sender for GET/PUT/ABORT traffic, and one
//! monitored channel per scheduling service. Submitted tests are tracked in a
//! [`RegistryTable`] until the service reports them finished or failed.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::channel::{
    FailureHandler, FileDeliverer, IdleProbe, LogFailures, MessageDeliverer, Outbound,
    OutboundChannel,
};
use crate::config::ClientConfig;
use crate::dispatcher::{Dispatcher, InboundHandler};
use crate::error::{Result, TransportError};
use crate::listener::TestListener;
use crate::message::{
    FileOperation, FileOperationCode, Message, Operation, ProductOperation, RegistryOperation,
    RegistryOperationCode, TestOperation, TestOperationCode, TextMessage,
};
use crate::registry::{RegistryTable, TestRegistry, Transition};
use crate::tcp::TcpTransport;
use crate::transfer::{self, FileSource, RegetDecision, RegetTracker};
use crate::types::{validate_test_id, Address, NodeDescriptor, RemoteCategory, Test, TestStatus};

/// Description sent with REGISTER.
const NODE_DESCRIPTION: &str = "testfarm client";

/// Handle to a running client. Clones share the same client.
#[derive(Clone)]
pub struct FarmClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    local: Address,
    transport: TcpTransport,
    cancel: CancellationToken,
    state: Mutex<ClientState>,
    sender: OutboundChannel,
    file_sender: OutboundChannel,
    dispatcher: Dispatcher,
    me: Weak<ClientInner>,
}

struct ClientState {
    registries: RegistryTable,
    services: HashMap<Address, OutboundChannel>,
    regets: RegetTracker,
    closed: bool,
}

/// A listener callback to run once the state lock is released.
enum Notice {
    Started(Arc<dyn TestListener>, Test),
    Finished(Arc<dyn TestListener>, Test),
    Failed(Arc<dyn TestListener>, Test, String),
    Message(Arc<dyn TestListener>, Test, String),
}

impl Notice {
    async fn deliver(self) {
        match self {
            Notice::Started(listener, test) => listener.test_started(&test).await,
            Notice::Finished(listener, test) => listener.test_finished(&test).await,
            Notice::Failed(listener, test, reason) => listener.test_failed(&test, &reason).await,
            Notice::Message(listener, test, text) => listener.message(&test, &text).await,
        }
    }
}

impl FarmClient {
    /// Binds the inbound listener and starts the shared senders.
    pub async fn start(config: ClientConfig) -> Result<Self> {
        let transport = TcpTransport::new(config.transport());
        let listener = transport
            .bind(&config.bind_host, config.listen_port, config.port_probe_limit)
            .await?;
        let port = listener.local_addr()?.port();
        let local = Address::new(config.advertised_host(), port);
        let cancel = CancellationToken::new();

        let inner = Arc::new_cyclic(|me: &Weak<ClientInner>| {
            let sender = OutboundChannel::spawn(
                config.channel("sender"),
                Arc::new(MessageDeliverer::new(transport.clone())),
                Arc::new(LogFailures::new("sender")),
                None,
                &cancel,
            );
            let file_sender = OutboundChannel::spawn(
                config.channel("file-sender"),
                Arc::new(FileDeliverer::new(transport.clone())),
                Arc::new(FileFailures { client: me.clone() }),
                None,
                &cancel,
            );
            let router = Arc::new(InboundRouter { client: me.clone() });
            let dispatcher =
                Dispatcher::spawn(listener, router, config.read_timeout(), cancel.child_token());
            ClientInner {
                config: config.clone(),
                local: local.clone(),
                transport: transport.clone(),
                cancel: cancel.clone(),
                state: Mutex::new(ClientState {
                    registries: RegistryTable::new(),
                    services: HashMap::new(),
                    regets: RegetTracker::new(config.max_file_regets),
                    closed: false,
                }),
                sender,
                file_sender,
                dispatcher,
                me: me.clone(),
            }
        });

        tracing::info!(address = %local, "testfarm client started");
        Ok(Self { inner })
    }

    /// Address other peers reply to.
    pub fn local_address(&self) -> &Address {
        &self.inner.local
    }

    /// Submits `test` to the scheduling service at `service`.
    ///
    /// Validation failures, duplicate ids and an unreachable service are
    /// reported to `listener` through `test_failed` and returned as errors.
    pub async fn submit(
        &self,
        test: Test,
        listener: Arc<dyn TestListener>,
        service: Address,
    ) -> Result<()> {
        self.inner.submit(test, listener, service).await
    }

    /// Asks the service to stop a test.
    pub async fn cancel(&self, test_id: &str) -> Result<()> {
        self.inner.stop_test(test_id, None).await
    }

    /// Sends free text about a test to its service.
    pub async fn send_text(&self, test_id: &str, text: impl Into<String>) -> Result<()> {
        let service = {
            let state = self.inner.state.lock().await;
            state
                .registries
                .get(test_id)
                .map(|r| r.service.clone())
                .ok_or_else(|| TransportError::UnknownTest(test_id.to_string()))?
        };
        let message = Message::new(
            self.inner.local.clone(),
            service,
            Operation::Text(TextMessage {
                test_id: Some(test_id.to_string()),
                text: text.into(),
            }),
        );
        self.inner.sender.send(message)
    }

    /// Sends a product operation to `receiver`.
    pub fn send_product(&self, operation: ProductOperation, receiver: Address) -> Result<()> {
        let message = Message::new(
            self.inner.local.clone(),
            receiver,
            Operation::Product(operation),
        );
        self.inner.sender.send(message)
    }

    /// Ids of the tests currently tracked.
    pub async fn registered_tests(&self) -> Vec<String> {
        self.inner.state.lock().await.registries.ids()
    }

    /// Services with a live channel.
    pub async fn services(&self) -> Vec<Address> {
        let state = self.inner.state.lock().await;
        let mut services: Vec<Address> = state.services.keys().cloned().collect();
        services.sort();
        services
    }

    /// True once the client has shut down.
    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Resolves when the client has shut down.
    pub async fn closed(&self) {
        self.inner.cancel.cancelled().await
    }

    /// Deregisters from every service and stops all tasks.
    pub async fn shutdown(&self) {
        self.inner.shutdown().await
    }
}

impl std::fmt::Debug for FarmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FarmClient")
            .field("local", &self.inner.local)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ClientInner {
    fn registry_message(&self, service: &Address, code: RegistryOperationCode) -> Message {
        Message::new(
            self.local.clone(),
            service.clone(),
            Operation::Registry(RegistryOperation {
                code,
                category: RemoteCategory::Client,
                node: Some(NodeDescriptor {
                    hostname: self.local.host.clone(),
                    port: self.local.port,
                    description: Some(NODE_DESCRIPTION.to_string()),
                    products: Vec::new(),
                }),
            }),
        )
    }

    fn validate(test: &Test, service: &Address) -> Result<()> {
        validate_test_id(test.id())?;
        if !service.is_routable() {
            return Err(TransportError::InvalidAddress(service.to_string()));
        }
        test.check_environment()
    }

    async fn submit(
        &self,
        mut test: Test,
        listener: Arc<dyn TestListener>,
        service: Address,
    ) -> Result<()> {
        if let Err(e) = Self::validate(&test, &service) {
            tracing::warn!(test = test.id(), error = %e, "test rejected");
            listener.test_failed(&test, &e.to_string()).await;
            return Err(e);
        }

        let mut state = self.state.lock().await;
        let rejected = if state.closed || self.cancel.is_cancelled() {
            Some(TransportError::Shutdown("client".to_string()))
        } else if state.registries.contains(test.id()) {
            Some(TransportError::DuplicateTest(test.id().to_string()))
        } else {
            None
        };
        if let Some(e) = rejected {
            drop(state);
            listener.test_failed(&test, &e.to_string()).await;
            return Err(e);
        }

        let channel = match self.service_channel(&mut state, &service).await {
            Ok(channel) => channel,
            Err(e) => {
                drop(state);
                tracing::warn!(service = %service, error = %e, "service unreachable");
                let reason = format!("remote service {service} unreachable: {e}");
                listener.test_failed(&test, &reason).await;
                return Err(e);
            }
        };

        test.status = TestStatus::Pending;
        let start = Message::test(
            self.local.clone(),
            service.clone(),
            TestOperationCode::Start,
            test.clone(),
        );
        state
            .registries
            .insert(TestRegistry::new(test, listener, service))?;
        channel.send(start)?;
        Ok(())
    }

    /// Returns the live channel for `service`, registering first if needed.
    async fn service_channel(
        &self,
        state: &mut ClientState,
        service: &Address,
    ) -> Result<OutboundChannel> {
        if let Some(channel) = state.services.get(service) {
            if channel.is_running() {
                return Ok(channel.clone());
            }
        }

        self.transport
            .send(&self.registry_message(service, RegistryOperationCode::Register))
            .await?;
        tracing::info!(service = %service, "registered with service");

        let channel = OutboundChannel::spawn(
            self.config.channel(format!("service {service}")),
            Arc::new(MessageDeliverer::new(self.transport.clone())),
            Arc::new(ServiceFailures {
                client: self.me.clone(),
                service: service.clone(),
            }),
            Some(Arc::new(ServiceProbe {
                client: self.me.clone(),
                service: service.clone(),
            })),
            &self.cancel,
        );
        state.services.insert(service.clone(), channel.clone());
        Ok(channel)
    }

    async fn handle_control(&self, message: Message) {
        let sender = message.sender;
        match message.operation {
            Operation::Test(op) => self.on_test_operation(op).await,
            Operation::Text(text) => self.on_text(&sender, text).await,
            _ => {}
        }
    }

    async fn on_test_operation(&self, op: TestOperation) {
        let id = op.test.id().to_string();
        let mut state = self.state.lock().await;
        let Some(registry) = state.registries.get_mut(&id) else {
            tracing::debug!(test = %id, code = %op.code, "no registry for test, ignoring");
            return;
        };

        let transition = registry.apply(op.code, op.test);
        let listener = Arc::clone(&registry.listener);
        let snapshot = registry.test.clone();
        tracing::debug!(test = %id, status = snapshot.status.as_str(), ?transition, "test operation");

        if transition.is_terminal() {
            state.registries.remove(&id);
            state.regets.clear_test(&id);
        }
        let idle = self.close_if_idle(&mut state, transition.is_terminal());
        drop(state);

        let notice = match transition {
            Transition::Started => Some(Notice::Started(listener, snapshot)),
            Transition::Finished => Some(Notice::Finished(listener, snapshot)),
            Transition::Failed(reason) => Some(Notice::Failed(listener, snapshot, reason)),
            Transition::Updated | Transition::Ignored => None,
        };
        if let Some(notice) = notice {
            notice.deliver().await;
        }
        if idle {
            self.shutdown().await;
        }
    }

    async fn on_text(&self, sender: &Address, text: TextMessage) {
        let Some(test_id) = text.test_id.as_deref() else {
            tracing::info!(sender = %sender, text = %text.text, "message");
            return;
        };
        let notice = {
            let state = self.state.lock().await;
            state.registries.get(test_id).map(|r| {
                Notice::Message(Arc::clone(&r.listener), r.test.clone(), text.text.clone())
            })
        };
        match notice {
            Some(notice) => notice.deliver().await,
            None => tracing::debug!(test = test_id, "text for unknown test"),
        }
    }

    async fn handle_file(
        &self,
        message: Message,
        payload: &mut (dyn AsyncRead + Send + Unpin),
    ) {
        let peer = message.sender;
        let Operation::File(op) = message.operation else {
            return;
        };
        let context = {
            let state = self.state.lock().await;
            state
                .registries
                .get(&op.test_id)
                .map(|r| (Arc::clone(&r.listener), r.test.clone()))
        };
        let Some((listener, test)) = context else {
            tracing::debug!(test = %op.test_id, file = %op.file.name, "file operation for unknown test");
            if op.code == FileOperationCode::Put {
                self.drain(payload).await;
            }
            return;
        };
        if op.code == FileOperationCode::Put {
            if let Err(e) = op.file.directory(&test.workspace) {
                tracing::warn!(test = %op.test_id, peer = %peer, error = %e, "PUT refused");
                self.drain(payload).await;
                return;
            }
        }

        match op.code {
            FileOperationCode::Get => self.serve_get(peer, op, listener, &test).await,
            FileOperationCode::Put => self.receive_put(peer, op, payload, listener, &test).await,
            FileOperationCode::Abort => self.on_abort(peer, op, listener, test).await,
        }
    }

    async fn serve_get(
        &self,
        peer: Address,
        op: FileOperation,
        listener: Arc<dyn TestListener>,
        test: &Test,
    ) {
        let source = match op.file.directory(&test.workspace) {
            Ok(directory) => {
                let source = FileSource::new(Some(listener), directory, op.file.name.clone());
                match source.prefetch().await {
                    Ok(()) => Some(source),
                    Err(e) => {
                        tracing::warn!(test = %op.test_id, error = %e, "requested file not found");
                        None
                    }
                }
            }
            Err(e) => {
                tracing::warn!(test = %op.test_id, peer = %peer, error = %e, "GET refused");
                None
            }
        };
        let code = if source.is_some() {
            FileOperationCode::Put
        } else {
            FileOperationCode::Abort
        };
        let mut file = op.file;
        file.size = None;
        let reply = Message::file(self.local.clone(), peer, code, op.test_id, file);
        let item = match source {
            Some(source) => Outbound::with_source(reply, source),
            None => Outbound::message(reply),
        };
        if let Err(e) = self.file_sender.submit(item) {
            tracing::warn!(error = %e, "file reply not queued");
        }
    }

    async fn drain(&self, payload: &mut (dyn AsyncRead + Send + Unpin)) {
        let drained = tokio::time::timeout(
            self.config.read_timeout(),
            tokio::io::copy(payload, &mut tokio::io::sink()),
        )
        .await;
        tracing::debug!(?drained, "unclaimed PUT drained");
    }

    async fn receive_put(
        &self,
        peer: Address,
        op: FileOperation,
        payload: &mut (dyn AsyncRead + Send + Unpin),
        listener: Arc<dyn TestListener>,
        test: &Test,
    ) {
        let outcome = transfer::receive_file(
            payload,
            &op,
            &test.workspace,
            Some(listener.as_ref()),
            self.config.chunk_size,
            self.config.read_timeout(),
        )
        .await;

        let complete = match &outcome {
            Ok(report) if report.is_complete() => {
                tracing::info!(
                    test = %op.test_id,
                    file = %op.file.name,
                    bytes = report.received,
                    "file received"
                );
                true
            }
            Ok(report) => {
                tracing::warn!(
                    test = %op.test_id,
                    file = %op.file.name,
                    received = report.received,
                    declared = ?report.declared,
                    "file size mismatch"
                );
                false
            }
            Err(e) => {
                tracing::warn!(test = %op.test_id, file = %op.file.name, error = %e, "file receive failed");
                false
            }
        };

        let decision = {
            let mut state = self.state.lock().await;
            if complete {
                state.regets.clear(&op.test_id, &op.file.name);
                return;
            }
            state.regets.record_failure(&op.test_id, &op.file.name)
        };

        match decision {
            RegetDecision::Retry(attempt) => {
                tracing::info!(test = %op.test_id, file = %op.file.name, attempt, "requesting file again");
                let mut file = op.file.clone();
                file.size = None;
                let get = Message::file(
                    self.local.clone(),
                    peer,
                    FileOperationCode::Get,
                    op.test_id.clone(),
                    file,
                );
                if let Err(e) = self.file_sender.send(get) {
                    tracing::warn!(error = %e, "re-GET not queued");
                }
            }
            RegetDecision::GiveUp => {
                let reason = format!("file {} could not be transferred", op.file.name);
                if let Err(e) = self.stop_test(&op.test_id, Some(reason)).await {
                    tracing::debug!(error = %e, "stop after failed transfer");
                }
            }
        }
    }

    async fn on_abort(
        &self,
        peer: Address,
        op: FileOperation,
        listener: Arc<dyn TestListener>,
        test: Test,
    ) {
        self.state
            .lock()
            .await
            .regets
            .clear(&op.test_id, &op.file.name);
        tracing::warn!(test = %op.test_id, file = %op.file.name, peer = %peer, "transfer aborted");
        let text = format!("transfer of {} aborted by {peer}", op.file.name);
        Notice::Message(listener, test, text).deliver().await;
    }

    /// Sends STOP for a test. Without a live service channel the test is
    /// failed locally instead.
    async fn stop_test(&self, test_id: &str, reason: Option<String>) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(registry) = state.registries.get(test_id) else {
            return Err(TransportError::UnknownTest(test_id.to_string()));
        };
        let service = registry.service.clone();
        let mut snapshot = registry.test.clone();
        if reason.is_some() {
            snapshot.reason = reason.clone();
        }

        let channel = state.services.get(&service).filter(|c| c.is_running()).cloned();
        if let Some(channel) = channel {
            let stop = Message::test(
                self.local.clone(),
                service.clone(),
                TestOperationCode::Stop,
                snapshot,
            );
            if channel.send(stop).is_ok() {
                tracing::info!(test = test_id, "stop requested");
                return Ok(());
            }
        }

        let Some(registry) = state.registries.remove(test_id) else {
            return Ok(());
        };
        state.regets.clear_test(test_id);
        let idle = self.close_if_idle(&mut state, true);
        drop(state);

        let reason = reason.unwrap_or_else(|| format!("remote service {service} unavailable"));
        Notice::Failed(registry.listener, registry.test, reason)
            .deliver()
            .await;
        if idle {
            self.shutdown().await;
        }
        Ok(())
    }

    /// Fails every test bound to `service` and drops its channel.
    async fn service_disconnected(&self, service: &Address) {
        let mut state = self.state.lock().await;
        if let Some(channel) = state.services.remove(service) {
            channel.shutdown();
        }
        let lost = state.registries.drain_service(service);
        for registry in &lost {
            state.regets.clear_test(registry.id());
        }
        let idle = self.close_if_idle(&mut state, !lost.is_empty());
        drop(state);

        tracing::warn!(service = %service, tests = lost.len(), "service disconnected");
        let reason = format!("remote service {service} disconnected");
        for registry in lost {
            Notice::Failed(registry.listener, registry.test, reason.clone())
                .deliver()
                .await;
        }
        if idle {
            self.shutdown().await;
        }
    }

    /// CHECK for one test bound to `service`, or `None` when none is left.
    async fn idle_probe(&self, service: &Address) -> Option<Message> {
        let mut state = self.state.lock().await;
        let test = state
            .registries
            .bound_to(service)
            .into_iter()
            .next()
            .and_then(|id| state.registries.get(&id).map(|r| r.test.clone()));
        let Some(test) = test else {
            state.services.remove(service);
            return None;
        };
        tracing::debug!(service = %service, test = test.id(), "idle, checking test");
        Some(Message::test(
            self.local.clone(),
            service.clone(),
            TestOperationCode::Check,
            test,
        ))
    }

    /// Marks the client closed when the last test just left and shutdown on
    /// idle is enabled. Returns true when the caller must shut down.
    fn close_if_idle(&self, state: &mut ClientState, removed: bool) -> bool {
        if removed && self.config.shutdown_when_idle && !state.closed && state.registries.is_empty() {
            state.closed = true;
            return true;
        }
        false
    }

    async fn shutdown(&self) {
        let services: Vec<(Address, OutboundChannel)> = {
            let mut state = self.state.lock().await;
            state.closed = true;
            state.services.drain().collect()
        };
        if self.cancel.is_cancelled() {
            return;
        }

        for (service, channel) in services {
            channel.shutdown();
            let deregister = self.registry_message(&service, RegistryOperationCode::Deregister);
            if let Err(e) = self.transport.send(&deregister).await {
                tracing::debug!(service = %service, error = %e, "deregister failed");
            }
        }
        self.sender.shutdown();
        self.file_sender.shutdown();
        self.dispatcher.shutdown();
        self.cancel.cancel();
        tracing::info!(address = %self.local, "testfarm client stopped");
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct InboundRouter {
    client: Weak<ClientInner>,
}

#[async_trait]
impl InboundHandler for InboundRouter {
    async fn handle_control(&self, message: Message) {
        if let Some(client) = self.client.upgrade() {
            client.handle_control(message).await;
        }
    }

    async fn handle_file(&self, message: Message, payload: &mut (dyn AsyncRead + Send + Unpin)) {
        if let Some(client) = self.client.upgrade() {
            client.handle_file(message, payload).await;
        }
    }
}

struct ServiceFailures {
    client: Weak<ClientInner>,
    service: Address,
}

#[async_trait]
impl FailureHandler for ServiceFailures {
    async fn delivery_failed(&self, item: Outbound, error: TransportError) {
        tracing::warn!(
            service = %self.service,
            kind = item.message.kind().as_str(),
            error = %error,
            "service unreachable"
        );
        if let Some(client) = self.client.upgrade() {
            client.service_disconnected(&self.service).await;
        }
    }
}

struct ServiceProbe {
    client: Weak<ClientInner>,
    service: Address,
}

#[async_trait]
impl IdleProbe for ServiceProbe {
    async fn probe(&self) -> Option<Message> {
        let client = self.client.upgrade()?;
        client.idle_probe(&self.service).await
    }
}

/// A peer that cannot even take an ABORT gets the whole test stopped.
struct FileFailures {
    client: Weak<ClientInner>,
}

#[async_trait]
impl FailureHandler for FileFailures {
    async fn delivery_failed(&self, item: Outbound, error: TransportError) {
        let (Some(op), Some(code)) = (item.message.as_file(), item.sent_file_code()) else {
            return;
        };
        tracing::warn!(
            test = %op.test_id,
            file = %op.file.name,
            code = %code,
            receiver = %item.message.receiver,
            error = %error,
            "file operation dropped"
        );
        if code != FileOperationCode::Abort {
            return;
        }
        let Some(client) = self.client.upgrade() else {
            return;
        };
        let reason = format!("{} unreachable for file {}", item.message.receiver, op.file.name);
        if let Err(e) = client.stop_test(&op.test_id, Some(reason)).await {
            tracing::debug!(error = %e, "stop after failed ABORT");
        }
    }
}
