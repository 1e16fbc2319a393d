//! Sync Engine.
//!
//! The only writer of `sending`, `synced` and `failed`. A sweep walks the
//! unsynced entries in enqueue order and pushes each one to the backend.
//! Per conversation, order is preserved: once an entry fails (or is found in
//! flight) the rest of that conversation waits for a later sweep. There is
//! no backoff; the sweep cadence and manual retry are the retry policy.

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::backend::MessageBackend;
use crate::config::{ConfigError, SyncConfig};
use crate::connectivity::ConnectivityMonitor;
use crate::model::{
    ClientId, ConversationId, ConversationMessage, OutgoingMessage, QueuedMessage,
    SendMessageRequest, SyncStatus, UnixTimeMs, ValidationError,
};
use crate::store::{MessageStore, StoreError};

const INTERRUPTED_ERROR: &str = "interrupted before the backend confirmed";
const UNRECORDED_ERROR: &str = "sent but the result could not be recorded";
/// Writes of a send outcome are retried this many times before giving up.
const SETTLE_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid message: {0}")]
    Validation(#[from] ValidationError),

    #[error("queue is full ({0} messages waiting)")]
    QueueFull(usize),
}

/// Emitted on every local status change, replacing any need to poll.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncEvent {
    StatusChanged {
        client_id: ClientId,
        conversation_id: ConversationId,
        status: SyncStatus,
        error: Option<String>,
    },
    Confirmed {
        client_id: ClientId,
        record: ConversationMessage,
    },
    Discarded {
        client_id: ClientId,
        conversation_id: ConversationId,
    },
    SweepFinished(SweepReport),
}

impl SyncEvent {
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            Self::StatusChanged {
                conversation_id, ..
            }
            | Self::Discarded {
                conversation_id, ..
            } => Some(conversation_id),
            Self::Confirmed { record, .. } => Some(&record.conversation_id),
            Self::SweepFinished(_) => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub attempted: usize,
    pub sent: usize,
    pub failed: usize,
    /// Left for a later sweep to keep per-conversation order.
    pub deferred: usize,
    pub skipped_in_flight: usize,
    pub pruned: usize,
    pub skipped_offline: bool,
    /// Stopped early on a connectivity-class failure.
    pub aborted: bool,
}

pub struct SyncEngine<S: MessageStore, B: MessageBackend> {
    store: Arc<S>,
    backend: Arc<B>,
    connectivity: ConnectivityMonitor,
    config: SyncConfig,
    events: broadcast::Sender<SyncEvent>,
    /// Serializes sweeps. Holds the entries an earlier sweep left in
    /// `sending` because their outcome could not be written.
    sweep_lock: Mutex<HashSet<ClientId>>,
    sweep_requested: Notify,
}

impl<S: MessageStore, B: MessageBackend> SyncEngine<S, B> {
    pub fn new(
        store: Arc<S>,
        backend: Arc<B>,
        connectivity: ConnectivityMonitor,
        config: SyncConfig,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        let (events, _) = broadcast::channel(config.event_buffer);
        Ok(Self {
            store,
            backend,
            connectivity,
            config,
            events,
            sweep_lock: Mutex::new(HashSet::new()),
            sweep_requested: Notify::new(),
        })
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SyncEvent) {
        // No receivers is fine: nobody is looking at that conversation.
        let _ = self.events.send(event);
    }

    fn emit_status(&self, entry: &QueuedMessage, status: SyncStatus, error: Option<String>) {
        self.emit(SyncEvent::StatusChanged {
            client_id: entry.client_id.clone(),
            conversation_id: entry.conversation_id.clone(),
            status,
            error,
        });
    }

    /// Persist a composed message as `pending` and nudge the sync loop.
    ///
    /// A persistence failure is returned, never swallowed: the message is
    /// not queued and the caller must tell the user.
    #[instrument(skip(self, draft), fields(conversation_id = %draft.conversation_id))]
    pub async fn enqueue(&self, draft: OutgoingMessage) -> Result<QueuedMessage, SyncError> {
        draft.body.validate(self.config.max_text_length)?;

        let waiting = self.store.count_pending(None).await?;
        if waiting >= self.config.max_queued_messages {
            warn!(waiting, "refusing to queue message, queue is full");
            return Err(SyncError::QueueFull(waiting));
        }

        let entry = self
            .store
            .enqueue(draft, UnixTimeMs::now())
            .await
            .map_err(|e| {
                error!("failed to persist queued message: {}", e);
                e
            })?;

        info!(client_id = %entry.client_id, "message queued");
        self.emit_status(&entry, SyncStatus::Pending, None);
        self.sweep_requested.notify_one();
        Ok(entry)
    }

    /// Number of unsynced messages in a conversation, read from the store.
    pub async fn pending_count(&self, conversation_id: &ConversationId) -> Result<usize, SyncError> {
        Ok(self.store.count_pending(Some(conversation_id)).await?)
    }

    /// Drop an unsent message the user deleted.
    #[instrument(skip(self), fields(client_id = %client_id))]
    pub async fn discard(&self, client_id: &ClientId) -> Result<QueuedMessage, SyncError> {
        let _guard = self.sweep_lock.lock().await;
        let entry = self.store.discard(client_id).await?;
        info!("queued message discarded");
        self.emit(SyncEvent::Discarded {
            client_id: entry.client_id.clone(),
            conversation_id: entry.conversation_id.clone(),
        });
        Ok(entry)
    }

    /// Ask the loop for a sweep without waiting for the timer.
    pub fn request_sweep(&self) {
        self.sweep_requested.notify_one();
    }

    #[instrument(skip(self))]
    pub async fn sweep(&self) -> Result<SweepReport, SyncError> {
        self.sweep_scope(None).await
    }

    /// Manual retry for one conversation (pull-to-refresh).
    #[instrument(skip(self), fields(conversation_id = %conversation_id))]
    pub async fn retry_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<SweepReport, SyncError> {
        self.sweep_scope(Some(conversation_id)).await
    }

    async fn sweep_scope(
        &self,
        scope: Option<&ConversationId>,
    ) -> Result<SweepReport, SyncError> {
        let mut report = SweepReport::default();
        if !self.connectivity.current().is_sync_worthy() {
            debug!("offline, sweep skipped");
            report.skipped_offline = true;
            return Ok(report);
        }

        let mut stranded = self.sweep_lock.lock().await;
        let entries = self.store.list_pending(scope).await?;
        let mut blocked: HashSet<ConversationId> = HashSet::new();

        for entry in entries {
            if report.aborted || blocked.contains(&entry.conversation_id) {
                report.deferred += 1;
                continue;
            }
            if !self.connectivity.current().is_sync_worthy() {
                info!("connectivity lost mid-sweep");
                report.aborted = true;
                report.deferred += 1;
                continue;
            }

            match entry.sync_status {
                SyncStatus::Pending | SyncStatus::Failed => {}
                SyncStatus::Sending if stranded.contains(&entry.client_id) => {
                    if let Err(e) = self
                        .settle(&entry.client_id, SyncStatus::Failed, Some(UNRECORDED_ERROR))
                        .await
                    {
                        warn!(client_id = %entry.client_id, "stranded entry still unwritable: {}", e);
                        report.skipped_in_flight += 1;
                        blocked.insert(entry.conversation_id.clone());
                        continue;
                    }
                    stranded.remove(&entry.client_id);
                }
                SyncStatus::Sending => {
                    report.skipped_in_flight += 1;
                    blocked.insert(entry.conversation_id.clone());
                    continue;
                }
                SyncStatus::Synced => continue,
            }

            if !self.send_one(&entry, &mut report, &mut stranded).await? {
                blocked.insert(entry.conversation_id.clone());
            }
        }

        let cutoff = UnixTimeMs::now().saturating_sub_ms(self.config.synced_retention_ms());
        match self.store.prune_synced(cutoff).await {
            Ok(pruned) => report.pruned = pruned,
            Err(e) => warn!("failed to prune synced messages: {}", e),
        }

        info!(
            sent = report.sent,
            failed = report.failed,
            deferred = report.deferred,
            aborted = report.aborted,
            "sweep finished"
        );
        self.emit(SyncEvent::SweepFinished(report.clone()));
        Ok(report)
    }

    /// Returns false when the conversation must not advance this sweep.
    async fn send_one(
        &self,
        entry: &QueuedMessage,
        report: &mut SweepReport,
        stranded: &mut HashSet<ClientId>,
    ) -> Result<bool, SyncError> {
        let client_id = &entry.client_id;
        let change = match self
            .store
            .mark_status(client_id, SyncStatus::Sending, None, UnixTimeMs::now())
            .await
        {
            Ok(change) => change,
            Err(StoreError::NotFound(_)) => {
                debug!(client_id = %client_id, "entry discarded before send");
                return Ok(true);
            }
            Err(e) => return Err(e.into()),
        };
        if !change.is_applied() {
            report.skipped_in_flight += 1;
            return Ok(false);
        }

        report.attempted += 1;
        self.emit_status(entry, SyncStatus::Sending, None);

        match self.backend.send_message(SendMessageRequest::from(entry)).await {
            Ok(record) => {
                debug!(client_id = %client_id, server_id = %record.id, "message confirmed");
                report.sent += 1;
                match self.settle(client_id, SyncStatus::Synced, None).await {
                    Ok(()) => self.emit_status(entry, SyncStatus::Synced, None),
                    Err(e) => {
                        // Left retryable: the resend carries the same
                        // client_id and the backend dedupes it.
                        error!(client_id = %client_id, "sent but could not mark synced: {}", e);
                        if let Err(e) = self
                            .settle(client_id, SyncStatus::Failed, Some(UNRECORDED_ERROR))
                            .await
                        {
                            error!(client_id = %client_id, "entry left in sending: {}", e);
                            stranded.insert(client_id.clone());
                        }
                    }
                }
                self.emit(SyncEvent::Confirmed {
                    client_id: client_id.clone(),
                    record,
                });
                Ok(true)
            }
            Err(err) => {
                warn!(
                    client_id = %client_id,
                    category = ?err.category,
                    code = %err.code,
                    "send failed"
                );
                let message = err.to_string();
                if let Err(e) = self
                    .settle(client_id, SyncStatus::Failed, Some(&message))
                    .await
                {
                    error!(client_id = %client_id, "could not record failed send: {}", e);
                    stranded.insert(client_id.clone());
                }
                report.failed += 1;
                if err.is_connectivity() {
                    report.aborted = true;
                }
                self.emit_status(entry, SyncStatus::Failed, Some(message));
                Ok(false)
            }
        }
    }

    /// Write the outcome of a send the backend has already answered.
    async fn settle(
        &self,
        client_id: &ClientId,
        status: SyncStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut attempt = 1;
        loop {
            match self
                .store
                .mark_status(client_id, status, error, UnixTimeMs::now())
                .await
            {
                Ok(_) => return Ok(()),
                Err(e) if attempt < SETTLE_ATTEMPTS => {
                    warn!(client_id = %client_id, attempt, "status write failed: {}", e);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Entries a previous process left in `sending` never got an answer;
    /// move them to `failed` so the next sweep retries them.
    #[instrument(skip(self))]
    pub async fn recover_interrupted(&self) -> Result<usize, SyncError> {
        let mut stranded = self.sweep_lock.lock().await;
        let mut recovered = 0;
        for entry in self.store.list_pending(None).await? {
            if entry.sync_status != SyncStatus::Sending {
                continue;
            }
            let change = self
                .store
                .mark_status(
                    &entry.client_id,
                    SyncStatus::Failed,
                    Some(INTERRUPTED_ERROR),
                    UnixTimeMs::now(),
                )
                .await?;
            stranded.remove(&entry.client_id);
            if change.is_applied() {
                recovered += 1;
                self.emit_status(&entry, SyncStatus::Failed, Some(INTERRUPTED_ERROR.into()));
            }
        }
        if recovered > 0 {
            warn!(recovered, "recovered interrupted sends");
        }
        Ok(recovered)
    }

    async fn sweep_logged(&self, trigger: &'static str) {
        debug!(trigger, "sweep triggered");
        if let Err(e) = self.sweep().await {
            error!(trigger, "sweep failed: {}", e);
        }
    }

    async fn run(&self, mut stop: oneshot::Receiver<()>) {
        info!(interval_secs = self.config.sweep_interval_secs, "sync loop started");
        if let Err(e) = self.recover_interrupted().await {
            error!("recovery failed: {}", e);
        }

        let mut connectivity = self.connectivity.watch();
        let mut watching = true;
        let mut worthy = connectivity.borrow_and_update().is_sync_worthy();
        if worthy {
            self.sweep_logged("startup").await;
        }

        let period = self.config.sweep_interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut stop => break,
                changed = connectivity.changed(), if watching => {
                    if changed.is_err() {
                        warn!("connectivity monitor gone, relying on timer");
                        watching = false;
                        continue;
                    }
                    let now_worthy = connectivity.borrow_and_update().is_sync_worthy();
                    // Only the edge into sync-worthy triggers, so flapping
                    // does not turn into a burst of sweeps.
                    let rising = now_worthy && !worthy;
                    worthy = now_worthy;
                    if rising {
                        self.sweep_logged("reconnect").await;
                    }
                }
                _ = ticker.tick() => {
                    if worthy {
                        self.sweep_logged("timer").await;
                    }
                }
                _ = self.sweep_requested.notified() => {
                    if worthy {
                        self.sweep_logged("requested").await;
                    }
                }
            }
        }
        info!("sync loop stopped");
    }
}

impl<S, B> SyncEngine<S, B>
where
    S: MessageStore + 'static,
    B: MessageBackend + 'static,
{
    /// Spawn the sync loop: sweep on start, on reconnect, on every timer
    /// tick and whenever a sweep is requested.
    pub fn start(self: &Arc<Self>) -> SyncTask {
        let (stop_tx, stop_rx) = oneshot::channel();
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move { engine.run(stop_rx).await });
        SyncTask {
            stop: Some(stop_tx),
            handle: Some(handle),
        }
    }
}

/// Handle to a running sync loop. Dropping it stops the loop after the
/// current sweep; an in-flight send is allowed to finish.
pub struct SyncTask {
    stop: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl SyncTask {
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                error!("sync loop ended abnormally: {}", e);
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for SyncTask {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}
