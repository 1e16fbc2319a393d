//! Per-screen chat session: owns the view-model for one open conversation
//! and the background pump feeding it sync events and realtime records.
//!
//! Closing (or dropping) the session stops the pump, which releases the
//! realtime subscription. Sends already handed to the sync engine carry on;
//! their results only land in the view while the session is alive.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::backend::{BackendError, MessageBackend, RealtimeFeed, RealtimeSubscription};
use crate::chat::{ChatEntry, ChatViewModel};
use crate::model::{
    ClientId, ConversationId, MessageBody, OutgoingMessage, PageRequest, QueuedMessage,
    RealtimeEvent, UserId, ValidationError,
};
use crate::store::{MessageStore, StoreError};
use crate::sync::{SweepReport, SyncEngine, SyncError, SyncEvent};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("invalid message: {0}")]
    Validation(#[from] ValidationError),
}

type SharedView = Arc<Mutex<ChatViewModel>>;

fn lock(view: &Mutex<ChatViewModel>) -> MutexGuard<'_, ChatViewModel> {
    view.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ChatSession<S: MessageStore, B: MessageBackend> {
    conversation_id: ConversationId,
    self_id: UserId,
    engine: Arc<SyncEngine<S, B>>,
    view: SharedView,
    pump: Option<JoinHandle<()>>,
}

impl<S, B> ChatSession<S, B>
where
    S: MessageStore + 'static,
    B: MessageBackend + 'static,
{
    /// Open a conversation screen.
    ///
    /// History and realtime failures degrade to manual refresh; only a
    /// failure to read the local queue is returned, since unsent messages
    /// would otherwise silently vanish from the screen.
    #[instrument(skip(engine, feed), fields(conversation_id = %conversation_id))]
    pub async fn open<R: RealtimeFeed + ?Sized>(
        engine: Arc<SyncEngine<S, B>>,
        feed: &R,
        conversation_id: ConversationId,
        self_id: UserId,
    ) -> Result<Self, SessionError> {
        // Subscribe before reading state so no status change slips between.
        let events = engine.subscribe();
        let page_size = engine.config().history_page_size;
        let mut view = ChatViewModel::new(conversation_id.clone(), self_id.clone(), page_size);

        let pending = engine.store().list_pending(Some(&conversation_id)).await?;
        view.restore_pending(pending);

        match engine
            .backend()
            .fetch_messages(&conversation_id, PageRequest::latest(page_size))
            .await
        {
            Ok(page) => view.load_latest(page),
            Err(e) => warn!("initial history load failed, showing local messages only: {}", e),
        }

        let realtime = match feed.subscribe(&conversation_id).await {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                warn!("realtime subscription failed, falling back to manual refresh: {}", e);
                None
            }
        };

        let view = Arc::new(Mutex::new(view));
        let pump = tokio::spawn(run_pump(
            Arc::clone(&engine),
            conversation_id.clone(),
            Arc::downgrade(&view),
            events,
            realtime,
        ));
        info!("chat session opened");

        Ok(Self {
            conversation_id,
            self_id,
            engine,
            view,
            pump: Some(pump),
        })
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Queue a message and show it right away.
    #[instrument(skip(self, body), fields(conversation_id = %self.conversation_id))]
    pub async fn send(&self, body: MessageBody) -> Result<QueuedMessage, SessionError> {
        let draft = OutgoingMessage::new(self.conversation_id.clone(), self.self_id.clone(), body);
        let entry = self.engine.enqueue(draft).await?;
        lock(&self.view).append_optimistic(entry.clone());
        // The sync loop may have acted on the entry before the bubble
        // existed; pick up whatever status it reached.
        match self.engine.store().get(&entry.client_id).await {
            Ok(Some(current)) => {
                lock(&self.view).apply_local_status(
                    &current.client_id,
                    current.sync_status,
                    current.last_error,
                );
            }
            Ok(None) => {}
            Err(e) => warn!(client_id = %entry.client_id, "could not re-read queued message: {}", e),
        }
        Ok(entry)
    }

    pub async fn send_text(&self, text: &str) -> Result<QueuedMessage, SessionError> {
        let body = MessageBody::text(text, self.engine.config().max_text_length)?;
        self.send(body).await
    }

    /// Fetch the page before the oldest shown message. Returns how many
    /// messages were added.
    #[instrument(skip(self), fields(conversation_id = %self.conversation_id))]
    pub async fn load_older(&self) -> Result<usize, SessionError> {
        let (more, oldest) = {
            let view = lock(&self.view);
            (view.has_more_history(), view.oldest_confirmed_at())
        };
        if !more {
            return Ok(0);
        }
        let limit = self.engine.config().history_page_size;
        let page = match oldest {
            Some(before) => PageRequest::before(limit, before),
            None => PageRequest::latest(limit),
        };
        let records = self
            .engine
            .backend()
            .fetch_messages(&self.conversation_id, page)
            .await?;
        let added = lock(&self.view).prepend_older(records);
        debug!(added, "older messages loaded");
        Ok(added)
    }

    /// Pull-to-refresh: retry this conversation's queue, then re-read the
    /// newest page (covers anything missed while realtime was down).
    #[instrument(skip(self), fields(conversation_id = %self.conversation_id))]
    pub async fn refresh(&self) -> Result<SweepReport, SessionError> {
        let report = self.engine.retry_conversation(&self.conversation_id).await?;
        let limit = self.engine.config().history_page_size;
        let page = self
            .engine
            .backend()
            .fetch_messages(&self.conversation_id, PageRequest::latest(limit))
            .await?;
        lock(&self.view).load_latest(page);
        Ok(report)
    }

    pub async fn discard(&self, client_id: &ClientId) -> Result<(), SessionError> {
        self.engine.discard(client_id).await?;
        lock(&self.view).remove_local(client_id);
        Ok(())
    }

    pub async fn pending_count(&self) -> Result<usize, SessionError> {
        Ok(self.engine.pending_count(&self.conversation_id).await?)
    }

    pub fn entries(&self) -> Vec<ChatEntry> {
        lock(&self.view).entries().to_vec()
    }

    pub fn has_more_history(&self) -> bool {
        lock(&self.view).has_more_history()
    }

    pub fn take_scroll_request(&self) -> bool {
        lock(&self.view).take_scroll_request()
    }

    /// Stop the pump and wait until the realtime subscription is released.
    pub async fn close(mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
            let _ = pump.await;
        }
        info!(conversation_id = %self.conversation_id, "chat session closed");
    }
}

impl<S: MessageStore, B: MessageBackend> Drop for ChatSession<S, B> {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

async fn next_realtime(subscription: &mut Option<RealtimeSubscription>) -> Option<RealtimeEvent> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

/// Bring local bubbles back in line after missed sync events. Entries that
/// left the queue meanwhile were confirmed or discarded.
async fn resync_local<S, B>(
    engine: &SyncEngine<S, B>,
    conversation_id: &ConversationId,
    view: &Mutex<ChatViewModel>,
) where
    S: MessageStore,
    B: MessageBackend,
{
    let pending = match engine.store().list_pending(Some(conversation_id)).await {
        Ok(pending) => pending,
        Err(e) => {
            warn!("could not re-read queue: {}", e);
            return;
        }
    };
    let queued: HashSet<ClientId> = pending.iter().map(|e| e.client_id.clone()).collect();
    let left_queue: Vec<ClientId> = {
        let mut view = lock(view);
        view.restore_pending(pending);
        view.local_client_ids()
            .into_iter()
            .filter(|id| !queued.contains(id))
            .collect()
    };
    if left_queue.is_empty() {
        return;
    }

    let mut missing = Vec::new();
    for client_id in left_queue {
        match engine.store().get(&client_id).await {
            Ok(Some(entry)) => {
                lock(view).apply_local_status(&client_id, entry.sync_status, entry.last_error);
            }
            Ok(None) => missing.push(client_id),
            Err(e) => warn!(client_id = %client_id, "could not re-read queued message: {}", e),
        }
    }

    let limit = engine.config().history_page_size;
    match engine
        .backend()
        .fetch_messages(conversation_id, PageRequest::latest(limit))
        .await
    {
        Ok(page) => lock(view).load_latest(page),
        Err(e) => warn!("could not refresh history after lag: {}", e),
    }

    let mut view = lock(view);
    for client_id in &missing {
        if view.remove_local(client_id) {
            debug!(client_id = %client_id, "dropped bubble for discarded message");
        }
    }
}

async fn run_pump<S, B>(
    engine: Arc<SyncEngine<S, B>>,
    conversation_id: ConversationId,
    view: Weak<Mutex<ChatViewModel>>,
    mut events: broadcast::Receiver<SyncEvent>,
    mut realtime: Option<RealtimeSubscription>,
) where
    S: MessageStore,
    B: MessageBackend,
{
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if event.conversation_id() != Some(&conversation_id) {
                        continue;
                    }
                    if let SyncEvent::Confirmed { client_id, .. } = &event {
                        // Confirmed record is now authoritative.
                        if let Err(e) = engine.store().remove(client_id).await {
                            debug!(client_id = %client_id, "could not drop synced entry: {}", e);
                        }
                    }
                    let Some(view) = view.upgrade() else { break };
                    lock(&view).apply_sync_event(&event);
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "sync events lagged, re-reading queue");
                    let Some(view) = view.upgrade() else { break };
                    resync_local(&engine, &conversation_id, &view).await;
                }
                Err(RecvError::Closed) => break,
            },
            event = next_realtime(&mut realtime) => match event {
                Some(event) => {
                    let Some(view) = view.upgrade() else { break };
                    lock(&view).apply_realtime(event);
                }
                None => {
                    warn!(conversation_id = %conversation_id, "realtime channel dropped");
                    realtime = None;
                }
            },
        }
    }
    debug!(conversation_id = %conversation_id, "session pump stopped");
}
