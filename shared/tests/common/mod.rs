#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nest_core::{
    BackendError, ConversationId, ConversationMessage, DeliveryStatus, MessageBackend,
    PageRequest, RealtimeEvent, RealtimeFeed, RealtimeSubscription, SendMessageRequest,
    ServerMessageId, UnixTimeMs,
};
use tokio::sync::{mpsc, Semaphore};

/// Server record the backend stores for a request.
pub fn record_for(request: &SendMessageRequest) -> ConversationMessage {
    ConversationMessage {
        id: ServerMessageId::new(format!("srv-{}", request.client_id)),
        client_id: Some(request.client_id.clone()),
        conversation_id: request.conversation_id.clone(),
        sender_id: request.sender_id.clone(),
        body: request.body.clone(),
        created_at: UnixTimeMs::now(),
        delivery: DeliveryStatus::Sent,
    }
}

#[derive(Default)]
struct BackendState {
    failures: VecDeque<BackendError>,
    attempts: Vec<SendMessageRequest>,
    sent: Vec<SendMessageRequest>,
    history: Vec<ConversationMessage>,
    fetch_error: Option<BackendError>,
}

#[derive(Default)]
pub struct TestBackend {
    state: Mutex<BackendState>,
    gate: Option<Arc<Semaphore>>,
}

impl TestBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends block until [`TestBackend::release`] hands out a permit.
    pub fn gated() -> Self {
        Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Self::default()
        }
    }

    pub fn release(&self, sends: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(sends);
        }
    }

    pub fn fail_next(&self, error: BackendError) {
        self.state.lock().unwrap().failures.push_back(error);
    }

    pub fn fail_fetches(&self, error: Option<BackendError>) {
        self.state.lock().unwrap().fetch_error = error;
    }

    pub fn set_history(&self, history: Vec<ConversationMessage>) {
        self.state.lock().unwrap().history = history;
    }

    pub fn attempts(&self) -> Vec<SendMessageRequest> {
        self.state.lock().unwrap().attempts.clone()
    }

    pub fn sent(&self) -> Vec<SendMessageRequest> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn sent_texts(&self, conversation_id: &ConversationId) -> Vec<String> {
        self.sent()
            .iter()
            .filter(|r| &r.conversation_id == conversation_id)
            .map(|r| r.body.preview().to_string())
            .collect()
    }
}

#[async_trait::async_trait]
impl MessageBackend for TestBackend {
    async fn send_message(
        &self,
        request: SendMessageRequest,
    ) -> Result<ConversationMessage, BackendError> {
        self.state.lock().unwrap().attempts.push(request.clone());
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }
        let record = record_for(&request);
        state.sent.push(request);
        state.history.push(record.clone());
        Ok(record)
    }

    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
        page: PageRequest,
    ) -> Result<Vec<ConversationMessage>, BackendError> {
        let state = self.state.lock().unwrap();
        if let Some(error) = &state.fetch_error {
            return Err(error.clone());
        }
        let mut matching: Vec<ConversationMessage> = state
            .history
            .iter()
            .filter(|m| &m.conversation_id == conversation_id)
            .filter(|m| page.before.map_or(true, |before| m.created_at < before))
            .cloned()
            .collect();
        matching.sort_by_key(|m| m.created_at);
        let skip = matching.len().saturating_sub(page.limit as usize);
        Ok(matching.split_off(skip))
    }
}

/// Realtime double: tests push events into open channels.
#[derive(Default)]
pub struct TestFeed {
    channels: Mutex<HashMap<ConversationId, mpsc::Sender<RealtimeEvent>>>,
    released: Arc<AtomicUsize>,
    fail: Mutex<Option<BackendError>>,
}

impl TestFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_subscribe(&self, error: BackendError) {
        *self.fail.lock().unwrap() = Some(error);
    }

    pub async fn push(&self, event: RealtimeEvent) -> bool {
        let sender = self
            .channels
            .lock()
            .unwrap()
            .get(&event.record().conversation_id)
            .cloned();
        match sender {
            Some(sender) => sender.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Simulate the transport dropping the channel.
    pub fn drop_channel(&self, conversation_id: &ConversationId) {
        self.channels.lock().unwrap().remove(conversation_id);
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl RealtimeFeed for TestFeed {
    async fn subscribe(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<RealtimeSubscription, BackendError> {
        if let Some(error) = self.fail.lock().unwrap().clone() {
            return Err(error);
        }
        let (tx, rx) = mpsc::channel(64);
        self.channels
            .lock()
            .unwrap()
            .insert(conversation_id.clone(), tx);
        let released = Arc::clone(&self.released);
        Ok(RealtimeSubscription::new(conversation_id.clone(), rx)
            .on_release(move || {
                released.fetch_add(1, Ordering::SeqCst);
            }))
    }
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
