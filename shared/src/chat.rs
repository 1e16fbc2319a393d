//! Chat View-Model.
//!
//! One ordered list per conversation. Local entries (still owned by the
//! queue) and confirmed records live side by side as [`ChatEntry`] variants;
//! a confirmed record takes over the slot of the local entry or earlier
//! record it matches, so a bubble never moves or doubles when the send
//! response and the realtime echo both arrive.

use serde::{Deserialize, Serialize};

use crate::model::{
    ClientId, ConversationId, ConversationMessage, DeliveryStatus, MessageBody, QueuedMessage,
    RealtimeEvent, ServerMessageId, SyncStatus, UnixTimeMs, UserId,
};
use crate::sync::SyncEvent;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusGlyph {
    Sending,
    Failed,
    Sent,
    Delivered,
    Read,
}

impl From<DeliveryStatus> for StatusGlyph {
    fn from(status: DeliveryStatus) -> Self {
        match status {
            DeliveryStatus::Sent => Self::Sent,
            DeliveryStatus::Delivered => Self::Delivered,
            DeliveryStatus::Read => Self::Read,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChatEntry {
    Local(QueuedMessage),
    Confirmed(ConversationMessage),
}

impl ChatEntry {
    pub fn client_id(&self) -> Option<&ClientId> {
        match self {
            Self::Local(entry) => Some(&entry.client_id),
            Self::Confirmed(record) => record.client_id.as_ref(),
        }
    }

    pub fn server_id(&self) -> Option<&ServerMessageId> {
        match self {
            Self::Local(_) => None,
            Self::Confirmed(record) => Some(&record.id),
        }
    }

    pub fn sender_id(&self) -> &UserId {
        match self {
            Self::Local(entry) => &entry.sender_id,
            Self::Confirmed(record) => &record.sender_id,
        }
    }

    pub fn body(&self) -> &MessageBody {
        match self {
            Self::Local(entry) => &entry.body,
            Self::Confirmed(record) => &record.body,
        }
    }

    pub fn created_at(&self) -> UnixTimeMs {
        match self {
            Self::Local(entry) => entry.created_at,
            Self::Confirmed(record) => record.created_at,
        }
    }

    #[must_use]
    pub const fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }

    /// Local entries show their queue state; confirmed ones the backend's
    /// delivery state.
    pub fn glyph(&self) -> StatusGlyph {
        match self {
            Self::Local(entry) => match entry.sync_status {
                SyncStatus::Pending | SyncStatus::Sending => StatusGlyph::Sending,
                SyncStatus::Failed => StatusGlyph::Failed,
                SyncStatus::Synced => StatusGlyph::Sent,
            },
            Self::Confirmed(record) => record.delivery.into(),
        }
    }

    fn matches(&self, record: &ConversationMessage) -> bool {
        self.server_id() == Some(&record.id)
            || record
                .client_id
                .as_ref()
                .is_some_and(|id| self.client_id() == Some(id))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    Appended,
    /// Took over an existing slot; `reconciled` names the local entry it
    /// replaced, if it was one.
    Replaced { reconciled: Option<ClientId> },
    /// Belongs to another conversation, or updates a message not on screen.
    Ignored,
}

/// What a merge does with a record that matches nothing on screen.
#[derive(Clone, Copy)]
enum Unmatched {
    Append { scroll: bool },
    Ignore,
}

#[derive(Debug)]
pub struct ChatViewModel {
    conversation_id: ConversationId,
    self_id: UserId,
    page_size: u32,
    entries: Vec<ChatEntry>,
    has_more_history: bool,
    scroll_requested: bool,
}

impl ChatViewModel {
    pub fn new(conversation_id: ConversationId, self_id: UserId, page_size: u32) -> Self {
        Self {
            conversation_id,
            self_id,
            page_size,
            entries: Vec::new(),
            has_more_history: true,
            scroll_requested: false,
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_more_history(&self) -> bool {
        self.has_more_history
    }

    pub fn local_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_local()).count()
    }

    /// Client ids of bubbles still waiting for their confirmed record.
    pub fn local_client_ids(&self) -> Vec<ClientId> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                ChatEntry::Local(entry) => Some(entry.client_id.clone()),
                ChatEntry::Confirmed(_) => None,
            })
            .collect()
    }

    /// Returns and clears the pending auto-scroll request.
    pub fn take_scroll_request(&mut self) -> bool {
        std::mem::take(&mut self.scroll_requested)
    }

    fn position_of_client(&self, client_id: &ClientId) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.client_id() == Some(client_id))
    }

    /// Show a just-queued message before any network round-trip.
    pub fn append_optimistic(&mut self, entry: QueuedMessage) {
        if entry.conversation_id != self.conversation_id {
            return;
        }
        match self.position_of_client(&entry.client_id) {
            // Already confirmed; the record wins.
            Some(i) if !self.entries[i].is_local() => {}
            Some(i) => self.entries[i] = ChatEntry::Local(entry),
            None => self.entries.push(ChatEntry::Local(entry)),
        }
    }

    /// Merge a send response or realtime record.
    pub fn apply_confirmed(&mut self, record: ConversationMessage) -> MergeOutcome {
        self.merge(record, Unmatched::Append { scroll: true })
    }

    /// Inserts are new messages. Updates only touch messages already on
    /// screen; an update for one that is not loaded is dropped.
    pub fn apply_realtime(&mut self, event: RealtimeEvent) -> MergeOutcome {
        match event {
            RealtimeEvent::Insert(record) => self.apply_confirmed(record),
            RealtimeEvent::Update(record) => self.merge(record, Unmatched::Ignore),
        }
    }

    fn merge(&mut self, mut record: ConversationMessage, unmatched: Unmatched) -> MergeOutcome {
        if record.conversation_id != self.conversation_id {
            return MergeOutcome::Ignored;
        }

        let Some(index) = self.entries.iter().position(|e| e.matches(&record)) else {
            let Unmatched::Append { scroll } = unmatched else {
                return MergeOutcome::Ignored;
            };
            if scroll && record.sender_id != self.self_id {
                self.scroll_requested = true;
            }
            self.entries.push(ChatEntry::Confirmed(record));
            return MergeOutcome::Appended;
        };

        let reconciled = match &self.entries[index] {
            ChatEntry::Local(entry) => Some(entry.client_id.clone()),
            ChatEntry::Confirmed(existing) => {
                record.delivery = record.delivery.max(existing.delivery);
                if record.client_id.is_none() {
                    record.client_id = existing.client_id.clone();
                }
                None
            }
        };
        self.entries[index] = ChatEntry::Confirmed(record);
        MergeOutcome::Replaced { reconciled }
    }

    /// Update a local bubble's status. Confirmed entries are left alone.
    pub fn apply_local_status(
        &mut self,
        client_id: &ClientId,
        status: SyncStatus,
        error: Option<String>,
    ) -> bool {
        let Some(ChatEntry::Local(entry)) = self
            .position_of_client(client_id)
            .and_then(|i| self.entries.get_mut(i))
        else {
            return false;
        };
        if entry.sync_status == status {
            return false;
        }
        entry.sync_status = status;
        if status == SyncStatus::Sending {
            entry.attempts += 1;
        }
        if error.is_some() || status == SyncStatus::Synced {
            entry.last_error = error;
        }
        true
    }

    pub fn remove_local(&mut self, client_id: &ClientId) -> bool {
        match self.position_of_client(client_id) {
            Some(i) if self.entries[i].is_local() => {
                self.entries.remove(i);
                true
            }
            _ => false,
        }
    }

    /// Returns true when the event changed the list.
    pub fn apply_sync_event(&mut self, event: &SyncEvent) -> bool {
        match event {
            SyncEvent::StatusChanged {
                client_id,
                conversation_id,
                status,
                error,
            } if *conversation_id == self.conversation_id => {
                self.apply_local_status(client_id, *status, error.clone())
            }
            SyncEvent::Confirmed { record, .. } => {
                !matches!(self.apply_confirmed(record.clone()), MergeOutcome::Ignored)
            }
            SyncEvent::Discarded {
                client_id,
                conversation_id,
            } if *conversation_id == self.conversation_id => self.remove_local(client_id),
            _ => false,
        }
    }

    /// Merge the newest history page without scrolling. The first load also
    /// decides whether older pages exist.
    pub fn load_latest(&mut self, page: Vec<ConversationMessage>) {
        let first_load = !self.entries.iter().any(|e| !e.is_local());
        let count = page.len();
        let locals: Vec<ChatEntry> = if first_load {
            self.entries.drain(..).collect()
        } else {
            Vec::new()
        };
        for record in page {
            self.merge(record, Unmatched::Append { scroll: false });
        }
        // Unsent bubbles stay below the history they were composed after.
        for local in locals {
            match local {
                ChatEntry::Local(entry) => self.append_optimistic(entry),
                ChatEntry::Confirmed(record) => {
                    self.merge(record, Unmatched::Append { scroll: false });
                }
            }
        }
        if first_load {
            self.has_more_history = count >= self.page_size as usize;
        }
    }

    /// Re-apply queue state read from the store: adds missing local
    /// entries and refreshes statuses of existing ones.
    pub fn restore_pending(&mut self, pending: Vec<QueuedMessage>) {
        for entry in pending {
            match self.position_of_client(&entry.client_id) {
                Some(i) if self.entries[i].is_local() => self.entries[i] = ChatEntry::Local(entry),
                Some(_) => {}
                None => self.append_optimistic(entry),
            }
        }
    }

    /// Server timestamp to page back from.
    pub fn oldest_confirmed_at(&self) -> Option<UnixTimeMs> {
        self.entries.iter().find_map(|e| match e {
            ChatEntry::Confirmed(record) => Some(record.created_at),
            ChatEntry::Local(_) => None,
        })
    }

    /// Insert an older page at the top, skipping records already shown.
    /// Returns how many were inserted.
    pub fn prepend_older(&mut self, page: Vec<ConversationMessage>) -> usize {
        self.has_more_history = page.len() >= self.page_size as usize;
        let fresh: Vec<ChatEntry> = page
            .into_iter()
            .filter(|record| record.conversation_id == self.conversation_id)
            .filter(|record| !self.entries.iter().any(|e| e.matches(record)))
            .map(ChatEntry::Confirmed)
            .collect();
        let inserted = fresh.len();
        self.entries.splice(0..0, fresh);
        inserted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv() -> ConversationId {
        ConversationId::new("c1")
    }

    fn model() -> ChatViewModel {
        ChatViewModel::new(conv(), UserId::new("me"), 3)
    }

    fn local(client: &str, text: &str) -> QueuedMessage {
        QueuedMessage {
            client_id: ClientId::new(client),
            conversation_id: conv(),
            sender_id: UserId::new("me"),
            body: MessageBody::Text {
                content: text.into(),
            },
            created_at: UnixTimeMs(1_000),
            updated_at: UnixTimeMs(1_000),
            sync_status: SyncStatus::Pending,
            attempts: 0,
            last_error: None,
            seq: 1,
        }
    }

    fn record(server: &str, client: Option<&str>, sender: &str, at: u64) -> ConversationMessage {
        ConversationMessage {
            id: ServerMessageId::new(server),
            client_id: client.map(ClientId::new),
            conversation_id: conv(),
            sender_id: UserId::new(sender),
            body: MessageBody::Text {
                content: format!("msg {server}"),
            },
            created_at: UnixTimeMs(at),
            delivery: DeliveryStatus::Sent,
        }
    }

    #[test]
    fn optimistic_entry_shows_sending() {
        let mut vm = model();
        vm.append_optimistic(local("x", "hi"));
        assert_eq!(vm.len(), 1);
        assert_eq!(vm.entries()[0].glyph(), StatusGlyph::Sending);
        assert!(!vm.take_scroll_request());
    }

    #[test]
    fn confirmation_replaces_in_place() {
        let mut vm = model();
        vm.append_optimistic(local("a", "first"));
        vm.append_optimistic(local("b", "second"));

        let outcome = vm.apply_confirmed(record("s1", Some("a"), "me", 2_000));
        assert_eq!(
            outcome,
            MergeOutcome::Replaced {
                reconciled: Some(ClientId::new("a"))
            }
        );
        assert_eq!(vm.len(), 2);
        assert_eq!(vm.entries()[0].server_id(), Some(&ServerMessageId::new("s1")));
        assert!(vm.entries()[1].is_local());
        assert!(!vm.take_scroll_request());
    }

    #[test]
    fn echo_then_response_leaves_one_bubble() {
        let mut vm = model();
        vm.append_optimistic(local("x", "hi"));
        vm.apply_realtime(RealtimeEvent::Insert(record("s1", Some("x"), "me", 2_000)));
        let outcome = vm.apply_confirmed(record("s1", Some("x"), "me", 2_000));

        assert_eq!(outcome, MergeOutcome::Replaced { reconciled: None });
        assert_eq!(vm.len(), 1);
        assert!(!vm.entries()[0].is_local());
    }

    #[test]
    fn incoming_message_requests_scroll() {
        let mut vm = model();
        assert_eq!(
            vm.apply_confirmed(record("s9", None, "them", 5_000)),
            MergeOutcome::Appended
        );
        assert!(vm.take_scroll_request());
        assert!(!vm.take_scroll_request());
    }

    #[test]
    fn delivery_status_never_regresses() {
        let mut vm = model();
        vm.append_optimistic(local("x", "hi"));
        let mut read = record("s1", Some("x"), "me", 2_000);
        read.delivery = DeliveryStatus::Read;
        vm.apply_realtime(RealtimeEvent::Update(read));
        vm.apply_confirmed(record("s1", Some("x"), "me", 2_000));
        assert_eq!(vm.entries()[0].glyph(), StatusGlyph::Read);
    }

    #[test]
    fn other_conversation_is_ignored() {
        let mut vm = model();
        let mut other = record("s1", None, "them", 1);
        other.conversation_id = ConversationId::new("c2");
        assert_eq!(vm.apply_confirmed(other), MergeOutcome::Ignored);
        assert!(vm.is_empty());
    }

    #[test]
    fn local_status_updates_only_local_entries() {
        let mut vm = model();
        vm.append_optimistic(local("x", "hi"));
        assert!(vm.apply_local_status(&ClientId::new("x"), SyncStatus::Sending, None));
        assert!(vm.apply_local_status(
            &ClientId::new("x"),
            SyncStatus::Failed,
            Some("timeout".into())
        ));
        assert_eq!(vm.entries()[0].glyph(), StatusGlyph::Failed);

        vm.apply_confirmed(record("s1", Some("x"), "me", 2_000));
        assert!(!vm.apply_local_status(&ClientId::new("x"), SyncStatus::Failed, None));
        assert_eq!(vm.entries()[0].glyph(), StatusGlyph::Sent);
    }

    #[test]
    fn late_optimistic_append_does_not_duplicate_confirmed() {
        let mut vm = model();
        vm.apply_confirmed(record("s1", Some("x"), "me", 2_000));
        vm.append_optimistic(local("x", "hi"));
        assert_eq!(vm.len(), 1);
        assert!(!vm.entries()[0].is_local());
    }

    #[test]
    fn first_load_keeps_unsent_below_history() {
        let mut vm = model();
        vm.restore_pending(vec![local("x", "unsent")]);
        vm.load_latest(vec![
            record("s1", None, "them", 1_000),
            record("s2", None, "them", 2_000),
        ]);

        assert_eq!(vm.len(), 3);
        assert!(vm.entries()[2].is_local());
        assert!(!vm.has_more_history());
        assert!(!vm.take_scroll_request());
    }

    #[test]
    fn older_pages_prepend_without_duplicates() {
        let mut vm = model();
        vm.load_latest(vec![
            record("s4", None, "them", 4_000),
            record("s5", None, "them", 5_000),
            record("s6", None, "them", 6_000),
        ]);
        assert!(vm.has_more_history());
        assert_eq!(vm.oldest_confirmed_at(), Some(UnixTimeMs(4_000)));

        let inserted = vm.prepend_older(vec![
            record("s2", None, "them", 2_000),
            record("s3", None, "them", 3_000),
            record("s4", None, "them", 4_000),
        ]);
        assert_eq!(inserted, 2);
        assert_eq!(vm.len(), 5);
        assert_eq!(vm.entries()[0].server_id(), Some(&ServerMessageId::new("s2")));
        assert!(vm.has_more_history());

        vm.prepend_older(vec![record("s1", None, "them", 1_000)]);
        assert!(!vm.has_more_history());
    }

    #[test]
    fn sync_events_drive_local_entries() {
        let mut vm = model();
        vm.append_optimistic(local("x", "hi"));
        let failed = SyncEvent::StatusChanged {
            client_id: ClientId::new("x"),
            conversation_id: conv(),
            status: SyncStatus::Failed,
            error: Some("offline".into()),
        };
        assert!(vm.apply_sync_event(&failed));

        let discarded = SyncEvent::Discarded {
            client_id: ClientId::new("x"),
            conversation_id: conv(),
        };
        assert!(vm.apply_sync_event(&discarded));
        assert!(vm.is_empty());
    }

    #[test]
    fn restore_refreshes_existing_local_status() {
        let mut vm = model();
        vm.append_optimistic(local("x", "hi"));
        let mut stored = local("x", "hi");
        stored.sync_status = SyncStatus::Failed;
        vm.restore_pending(vec![stored]);
        assert_eq!(vm.len(), 1);
        assert_eq!(vm.entries()[0].glyph(), StatusGlyph::Failed);
    }

    #[test]
    fn update_for_unloaded_message_is_dropped() {
        let mut vm = model();
        vm.load_latest(vec![
            record("s9", None, "them", 9_000),
            record("s10", None, "them", 10_000),
        ]);
        assert!(!vm.take_scroll_request());

        let mut read = record("s1", None, "them", 1_000);
        read.delivery = DeliveryStatus::Read;
        assert_eq!(
            vm.apply_realtime(RealtimeEvent::Update(read)),
            MergeOutcome::Ignored
        );
        let ids: Vec<_> = vm
            .entries()
            .iter()
            .filter_map(|e| e.server_id().map(|id| id.as_str().to_string()))
            .collect();
        assert_eq!(ids, vec!["s9", "s10"]);
        assert!(!vm.take_scroll_request());

        let mut edited = record("s10", None, "them", 10_000);
        edited.delivery = DeliveryStatus::Read;
        assert_eq!(
            vm.apply_realtime(RealtimeEvent::Update(edited)),
            MergeOutcome::Replaced { reconciled: None }
        );
        assert_eq!(vm.entries()[1].glyph(), StatusGlyph::Read);
        assert!(!vm.take_scroll_request());
    }
}
