mod common;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use common::{record_for, TestBackend};
use nest_core::{
    BackendError, ChatViewModel, ClientId, ConnectivityMonitor, ConnectivityState,
    ConversationId, DeliveryStatus, MemoryStore, MessageBody, MessageStore, OutgoingMessage,
    QueuedMessage, RealtimeEvent, SendMessageRequest, StatusGlyph, SyncConfig, SyncEngine,
    SyncStatus, UnixTimeMs, UserId,
};
use proptest::prelude::*;

#[derive(Clone, Copy, Debug)]
enum Arrival {
    Optimistic,
    Response,
    Echo,
    ReadReceipt,
}

fn queued(client: &str) -> QueuedMessage {
    QueuedMessage {
        client_id: ClientId::new(client),
        conversation_id: ConversationId::new("c1"),
        sender_id: UserId::new("me"),
        body: MessageBody::Text {
            content: "hi".into(),
        },
        created_at: UnixTimeMs(1),
        updated_at: UnixTimeMs(1),
        sync_status: SyncStatus::Sending,
        attempts: 1,
        last_error: None,
        seq: 1,
    }
}

proptest! {
    #[test]
    fn one_bubble_per_client_id_in_any_arrival_order(
        order in Just(vec![
            Arrival::Optimistic,
            Arrival::Response,
            Arrival::Echo,
            Arrival::ReadReceipt,
        ])
        .prop_shuffle(),
        keep in proptest::collection::vec(any::<bool>(), 4),
    ) {
        let mut vm = ChatViewModel::new(ConversationId::new("c1"), UserId::new("me"), 50);
        let entry = queued("x");
        let record = record_for(&SendMessageRequest::from(&entry));
        let mut shown = false;
        let mut confirmed_seen = false;
        let mut read_seen = false;

        for (arrival, keep) in order.into_iter().zip(keep) {
            // Optimistic append always happens; the others may be lost.
            if !keep && !matches!(arrival, Arrival::Optimistic) {
                continue;
            }
            match arrival {
                Arrival::Optimistic => vm.append_optimistic(entry.clone()),
                Arrival::Response => {
                    vm.apply_confirmed(record.clone());
                    confirmed_seen = true;
                }
                Arrival::Echo => {
                    vm.apply_realtime(RealtimeEvent::Insert(record.clone()));
                    confirmed_seen = true;
                }
                Arrival::ReadReceipt => {
                    let mut read = record.clone();
                    read.delivery = DeliveryStatus::Read;
                    vm.apply_realtime(RealtimeEvent::Update(read));
                    // Updates only land on a bubble that is already shown.
                    if shown {
                        confirmed_seen = true;
                        read_seen = true;
                    }
                }
            }
            shown = !vm.is_empty();
        }

        let matching: Vec<_> = vm
            .entries()
            .iter()
            .filter(|e| e.client_id() == Some(&entry.client_id))
            .collect();
        prop_assert_eq!(matching.len(), 1);
        prop_assert_eq!(vm.len(), 1);
        prop_assert_eq!(!matching[0].is_local(), confirmed_seen);
        if read_seen {
            prop_assert_eq!(matching[0].server_id(), Some(&record.id));
            prop_assert_eq!(matching[0].glyph(), StatusGlyph::Read);
        }
    }
}

#[derive(Clone, Debug)]
enum Op {
    Enqueue(usize),
    Sweep,
    FailNext { network: bool },
    Online(bool),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0usize..3).prop_map(Op::Enqueue),
        3 => Just(Op::Sweep),
        2 => any::<bool>().prop_map(|network| Op::FailNext { network }),
        1 => any::<bool>().prop_map(Op::Online),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn queue_sends_each_message_once_in_conversation_order(
        ops in proptest::collection::vec(op(), 1..40),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let monitor = ConnectivityMonitor::new(ConnectivityState::ONLINE);
            let engine = Arc::new(
                SyncEngine::new(
                    Arc::new(MemoryStore::new()),
                    Arc::new(TestBackend::new()),
                    monitor.clone(),
                    SyncConfig::default(),
                )
                .unwrap(),
            );

            let mut enqueued: HashMap<ConversationId, Vec<ClientId>> = HashMap::new();
            for op in ops {
                match op {
                    Op::Enqueue(conv) => {
                        let conversation_id = ConversationId::new(format!("c{conv}"));
                        let draft = OutgoingMessage::new(
                            conversation_id.clone(),
                            UserId::new("me"),
                            MessageBody::text("m", 100).unwrap(),
                        );
                        let entry = engine.enqueue(draft).await.unwrap();
                        enqueued.entry(conversation_id).or_default().push(entry.client_id);
                    }
                    Op::Sweep => {
                        let before = engine.backend().attempts().len();
                        engine.sweep().await.unwrap();
                        let attempts = engine.backend().attempts();
                        let mut seen = HashSet::new();
                        for request in &attempts[before..] {
                            // At most one attempt per entry within a sweep.
                            prop_assert!(seen.insert(request.client_id.clone()));
                        }
                    }
                    Op::FailNext { network } => {
                        let error = if network {
                            BackendError::network("reset")
                        } else {
                            BackendError::rejected("23514", "check violation")
                        };
                        engine.backend().fail_next(error);
                    }
                    Op::Online(online) => {
                        let state = if online {
                            ConnectivityState::ONLINE
                        } else {
                            ConnectivityState::new(true, false)
                        };
                        monitor.update(state);
                    }
                }
            }

            // Drain: go online and sweep until everything is out.
            monitor.update(ConnectivityState::ONLINE);
            for _ in 0..100 {
                engine.sweep().await.unwrap();
                let waiting = engine.store().list_pending(None).await.unwrap();
                if waiting.is_empty() {
                    break;
                }
            }

            let sent = engine.backend().sent();
            let mut sent_ids = HashSet::new();
            for request in &sent {
                prop_assert!(sent_ids.insert(request.client_id.clone()), "sent twice");
            }
            for (conversation_id, expected) in &enqueued {
                let actual: Vec<ClientId> = sent
                    .iter()
                    .filter(|r| &r.conversation_id == conversation_id)
                    .map(|r| r.client_id.clone())
                    .collect();
                prop_assert_eq!(&actual, expected);
            }
            Ok(())
        })?;
    }
}
