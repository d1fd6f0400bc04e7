use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use market_chat::{
    ChatConfig, ChatError, ChatResult, ChatService,
    backbone::{MemoryBackbone, PubSub},
    models::ServerFrame,
    registry::Outbound,
    session::EvictReason,
    store::MemoryChatStore,
};
use serde_json::json;
use tokio::sync::mpsc;

fn start(config: ChatConfig, store: &MemoryChatStore, backbone: &MemoryBackbone) -> ChatService {
    let backbone = Arc::new(backbone.clone());
    ChatService::start(config, Arc::new(store.clone()), backbone.clone(), backbone)
}

fn marketplace_store() -> MemoryChatStore {
    let store = MemoryChatStore::new();
    store.add_conversation("listing-42", ["buyer", "seller"]);
    store
}

/// Polls `check` until it returns true or two seconds pass.
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn next_frame(rx: &mut mpsc::Receiver<Outbound>) -> ServerFrame {
    loop {
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(Outbound::Frame(frame))) => return frame,
            Ok(Some(Outbound::Ping)) => continue,
            Ok(None) => panic!("outbound queue closed"),
            Err(_) => panic!("timed out waiting for a frame"),
        }
    }
}

#[tokio::test]
async fn offline_recipient_accumulates_unread_and_sender_gets_no_echo() {
    let store = marketplace_store();
    let backbone = MemoryBackbone::new();
    let chat = &start(ChatConfig::default(), &store, &backbone);

    let (_buyer, mut buyer_rx) = chat.connect("buyer").await.unwrap();
    assert!(matches!(
        next_frame(&mut buyer_rx).await,
        ServerFrame::UnreadSummary { total: 0, .. }
    ));

    let message = chat
        .send_chat_frame("buyer", "listing-42", "hello")
        .await
        .unwrap();
    assert!(!message.is_read);
    assert_eq!(store.messages("listing-42"), vec![message]);

    assert!(
        eventually(|| async move {
            chat.get_unread_summary("seller").await.unwrap().total_unread == 1
        })
        .await
    );
    let summary = chat.get_unread_summary("seller").await.unwrap();
    assert_eq!(summary.chat_unread.get("listing-42"), Some(&1));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(buyer_rx.try_recv().is_err());
    chat.shutdown().await;
}

#[tokio::test]
async fn burst_of_messages_arrives_in_order() {
    let store = marketplace_store();
    let backbone = MemoryBackbone::new();
    let config = ChatConfig {
        outbound_capacity: 256,
        ..ChatConfig::default()
    };
    let chat = &start(config, &store, &backbone);

    let (seller, mut seller_rx) = chat.connect("seller").await.unwrap();
    next_frame(&mut seller_rx).await;

    for i in 0..200 {
        let content = ((b'a' + (i % 26) as u8) as char).to_string();
        chat.send_chat_frame("buyer", "listing-42", &content)
            .await
            .unwrap();
    }

    let stored = store.messages("listing-42");
    for expected in stored.iter() {
        match next_frame(&mut seller_rx).await {
            ServerFrame::Message { message, .. } => assert_eq!(message.id, expected.id),
            other => panic!("unexpected frame {other:?}"),
        }
    }
    assert!(!seller.is_closed());
    assert!(chat.is_online("seller").await.unwrap());
    chat.shutdown().await;
}

#[tokio::test]
async fn slow_consumer_is_evicted_and_marked_offline() {
    let store = marketplace_store();
    let backbone = MemoryBackbone::new();
    let config = ChatConfig {
        outbound_capacity: 10,
        ..ChatConfig::default()
    };
    let chat = &start(config, &store, &backbone);

    let (seller, mut seller_rx) = chat.connect("seller").await.unwrap();
    // Drain the unread summary so the queue starts empty.
    next_frame(&mut seller_rx).await;

    for i in 0..50 {
        chat.send_chat_frame("buyer", "listing-42", &format!("offer {i}"))
            .await
            .unwrap();
    }

    let seller = &seller;
    assert!(eventually(|| async move { seller.is_closed() }).await);
    assert!(
        eventually(|| async move { !chat.is_online("seller").await.unwrap() }).await,
        "evicted user should be offline"
    );
    assert!(chat.sessions().registry().lookup("seller").await.is_none());

    let mut buffered = 0;
    while let Ok(Outbound::Frame(ServerFrame::Message { .. })) = seller_rx.try_recv() {
        buffered += 1;
    }
    assert_eq!(buffered, 10);
    assert_eq!(store.messages("listing-42").len(), 50);
    chat.shutdown().await;
}

#[tokio::test]
async fn unresponsive_connection_is_evicted_within_two_sweeps() {
    let store = marketplace_store();
    let backbone = MemoryBackbone::new();
    let config = ChatConfig {
        heartbeat_interval: Duration::from_millis(100),
        ..ChatConfig::default()
    };
    let chat = &start(config, &store, &backbone);

    let (seller, _seller_rx) = chat.connect("seller").await.unwrap();
    chat.join(&seller, "listing-42").await.unwrap();
    assert!(chat.is_online("seller").await.unwrap());

    // Nobody answers the pings.
    tokio::time::sleep(Duration::from_millis(350)).await;

    assert!(seller.is_closed());
    assert!(chat.sessions().registry().lookup("seller").await.is_none());
    assert!(chat.sessions().rooms().members_of("listing-42").is_empty());
    assert!(!chat.is_online("seller").await.unwrap());
    chat.shutdown().await;
}

#[tokio::test]
async fn responsive_connection_survives_sweeps() {
    let store = marketplace_store();
    let backbone = MemoryBackbone::new();
    let config = ChatConfig {
        heartbeat_interval: Duration::from_millis(50),
        ..ChatConfig::default()
    };
    let chat = &start(config, &store, &backbone);

    let (seller, mut seller_rx) = chat.connect("seller").await.unwrap();
    let responder = {
        let seller = seller.clone();
        tokio::spawn(async move {
            while let Some(item) = seller_rx.recv().await {
                if item == Outbound::Ping {
                    seller.mark_alive();
                }
            }
        })
    };

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!seller.is_closed());
    assert!(chat.is_online("seller").await.unwrap());
    responder.abort();
    chat.shutdown().await;
}

#[tokio::test]
async fn reconnect_supersedes_previous_connection() {
    let store = marketplace_store();
    let backbone = MemoryBackbone::new();
    let chat = &start(ChatConfig::default(), &store, &backbone);

    let (first, _rx1) = chat.connect("seller").await.unwrap();
    let (second, mut rx2) = chat.connect("seller").await.unwrap();
    assert!(first.is_closed());

    // Late cleanup of the first socket leaves the new one alone.
    chat.disconnect(&first, EvictReason::Closed)
        .await;
    assert!(chat.is_online("seller").await.unwrap());

    next_frame(&mut rx2).await;
    chat.send_chat_frame("buyer", "listing-42", "still available?")
        .await
        .unwrap();
    assert!(matches!(
        next_frame(&mut rx2).await,
        ServerFrame::Message { .. }
    ));
    assert!(!second.is_closed());
    chat.shutdown().await;
}

#[tokio::test]
async fn messages_cross_processes_exactly_once() {
    let store = marketplace_store();
    let backbone = MemoryBackbone::new();
    let node_a = start(ChatConfig::default(), &store, &backbone);
    let node_b = start(ChatConfig::default(), &store, &backbone);
    // Let both bus subscribers attach.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (_buyer, mut buyer_rx) = node_a.connect("buyer").await.unwrap();
    let (_seller, mut seller_rx) = node_b.connect("seller").await.unwrap();
    next_frame(&mut buyer_rx).await;
    next_frame(&mut seller_rx).await;

    let message = node_a
        .send_chat_frame("buyer", "listing-42", "is this still for sale?")
        .await
        .unwrap();

    match next_frame(&mut seller_rx).await {
        ServerFrame::Message { message: got, .. } => assert_eq!(got.id, message.id),
        other => panic!("unexpected frame {other:?}"),
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(seller_rx.try_recv().is_err());
    assert!(buyer_rx.try_recv().is_err());
    assert_eq!(
        node_b.get_unread_summary("seller").await.unwrap().total_unread,
        1
    );

    node_a.shutdown().await;
    node_b.shutdown().await;
}

#[tokio::test]
async fn read_receipt_resets_unread_and_notifies_room() {
    let store = marketplace_store();
    let backbone = MemoryBackbone::new();
    let chat = &start(ChatConfig::default(), &store, &backbone);

    let (buyer, mut buyer_rx) = chat.connect("buyer").await.unwrap();
    chat.join(&buyer, "listing-42").await.unwrap();
    next_frame(&mut buyer_rx).await;

    chat.send_chat_frame("buyer", "listing-42", "hello")
        .await
        .unwrap();
    assert!(
        eventually(|| async move {
            chat.get_unread_summary("seller").await.unwrap().total_unread == 1
        })
        .await
    );

    chat.mark_read("seller", "listing-42").await.unwrap();
    chat.mark_read("seller", "listing-42").await.unwrap();
    assert_eq!(
        chat.get_unread_summary("seller").await.unwrap().total_unread,
        0
    );
    assert!(store.messages("listing-42")[0].is_read);
    assert!(matches!(
        next_frame(&mut buyer_rx).await,
        ServerFrame::Read { .. }
    ));
    chat.shutdown().await;
}

#[tokio::test]
async fn rejected_messages_leave_no_trace() {
    let store = marketplace_store();
    let backbone = MemoryBackbone::new();
    let chat = &start(ChatConfig::default(), &store, &backbone);

    let err = chat
        .send_chat_frame("stranger", "listing-42", "hi")
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Permission { .. }));

    let too_long = "x".repeat(1001);
    let err = chat
        .send_chat_frame("buyer", "listing-42", &too_long)
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Validation(_)));

    assert!(store.messages("listing-42").is_empty());
    assert_eq!(
        chat.get_unread_summary("seller").await.unwrap().total_unread,
        0
    );
    chat.shutdown().await;
}

#[tokio::test]
async fn backend_outage_degrades_to_local_delivery() {
    let store = marketplace_store();
    let backbone = MemoryBackbone::new();
    let chat = &start(ChatConfig::default(), &store, &backbone);

    let (_seller, mut seller_rx) = chat.connect("seller").await.unwrap();
    next_frame(&mut seller_rx).await;
    backbone.set_available(false);

    chat.send_chat_frame("buyer", "listing-42", "anyone there?")
        .await
        .unwrap();
    assert!(matches!(
        next_frame(&mut seller_rx).await,
        ServerFrame::Message { .. }
    ));
    assert!(!chat.health().await.is_healthy());
    chat.shutdown().await;
}

/// Bus backend that accepts publishes and never completes them.
struct StalledBus;

#[async_trait]
impl PubSub for StalledBus {
    async fn publish(&self, _channel: &str, _payload: String) -> ChatResult<()> {
        std::future::pending().await
    }

    async fn subscribe(&self, _channel: &str) -> ChatResult<BoxStream<'static, String>> {
        Ok(stream::pending().boxed())
    }
}

#[tokio::test]
async fn stalled_bus_does_not_hold_up_local_delivery() {
    let store = marketplace_store();
    let kv = Arc::new(MemoryBackbone::new());
    let config = ChatConfig {
        publish_timeout: Duration::from_millis(100),
        ..ChatConfig::default()
    };
    let chat = ChatService::start(config, Arc::new(store.clone()), kv, Arc::new(StalledBus));

    let (_seller, mut seller_rx) = chat.connect("seller").await.unwrap();
    next_frame(&mut seller_rx).await;

    let started = Instant::now();
    for i in 0..3 {
        chat.send_chat_frame("buyer", "listing-42", &format!("offer {i}"))
            .await
            .unwrap();
    }
    assert!(started.elapsed() < Duration::from_secs(1));

    for _ in 0..3 {
        assert!(matches!(
            next_frame(&mut seller_rx).await,
            ServerFrame::Message { .. }
        ));
    }
    assert_eq!(store.messages("listing-42").len(), 3);
    chat.shutdown().await;
}

#[tokio::test]
async fn broadcast_reaches_every_user_on_every_process() {
    let store = marketplace_store();
    let backbone = MemoryBackbone::new();
    let node_a = start(ChatConfig::default(), &store, &backbone);
    let node_b = start(ChatConfig::default(), &store, &backbone);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (_buyer, mut buyer_rx) = node_a.connect("buyer").await.unwrap();
    let (_browser, mut browser_rx) = node_a.connect("browser").await.unwrap();
    let (_seller, mut seller_rx) = node_b.connect("seller").await.unwrap();
    for rx in [&mut buyer_rx, &mut browser_rx, &mut seller_rx] {
        next_frame(rx).await;
    }

    let delivered = node_a
        .broadcast_to_all("maintenance", json!({"starts_in_minutes": 10}))
        .await
        .unwrap();
    assert_eq!(delivered, 2);

    for rx in [&mut buyer_rx, &mut browser_rx, &mut seller_rx] {
        match next_frame(rx).await {
            ServerFrame::Broadcast { event, data, .. } => {
                assert_eq!(event, "maintenance");
                assert_eq!(data["starts_in_minutes"], 10);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(buyer_rx.try_recv().is_err());
    assert!(seller_rx.try_recv().is_err());

    let err = node_a.broadcast_to_all("  ", json!(null)).await.unwrap_err();
    assert!(matches!(err, ChatError::Validation(_)));

    node_a.shutdown().await;
    node_b.shutdown().await;
}

#[tokio::test]
async fn reply_to_a_full_queue_evicts_the_client() {
    let store = marketplace_store();
    let backbone = MemoryBackbone::new();
    let config = ChatConfig {
        outbound_capacity: 1,
        ..ChatConfig::default()
    };
    let chat = &start(config, &store, &backbone);

    // The unread summary already fills the single slot.
    let (seller, _seller_rx) = chat.connect("seller").await.unwrap();
    assert!(!chat.reply(&seller, ServerFrame::pong()).await);

    assert!(seller.is_closed());
    assert!(chat.sessions().registry().lookup("seller").await.is_none());
    assert!(!chat.is_online("seller").await.unwrap());
    chat.shutdown().await;
}

#[tokio::test]
async fn closed_connection_cannot_join_a_room() {
    let store = marketplace_store();
    let backbone = MemoryBackbone::new();
    let chat = &start(ChatConfig::default(), &store, &backbone);

    let (seller, _seller_rx) = chat.connect("seller").await.unwrap();
    chat.disconnect(&seller, EvictReason::Closed).await;

    let err = chat.join(&seller, "listing-42").await.unwrap_err();
    assert!(matches!(err, ChatError::Transport(_)));
    assert!(chat.sessions().rooms().members_of("listing-42").is_empty());
    assert_eq!(chat.sessions().rooms().room_count(), 0);
    chat.shutdown().await;
}
