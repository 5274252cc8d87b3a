//! Bot worker pipeline against the in-memory broker.

use bot_worker::config::ReplyFilterConfig;
use bot_worker::handler;
use nats_consumer::memory::MemoryBroker;
use nats_consumer::{Consumer, ConsumerConfig, Publisher};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use test_utils::wait;

const INBOUND: &str = "wechat.message.received";
const OUTBOUND: &str = "wechat.message.send";
const WAIT: Duration = Duration::from_secs(5);

fn consumer(broker: &MemoryBroker) -> Consumer<MemoryBroker> {
    test_utils::init_test_tracing();
    Consumer::new(
        ConsumerConfig::new("memory://", INBOUND, "bot-worker")
            .with_concurrency(2)
            .with_pull_max_wait(Duration::from_millis(50)),
        broker.clone(),
    )
    .unwrap()
}

fn enqueue(broker: &MemoryBroker, value: serde_json::Value) -> u64 {
    broker.enqueue(INBOUND, serde_json::to_vec(&value).unwrap())
}

#[tokio::test]
async fn test_replies_to_filtered_messages() {
    let broker = MemoryBroker::new();
    let filter = ReplyFilterConfig {
        field: "/content".to_string(),
        pattern: "^@bot".to_string(),
    };
    let publisher: Arc<dyn Publisher> = Arc::new(broker.clone());
    let handler = handler::build(Some(&filter), Some(publisher), OUTBOUND, "> ").unwrap();

    let answered = enqueue(&broker, json!({ "id": "1", "sender": "alice", "content": "@bot ping", "attr": "friend" }));
    let skipped = enqueue(&broker, json!({ "id": "2", "sender": "alice", "content": "chatter", "attr": "friend" }));
    let malformed = broker.enqueue(INBOUND, b"not json".to_vec());
    let stranger = enqueue(
        &broker,
        json!({ "id": "3", "sender": "room", "content": "hello", "attr": "group" }),
    );

    let mut consumer = consumer(&broker);
    consumer.set_handler(handler).await;
    consumer.start().await.unwrap();

    wait::assert_eventually(
        WAIT,
        || {
            let stats = broker.stats();
            stats.total_acks() + stats.total_terms() == 4
        },
        "all messages resolved",
    )
    .await;

    // read the outbound subject before close drains the broker
    let replies: Vec<serde_json::Value> = broker
        .published(OUTBOUND)
        .iter()
        .map(|payload| serde_json::from_slice(payload).unwrap())
        .collect();
    consumer.close().await;

    let stats = broker.stats();
    assert_eq!(stats.acks.get(&answered), Some(&1));
    assert_eq!(stats.acks.get(&skipped), Some(&1));
    assert_eq!(stats.terms.get(&malformed), Some(&1));
    assert_eq!(stats.terms.get(&stranger), Some(&1));
    assert_eq!(stats.total_naks(), 0);

    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0]["reply_to_msg_id"], "1");
    assert_eq!(replies[0]["send_to_chat"], "alice");
    assert_eq!(replies[0]["content"], "> @bot ping");
}

#[tokio::test]
async fn test_without_producer_every_message_is_acked() {
    let broker = MemoryBroker::new();
    let handler = handler::build(None, None, "", "").unwrap();
    for i in 0..5 {
        enqueue(&broker, json!({ "id": i.to_string(), "sender": "bob", "content": "hi", "attr": "friend" }));
    }

    let mut consumer = consumer(&broker);
    consumer.set_handler(handler).await;
    consumer.start().await.unwrap();

    wait::assert_eventually(WAIT, || broker.stats().total_acks() == 5, "all messages acked").await;
    consumer.close().await;

    assert!(broker.published(OUTBOUND).is_empty());
    assert_eq!(broker.pending("bot-worker"), 0);
}
