mod common;

use std::sync::Arc;

use invoice_messenger::rabbitmq::memory::MemoryTransport;
use invoice_messenger::rabbitmq::SubscriptionState;
use invoice_messenger::{BrokerClient, InboundDispatcher, InboundHandlers, QueueName};

use common::{envelope_bytes, eventually, test_config, RecordingHandlers, RecordingSink};

struct Fixture {
    transport: MemoryTransport,
    sink: Arc<RecordingSink>,
    dispatcher: Arc<InboundDispatcher>,
    cycle: tokio::task::JoinHandle<Result<(), invoice_messenger::BrokerError>>,
}

/// Spawn one subscribe-and-drain cycle and wait until the consumer is up.
/// Handlers record into the transport's event log so call order against
/// broker-side acks is observable.
async fn started(failing_handlers: bool) -> Fixture {
    let transport = MemoryTransport::new();
    let sink = RecordingSink::new();
    let client = BrokerClient::init(test_config(10), Arc::new(transport.clone()), sink.clone());

    let handlers: Arc<dyn InboundHandlers> = if failing_handlers {
        RecordingHandlers::failing(transport.log())
    } else {
        RecordingHandlers::new(transport.log())
    };
    let dispatcher = client.dispatcher(handlers);

    let cycle = tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move { dispatcher.start().await }
    });
    eventually(&transport.log(), "consume:invoices_in", 1).await;
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while dispatcher.state() != SubscriptionState::Subscribed {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("dispatcher did not reach Subscribed");

    Fixture {
        transport,
        sink,
        dispatcher,
        cycle,
    }
}

fn inbound() -> QueueName {
    QueueName::new("invoices_in")
}

#[tokio::test]
async fn ack_happens_after_handler_returns() {
    let fixture = started(false).await;
    let log = fixture.transport.log();

    assert!(fixture.transport.push_inbound(&inbound(), envelope_bytes("SetAddress")));
    eventually(&log, "ack", 1).await;

    let handler = log.position("handler:set_address").expect("handler ran");
    let ack = log.position("ack").expect("delivery acked");
    assert!(handler < ack, "ack must follow the handler call");
    assert_eq!(fixture.dispatcher.state(), SubscriptionState::Subscribed);
}

#[tokio::test]
async fn unknown_methods_are_acked_without_any_handler_call() {
    let fixture = started(false).await;
    let log = fixture.transport.log();

    fixture
        .transport
        .push_inbound(&inbound(), envelope_bytes("unknownthing"));
    eventually(&log, "ack", 1).await;

    assert!(log
        .entries()
        .iter()
        .all(|entry| !entry.starts_with("handler:")));
    assert!(fixture.sink.reports().is_empty());
}

#[tokio::test]
async fn method_routing_is_case_insensitive() {
    let fixture = started(false).await;
    let log = fixture.transport.log();

    for spelling in ["SetAddress", "SETADDRESS", "setaddress"] {
        fixture
            .transport
            .push_inbound(&inbound(), envelope_bytes(spelling));
    }
    eventually(&log, "ack", 3).await;

    assert_eq!(log.count_of("handler:set_address"), 3);
}

#[tokio::test]
async fn each_recognized_method_reaches_its_handler() {
    let fixture = started(false).await;
    let log = fixture.transport.log();

    fixture
        .transport
        .push_inbound(&inbound(), envelope_bytes("transactionseen"));
    fixture
        .transport
        .push_inbound(&inbound(), envelope_bytes("transactionconfirmed"));
    eventually(&log, "ack", 2).await;

    assert_eq!(log.count_of("handler:transaction_seen"), 1);
    assert_eq!(log.count_of("handler:transaction_confirmed"), 1);
}

#[tokio::test]
async fn poison_messages_are_reported_and_acked() {
    let fixture = started(false).await;
    let log = fixture.transport.log();

    fixture
        .transport
        .push_inbound(&inbound(), b"definitely not json".to_vec());
    eventually(&log, "ack", 1).await;

    assert!(fixture.sink.contains("decode"));
    assert!(log
        .entries()
        .iter()
        .all(|entry| !entry.starts_with("handler:")));
}

#[tokio::test]
async fn handler_failure_is_reported_but_still_acked() {
    let fixture = started(true).await;
    let log = fixture.transport.log();

    fixture
        .transport
        .push_inbound(&inbound(), envelope_bytes("setaddress"));
    eventually(&log, "ack", 1).await;

    assert_eq!(log.count_of("handler:set_address"), 1);
    assert!(fixture.sink.contains("set address handler boom"));
}

#[tokio::test]
async fn channel_loss_ends_the_cycle_and_clears_subscription() {
    let fixture = started(false).await;
    assert_eq!(fixture.dispatcher.state(), SubscriptionState::Subscribed);

    fixture.transport.kill_channel();

    fixture.cycle.await.unwrap().unwrap();
    assert_eq!(fixture.dispatcher.state(), SubscriptionState::NotSubscribed);
}

#[tokio::test]
async fn run_resubscribes_after_channel_loss() {
    let transport = MemoryTransport::new();
    let sink = RecordingSink::new();
    let client = BrokerClient::init(test_config(10), Arc::new(transport.clone()), sink.clone());
    let log = transport.log();

    let handlers = RecordingHandlers::new(log.clone());
    let dispatcher = client.dispatcher(handlers);
    let runner = tokio::spawn(dispatcher.clone().run());

    eventually(&log, "consume:invoices_in", 1).await;
    transport.kill_channel();
    eventually(&log, "consume:invoices_in", 2).await;

    // the fresh channel re-declared the topology before consuming again
    assert!(transport.channels_opened() >= 2);
    assert!(transport.declare_count(&inbound()) >= 2);

    transport.push_inbound(&inbound(), envelope_bytes("setaddress"));
    eventually(&log, "handler:set_address", 1).await;

    runner.abort();
}
