//! Dry-run of an error-queue triage against the in-memory broker.
//!
//! Run with `RUST_LOG=info cargo run --example triage`. Set `REQUEUE_STATE`
//! (`active`, `scheduled` or `deferred`) to peek a single message state.

use requeue::{
    EncryptionKey, Envelope, EnvelopeDecoder, Headers, InMemoryBroker, MessageState, QueueTriage,
    RelocationConfig, RelocationInstruction, codec::CodecChain, headers,
};
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

const ERROR_QUEUE: &str = "error";

fn failed_order(id: u32, key: &EncryptionKey) -> Envelope<Headers, Vec<u8>> {
    let mut headers = Headers::new();
    headers.insert(headers::MESSAGE_ID.into(), format!("order-{id}"));
    headers.insert(headers::SOURCE_QUEUE.into(), "orders".into());
    headers.insert(
        headers::ERROR_DETAILS.into(),
        "Timeout talking to the payment gateway".into(),
    );

    let body = format!(r#"{{"order_id": {id}, "amount": {}}}"#, id * 10);
    let message = CodecChain::standard(Some(key.clone()))
        .encode(body.into_bytes(), &mut headers)
        .expect("encoding a demo message");

    Envelope { headers, message }
}

#[tokio::main]
async fn main() {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .init();

    let key = EncryptionKey::from_bytes([42u8; 32]).unwrap();
    let broker = InMemoryBroker::new();
    for id in 1..=6 {
        broker.enqueue(ERROR_QUEUE, failed_order(id, &key));
    }

    let cancel = CancellationToken::new();
    let cancel_signal = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        cancel_signal.cancel();
    });

    let mut triage = QueueTriage::new(broker.queue(ERROR_QUEUE))
        .with_decoder(EnvelopeDecoder::with_key(key))
        .with_relocation_config(RelocationConfig::new().with_max_iterations(100))
        .with_cancellation(cancel);
    if let Ok(name) = std::env::var("REQUEUE_STATE") {
        let state: MessageState = name.parse().unwrap();
        triage = triage.with_state(state);
    }

    let mut cursor = 0;
    let mut instructions = Vec::new();
    loop {
        let page = triage.peek_paged(4, cursor).await.unwrap();
        if page.messages.is_empty() {
            break;
        }
        for message in &page.messages {
            println!("{} {}", message.id(), message.body());
            // retry even orders, drop the rest
            let instruction = if message.sequence_number() % 2 == 0 {
                RelocationInstruction::return_to_source(message.id())
            } else {
                RelocationInstruction::delete(message.id())
            };
            instructions.push(instruction);
        }
        cursor = page.next_sequence_number;
    }

    let report = triage.relocate(instructions, Some("parked")).await.unwrap();
    println!(
        "{}",
        serde_json::to_string_pretty(&report).expect("serializing the report")
    );
    println!(
        "orders: {}, error: {}",
        broker.depth("orders"),
        broker.depth(ERROR_QUEUE)
    );
}
