use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

use bindings::DestinationKind;
use broker::{ConnectionConfig, MemoryBroker};
use internals::Message;
use registry::{HandlerFault, MessageHandler};

use super::*;

pub const TEST_GRACE: Duration = Duration::from_millis(500);
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(2);
pub const SILENCE_WINDOW: Duration = Duration::from_millis(200);

static ONCE: Once = Once::new();

pub fn init_logging() {
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

pub fn setup_listener(broker: &MemoryBroker) -> ServiceListener {
    init_logging();
    ServiceListener::new(
        Arc::new(broker.clone()),
        ConnectionConfig::new("tcp://localhost:61616"),
    )
}

/// Forwards every successfully handled message to a stream the test can
/// drain; can be flipped into a faulting handler at any point.
pub struct RecordingHandler {
    delivered_tx: mpsc::UnboundedSender<Message>,
    fail: AtomicBool,
    in_flight: AtomicBool,
    overlapped: AtomicBool,
}

impl RecordingHandler {
    pub fn new() -> (Arc<Self>, UnboundedReceiverStream<Message>) {
        let (delivered_tx, delivered_rx) = mpsc::unbounded_channel();
        (
            Arc::new(RecordingHandler {
                delivered_tx,
                fail: AtomicBool::new(false),
                in_flight: AtomicBool::new(false),
                overlapped: AtomicBool::new(false),
            }),
            UnboundedReceiverStream::new(delivered_rx),
        )
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }
}

impl MessageHandler for RecordingHandler {
    fn handle(&self, message: &Message) -> Result<(), HandlerFault> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        let result = if self.fail.load(Ordering::SeqCst) {
            Err(HandlerFault("intentional test fault".to_string()))
        } else {
            let _ = self.delivered_tx.send(message.clone());
            Ok(())
        };
        self.in_flight.store(false, Ordering::SeqCst);
        result
    }
}

pub async fn expect_delivery(stream: &mut UnboundedReceiverStream<Message>) -> Message {
    tokio::time::timeout(DELIVERY_TIMEOUT, stream.next())
        .await
        .expect("timed out waiting for a delivery")
        .expect("delivery stream closed")
}

pub async fn expect_silence(stream: &mut UnboundedReceiverStream<Message>) {
    // a closed stream counts as silence; its handler may be gone already
    if let Ok(Some(message)) = tokio::time::timeout(SILENCE_WINDOW, stream.next()).await {
        panic!("unexpected delivery: {:?}", message);
    }
}

pub fn publish_to_queue(broker: &MemoryBroker, queue: &str, payload: &str) -> Message {
    let message = Message::new(payload);
    broker.publish(DestinationKind::Queue, queue, message.clone());
    message
}

pub fn publish_to_topic(broker: &MemoryBroker, topic: &str, payload: &str) -> Message {
    let message = Message::new(payload);
    broker.publish(DestinationKind::Topic, topic, message.clone());
    message
}

/// Polls `predicate` every 10 ms until it holds or `timeout` elapses.
pub async fn wait_until<F: Fn() -> bool>(predicate: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    predicate()
}
