use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use bindings::{AckMode, DestinationConfig, DestinationKind, ServiceConfig, ServiceId};
use broker::{ConnectionConfig, MemoryBroker};
use internals::Message;
use listener::ServiceListener;
use registry::{HandlerFault, MessageHandler};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(long, default_value = "vm://demo-broker")]
    broker_url: String,
    /// JSON file mapping service ids to service configs; built-in
    /// orders/alerts services are used when omitted.
    #[arg(long)]
    services: Option<String>,
    #[arg(long, default_value_t = 5)]
    messages_produced: u32,
    #[arg(long, default_value_t = 16)]
    message_payload_bytes: usize,
    #[arg(long, default_value_t = 100)]
    delay_ms: u64,
}

fn load_services(args: &Args) -> Result<BTreeMap<ServiceId, ServiceConfig>, Box<dyn std::error::Error>> {
    match &args.services {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&raw)?)
        }
        None => Ok(BTreeMap::from([
            (
                "orders-service".to_string(),
                ServiceConfig::queue("orders").with_ack_mode(AckMode::Client),
            ),
            (
                "alerts-service".to_string(),
                ServiceConfig::durable_topic("alerts", "sub1"),
            ),
        ])),
    }
}

struct PrintingHandler {
    service_id: String,
}

impl MessageHandler for PrintingHandler {
    fn handle(&self, message: &Message) -> Result<(), HandlerFault> {
        info!(
            service_id = %self.service_id,
            uuid = %message.uuid,
            payload = %message.payload,
            sent_at = message.header("sent-at").unwrap_or("?"),
            "handled message"
        );
        Ok(())
    }
}

fn printing_handler(service_id: &str) -> Arc<dyn MessageHandler> {
    Arc::new(PrintingHandler {
        service_id: service_id.to_string(),
    })
}

fn destination_of(config: &ServiceConfig) -> (DestinationKind, String) {
    match &config.destination {
        DestinationConfig::Queue { queue_name, .. } => {
            (DestinationKind::Queue, queue_name.clone())
        }
        DestinationConfig::Topic { topic_name, .. } => {
            (DestinationKind::Topic, topic_name.clone())
        }
    }
}

async fn run_demo(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let services = load_services(&args)?;
    let broker = MemoryBroker::new();
    let listener = ServiceListener::new(
        Arc::new(broker.clone()),
        ConnectionConfig::new(&args.broker_url),
    );

    for (service_id, config) in &services {
        listener
            .register(service_id, config, printing_handler(service_id))
            .await?;
    }

    let report = listener.start().await?;
    info!(activated = report.activated().len(), "listener started");

    info!(messages_to_produce = args.messages_produced, "producing messages");
    for n in 1..=args.messages_produced {
        let payload = n.to_string()
            + " "
            + &utils::generate_random_string(args.message_payload_bytes);
        let sent_at = utils::current_time_duration().as_millis().to_string();
        for config in services.values() {
            let (kind, name) = destination_of(config);
            broker.publish(
                kind,
                &name,
                Message::new(&payload).with_header("sent-at", &sent_at),
            );
        }
        tokio::time::sleep(Duration::from_millis(args.delay_ms)).await;
    }
    info!("produced all messages");

    // let the last deliveries drain before shutting down
    tokio::time::sleep(Duration::from_millis(250)).await;
    listener.stop(Duration::from_secs(1)).await;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    let subscriber = tracing_subscriber::fmt().compact().finish();
    tracing::subscriber::set_global_default(subscriber).expect("failed to setup demo logs");

    let args = Args::parse();
    run_demo(args).await?;

    info!("exiting demo");
    Ok(())
}
