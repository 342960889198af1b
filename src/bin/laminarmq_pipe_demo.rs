//! Publishes a stream of records and consumes them back through a consumer group until Ctrl-C.
//!
//! Configuration is read from the JSON file named by `LAMINARMQ_CLIENT_CONFIG`, or from
//! `LAMINARMQ_BROKERS` (comma separated). Without brokers a loopback broker is started in
//! process.

use laminarmq_client::{
    broker::in_memory::{BrokerConfig, InMemoryBroker, InMemoryConnector},
    prelude::*,
};
use std::{env, fs, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{error, info, info_span, instrument, warn, Instrument};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_TOPIC: &str = "laminarmq-demo";
const DEFAULT_GROUP: &str = "laminarmq-demo-group";
const PUBLISH_INTERVAL: Duration = Duration::from_millis(250);
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

struct Settings {
    config: Config,
    loopback: bool,
    topic: String,
    group_id: String,
}

fn settings() -> Result<Settings> {
    let (config, loopback) = match env::var("LAMINARMQ_CLIENT_CONFIG") {
        Ok(path) => {
            let json = fs::read_to_string(&path).map_err(|err| {
                Error::config_invalid(format!("unable to read {}: {}", path, err))
            })?;

            (Config::from_json(&json)?, false)
        }
        Err(_) => match env::var("LAMINARMQ_BROKERS") {
            Ok(brokers) => (
                Config::with_brokers(brokers.split(',').map(str::trim)),
                false,
            ),
            Err(_) => (
                Config::with_brokers([BrokerConfig::default().address]),
                true,
            ),
        },
    };

    Ok(Settings {
        config,
        loopback,
        topic: env::var("LAMINARMQ_TOPIC").unwrap_or_else(|_| DEFAULT_TOPIC.into()),
        group_id: env::var("LAMINARMQ_GROUP").unwrap_or_else(|_| DEFAULT_GROUP.into()),
    })
}

#[instrument(skip_all, fields(topic = %settings.topic))]
async fn run_pipe<C: Connector>(
    coordinator: DeliveryCoordinator<C>,
    settings: Settings,
    mut signal_rx: mpsc::Receiver<()>,
) -> Result<()> {
    let handler = handler_fn(|record: ConsumerRecord| async move {
        info!(
            topic_partition = %record.topic_partition,
            offset = record.offset,
            payload = %String::from_utf8_lossy(&record.payload),
            "consumed record"
        );

        Ok(())
    });

    coordinator
        .subscribe(
            &settings.topic,
            &settings.group_id,
            handler,
            SubscribeOptions {
                dead_letters: Some(coordinator.topic_dead_letters()),
                ..Default::default()
            },
        )
        .await?;

    coordinator.start()?;

    let coordinator = Arc::new(coordinator);
    let mut ticker = tokio::time::interval(PUBLISH_INTERVAL);

    for sequence in 0u64.. {
        tokio::select! {
            _ = signal_rx.recv() => break,
            _ = ticker.tick() => {}
        }

        let key = format!("key-{}", sequence % 4);
        let payload = format!("message #{}", sequence);

        let delivery = match coordinator
            .publish(&settings.topic, Some(key.into()), payload)
            .await
        {
            Ok(delivery) => delivery,
            Err(err) => {
                warn!(error = %err, "publish failed");
                continue;
            }
        };

        tokio::spawn(
            async move {
                match delivery.await {
                    Ok(ack) => info!(
                        topic_partition = %ack.topic_partition,
                        offset = ack.offset,
                        "record acknowledged"
                    ),
                    Err(err) => error!(error = %err, "record delivery failed"),
                }
            }
            .instrument(info_span!("delivery", sequence)),
        );
    }

    coordinator.stop(STOP_TIMEOUT).await
}

#[cfg(not(tarpaulin_include))]
#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "laminarmq_client=debug,laminarmq_pipe_demo=info".into()),
        )
        .with(fmt::layer())
        .init();

    let (signal_tx, signal_rx) = mpsc::channel::<()>(1);

    ctrlc_async::set_async_handler(
        async move {
            info!("Received CTRL+C.");
            signal_tx
                .send(())
                .await
                .expect("unable to send on signal channel");
        }
        .instrument(info_span!("ctrlc_async_handler")),
    )
    .expect("Error setting Ctrl-C handler");

    let settings = match settings() {
        Ok(settings) => settings,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            std::process::exit(1);
        }
    };

    let result = if settings.loopback {
        info!("no brokers configured, starting loopback broker");

        let broker = InMemoryBroker::new(BrokerConfig::default());

        match DeliveryCoordinator::new(settings.config.clone(), InMemoryConnector::new(broker)).await
        {
            Ok(coordinator) => run_pipe(coordinator, settings, signal_rx).await,
            Err(err) => Err(err),
        }
    } else {
        match DeliveryCoordinator::new(settings.config.clone(), TcpConnector::default()).await {
            Ok(coordinator) => run_pipe(coordinator, settings, signal_rx).await,
            Err(err) => Err(err),
        }
    };

    match result {
        Ok(()) => info!("pipe stopped cleanly"),
        Err(err) => {
            error!(error = %err, "pipe stopped with error");
            std::process::exit(1);
        }
    }
}
