//! bottledwater binary: wire up the collaborators and run the bridge.

use bottledwater::config::{self, Cli};
use bottledwater::replication::format_lsn;
use bottledwater::{
    BridgeError, Encoder, HttpSchemaRegistry, NullRegistry, PgReplicationLink, PidFile, Producer,
    RdKafkaSink, SchemaRegistry, Shutdown, TableMapper,
};
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    if cli.config_help {
        config::print_config_help();
        return;
    }

    if let Err(e) = cli.validate() {
        eprintln!("{}", e);
        std::process::exit(1);
    }

    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    // Process singleton: one bridge per replication slot.
    let _pidfile = match PidFile::acquire(&cli.slot) {
        Ok(pidfile) => pidfile,
        Err(e) => {
            error!("{}", e);
            return 1;
        }
    };

    let registry: Arc<dyn SchemaRegistry> = match cli.registry_url() {
        Some(url) => match HttpSchemaRegistry::new(url) {
            Ok(registry) => Arc::new(registry),
            Err(e) => {
                error!("failed to initialise schema registry: {}", e);
                return 1;
            }
        },
        None => Arc::new(NullRegistry),
    };
    let mapper = TableMapper::new(registry, cli.topic_prefix.clone());

    // Connect to Kafka before Postgres; a misconfigured broker list should
    // fail before a replication slot gets created.
    let sink = match RdKafkaSink::new(&cli.broker, &cli.kafka_config, &cli.topic_config) {
        Ok(sink) => sink,
        Err(e) => {
            error!("{}", e);
            return 1;
        }
    };
    info!(
        "writing messages to Kafka in {} format",
        cli.output_format
    );

    let (link, stream) =
        match PgReplicationLink::connect(&cli.postgres, &cli.slot, cli.skip_snapshot).await {
            Ok(connected) => connected,
            Err(e) => {
                error!("{}", e);
                return 1;
            }
        };

    if !stream.slot_created {
        info!(
            "replication slot \"{}\" exists, streaming changes from {}",
            stream.slot_name,
            format_lsn(stream.start_lsn)
        );
    } else if stream.skip_snapshot {
        info!(
            "created replication slot \"{}\", skipping snapshot and streaming changes from {}",
            stream.slot_name,
            format_lsn(stream.start_lsn)
        );
    }

    let shutdown = Shutdown::new();
    if let Err(e) = shutdown.install_signal_handlers() {
        error!("failed to install signal handlers: {}", e);
        return 1;
    }
    // Pick up table metadata on the first iteration.
    shutdown.request_reload();

    let mut producer = Producer::new(
        Encoder::new(cli.output_format),
        cli.on_error,
        mapper,
        sink,
        link,
        stream,
        shutdown,
    );

    let status = match producer.run().await {
        Ok(()) => 0,
        Err(BridgeError::Shutdown) => 0,
        Err(e) => {
            error!("{}", e);
            1
        }
    };

    producer.shutdown(status).await;
    status
}
