//! mq-notifier binary entry point.
//!
//! Usage:
//!   mq-notifier [OPTIONS] test-connection
//!   mq-notifier [OPTIONS] publish --json '{"state":"COMPLETED"}'
//!
//! Every option falls back to its `MQ_NOTIFIER_*` environment variable.

use anyhow::{bail, Context};
use broker_client::{
    test_connection, AmqpConnector, BrokerClient, ClientSettings, NotifierConfig, Notifier, Secret,
};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// mq-notifier: publish build notifications to an AMQP exchange.
#[derive(Parser, Debug)]
#[command(name = "mq-notifier")]
#[command(about = "Publish build notifications to an AMQP broker with publisher confirms")]
struct Args {
    /// Broker URI (amqp:// or amqps://).
    #[arg(long, env = "MQ_NOTIFIER_URI")]
    uri: Option<String>,

    /// Broker user name.
    #[arg(long, env = "MQ_NOTIFIER_USER")]
    user: Option<String>,

    /// Broker password.
    #[arg(long, env = "MQ_NOTIFIER_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Virtual host.
    #[arg(long, env = "MQ_NOTIFIER_VHOST")]
    vhost: Option<String>,

    /// Exchange to publish to.
    #[arg(long, env = "MQ_NOTIFIER_EXCHANGE")]
    exchange: Option<String>,

    /// Routing key.
    #[arg(long, env = "MQ_NOTIFIER_ROUTING_KEY")]
    routing_key: Option<String>,

    /// Application id set on every message.
    #[arg(long, env = "MQ_NOTIFIER_APP_ID")]
    app_id: Option<String>,

    /// Publish with transient delivery mode.
    #[arg(long)]
    transient: bool,

    /// Log every published document.
    #[arg(long)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open and close one connection to check the configuration.
    TestConnection,
    /// Publish one JSON document and wait for the broker to confirm it.
    Publish {
        /// JSON document, or `-` to read it from stdin.
        #[arg(long)]
        json: String,

        /// How long to wait for the broker confirm.
        #[arg(long, default_value = "30")]
        wait_secs: u64,
    },
}

impl Args {
    /// Environment configuration with command-line overrides applied.
    fn notifier_config(&self, base: NotifierConfig) -> NotifierConfig {
        let mut config = base;
        config.enable_notifier = true;
        if let Some(uri) = &self.uri {
            config.set_server_uri(Some(uri));
        }
        if let Some(user) = &self.user {
            config.user_name = Some(user.clone());
        }
        if let Some(password) = &self.password {
            config.user_password = Some(Secret::new(password.as_str()));
        }
        if let Some(vhost) = &self.vhost {
            config.virtual_host = Some(vhost.clone());
        }
        if let Some(exchange) = &self.exchange {
            config.exchange_name = Some(exchange.clone());
        }
        if let Some(routing_key) = &self.routing_key {
            config.routing_key = Some(routing_key.clone());
        }
        if let Some(app_id) = &self.app_id {
            config.app_id = Some(app_id.clone());
        }
        if self.transient {
            config.persistent_delivery = false;
        }
        config.enable_verbose_logging |= self.verbose;
        config
    }
}

fn read_document(json: &str) -> anyhow::Result<Value> {
    let text = if json == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read document from stdin")?;
        buf
    } else {
        json.to_string()
    };
    serde_json::from_str(&text).context("document is not valid JSON")
}

async fn run_test_connection(config: &NotifierConfig, settings: &ClientSettings) -> anyhow::Result<()> {
    let params = config.connection_parameters()?;
    match test_connection(&AmqpConnector::new(), &params, &settings.link).await {
        Ok(()) => {
            info!("Connection OK");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Connection test failed");
            Err(e.into())
        }
    }
}

async fn run_publish(
    config: NotifierConfig,
    settings: ClientSettings,
    json: &str,
    wait: Duration,
) -> anyhow::Result<()> {
    let document = read_document(json)?;
    let client = BrokerClient::start(Arc::new(AmqpConnector::new()), settings);
    let notifier = Notifier::new(client.clone(), config)?;

    notifier.publish_json(&document)?;

    let confirmed = client.wait_for_confirms(wait).await;
    client.shutdown().await;

    if !confirmed {
        bail!("broker did not confirm the message within {}s", wait.as_secs());
    }
    info!("Message confirmed by broker");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging via observability crate
    observability::init_with_config(observability::LogConfig {
        service_name: "mq-notifier".into(),
        default_level: args.log_level.clone(),
        also_stderr: true,
        ..Default::default()
    });

    let config = args.notifier_config(NotifierConfig::from_env());
    let settings = ClientSettings::default();

    info!(
        uri = config.server_uri.as_deref().unwrap_or(""),
        exchange = config.exchange_name.as_deref().unwrap_or(""),
        persistent = config.persistent_delivery,
        "Configuration loaded"
    );

    let work = async {
        match &args.command {
            Command::TestConnection => run_test_connection(&config, &settings).await,
            Command::Publish { json, wait_secs } => {
                run_publish(config.clone(), settings, json, Duration::from_secs(*wait_secs)).await
            }
        }
    };

    tokio::select! {
        result = work => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Received shutdown signal, exiting...");
            Ok(())
        }
    }
}
