use std::time::Duration;

use clap::Parser;
use tokio::signal;

use bhaicord::config::Config;
use bhaicord::gateway::intents;
use bhaicord::{Client, Event};

/// Connect to the gateway and log what arrives.
#[derive(Debug, Parser)]
#[command(name = "bhaicord", version)]
struct Args {
    /// Bot token. Falls back to BHAICORD_TOKEN.
    #[arg(long, env = "BHAICORD_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Gateway base URL.
    #[arg(long)]
    gateway_url: Option<String>,

    /// Intents as a bitfield or comma separated names.
    #[arg(long)]
    intents: Option<String>,

    /// Receive plain JSON frames instead of a zlib stream.
    #[arg(long)]
    no_compress: bool,

    /// Give up after this many consecutive failed reconnects.
    #[arg(long)]
    max_reconnects: Option<u32>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bhaicord=debug".into()),
        )
        .init();

    let args = Args::parse();
    let config = match build_config(args) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("invalid configuration: {e}");
            std::process::exit(2);
        }
    };
    print_banner(&config);

    let client = match Client::new(config) {
        Ok(client) => client,
        Err(e) => {
            tracing::error!("{e}");
            std::process::exit(2);
        }
    };
    register_handlers(&client);

    if let Err(e) = client.start().await {
        tracing::error!("failed to start: {e}");
        std::process::exit(1);
    }

    let result = tokio::select! {
        result = client.join() => result,
        _ = shutdown_signal() => client.shutdown().await,
    };

    if let Err(e) = result {
        tracing::error!("gateway client exited: {e}");
        std::process::exit(1);
    }
}

fn build_config(args: Args) -> bhaicord::Result<Config> {
    let mut config = Config::from_env();
    if let Some(token) = args.token {
        config.token = token;
    }
    if let Some(url) = args.gateway_url {
        config = config.with_gateway_url(url);
    }
    if let Some(value) = args.intents {
        config = config.with_intents(intents::parse(&value)?);
    }
    if args.no_compress {
        config = config.with_compress(false);
    }
    if args.max_reconnects.is_some() {
        config = config.with_max_reconnects(args.max_reconnects);
    }
    Ok(config)
}

fn print_banner(config: &Config) {
    let version = env!("CARGO_PKG_VERSION");
    let sha = env!("GIT_SHA");

    eprintln!();
    eprintln!("  \x1b[1;36mbhaicord\x1b[0m \x1b[2mv{version} ({sha})\x1b[0m");
    eprintln!();
    eprintln!("  \x1b[2mgateway\x1b[0m      {}", config.gateway_url);
    eprintln!("  \x1b[2mapi version\x1b[0m  {}", config.api_version);
    eprintln!("  \x1b[2mcompress\x1b[0m     {}", config.compress);
    eprintln!("  \x1b[2mintents\x1b[0m      {}", config.intents);
    if config.intents & intents::PRIVILEGED_INTENTS != 0 {
        eprintln!();
        eprintln!("  \x1b[33m! privileged intents requested\x1b[0m");
    }
    eprintln!();
}

fn register_handlers(client: &Client) {
    let result = client.on("READY", |event| async move {
        if let Event::Ready(ready) = event {
            tracing::info!(
                user = %ready.user.username,
                guilds = ready.guilds.len(),
                version = ready.gateway_version,
                "logged in"
            );
        }
        Ok(())
    });
    if let Err(e) = result {
        tracing::warn!("{e}");
    }

    client.listen("MESSAGE_CREATE", |event| async move {
        if let Some(message) = event.data() {
            tracing::info!(
                channel = %message["channel_id"],
                author = %message["author"]["username"],
                "{}",
                message["content"].as_str().unwrap_or_default()
            );
        }
        Ok(())
    });

    client.listen("TYPING_START", |event| async move {
        if let Event::TypingStart(typing) = event {
            tracing::debug!(
                user = %typing.user_id,
                channel = %typing.channel_id,
                at = ?typing.started_at(),
                "typing"
            );
        }
        Ok(())
    });

    // Report latency once a minute.
    let mut status = client.status();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            let latency = status.borrow_and_update().latency;
            if let Some(latency) = latency {
                tracing::info!(latency_ms = latency.as_millis() as u64, "gateway latency");
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
