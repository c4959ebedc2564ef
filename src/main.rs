use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use inquiry_chat::config::ChatConfig;
use inquiry_chat::error::ChatError;
use inquiry_chat::net::api::{HttpHistoryLoader, fetch_identity, fetch_product_title, http_client, room_header};
use inquiry_chat::net::transport::WsConnector;
use inquiry_chat::render::{render_entry, status_line};
use inquiry_chat::room::{RoomController, RoomUpdate};
use inquiry_chat::session::Session;
use inquiry_chat::state::timeline::Reconciled;
use tokio::io::{AsyncBufReadExt, BufReader};
use time::UtcOffset;
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "inquiry-chat", about = "Chat with the seller about a product")]
struct Cli {
    /// Product whose inquiry room to join.
    #[arg(long)]
    product_id: i64,

    /// Bearer token of the logged-in member.
    #[arg(long, env = "CHAT_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Skip the identity lookup and chat as this member id.
    #[arg(long, requires = "nickname")]
    user_id: Option<i64>,

    #[arg(long, requires = "user_id")]
    nickname: Option<String>,

    /// Overrides `CHAT_API_BASE_URL`.
    #[arg(long)]
    api_base_url: Option<String>,

    /// Overrides `CHAT_BROKER_URL`.
    #[arg(long)]
    broker_url: Option<String>,
}

fn main() -> Result<(), ChatError> {
    // The local offset can only be read while the process is single-threaded.
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    tokio::runtime::Runtime::new()?.block_on(run(offset))
}

async fn run(offset: UtcOffset) -> Result<(), ChatError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,inquiry_chat=info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = ChatConfig::from_env()?;
    if let Some(url) = cli.api_base_url {
        config.api_base_url = url;
    }
    if let Some(url) = cli.broker_url {
        config.broker.url = url;
    }
    config.validate()?;

    let http = http_client(&config)?;
    let session = match (cli.user_id, cli.nickname) {
        (Some(user_id), Some(nickname)) => Session::new(user_id, nickname, cli.token),
        _ => fetch_identity(&http, &config, cli.token.as_deref()).await?,
    };
    let user_id = session.user_id;

    let title = match fetch_product_title(&http, &config, cli.product_id, &session).await {
        Ok(title) => title,
        Err(err) => {
            tracing::warn!(product_id = cli.product_id, error = %err, "product lookup failed");
            None
        }
    };
    println!("{}", room_header(cli.product_id, title.as_deref()));

    let history = Arc::new(HttpHistoryLoader::with_client(http, config.clone()));
    let mut room = RoomController::new(session, config, history, Arc::new(WsConnector));
    if let Err(err) = room.activate(cli.product_id).await {
        eprintln!("chat unavailable: {err}");
        return Err(err);
    }
    for entry in room.timeline().entries() {
        println!("{}", render_entry(entry, user_id, offset));
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(text)) => match room.send(&text, Instant::now()) {
                    Ok(index) => print_entry(&room, index, offset),
                    Err(ChatError::EmptyMessage) => {}
                    Err(err) => eprintln!("* not sent: {err}"),
                },
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(error = %err, "stdin read failed");
                    break;
                }
            },
            update = room.next_update() => match update {
                Some(RoomUpdate::Connection(state)) => eprintln!("* {}", status_line(state)),
                Some(RoomUpdate::Message(Reconciled::Appended(index))) => print_entry(&room, index, offset),
                Some(RoomUpdate::Message(Reconciled::Replaced(index))) => {
                    tracing::debug!(index, "local message confirmed");
                }
                Some(RoomUpdate::Message(Reconciled::Duplicate)) => {}
                Some(RoomUpdate::BrokerError(message)) => eprintln!("* broker error: {message}"),
                None => break,
            },
            _ = sweep.tick() => {
                for index in room.expire_pending(Instant::now()) {
                    print_entry(&room, index, offset);
                }
            }
            _ = &mut shutdown => break,
        }
    }

    room.deactivate().await;
    Ok(())
}

fn print_entry(room: &RoomController, index: usize, offset: UtcOffset) {
    if let Some(entry) = room.timeline().get(index) {
        println!("{}", render_entry(entry, room.session().user_id, offset));
    }
}
