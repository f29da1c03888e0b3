//! Server that replies to every request with the request payload.
use std::sync::Arc;
use structopt::StructOpt;
use tagrpc::{Config, Message, OnAccept, OnClose, OnMessage, Peer, Plugin, Server};

/// Run an echo server
#[derive(StructOpt)]
#[structopt(name = "echo_server", max_term_width = 100)]
struct Cli {
    #[structopt(long, default_value = "127.0.0.1:9000")]
    listen: String,

    /// JSON file with session options. Uses the defaults if not given.
    #[structopt(long)]
    config: Option<std::path::PathBuf>,
}

struct Echo;

impl OnAccept for Echo {
    fn on_accept(&self, peer: &Peer) {
        tracing::info!(id = ?peer.id(), "client connected");
    }
}

impl OnClose for Echo {
    fn on_close(&self, peer: &Peer) {
        tracing::info!(id = ?peer.id(), "client disconnected");
    }
}

impl OnMessage for Echo {
    fn on_message(&self, peer: &Peer, message: &Message) {
        tracing::info!(id = ?peer.id(), ?message, "received");
        if let Err(error) = peer.reply(message, message.payload().to_vec()) {
            tracing::warn!(%error, "failed to reply");
        }
    }
}

impl Plugin for Echo {
    fn as_on_accept(&self) -> Option<&dyn OnAccept> {
        Some(self)
    }

    fn as_on_close(&self) -> Option<&dyn OnClose> {
        Some(self)
    }

    fn as_on_message(&self) -> Option<&dyn OnMessage> {
        Some(self)
    }
}

#[async_std::main]
async fn main() -> anyhow::Result<()> {
    use anyhow::Context as _;
    tracing_subscriber::fmt::init();

    let args = Cli::from_args();
    let config = match args.config {
        Some(ref path) => {
            let json = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Config::from_json(&json).context("Invalid config")?
        }
        None => Config::default(),
    };

    let server = Server::new(config);
    server.plugins().add(Arc::new(Echo));
    let listener = async_std::net::TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("Failed to listen on {}", args.listen))?;
    tracing::info!(address = %args.listen, "listening");
    server.serve(listener).await.context("Server failed")
}
