//! Send a request to an echo server and print the response.
use futures::channel::mpsc;
use futures::future::Either;
use futures::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use structopt::StructOpt;
use tagrpc::{Client, Config, OnOpen, Peer, Plugin, TcpDialer};

/// Call an echo server
#[derive(StructOpt)]
#[structopt(name = "echo_client", max_term_width = 100)]
struct Cli {
    #[structopt(long, default_value = "127.0.0.1:9000")]
    server: String,

    #[structopt(long, default_value = "1")]
    tag: u32,

    /// Seconds to wait for the response
    #[structopt(long, default_value = "5")]
    timeout: u64,

    message: String,
}

/// Signals when the connection is established.
struct Opened(mpsc::UnboundedSender<()>);

impl OnOpen for Opened {
    fn on_open(&self, _peer: &Peer) {
        let _ = self.0.unbounded_send(());
    }
}

impl Plugin for Opened {
    fn as_on_open(&self) -> Option<&dyn OnOpen> {
        Some(self)
    }
}

#[async_std::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = Cli::from_args();
    let client = Client::new(TcpDialer::new(&args.server), Config::default());
    let (opened_sender, mut opened) = mpsc::unbounded();
    client.plugins().add(Arc::new(Opened(opened_sender)));

    let serve = async_std::task::spawn({
        let client = client.clone();
        async move { client.dial_and_serve().await }
    });
    futures::pin_mut!(serve);
    if let Either::Right((result, _)) = future::select(opened.next(), serve.as_mut()).await {
        result?;
        anyhow::bail!("Connection closed");
    }

    let response = client
        .call(
            args.tag,
            args.message.into_bytes(),
            Some(Duration::from_secs(args.timeout)),
        )
        .await?;
    println!("{}", String::from_utf8_lossy(response.payload()));

    client.close();
    serve.await
}
