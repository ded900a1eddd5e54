mod core;
mod relay;
mod utils;
mod workers;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::core::identity::LocalIdentity;
use crate::core::node::{Collaborators, Node};
use crate::utils::data_dir::DataDir;
use crate::utils::file_log::FileLogLayer;
use crate::utils::sos::SignalOfStop;
use workers::args::{Args, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::load();
    let data_dir = DataDir::resolve(args.conf.as_deref())?;

    // Note: webrtc_ice generates many "unknown TransactionID" warnings for late-arriving
    // STUN responses, which are normal. Filter these out to reduce noise.
    let filter = match args.verbose {
        0 => "warn,cybercall=info,webrtc_ice=error",
        1 => "info,webrtc_ice=error",
        2 => "debug,webrtc_ice=error",
        _ => "trace",
    };

    let file_layer = FileLogLayer::new(&data_dir.log_file())
        .with_context(|| format!("opening {}", data_dir.log_file().display()))?;

    tracing_subscriber::registry()
        .with(EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    let sos = SignalOfStop::new();

    // Ctrl+C handler
    let sos_clone = sos.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        sos_clone.cancel();
    });

    match &args.command {
        Command::Relay { .. } => relay::run(&args.listen_addr(), sos).await,
        Command::Peer { .. } => {
            let identity = LocalIdentity::load_or_create(&data_dir.identity())?;
            let settings = args.node_settings(data_dir)?;
            let (app_tx, app_rx) = mpsc::unbounded_channel();
            let collaborators = Collaborators::production(&settings);
            let (node, events) = Node::new(identity.peer_id.clone(), &settings, collaborators, app_tx);

            let console = tokio::spawn(workers::console::run(
                node.handle(),
                app_rx,
                identity.peer_id,
                sos.clone(),
            ));
            node.run(events, sos.clone()).await;
            sos.cancel();
            let _ = console.await;
            Ok(())
        }
    }
}
