use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use ssc_link::peer::ice::probe_ice_server;
use ssc_link::transport::manual::{parse_candidates, parse_description};
use ssc_link::transport::Outgoing;
use ssc_link::{
    logger, ManualTransport, Negotiator, NegotiatorConfig, RelayTransport, RendezvousServer, Role,
    SdpType, ServerConfig, SessionEvent, SignalingLoop, WebRtcConnector,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(version, about = "Peer-to-peer data channel over offer/answer signaling")]
struct Cli {
    /// JSON file with NegotiatorConfig
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the rendezvous relay
    Relay {
        #[arg(long, default_value = "127.0.0.1:8888")]
        listen: String,
    },
    /// Create the offer and negotiate through the relay
    Offer {
        #[arg(long)]
        signal: Option<String>,
    },
    /// Wait for an offer on the relay and answer it
    Answer {
        #[arg(long)]
        signal: Option<String>,
    },
    /// Copy/paste negotiation, offering side
    ManualOffer,
    /// Copy/paste negotiation, answering side
    ManualAnswer,
    /// Check that a STUN/TURN server hands out candidates
    Probe {
        url: String,
        #[arg(long, default_value = "stun")]
        r#type: String,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        credential: Option<String>,
    },
}

type StdinLines = Lines<BufReader<Stdin>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logger::init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => NegotiatorConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => NegotiatorConfig::default(),
    };

    match cli.command {
        Command::Relay { listen } => {
            let server = RendezvousServer::bind(&listen).await?;
            println!("relay listening on ws://{}", server.local_addr()?);
            server.run().await?;
        }
        Command::Offer { signal } => relayed(config, Role::Offerer, signal).await?,
        Command::Answer { signal } => relayed(config, Role::Answerer, signal).await?,
        Command::ManualOffer => manual_offer(config).await?,
        Command::ManualAnswer => manual_answer(config).await?,
        Command::Probe {
            url,
            r#type,
            username,
            credential,
        } => {
            let server = ServerConfig {
                id: "probe".into(),
                r#type,
                url,
                username,
                credential,
            };
            server.validate()?;
            let ok = probe_ice_server(&server, config.gather_timeout()).await;
            println!("{}: {}", server.url, if ok { "reachable" } else { "unreachable" });
        }
    }
    Ok(())
}

/// Печать событий сессии в stdout
fn spawn_printer() -> Arc<mpsc::UnboundedSender<SessionEvent>> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                SessionEvent::Message { text, .. } => println!("< {text}"),
                SessionEvent::ChannelOpen { label } => {
                    println!("* channel {label} open, type messages, 'exit' to quit")
                }
                other => println!("* {other:?}"),
            }
        }
    });
    Arc::new(tx)
}

async fn relayed(
    mut config: NegotiatorConfig,
    role: Role,
    signal: Option<String>,
) -> anyhow::Result<()> {
    if signal.is_some() {
        config.signaling_url = signal;
    }
    config.validate()?;
    let url = config
        .signaling_url
        .clone()
        .unwrap_or_else(|| "ws://localhost:8888".into());

    let sink = spawn_printer();
    let (transport, events) = RelayTransport::connect(&url)
        .await
        .with_context(|| format!("connecting to {url}"))?;
    let negotiator = Arc::new(Negotiator::new(
        config.clone(),
        Arc::new(WebRtcConnector::new(config.ice_servers.clone())),
        transport,
        sink.clone(),
    ));

    let signaling = SignalingLoop::new(negotiator.clone(), role, sink);
    tokio::spawn(async move { signaling.run(events).await });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    chat(&negotiator, &mut lines).await
}

fn manual_negotiator(config: NegotiatorConfig) -> (Arc<Negotiator>, Arc<ManualTransport>) {
    let transport = Arc::new(ManualTransport::compact());
    let negotiator = Arc::new(Negotiator::new(
        config.clone(),
        Arc::new(WebRtcConnector::new(config.ice_servers.clone())),
        transport.clone(),
        spawn_printer(),
    ));
    (negotiator, transport)
}

async fn read_line(lines: &mut StdinLines, prompt: &str) -> anyhow::Result<String> {
    println!("{prompt}");
    match lines.next_line().await? {
        Some(line) => Ok(line),
        None => bail!("stdin closed"),
    }
}

fn print_outbox(transport: &ManualTransport) {
    for item in transport.take_outgoing() {
        match item {
            Outgoing::Description(text) => println!("--- description ---\n{text}"),
            Outgoing::Candidates(json) => println!("--- candidates ---\n{json}"),
        }
    }
}

async fn manual_offer(config: NegotiatorConfig) -> anyhow::Result<()> {
    let wait = config.gather_timeout();
    let (negotiator, transport) = manual_negotiator(config);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let session = negotiator.create_as_offerer().await?;
    if !session.wait_gathering_complete(wait).await {
        // не дождались: отдаём то, что есть
        let rest = session.take_local_candidates().await;
        transport
            .send_batch(rest)
            .await
            .context("flushing candidates")?;
    }
    print_outbox(&transport);

    let answer = read_line(&mut lines, "paste answer:").await?;
    negotiator
        .apply_remote_answer(parse_description(&answer, SdpType::Answer)?)
        .await?;
    let candidates = read_line(&mut lines, "paste answer candidates:").await?;
    negotiator
        .apply_candidate_batch(parse_candidates(&candidates)?)
        .await?;

    chat(&negotiator, &mut lines).await
}

async fn manual_answer(config: NegotiatorConfig) -> anyhow::Result<()> {
    let wait = config.gather_timeout();
    let (negotiator, transport) = manual_negotiator(config);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let offer = read_line(&mut lines, "paste offer:").await?;
    let offer = parse_description(&offer, SdpType::Offer)?;
    let candidates = read_line(&mut lines, "paste offer candidates:").await?;
    negotiator
        .apply_candidate_batch(parse_candidates(&candidates)?)
        .await?;

    let session = negotiator.create_as_answerer(offer).await?;
    if !session.wait_gathering_complete(wait).await {
        let rest = session.take_local_candidates().await;
        transport
            .send_batch(rest)
            .await
            .context("flushing candidates")?;
    }
    print_outbox(&transport);

    chat(&negotiator, &mut lines).await
}

/// stdin → data channel, пока не "exit"
async fn chat(negotiator: &Negotiator, lines: &mut StdinLines) -> anyhow::Result<()> {
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line == "exit" {
            break;
        }
        if line.is_empty() {
            continue;
        }
        match negotiator.current().await {
            Some(session) => {
                if let Err(e) = session.send_text(line).await {
                    println!("! {e}");
                }
            }
            None => println!("! not connected yet"),
        }
    }
    negotiator.close().await;
    // дать каналу закрыться
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}
