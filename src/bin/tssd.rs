use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use libp2p::identity::Keypair;
use libp2p::PeerId;
use tokio::io::{AsyncBufReadExt, BufReader};
use tss_node::p2p::messages::TSS_TOPIC;
use tss_node::{
    Node, NodeConfig, SimulatedEngine, TssError, TssOperation, TssResult,
};

#[derive(Parser, Debug)]
#[command(about = "Threshold-signature coordination node", author, version)]
struct Cli {
    /// Path to the node's identity key (created on first start)
    #[arg(long = "key-file", value_name = "FILE", default_value = "tss_node.key")]
    key_file: PathBuf,

    /// Multiaddresses to listen on (repeat flag for multiple)
    #[arg(
        long = "listen",
        default_values_t = [String::from("/ip4/0.0.0.0/tcp/0")]
    )]
    listen: Vec<String>,

    /// Bootstrap peers to dial (repeat flag for multiple)
    #[arg(long = "bootstrap", default_values_t = Vec::<String>::new())]
    bootstrap: Vec<String>,

    /// Gossip topic to join
    #[arg(long = "topic", default_value = TSS_TOPIC)]
    topic: String,

    /// Disable mDNS peer discovery (useful in sandboxed environments)
    #[arg(long = "disable-mdns", default_value_t = false)]
    disable_mdns: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("tssd failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> TssResult<()> {
    let keypair = load_or_create_keypair(&cli.key_file)?;
    let peer_id = PeerId::from(keypair.public());
    println!("local peer id: {peer_id}");

    let mut config = NodeConfig::default();
    config.network.listen_addresses = cli.listen;
    config.network.bootstrap_peers = cli.bootstrap;
    config.network.topic = cli.topic;
    config.network.enable_mdns = !cli.disable_mdns;

    let engine = Arc::new(SimulatedEngine::new(peer_id));
    let node = Node::new(keypair, config, engine).await?;
    node.start().await?;

    command_loop(&node).await;

    node.stop().await;
    Ok(())
}

/// Interactive command loop; exits on `quit`, EOF, or ctrl-c.
async fn command_loop(node: &Node) {
    print_help();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        let _ = std::io::stdout().flush();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        let fields: Vec<&str> = line.split_whitespace().collect();
                        if fields.first() == Some(&"quit") {
                            break;
                        }
                        if let Err(e) = dispatch(node, &fields).await {
                            eprintln!("error: {e}");
                        }
                    }
                    _ => break,
                }
            }
        }
    }
}

async fn dispatch(node: &Node, fields: &[&str]) -> TssResult<()> {
    match fields {
        [] => Ok(()),
        ["help"] => {
            print_help();
            Ok(())
        }
        ["peers"] => {
            let peers = node.known_peers();
            if peers.is_empty() {
                println!("no peers discovered yet");
            }
            for peer in peers {
                println!("{peer}");
            }
            Ok(())
        }
        ["dial", addr] => node.dial(addr).await,
        ["create-party", rest @ ..] if rest.len() >= 2 => {
            let threshold: usize = rest[0]
                .parse()
                .map_err(|_| TssError::Validation("threshold must be a number".into()))?;
            let members = rest[1..]
                .iter()
                .map(|p| p.parse::<PeerId>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| TssError::Validation("invalid peer id".into()))?;
            let party = node
                .create_party(members, threshold, TssOperation::KeyGen)
                .await?;
            println!("created {} ({} members, threshold {})", party.id, party.members.len(), party.threshold);
            Ok(())
        }
        ["parties"] => {
            let parties = node.get_all_parties();
            if parties.is_empty() {
                println!("no parties");
            }
            for party in parties {
                println!(
                    "{}  {}  {}/{} members  ({})",
                    party.id,
                    party.status,
                    party.threshold,
                    party.members.len(),
                    party.operation
                );
            }
            Ok(())
        }
        ["party", id] => {
            let party = node.get_party(id)?;
            println!("{}  {}  threshold {}", party.id, party.status, party.threshold);
            for member in &party.members {
                println!("  {member}");
            }
            Ok(())
        }
        ["keygen", id] => node.initiate_key_generation(id).await,
        ["sign", id, msg @ ..] if !msg.is_empty() => {
            node.initiate_signing(id, msg.join(" ").into_bytes()).await
        }
        _ => {
            println!("unknown command (try `help`)");
            Ok(())
        }
    }
}

fn print_help() {
    println!("commands:");
    println!("  peers                             list discovered peers");
    println!("  dial <multiaddr>                  dial a peer directly");
    println!("  create-party <threshold> <peer>…  form a party with the given members");
    println!("  parties                           list parties");
    println!("  party <id>                        show one party");
    println!("  keygen <id>                       start key generation for a ready party");
    println!("  sign <id> <message>               start signing for a ready party");
    println!("  quit");
}

/// Loads the identity keypair from disk, creating it on first start. The key
/// file uses the libp2p protobuf encoding and 0600 permissions.
fn load_or_create_keypair(path: &Path) -> TssResult<Keypair> {
    if path.exists() {
        let bytes = std::fs::read(path)?;
        return Keypair::from_protobuf_encoding(&bytes)
            .map_err(|e| TssError::Identity(format!("invalid key file: {e}")));
    }

    let keypair = Keypair::generate_ed25519();
    let bytes = keypair
        .to_protobuf_encoding()
        .map_err(|e| TssError::Identity(format!("encode key: {e}")))?;
    std::fs::write(path, &bytes)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(keypair)
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .try_init();
    });
}
