use clap::{Args, Parser, Subcommand};
use mini_pdn::core::{ClientRequest, ClientResponse, Envelope, Request, Response};
use mini_pdn::utils::{CryptoUtils, setup_logging};
use mini_pdn::{Config, Key, LogicalAddress, Node, PdnError, Result, TcpTransport, Transport};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "mini-pdn")]
#[command(about = "A mini persistent, replicated messaging network")]
#[command(version)]
struct Cli {
    /// Log level when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node
    Start {
        /// JSON config file; flags below override it
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Address to listen on (host:port)
        #[arg(short, long)]
        listen: Option<SocketAddr>,
        /// Directory for durable state
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
        /// Consensus member address, repeatable
        #[arg(short, long)]
        member: Vec<SocketAddr>,
        /// DHT bootstrap address, repeatable
        #[arg(short, long)]
        bootstrap: Vec<SocketAddr>,
        /// Node name for identification
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Store a message
    Put {
        #[arg(long)]
        node: SocketAddr,
        #[command(flatten)]
        target: KeyArgs,
        /// Message payload
        #[arg(short, long)]
        message: String,
    },
    /// Read the current value of a key
    Get {
        #[arg(long)]
        node: SocketAddr,
        #[command(flatten)]
        target: KeyArgs,
        /// Fail unless the node applied at least this log index
        #[arg(long)]
        min_index: Option<u64>,
    },
    /// Delete a key
    Delete {
        #[arg(long)]
        node: SocketAddr,
        #[command(flatten)]
        target: KeyArgs,
    },
    /// Show a node's status
    Status {
        #[arg(long)]
        node: SocketAddr,
    },
}

/// Exactly one way of naming the key.
#[derive(Args)]
#[group(required = true, multiple = true)]
struct KeyArgs {
    /// Plain name
    #[arg(long, conflicts_with_all = ["sender", "key"])]
    name: Option<String>,
    /// Sender of a (sender, recipient) address
    #[arg(long, requires = "recipient", conflicts_with = "key")]
    sender: Option<String>,
    #[arg(long, requires = "sender")]
    recipient: Option<String>,
    /// Raw hex key
    #[arg(long)]
    key: Option<String>,
}

impl KeyArgs {
    fn key(&self) -> Result<Key> {
        if let Some(name) = &self.name {
            return Ok(Key::from_name(name));
        }
        if let (Some(sender), Some(recipient)) = (&self.sender, &self.recipient) {
            return Ok(LogicalAddress::new(sender, recipient).key());
        }
        match &self.key {
            Some(hex) => Key::from_hex(hex).map_err(|e| PdnError::ConfigError(format!("bad key: {}", e))),
            None => Err(PdnError::ConfigError("no key given".to_string())),
        }
    }
}

async fn request(node: SocketAddr, request: ClientRequest) -> Result<ClientResponse> {
    let defaults = Config::default();
    // A write may run several consensus rounds before it answers.
    let transport = TcpTransport::new(Duration::from_secs(30), defaults.max_frame_bytes);

    match transport.send(node, Envelope::new(None, Request::Client(request))).await? {
        Response::Client(ClientResponse::Failed(reason)) => Err(PdnError::InvalidResponse(reason)),
        Response::Client(response) => Ok(response),
        Response::Error(reason) => Err(PdnError::InvalidResponse(reason)),
        other => Err(PdnError::InvalidResponse(format!("unexpected reply: {:?}", other))),
    }
}

fn print_response(response: ClientResponse) -> Result<()> {
    match response {
        ClientResponse::Committed(receipt) => {
            println!(
                "Committed key {} at index {} ({} replicas)",
                receipt.key.to_hex(),
                receipt.index,
                receipt.replicas
            );
        }
        ClientResponse::Value(value) => {
            println!("Version: {}", value.version);
            println!("SHA-256: {}", CryptoUtils::hash_sha256(&value.payload));
            println!("{}", String::from_utf8_lossy(&value.payload));
        }
        ClientResponse::NotFound(key) => {
            println!("Key {} not found", key.to_hex());
        }
        ClientResponse::Status(status) => {
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        ClientResponse::Failed(reason) => {
            return Err(PdnError::InvalidResponse(reason));
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level);

    match cli.command {
        Commands::Start {
            config,
            listen,
            data_dir,
            member,
            bootstrap,
            name,
        } => {
            let mut config = match config {
                Some(path) => Config::from_file(path)?,
                None => Config::default(),
            };
            if let Some(listen) = listen {
                config.listen_addr = listen;
            }
            if data_dir.is_some() {
                config.data_dir = data_dir;
            }
            config.members.extend(member);
            config.bootstrap_peers.extend(bootstrap);
            config.node_name = name.unwrap_or_else(|| format!("Node-{}", config.listen_addr.port()));

            let transport = Arc::new(TcpTransport::new(
                config.dht.request_timeout(),
                config.max_frame_bytes,
            ));
            let node = Node::open(config, transport).await?;
            node.run().await?;
        }
        Commands::Put {
            node,
            target,
            message,
        } => {
            let payload = message.into_bytes();
            let response = match (&target.sender, &target.recipient) {
                (Some(sender), Some(recipient)) => {
                    request(
                        node,
                        ClientRequest::Put {
                            address: LogicalAddress::new(sender, recipient),
                            payload,
                        },
                    )
                    .await?
                }
                _ => match &target.name {
                    Some(name) => {
                        request(
                            node,
                            ClientRequest::PutNamed {
                                name: name.clone(),
                                payload,
                            },
                        )
                        .await?
                    }
                    None => {
                        return Err(PdnError::ConfigError(
                            "put needs --name or --sender/--recipient".to_string(),
                        ));
                    }
                },
            };
            print_response(response)?;
        }
        Commands::Get {
            node,
            target,
            min_index,
        } => {
            let key = target.key()?;
            print_response(request(node, ClientRequest::Get { key, min_index }).await?)?;
        }
        Commands::Delete { node, target } => {
            let key = target.key()?;
            print_response(request(node, ClientRequest::Delete { key }).await?)?;
        }
        Commands::Status { node } => {
            print_response(request(node, ClientRequest::Status).await?)?;
        }
    }

    Ok(())
}
