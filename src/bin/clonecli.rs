use clap::{Parser, Subcommand};
use clonecache::client::ClientAgent;
use std::net::SocketAddr;
use std::process::exit;
use std::time::Duration;
use tracing::Level;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(long, help = "Primary replica's snapshot endpoint")]
    primary: SocketAddr,

    #[clap(long, help = "Backup replica's snapshot endpoint")]
    backup: Option<SocketAddr>,

    #[clap(long, help = "MemCache partition to operate on")]
    cache_id: String,

    #[clap(long, default_value = "", help = "Restrict to keys under this prefix")]
    subtree: String,

    #[clap(subcommand)]
    command: SubCommand,
}

#[derive(Subcommand, Debug)]
enum SubCommand {
    #[clap(about = "Read a key from the replicated cache")]
    Get { key: String },

    #[clap(about = "Write a key, optionally with a TTL in seconds")]
    Set {
        key: String,
        value: String,
        #[clap(long, default_value_t = 0)]
        ttl: u64,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(Level::WARN)
        .init();

    let args = Args::parse();

    let agent = ClientAgent::new(args.subtree.into_bytes());
    if let Err(e) = agent.connect(args.primary).await {
        eprintln!("cannot reach {}: {}", args.primary, e);
        exit(1);
    }
    if let Some(backup) = args.backup {
        let _ = agent.connect(backup).await;
    }

    // Give the worker a moment to finish its snapshot bootstrap before we
    // issue the requested command.
    tokio::time::sleep(Duration::from_millis(300)).await;

    match args.command {
        SubCommand::Get { key } => match agent.get(&args.cache_id, &key).await {
            Ok(Some(value)) => println!("{}", String::from_utf8_lossy(&value)),
            Ok(None) => {
                eprintln!("key not found");
                exit(1);
            }
            Err(e) => {
                eprintln!("{}", e);
                exit(1);
            }
        },
        SubCommand::Set { key, value, ttl } => {
            if let Err(e) = agent
                .set(args.cache_id.clone(), key.into_bytes(), value.into_bytes(), ttl)
                .await
            {
                eprintln!("{}", e);
                exit(1);
            }
        }
    }

    let _ = agent.shutdown().await;
}
