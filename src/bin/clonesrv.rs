use clap::Parser;
use clonecache::config::ClusterConfig;
use clonecache::server::run_server;
use std::path::PathBuf;
use std::process::exit;
use tracing::error;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(help = "Path to the cluster config file (per-base detail lives in sibling <path>.<baseId> files)")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match ClusterConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("cannot load {}: {}", args.config.display(), e);
            exit(1);
        }
    };

    let _guard = init_logging(&config.log_path);

    if let Err(e) = run_server(config).await {
        error!("clonesrv exiting: {}", e);
        exit(1);
    }
}

fn init_logging(log_path: &std::path::Path) -> tracing_appender::non_blocking::WorkerGuard {
    let dir = log_path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| std::path::Path::new("."));
    let file_name = log_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "clonesrv.log".to_string());
    let file_appender = tracing_appender::rolling::never(dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_ansi(false)
        .init();
    guard
}
