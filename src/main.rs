use std::path::PathBuf;
use std::time::Duration;

use argh::FromArgs;
use kubernetes::Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(FromArgs)]
#[argh(description = "Reflector replicates secrets and config maps across namespaces")]
struct RootCommand {
    #[argh(
        option,
        short = 'c',
        default = "PathBuf::from(\"/etc/reflector/reflector.yml\")",
        description = "specify config file"
    )]
    config: PathBuf,

    #[argh(
        option,
        short = 't',
        description = "specify how many threads the Tokio runtime will use"
    )]
    threads: Option<usize>,

    #[argh(
        option,
        default = "String::from(\"info\")",
        description = "log level (trace, debug, info, warn, error)"
    )]
    log_level: String,

    #[argh(switch, description = "print version and exit")]
    version: bool,
}

fn main() {
    let opts: RootCommand = argh::from_env();

    if opts.version {
        println!("reflector {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let threads = opts.threads.unwrap_or_else(num_cpus::get);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads)
        .thread_name("reflector-worker")
        .enable_io()
        .enable_time()
        .build()
        .unwrap();

    runtime.block_on(async move {
        reflector::trace::init(&opts.log_level);

        let config = match reflector::config::load(&opts.config) {
            Ok(config) => config,
            Err(errors) => {
                for err in errors {
                    error!(message = "configuration error", %err);
                }
                std::process::exit(exitcode::CONFIG);
            }
        };

        info!(
            message = "start reflector",
            threads,
            config = ?opts.config,
        );

        let client = match Client::new(None) {
            Ok(client) => client,
            Err(err) => {
                error!(message = "load cluster configuration failed", %err);
                std::process::exit(exitcode::CONFIG);
            }
        };

        match client.version().await {
            Ok(version) => {
                info!(
                    message = "connected to api server",
                    major = %version.major,
                    minor = %version.minor,
                );
            }
            Err(err) => {
                error!(message = "api server unreachable", %err);
                std::process::exit(exitcode::UNAVAILABLE);
            }
        }

        let shutdown = CancellationToken::new();
        reflector::signal::handle_signals(shutdown.clone());

        reflector::app::run(config, client, shutdown).await;

        info!("reflector stopped");
    });

    runtime.shutdown_timeout(Duration::from_secs(5))
}
