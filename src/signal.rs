use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancel `shutdown` on the first SIGINT or SIGTERM. A second signal exits
/// immediately without waiting for the drain.
pub fn handle_signals(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut interrupt = signal(SignalKind::interrupt()).expect("install SIGINT handler");
        let mut terminate = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = interrupt.recv() => {},
            _ = terminate.recv() => {},
        }

        info!("shutdown signal received");
        shutdown.cancel();

        tokio::select! {
            _ = interrupt.recv() => {},
            _ = terminate.recv() => {},
        }

        warn!("second shutdown signal received, exiting immediately");
        std::process::exit(1);
    });
}
