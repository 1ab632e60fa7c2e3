use tokio::sync::watch;
use tracing::{error, info};

fn main() {
    dbbat::init_tracing();

    let conf = match dbbat::init_settings() {
        Ok(conf) => conf,
        Err(e) => {
            error!(error = %e, "could not load config");
            std::process::exit(1);
        }
    };

    let runtime = dbbat::init_runtime().expect("could not create tokio runtime");
    runtime.block_on(async move {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                let _ = shutdown_tx.send(true);
            }
        });

        if let Err(e) = dbbat::run_proxy(conf, shutdown_rx).await {
            error!(error = %e, "proxy exited with error");
            std::process::exit(1);
        }
    });
}
