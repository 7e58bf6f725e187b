// SIGINT/SIGTERM listener: turns external cancellation into a shutdown intent

use std::thread::JoinHandle;

use crate::input::InputHandle;

/// Run a current-thread tokio runtime on its own thread and wait for
/// signals. The first one requests a clean shutdown; a second one exits
/// immediately.
pub fn spawn_signal_listener(input: InputHandle) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("trafficcam-signals".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    log::error!("Signal listener unavailable: {}", e);
                    return;
                }
            };

            runtime.block_on(async move {
                let name = wait_for_signal().await;
                log::warn!("{} received, stopping recorder", name);
                input.request_external_shutdown();

                let name = wait_for_signal().await;
                log::error!("{} received again, exiting without cleanup", name);
                std::process::exit(crate::EXIT_FATAL);
            });
        })
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return "SIGINT";
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = term.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "Ctrl-C"
}
