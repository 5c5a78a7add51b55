//! Shutdown-signal plumbing shared by `server` and `client` main loops.
//!
//! The teacher wires a `tokio::sync::broadcast` channel through every
//! background task and a Ctrl-C/SIGTERM listener feeding it; we keep that
//! pattern and layer the FSM `HaltFlag` on top so a `StateMachine` can be
//! polled for shutdown without awaiting the channel directly inside an
//! action body.
//!
//! A stand-alone client additionally distinguishes SIGUSR1 ("shut down
//! between bundles") from SIGUSR2 ("also interrupt in-flight tasks"); see
//! `install_usr_signals`. When a client runs embedded in a local cluster
//! these OS signals are never wired up at all (the cluster controls
//! shutdown itself through its own `HaltFlag`s), which is simply a matter
//! of not calling `install_usr_signals` in that mode.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::fsm::HaltFlag;

/// Which of the two user-defined signals a stand-alone client received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Finish the current bundle, then stop pulling new tasks.
    Usr1,
    /// As `Usr1`, but also escalate the SIGINT/SIGTERM/SIGKILL ladder
    /// against any task currently running.
    Usr2,
}

/// Registers a Ctrl-C (and, on Unix, SIGTERM) listener that trips every
/// `HaltFlag` handed to it and broadcasts on `shutdown_tx` once.
pub fn install(flags: Vec<Arc<HaltFlag>>) -> broadcast::Sender<()> {
    let (tx, _) = broadcast::channel(1);
    let tx_task = tx.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        for flag in &flags {
            flag.trip();
        }
        let _ = tx_task.send(());
    });
    tx
}

/// Registers SIGUSR1/SIGUSR2 listeners for a stand-alone client: SIGUSR1
/// trips only `halt` (stop between bundles); SIGUSR2 trips both `halt` and
/// `interrupt` (also escalate against the in-flight task). A no-op on
/// non-Unix targets, where neither signal exists.
#[cfg(unix)]
pub fn install_usr_signals(halt: Arc<HaltFlag>, interrupt: Arc<HaltFlag>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut usr1 = match signal(SignalKind::user_defined1()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGUSR1 handler");
                return;
            }
        };
        let mut usr2 = match signal(SignalKind::user_defined2()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGUSR2 handler");
                return;
            }
        };
        loop {
            tokio::select! {
                _ = usr1.recv() => {
                    tracing::info!("received SIGUSR1, stopping between bundles");
                    halt.trip();
                }
                _ = usr2.recv() => {
                    tracing::info!("received SIGUSR2, interrupting in-flight tasks");
                    halt.trip();
                    interrupt.trip();
                }
            }
            if halt.is_tripped() && interrupt.is_tripped() {
                break;
            }
        }
    });
}

#[cfg(not(unix))]
pub fn install_usr_signals(_halt: Arc<HaltFlag>, _interrupt: Arc<HaltFlag>) {}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::select! {
        _ = ctrl_c => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn install_returns_a_usable_sender() {
        let flag = Arc::new(HaltFlag::new());
        let tx = install(vec![flag.clone()]);
        let mut rx = tx.subscribe();
        assert!(!flag.is_tripped());
        drop(rx.try_recv());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn usr1_trips_only_halt_usr2_trips_both() {
        use nix::sys::signal::{raise, Signal as NixSignal};

        let halt = Arc::new(HaltFlag::new());
        let interrupt = Arc::new(HaltFlag::new());
        install_usr_signals(halt.clone(), interrupt.clone());
        tokio::task::yield_now().await;

        raise(NixSignal::SIGUSR1).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(halt.is_tripped());
        assert!(!interrupt.is_tripped());

        raise(NixSignal::SIGUSR2).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(interrupt.is_tripped());
    }
}
