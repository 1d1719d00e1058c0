use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

#[derive(Debug)]
pub struct GracefulShutdown {
    pub shutdown_finished: JoinHandle<()>,

    trigger: ShutdownTrigger,
    consumer: GracefulShutdownConsumer,
}

/// A clonable handle that starts the shutdown when asked. Safe to call more
/// than once; every call after the first is a no-op.
#[derive(Clone, Debug)]
pub struct ShutdownTrigger(mpsc::Sender<()>);

#[derive(Clone, Debug)]
pub struct GracefulShutdownConsumer(watch::Receiver<bool>);

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut quit = signal(SignalKind::quit()).expect("Installing SIGQUIT handler");
    let mut term = signal(SignalKind::terminate()).expect("Installing SIGTERM handler");
    let mut int = signal(SignalKind::interrupt()).expect("Installing SIGINT handler");

    select! {
        _ = quit.recv() => {},
        _ = term.recv() => {},
        _ = int.recv() => {},
    };
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

impl GracefulShutdown {
    pub fn new() -> GracefulShutdown {
        // This channel changes to true and drops when shutdown is started
        let (shutdown_started_tx, shutdown_started_rx) = watch::channel(false);

        // Send a value or close this channel to start shutting down.
        let (start_shutdown_tx, mut start_shutdown_rx) = mpsc::channel::<()>(1);

        let shutdown_waiter = tokio::spawn(async move {
            select! {
                _ = wait_for_signal() => {},
                _ = start_shutdown_rx.recv() => {},
            };

            shutdown_started_tx.send(true).unwrap();
        });

        GracefulShutdown {
            trigger: ShutdownTrigger(start_shutdown_tx),
            shutdown_finished: shutdown_waiter,
            consumer: GracefulShutdownConsumer(shutdown_started_rx),
        }
    }

    pub fn consumer(&self) -> GracefulShutdownConsumer {
        self.consumer.clone()
    }

    /// A handle that tasks can hold to start the shutdown themselves.
    pub fn trigger(&self) -> ShutdownTrigger {
        self.trigger.clone()
    }

    pub fn shutdown(&self) {
        self.trigger.shutdown();
    }
}

impl Default for GracefulShutdown {
    fn default() -> GracefulShutdown {
        GracefulShutdown::new()
    }
}

impl ShutdownTrigger {
    pub fn shutdown(&self) {
        // Errors here mean the shutdown already started, which is fine.
        let _ = self.0.try_send(());
    }
}

impl GracefulShutdownConsumer {
    pub fn shutting_down(&mut self) -> bool {
        *self.0.borrow()
    }

    pub async fn wait_for_shutdown(&mut self) -> () {
        loop {
            match self.0.changed().await {
                Ok(_) => {
                    // Sender is still open, but value is true so we're shutting down.
                    if *self.0.borrow() == true {
                        return;
                    }
                }
                // Sender closed, which means we're shutting down.
                Err(_) => return,
            }
        }
    }
}
