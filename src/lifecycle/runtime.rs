//! The owner task.

use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;

use crate::event::Event;
use crate::server::{Server, ServerHandle, SessionRegistry};

/// Drains the event queue into a [`Server`], runs the keepalive sweep, and
/// closes everything when shutdown is signalled.
pub struct EventLoop {
    server: Server,
    events: mpsc::UnboundedReceiver<Event>,
    sweep_interval: Duration,
}

impl EventLoop {
    pub fn new(
        server: Server,
        events: mpsc::UnboundedReceiver<Event>,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            server,
            events,
            sweep_interval,
        }
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn handle(&self) -> ServerHandle {
        self.server.handle()
    }

    pub fn registry(&self) -> SessionRegistry {
        self.server.registry()
    }

    /// Run until `shutdown` fires.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            sweep_interval_ms = self.sweep_interval.as_millis() as u64,
            "Event loop started"
        );

        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => self.server.handle_event(event),
                    None => break,
                },
                _ = sweep.tick() => {
                    self.server.sweep(Instant::now());
                }
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.server.shutdown();

        // Connections closed before shutdown may still be queued for release.
        while let Ok(event) = self.events.try_recv() {
            if let Event::Destroy(connection) = event {
                drop(connection);
            }
        }
        tracing::info!("Event loop stopped");
    }
}
