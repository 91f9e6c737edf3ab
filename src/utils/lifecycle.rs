//! Server lifecycle state shared by the accept loop, the shutdown-rejection
//! interceptor and `Server::shutdown`.
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Starting,
    Listening,
    ShuttingDown,
    Stopped,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ServerState::Starting => "starting",
            ServerState::Listening => "listening",
            ServerState::ShuttingDown => "shutting-down",
            ServerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// One-directional lifecycle: `starting -> listening -> shutting-down -> stopped`.
#[derive(Debug)]
pub struct Lifecycle {
    shutting_down: AtomicBool,
    state: watch::Sender<ServerState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ServerState::Starting);
        Self {
            shutting_down: AtomicBool::new(false),
            state,
        }
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn mark_listening(&self) {
        self.state.send_if_modified(|state| {
            if *state == ServerState::Starting {
                *state = ServerState::Listening;
                true
            } else {
                false
            }
        });
    }

    /// Flip the shutdown flag. Only the first caller gets `true`.
    pub fn begin_shutdown(&self) -> bool {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.state.send_replace(ServerState::ShuttingDown);
        true
    }

    pub fn mark_stopped(&self) {
        self.state.send_replace(ServerState::Stopped);
    }

    /// Resolve once the lifecycle reaches `stopped`.
    pub async fn wait_stopped(&self) {
        let mut rx = self.subscribe();
        // the sender lives in `self`, so the channel cannot close while we wait
        let _ = rx.wait_for(|state| *state == ServerState::Stopped).await;
    }
}
