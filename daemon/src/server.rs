use governor::{clock, state::InMemoryState, state::NotKeyed, Quota, RateLimiter};
use shared::ipc::{Command, Response};
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::config::RateLimitConfig;
use crate::state::DaemonState;

type CommandLimiter = RateLimiter<NotKeyed, InMemoryState, clock::DefaultClock>;

/// Control socket path: XDG runtime directory when available,
/// /tmp otherwise. The CLI resolves the same path.
pub fn get_socket_path() -> PathBuf {
    if let Some(runtime_dir) = dirs::runtime_dir() {
        runtime_dir.join("farfieldd.sock")
    } else {
        PathBuf::from("/tmp/farfieldd.sock")
    }
}

/// Token bucket guarding the dispatch below, so a runaway client
/// cannot cycle the satellite (and its audio devices) with a flood of
/// start/stop commands. `None` when disabled in config.
///
/// # Panics
/// Panics if `commands_per_second` or `burst_capacity` is 0.
fn build_limiter(config: &RateLimitConfig) -> Option<CommandLimiter> {
    if !config.enabled {
        return None;
    }
    let per_second = NonZeroU32::new(config.commands_per_second)
        .expect("rate_limit.commands_per_second must be non-zero");
    let burst = NonZeroU32::new(config.burst_capacity)
        .expect("rate_limit.burst_capacity must be non-zero");
    Some(RateLimiter::direct(
        Quota::per_second(per_second).allow_burst(burst),
    ))
}

fn command_allowed(limiter: &Option<CommandLimiter>) -> bool {
    limiter.as_ref().map_or(true, |l| l.check().is_ok())
}

pub struct DaemonServer {
    socket_path: PathBuf,
    state: Arc<Mutex<DaemonState>>,
    limiter: Arc<Option<CommandLimiter>>,
}

impl DaemonServer {
    pub fn new(
        socket_path: PathBuf,
        state: Arc<Mutex<DaemonState>>,
        rate_limit: &RateLimitConfig,
    ) -> Self {
        Self {
            socket_path,
            state,
            limiter: Arc::new(build_limiter(rate_limit)),
        }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let socket_path = self.socket_path.clone();

        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }

        info!("Starting control socket at {}", socket_path.display());

        let listener = UnixListener::bind(&socket_path)?;
        debug!("Listener bound successfully");

        loop {
            let state = Arc::clone(&self.state);
            let limiter = Arc::clone(&self.limiter);
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(state, limiter, stream).await {
                            error!("Error handling connection: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                }
            }
        }
    }

    async fn handle_connection(
        state: Arc<Mutex<DaemonState>>,
        limiter: Arc<Option<CommandLimiter>>,
        mut stream: tokio::net::UnixStream,
    ) -> anyhow::Result<()> {
        let mut buffer = vec![0u8; 1024];
        let n = stream.read(&mut buffer).await?;

        if n == 0 {
            return Ok(());
        }

        buffer.truncate(n);

        let command: Command = serde_json::from_slice(&buffer)?;

        info!("Received command: {:?}", command);

        let response = if !command_allowed(&limiter) {
            Response::Error("rate limited, try again later".to_string())
        } else {
            Self::dispatch(state, command).await
        };

        let response_json = serde_json::to_vec(&response)?;
        stream.write_all(&response_json).await?;

        debug!("Sent response: {:?}", response);

        Ok(())
    }

    async fn dispatch(state: Arc<Mutex<DaemonState>>, command: Command) -> Response {
        match command {
            Command::Start => {
                let mut state_guard = state.lock().await;
                match state_guard.start() {
                    Ok(()) => Response::Ok,
                    Err(e) => Response::Error(e.to_string()),
                }
            }
            Command::Stop => {
                let mut state_guard = state.lock().await;
                state_guard.stop().await;
                Response::Ok
            }
            Command::Status => {
                let status = state.lock().await.get_status();
                Response::Status(status)
            }
            Command::Record(enabled) => {
                let state_guard = state.lock().await;
                match state_guard.set_recording(enabled) {
                    Ok(()) => Response::Ok,
                    Err(e) => Response::Error(e),
                }
            }
        }
    }
}

impl Drop for DaemonServer {
    fn drop(&mut self) {
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }
}
