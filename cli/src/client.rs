use shared::ipc::{Command, IpcError, Response};
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::{timeout, Duration};
use tracing::warn;

/// Timeout for socket operations (5 seconds)
const SOCKET_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolves the daemon's control socket: XDG runtime directory when
/// available, /tmp otherwise. Must match the daemon's resolution.
fn get_socket_path() -> PathBuf {
    if let Some(runtime_dir) = dirs::runtime_dir() {
        runtime_dir.join("farfieldd.sock")
    } else {
        PathBuf::from("/tmp/farfieldd.sock")
    }
}

pub struct DaemonClient {
    socket_path: PathBuf,
}

impl DaemonClient {
    pub fn new() -> Self {
        Self {
            socket_path: get_socket_path(),
        }
    }

    pub async fn send_command(&self, cmd: Command) -> Result<Response, IpcError> {
        // Connect with timeout
        let mut stream = match timeout(SOCKET_TIMEOUT, UnixStream::connect(&self.socket_path)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(IpcError::ConnectionRefused);
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                return Err(IpcError::ConnectionRefused);
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                warn!(
                    "Connection timeout: failed to connect to daemon at {} within {:?}",
                    self.socket_path.display(),
                    SOCKET_TIMEOUT
                );
                return Err(IpcError::Timeout);
            }
        };

        let command_json = serde_json::to_vec(&cmd)?;

        if timeout(SOCKET_TIMEOUT, stream.write_all(&command_json))
            .await
            .is_err()
        {
            warn!(
                "Write timeout: failed to send command to daemon within {:?}",
                SOCKET_TIMEOUT
            );
            return Err(IpcError::Timeout);
        }

        let mut buffer = vec![0u8; 1024];
        let n = match timeout(SOCKET_TIMEOUT, stream.read(&mut buffer)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                warn!(
                    "Read timeout: failed to receive response from daemon within {:?}",
                    SOCKET_TIMEOUT
                );
                return Err(IpcError::Timeout);
            }
        };

        buffer.truncate(n);

        let response: Response = serde_json::from_slice(&buffer)?;

        Ok(response)
    }
}

impl Default for DaemonClient {
    fn default() -> Self {
        Self::new()
    }
}
