//! One-way status push to the display daemon over its UNIX socket.
//!
//! Line protocol: `SET_STATUS <OK|RECOVERING|BLIND:n>\n`. Replies are never
//! read; a missing daemon only costs a connect error.

use nexwatch_common::{DisplayError, StatusCode};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;

/// Handle to the display daemon, built once at startup and passed to
/// whoever pushes status.
#[derive(Debug, Clone)]
pub struct DisplayClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl DisplayClient {
    pub fn new(socket_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout,
        }
    }

    pub fn command(code: StatusCode) -> String {
        format!("SET_STATUS {}\n", code)
    }

    pub async fn push_status(&self, code: StatusCode) -> Result<(), DisplayError> {
        let connect = UnixStream::connect(&self.socket_path);
        let mut stream = match tokio::time::timeout(self.timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(DisplayError::Connect {
                    path: self.socket_path.display().to_string(),
                    source,
                });
            }
            Err(_) => return Err(DisplayError::Timeout(self.timeout)),
        };

        let line = Self::command(code);
        match tokio::time::timeout(self.timeout, stream.write_all(line.as_bytes())).await {
            Ok(result) => result?,
            Err(_) => return Err(DisplayError::Timeout(self.timeout)),
        }
        stream.shutdown().await?;
        Ok(())
    }
}
