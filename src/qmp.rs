use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::UnixStream,
    time::timeout,
};

const IO_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum QmpError {
    #[error("connecting to QMP socket: {0}")]
    Connect(std::io::Error),

    #[error("QMP I/O timed out")]
    Timeout,

    #[error("QMP I/O error: {0}")]
    Io(std::io::Error),

    #[error("QMP reply line exceeded {MAX_LINE_BYTES} bytes")]
    LineTooLarge,

    #[error("malformed QMP message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unexpected greeting: missing 'QMP' key")]
    BadGreeting,

    #[error("QMP command failed: {0}")]
    CommandFailed(String),
}

/// A single QMP session: connect, greeting, capabilities negotiation, then
/// one `execute` call per command. The wire framing (newline-delimited JSON,
/// 5s I/O timeout, 1 MiB line cap) is implemented directly rather than via a
/// QMP client crate, since that framing is itself one of the components this
/// controller owns.
pub struct QmpClient {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
}

impl QmpClient {
    pub async fn connect(socket_path: &std::path::Path) -> Result<Self, QmpError> {
        let stream = timeout(IO_TIMEOUT, UnixStream::connect(socket_path)).await.map_err(|_| QmpError::Timeout)?.map_err(QmpError::Connect)?;
        let (read_half, writer) = tokio::io::split(stream);
        let mut client = Self { reader: BufReader::new(read_half), writer };
        let greeting = client.read_message().await?;
        if greeting.get("QMP").is_none() {
            return Err(QmpError::BadGreeting);
        }
        client.execute_raw("qmp_capabilities", Value::Null).await?;
        Ok(client)
    }

    async fn read_message(&mut self) -> Result<Value, QmpError> {
        let mut line = String::new();
        let read = timeout(IO_TIMEOUT, self.reader.read_line(&mut line)).await.map_err(|_| QmpError::Timeout)?.map_err(QmpError::Io)?;
        if read == 0 {
            return Err(QmpError::Io(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "QMP socket closed")));
        }
        if line.len() > MAX_LINE_BYTES {
            return Err(QmpError::LineTooLarge);
        }
        Ok(serde_json::from_str(&line)?)
    }

    async fn execute_raw(&mut self, command: &str, arguments: Value) -> Result<Value, QmpError> {
        let mut request = json!({ "execute": command });
        if !arguments.is_null() {
            request["arguments"] = arguments;
        }
        let mut payload = serde_json::to_vec(&request)?;
        payload.push(b'\n');
        timeout(IO_TIMEOUT, self.writer.write_all(&payload)).await.map_err(|_| QmpError::Timeout)?.map_err(QmpError::Io)?;

        loop {
            let reply = self.read_message().await?;
            // QEMU may interleave asynchronous events; skip those.
            if reply.get("event").is_some() {
                continue;
            }
            if let Some(error) = reply.get("error") {
                return Err(QmpError::CommandFailed(error.to_string()));
            }
            return Ok(reply.get("return").cloned().unwrap_or(Value::Null));
        }
    }

    pub async fn execute<A: Serialize, R: DeserializeOwned>(&mut self, command: &str, arguments: A) -> Result<R, QmpError> {
        let arguments = serde_json::to_value(arguments)?;
        let result = self.execute_raw(command, arguments).await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn execute_no_args<R: DeserializeOwned>(&mut self, command: &str) -> Result<R, QmpError> {
        let result = self.execute_raw(command, Value::Null).await?;
        Ok(serde_json::from_value(result)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tokio::{io::AsyncWriteExt, net::UnixListener};

    #[tokio::test]
    async fn handshake_then_command() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("qmp.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"{\"QMP\":{\"version\":{}}}\n").await.unwrap();
            let mut buf = [0u8; 256];
            let (read_half, mut write_half) = stream.split();
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            assert!(line.contains("qmp_capabilities"));
            write_half.write_all(b"{\"return\":{}}\n").await.unwrap();

            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            assert!(line.contains("query-status"));
            write_half.write_all(b"{\"return\":{\"status\":\"running\"}}\n").await.unwrap();
            let _ = buf;
        });

        let mut client = QmpClient::connect(&socket_path).await.unwrap();
        let status: Value = client.execute_no_args("query-status").await.unwrap();
        assert_eq!(status["status"], "running");
        server.await.unwrap();
    }
}
