//! Sandbox side of the query bridge.

use std::io::ErrorKind;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use codebox_core::wire::{read_message, write_message};
use codebox_core::{Error, QueryRequest, QueryResponse, SessionId};

/// Blocking query interface handed to the interpreter.
///
/// Failures are plain strings; they surface to sandboxed code as the
/// second return value of `llm_query` and never abort the block.
pub trait QueryPort: Send + Sync {
    fn query(&self, prompt: &str) -> Result<String, String>;

    /// Answers in prompt order, one per prompt.
    fn query_batched(&self, prompts: &[String]) -> Vec<Result<String, String>>;
}

/// Port for sessions without a bridge.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullPort;

const NO_BRIDGE: &str = "queries are not available in this environment";

impl QueryPort for NullPort {
    fn query(&self, _prompt: &str) -> Result<String, String> {
        Err(NO_BRIDGE.to_string())
    }

    fn query_batched(&self, prompts: &[String]) -> Vec<Result<String, String>> {
        vec![Err(NO_BRIDGE.to_string()); prompts.len()]
    }
}

/// Query port speaking the framed wire protocol to a bridge listener.
///
/// Each query opens its own connection, so concurrent callers never share
/// a stream. Connection failures are retried with exponential backoff;
/// a response that does not arrive within the query timeout is reported
/// as a timeout.
#[derive(Debug, Clone)]
pub struct TcpQueryPort {
    address: String,
    session_id: SessionId,
    block: u64,
    timeout: Duration,
    retries: u32,
    backoff: Duration,
    token: Option<String>,
}

impl TcpQueryPort {
    pub fn new(address: impl Into<String>, session_id: SessionId, block: u64, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            session_id,
            block,
            timeout,
            retries: 3,
            backoff: Duration::from_millis(100),
            token: None,
        }
    }

    /// Bridge token sent with every request.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Connection attempts beyond the first.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    fn exchange(&self, request: &QueryRequest) -> Result<QueryResponse, String> {
        let mut stream = self.connect()?;
        stream
            .set_read_timeout(Some(self.timeout))
            .and_then(|_| stream.set_write_timeout(Some(self.timeout)))
            .map_err(|e| format!("bridge socket setup failed: {}", e))?;

        write_message(&mut stream, request).map_err(|e| format!("failed to send query: {}", e))?;

        loop {
            match read_message::<_, QueryResponse>(&mut stream) {
                Ok(Some(response)) if response.request_id == request.request_id => return Ok(response),
                Ok(Some(response)) => {
                    tracing::warn!(request_id = %response.request_id, "Ignoring response for another request");
                }
                Ok(None) => return Err("bridge closed the connection before responding".to_string()),
                Err(Error::Io(e)) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Err(format!("query timed out after {}ms", self.timeout.as_millis()));
                }
                Err(e) => return Err(format!("bridge error: {}", e)),
            }
        }
    }

    fn connect(&self) -> Result<TcpStream, String> {
        let mut delay = self.backoff;
        let mut attempt = 0;
        loop {
            match self.try_connect() {
                Ok(stream) => return Ok(stream),
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    tracing::debug!(attempt, address = %self.address, error = %e, "Bridge connect failed, retrying");
                    std::thread::sleep(delay);
                    delay *= 2;
                }
                Err(e) => {
                    return Err(format!(
                        "cannot reach bridge at {} after {} attempts: {}",
                        self.address,
                        attempt + 1,
                        e
                    ))
                }
            }
        }
    }

    fn try_connect(&self) -> std::io::Result<TcpStream> {
        let addrs: Vec<SocketAddr> = self.address.to_socket_addrs()?.collect();
        let mut last = std::io::Error::new(ErrorKind::NotFound, "address resolved to nothing");
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last = e,
            }
        }
        Err(last)
    }
}

impl QueryPort for TcpQueryPort {
    fn query(&self, prompt: &str) -> Result<String, String> {
        let request =
            QueryRequest::single(self.session_id.clone(), self.block, prompt).with_token(self.token.clone());
        self.exchange(&request)?.into_single()
    }

    fn query_batched(&self, prompts: &[String]) -> Vec<Result<String, String>> {
        if prompts.is_empty() {
            return Vec::new();
        }
        let request = QueryRequest::batched(self.session_id.clone(), self.block, prompts.to_vec())
            .with_token(self.token.clone());
        match self.exchange(&request) {
            Ok(response) => response.into_batch(prompts.len()),
            Err(reason) => vec![Err(reason); prompts.len()],
        }
    }
}
