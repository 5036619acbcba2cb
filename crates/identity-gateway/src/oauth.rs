//! Loopback callback server for browser-based social sign-in.
//!
//! The popup flow: the host application opens the provider's authorize URL
//! in a browser, the provider redirects back to this local listener with
//! tokens in the query string, and the gateway finishes the sign-in.

use crate::{ProviderError, ProviderResult};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

/// Default callback port.
pub const DEFAULT_CALLBACK_PORT: u16 = 9377;

/// Default time to wait for the browser redirect, in seconds.
pub const DEFAULT_CALLBACK_TIMEOUT_SECS: u64 = 120;

/// Outcome of a browser sign-in redirect.
#[derive(Debug, Clone)]
pub struct CallbackOutcome {
    /// Whether the redirect carried a usable token set.
    pub success: bool,
    /// Access token (if successful).
    pub access_token: Option<String>,
    /// Refresh token (if successful).
    pub refresh_token: Option<String>,
    /// Token lifetime in seconds (if successful).
    pub expires_in: Option<i64>,
    /// Error message (if failed).
    pub error: Option<String>,
}

impl CallbackOutcome {
    /// Create a successful outcome.
    pub fn success(access_token: String, refresh_token: String, expires_in: i64) -> Self {
        Self {
            success: true,
            access_token: Some(access_token),
            refresh_token: Some(refresh_token),
            expires_in: Some(expires_in),
            error: None,
        }
    }

    /// Create a failed outcome.
    pub fn failure(error: String) -> Self {
        Self {
            success: false,
            access_token: None,
            refresh_token: None,
            expires_in: None,
            error: Some(error),
        }
    }
}

/// Local HTTP listener that waits for the provider's sign-in redirect.
pub struct OAuthCallbackServer {
    port: u16,
    timeout_secs: u64,
}

impl OAuthCallbackServer {
    /// Create a new callback server.
    pub fn new(port: u16, timeout_secs: u64) -> Self {
        Self { port, timeout_secs }
    }

    /// Create with default settings.
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_CALLBACK_PORT, DEFAULT_CALLBACK_TIMEOUT_SECS)
    }

    /// The redirect URL the provider should be pointed at.
    pub fn callback_url(&self) -> String {
        format!("http://localhost:{}/callback", self.port)
    }

    /// Start the listener and wait for the redirect.
    ///
    /// The caller is responsible for opening the browser to the authorize
    /// URL before or after calling this.
    pub async fn wait_for_callback(&self) -> ProviderResult<CallbackOutcome> {
        let addr = format!("127.0.0.1:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ProviderError::OAuth(format!("Failed to bind to {}: {}", addr, e)))?;

        info!(port = self.port, "Sign-in callback server listening");

        let (tx, rx) = oneshot::channel::<CallbackOutcome>();
        let tx = Arc::new(tokio::sync::Mutex::new(Some(tx)));

        let server_handle = tokio::spawn({
            let tx = tx.clone();
            async move {
                loop {
                    match listener.accept().await {
                        Ok((mut socket, _)) => {
                            let tx = tx.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(&mut socket, tx).await {
                                    error!("Error handling callback connection: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                            break;
                        }
                    }
                }
            }
        });

        let timeout = tokio::time::Duration::from_secs(self.timeout_secs);
        let outcome = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => CallbackOutcome::failure("Internal error: channel closed".to_string()),
            Err(_) => CallbackOutcome::failure("Sign-in timed out".to_string()),
        };

        server_handle.abort();

        Ok(outcome)
    }
}

/// Handle one incoming HTTP connection.
async fn handle_connection(
    socket: &mut tokio::net::TcpStream,
    tx: Arc<tokio::sync::Mutex<Option<oneshot::Sender<CallbackOutcome>>>>,
) -> ProviderResult<()> {
    let (reader, mut writer) = socket.split();
    let mut reader = BufReader::new(reader);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;

    debug!(request = %request_line.trim(), "Received callback request");

    if !request_line.starts_with("GET ") {
        send_response(&mut writer, 405, "Method Not Allowed", "Method Not Allowed").await?;
        return Ok(());
    }

    let path_end = request_line.find(" HTTP/").unwrap_or(request_line.len());
    let path = &request_line[4..path_end];

    if !path.starts_with("/callback") {
        send_response(&mut writer, 404, "Not Found", "Not Found").await?;
        return Ok(());
    }

    let query = if let Some(idx) = path.find('?') {
        &path[idx + 1..]
    } else {
        ""
    };

    let params: std::collections::HashMap<String, String> = query
        .split('&')
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?.to_string();
            let value = parts.next().unwrap_or("").to_string();
            Some((key, percent_decode(&value)))
        })
        .collect();

    let access_token = params.get("access_token").cloned();
    let refresh_token = params.get("refresh_token").cloned();
    let expires_in = params.get("expires_in").and_then(|s| s.parse().ok());
    let error = params
        .get("error_description")
        .or_else(|| params.get("error"))
        .cloned();

    let outcome = if let Some(err) = error {
        send_response(&mut writer, 200, "OK", &error_page(&err)).await?;
        CallbackOutcome::failure(err)
    } else if let (Some(token), Some(refresh)) = (access_token, refresh_token) {
        send_response(&mut writer, 200, "OK", &success_page()).await?;
        CallbackOutcome::success(token, refresh, expires_in.unwrap_or(3600))
    } else {
        send_response(&mut writer, 200, "OK", &error_page("Missing token parameters")).await?;
        CallbackOutcome::failure("Missing token parameters".to_string())
    };

    if let Some(tx) = tx.lock().await.take() {
        let _ = tx.send(outcome);
    }

    Ok(())
}

async fn send_response(
    writer: &mut tokio::net::tcp::WriteHalf<'_>,
    status_code: u16,
    status_text: &str,
    body: &str,
) -> ProviderResult<()> {
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status_code,
        status_text,
        body.len(),
        body
    );
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

fn success_page() -> String {
    r#"<!DOCTYPE html>
<html>
<head><title>Sign-in Successful</title></head>
<body style="font-family: system-ui; text-align: center; padding: 50px;">
<h1>Sign-in successful</h1>
<p>You can close this window and return to the application.</p>
<script>setTimeout(() => window.close(), 2000);</script>
</body>
</html>"#
        .to_string()
}

fn error_page(error: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head><title>Sign-in Failed</title></head>
<body style="font-family: system-ui; text-align: center; padding: 50px;">
<h1>Sign-in failed</h1>
<p>Error: {}</p>
<p>You can close this window and try again.</p>
</body>
</html>"#,
        error
    )
}

/// Percent-encode a string for use in a query parameter.
pub(crate) fn percent_encode(s: &str) -> String {
    let mut result = String::new();
    for c in s.chars() {
        match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '-' | '_' | '.' | '~' => result.push(c),
            _ => {
                for byte in c.to_string().as_bytes() {
                    result.push_str(&format!("%{:02X}", byte));
                }
            }
        }
    }
    result
}

/// Decode a percent-encoded query value.
pub(crate) fn percent_decode(s: &str) -> String {
    let mut result = Vec::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '%' {
            let hex: String = chars.by_ref().take(2).collect();
            if let Ok(byte) = u8::from_str_radix(&hex, 16) {
                result.push(byte);
            }
        } else if c == '+' {
            result.push(b' ');
        } else {
            let mut buf = [0u8; 4];
            result.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
        }
    }

    String::from_utf8_lossy(&result).to_string()
}
