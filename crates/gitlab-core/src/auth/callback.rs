use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time;
use tracing::{debug, error};
use url::Url;

use super::oauth::{DEFAULT_REDIRECT_HOST, DEFAULT_REDIRECT_PATH, DEFAULT_REDIRECT_PORT};
use super::{AuthError, OAuthClient, TokenGrant};

const SUCCESS_HTML: &str = r#"<html><body><h1>Authentication complete</h1><p>You have authenticated successfully. You may close this window and return to the terminal.</p></body></html>"#;
const ERROR_HTML: &str = r#"<html><body><h1>Authentication failed</h1><p>Please return to the terminal for details.</p></body></html>"#;
const NOT_FOUND_HTML: &str = r#"<html><body><h1>Not found</h1></body></html>"#;

const MAX_REQUEST_BYTES: usize = 8 * 1024;
/// Idle connections (browser preconnects) are dropped after this long.
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the loopback listener binds and which redirect URI it advertises.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectConfig {
    /// Host written into the redirect URI. The listener always binds 127.0.0.1.
    pub host: String,
    /// `0` binds an ephemeral port.
    pub port: u16,
    pub path: String,
}

impl RedirectConfig {
    /// Redirect URI advertised when the listener is bound on `port`.
    pub fn redirect_uri(&self, port: u16) -> Result<Url, AuthError> {
        Ok(Url::parse(&format!("http://{}:{port}{}", self.host, self.path))?)
    }
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_REDIRECT_HOST.to_owned(),
            port: DEFAULT_REDIRECT_PORT,
            path: DEFAULT_REDIRECT_PATH.to_owned(),
        }
    }
}

/// Loopback listener owned by a single login attempt.
#[derive(Debug)]
pub struct LoopbackServer {
    listener: TcpListener,
    redirect_uri: Url,
    path: String,
}

impl LoopbackServer {
    pub async fn bind(config: &RedirectConfig) -> Result<Self, AuthError> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, config.port)).await?;
        let port = listener.local_addr()?.port();
        let redirect_uri = config.redirect_uri(port)?;
        debug!(%redirect_uri, "loopback listener bound");
        Ok(Self {
            listener,
            redirect_uri,
            path: config.path.clone(),
        })
    }

    pub fn redirect_uri(&self) -> &Url {
        &self.redirect_uri
    }

    pub fn local_addr(&self) -> Result<SocketAddr, AuthError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve the redirect in a background task.
    ///
    /// The task answers exactly one request on the redirect path, exchanges its
    /// code with `client`, and reports the outcome through the returned handle.
    pub fn spawn(
        self,
        client: OAuthClient,
        expected_state: String,
        code_verifier: String,
    ) -> CallbackHandle {
        let LoopbackServer { listener, path, .. } = self;
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let outcome = serve_callback(
                listener,
                &path,
                &client,
                &expected_state,
                &code_verifier,
            )
            .await;
            let _ = tx.send(outcome);
        });
        CallbackHandle { result: rx, task }
    }
}

/// Completion side of a running [`LoopbackServer`].
///
/// Dropping the handle aborts the server task.
#[derive(Debug)]
pub struct CallbackHandle {
    result: oneshot::Receiver<Result<TokenGrant, AuthError>>,
    task: JoinHandle<()>,
}

impl CallbackHandle {
    /// Wait for the callback outcome, giving up after `timeout` or once `cancel` resolves.
    ///
    /// The listener is closed and its port released before this returns.
    pub async fn wait<C>(mut self, timeout: Duration, cancel: C) -> Result<TokenGrant, AuthError>
    where
        C: Future<Output = ()>,
    {
        let outcome = tokio::select! {
            received = &mut self.result => {
                received.unwrap_or(Err(AuthError::ListenerClosed))
            }
            _ = tokio::time::sleep(timeout) => Err(AuthError::Timeout(timeout)),
            _ = cancel => Err(AuthError::Cancelled),
        };
        if outcome.is_err() {
            self.task.abort();
        }
        let _ = (&mut self.task).await;
        outcome
    }

    /// Stop the server without waiting for a callback.
    pub async fn abort(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_callback(
    listener: TcpListener,
    path: &str,
    client: &OAuthClient,
    expected_state: &str,
    code_verifier: &str,
) -> Result<TokenGrant, AuthError> {
    let (mut stream, query) = accept_callback(listener, path).await?;
    let outcome = complete_authorization(client, &query, expected_state, code_verifier).await;

    let (status, body) = match &outcome {
        Ok(_) => (200, SUCCESS_HTML),
        Err(
            AuthError::AccessDenied(_)
            | AuthError::StateMismatch
            | AuthError::MissingAuthorizationCode,
        ) => (400, ERROR_HTML),
        Err(_) => (500, ERROR_HTML),
    };
    if let Err(err) = &outcome {
        error!(error = %err, "authorization callback failed");
    }
    if let Err(err) = respond(&mut stream, status, body).await {
        debug!(error = %err, "failed to answer authorization redirect");
    }
    let _ = stream.shutdown().await;
    outcome
}

/// Accept connections until one targets `path`; the listener is closed once it does.
///
/// Every connection is read in its own task so a silent socket cannot hold up
/// the redirect behind it.
async fn accept_callback(
    listener: TcpListener,
    path: &str,
) -> Result<(TcpStream, CallbackQuery), AuthError> {
    let (callbacks, mut received) = mpsc::channel(1);
    let mut connections = JoinSet::new();
    let callback = loop {
        tokio::select! {
            Some(callback) = received.recv() => break callback,
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                connections.spawn(screen_request(stream, peer, path.to_owned(), callbacks.clone()));
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    };
    drop(listener);
    connections.abort_all();
    Ok(callback)
}

/// Answer stray requests directly and hand a request on `path` to the acceptor.
async fn screen_request(
    mut stream: TcpStream,
    peer: SocketAddr,
    path: String,
    callbacks: mpsc::Sender<(TcpStream, CallbackQuery)>,
) {
    let url = match time::timeout(REQUEST_READ_TIMEOUT, read_request_target(&mut stream)).await {
        Ok(Ok(url)) => url,
        Ok(Err(err)) => {
            debug!(%peer, error = %err, "ignoring malformed request");
            let _ = respond(&mut stream, 400, ERROR_HTML).await;
            return;
        }
        Err(_) => {
            debug!(%peer, "closing idle connection");
            return;
        }
    };

    if url.path() != path {
        debug!(%peer, path = url.path(), "ignoring request outside redirect path");
        let _ = respond(&mut stream, 404, NOT_FOUND_HTML).await;
        return;
    }

    let query = CallbackQuery::from_url(&url);
    let _ = callbacks.send((stream, query)).await;
}

async fn complete_authorization(
    client: &OAuthClient,
    query: &CallbackQuery,
    expected_state: &str,
    code_verifier: &str,
) -> Result<TokenGrant, AuthError> {
    if let Some(error) = &query.error {
        let reason = match &query.error_description {
            Some(description) => format!("{error}: {description}"),
            None => error.clone(),
        };
        return Err(AuthError::AccessDenied(reason));
    }

    if query.state.as_deref() != Some(expected_state) {
        return Err(AuthError::StateMismatch);
    }

    let code = query
        .code
        .as_deref()
        .filter(|code| !code.is_empty())
        .ok_or(AuthError::MissingAuthorizationCode)?;

    client.exchange_code(code, code_verifier).await
}

#[derive(Debug, Default, PartialEq, Eq)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

impl CallbackQuery {
    fn from_url(url: &Url) -> Self {
        let mut query = CallbackQuery::default();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "code" => query.code = Some(value.into_owned()),
                "state" => query.state = Some(value.into_owned()),
                "error" => query.error = Some(value.into_owned()),
                "error_description" => query.error_description = Some(value.into_owned()),
                _ => {}
            }
        }
        query
    }
}

async fn read_request_target(stream: &mut TcpStream) -> Result<Url, AuthError> {
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
        if buffer.windows(4).any(|window| window == b"\r\n\r\n")
            || buffer.len() >= MAX_REQUEST_BYTES
        {
            break;
        }
    }
    let request = String::from_utf8_lossy(&buffer);
    let target = parse_request_target(&request)?;
    if !target.starts_with('/') {
        return Err(AuthError::InvalidCallbackRequest(format!(
            "unexpected request target '{target}'"
        )));
    }
    Ok(Url::parse(&format!("http://localhost{target}"))?)
}

fn parse_request_target(request: &str) -> Result<&str, AuthError> {
    let mut lines = request.lines();
    let first_line = lines
        .next()
        .ok_or_else(|| AuthError::InvalidCallbackRequest("missing request line".into()))?;
    let mut parts = first_line.split_whitespace();
    let _method = parts
        .next()
        .ok_or_else(|| AuthError::InvalidCallbackRequest("missing method".into()))?;
    let target = parts
        .next()
        .ok_or_else(|| AuthError::InvalidCallbackRequest("missing path".into()))?;
    Ok(target)
}

async fn respond(stream: &mut TcpStream, status: u16, body: &str) -> Result<(), AuthError> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let response = format!(
        "{status_line}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}
