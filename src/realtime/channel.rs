//! WebSocket push channel using tokio-tungstenite

use futures::StreamExt;
use std::fmt;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, error, info, warn};

use crate::cache::QueryCache;
use crate::config::{Config, RealtimeConfig};
use crate::error::RealtimeError;

use super::backoff::BackoffState;
use super::events::PushEvent;
use super::merge::{apply_push_event, MergeOutcome};

/// Connection state of the push channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
  /// Not connected to the server
  #[default]
  Disconnected,
  /// Attempting to establish connection
  Connecting,
  /// Successfully connected
  Connected,
  /// Connection lost, waiting to reconnect
  Reconnecting,
  /// Gave up: credentials rejected or reconnect attempts used up
  Failed,
}

impl fmt::Display for ConnectionState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let label = match self {
      Self::Disconnected => "disconnected",
      Self::Connecting => "connecting",
      Self::Connected => "connected",
      Self::Reconnecting => "reconnecting",
      Self::Failed => "failed",
    };
    f.write_str(label)
  }
}

/// A push event together with what merging it did to the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct PushUpdate {
  pub event: PushEvent,
  pub outcome: MergeOutcome,
}

/// How one connection ended.
enum SessionEnd {
  /// Socket closed or errored; worth reconnecting
  Lost(String),
  AuthRejected(String),
  /// Nobody is listening for updates anymore
  Stopped,
}

/// Realtime channel that merges server push events into a [`QueryCache`].
pub struct PushChannel {
  config: RealtimeConfig,
  token: Option<String>,
  cache: QueryCache,
  state: watch::Sender<ConnectionState>,
}

impl PushChannel {
  pub fn new(config: RealtimeConfig, cache: QueryCache) -> Self {
    let (state, _) = watch::channel(ConnectionState::Disconnected);
    Self {
      config,
      token: Config::get_token(),
      cache,
      state,
    }
  }

  pub fn with_token(mut self, token: Option<String>) -> Self {
    self.token = token;
    self
  }

  pub fn state(&self) -> ConnectionState {
    *self.state.borrow()
  }

  /// Receiver that sees every state transition.
  pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
    self.state.subscribe()
  }

  fn set_state(&self, state: ConnectionState) {
    let previous = self.state.send_replace(state);
    if previous != state {
      debug!("Realtime channel {} -> {}", previous, state);
    }
  }

  /// Connect and keep merging events until the session is rejected, the
  /// reconnect attempts run out, or `updates` is closed.
  ///
  /// Every event is merged into the cache before it is forwarded.
  pub async fn run(&self, updates: mpsc::UnboundedSender<PushUpdate>) -> Result<(), RealtimeError> {
    let mut backoff = BackoffState::from_config(&self.config);

    loop {
      self.set_state(ConnectionState::Connecting);

      let end = match self.session(&updates, &mut backoff).await {
        Ok(end) => end,
        Err(e) => {
          self.set_state(ConnectionState::Failed);
          return Err(e);
        }
      };

      match end {
        SessionEnd::Stopped => {
          self.set_state(ConnectionState::Disconnected);
          return Ok(());
        }
        SessionEnd::AuthRejected(message) => {
          error!("Realtime authentication rejected: {}", message);
          self.set_state(ConnectionState::Failed);
          return Err(RealtimeError::Auth(message));
        }
        SessionEnd::Lost(reason) => {
          warn!("Realtime connection lost: {}", reason);
        }
      }

      self.set_state(ConnectionState::Reconnecting);
      let Some(delay) = backoff.next_delay() else {
        error!("Max reconnection attempts reached, giving up");
        self.set_state(ConnectionState::Failed);
        return Err(RealtimeError::Exhausted {
          attempts: backoff.attempts(),
        });
      };
      info!(
        "Reconnection attempt {} of {}, waiting {}ms",
        backoff.attempts(),
        backoff.max_attempts(),
        delay.as_millis()
      );
      tokio::time::sleep(delay).await;
    }
  }

  async fn session(
    &self,
    updates: &mpsc::UnboundedSender<PushUpdate>,
    backoff: &mut BackoffState,
  ) -> Result<SessionEnd, RealtimeError> {
    let mut request = self
      .config
      .ws_url
      .as_str()
      .into_client_request()
      .map_err(|e| RealtimeError::InvalidUrl(format!("{}: {}", self.config.ws_url, e)))?;
    if let Some(token) = &self.token {
      let value = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|e| RealtimeError::Auth(format!("token is not a valid header value: {}", e)))?;
      request.headers_mut().insert(AUTHORIZATION, value);
    }

    let mut socket = match connect_async(request).await {
      Ok((socket, _)) => socket,
      Err(tungstenite::Error::Http(response))
        if matches!(
          response.status(),
          StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) =>
      {
        return Ok(SessionEnd::AuthRejected(format!(
          "handshake returned {}",
          response.status()
        )));
      }
      Err(e) => return Ok(SessionEnd::Lost(e.to_string())),
    };

    info!("Connected to realtime channel at {}", self.config.ws_url);
    self.set_state(ConnectionState::Connected);

    let mut received_any = false;
    while let Some(message) = socket.next().await {
      let text = match message {
        Ok(Message::Text(text)) => text,
        Ok(Message::Close(frame)) => {
          let reason = frame
            .map(|f| f.reason.to_string())
            .unwrap_or_else(|| "closed by server".to_string());
          return Ok(SessionEnd::Lost(reason));
        }
        Ok(_) => continue,
        Err(e) => return Ok(SessionEnd::Lost(e.to_string())),
      };

      // Only a connection that delivered something counts as recovered
      if !received_any {
        received_any = true;
        backoff.reset();
      }

      let event = match PushEvent::parse(&text) {
        Ok(event) => event,
        Err(e) => {
          warn!("Failed to parse push event: {}", e);
          continue;
        }
      };

      let outcome = apply_push_event(&self.cache, &event);
      let auth_message = match &event {
        PushEvent::AuthError { message } => Some(message.clone()),
        _ => None,
      };

      if updates.send(PushUpdate { event, outcome }).is_err() {
        return Ok(SessionEnd::Stopped);
      }
      if let Some(message) = auth_message {
        return Ok(SessionEnd::AuthRejected(message));
      }
    }

    Ok(SessionEnd::Lost("stream ended".to_string()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::updates::fixtures::notification;
  use crate::api::{NotificationList, VibelyKey};
  use futures::SinkExt;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;
  use tokio::net::TcpListener;
  use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

  fn config(addr: std::net::SocketAddr) -> RealtimeConfig {
    RealtimeConfig {
      ws_url: format!("ws://{}/realtime", addr),
      max_attempts: 2,
      initial_delay_ms: 10,
      max_delay_ms: 20,
    }
  }

  #[tokio::test]
  async fn test_merges_events_then_stops_on_auth_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
      let (stream, _) = listener.accept().await.unwrap();
      let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
      let pushed = serde_json::json!({
        "type": "notification",
        "notification": serde_json::to_value(notification("n2")).unwrap(),
      });
      ws.send(Message::Text(pushed.to_string())).await.unwrap();
      ws.send(Message::Text(r#"{"type":"typing"}"#.to_string()))
        .await
        .unwrap();
      ws.send(Message::Text(r#"{"type":"authError","message":"expired"}"#.to_string()))
        .await
        .unwrap();
      // Keep the socket open until the client hangs up
      while ws.next().await.is_some() {}
    });

    let cache = QueryCache::new();
    let key = VibelyKey::Notifications.cache_key();
    cache.set(&key, NotificationList(vec![notification("n1")]));

    let channel = PushChannel::new(config(addr), cache.clone()).with_token(Some("t0ken".to_string()));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let result = channel.run(tx).await;
    assert_eq!(result, Err(RealtimeError::Auth("expired".to_string())));
    assert_eq!(channel.state(), ConnectionState::Failed);

    let first = rx.recv().await.unwrap();
    assert_eq!(first.outcome, MergeOutcome::Merged);
    assert_eq!(rx.recv().await.unwrap().outcome, MergeOutcome::Ignored);
    assert_eq!(rx.recv().await.unwrap().outcome, MergeOutcome::AuthFailed);

    let list = cache.get::<NotificationList>(&key).unwrap().unwrap();
    assert_eq!(list.0[0].id, "n2");

    drop(channel);
    server.abort();
  }

  #[tokio::test]
  async fn test_handshake_401_does_not_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    let server = tokio::spawn(async move {
      while let Ok((stream, _)) = listener.accept().await {
        counter.fetch_add(1, Ordering::SeqCst);
        let reject = |_: &Request, _: Response| -> Result<Response, ErrorResponse> {
          let mut response = ErrorResponse::new(Some("unauthorized".to_string()));
          *response.status_mut() = StatusCode::UNAUTHORIZED;
          Err(response)
        };
        let _ = tokio_tungstenite::accept_hdr_async(stream, reject).await;
      }
    });

    let channel = PushChannel::new(config(addr), QueryCache::new()).with_token(None);
    let (tx, _rx) = mpsc::unbounded_channel();

    let result = channel.run(tx).await;
    assert!(matches!(result, Err(RealtimeError::Auth(_))));
    assert_eq!(channel.state(), ConnectionState::Failed);
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    server.abort();
  }

  #[tokio::test]
  async fn test_gives_up_after_max_attempts() {
    // Grab a free port, then close it so every connect is refused
    let addr = {
      let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
      listener.local_addr().unwrap()
    };

    let channel = PushChannel::new(config(addr), QueryCache::new()).with_token(None);
    let mut states = channel.watch_state();
    let (tx, _rx) = mpsc::unbounded_channel();

    let result = channel.run(tx).await;
    assert_eq!(result, Err(RealtimeError::Exhausted { attempts: 2 }));
    assert_eq!(*states.borrow_and_update(), ConnectionState::Failed);
  }

  #[tokio::test]
  async fn test_invalid_url() {
    let channel = PushChannel::new(
      RealtimeConfig {
        ws_url: "not a url".to_string(),
        ..RealtimeConfig::default()
      },
      QueryCache::new(),
    );
    let (tx, _rx) = mpsc::unbounded_channel();
    assert!(matches!(
      channel.run(tx).await,
      Err(RealtimeError::InvalidUrl(_))
    ));
    assert_eq!(channel.state(), ConnectionState::Failed);
  }
}
