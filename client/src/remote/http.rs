use super::{RemoteMirror, RemoteSubscription};
use crate::error::NetworkFailure;
use async_trait::async_trait;
use ensemble_engine::{
    wire::{ClientMessage, PushRequest, PushResponse, ServerMessage},
    Collection, CollectionKey, DeviceId, SyncRecord, Timestamp, UserId,
};
use futures::{SinkExt, Stream, StreamExt};
use reqwest::StatusCode;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, client::IntoClientRequest, http::HeaderValue, Message},
};
use tracing::{debug, warn};
use url::Url;

/// Remote mirror backed by the ensemble sync server.
///
/// Pull and push go over HTTP; subscriptions open one WebSocket each.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: reqwest::Client,
    base: Url,
    token: String,
    timeout: Duration,
}

impl HttpRemote {
    /// `base` is the server root, e.g. `http://localhost:3000`. `token` is
    /// sent as a bearer token on every request.
    pub fn new(
        base: Url,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, NetworkFailure> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base: with_trailing_slash(base),
            token: token.into(),
            timeout,
        })
    }

    fn document_url(&self, key: &str) -> Result<Url, NetworkFailure> {
        Ok(self.base.join(&format!("sync/{key}"))?)
    }

    fn websocket_url(&self) -> Result<Url, NetworkFailure> {
        let mut url = self.base.join("ws")?;
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| NetworkFailure::InvalidUrl(format!("cannot use {scheme} for {url}")))?;
        Ok(url)
    }
}

#[async_trait]
impl RemoteMirror for HttpRemote {
    async fn pull(&self, key: &str) -> Result<Option<SyncRecord>, NetworkFailure> {
        let url = self.document_url(key)?;
        let response = self
            .client
            .get(url.clone())
            .bearer_auth(&self.token)
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let record: SyncRecord = response.json().await?;
                Ok(Some(record))
            }
            status => Err(NetworkFailure::Status {
                status: status.as_u16(),
                url: url.to_string(),
            }),
        }
    }

    async fn push(
        &self,
        key: &str,
        data: &Collection,
        device_id: &DeviceId,
        owner_id: &UserId,
    ) -> Result<Timestamp, NetworkFailure> {
        let url = self.document_url(key)?;
        let body = PushRequest {
            data: data.clone().into_value(),
            device_id: device_id.clone(),
            owner_id: owner_id.clone(),
        };

        let response = self
            .client
            .put(url.clone())
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(NetworkFailure::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let ack: PushResponse = response.json().await?;
        Ok(ack.timestamp)
    }

    async fn subscribe(&self, key: &str) -> Result<RemoteSubscription, NetworkFailure> {
        let url = self.websocket_url()?;
        let mut request = url.as_str().into_client_request()?;
        let auth = HeaderValue::from_str(&format!("Bearer {}", self.token))
            .map_err(|e| NetworkFailure::Malformed(format!("authorization header: {e}")))?;
        request.headers_mut().insert("authorization", auth);

        let (socket, _) = connect_async(request).await?;
        let (mut sink, mut stream) = socket.split();

        let subscribe = encode(&ClientMessage::Subscribe {
            key: key.to_string(),
        })?;
        sink.send(Message::Text(subscribe)).await?;

        // Writes are only routed to this socket once the server has
        // registered the subscription.
        tokio::time::timeout(self.timeout, await_subscribed(&mut stream, key))
            .await
            .map_err(|_| NetworkFailure::Timeout(self.timeout))??;
        debug!(key = %key, "subscription acknowledged");

        let (tx, rx) = mpsc::unbounded_channel();
        let key: CollectionKey = key.to_string();
        let task_key = key.clone();

        tokio::spawn(async move {
            let key = task_key;
            loop {
                tokio::select! {
                    _ = tx.closed() => {
                        if let Ok(text) = encode(&ClientMessage::Unsubscribe { key: key.clone() }) {
                            let _ = sink.send(Message::Text(text)).await;
                        }
                        let _ = sink.close().await;
                        debug!(key = %key, "subscription released");
                        break;
                    }
                    msg = stream.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<ServerMessage>(&text) {
                                Ok(ServerMessage::Record { record }) if record.key == key => {
                                    if tx.send(record).is_err() {
                                        break;
                                    }
                                }
                                Ok(ServerMessage::Error { message, .. }) => {
                                    warn!(key = %key, error = %message, "server reported an error");
                                }
                                Ok(_) => {}
                                Err(e) => warn!(key = %key, error = %e, "malformed server message"),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!(key = %key, "change feed closed by server");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(key = %key, error = %e, "change feed failed");
                            break;
                        }
                    }
                }
            }
        });

        Ok(RemoteSubscription::new(key, rx))
    }
}

async fn await_subscribed<S>(stream: &mut S, key: &str) -> Result<(), NetworkFailure>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(msg) = stream.next().await {
        if let Message::Text(text) = msg? {
            if is_subscribed_ack(&text, key)? {
                return Ok(());
            }
        }
    }
    Err(NetworkFailure::Offline)
}

/// Whether `text` is the server's acknowledgement of a subscription to
/// `key`. A server error while waiting fails the subscription.
fn is_subscribed_ack(text: &str, key: &str) -> Result<bool, NetworkFailure> {
    match serde_json::from_str::<ServerMessage>(text) {
        Ok(ServerMessage::Subscribed { key: acked }) => Ok(acked == key),
        Ok(ServerMessage::Error { message, .. }) => Err(NetworkFailure::Rejected(message)),
        Ok(_) => Ok(false),
        Err(e) => Err(NetworkFailure::Malformed(e.to_string())),
    }
}

fn encode(message: &ClientMessage) -> Result<String, NetworkFailure> {
    serde_json::to_string(message).map_err(|e| NetworkFailure::Malformed(e.to_string()))
}

/// `Url::join` replaces the last path segment unless the base ends in `/`.
fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(base: &str) -> HttpRemote {
        HttpRemote::new(Url::parse(base).unwrap(), "owner-1", Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn document_urls() {
        let r = remote("http://localhost:3000");
        assert_eq!(
            r.document_url("members").unwrap().as_str(),
            "http://localhost:3000/sync/members"
        );

        let r = remote("https://sync.example.com/api");
        assert_eq!(
            r.document_url("tasks").unwrap().as_str(),
            "https://sync.example.com/api/sync/tasks"
        );
    }

    #[test]
    fn subscription_waits_for_matching_ack() {
        assert!(is_subscribed_ack(r#"{"type":"subscribed","key":"members"}"#, "members").unwrap());
        assert!(!is_subscribed_ack(r#"{"type":"subscribed","key":"tasks"}"#, "members").unwrap());
        assert!(!is_subscribed_ack(r#"{"type":"pong"}"#, "members").unwrap());

        let rejected = is_subscribed_ack(
            r#"{"type":"error","message":"unknown collection: setlists"}"#,
            "setlists",
        );
        assert!(matches!(rejected, Err(NetworkFailure::Rejected(m)) if m.contains("setlists")));
        assert!(matches!(
            is_subscribed_ack("not json", "members"),
            Err(NetworkFailure::Malformed(_))
        ));
    }

    #[test]
    fn websocket_url_follows_scheme() {
        assert_eq!(
            remote("http://localhost:3000").websocket_url().unwrap().as_str(),
            "ws://localhost:3000/ws"
        );
        assert_eq!(
            remote("https://sync.example.com/api/").websocket_url().unwrap().as_str(),
            "wss://sync.example.com/api/ws"
        );
    }
}
