use super::channel::RpcChannel;
use super::TransportError;
use futures::StreamExt;
use reqwest_eventsource::{Event, EventSource};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

/// Connects to a tool server over an HTTP event stream. The server
/// announces a message endpoint in its first event; requests are POSTed
/// there and responses arrive back over the stream.
pub struct SseTransport {
    url: String,
    client: reqwest::Client,
    state: AsyncMutex<Option<Arc<RpcChannel>>>,
}

impl SseTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(url, reqwest::Client::new())
    }

    /// Uses an injected HTTP client, letting callers attach middleware such
    /// as request logging or an authorization header.
    pub fn with_client(url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            client,
            state: AsyncMutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn acquire(&self) -> Result<Arc<RpcChannel>, TransportError> {
        let mut state = self.state.lock().await;
        if let Some(channel) = state.as_ref() {
            return Ok(channel.clone());
        }
        let channel = self.open().await?;
        *state = Some(channel.clone());
        Ok(channel)
    }

    pub async fn initialize(&self) -> Result<Arc<RpcChannel>, TransportError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(TransportError::AlreadyInitialized);
        }
        let channel = self.open().await?;
        *state = Some(channel.clone());
        Ok(channel)
    }

    /// Closes the channel; the HTTP client handle held by the channel is
    /// released with it.
    pub async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        if let Some(channel) = state.take() {
            channel.shutdown().await;
        }
        Ok(())
    }

    async fn open(&self) -> Result<Arc<RpcChannel>, TransportError> {
        let request = self.client.get(&self.url);
        let mut source =
            EventSource::new(request).map_err(|err| TransportError::Channel {
                message: err.to_string(),
            })?;

        // The stream is not usable until the server tells us where to POST.
        let endpoint = loop {
            match source.next().await {
                Some(Ok(Event::Open)) => {
                    debug!(url = %self.url, "event stream opened");
                }
                Some(Ok(Event::Message(message))) if message.event == "endpoint" => {
                    break resolve_endpoint(&self.url, message.data.trim())?;
                }
                Some(Ok(Event::Message(message))) => {
                    debug!(event = %message.event, "ignoring event before endpoint announcement");
                }
                Some(Err(err)) => {
                    source.close();
                    return Err(TransportError::Channel {
                        message: err.to_string(),
                    });
                }
                None => return Err(TransportError::MissingEndpoint),
            }
        };
        debug!(endpoint = %endpoint, "event stream announced message endpoint");

        let channel = Arc::new(RpcChannel::over_post(self.client.clone(), endpoint));
        let reader = channel.clone();
        tokio::spawn(async move {
            read_events(reader, source).await;
        });
        Ok(channel)
    }

    #[cfg(test)]
    pub(crate) async fn install_channel(&self, channel: Arc<RpcChannel>) {
        let mut state = self.state.lock().await;
        *state = Some(channel);
    }
}

async fn read_events(channel: Arc<RpcChannel>, mut source: EventSource) {
    while let Some(event) = source.next().await {
        match event {
            Ok(Event::Open) => {}
            Ok(Event::Message(message))
                if message.event == "message" || message.event.is_empty() =>
            {
                match serde_json::from_str::<Value>(&message.data) {
                    Ok(value) => channel.dispatch(value).await,
                    Err(source) => {
                        warn!(%source, "received invalid JSON over event stream");
                    }
                }
            }
            Ok(Event::Message(message)) => {
                debug!(event = %message.event, "unhandled event kind");
            }
            Err(reqwest_eventsource::Error::StreamEnded) => break,
            Err(err) => {
                warn!(%err, "event stream failed");
                source.close();
                break;
            }
        }
    }
    channel.shutdown().await;
}

fn resolve_endpoint(base: &str, data: &str) -> Result<String, TransportError> {
    if data.starts_with("http://") || data.starts_with("https://") {
        return Ok(data.to_string());
    }
    let base = reqwest::Url::parse(base).map_err(|err| TransportError::Channel {
        message: format!("invalid event stream URL '{base}': {err}"),
    })?;
    let joined = base.join(data).map_err(|err| TransportError::Channel {
        message: format!("invalid endpoint announcement '{data}': {err}"),
    })?;
    Ok(joined.to_string())
}
