//! Default [`DataLoader`] backed by reqwest with streaming bodies.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use reqwest::Client;
use tracing::debug;

use crate::error::LoadError;
use crate::loader::{Cancellable, DataLoader, DataSink, UrlRequest, UrlResponse};

pub struct HttpDataLoaderBuilder {
    client: Option<Client>,
    user_agent: String,
}

impl HttpDataLoaderBuilder {
    pub fn new() -> Self {
        Self {
            client: None,
            user_agent: concat!("image-pipeline/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn build(self) -> HttpDataLoader {
        let client = self.client.unwrap_or_else(|| {
            Client::builder()
                .user_agent(self.user_agent.clone())
                .build()
                .unwrap_or_default()
        });
        HttpDataLoader { client }
    }
}

impl Default for HttpDataLoaderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Streams response bodies chunk by chunk into the sink. Construct inside a
/// tokio runtime.
pub struct HttpDataLoader {
    client: Client,
}

impl HttpDataLoader {
    pub fn new() -> Self {
        HttpDataLoaderBuilder::new().build()
    }

    pub fn builder() -> HttpDataLoaderBuilder {
        HttpDataLoaderBuilder::new()
    }
}

impl Default for HttpDataLoader {
    fn default() -> Self {
        Self::new()
    }
}

struct AbortHandle {
    cancelled: Arc<AtomicBool>,
    task: tokio::task::AbortHandle,
}

impl Cancellable for AbortHandle {
    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.task.abort();
        }
    }
}

impl DataLoader for HttpDataLoader {
    fn load_data(&self, request: &UrlRequest, sink: DataSink) -> Box<dyn Cancellable> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let client = self.client.clone();
        let request = request.clone();
        let flag = Arc::clone(&cancelled);

        let task = tokio::spawn(async move {
            let DataSink {
                mut on_data,
                on_finish,
            } = sink;

            let mut builder = client.get(request.url.clone());
            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }
            if let Some(timeout) = request.timeout {
                builder = builder.timeout(timeout);
            }

            let response = match builder.send().await {
                Ok(response) => response,
                Err(err) => {
                    on_finish(Some(LoadError::from(err)));
                    return;
                }
            };

            let status = response.status();
            if !status.is_success() {
                on_finish(Some(LoadError::Status(status.as_u16())));
                return;
            }

            let mut url_response = UrlResponse::new(response.url().to_string(), status.as_u16());
            for (name, value) in response.headers() {
                if let Ok(value) = value.to_str() {
                    url_response
                        .headers
                        .push((name.as_str().to_string(), value.to_string()));
                }
            }
            debug!(url = %url_response.url, status = status.as_u16(), "response headers received");

            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                if flag.load(Ordering::SeqCst) {
                    on_finish(Some(LoadError::Cancelled));
                    return;
                }
                match chunk {
                    Ok(chunk) => on_data(chunk, &url_response),
                    Err(err) => {
                        on_finish(Some(LoadError::from(err)));
                        return;
                    }
                }
            }
            on_finish(None);
        });

        Box::new(AbortHandle {
            cancelled,
            task: task.abort_handle(),
        })
    }
}
