use std::sync::Arc;

use anketa_api::Notification;
use anyhow::Context;

/// Relays review notifications to an external webhook, best-effort: the
/// review itself is already committed by the time this runs, so delivery
/// failures are logged and dropped rather than surfaced to the reviewer.
#[derive(Clone)]
pub struct Notifier(Arc<Sink>);

enum Sink {
    Disabled,
    Http {
        client: reqwest::Client,
        url: String,
    },
    #[cfg(test)]
    Buffer(std::sync::Mutex<Vec<Notification>>),
}

impl Notifier {
    pub fn disabled() -> Notifier {
        Notifier(Arc::new(Sink::Disabled))
    }

    /// Reads `NOTIFY_URL`; when it is not set notifications are dropped.
    pub fn from_env() -> anyhow::Result<Notifier> {
        match std::env::var("NOTIFY_URL") {
            Err(std::env::VarError::NotPresent) => {
                tracing::warn!("NOTIFY_URL is not set, review notifications will be dropped");
                Ok(Notifier::disabled())
            }
            Err(err) => Err(err).context("retrieving NOTIFY_URL environment variable"),
            Ok(url) => Ok(Notifier(Arc::new(Sink::Http {
                client: reqwest::Client::new(),
                url,
            }))),
        }
    }

    /// Collects sent notifications instead of delivering them.
    #[cfg(test)]
    pub fn buffer() -> Notifier {
        Notifier(Arc::new(Sink::Buffer(std::sync::Mutex::new(Vec::new()))))
    }

    #[cfg(test)]
    pub fn sent(&self) -> Vec<Notification> {
        match &*self.0 {
            Sink::Buffer(buf) => buf.lock().unwrap().clone(),
            _ => Vec::new(),
        }
    }

    pub fn send(&self, n: Notification) {
        match &*self.0 {
            Sink::Disabled => {
                tracing::debug!(to = %n.to, "notifier disabled, dropping notification");
            }
            Sink::Http { client, url } => {
                let json = match serde_json::to_vec(&n) {
                    Ok(json) => json,
                    Err(err) => {
                        tracing::error!(?err, "failed serializing notification to json");
                        return;
                    }
                };
                let req = client
                    .post(url)
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(json);
                tokio::spawn(async move {
                    match req.send().await.and_then(|resp| resp.error_for_status()) {
                        Ok(_) => tracing::debug!(to = %n.to, "notification delivered"),
                        Err(err) => {
                            tracing::error!(?err, to = %n.to, "failed delivering notification")
                        }
                    }
                });
            }
            #[cfg(test)]
            Sink::Buffer(buf) => buf.lock().unwrap().push(n),
        }
    }
}
