//! Outbound delivery of sign-in emails.
//!
//! The portal never talks SMTP. It hands `{ to, subject, html }` to a relay
//! endpoint authenticated with a shared bearer secret, or, with no relay
//! configured, surfaces the message on the console so a developer can follow
//! the link by hand.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::utils::mask_email;

/// HTTP request timeout for the relay, in seconds.
const RELAY_TIMEOUT_SECS: u64 = 15;

/// A composed sign-in email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MagicLinkEmail {
    pub to: String,
    pub subject: String,
    pub text: String,
    pub html: String,
    /// The redemption URL embedded in both bodies.
    #[serde(skip)]
    pub link: String,
}

/// What happened to a composed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Accepted by the relay.
    Sent,
    /// Not emailed; the payload is handed back for manual delivery.
    Surfaced(MagicLinkEmail),
}

pub trait MailDelivery: Send + Sync {
    fn deliver(&self, message: &MagicLinkEmail) -> impl Future<Output = Result<Delivery>> + Send;
}

#[derive(Debug, Serialize)]
struct RelayPayload<'a> {
    to: &'a str,
    subject: &'a str,
    html: &'a str,
}

/// Client for the outbound email relay.
#[derive(Clone)]
pub struct RelayMailer {
    client: Client,
    endpoint: String,
    secret: String,
}

impl RelayMailer {
    pub fn new(endpoint: impl Into<String>, secret: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(RELAY_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            secret: secret.into(),
        })
    }
}

impl MailDelivery for RelayMailer {
    fn deliver(&self, message: &MagicLinkEmail) -> impl Future<Output = Result<Delivery>> + Send {
        let payload = RelayPayload {
            to: &message.to,
            subject: &message.subject,
            html: &message.html,
        };
        let request = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.secret)
            .json(&payload);
        let to = mask_email(&message.to);

        async move {
            let response = request
                .send()
                .await
                .context("Failed to send mail relay request")?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                warn!(to = %to, status = %status, "Mail relay rejected message");
                anyhow::bail!("Mail relay returned {}: {}", status, body);
            }

            debug!(to = %to, "Sign-in email handed to relay");
            Ok(Delivery::Sent)
        }
    }
}

/// Fallback when no relay is configured: log the message and hand it back.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleMailer;

impl MailDelivery for ConsoleMailer {
    fn deliver(&self, message: &MagicLinkEmail) -> impl Future<Output = Result<Delivery>> + Send {
        info!(to = %mask_email(&message.to), link = %message.link, "No mail relay configured, surfacing sign-in link");
        let delivery = Delivery::Surfaced(message.clone());
        async move { Ok(delivery) }
    }
}

/// Relay when configured, console otherwise.
#[derive(Clone)]
pub enum Mailer {
    Relay(RelayMailer),
    Console(ConsoleMailer),
}

impl MailDelivery for Mailer {
    fn deliver(&self, message: &MagicLinkEmail) -> impl Future<Output = Result<Delivery>> + Send {
        let relay = match self {
            Mailer::Relay(relay) => Some(relay.clone()),
            Mailer::Console(_) => None,
        };
        let message = message.clone();

        async move {
            match relay {
                Some(relay) => relay.deliver(&message).await,
                None => ConsoleMailer.deliver(&message).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    use super::*;

    /// A request as the relay received it.
    struct Received {
        request_line: String,
        headers: Vec<(String, String)>,
        body: String,
    }

    impl Received {
        fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value.as_str())
        }
    }

    /// Accept one HTTP request on a local port and answer with `status`.
    async fn relay_once(status: &'static str) -> (String, JoinHandle<Received>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/send", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut chunk = [0u8; 4096];

            let header_end = loop {
                let n = socket.read(&mut chunk).await.unwrap();
                assert!(n > 0, "connection closed before headers");
                raw.extend_from_slice(&chunk[..n]);
                if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
            };

            let head = String::from_utf8(raw[..header_end].to_vec()).unwrap();
            let mut lines = head.split("\r\n").filter(|l| !l.is_empty());
            let request_line = lines.next().unwrap().to_string();
            let headers: Vec<(String, String)> = lines
                .filter_map(|l| l.split_once(':'))
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .collect();

            let length: usize = headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                .map(|(_, v)| v.parse().unwrap())
                .unwrap_or(0);
            while raw.len() < header_end + length {
                let n = socket.read(&mut chunk).await.unwrap();
                assert!(n > 0, "connection closed before body");
                raw.extend_from_slice(&chunk[..n]);
            }
            let body = String::from_utf8(raw[header_end..header_end + length].to_vec()).unwrap();

            let response = format!(
                "HTTP/1.1 {}\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok",
                status
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();

            Received {
                request_line,
                headers,
                body,
            }
        });

        (url, handle)
    }

    fn message() -> MagicLinkEmail {
        MagicLinkEmail {
            to: "client@example.com".to_string(),
            subject: "Your sign-in link".to_string(),
            text: "Open https://portal.example.com/?token=abc".to_string(),
            html: "<a href=\"https://portal.example.com/?token=abc\">Sign in</a>".to_string(),
            link: "https://portal.example.com/?token=abc".to_string(),
        }
    }

    #[tokio::test]
    async fn test_console_mailer_surfaces_payload() {
        let delivery = ConsoleMailer.deliver(&message()).await.unwrap();
        assert_eq!(delivery, Delivery::Surfaced(message()));
    }

    #[tokio::test]
    async fn test_mailer_console_variant() {
        let delivery = Mailer::Console(ConsoleMailer).deliver(&message()).await.unwrap();
        assert!(matches!(delivery, Delivery::Surfaced(_)));
    }

    #[test]
    fn test_relay_payload_shape() {
        let msg = message();
        let payload = RelayPayload {
            to: &msg.to,
            subject: &msg.subject,
            html: &msg.html,
        };
        let value = serde_json::to_value(&payload).unwrap();
        let keys: Vec<&str> = value.as_object().unwrap().keys().map(String::as_str).collect();
        assert_eq!(keys.len(), 3);
        assert_eq!(value["to"], "client@example.com");
        assert_eq!(value["subject"], "Your sign-in link");
        assert!(value["html"].as_str().unwrap().contains("token=abc"));
    }

    #[tokio::test]
    async fn test_relay_posts_json_with_bearer() {
        let (url, relay) = relay_once("200 OK").await;
        let mailer = RelayMailer::new(url, "relay-secret").unwrap();

        let delivery = mailer.deliver(&message()).await.unwrap();
        assert_eq!(delivery, Delivery::Sent);

        let received = relay.await.unwrap();
        assert!(received.request_line.starts_with("POST /send "));
        assert_eq!(received.header("authorization"), Some("Bearer relay-secret"));
        assert!(received
            .header("content-type")
            .unwrap()
            .starts_with("application/json"));

        let body: serde_json::Value = serde_json::from_str(&received.body).unwrap();
        assert_eq!(body["to"], "client@example.com");
        assert_eq!(body["subject"], "Your sign-in link");
        assert_eq!(body["html"], message().html);
        assert_eq!(body.as_object().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_relay_error_status_is_err() {
        let (url, relay) = relay_once("500 Internal Server Error").await;
        let mailer = Mailer::Relay(RelayMailer::new(url, "relay-secret").unwrap());

        let result = mailer.deliver(&message()).await;
        let err = result.unwrap_err().to_string();
        assert!(err.contains("500"), "unexpected error: {}", err);
        relay.await.unwrap();
    }

    #[tokio::test]
    async fn test_relay_unreachable_is_err() {
        // Bind then drop so the port is closed
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/send", listener.local_addr().unwrap());
        drop(listener);

        let mailer = RelayMailer::new(url, "relay-secret").unwrap();
        assert!(mailer.deliver(&message()).await.is_err());
    }
}
