use std::{fmt, str::FromStr};

use anyhow::Context;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::platform::{app_error::AppError, config::NotificationConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Sms,
    Whatsapp,
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sms" => Ok(Channel::Sms),
            "whatsapp" => Ok(Channel::Whatsapp),
            other => Err(format!("{other} is not a notification channel")),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Sms => f.write_str("sms"),
            Channel::Whatsapp => f.write_str("whatsapp"),
        }
    }
}

#[derive(Serialize, Debug)]
struct OutboundMessage<'a> {
    channel: Channel,
    from: &'a str,
    to: &'a str,
    body: &'a str,
}

/// Sends a text message through the SMS/WhatsApp gateway.
///
/// Without a configured gateway the message is only logged, which keeps
/// local development free of third-party accounts.
pub async fn send_message(
    client: &Client,
    config: &NotificationConfig,
    channel: Channel,
    to: &str,
    body: &str,
) -> Result<(), AppError> {
    let Some(url) = config.gateway_url.as_deref() else {
        tracing::info!(%channel, to, body, "Messaging gateway not configured; message skipped");
        return Ok(());
    };

    let mut request = client.post(format!("{}/messages", url.trim_end_matches('/'))).json(
        &OutboundMessage {
            channel,
            from: &config.sender_id,
            to,
            body,
        },
    );
    if let Some(api_key) = &config.api_key {
        request = request.bearer_auth(api_key);
    }

    let response = request
        .send()
        .await
        .map_err(|_| AppError::ServiceUnreachable("MessagingGateway".into()))?;

    response
        .error_for_status()
        .context("Messaging gateway rejected the message")?;

    tracing::info!(%channel, to, "Message sent");
    Ok(())
}
