use anyhow::Context;
use reqwest::Client;
use rust_decimal::{Decimal, RoundingStrategy, prelude::ToPrimitive};
use serde::{Deserialize, Serialize};

use crate::platform::{app_error::AppError, config::PaymentConfig};

pub const PROVIDER: &str = "gateway";

#[derive(Serialize, Debug)]
struct CreateIntentReq<'a> {
    amount: i64,
    currency: &'a str,
    reference: &'a str,
}

#[derive(Deserialize, Debug)]
pub struct PaymentIntent {
    pub id: String,
    pub client_secret: Option<String>,
}

/// Converts a currency amount to minor units (paise, cents), rounding half away from zero.
pub fn to_minor_units(amount: Decimal) -> Option<i64> {
    (amount * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
}

pub async fn create_payment_intent(
    client: &Client,
    config: &PaymentConfig,
    amount: Decimal,
    currency: &str,
    reference: &str,
) -> Result<PaymentIntent, AppError> {
    let url = config
        .gateway_url
        .as_deref()
        .ok_or_else(|| AppError::ServiceUnreachable("PaymentGateway".into()))?;
    let amount = to_minor_units(amount)
        .ok_or_else(|| AppError::BadRequest("Order amount is out of range".into()))?;

    let mut request = client
        .post(format!("{}/payment_intents", url.trim_end_matches('/')))
        .json(&CreateIntentReq {
            amount,
            currency,
            reference,
        });
    if let Some(api_key) = &config.api_key {
        request = request.bearer_auth(api_key);
    }

    let intent: PaymentIntent = request
        .send()
        .await
        .map_err(|_| AppError::ServiceUnreachable("PaymentGateway".into()))?
        .error_for_status()
        .context("Payment gateway rejected the intent")?
        .json()
        .await
        .context("Failed to parse JSON")?;

    Ok(intent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_to_minor_units() {
        assert_eq!(to_minor_units(Decimal::new(24950, 2)), Some(24950));
        assert_eq!(to_minor_units(Decimal::new(1005, 3)), Some(101));
        assert_eq!(to_minor_units(Decimal::ZERO), Some(0));
    }

    #[tokio::test]
    async fn missing_gateway_is_unavailable() {
        let config = PaymentConfig {
            gateway_url: None,
            api_key: None,
            webhook_secret: None,
        };
        let err = create_payment_intent(&Client::new(), &config, Decimal::ONE, "INR", "ORD-1")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ServiceUnreachable(_)));
    }
}
