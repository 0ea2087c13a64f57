//! HTTP handlers for customer-sync-service.

pub mod analytics;
pub mod customers;
pub mod health;
pub mod sync;

pub use analytics::{list_daily_analytics, recompute_daily_analytics};
pub use customers::{get_customer, get_customer_billing, get_customer_metrics};
pub use health::{health_check, metrics_endpoint, readiness_check};
pub use sync::{sync_status, trigger_sync};

use crate::providers::is_valid_object_id;
use axum::body::Bytes;
use serde::de::DeserializeOwned;
use service_core::error::AppError;

/// Reject anything that is not a plain provider customer id.
pub(crate) fn validate_customer_id(customer_id: &str) -> Result<(), AppError> {
    if !is_valid_object_id(customer_id) {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Invalid customer id: {}",
            customer_id
        )));
    }
    Ok(())
}

/// Parse an optional JSON body; an empty body yields `T::default()`.
pub(crate) fn parse_optional_json<T: DeserializeOwned + Default>(
    body: &Bytes,
) -> Result<T, AppError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| AppError::BadRequest(anyhow::anyhow!("Json parse error: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, Deserialize, PartialEq)]
    struct Body {
        value: Option<u32>,
    }

    #[test]
    fn test_customer_id_validation() {
        assert!(validate_customer_id("cus_123").is_ok());
        assert!(matches!(
            validate_customer_id("../charges/ch_1"),
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn test_empty_body_is_default() {
        let parsed: Body = parse_optional_json(&Bytes::from_static(b"  \n")).unwrap();
        assert_eq!(parsed, Body::default());
    }

    #[test]
    fn test_malformed_body_is_bad_request() {
        let result: Result<Body, _> = parse_optional_json(&Bytes::from_static(b"{not json"));
        assert!(matches!(result, Err(AppError::BadRequest(_))));
    }
}
