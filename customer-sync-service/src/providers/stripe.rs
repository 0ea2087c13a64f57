use super::{
    BillingProvider, Invoice, Page, PageParams, PaymentMethod, ProviderCustomer, ProviderError,
    ProviderSubscription,
};
use crate::config::ProviderConfig;
use crate::services::metrics::record_provider_request;
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

/// Stripe list envelope.
#[derive(Debug, Deserialize)]
struct StripeList<T> {
    data: Vec<T>,
    #[serde(default)]
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    error: StripeErrorDetail,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetail {
    #[serde(default)]
    message: Option<String>,
}

trait HasId {
    fn id(&self) -> &str;
}

impl HasId for ProviderCustomer {
    fn id(&self) -> &str {
        &self.id
    }
}

impl HasId for ProviderSubscription {
    fn id(&self) -> &str {
        &self.id
    }
}

impl HasId for Invoice {
    fn id(&self) -> &str {
        &self.id
    }
}

impl HasId for PaymentMethod {
    fn id(&self) -> &str {
        &self.id
    }
}

impl<T: HasId> StripeList<T> {
    fn into_page(self) -> Page<T> {
        let next_cursor = if self.has_more {
            self.data.last().map(|item| item.id().to_string())
        } else {
            None
        };
        Page {
            data: self.data,
            next_cursor,
        }
    }
}

/// Billing provider backed by the Stripe REST API.
pub struct StripeProvider {
    config: ProviderConfig,
    client: Client,
}

impl StripeProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    /// Appends `segments` to the API base, percent-encoding each one so an id
    /// can never add or remove path segments.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ProviderError> {
        let mut url = Url::parse(&self.config.api_base).map_err(|e| {
            ProviderError::Network(format!("Invalid API base {}: {}", self.config.api_base, e))
        })?;
        url.path_segments_mut()
            .map_err(|_| {
                ProviderError::Network(format!(
                    "API base {} cannot take a path",
                    self.config.api_base
                ))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        segments: &[&str],
        query: &[(&str, String)],
    ) -> Result<T, ProviderError> {
        let result = self.send::<T>(segments, query).await;
        record_provider_request(operation, outcome_label(&result));
        result
    }

    async fn send<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        query: &[(&str, String)],
    ) -> Result<T, ProviderError> {
        let path = segments.join("/");
        let url = self.endpoint(segments)?;
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.config.api_key)
            .query(query)
            .send()
            .await
            .map_err(|e| ProviderError::Network(format!("Request to {} failed: {}", path, e)))?;

        let status = response.status();
        if status.is_success() {
            return response.json::<T>().await.map_err(|e| {
                ProviderError::InvalidResponse(format!("Failed to parse {} response: {}", path, e))
            });
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<StripeErrorBody>(&body)
            .ok()
            .and_then(|b| b.error.message)
            .unwrap_or(body);

        Err(classify_status(status, &path, message, retry_after))
    }

    fn page_query(params: &PageParams) -> Vec<(&'static str, String)> {
        let mut query = vec![("limit", params.limit.to_string())];
        if let Some(cursor) = &params.starting_after {
            query.push(("starting_after", cursor.clone()));
        }
        query
    }

    async fn collect_all<T: DeserializeOwned + HasId>(
        &self,
        operation: &str,
        segments: &[&str],
        base_query: Vec<(&'static str, String)>,
    ) -> Result<Vec<T>, ProviderError> {
        let mut items = Vec::new();
        let mut params = PageParams::first(100);

        loop {
            let mut query = base_query.clone();
            query.extend(Self::page_query(&params));
            let page = self
                .get_json::<StripeList<T>>(operation, segments, &query)
                .await?
                .into_page();
            items.extend(page.data);
            match page.next_cursor {
                Some(cursor) => params = params.after(cursor),
                None => return Ok(items),
            }
        }
    }
}

fn classify_status(
    status: StatusCode,
    path: &str,
    message: String,
    retry_after: Option<Duration>,
) -> ProviderError {
    match status {
        StatusCode::NOT_FOUND => ProviderError::NotFound(format!("{}: {}", path, message)),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Authentication(message),
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited {
            message,
            retry_after,
        },
        other => ProviderError::Api {
            status: other.as_u16(),
            message,
        },
    }
}

fn outcome_label<T>(result: &Result<T, ProviderError>) -> &'static str {
    match result {
        Ok(_) => "success",
        Err(ProviderError::Network(_)) => "network_error",
        Err(ProviderError::RateLimited { .. }) => "rate_limited",
        Err(ProviderError::NotFound(_)) => "not_found",
        Err(ProviderError::Authentication(_)) => "auth_error",
        Err(ProviderError::Api { .. }) => "api_error",
        Err(ProviderError::InvalidResponse(_)) => "invalid_response",
    }
}

#[async_trait]
impl BillingProvider for StripeProvider {
    #[tracing::instrument(skip(self), fields(starting_after = ?params.starting_after))]
    async fn list_customers(
        &self,
        params: &PageParams,
    ) -> Result<Page<ProviderCustomer>, ProviderError> {
        let list: StripeList<ProviderCustomer> = self
            .get_json("list_customers", &["customers"], &Self::page_query(params))
            .await?;
        Ok(list.into_page())
    }

    #[tracing::instrument(skip(self))]
    async fn get_customer(&self, customer_id: &str) -> Result<ProviderCustomer, ProviderError> {
        self.get_json("get_customer", &["customers", customer_id], &[])
            .await
    }

    #[tracing::instrument(skip(self))]
    async fn list_subscriptions(
        &self,
        customer_id: &str,
    ) -> Result<Vec<ProviderSubscription>, ProviderError> {
        self.collect_all(
            "list_subscriptions",
            &["subscriptions"],
            vec![
                ("customer", customer_id.to_string()),
                ("status", "all".to_string()),
            ],
        )
        .await
    }

    #[tracing::instrument(skip(self))]
    async fn list_payment_methods(
        &self,
        customer_id: &str,
    ) -> Result<Vec<PaymentMethod>, ProviderError> {
        self.collect_all(
            "list_payment_methods",
            &["customers", customer_id, "payment_methods"],
            Vec::new(),
        )
        .await
    }

    #[tracing::instrument(skip(self), fields(starting_after = ?params.starting_after))]
    async fn list_invoices(
        &self,
        customer_id: &str,
        params: &PageParams,
    ) -> Result<Page<Invoice>, ProviderError> {
        let mut query = vec![("customer", customer_id.to_string())];
        query.extend(Self::page_query(params));
        let list: StripeList<Invoice> = self.get_json("list_invoices", &["invoices"], &query).await?;
        Ok(list.into_page())
    }
}
