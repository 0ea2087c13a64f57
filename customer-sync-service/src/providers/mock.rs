use super::{
    BillingProvider, Invoice, InvoiceStatusTransitions, Page, PageParams, PaymentMethod,
    ProductRef, ProviderCustomer, ProviderError, ProviderItemList, ProviderPrice,
    ProviderRecurring, ProviderSubscription, ProviderSubscriptionItem,
};
use crate::models::{Metadata, SubscriptionStatus};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

#[derive(Default)]
struct MockState {
    customers: Vec<ProviderCustomer>,
    subscriptions: HashMap<String, Vec<ProviderSubscription>>,
    invoices: HashMap<String, Vec<Invoice>>,
    payment_methods: HashMap<String, Vec<PaymentMethod>>,
    failing_subscriptions: HashSet<String>,
    pending_failures: Vec<ProviderError>,
    calls: HashMap<&'static str, u64>,
}

/// In-memory billing provider for tests and local runs.
#[derive(Default)]
pub struct MockBillingProvider {
    state: Mutex<MockState>,
}

impl MockBillingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// A minimal, non-delinquent customer.
    pub fn customer(id: &str) -> ProviderCustomer {
        ProviderCustomer {
            id: id.to_string(),
            email: Some(format!("{}@example.com", id)),
            name: Some(format!("Practice {}", id)),
            currency: Some("usd".to_string()),
            created: Some(chrono::Utc::now().timestamp()),
            ..ProviderCustomer::default()
        }
    }

    /// A monthly subscription on a single price.
    pub fn subscription(
        id: &str,
        customer_id: &str,
        price_id: &str,
        unit_amount: i64,
        status: SubscriptionStatus,
    ) -> ProviderSubscription {
        let now = chrono::Utc::now().timestamp();
        ProviderSubscription {
            id: id.to_string(),
            customer: customer_id.to_string(),
            status: status.as_str().to_string(),
            items: ProviderItemList {
                data: vec![ProviderSubscriptionItem {
                    id: Some(format!("si_{}", id)),
                    price: Some(ProviderPrice {
                        id: price_id.to_string(),
                        product: Some(ProductRef::Id(format!("prod_{}", price_id))),
                        unit_amount: Some(unit_amount),
                        currency: Some("usd".to_string()),
                        recurring: Some(ProviderRecurring {
                            interval: "month".to_string(),
                            interval_count: 1,
                        }),
                    }),
                    quantity: Some(1),
                }],
            },
            current_period_start: Some(now),
            current_period_end: Some(now + 30 * 24 * 3600),
            cancel_at_period_end: false,
            canceled_at: None,
            ended_at: None,
            trial_start: None,
            trial_end: None,
            created: Some(now),
            metadata: Metadata::new(),
        }
    }

    /// A paid invoice settled at `paid_at` (unix seconds).
    pub fn paid_invoice(id: &str, amount: i64, paid_at: i64) -> Invoice {
        Invoice {
            id: id.to_string(),
            status: Some("paid".to_string()),
            amount_due: amount,
            amount_paid: amount,
            currency: Some("usd".to_string()),
            created: Some(paid_at),
            status_transitions: InvoiceStatusTransitions {
                paid_at: Some(paid_at),
            },
        }
    }

    /// Add or replace a customer together with its subscriptions.
    pub fn add_customer(&self, customer: ProviderCustomer, subscriptions: Vec<ProviderSubscription>) {
        let mut state = self.lock();
        let id = customer.id.clone();
        match state.customers.iter_mut().find(|c| c.id == id) {
            Some(existing) => *existing = customer,
            None => state.customers.push(customer),
        }
        state.subscriptions.insert(id, subscriptions);
    }

    pub fn add_invoice(&self, customer_id: &str, invoice: Invoice) {
        self.lock()
            .invoices
            .entry(customer_id.to_string())
            .or_default()
            .push(invoice);
    }

    pub fn add_payment_method(&self, customer_id: &str, method: PaymentMethod) {
        self.lock()
            .payment_methods
            .entry(customer_id.to_string())
            .or_default()
            .push(method);
    }

    /// Make every subscription listing for this customer fail.
    pub fn fail_subscriptions_for(&self, customer_id: &str) {
        self.lock()
            .failing_subscriptions
            .insert(customer_id.to_string());
    }

    /// Fail the next `count` calls, of any kind, with `error`.
    pub fn fail_next_calls(&self, count: usize, error: ProviderError) {
        let mut state = self.lock();
        for _ in 0..count {
            state.pending_failures.push(error.clone());
        }
    }

    pub fn call_count(&self, operation: &str) -> u64 {
        self.lock().calls.get(operation).copied().unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        // A panicking test thread must not hide the state from the others.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn begin(&self, operation: &'static str) -> Result<std::sync::MutexGuard<'_, MockState>, ProviderError> {
        let mut state = self.lock();
        *state.calls.entry(operation).or_insert(0) += 1;
        match state.pending_failures.pop() {
            Some(err) => Err(err),
            None => Ok(state),
        }
    }
}

fn paginate<T: Clone>(items: &[T], params: &PageParams, id: impl Fn(&T) -> &str) -> Page<T> {
    let start = match &params.starting_after {
        Some(cursor) => items
            .iter()
            .position(|item| id(item) == cursor)
            .map_or(items.len(), |i| i + 1),
        None => 0,
    };
    let end = (start + params.limit as usize).min(items.len());
    let data = items[start..end].to_vec();
    let next_cursor = if end < items.len() {
        data.last().map(|item| id(item).to_string())
    } else {
        None
    };
    Page { data, next_cursor }
}

#[async_trait]
impl BillingProvider for MockBillingProvider {
    async fn list_customers(
        &self,
        params: &PageParams,
    ) -> Result<Page<ProviderCustomer>, ProviderError> {
        let state = self.begin("list_customers")?;
        Ok(paginate(&state.customers, params, |c| c.id.as_str()))
    }

    async fn get_customer(&self, customer_id: &str) -> Result<ProviderCustomer, ProviderError> {
        let state = self.begin("get_customer")?;
        state
            .customers
            .iter()
            .find(|c| c.id == customer_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("No such customer: {}", customer_id)))
    }

    async fn list_subscriptions(
        &self,
        customer_id: &str,
    ) -> Result<Vec<ProviderSubscription>, ProviderError> {
        let state = self.begin("list_subscriptions")?;
        if state.failing_subscriptions.contains(customer_id) {
            return Err(ProviderError::Api {
                status: 500,
                message: format!("subscription listing failed for {}", customer_id),
            });
        }
        Ok(state
            .subscriptions
            .get(customer_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_payment_methods(
        &self,
        customer_id: &str,
    ) -> Result<Vec<PaymentMethod>, ProviderError> {
        let state = self.begin("list_payment_methods")?;
        Ok(state
            .payment_methods
            .get(customer_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_invoices(
        &self,
        customer_id: &str,
        params: &PageParams,
    ) -> Result<Page<Invoice>, ProviderError> {
        let state = self.begin("list_invoices")?;
        let invoices = state.invoices.get(customer_id).cloned().unwrap_or_default();
        Ok(paginate(&invoices, params, |i| i.id.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_get_all_customers_walks_every_page() {
        let mock = MockBillingProvider::new();
        for i in 0..7 {
            mock.add_customer(MockBillingProvider::customer(&format!("cus_{}", i)), vec![]);
        }

        let all = mock.get_all_customers(3, Duration::ZERO).await.unwrap();

        assert_eq!(all.len(), 7);
        assert_eq!(all[6].id, "cus_6");
        assert_eq!(mock.call_count("list_customers"), 3);
    }

    #[tokio::test]
    async fn test_get_all_customers_propagates_first_error() {
        let mock = MockBillingProvider::new();
        mock.add_customer(MockBillingProvider::customer("cus_1"), vec![]);
        mock.fail_next_calls(1, ProviderError::Network("unreachable".into()));

        let result = mock.get_all_customers(10, Duration::ZERO).await;
        assert!(matches!(result, Err(ProviderError::Network(_))));
    }

    #[tokio::test]
    async fn test_failing_subscriptions() {
        let mock = MockBillingProvider::new();
        mock.add_customer(MockBillingProvider::customer("cus_1"), vec![]);
        mock.fail_subscriptions_for("cus_1");

        assert!(mock.list_subscriptions("cus_1").await.is_err());
        assert!(mock.list_subscriptions("cus_2").await.unwrap().is_empty());
    }
}
