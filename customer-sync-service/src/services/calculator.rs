//! Customer health, churn-risk and revenue heuristics.
//!
//! Pure functions of a customer's current subscription state.

use crate::models::{CustomerMetrics, SubscriptionData};
use chrono::NaiveDate;

/// Months of current revenue used as the lifetime value estimate.
pub const LIFETIME_MONTHS: i64 = 24;

const HEALTH_BASE: i32 = 50;
const HEALTH_ACTIVE_BONUS: i32 = 30;
const HEALTH_PER_ACTIVE: i32 = 5;
const HEALTH_PER_ACTIVE_CAP: i32 = 20;
const HEALTH_HAS_SUBSCRIPTION_BONUS: i32 = 10;
const HEALTH_DELINQUENT_PENALTY: i32 = 40;

/// Inputs to the calculation beyond the subscription list.
#[derive(Debug, Clone, Copy)]
pub struct MetricsContext {
    pub delinquent: bool,
    pub last_payment_date: Option<NaiveDate>,
    pub metric_date: NaiveDate,
}

/// Health score in [0, 100].
///
/// Active subscriptions earn the active bonus plus 5 per subscription (at most
/// 20). A customer whose subscriptions are all inactive still earns the smaller
/// "has subscribed" bonus. Delinquency costs 40.
pub fn health_score(active_count: usize, subscription_count: usize, delinquent: bool) -> i32 {
    let mut score = HEALTH_BASE;

    if active_count > 0 {
        let per_active = (active_count.min(i32::MAX as usize) as i32)
            .saturating_mul(HEALTH_PER_ACTIVE)
            .min(HEALTH_PER_ACTIVE_CAP);
        score += HEALTH_ACTIVE_BONUS + per_active;
    } else if subscription_count > 0 {
        score += HEALTH_HAS_SUBSCRIPTION_BONUS;
    }

    if delinquent {
        score -= HEALTH_DELINQUENT_PENALTY;
    }

    score.clamp(0, 100)
}

/// Churn risk in [0, 1], derived from the health score and raised for
/// delinquent customers and customers without an active subscription.
pub fn churn_risk_score(health_score: i32, active_count: usize, delinquent: bool) -> f64 {
    let mut risk: f64 = if health_score >= 80 {
        0.1
    } else if health_score >= 60 {
        0.3
    } else if health_score <= 30 {
        0.9
    } else {
        0.5
    };

    if delinquent {
        risk = risk.max(0.8);
    }
    if active_count == 0 {
        risk = risk.max(0.7);
    }

    risk.clamp(0.0, 1.0)
}

pub fn calculate(
    stripe_customer_id: &str,
    subscriptions: &[SubscriptionData],
    ctx: MetricsContext,
) -> CustomerMetrics {
    let active: Vec<&SubscriptionData> = subscriptions
        .iter()
        .filter(|s| s.status.is_active())
        .collect();
    let active_count = active.len();

    // Price amounts as listed, whatever the billing interval.
    let monthly_revenue: i64 = active
        .iter()
        .map(|s| s.unit_amount)
        .fold(0i64, i64::saturating_add);
    let average_order_value = if active_count > 0 {
        monthly_revenue / active_count as i64
    } else {
        0
    };

    let health = health_score(active_count, subscriptions.len(), ctx.delinquent);
    let churn = churn_risk_score(health, active_count, ctx.delinquent);

    CustomerMetrics {
        stripe_customer_id: stripe_customer_id.to_string(),
        metric_date: ctx.metric_date,
        total_revenue: monthly_revenue,
        subscription_count: subscriptions.len() as i32,
        active_subscription_count: active_count as i32,
        lifetime_value: monthly_revenue.saturating_mul(LIFETIME_MONTHS),
        average_order_value,
        last_payment_date: ctx.last_payment_date,
        churn_risk_score: churn,
        health_score: health,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BillingInterval, Metadata, SubscriptionStatus};

    fn sub(id: &str, amount: i64, status: SubscriptionStatus) -> SubscriptionData {
        SubscriptionData {
            stripe_subscription_id: id.to_string(),
            stripe_customer_id: "cus_123".to_string(),
            stripe_price_id: "price_456".to_string(),
            stripe_product_id: "prod_1".to_string(),
            status,
            unit_amount: amount,
            quantity: 1,
            currency: Some("usd".to_string()),
            interval: Some(BillingInterval::Month),
            interval_count: 1,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            canceled_at: None,
            ended_at: None,
            trial_start: None,
            trial_end: None,
            provider_created_at: None,
            metadata: Metadata::new(),
        }
    }

    fn ctx(delinquent: bool) -> MetricsContext {
        MetricsContext {
            delinquent,
            last_payment_date: None,
            metric_date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
        }
    }

    #[test]
    fn test_single_active_subscription() {
        let metrics = calculate(
            "cus_123",
            &[sub("sub_1", 10_000, SubscriptionStatus::Active)],
            ctx(false),
        );

        assert_eq!(metrics.active_subscription_count, 1);
        assert_eq!(metrics.subscription_count, 1);
        assert_eq!(metrics.total_revenue, 10_000);
        assert_eq!(metrics.lifetime_value, 240_000);
        assert_eq!(metrics.average_order_value, 10_000);
        assert_eq!(metrics.health_score, 85);
        assert_eq!(metrics.churn_risk_score, 0.1);
    }

    #[test]
    fn test_revenue_is_plain_sum_of_active_price_amounts() {
        let mut yearly = sub("sub_1", 120_000, SubscriptionStatus::Active);
        yearly.interval = Some(BillingInterval::Year);
        let mut seats = sub("sub_2", 2_500, SubscriptionStatus::Active);
        seats.quantity = 4;
        let canceled = sub("sub_3", 9_999, SubscriptionStatus::Canceled);

        let metrics = calculate("cus_1", &[yearly, seats, canceled], ctx(false));

        assert_eq!(metrics.total_revenue, 122_500);
        assert_eq!(metrics.lifetime_value, 122_500 * 24);
        assert_eq!(metrics.average_order_value, 61_250);
    }

    #[test]
    fn test_inactive_subscriptions_do_not_count_revenue() {
        let metrics = calculate(
            "cus_123",
            &[
                sub("sub_1", 10_000, SubscriptionStatus::Canceled),
                sub("sub_2", 5_000, SubscriptionStatus::PastDue),
            ],
            ctx(false),
        );

        assert_eq!(metrics.active_subscription_count, 0);
        assert_eq!(metrics.total_revenue, 0);
        assert_eq!(metrics.health_score, 60);
        // Health 60 maps to 0.3, raised to 0.7 for having nothing active.
        assert_eq!(metrics.churn_risk_score, 0.7);
    }

    #[test]
    fn test_per_subscription_bonus_is_capped() {
        assert_eq!(health_score(4, 4, false), 100);
        assert_eq!(health_score(10, 10, false), 100);
        assert_eq!(health_score(2, 2, false), 90);
    }

    #[test]
    fn test_delinquent_customer() {
        let metrics = calculate(
            "cus_123",
            &[sub("sub_1", 10_000, SubscriptionStatus::Active)],
            ctx(true),
        );
        assert_eq!(metrics.health_score, 45);
        assert_eq!(metrics.churn_risk_score, 0.8);
    }

    #[test]
    fn test_no_subscriptions_at_all() {
        let metrics = calculate("cus_123", &[], ctx(false));
        assert_eq!(metrics.health_score, 50);
        assert_eq!(metrics.churn_risk_score, 0.7);
        assert_eq!(metrics.lifetime_value, 0);

        let delinquent = calculate("cus_123", &[], ctx(true));
        assert_eq!(delinquent.health_score, 10);
        assert_eq!(delinquent.churn_risk_score, 0.9);
    }

    #[test]
    fn test_scores_stay_in_range_for_all_states() {
        let statuses = [
            SubscriptionStatus::Active,
            SubscriptionStatus::Trialing,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Canceled,
            SubscriptionStatus::Unpaid,
        ];

        for delinquent in [false, true] {
            for count in 0..8usize {
                for (offset, _) in statuses.iter().enumerate() {
                    let subs: Vec<SubscriptionData> = (0..count)
                        .map(|i| {
                            sub(
                                &format!("sub_{}", i),
                                1_000 * i as i64,
                                statuses[(i + offset) % statuses.len()],
                            )
                        })
                        .collect();
                    let m = calculate("cus_x", &subs, ctx(delinquent));

                    assert!((0..=100).contains(&m.health_score), "health {}", m.health_score);
                    assert!((0.0..=1.0).contains(&m.churn_risk_score));
                    if delinquent {
                        assert!(m.churn_risk_score >= 0.8);
                    }
                    if m.active_subscription_count == 0 {
                        assert!(m.churn_risk_score >= 0.7);
                    }
                }
            }
        }
    }

    #[test]
    fn test_last_payment_date_is_carried() {
        let mut context = ctx(false);
        context.last_payment_date = NaiveDate::from_ymd_opt(2024, 5, 15);
        let metrics = calculate("cus_123", &[], context);
        assert_eq!(metrics.last_payment_date, NaiveDate::from_ymd_opt(2024, 5, 15));
    }
}
