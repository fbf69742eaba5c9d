//! Analytics snapshot integration tests for billing-service.

mod common;

use chrono::{Days, Utc};
use common::TestApp;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::str::FromStr;

fn decimal(value: &Value) -> Decimal {
    Decimal::from_str(value.as_str().unwrap()).unwrap()
}

#[tokio::test]
async fn revenue_and_mrr_follow_renewals() {
    let app = TestApp::spawn().await;
    let type_id = app.monthly_type("10.00", &[]).await;
    for _ in 0..2 {
        let customer_id = app.customer_with_card().await;
        app.subscribe(&customer_id, &type_id).await;
    }
    app.post_json("/billing-runs", json!({}), 200).await;

    let today = Utc::now().date_naive();
    let revenue = app
        .get_json(&format!("/analytics/revenue?date={}&currency=usd", today))
        .await;
    assert_eq!(revenue["metric_type"], "daily_revenue");
    assert_eq!(revenue["currency"], "USD");
    assert_eq!(decimal(&revenue["value"]), Decimal::from(20));
    assert_eq!(revenue["sample_count"], 2);

    let mrr = app.get_json("/analytics/mrr").await;
    assert_eq!(mrr["metric_type"], "mrr");
    assert_eq!(decimal(&mrr["value"]), Decimal::from(20));

    app.cleanup().await;
}

#[tokio::test]
async fn future_revenue_is_rejected() {
    let app = TestApp::spawn().await;
    let tomorrow = Utc::now().date_naive().checked_add_days(Days::new(1)).unwrap();

    let response = app
        .get(&format!("/analytics/revenue?date={}", tomorrow))
        .await;
    assert_eq!(response.status().as_u16(), 400);

    app.cleanup().await;
}
