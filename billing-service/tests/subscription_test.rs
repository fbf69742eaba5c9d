//! Subscription lifecycle integration tests for billing-service.

mod common;

use billing_service::providers::MockResponse;
use common::TestApp;
use serde_json::json;

#[tokio::test]
async fn create_subscription_copies_membership_terms() {
    let app = TestApp::spawn().await;
    let customer_id = app.customer_with_card().await;
    let type_id = app.monthly_type("19.99", &["premium"]).await;

    let subscription = app.subscribe(&customer_id, &type_id).await;
    assert_eq!(subscription["billing_status"], "active");
    assert_eq!(subscription["amount"], "19.99");
    assert_eq!(subscription["currency"], "USD");
    assert_eq!(subscription["billing_interval"], "monthly");
    assert_eq!(subscription["billing_retry_count"], 0);
    assert_eq!(subscription["max_retry_attempts"], 2);
    assert!(subscription.get("lease_owner").is_none());

    let id = subscription["subscription_id"].as_str().unwrap();
    let fetched = app.get_json(&format!("/subscriptions/{}", id)).await;
    assert_eq!(fetched["subscription_id"], id);

    let listed = app
        .get_json(&format!("/subscriptions?customer_id={}", customer_id))
        .await;
    assert_eq!(listed["items"].as_array().unwrap().len(), 1);

    app.cleanup().await;
}

#[tokio::test]
async fn subscription_rejects_one_time_type() {
    let app = TestApp::spawn().await;
    let customer_id = app.customer_with_card().await;
    let one_time = app
        .post_json(
            "/membership-types",
            json!({
                "name": "Lifetime",
                "price": "99.00",
                "billing_interval": "monthly",
                "is_recurring": false,
            }),
            201,
        )
        .await;

    let response = app
        .post(
            "/subscriptions",
            json!({
                "customer_id": customer_id,
                "membership_type_id": one_time["membership_type_id"],
            }),
        )
        .await;
    assert_eq!(response.status().as_u16(), 400);

    app.cleanup().await;
}

#[tokio::test]
async fn subscription_requires_at_least_one_attempt() {
    let app = TestApp::spawn().await;
    let customer_id = app.customer_with_card().await;
    let type_id = app.monthly_type("19.99", &[]).await;

    let zero = app
        .post(
            "/subscriptions",
            json!({
                "customer_id": customer_id,
                "membership_type_id": type_id,
                "max_retry_attempts": 0,
            }),
        )
        .await;
    assert_eq!(zero.status().as_u16(), 422);

    app.cleanup().await;
}

#[tokio::test]
async fn membership_type_validation() {
    let app = TestApp::spawn().await;

    let negative = app
        .post(
            "/membership-types",
            json!({"name": "Bad", "price": "-5", "billing_interval": "monthly"}),
        )
        .await;
    assert_eq!(negative.status().as_u16(), 422);

    let interval = app
        .post(
            "/membership-types",
            json!({"name": "Bad", "price": "5", "billing_interval": "fortnightly"}),
        )
        .await;
    assert_eq!(interval.status().as_u16(), 400);

    app.cleanup().await;
}

#[tokio::test]
async fn bill_now_advances_period_and_pays_invoice() {
    let app = TestApp::spawn().await;
    let customer_id = app.customer_with_card().await;
    let type_id = app.monthly_type("10.00", &["premium"]).await;
    let subscription = app.subscribe(&customer_id, &type_id).await;
    let id = subscription["subscription_id"].as_str().unwrap();

    let billed = app
        .post_json(&format!("/subscriptions/{}/bill", id), json!({}), 200)
        .await;
    assert_eq!(billed["result"]["status"], "succeeded");
    assert_eq!(billed["run"]["run_type"], "single");
    assert_eq!(billed["run"]["subscriptions_processed"], 1);
    assert_ne!(
        billed["result"]["subscription"]["current_period_end"],
        subscription["current_period_end"]
    );

    let invoices = app
        .get_json(&format!("/subscriptions/{}/invoices", id))
        .await;
    let invoices = invoices.as_array().unwrap();
    assert_eq!(invoices.len(), 1);
    assert_eq!(invoices[0]["status"], "paid");

    let invoice_id = invoices[0]["invoice_id"].as_str().unwrap();
    let detail = app.get_json(&format!("/invoices/{}", invoice_id)).await;
    assert_eq!(detail["payments"][0]["status"], "succeeded");
    assert_eq!(detail["payments"][0]["provider"], "stripe");

    // Paid through next month: nothing to bill
    let again = app
        .post(&format!("/subscriptions/{}/bill", id), json!({}))
        .await;
    assert_eq!(again.status().as_u16(), 409);
    assert_eq!(app.stripe.charge_count(), 1);

    app.cleanup().await;
}

#[tokio::test]
async fn declines_exhaust_retries_then_reactivate() {
    let app = TestApp::spawn().await;
    let customer_id = app.customer_with_card().await;
    let type_id = app.monthly_type("10.00", &["premium"]).await;
    let subscription = app.subscribe(&customer_id, &type_id).await;
    let id = subscription["subscription_id"].as_str().unwrap();
    let bill = format!("/subscriptions/{}/bill", id);

    app.stripe.push(MockResponse::decline("card_declined"));
    let first = app.post_json(&bill, json!({}), 200).await;
    assert_eq!(first["result"]["status"], "failed");
    assert_eq!(first["result"]["subscription"]["billing_status"], "past_due");
    assert_eq!(first["result"]["subscription"]["billing_retry_count"], 1);

    app.stripe.push(MockResponse::decline("card_declined"));
    let second = app.post_json(&bill, json!({}), 200).await;
    assert_eq!(second["result"]["subscription"]["billing_status"], "suspended");
    assert_eq!(second["result"]["subscription"]["billing_retry_count"], 2);

    // Suspended subscriptions are not billable
    assert_eq!(app.post(&bill, json!({})).await.status().as_u16(), 409);

    let reactivated = app
        .post_json(&format!("/subscriptions/{}/reactivate", id), json!({}), 200)
        .await;
    assert_eq!(reactivated["billing_status"], "active");
    assert_eq!(reactivated["billing_retry_count"], 0);

    let recovered = app.post_json(&bill, json!({}), 200).await;
    assert_eq!(recovered["result"]["status"], "succeeded");

    let invoices = app
        .get_json(&format!("/subscriptions/{}/invoices", id))
        .await;
    let invoice_id = invoices[0]["invoice_id"].as_str().unwrap();
    let detail = app.get_json(&format!("/invoices/{}", invoice_id)).await;
    assert_eq!(detail["payments"].as_array().unwrap().len(), 3);
    assert_eq!(detail["status"], "paid");

    app.cleanup().await;
}

#[tokio::test]
async fn cancel_at_period_end_then_immediately() {
    let app = TestApp::spawn().await;
    let customer_id = app.customer_with_card().await;
    let type_id = app.monthly_type("10.00", &[]).await;
    let subscription = app.subscribe(&customer_id, &type_id).await;
    let id = subscription["subscription_id"].as_str().unwrap();
    let cancel = format!("/subscriptions/{}/cancel", id);

    let pending = app.post_json(&cancel, json!({}), 200).await;
    assert_eq!(pending["billing_status"], "active");
    assert_eq!(pending["cancel_at_period_end"], true);

    let cancelled = app
        .post_json(&cancel, json!({"at_period_end": false}), 200)
        .await;
    assert_eq!(cancelled["billing_status"], "cancelled");
    assert!(cancelled["cancelled_utc"].is_string());

    assert_eq!(app.post(&cancel, json!({})).await.status().as_u16(), 409);
    assert_eq!(
        app.post(&format!("/subscriptions/{}/reactivate", id), json!({}))
            .await
            .status()
            .as_u16(),
        409
    );

    app.cleanup().await;
}

#[tokio::test]
async fn subscriptions_are_tenant_scoped() {
    let app = TestApp::spawn().await;
    let customer_id = app.customer_with_card().await;
    let type_id = app.monthly_type("10.00", &[]).await;
    let subscription = app.subscribe(&customer_id, &type_id).await;
    let id = subscription["subscription_id"].as_str().unwrap();

    let other_tenant = app
        .client
        .get(app.url(&format!("/subscriptions/{}", id)))
        .header(common::TENANT_HEADER, uuid::Uuid::new_v4().to_string())
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(other_tenant.status().as_u16(), 404);

    app.cleanup().await;
}
