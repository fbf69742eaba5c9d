//! One-time order integration tests for billing-service.

mod common;

use billing_service::providers::mock::{MOCK_SIGNATURE_HEADER, MOCK_WEBHOOK_SECRET};
use billing_service::providers::MockResponse;
use common::TestApp;
use serde_json::{json, Value};
use service_core::utils::signature::hmac_sha256_hex;
use uuid::Uuid;

async fn one_time_type(app: &TestApp) -> String {
    let membership_type = app
        .post_json(
            "/membership-types",
            json!({
                "name": "Season pass",
                "features": ["downloads"],
                "price": "49.00",
                "billing_interval": "monthly",
                "is_recurring": false,
                "duration_days": 30,
            }),
            201,
        )
        .await;
    membership_type["membership_type_id"]
        .as_str()
        .unwrap()
        .to_string()
}

async fn verify(app: &TestApp, customer_id: &str, feature: &str) -> Value {
    app.post_json(
        "/access/verify",
        json!({"customer_id": customer_id, "feature": feature}),
        200,
    )
    .await
}

#[tokio::test]
async fn paid_order_grants_membership() {
    let app = TestApp::spawn().await;
    let customer_id = app.customer_with_card().await;
    let type_id = one_time_type(&app).await;

    let order = app
        .post_json(
            "/orders",
            json!({"customer_id": customer_id, "membership_type_id": type_id}),
            201,
        )
        .await;
    assert_eq!(order["status"], "paid");
    assert_eq!(order["amount"], "49.00");

    let order_id = order["order_id"].as_str().unwrap();
    let fetched = app.get_json(&format!("/orders/{}", order_id)).await;
    assert_eq!(fetched["status"], "paid");

    let memberships = app
        .get_json(&format!("/memberships?customer_id={}", customer_id))
        .await;
    let memberships = memberships.as_array().unwrap();
    assert_eq!(memberships.len(), 1);
    assert_eq!(memberships[0]["order_id"], order_id);
    assert_eq!(memberships[0]["status"], "active");
    assert!(memberships[0]["expires_utc"].is_string());

    let decision = verify(&app, &customer_id, "downloads").await;
    assert_eq!(decision["allowed"], true);
    assert_eq!(decision["reason"], "active");

    app.cleanup().await;
}

#[tokio::test]
async fn declined_order_is_payment_required() {
    let app = TestApp::spawn().await;
    let customer_id = app.customer_with_card().await;
    let type_id = one_time_type(&app).await;
    app.stripe.push(MockResponse::hard_decline("insufficient_funds"));

    let response = app
        .post(
            "/orders",
            json!({"customer_id": customer_id, "membership_type_id": type_id}),
        )
        .await;
    assert_eq!(response.status().as_u16(), 402);

    let decision = verify(&app, &customer_id, "downloads").await;
    assert_eq!(decision["allowed"], false);

    app.cleanup().await;
}

#[tokio::test]
async fn order_without_payment_method_is_payment_required() {
    let app = TestApp::spawn().await;
    let type_id = one_time_type(&app).await;
    let customer = app
        .post_json(
            "/customers",
            json!({
                "guest_email": "Guest@Example.com",
                "provider": "stripe",
                "provider_customer_ref": "cus_guest",
            }),
            201,
        )
        .await;
    assert_eq!(customer["guest_email"], "guest@example.com");

    let response = app
        .post(
            "/orders",
            json!({"customer_id": customer["customer_id"], "membership_type_id": type_id}),
        )
        .await;
    assert_eq!(response.status().as_u16(), 402);
    assert_eq!(app.stripe.call_count(), 0);

    app.cleanup().await;
}

#[tokio::test]
async fn order_for_unknown_customer_is_not_found() {
    let app = TestApp::spawn().await;
    let type_id = one_time_type(&app).await;

    let response = app
        .post(
            "/orders",
            json!({"customer_id": Uuid::new_v4(), "membership_type_id": type_id}),
        )
        .await;
    assert_eq!(response.status().as_u16(), 404);

    app.cleanup().await;
}

#[tokio::test]
async fn refunded_order_revokes_membership() {
    let app = TestApp::spawn().await;
    let customer_id = app.customer_with_card().await;
    let type_id = one_time_type(&app).await;
    let order = app
        .post_json(
            "/orders",
            json!({"customer_id": customer_id, "membership_type_id": type_id}),
            201,
        )
        .await;

    let invoice_id = order["invoice_id"].as_str().unwrap();
    let detail = app.get_json(&format!("/invoices/{}", invoice_id)).await;
    let reference = detail["payments"][0]["provider_payment_ref"].clone();

    let raw = json!({"id": "evt_order_refund", "type": "payment.refunded", "payment_ref": reference})
        .to_string();
    let signature = hmac_sha256_hex(MOCK_WEBHOOK_SECRET.as_bytes(), raw.as_bytes()).unwrap();
    let response = app
        .client
        .post(format!("{}/api/payment/webhooks/stripe", app.address))
        .header(MOCK_SIGNATURE_HEADER, signature)
        .body(raw)
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(response.status().as_u16(), 200);

    let order_id = order["order_id"].as_str().unwrap();
    let refunded = app.get_json(&format!("/orders/{}", order_id)).await;
    assert_eq!(refunded["status"], "refunded");

    let decision = verify(&app, &customer_id, "downloads").await;
    assert_eq!(decision["allowed"], false);
    assert_eq!(decision["reason"], "no_active_membership");

    app.cleanup().await;
}
