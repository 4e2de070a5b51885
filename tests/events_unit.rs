use chrono::{TimeZone, Utc};
use serde_json::json;

use companion_backend::billing::events::{
    parse_checkout_session, parse_subscription_object, StripeEvent,
};

#[test]
fn parse_payment_mode_checkout_session() {
    let raw = json!({
        "id": "evt_1QxYz",
        "type": "checkout.session.completed",
        "data": {
            "object": {
                "id": "cs_test_a1b2c3",
                "object": "checkout.session",
                "mode": "payment",
                "customer": "cus_R4nd0m",
                "customer_email": "buyer@example.com",
                "payment_intent": "pi_3QxYz",
                "payment_status": "paid",
                "subscription": null,
                "amount_total": 999,
                "currency": "usd"
            }
        }
    });

    let event: StripeEvent = serde_json::from_value(raw).expect("event envelope");
    assert_eq!(event.id, "evt_1QxYz");
    assert_eq!(event.event_type, "checkout.session.completed");

    let session = parse_checkout_session(&event.data.object).expect("session");
    assert_eq!(session.session_id, "cs_test_a1b2c3");
    assert_eq!(session.mode, "payment");
    assert_eq!(session.customer.as_deref(), Some("cus_R4nd0m"));
    assert_eq!(session.email.as_deref(), Some("buyer@example.com"));
    assert_eq!(session.payment_intent.as_deref(), Some("pi_3QxYz"));
    assert_eq!(session.subscription, None);
}

#[test]
fn checkout_session_mode_defaults_to_subscription() {
    let object = json!({
        "id": "cs_test_nomode",
        "customer": "cus_1",
        "email": "fallback@example.com",
        "subscription": "sub_1"
    });

    let session = parse_checkout_session(&object).expect("session");
    assert_eq!(session.mode, "subscription");
    // customer_email отсутствует — берётся запасное поле email.
    assert_eq!(session.email.as_deref(), Some("fallback@example.com"));
    assert_eq!(session.subscription.as_deref(), Some("sub_1"));
}

#[test]
fn checkout_session_without_id_is_rejected() {
    assert!(parse_checkout_session(&json!({ "mode": "payment" })).is_none());
}

#[test]
fn parse_full_subscription_object() {
    let object = json!({
        "id": "sub_1QxYz",
        "object": "subscription",
        "customer": "cus_R4nd0m",
        "status": "active",
        "current_period_start": 1750000000,
        "current_period_end": 1752592000,
        "latest_invoice": "in_1QxYz",
        "items": {
            "object": "list",
            "data": [
                {
                    "id": "si_1",
                    "price": {
                        "id": "price_monthly_basic",
                        "nickname": "Basic Monthly",
                        "unit_amount": 999
                    }
                }
            ]
        }
    });

    let sub = parse_subscription_object(&object).expect("subscription");
    assert_eq!(sub.id, "sub_1QxYz");
    assert_eq!(sub.customer.as_deref(), Some("cus_R4nd0m"));
    assert_eq!(sub.status.as_deref(), Some("active"));
    assert_eq!(sub.price_id.as_deref(), Some("price_monthly_basic"));
    assert_eq!(sub.price_nickname.as_deref(), Some("Basic Monthly"));
    assert_eq!(sub.latest_invoice.as_deref(), Some("in_1QxYz"));
    assert_eq!(
        sub.current_period_start,
        Utc.timestamp_opt(1750000000, 0).single()
    );
    assert_eq!(
        sub.current_period_end,
        Utc.timestamp_opt(1752592000, 0).single()
    );
}

#[test]
fn subscription_object_tolerates_missing_fields() {
    // Stripe не гарантирует состав payload'а — всё опциональное уходит в None.
    let sub = parse_subscription_object(&json!({ "id": "sub_min" })).expect("subscription");
    assert_eq!(sub.id, "sub_min");
    assert_eq!(sub.customer, None);
    assert_eq!(sub.status, None);
    assert_eq!(sub.current_period_start, None);
    assert_eq!(sub.current_period_end, None);
    assert_eq!(sub.price_id, None);
    assert_eq!(sub.latest_invoice, None);

    assert!(parse_subscription_object(&json!({ "customer": "cus_1" })).is_none());
}

#[test]
fn subscription_object_ignores_garbage_timestamps() {
    let sub = parse_subscription_object(&json!({
        "id": "sub_bad_ts",
        "current_period_start": "not-a-number",
        "current_period_end": 1e40
    }))
    .expect("subscription");

    assert_eq!(sub.current_period_start, None);
    assert_eq!(sub.current_period_end, None);
}
