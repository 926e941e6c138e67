//! Typed view of the gateway events the billing core reacts to.
//!
//! Only the fields the handlers read are deserialized; the full payload is
//! kept alongside for the webhook event log.

use serde::Deserialize;
use std::collections::HashMap;

pub const CHECKOUT_SESSION_COMPLETED: &str = "checkout.session.completed";
pub const PAYMENT_INTENT_SUCCEEDED: &str = "payment_intent.succeeded";
pub const PAYMENT_INTENT_FAILED: &str = "payment_intent.payment_failed";
pub const CHARGE_REFUNDED: &str = "charge.refunded";

/// A parsed webhook delivery
#[derive(Debug, Clone)]
pub struct GatewayEvent {
    pub id: String,
    pub event_type: String,
    pub created: i64,
    pub payload: serde_json::Value,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    CheckoutSessionCompleted(CheckoutSessionCompleted),
    PaymentIntentSucceeded { payment_intent_id: String },
    PaymentIntentFailed { payment_intent_id: String },
    ChargeRefunded { payment_intent_id: Option<String> },
    /// Any other event type; recorded and acknowledged without side effects
    Ignored,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutSessionCompleted {
    pub session_id: String,
    pub payment_intent_id: Option<String>,
    pub paid: bool,
    /// Minor currency units
    pub amount_total: i64,
    pub currency: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    created: i64,
    data: RawEventData,
}

#[derive(Debug, Deserialize)]
struct RawEventData {
    object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RawCheckoutSession {
    id: String,
    #[serde(default)]
    payment_intent: Option<serde_json::Value>,
    #[serde(default)]
    payment_status: Option<String>,
    #[serde(default)]
    amount_total: Option<i64>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawObjectWithId {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RawCharge {
    #[serde(default)]
    payment_intent: Option<serde_json::Value>,
}

/// `payment_intent` is either an id string or, when expanded, an object
fn expandable_id(value: Option<serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::String(id) => Some(id),
        serde_json::Value::Object(object) => object
            .get("id")
            .and_then(|id| id.as_str())
            .map(str::to_string),
        _ => None,
    }
}

/// Parse a raw webhook body into a typed event
pub fn parse_event(raw: &[u8]) -> Result<GatewayEvent, serde_json::Error> {
    let payload: serde_json::Value = serde_json::from_slice(raw)?;
    let event: RawEvent = serde_json::from_value(payload.clone())?;
    let object = event.data.object;

    let kind = match event.event_type.as_str() {
        CHECKOUT_SESSION_COMPLETED => {
            let session: RawCheckoutSession = serde_json::from_value(object)?;
            EventKind::CheckoutSessionCompleted(CheckoutSessionCompleted {
                session_id: session.id,
                payment_intent_id: expandable_id(session.payment_intent),
                paid: session.payment_status.as_deref() == Some("paid"),
                amount_total: session.amount_total.unwrap_or(0),
                currency: session
                    .currency
                    .unwrap_or_else(|| "usd".to_string())
                    .to_uppercase(),
                metadata: session.metadata,
            })
        }
        PAYMENT_INTENT_SUCCEEDED => {
            let intent: RawObjectWithId = serde_json::from_value(object)?;
            EventKind::PaymentIntentSucceeded {
                payment_intent_id: intent.id,
            }
        }
        PAYMENT_INTENT_FAILED => {
            let intent: RawObjectWithId = serde_json::from_value(object)?;
            EventKind::PaymentIntentFailed {
                payment_intent_id: intent.id,
            }
        }
        CHARGE_REFUNDED => {
            let charge: RawCharge = serde_json::from_value(object)?;
            EventKind::ChargeRefunded {
                payment_intent_id: expandable_id(charge.payment_intent),
            }
        }
        _ => EventKind::Ignored,
    };

    Ok(GatewayEvent {
        id: event.id,
        event_type: event.event_type,
        created: event.created,
        payload,
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn test_parse_checkout_session_completed() {
        let body = raw(json!({
            "id": "evt_checkout",
            "type": "checkout.session.completed",
            "created": 1_760_000_000,
            "data": {"object": {
                "id": "cs_test_1",
                "payment_intent": "pi_1",
                "payment_status": "paid",
                "amount_total": 3600,
                "currency": "usd",
                "metadata": {"user_id": "abc", "subscription_months": "3"}
            }}
        }));

        let event = parse_event(&body).unwrap();
        assert_eq!(event.id, "evt_checkout");
        let EventKind::CheckoutSessionCompleted(session) = event.kind else {
            panic!("expected checkout session");
        };
        assert_eq!(session.session_id, "cs_test_1");
        assert_eq!(session.payment_intent_id.as_deref(), Some("pi_1"));
        assert!(session.paid);
        assert_eq!(session.amount_total, 3600);
        assert_eq!(session.currency, "USD");
        assert_eq!(session.metadata.get("subscription_months").unwrap(), "3");
    }

    #[test]
    fn test_expanded_payment_intent_on_charge() {
        let body = raw(json!({
            "id": "evt_refund",
            "type": "charge.refunded",
            "data": {"object": {"id": "ch_1", "payment_intent": {"id": "pi_9", "object": "payment_intent"}}}
        }));

        let event = parse_event(&body).unwrap();
        assert_eq!(
            event.kind,
            EventKind::ChargeRefunded {
                payment_intent_id: Some("pi_9".to_string())
            }
        );
    }

    #[test]
    fn test_unpaid_session_and_missing_fields() {
        let body = raw(json!({
            "id": "evt_unpaid",
            "type": "checkout.session.completed",
            "data": {"object": {"id": "cs_2", "payment_intent": null, "payment_status": "unpaid"}}
        }));

        let EventKind::CheckoutSessionCompleted(session) = parse_event(&body).unwrap().kind else {
            panic!("expected checkout session");
        };
        assert!(!session.paid);
        assert_eq!(session.payment_intent_id, None);
        assert_eq!(session.amount_total, 0);
        assert_eq!(session.currency, "USD");
        assert!(session.metadata.is_empty());
    }

    #[test]
    fn test_unknown_type_is_ignored() {
        let body = raw(json!({
            "id": "evt_other",
            "type": "customer.created",
            "data": {"object": {"id": "cus_1"}}
        }));
        assert_eq!(parse_event(&body).unwrap().kind, EventKind::Ignored);
    }

    #[test]
    fn test_garbage_is_an_error() {
        assert!(parse_event(b"not json").is_err());
        assert!(parse_event(br#"{"type":"charge.refunded"}"#).is_err());
    }
}
