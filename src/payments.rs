//! Stripe webhooks: signature verification and credit grants.

use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use crate::data::{PaymentCredit, PaymentOutcome, Storage};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum WebhookError {
    #[error("missing signature header")]
    MissingSignature,

    #[error("malformed signature header")]
    MalformedSignature,

    #[error("signature does not match payload")]
    SignatureMismatch,

    #[error("signature timestamp outside tolerance")]
    Expired,

    #[error("webhook secret is not configured")]
    NotConfigured,

    #[error("malformed event: {0}")]
    MalformedEvent(String),
}

#[derive(serde::Deserialize, Debug)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: EventData,
}

#[derive(serde::Deserialize, Debug)]
pub struct EventData {
    pub object: Value,
}

/// What a verified event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
    Credited {
        uid: String,
        payment_id: String,
        credits: i64,
        balance: i64,
    },
    Duplicate { payment_id: String },
    Ignored { kind: String },
}

/// Verifies a `Stripe-Signature` header (`t=<unix>,v1=<hex>[,v1=...]`)
/// against the raw body, then parses the event.
pub fn verify(
    payload: &[u8],
    header: Option<&str>,
    secret: &str,
    tolerance: u64,
    now: SystemTime,
) -> Result<Event, WebhookError> {
    if secret.is_empty() {
        return Err(WebhookError::NotConfigured);
    }
    let header = header.ok_or(WebhookError::MissingSignature)?;
    let mut timestamp: Option<u64> = None;
    let mut signatures: Vec<Vec<u8>> = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", t)) => {
                timestamp =
                    Some(t.parse().map_err(|_| WebhookError::MalformedSignature)?);
            }
            Some(("v1", sig)) => {
                // Undecodable entries cannot match; skip rather than reject.
                if let Ok(sig) = hex::decode(sig) {
                    signatures.push(sig);
                }
            }
            Some(_) => {}
            None => return Err(WebhookError::MalformedSignature),
        }
    }
    let timestamp = timestamp.ok_or(WebhookError::MalformedSignature)?;
    if signatures.is_empty() {
        return Err(WebhookError::MalformedSignature);
    }

    let matched = signatures.iter().any(|sig| {
        let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        mac.verify_slice(sig).is_ok()
    });
    if !matched {
        return Err(WebhookError::SignatureMismatch);
    }

    let now = now
        .duration_since(UNIX_EPOCH)
        .map_err(|_| WebhookError::Expired)?
        .as_secs();
    if now.abs_diff(timestamp) > tolerance {
        return Err(WebhookError::Expired);
    }

    serde_json::from_slice(payload)
        .map_err(|e| WebhookError::MalformedEvent(e.to_string()))
}

/// Produces a header value `verify` accepts.
#[must_use]
pub fn sign(payload: &[u8], secret: &str, timestamp: u64) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    let sig = hex::encode(mac.finalize().into_bytes());
    format!("t={timestamp},v1={sig}")
}

/// Grants the credits a completed purchase carries. The purchase's
/// PaymentIntent id is the idempotency key, so the `checkout.session` and
/// `payment_intent` events for one purchase credit it only once.
pub async fn handle(
    storage: &Storage,
    event: &Event,
) -> anyhow::Result<Result<Handled, WebhookError>> {
    let object = &event.data.object;
    let payment_id = match event.kind.as_str() {
        "payment_intent.succeeded" => object.get("id").and_then(Value::as_str),
        "checkout.session.completed" => {
            if object.get("payment_status").and_then(Value::as_str)
                != Some("paid")
            {
                return Ok(Ok(Handled::Ignored {
                    kind: format!("{} (unpaid)", event.kind),
                }));
            }
            object
                .get("payment_intent")
                .and_then(Value::as_str)
                .or_else(|| object.get("id").and_then(Value::as_str))
        }
        _ => {
            tracing::debug!(id = event.id, kind = event.kind, "Ignoring event.");
            return Ok(Ok(Handled::Ignored {
                kind: event.kind.clone(),
            }));
        }
    };
    let Some(payment_id) = payment_id else {
        return Ok(Err(WebhookError::MalformedEvent(
            "no payment id".to_string(),
        )));
    };
    let metadata = object.get("metadata");
    let uid = metadata
        .and_then(|m| m.get("uid").or_else(|| m.get("userId")))
        .and_then(Value::as_str)
        .filter(|uid| !uid.is_empty());
    let credits = metadata
        .and_then(|m| m.get("credits"))
        .and_then(|c| match c {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        })
        .filter(|c| *c > 0);
    let (Some(uid), Some(credits)) = (uid, credits) else {
        return Ok(Err(WebhookError::MalformedEvent(format!(
            "payment {payment_id} lacks uid/credits metadata"
        ))));
    };
    let amount_cents = object
        .get("amount_received")
        .or_else(|| object.get("amount_total"))
        .and_then(Value::as_i64);

    let outcome = storage
        .credit_payment(&PaymentCredit {
            payment_id,
            uid,
            source: "stripe",
            credits,
            amount_cents,
        })
        .await?;
    let handled = match outcome {
        PaymentOutcome::Credited { balance } => {
            tracing::info!(uid, payment_id, credits, balance, "Payment credited.");
            Handled::Credited {
                uid: uid.to_string(),
                payment_id: payment_id.to_string(),
                credits,
                balance,
            }
        }
        PaymentOutcome::Duplicate => {
            tracing::info!(payment_id, "Payment already credited.");
            Handled::Duplicate {
                payment_id: payment_id.to_string(),
            }
        }
    };
    Ok(Ok(handled))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use crate::data::tests::storage;

    use super::*;

    const SECRET: &str = "whsec_test";

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn intent(id: &str, uid: &str, credits: Value) -> Vec<u8> {
        json!({
            "id": format!("evt_{id}"),
            "type": "payment_intent.succeeded",
            "data": {"object": {
                "id": id,
                "amount_received": 1000,
                "metadata": {"uid": uid, "credits": credits},
            }},
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn valid_signature_is_accepted() {
        let payload = intent("pi_1", "alice", json!(100));
        let header = sign(&payload, SECRET, 1_700_000_000);
        let event =
            verify(&payload, Some(&header), SECRET, 300, at(1_700_000_100))
                .unwrap();
        assert_eq!(event.kind, "payment_intent.succeeded");
        assert_eq!(event.data.object["id"], "pi_1");
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let payload = intent("pi_1", "alice", json!(100));
        let header = sign(&payload, SECRET, 1_700_000_000);
        let tampered = intent("pi_1", "alice", json!(100_000));
        assert_eq!(
            verify(&tampered, Some(&header), SECRET, 300, at(1_700_000_000))
                .unwrap_err(),
            WebhookError::SignatureMismatch
        );
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let payload = intent("pi_1", "alice", json!(100));
        let header = sign(&payload, "whsec_other", 1_700_000_000);
        assert_eq!(
            verify(&payload, Some(&header), SECRET, 300, at(1_700_000_000))
                .unwrap_err(),
            WebhookError::SignatureMismatch
        );
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let payload = intent("pi_1", "alice", json!(100));
        let header = sign(&payload, SECRET, 1_700_000_000);
        assert_eq!(
            verify(&payload, Some(&header), SECRET, 300, at(1_700_000_301))
                .unwrap_err(),
            WebhookError::Expired
        );
    }

    #[test]
    fn one_good_signature_among_several_suffices() {
        let payload = intent("pi_1", "alice", json!(100));
        let good = sign(&payload, SECRET, 1_700_000_000);
        let v1 = good.split_once(",v1=").unwrap().1;
        let header = format!("t=1700000000,v1={},v0=abc,v1={v1}", "00".repeat(32));
        assert!(
            verify(&payload, Some(&header), SECRET, 300, at(1_700_000_000))
                .is_ok()
        );
    }

    #[test]
    fn malformed_headers() {
        let payload = b"{}";
        let now = at(1_700_000_000);
        let check = |h: Option<&str>| verify(payload, h, SECRET, 300, now);
        assert_eq!(check(None).unwrap_err(), WebhookError::MissingSignature);
        assert_eq!(
            check(Some("garbage")).unwrap_err(),
            WebhookError::MalformedSignature
        );
        assert_eq!(
            check(Some("v1=abcd")).unwrap_err(),
            WebhookError::MalformedSignature
        );
        assert_eq!(
            check(Some("t=1700000000")).unwrap_err(),
            WebhookError::MalformedSignature
        );
        assert_eq!(
            verify(payload, Some("t=1,v1=00"), "", 300, now).unwrap_err(),
            WebhookError::NotConfigured
        );
    }

    fn event(payload: &[u8]) -> Event {
        serde_json::from_slice(payload).unwrap()
    }

    #[tokio::test]
    async fn same_payment_intent_is_credited_once() {
        let (_dir, storage) = storage().await;
        let payment = event(&intent("pi_9", "alice", json!("250")));

        let first = handle(&storage, &payment).await.unwrap().unwrap();
        assert_eq!(
            first,
            Handled::Credited {
                uid: "alice".to_string(),
                payment_id: "pi_9".to_string(),
                credits: 250,
                balance: 250,
            }
        );

        // Checkout session for the same purchase.
        let session = event(
            json!({
                "id": "evt_cs",
                "type": "checkout.session.completed",
                "data": {"object": {
                    "id": "cs_1",
                    "payment_intent": "pi_9",
                    "payment_status": "paid",
                    "amount_total": 1000,
                    "metadata": {"userId": "alice", "credits": 250},
                }},
            })
            .to_string()
            .as_bytes(),
        );
        let second = handle(&storage, &session).await.unwrap().unwrap();
        assert_eq!(
            second,
            Handled::Duplicate {
                payment_id: "pi_9".to_string()
            }
        );
        let user = storage.user("alice").await.unwrap().unwrap();
        assert_eq!(user.credits, 250);
    }

    #[tokio::test]
    async fn unrelated_and_incomplete_events() {
        let (_dir, storage) = storage().await;
        let other = event(
            json!({"id": "evt", "type": "customer.created", "data": {"object": {}}})
                .to_string()
                .as_bytes(),
        );
        assert!(matches!(
            handle(&storage, &other).await.unwrap(),
            Ok(Handled::Ignored { .. })
        ));

        let unpaid = event(
            json!({
                "id": "evt",
                "type": "checkout.session.completed",
                "data": {"object": {"id": "cs", "payment_status": "unpaid"}},
            })
            .to_string()
            .as_bytes(),
        );
        assert!(matches!(
            handle(&storage, &unpaid).await.unwrap(),
            Ok(Handled::Ignored { .. })
        ));

        let no_credits = event(&intent("pi_2", "bob", json!(0)));
        assert!(matches!(
            handle(&storage, &no_credits).await.unwrap(),
            Err(WebhookError::MalformedEvent(_))
        ));
        assert!(storage.user("bob").await.unwrap().is_none());
    }
}
