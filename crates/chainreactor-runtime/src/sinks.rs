//! Action sinks — webhook delivery, chain transaction submission, user
//! notification — and the router that picks one per task.
//!
//! Every sink passes the task's idempotency key to the remote side so a
//! redelivered task is recognised as the same delivery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use chainreactor_core::action::{ActionError, ActionReceipt, ActionSink, ActionSpec, ActionTask};
use chainreactor_core::error::ReactorError;

/// Header carrying the task's idempotency key on webhook deliveries.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

// ─── Webhook ──────────────────────────────────────────────────────────────────

/// Map a webhook response status to a delivery outcome.
///
/// 2xx succeeds; 408, 429 and 5xx are worth retrying; any other status is a
/// permanent rejection.
pub fn classify_status(status: u16) -> Result<(), ActionError> {
    match status {
        200..=299 => Ok(()),
        408 | 429 | 500..=599 => Err(ActionError::Transient(format!("HTTP {status}"))),
        _ => Err(ActionError::Permanent(format!("HTTP {status}"))),
    }
}

/// POSTs the task payload as JSON.
pub struct WebhookSink {
    http: reqwest::Client,
}

impl WebhookSink {
    pub fn new(request_timeout: Duration) -> Result<Self, ReactorError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ReactorError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl ActionSink for WebhookSink {
    async fn execute(&self, task: &ActionTask) -> Result<ActionReceipt, ActionError> {
        let ActionSpec::Webhook { url, headers } = &task.action else {
            return Err(ActionError::Permanent(format!("webhook sink got a {} action", task.action.label())));
        };
        let mut req = self
            .http
            .post(url)
            .header(IDEMPOTENCY_HEADER, &task.idempotency_key)
            .json(&task.payload);
        for (name, value) in headers {
            req = req.header(name.as_str(), value.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ActionError::Transient(e.to_string()))?;
        let status = resp.status().as_u16();
        classify_status(status)?;
        tracing::debug!(url = %url, status, key = %task.idempotency_key, "webhook delivered");
        Ok(ActionReceipt {
            reference: format!("HTTP {status}"),
        })
    }
}

// ─── Chain transactions ───────────────────────────────────────────────────────

/// Submits transactions on behalf of the platform (the signing service).
#[async_trait]
pub trait TxSubmitter: Send + Sync {
    /// Submit and return the transaction signature. The same
    /// `idempotency_key` must never produce two transactions.
    async fn submit(
        &self,
        target: &str,
        method: &str,
        args: &Value,
        idempotency_key: &str,
    ) -> Result<String, ActionError>;
}

/// Runs `chain_transaction` actions through a [`TxSubmitter`].
pub struct ChainTxSink<T: ?Sized> {
    submitter: Arc<T>,
}

impl<T: TxSubmitter + ?Sized> ChainTxSink<T> {
    pub fn new(submitter: Arc<T>) -> Self {
        Self { submitter }
    }
}

#[async_trait]
impl<T: TxSubmitter + ?Sized> ActionSink for ChainTxSink<T> {
    async fn execute(&self, task: &ActionTask) -> Result<ActionReceipt, ActionError> {
        let ActionSpec::ChainTransaction { target, method, args } = &task.action else {
            return Err(ActionError::Permanent(format!("chain tx sink got a {} action", task.action.label())));
        };
        let signature = self
            .submitter
            .submit(target, method, args, &task.idempotency_key)
            .await?;
        Ok(ActionReceipt { reference: signature })
    }
}

/// Logs instead of submitting. Used by `simulate`.
#[derive(Debug, Default)]
pub struct DryRunSubmitter;

#[async_trait]
impl TxSubmitter for DryRunSubmitter {
    async fn submit(
        &self,
        target: &str,
        method: &str,
        args: &Value,
        idempotency_key: &str,
    ) -> Result<String, ActionError> {
        tracing::info!(target_program = %target, method, %args, key = %idempotency_key, "dry-run transaction");
        Ok(format!("dry-run:{idempotency_key}"))
    }
}

// ─── Notifications ────────────────────────────────────────────────────────────

/// Delivers a rendered message to a user (email, push, in-app).
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver and return a message id.
    async fn notify(
        &self,
        channel: &str,
        recipient: &str,
        message: &str,
        idempotency_key: &str,
    ) -> Result<String, ActionError>;
}

/// Replace `{{path}}` placeholders with values from `payload`.
///
/// Paths are dot-separated (`payload.token_id`). Strings are inserted
/// without quotes; a missing path renders as an empty string.
pub fn render_template(template: &str, payload: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let path = after[..end].trim();
        let value = path.split('.').try_fold(payload, |v, key| v.get(key));
        match value {
            Some(Value::String(s)) => out.push_str(s),
            Some(Value::Null) | None => {}
            Some(other) => out.push_str(&other.to_string()),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

/// Runs `notification` actions through a [`Notifier`].
pub struct NotificationSink<N: ?Sized> {
    notifier: Arc<N>,
}

impl<N: Notifier + ?Sized> NotificationSink<N> {
    pub fn new(notifier: Arc<N>) -> Self {
        Self { notifier }
    }
}

#[async_trait]
impl<N: Notifier + ?Sized> ActionSink for NotificationSink<N> {
    async fn execute(&self, task: &ActionTask) -> Result<ActionReceipt, ActionError> {
        let ActionSpec::Notification {
            channel,
            recipient,
            template,
        } = &task.action
        else {
            return Err(ActionError::Permanent(format!(
                "notification sink got a {} action",
                task.action.label()
            )));
        };
        let message = render_template(template, &task.payload);
        let recipient = render_template(recipient, &task.payload);
        if recipient.is_empty() {
            return Err(ActionError::Permanent("notification has no recipient".into()));
        }
        let id = self
            .notifier
            .notify(channel, &recipient, &message, &task.idempotency_key)
            .await?;
        Ok(ActionReceipt { reference: id })
    }
}

/// Writes notifications to the log.
#[derive(Debug, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn notify(
        &self,
        channel: &str,
        recipient: &str,
        message: &str,
        idempotency_key: &str,
    ) -> Result<String, ActionError> {
        tracing::info!(channel, recipient, key = %idempotency_key, "{message}");
        Ok(format!("{channel}:{idempotency_key}"))
    }
}

// ─── Router ───────────────────────────────────────────────────────────────────

/// Dispatches each task to the sink registered for its action type.
#[derive(Default, Clone)]
pub struct ActionRouter {
    webhook: Option<Arc<dyn ActionSink>>,
    chain_tx: Option<Arc<dyn ActionSink>>,
    notification: Option<Arc<dyn ActionSink>>,
}

impl ActionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_webhook(mut self, sink: Arc<dyn ActionSink>) -> Self {
        self.webhook = Some(sink);
        self
    }

    pub fn with_chain_tx(mut self, sink: Arc<dyn ActionSink>) -> Self {
        self.chain_tx = Some(sink);
        self
    }

    pub fn with_notification(mut self, sink: Arc<dyn ActionSink>) -> Self {
        self.notification = Some(sink);
        self
    }

    fn sink_for(&self, action: &ActionSpec) -> Option<&Arc<dyn ActionSink>> {
        match action {
            ActionSpec::Webhook { .. } => self.webhook.as_ref(),
            ActionSpec::ChainTransaction { .. } => self.chain_tx.as_ref(),
            ActionSpec::Notification { .. } => self.notification.as_ref(),
        }
    }
}

#[async_trait]
impl ActionSink for ActionRouter {
    async fn execute(&self, task: &ActionTask) -> Result<ActionReceipt, ActionError> {
        match self.sink_for(&task.action) {
            Some(sink) => sink.execute(task).await,
            None => Err(ActionError::Permanent(format!(
                "no sink configured for {} actions",
                task.action.label()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use chainreactor_core::action::TaskStatus;

    fn task(action: ActionSpec) -> ActionTask {
        ActionTask {
            task_id: 1,
            trigger_firing_id: 1,
            rule_id: "sale-alert".into(),
            sequence_id: 42,
            action,
            payload: json!({
                "rule_id": "sale-alert",
                "sequence_id": 42,
                "payload": {"listing_id": "l1", "buyer": "bob", "price": 3}
            }),
            idempotency_key: "sale-alert:42".into(),
            attempt: 0,
            next_retry_at: 0,
            lease_until: None,
            status: TaskStatus::Executing,
            last_error: None,
            receipt: None,
            updated_at: 0,
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<(String, String, String)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(
            &self,
            channel: &str,
            recipient: &str,
            message: &str,
            idempotency_key: &str,
        ) -> Result<String, ActionError> {
            self.sent
                .lock()
                .unwrap()
                .push((channel.into(), recipient.into(), message.into()));
            Ok(format!("msg-{idempotency_key}"))
        }
    }

    #[test]
    fn status_classification() {
        assert!(classify_status(200).is_ok());
        assert!(classify_status(204).is_ok());
        assert_eq!(classify_status(503), Err(ActionError::Transient("HTTP 503".into())));
        assert!(!classify_status(429).unwrap_err().is_permanent());
        assert!(!classify_status(408).unwrap_err().is_permanent());
        assert!(classify_status(400).unwrap_err().is_permanent());
        assert!(classify_status(410).unwrap_err().is_permanent());
    }

    #[test]
    fn templates_render_payload_paths() {
        let payload = json!({"payload": {"buyer": "bob", "price": 3, "memo": null}});
        assert_eq!(
            render_template("{{ payload.buyer }} paid {{payload.price}}", &payload),
            "bob paid 3"
        );
        assert_eq!(render_template("missing: [{{payload.nope}}]", &payload), "missing: []");
        assert_eq!(render_template("open {{payload.buyer", &payload), "open {{payload.buyer");
    }

    #[tokio::test]
    async fn notification_sink_renders_and_delivers() {
        let notifier = Arc::new(RecordingNotifier::default());
        let sink = NotificationSink::new(Arc::clone(&notifier));
        let t = task(ActionSpec::Notification {
            channel: "email".into(),
            recipient: "{{payload.buyer}}".into(),
            template: "Listing {{payload.listing_id}} is yours".into(),
        });
        let receipt = sink.execute(&t).await.unwrap();
        assert_eq!(receipt.reference, "msg-sale-alert:42");
        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent[0], ("email".into(), "bob".into(), "Listing l1 is yours".into()));
    }

    #[tokio::test]
    async fn router_dispatches_by_action_type() {
        let router = ActionRouter::new()
            .with_chain_tx(Arc::new(ChainTxSink::new(Arc::new(DryRunSubmitter))))
            .with_notification(Arc::new(NotificationSink::new(Arc::new(LoggingNotifier))));

        let tx = task(ActionSpec::ChainTransaction {
            target: "Prog1111".into(),
            method: "settle".into(),
            args: json!({"listing": "l1"}),
        });
        assert_eq!(router.execute(&tx).await.unwrap().reference, "dry-run:sale-alert:42");

        let hook = task(ActionSpec::Webhook {
            url: "https://hooks.test/sale".into(),
            headers: Default::default(),
        });
        let err = router.execute(&hook).await.unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn sinks_reject_foreign_actions() {
        let sink = ChainTxSink::new(Arc::new(DryRunSubmitter));
        let t = task(ActionSpec::Notification {
            channel: "push".into(),
            recipient: "bob".into(),
            template: "hi".into(),
        });
        assert!(sink.execute(&t).await.unwrap_err().is_permanent());
    }
}
