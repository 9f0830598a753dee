//! Delivery rows, signed POSTs, and the background retry loop.
//!
//! Every emission creates a persisted `WebhookDelivery` and attempts it
//! once inline. Failures move to `retrying` with `next_retry_at = now +
//! 2^(attempt-1) × 30 s` until `max_attempts`, at which point the row goes
//! `failed`. The retry loop drains due rows in id order.

use std::{sync::Arc, time::Duration};

use {
    anyhow::Result,
    serde_json::json,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use quarry_store::{
    JobStore, WebhookStore,
    types::{DeliveryStatus, Job, NewDelivery, Webhook, WebhookDelivery, now_ms},
};

use crate::{crypto::SecretCipher, signing};

/// Success requires a 2xx inside this window.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);
/// Attempts per delivery, initial send included.
pub const DEFAULT_MAX_ATTEMPTS: i64 = 5;
/// Base of the exponential retry schedule.
pub const RETRY_BASE_MS: i64 = 30_000;
/// How often the retry loop scans for due rows.
const RETRY_POLL_INTERVAL: Duration = Duration::from_secs(10);
/// Due rows drained per scan.
const RETRY_BATCH: i64 = 50;

/// Standard payload for job lifecycle events.
#[must_use]
pub fn job_event_payload(job: &Job, event: &str) -> serde_json::Value {
    json!({
        "event": event,
        "job_id": job.id,
        "status": job.status.as_str(),
        "url": job.url,
        "page_count": job.page_count,
        "cost_usd": job.cost_usd,
        "error_message": job.error_message,
        "error_category": job.error_category,
    })
}

pub struct WebhookDispatcher {
    store: Arc<dyn WebhookStore>,
    jobs: Arc<dyn JobStore>,
    client: reqwest::Client,
    cipher: Option<Arc<SecretCipher>>,
    timeout: Duration,
}

impl WebhookDispatcher {
    #[must_use]
    pub fn new(
        store: Arc<dyn WebhookStore>,
        jobs: Arc<dyn JobStore>,
        client: reqwest::Client,
        cipher: Option<Arc<SecretCipher>>,
    ) -> Self {
        Self {
            store,
            jobs,
            client,
            cipher,
            timeout: DELIVERY_TIMEOUT,
        }
    }

    /// Override the per-post timeout (tests).
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Fan an event out to every subscribed webhook plus the job's inline
    /// URL, creating and attempting one delivery per target.
    pub async fn dispatch_job_event(&self, job: &Job, event: &str) -> Result<()> {
        for hook in self.store.webhooks_for_event(&job.user_id, event).await? {
            let delivery = self
                .store
                .create_delivery(NewDelivery {
                    webhook_id: Some(hook.id.clone()),
                    job_id: job.id.clone(),
                    event: event.to_string(),
                    url: hook.url.clone(),
                    payload: job_event_payload(job, event),
                    max_attempts: DEFAULT_MAX_ATTEMPTS,
                })
                .await?;
            self.attempt(delivery, Some(&hook)).await?;
        }

        // Ephemeral path: a job-inline URL behaves like a webhook with no
        // stored row, no secret, and no extra headers.
        if let Some(url) = &job.webhook_url {
            let delivery = self
                .store
                .create_delivery(NewDelivery {
                    webhook_id: None,
                    job_id: job.id.clone(),
                    event: event.to_string(),
                    url: url.clone(),
                    payload: job_event_payload(job, event),
                    max_attempts: DEFAULT_MAX_ATTEMPTS,
                })
                .await?;
            let delivery = self.attempt(delivery, None).await?;
            self.jobs
                .set_webhook_status(&job.id, delivery.status.as_str())
                .await?;
        }
        Ok(())
    }

    /// One send attempt; persists the updated row and returns it.
    async fn attempt(
        &self,
        mut delivery: WebhookDelivery,
        hook: Option<&Webhook>,
    ) -> Result<WebhookDelivery> {
        delivery.attempt_number += 1;

        let body = delivery.payload.to_string().into_bytes();
        let mut request = self
            .client
            .post(&delivery.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .timeout(self.timeout);

        if let Some(hook) = hook {
            if let Some(headers) = hook.headers.as_object() {
                for (name, value) in headers {
                    if let Some(value) = value.as_str() {
                        request = request.header(name, value);
                    }
                }
            }
            match self.decrypt_secret(hook) {
                Ok(secret) if !secret.is_empty() => {
                    request =
                        request.header(signing::SIGNATURE_HEADER, signing::sign_body(&secret, &body));
                },
                Ok(_) => {},
                Err(e) => warn!(webhook = %hook.id, error = %e, "secret decrypt failed, sending unsigned"),
            }
        }

        let outcome = request.body(body).send().await;
        match outcome {
            Ok(response) if response.status().is_success() => {
                debug!(delivery = %delivery.id, status = %response.status(), "webhook delivered");
                delivery.status = DeliveryStatus::Success;
                delivery.response_status = Some(i64::from(response.status().as_u16()));
                delivery.next_retry_at_ms = None;
                delivery.error = None;
            },
            Ok(response) => {
                let status = i64::from(response.status().as_u16());
                delivery.response_status = Some(status);
                // A 429 receiver sets the pace when it asks to.
                let retry_after = retry_after_ms(&response).filter(|_| status == 429);
                self.schedule_retry(&mut delivery, format!("HTTP {status}"), retry_after);
            },
            Err(e) => {
                delivery.response_status = None;
                self.schedule_retry(&mut delivery, e.to_string(), None);
            },
        }

        self.store.update_delivery(&delivery).await?;
        Ok(delivery)
    }

    fn schedule_retry(
        &self,
        delivery: &mut WebhookDelivery,
        error: String,
        retry_after_ms: Option<i64>,
    ) {
        delivery.error = Some(error);
        if delivery.attempt_number >= delivery.max_attempts {
            info!(delivery = %delivery.id, attempts = delivery.attempt_number, "webhook delivery exhausted");
            delivery.status = DeliveryStatus::Failed;
            delivery.next_retry_at_ms = None;
        } else {
            let backoff = RETRY_BASE_MS << (delivery.attempt_number - 1).clamp(0, 16);
            let delay = retry_after_ms.unwrap_or(backoff);
            delivery.status = DeliveryStatus::Retrying;
            delivery.next_retry_at_ms = Some(now_ms() + delay);
        }
    }

    fn decrypt_secret(&self, hook: &Webhook) -> Result<Vec<u8>> {
        match &self.cipher {
            Some(cipher) => Ok(cipher.decrypt(&hook.secret_ciphertext)?),
            // No process key configured: secrets are stored as-is.
            None => Ok(hook.secret_ciphertext.clone()),
        }
    }

    /// Re-attempt every due `retrying` row, id order.
    pub async fn process_due(&self, now_ms: i64) -> Result<usize> {
        let due = self.store.due_deliveries(now_ms, RETRY_BATCH).await?;
        let count = due.len();
        for delivery in due {
            let hook = match &delivery.webhook_id {
                Some(id) => self.store.get_webhook_by_id(id).await?,
                None => None,
            };
            let delivery = self.attempt(delivery, hook.as_ref()).await?;
            // Keep the job's inline-webhook status current.
            if delivery.webhook_id.is_none() {
                self.jobs
                    .set_webhook_status(&delivery.job_id, delivery.status.as_str())
                    .await?;
            }
        }
        Ok(count)
    }

    /// Background loop draining due retries until cancelled.
    pub fn spawn_retry_loop(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!("webhook retry loop started");
            loop {
                if let Err(e) = self.process_due(now_ms()).await {
                    warn!(error = %e, "webhook retry pass failed");
                }
                tokio::select! {
                    () = tokio::time::sleep(RETRY_POLL_INTERVAL) => {},
                    () = cancel.cancelled() => break,
                }
            }
            info!("webhook retry loop stopped");
        })
    }
}

/// `Retry-After` in delay-seconds form. The HTTP-date form is rare enough
/// for webhook receivers that it falls back to the backoff schedule.
fn retry_after_ms(response: &reqwest::Response) -> Option<i64> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<i64>()
        .ok()
        .filter(|secs| *secs >= 0)
        .map(|secs| secs * 1_000)
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use quarry_store::{
        InMemoryStore,
        types::{JobType, NewJob, NewWebhook},
    };

    async fn make_job(store: &Arc<InMemoryStore>, webhook_url: Option<String>) -> Job {
        store
            .create_job(NewJob {
                user_id: "u1".into(),
                job_type: JobType::Crawl,
                url: "https://example.com".into(),
                schema: serde_json::json!({}),
                crawl_options: serde_json::json!({}),
                config_chain: serde_json::json!([]),
                tier: "standard".into(),
                is_byok: false,
                webhook_url,
            })
            .await
            .unwrap()
    }

    fn dispatcher(store: &Arc<InMemoryStore>) -> WebhookDispatcher {
        WebhookDispatcher::new(
            store.clone(),
            store.clone(),
            reqwest::Client::new(),
            None,
        )
        .with_timeout(Duration::from_secs(2))
    }

    async fn subscribe(store: &Arc<InMemoryStore>, url: String, secret: &[u8]) {
        store
            .create_webhook(NewWebhook {
                user_id: "u1".into(),
                name: "prod".into(),
                url,
                events: vec!["job.completed".into()],
                secret_ciphertext: secret.to_vec(),
                headers: serde_json::json!({"X-Env": "test"}),
                active: true,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn successful_delivery_is_signed_and_recorded() {
        let mut server = mockito::Server::new_async().await;
        let store = Arc::new(InMemoryStore::new());
        let job = make_job(&store, None).await;
        subscribe(&store, format!("{}/hook", server.url()), b"whsec_1").await;

        let expected_sig = signing::sign_body(
            b"whsec_1",
            job_event_payload(&job, "job.completed").to_string().as_bytes(),
        );
        let mock = server
            .mock("POST", "/hook")
            .match_header("x-signature", expected_sig.as_str())
            .match_header("x-env", "test")
            .match_header("content-type", "application/json")
            .with_status(200)
            .create_async()
            .await;

        dispatcher(&store)
            .dispatch_job_event(&job, "job.completed")
            .await
            .unwrap();

        mock.assert_async().await;
        let deliveries = store.deliveries_for_job(&job.id).await.unwrap();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].status, DeliveryStatus::Success);
        assert_eq!(deliveries[0].attempt_number, 1);
        assert_eq!(deliveries[0].response_status, Some(200));
    }

    #[tokio::test]
    async fn unsubscribed_event_creates_no_delivery() {
        let store = Arc::new(InMemoryStore::new());
        let job = make_job(&store, None).await;
        subscribe(&store, "http://127.0.0.1:1/hook".into(), b"s").await;

        dispatcher(&store)
            .dispatch_job_event(&job, "job.failed")
            .await
            .unwrap();
        assert!(store.deliveries_for_job(&job.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failure_schedules_exponential_retries_then_succeeds() {
        let mut server = mockito::Server::new_async().await;
        let store = Arc::new(InMemoryStore::new());
        let job = make_job(&store, None).await;
        subscribe(&store, format!("{}/hook", server.url()), b"s").await;
        let dispatcher = dispatcher(&store);

        let failing = server
            .mock("POST", "/hook")
            .with_status(500)
            .expect(2)
            .create_async()
            .await;

        // Attempt 1 (inline) fails.
        dispatcher.dispatch_job_event(&job, "job.completed").await.unwrap();
        let d = &store.deliveries_for_job(&job.id).await.unwrap()[0];
        assert_eq!(d.status, DeliveryStatus::Retrying);
        assert_eq!(d.attempt_number, 1);
        let first_gap = d.next_retry_at_ms.unwrap() - d.updated_at_ms;
        assert!((29_000..=31_000).contains(&first_gap), "gap ≈30s, got {first_gap}");

        // Attempt 2 fails; gap doubles.
        let processed = dispatcher.process_due(d.next_retry_at_ms.unwrap()).await.unwrap();
        assert_eq!(processed, 1);
        failing.assert_async().await;
        let d = &store.deliveries_for_job(&job.id).await.unwrap()[0];
        assert_eq!(d.attempt_number, 2);
        assert_eq!(d.status, DeliveryStatus::Retrying);
        let second_gap = d.next_retry_at_ms.unwrap() - d.updated_at_ms;
        assert!((59_000..=61_000).contains(&second_gap), "gap ≈60s, got {second_gap}");

        // Attempt 3 succeeds.
        failing.remove_async().await;
        server
            .mock("POST", "/hook")
            .with_status(200)
            .create_async()
            .await;
        dispatcher.process_due(d.next_retry_at_ms.unwrap()).await.unwrap();
        let d = &store.deliveries_for_job(&job.id).await.unwrap()[0];
        assert_eq!(d.attempt_number, 3);
        assert_eq!(d.status, DeliveryStatus::Success);
        assert!(d.next_retry_at_ms.is_none());
    }

    #[tokio::test]
    async fn retry_after_header_overrides_backoff_on_429() {
        let mut server = mockito::Server::new_async().await;
        let store = Arc::new(InMemoryStore::new());
        let job = make_job(&store, None).await;
        subscribe(&store, format!("{}/hook", server.url()), b"s").await;
        server
            .mock("POST", "/hook")
            .with_status(429)
            .with_header("retry-after", "120")
            .create_async()
            .await;

        dispatcher(&store)
            .dispatch_job_event(&job, "job.completed")
            .await
            .unwrap();

        let d = &store.deliveries_for_job(&job.id).await.unwrap()[0];
        assert_eq!(d.status, DeliveryStatus::Retrying);
        let gap = d.next_retry_at_ms.unwrap() - d.updated_at_ms;
        assert!((119_000..=121_000).contains(&gap), "gap ≈120s, got {gap}");
    }

    #[tokio::test]
    async fn exhaustion_marks_failed() {
        let mut server = mockito::Server::new_async().await;
        let store = Arc::new(InMemoryStore::new());
        let job = make_job(&store, None).await;
        subscribe(&store, format!("{}/hook", server.url()), b"s").await;
        server
            .mock("POST", "/hook")
            .with_status(500)
            .expect_at_least(5)
            .create_async()
            .await;

        let dispatcher = dispatcher(&store);
        dispatcher.dispatch_job_event(&job, "job.completed").await.unwrap();
        // Drain every scheduled retry.
        for _ in 0..6 {
            let d = store.deliveries_for_job(&job.id).await.unwrap().remove(0);
            let Some(due) = d.next_retry_at_ms else { break };
            dispatcher.process_due(due).await.unwrap();
        }

        let d = &store.deliveries_for_job(&job.id).await.unwrap()[0];
        assert_eq!(d.status, DeliveryStatus::Failed);
        assert_eq!(d.attempt_number, DEFAULT_MAX_ATTEMPTS);
        assert!(d.next_retry_at_ms.is_none());
    }

    #[tokio::test]
    async fn inline_webhook_is_unsigned_and_updates_job_status() {
        let mut server = mockito::Server::new_async().await;
        let store = Arc::new(InMemoryStore::new());
        let job = make_job(&store, Some(format!("{}/inline", server.url()))).await;

        let mock = server
            .mock("POST", "/inline")
            .match_header("x-signature", mockito::Matcher::Missing)
            .with_status(200)
            .create_async()
            .await;

        dispatcher(&store)
            .dispatch_job_event(&job, "job.completed")
            .await
            .unwrap();

        mock.assert_async().await;
        let deliveries = store.deliveries_for_job(&job.id).await.unwrap();
        assert_eq!(deliveries.len(), 1);
        assert!(deliveries[0].webhook_id.is_none());
        let job = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(job.webhook_status.as_deref(), Some("success"));
    }

    #[tokio::test]
    async fn encrypted_secret_round_trips_through_signing() {
        let mut server = mockito::Server::new_async().await;
        let store = Arc::new(InMemoryStore::new());
        let job = make_job(&store, None).await;

        let cipher = Arc::new(SecretCipher::from_hex(&"ab".repeat(32)).unwrap());
        let ciphertext = cipher.encrypt(b"whsec_enc").unwrap();
        subscribe(&store, format!("{}/hook", server.url()), &ciphertext).await;

        let expected_sig = signing::sign_body(
            b"whsec_enc",
            job_event_payload(&job, "job.completed").to_string().as_bytes(),
        );
        let mock = server
            .mock("POST", "/hook")
            .match_header("x-signature", expected_sig.as_str())
            .with_status(204)
            .create_async()
            .await;

        WebhookDispatcher::new(store.clone(), store.clone(), reqwest::Client::new(), Some(cipher))
            .dispatch_job_event(&job, "job.completed")
            .await
            .unwrap();
        mock.assert_async().await;
    }
}
