//! Paid tool invocation: quote, reserve, run the provider job, settle.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::{
    auth::Caller,
    conf::Conf,
    data::{GenerationStatus, NewGeneration, Storage},
    ledger::{LedgerError, Reservation, ReservationState, ReserveRequest},
    provider::{self, PollSettings, ProviderError, QueueProvider},
    registry::{self, Tool, ValidationError, Workflow},
};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("no workflow matches goal: {0:?}")]
    NoWorkflow(String),

    #[error("api key may not use tool {0}")]
    ToolNotAllowed(String),

    #[error(transparent)]
    InvalidInput(#[from] ValidationError),

    #[error("request with this idempotency key is still running")]
    InProgress,

    #[error("request with this idempotency key already failed and was refunded")]
    AlreadyRefunded,

    #[error("idempotency key was already used for {purpose} ({amount} credits)")]
    IdempotencyMismatch { purpose: String, amount: i64 },

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub reservation_id: String,
    pub tool_id: String,
    pub request_id: Option<String>,
    pub credits_charged: i64,
    pub balance: i64,
    pub output: Value,
    pub replayed: bool,
}

#[derive(Debug)]
pub struct StepFailure {
    pub index: usize,
    pub tool_id: String,
    pub error: GatewayError,
}

#[derive(Debug)]
pub struct Orchestration {
    pub workflow: &'static Workflow,
    pub quoted_credits: i64,
    pub steps: Vec<Invocation>,
    /// Set when a step after the first failed. Earlier steps stay charged.
    pub failed: Option<StepFailure>,
}

#[derive(Clone)]
pub struct Gateway {
    storage: Storage,
    provider: Arc<dyn QueueProvider>,
    conf: Arc<Conf>,
}

impl Gateway {
    pub fn new(
        storage: Storage,
        provider: Arc<dyn QueueProvider>,
        conf: Arc<Conf>,
    ) -> Self {
        Self {
            storage,
            provider,
            conf,
        }
    }

    #[must_use]
    pub fn quote(&self, tool: &Tool) -> i64 {
        tool.credits(&self.conf.pricing)
    }

    /// Runs one tool for the caller. The job runs in its own task, so
    /// dropping the returned future (e.g. on client disconnect) does not
    /// abandon the reservation: it is still committed or refunded.
    pub async fn invoke(
        &self,
        caller: &Caller,
        tool_id: &str,
        input: Value,
        idempotency_key: Option<&str>,
    ) -> Result<Invocation> {
        let tool = registry::tool(tool_id)
            .ok_or_else(|| GatewayError::UnknownTool(tool_id.to_string()))?;
        if !caller.may_use(tool.id) {
            return Err(GatewayError::ToolNotAllowed(tool.id.to_string()));
        }
        tool.validate(&input)?;
        let credits = self.quote(tool);
        let purpose = format!("tool:{}", tool.id);
        let reservation = self
            .storage
            .reserve(&ReserveRequest {
                uid: &caller.uid,
                api_key_id: caller.key_id(),
                amount: credits,
                purpose: &purpose,
                idempotency_key,
            })
            .await?;
        if reservation.replayed {
            if reservation.purpose != purpose || reservation.amount != credits {
                return Err(GatewayError::IdempotencyMismatch {
                    purpose: reservation.purpose,
                    amount: reservation.amount,
                });
            }
            return self.replay(&reservation, tool).await;
        }

        let this = self.clone();
        let job = tokio::spawn(async move {
            this.run_and_settle(reservation, tool, input).await
        });
        job.await.map_err(|e| {
            GatewayError::Internal(anyhow::anyhow!("Invocation task died: {e}"))
        })?
    }

    /// Picks a workflow for the goal and runs its steps in order, feeding
    /// each step's media output into the next.
    pub async fn orchestrate(
        &self,
        caller: &Caller,
        goal: &str,
        input: Value,
    ) -> Result<Orchestration> {
        let workflow = registry::match_goal(goal)
            .ok_or_else(|| GatewayError::NoWorkflow(goal.to_string()))?;
        let base = match input {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            _ => return Err(ValidationError::NotAnObject.into()),
        };

        let mut quoted_credits = 0;
        for step in workflow.steps {
            let tool = registry::tool(step.tool)
                .ok_or_else(|| GatewayError::UnknownTool(step.tool.to_string()))?;
            if !caller.may_use(tool.id) {
                return Err(GatewayError::ToolNotAllowed(tool.id.to_string()));
            }
            quoted_credits += self.quote(tool);
        }
        self.precheck(caller, quoted_credits).await?;
        tracing::info!(
            workflow = workflow.id,
            quoted_credits,
            "Starting workflow."
        );

        let mut steps: Vec<Invocation> = Vec::with_capacity(workflow.steps.len());
        for (index, step) in workflow.steps.iter().enumerate() {
            let mut input = base.clone();
            if !input.contains_key("prompt") {
                input.insert("prompt".to_string(), Value::from(goal));
            }
            if let (Some(key), Some(previous)) = (step.from_previous, steps.last()) {
                let url = registry::media_url(&previous.output)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        ProviderError::Decode(format!(
                            "step {} produced no media for {}",
                            previous.tool_id, step.tool
                        ))
                    });
                match url {
                    Ok(url) => {
                        input.insert(key.to_string(), Value::from(url));
                    }
                    Err(error) => {
                        return Ok(Orchestration {
                            workflow,
                            quoted_credits,
                            steps,
                            failed: Some(StepFailure {
                                index,
                                tool_id: step.tool.to_string(),
                                error: error.into(),
                            }),
                        });
                    }
                }
            }
            match self.invoke(caller, step.tool, Value::Object(input), None).await {
                Ok(invocation) => steps.push(invocation),
                Err(error) if index == 0 => return Err(error),
                Err(error) => {
                    tracing::warn!(
                        workflow = workflow.id,
                        index,
                        ?error,
                        "Workflow step failed."
                    );
                    return Ok(Orchestration {
                        workflow,
                        quoted_credits,
                        steps,
                        failed: Some(StepFailure {
                            index,
                            tool_id: step.tool.to_string(),
                            error,
                        }),
                    });
                }
            }
        }
        Ok(Orchestration {
            workflow,
            quoted_credits,
            steps,
            failed: None,
        })
    }

    /// Fails unless both the balance and the caller's key budget cover
    /// `required`. Each step still reserves on its own.
    async fn precheck(&self, caller: &Caller, required: i64) -> Result<()> {
        let available = self.balance(&caller.uid).await?;
        if available < required {
            return Err(LedgerError::InsufficientCredits {
                required,
                available,
            }
            .into());
        }
        let Some(key_id) = caller.key_id() else {
            return Ok(());
        };
        let key = self
            .storage
            .api_key(key_id)
            .await?
            .ok_or_else(|| LedgerError::UnknownAccount(key_id.to_string()))?;
        if let Some(limit) = key.credit_limit {
            if key.credits_spent + required > limit {
                return Err(LedgerError::KeyBudgetExceeded {
                    key_id: key.id,
                    limit,
                }
                .into());
            }
        }
        Ok(())
    }

    async fn run_and_settle(
        &self,
        reservation: Reservation,
        tool: &'static Tool,
        input: Value,
    ) -> Result<Invocation> {
        let poll = PollSettings {
            interval: self.conf.provider.poll_interval(),
            timeout: tool.timeout_or(self.conf.provider.default_timeout()),
        };
        let mut request_id = None;
        let running = async {
            tracing::debug!(
                provider = self.provider.name(),
                model = tool.model,
                "Submitting job."
            );
            let job = self.provider.submit(tool.model, &input).await?;
            request_id = Some(job.request_id.clone());
            provider::wait_for_completion(self.provider.as_ref(), &job, poll).await
        };
        // Submission counts against the tool's time limit too.
        let outcome = tokio::time::timeout(poll.timeout, running)
            .await
            .unwrap_or_else(|_| Err(ProviderError::Timeout(poll.timeout)));

        match outcome {
            Ok(output) => {
                let credits_charged = match self.storage.commit(&reservation.id).await {
                    Ok(_) => reservation.amount,
                    Err(error) => {
                        // Reconciliation got to it first; the user was not
                        // charged, but the output is delivered anyway.
                        tracing::error!(
                            id = reservation.id,
                            ?error,
                            "Job succeeded but its reservation could not be \
                            committed."
                        );
                        0
                    }
                };
                self.record(
                    &reservation,
                    tool,
                    request_id.as_deref(),
                    GenerationStatus::Completed,
                    credits_charged,
                    Some(&output),
                )
                .await;
                Ok(Invocation {
                    reservation_id: reservation.id.clone(),
                    tool_id: tool.id.to_string(),
                    request_id,
                    credits_charged,
                    balance: self.balance(&reservation.uid).await?,
                    output,
                    replayed: false,
                })
            }
            Err(error) => {
                tracing::warn!(
                    id = reservation.id,
                    tool = tool.id,
                    ?error,
                    "Generation failed. Refunding."
                );
                self.storage.refund(&reservation.id).await?;
                let status = match error {
                    ProviderError::Timeout(_) => GenerationStatus::TimedOut,
                    _ => GenerationStatus::Failed,
                };
                let reason = serde_json::json!({ "error": error.to_string() });
                self.record(
                    &reservation,
                    tool,
                    request_id.as_deref(),
                    status,
                    0,
                    Some(&reason),
                )
                .await;
                Err(error.into())
            }
        }
    }

    async fn replay(
        &self,
        reservation: &Reservation,
        tool: &Tool,
    ) -> Result<Invocation> {
        if reservation.state == ReservationState::Pending {
            return Err(GatewayError::InProgress);
        }
        let generation = self
            .storage
            .generation_by_reservation(&reservation.id)
            .await?;
        let credits_charged = match (reservation.state, &generation) {
            (ReservationState::Committed, _) => reservation.amount,
            // Refunded by reconciliation, but the output was delivered.
            (ReservationState::Refunded, Some(g))
                if g.status == GenerationStatus::Completed =>
            {
                0
            }
            _ => return Err(GatewayError::AlreadyRefunded),
        };
        let output = generation
            .as_ref()
            .and_then(|g| g.output.as_deref())
            .map(serde_json::from_str::<Value>)
            .transpose()
            .map_err(anyhow::Error::from)?
            .unwrap_or(Value::Null);
        Ok(Invocation {
            reservation_id: reservation.id.clone(),
            tool_id: tool.id.to_string(),
            request_id: generation.and_then(|g| g.request_id),
            credits_charged,
            balance: self.balance(&reservation.uid).await?,
            output,
            replayed: true,
        })
    }

    /// History is best-effort: a failure to record is logged, not returned.
    async fn record(
        &self,
        reservation: &Reservation,
        tool: &Tool,
        request_id: Option<&str>,
        status: GenerationStatus,
        credits: i64,
        output: Option<&Value>,
    ) {
        let generation = NewGeneration {
            uid: &reservation.uid,
            reservation_id: &reservation.id,
            tool_id: tool.id,
            request_id,
            credits,
            status,
            output,
        };
        if let Err(error) = self
            .storage
            .record_generation(&generation, self.conf.ledger.history_limit)
            .await
        {
            tracing::error!(?error, id = reservation.id, "Failed to record history.");
        }
    }

    async fn balance(&self, uid: &str) -> Result<i64> {
        let user = self
            .storage
            .user(uid)
            .await?
            .ok_or_else(|| LedgerError::UnknownAccount(uid.to_string()))?;
        Ok(user.credits)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use serde_json::json;

    use crate::{
        auth::{KeyScope, Role},
        data::{tests::storage, PaymentCredit},
        keys,
        provider::tests::{Script, ScriptedProvider},
    };

    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        storage: Storage,
        provider: Arc<ScriptedProvider>,
        gateway: Gateway,
    }

    async fn fixture(credits: i64, scripts: Vec<Script>) -> Fixture {
        let (dir, storage) = storage().await;
        let mut conf = Conf::default();
        conf.provider.poll_interval = 0.005;
        conf.provider.default_timeout = 0.2;
        conf.ledger.history_limit = 10;
        storage.ensure_user("alice", 0).await.unwrap();
        if credits > 0 {
            storage
                .credit_payment(&PaymentCredit {
                    payment_id: "seed",
                    uid: "alice",
                    source: "admin",
                    credits,
                    amount_cents: None,
                })
                .await
                .unwrap();
        }
        let provider = Arc::new(ScriptedProvider::new(scripts));
        let gateway =
            Gateway::new(storage.clone(), provider.clone(), Arc::new(conf));
        Fixture {
            _dir: dir,
            storage,
            provider,
            gateway,
        }
    }

    fn alice() -> Caller {
        Caller::user("alice", Role::User)
    }

    fn price(gateway: &Gateway, tool_id: &str) -> i64 {
        gateway.quote(registry::tool(tool_id).unwrap())
    }

    impl Fixture {
        async fn credits(&self) -> i64 {
            self.storage.user("alice").await.unwrap().unwrap().credits
        }
    }

    #[tokio::test]
    async fn success_charges_the_quote_once() {
        let output = ScriptedProvider::image("https://cdn.test/cat.png");
        let f = fixture(
            100,
            vec![Script::Complete {
                polls: 2,
                output: output.clone(),
            }],
        )
        .await;
        let cost = price(&f.gateway, "flux-dev");

        let invocation = f
            .gateway
            .invoke(&alice(), "flux-dev", json!({"prompt": "a cat"}), None)
            .await
            .unwrap();
        assert_eq!(invocation.output, output);
        assert_eq!(invocation.credits_charged, cost);
        assert_eq!(invocation.balance, 100 - cost);
        assert_eq!(invocation.request_id.as_deref(), Some("req-0"));
        assert_eq!(f.credits().await, 100 - cost);

        let user = f.storage.user("alice").await.unwrap().unwrap();
        assert_eq!(user.total_credits_spent, cost);

        let submitted = f.provider.submitted.lock().unwrap().clone();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].0, "fal-ai/flux/dev");

        let history = f.storage.history("alice", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, GenerationStatus::Completed);
        assert_eq!(history[0].credits, cost);
    }

    #[tokio::test]
    async fn failure_refunds_what_was_deducted() {
        let f = fixture(
            100,
            vec![Script::Fail {
                polls: 1,
                reason: "nsfw".to_string(),
            }],
        )
        .await;

        let result = f
            .gateway
            .invoke(&alice(), "flux-dev", json!({"prompt": "a cat"}), None)
            .await;
        assert!(matches!(
            result,
            Err(GatewayError::Provider(ProviderError::Failed(r))) if r == "nsfw"
        ));
        assert_eq!(f.credits().await, 100);

        let user = f.storage.user("alice").await.unwrap().unwrap();
        assert_eq!(user.total_credits_spent, 0);
        let history = f.storage.history("alice", 10).await.unwrap();
        assert_eq!(history[0].status, GenerationStatus::Failed);
        assert_eq!(history[0].credits, 0);
    }

    #[tokio::test]
    async fn timeout_refunds() {
        let f = fixture(100, vec![Script::Hang]).await;
        let result = f
            .gateway
            .invoke(&alice(), "flux-schnell", json!({"prompt": "a cat"}), None)
            .await;
        assert!(matches!(
            result,
            Err(GatewayError::Provider(ProviderError::Timeout(_)))
        ));
        assert_eq!(f.credits().await, 100);
        let history = f.storage.history("alice", 10).await.unwrap();
        assert_eq!(history[0].status, GenerationStatus::TimedOut);
    }

    #[tokio::test]
    async fn stalled_submission_times_out_and_refunds() {
        let f = fixture(100, vec![Script::Stall]).await;
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            f.gateway
                .invoke(&alice(), "flux-schnell", json!({"prompt": "a cat"}), None),
        )
        .await
        .expect("invoke must give up on its own");
        assert!(matches!(
            result,
            Err(GatewayError::Provider(ProviderError::Timeout(_)))
        ));
        assert_eq!(f.credits().await, 100);
        let history = f.storage.history("alice", 10).await.unwrap();
        assert_eq!(history[0].status, GenerationStatus::TimedOut);
        assert_eq!(history[0].request_id, None);
    }

    #[tokio::test]
    async fn rejected_submission_refunds() {
        let f = fixture(100, vec![Script::Reject { status: 422 }]).await;
        let result = f
            .gateway
            .invoke(&alice(), "flux-schnell", json!({"prompt": "a cat"}), None)
            .await;
        assert!(matches!(
            result,
            Err(GatewayError::Provider(ProviderError::Api { status: 422, .. }))
        ));
        assert_eq!(f.credits().await, 100);
    }

    #[tokio::test]
    async fn insufficient_credits_never_reach_the_provider() {
        let f = fixture(1, vec![]).await;
        let result = f
            .gateway
            .invoke(&alice(), "flux-dev", json!({"prompt": "a cat"}), None)
            .await;
        assert!(matches!(
            result,
            Err(GatewayError::Ledger(LedgerError::InsufficientCredits {
                available: 1,
                ..
            }))
        ));
        assert_eq!(f.credits().await, 1);
        assert!(f.provider.submitted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn bad_requests_are_refused_before_charging() {
        let f = fixture(100, vec![]).await;
        assert!(matches!(
            f.gateway.invoke(&alice(), "nope", json!({}), None).await,
            Err(GatewayError::UnknownTool(_))
        ));
        assert!(matches!(
            f.gateway.invoke(&alice(), "flux-dev", json!({}), None).await,
            Err(GatewayError::InvalidInput(ValidationError::Missing("prompt")))
        ));
        let agent = Caller {
            key: Some(KeyScope {
                key_id: "k".to_string(),
                allowed_tools: vec!["text-to-speech".to_string()],
            }),
            ..alice()
        };
        assert!(matches!(
            f.gateway
                .invoke(&agent, "flux-dev", json!({"prompt": "x"}), None)
                .await,
            Err(GatewayError::ToolNotAllowed(_))
        ));
        assert_eq!(f.credits().await, 100);
        assert!(f.provider.submitted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn idempotent_retry_returns_the_first_result() {
        let f = fixture(100, vec![]).await;
        let cost = price(&f.gateway, "flux-schnell");
        let first = f
            .gateway
            .invoke(&alice(), "flux-schnell", json!({"prompt": "x"}), Some("k1"))
            .await
            .unwrap();
        let again = f
            .gateway
            .invoke(&alice(), "flux-schnell", json!({"prompt": "x"}), Some("k1"))
            .await
            .unwrap();
        assert!(!first.replayed);
        assert!(again.replayed);
        assert_eq!(again.reservation_id, first.reservation_id);
        assert_eq!(again.output, first.output);
        assert_eq!(again.request_id, first.request_id);
        assert_eq!(f.credits().await, 100 - cost);
        assert_eq!(f.provider.submitted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn idempotent_retry_of_a_failure_is_refused() {
        let f = fixture(
            100,
            vec![Script::Fail {
                polls: 0,
                reason: "boom".to_string(),
            }],
        )
        .await;
        let caller = alice();
        let call = || {
            f.gateway
                .invoke(&caller, "flux-schnell", json!({"prompt": "x"}), Some("k"))
        };
        assert!(call().await.is_err());
        assert!(matches!(call().await, Err(GatewayError::AlreadyRefunded)));
        assert_eq!(f.credits().await, 100);
        assert_eq!(f.provider.submitted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn idempotency_key_is_bound_to_its_tool() {
        let f = fixture(100, vec![]).await;
        let cost = price(&f.gateway, "flux-schnell");
        f.gateway
            .invoke(&alice(), "flux-schnell", json!({"prompt": "x"}), Some("k"))
            .await
            .unwrap();
        let result = f
            .gateway
            .invoke(&alice(), "text-to-video", json!({"prompt": "x"}), Some("k"))
            .await;
        assert!(matches!(
            result,
            Err(GatewayError::IdempotencyMismatch { purpose, amount })
                if purpose == "tool:flux-schnell" && amount == cost
        ));
        assert_eq!(f.credits().await, 100 - cost);
        assert_eq!(f.provider.submitted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn output_delivered_after_reconciliation_is_free() {
        let output = ScriptedProvider::image("https://cdn.test/late.png");
        let f = fixture(
            100,
            vec![Script::Complete {
                polls: 10,
                output: output.clone(),
            }],
        )
        .await;
        let gateway = f.gateway.clone();
        let job = tokio::spawn(async move {
            gateway
                .invoke(&alice(), "flux-schnell", json!({"prompt": "x"}), Some("k"))
                .await
        });
        while f.provider.submitted.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        // The reconciler refunds the job while it is still polling.
        let far_future = SystemTime::now() + Duration::from_secs(3600);
        let refunded = f.storage.recover_stale(far_future).await.unwrap();
        assert_eq!(refunded.len(), 1);

        let invocation = job.await.unwrap().unwrap();
        assert_eq!(invocation.output, output);
        assert_eq!(invocation.credits_charged, 0);
        assert_eq!(invocation.balance, 100);
        let history = f.storage.history("alice", 10).await.unwrap();
        assert_eq!(history[0].status, GenerationStatus::Completed);
        assert_eq!(history[0].credits, 0);

        let again = f
            .gateway
            .invoke(&alice(), "flux-schnell", json!({"prompt": "x"}), Some("k"))
            .await
            .unwrap();
        assert!(again.replayed);
        assert_eq!(again.output, output);
        assert_eq!(again.credits_charged, 0);
        assert_eq!(f.credits().await, 100);
    }

    #[tokio::test]
    async fn abandoned_request_still_settles() {
        let f = fixture(
            100,
            vec![Script::Complete {
                polls: 10,
                output: ScriptedProvider::image("https://cdn.test/late.png"),
            }],
        )
        .await;
        let cost = price(&f.gateway, "flux-schnell");
        {
            let caller = alice();
            let invoke = f.gateway.invoke(
                &caller,
                "flux-schnell",
                json!({"prompt": "x"}),
                None,
            );
            tokio::pin!(invoke);
            // Drop the request as soon as the job is in flight.
            loop {
                tokio::select! {
                    _ = &mut invoke => panic!("finished before being dropped"),
                    () = tokio::time::sleep(Duration::from_millis(1)) => {
                        if !f.provider.submitted.lock().unwrap().is_empty() {
                            break;
                        }
                    }
                }
            }
        }
        assert_eq!(f.credits().await, 100 - cost);

        let mut settled = false;
        for _ in 0..200 {
            let history = f.storage.history("alice", 10).await.unwrap();
            if let Some(generation) = history.first() {
                assert_eq!(generation.status, GenerationStatus::Completed);
                settled = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(settled);
        let user = f.storage.user("alice").await.unwrap().unwrap();
        assert_eq!(user.total_credits_spent, cost);
    }

    #[tokio::test]
    async fn orchestration_chains_media_between_steps() {
        let f = fixture(
            100,
            vec![
                Script::Complete {
                    polls: 0,
                    output: ScriptedProvider::image("https://cdn.test/1.png"),
                },
                Script::Complete {
                    polls: 0,
                    output: ScriptedProvider::image("https://cdn.test/2.png"),
                },
                Script::Complete {
                    polls: 0,
                    output: json!({"model_mesh": {"url": "https://cdn.test/3.glb"}}),
                },
            ],
        )
        .await;
        let total: i64 = ["flux-schnell", "background-removal", "image-to-3d"]
            .iter()
            .map(|t| price(&f.gateway, t))
            .sum();

        let run = f
            .gateway
            .orchestrate(&alice(), "a 3D model of a sneaker", json!({"seed": 7}))
            .await
            .unwrap();
        assert_eq!(run.workflow.id, "product-3d");
        assert_eq!(run.quoted_credits, total);
        assert!(run.failed.is_none());
        assert_eq!(run.steps.len(), 3);
        assert_eq!(f.credits().await, 100 - total);

        let submitted = f.provider.submitted.lock().unwrap().clone();
        assert_eq!(submitted[0].1["prompt"], "a 3D model of a sneaker");
        assert_eq!(submitted[0].1["seed"], 7);
        assert_eq!(submitted[1].1["image_url"], "https://cdn.test/1.png");
        assert_eq!(submitted[2].1["image_url"], "https://cdn.test/2.png");
    }

    #[tokio::test]
    async fn orchestration_stops_at_the_failed_step() {
        let f = fixture(
            100,
            vec![
                Script::Complete {
                    polls: 0,
                    output: ScriptedProvider::image("https://cdn.test/1.png"),
                },
                Script::Fail {
                    polls: 0,
                    reason: "busy".to_string(),
                },
            ],
        )
        .await;
        let first = price(&f.gateway, "flux-dev");

        let run = f
            .gateway
            .orchestrate(&alice(), "animate a sunrise", Value::Null)
            .await
            .unwrap();
        assert_eq!(run.workflow.id, "animated-scene");
        assert_eq!(run.steps.len(), 1);
        let failed = run.failed.unwrap();
        assert_eq!(failed.index, 1);
        assert_eq!(failed.tool_id, "image-to-video");
        assert_eq!(f.credits().await, 100 - first);
    }

    #[tokio::test]
    async fn orchestration_prechecks_the_total() {
        // Enough for the first step but not the whole workflow.
        let f = fixture(10, vec![]).await;
        let result = f
            .gateway
            .orchestrate(&alice(), "animate a sunrise", json!({}))
            .await;
        assert!(matches!(
            result,
            Err(GatewayError::Ledger(LedgerError::InsufficientCredits {
                available: 10,
                ..
            }))
        ));
        assert!(f.provider.submitted.lock().unwrap().is_empty());

        assert!(matches!(
            f.gateway.orchestrate(&alice(), "file my taxes", json!({})).await,
            Err(GatewayError::NoWorkflow(_))
        ));
    }

    #[tokio::test]
    async fn orchestration_prechecks_the_key_budget() {
        let f = fixture(100, vec![]).await;
        // Covers the first step only.
        let limit = price(&f.gateway, "flux-dev");
        let (row, _) = keys::create(
            &f.storage,
            &keys::NewKey {
                uid: "alice",
                name: "agent",
                allowed_tools: &[],
                credit_limit: Some(limit),
            },
        )
        .await
        .unwrap();
        let agent = Caller {
            key: Some(KeyScope {
                key_id: row.id.clone(),
                allowed_tools: vec![],
            }),
            ..alice()
        };
        let result = f
            .gateway
            .orchestrate(&agent, "animate a sunrise", json!({}))
            .await;
        assert!(matches!(
            result,
            Err(GatewayError::Ledger(LedgerError::KeyBudgetExceeded { key_id, .. }))
                if key_id == row.id
        ));
        assert_eq!(f.credits().await, 100);
        assert!(f.provider.submitted.lock().unwrap().is_empty());
    }
}
