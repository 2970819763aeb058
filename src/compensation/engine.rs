use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use futures::StreamExt;
use tracing::{error, info, warn};

use super::pipeline;
use super::retry::RetryPolicy;
use super::window;
use crate::billing::models::{CreditTransaction, TransactionStatus};
use crate::billing::repository::TransactionStore;
use crate::credit::{CreditLedger, DeductionOutcome, DeductionRequest};
use crate::error::{AppError, AppResult, CompensationError, TraceError};
use crate::system_config::SystemConfigStore;
use crate::trace::models::LlmTrace;
use crate::trace::store::TraceStore;

/// What the pipeline decided for one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompensationOutcome {
    Compensated,
    /// Permanently malformed, parked as INVALID
    Invalid,
    /// Unrecognized feature tag, marked FAILED without in-sweep retry
    UnknownFeature,
    /// No usable token counts after all fallbacks, marked FAILED
    UsageUnavailable,
    /// Ledger rejected for insufficient balance, parked as NO_FUNDS
    NoFunds,
}

/// Per-sweep tally, logged at cycle end.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: u64,
    pub compensated: u64,
    pub invalid: u64,
    pub no_funds: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// The report mutex guards plain counters; a poisoned lock still holds a
/// usable tally, and the sweep must keep going either way.
fn tally(report: &Mutex<SweepReport>) -> std::sync::MutexGuard<'_, SweepReport> {
    report.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Compensation engine: detects credit transactions left in a non-terminal
/// state and reconciles each one exactly once.
pub struct CompensationEngine {
    transactions: Arc<dyn TransactionStore>,
    traces: Arc<dyn TraceStore>,
    ledger: Arc<dyn CreditLedger>,
    system_config: Arc<dyn SystemConfigStore>,
    retry: RetryPolicy,
    concurrency: usize,
}

impl CompensationEngine {
    pub fn new(
        transactions: Arc<dyn TransactionStore>,
        traces: Arc<dyn TraceStore>,
        ledger: Arc<dyn CreditLedger>,
        system_config: Arc<dyn SystemConfigStore>,
    ) -> Self {
        Self {
            transactions,
            traces,
            ledger,
            system_config,
            retry: RetryPolicy::default(),
            concurrency: 8,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// One full sweep: resolve the window, stream candidates, compensate each
    /// concurrently. A candidate that keeps failing is logged and left for
    /// the next cycle; the sweep itself never aborts.
    pub async fn run_sweep(&self) -> AppResult<SweepReport> {
        let since = window::resolve_window(self.system_config.as_ref(), Utc::now()).await?;
        match since {
            Some(cutoff) => info!("🔄 Starting compensation sweep (window: since {cutoff})"),
            None => info!("🔄 Starting compensation sweep (no time window)"),
        }

        let report = Mutex::new(SweepReport::default());

        self.transactions
            .stream_candidates(since)
            .for_each_concurrent(self.concurrency, |candidate| {
                let report = &report;
                async move {
                    let tx = match candidate {
                        Ok(tx) => tx,
                        Err(e) => {
                            error!("failed to read sweep candidate: {e}");
                            tally(report).failed += 1;
                            return;
                        }
                    };
                    tally(report).scanned += 1;

                    let result = self.retry.run(|| self.process(tx.clone())).await;

                    let mut report = tally(report);
                    match result {
                        Ok(CompensationOutcome::Compensated) => report.compensated += 1,
                        Ok(CompensationOutcome::Invalid) => report.invalid += 1,
                        Ok(CompensationOutcome::NoFunds) => report.no_funds += 1,
                        Ok(CompensationOutcome::UnknownFeature)
                        | Ok(CompensationOutcome::UsageUnavailable) => report.skipped += 1,
                        Err(e) => {
                            report.failed += 1;
                            error!(
                                transaction_id = %tx.id,
                                user_id = %tx.user_id,
                                provider = ?tx.provider,
                                model_id = ?tx.model_id,
                                feature_tag = %tx.feature_tag,
                                "compensation exhausted retries, deferring to next sweep: {e}"
                            );
                        }
                    }
                }
            })
            .await;

        let report = report
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        info!(
            "✓ Sweep cycle completed: {} scanned, {} compensated, {} no-funds, {} invalid, {} skipped, {} failed",
            report.scanned,
            report.compensated,
            report.no_funds,
            report.invalid,
            report.skipped,
            report.failed
        );
        Ok(report)
    }

    /// Run the full pipeline for one candidate.
    ///
    /// Terminal decisions return Ok with the outcome; only failures the retry
    /// wrapper should re-attempt come back as Err.
    pub async fn process(&self, mut tx: CreditTransaction) -> AppResult<CompensationOutcome> {
        // 1. Integrity check, persisted before any ledger-affecting work
        if let Err(reason) = pipeline::validate_integrity(&tx) {
            warn!(
                transaction_id = %tx.id,
                user_id = %tx.user_id,
                feature_tag = %tx.feature_tag,
                "parking transaction as invalid: {reason}"
            );
            tx.touch(TransactionStatus::Invalid, Some(reason));
            self.transactions.save(&tx).await?;
            return Ok(CompensationOutcome::Invalid);
        }

        // 2. Feature tag must map to the closed feature set
        let feature = match pipeline::resolve_feature(&tx) {
            Ok(feature) => feature,
            Err(reason) => {
                error!(
                    transaction_id = %tx.id,
                    user_id = %tx.user_id,
                    feature_tag = %tx.feature_tag,
                    "skipping compensation: {reason}"
                );
                tx.touch(TransactionStatus::Failed, Some(reason));
                self.transactions.save(&tx).await?;
                return Ok(CompensationOutcome::UnknownFeature);
            }
        };

        // 3. Trace lookup, tolerating duplicates and treating every other
        //    fault as an absent trace
        let trace = self.resolve_trace(&tx).await;

        // 4. Backfill provider/model from the trace where missing
        let (provider, model_id) = pipeline::resolve_identity(&tx, trace.as_ref());
        tx.provider = provider;
        tx.model_id = model_id;

        // 5. Recover token counts
        let usage = match pipeline::reconstruct_usage(&tx, trace.as_ref(), feature) {
            Ok(usage) => usage,
            Err(reason) => {
                warn!(
                    transaction_id = %tx.id,
                    user_id = %tx.user_id,
                    provider = ?tx.provider,
                    model_id = ?tx.model_id,
                    feature_tag = %tx.feature_tag,
                    trace_id = ?tx.trace_id,
                    "skipping compensation: {reason}"
                );
                tx.touch(TransactionStatus::Failed, Some(reason));
                self.transactions.save(&tx).await?;
                return Ok(CompensationOutcome::UsageUnavailable);
            }
        };

        // 6. Deduct
        let request = DeductionRequest {
            transaction_id: tx.id,
            user_id: tx.user_id.clone(),
            provider: tx.provider.clone(),
            model_id: tx.model_id.clone(),
            feature,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
        };

        let outcome = match self.ledger.deduct(&request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let message = e.to_string();
                tx.touch(TransactionStatus::Failed, Some(message.clone()));
                self.transactions.save(&tx).await?;
                return Err(CompensationError::Transient(message).into());
            }
        };

        // 7. Record the terminal decision
        match outcome {
            DeductionOutcome::Success { credits_deducted } => {
                tx.credits_deducted = Some(credits_deducted);
                tx.billing_mode = Some(usage.billing_mode);
                tx.estimated = usage.estimated();
                tx.input_tokens = Some(usage.input_tokens);
                tx.output_tokens = Some(usage.output_tokens);
                tx.touch(TransactionStatus::Compensated, None);
                self.transactions.save(&tx).await?;
                info!(
                    transaction_id = %tx.id,
                    user_id = %tx.user_id,
                    "transaction compensated: {} credits ({} in / {} out, {:?})",
                    credits_deducted, usage.input_tokens, usage.output_tokens, usage.billing_mode
                );
                Ok(CompensationOutcome::Compensated)
            }
            DeductionOutcome::InsufficientFunds { message } => {
                self.mark_no_funds(tx, message).await
            }
            DeductionOutcome::Failed { message }
                if pipeline::is_insufficient_funds_message(&message) =>
            {
                self.mark_no_funds(tx, message).await
            }
            DeductionOutcome::Failed { message } => {
                tx.touch(TransactionStatus::Failed, Some(message.clone()));
                self.transactions.save(&tx).await?;
                Err(CompensationError::Transient(message).into())
            }
        }
    }

    /// Insufficient balance is an expected business outcome: park the
    /// transaction and suppress retry.
    async fn mark_no_funds(
        &self,
        mut tx: CreditTransaction,
        message: String,
    ) -> AppResult<CompensationOutcome> {
        warn!(
            transaction_id = %tx.id,
            user_id = %tx.user_id,
            provider = ?tx.provider,
            model_id = ?tx.model_id,
            feature_tag = %tx.feature_tag,
            "compensation skipped, insufficient credits: {message}"
        );
        tx.touch(TransactionStatus::NoFunds, Some(message));
        self.transactions.save(&tx).await?;
        Ok(CompensationOutcome::NoFunds)
    }

    async fn resolve_trace(&self, tx: &CreditTransaction) -> Option<LlmTrace> {
        let trace_id = tx.trace_id.as_deref()?;
        if trace_id.trim().is_empty() {
            return None;
        }

        match self.traces.find_by_trace_id(trace_id).await {
            Ok(found) => found,
            Err(AppError::Trace(TraceError::DuplicateTraceId(_))) => {
                warn!(
                    transaction_id = %tx.id,
                    trace_id,
                    "duplicate trace id, falling back to first match"
                );
                self.traces
                    .find_first_by_trace_id(trace_id)
                    .await
                    .unwrap_or_else(|e| {
                        warn!(trace_id, "trace fallback lookup failed: {e}");
                        None
                    })
            }
            Err(e) => {
                warn!(
                    transaction_id = %tx.id,
                    trace_id,
                    "trace lookup failed, continuing without trace: {e}"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::models::BillingMode;
    use crate::system_config::keys;
    use crate::trace::models::{
        TokenUsage, TraceMessage, TraceMetadata, TraceRequest, TraceResponse,
    };
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration, Utc};
    use futures::stream::BoxStream;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use std::time::Duration;
    use uuid::Uuid;

    // ========== MOCK COLLABORATORS ==========

    #[derive(Default)]
    struct MockTransactionStore {
        transactions: Mutex<Vec<CreditTransaction>>,
        saved: Mutex<Vec<CreditTransaction>>,
    }

    impl MockTransactionStore {
        fn with_transactions(transactions: Vec<CreditTransaction>) -> Self {
            Self {
                transactions: Mutex::new(transactions),
                saved: Mutex::new(Vec::new()),
            }
        }

        fn last_saved(&self) -> CreditTransaction {
            self.saved.lock().unwrap().last().cloned().expect("no save recorded")
        }

        fn saved_count(&self) -> usize {
            self.saved.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl TransactionStore for MockTransactionStore {
        fn stream_candidates(
            &self,
            since: Option<DateTime<Utc>>,
        ) -> BoxStream<'_, AppResult<CreditTransaction>> {
            let candidates: Vec<_> = self
                .transactions
                .lock()
                .unwrap()
                .iter()
                .filter(|tx| tx.is_sweep_candidate(since))
                .cloned()
                .map(Ok)
                .collect();
            futures::stream::iter(candidates).boxed()
        }

        async fn save(&self, tx: &CreditTransaction) -> AppResult<CreditTransaction> {
            self.saved.lock().unwrap().push(tx.clone());
            Ok(tx.clone())
        }
    }

    struct MockTraceStore {
        traces: Vec<LlmTrace>,
        duplicate_ids: Vec<String>,
    }

    impl MockTraceStore {
        fn empty() -> Self {
            Self {
                traces: Vec::new(),
                duplicate_ids: Vec::new(),
            }
        }

        fn with_trace(trace: LlmTrace) -> Self {
            Self {
                traces: vec![trace],
                duplicate_ids: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl TraceStore for MockTraceStore {
        async fn find_by_trace_id(&self, trace_id: &str) -> AppResult<Option<LlmTrace>> {
            if self.duplicate_ids.iter().any(|id| id == trace_id) {
                return Err(TraceError::DuplicateTraceId(trace_id.to_string()).into());
            }
            Ok(self.traces.iter().find(|t| t.trace_id == trace_id).cloned())
        }

        async fn find_first_by_trace_id(&self, trace_id: &str) -> AppResult<Option<LlmTrace>> {
            Ok(self.traces.iter().find(|t| t.trace_id == trace_id).cloned())
        }
    }

    struct MockLedger {
        outcome: DeductionOutcome,
        calls: Mutex<Vec<DeductionRequest>>,
    }

    impl MockLedger {
        fn succeeding() -> Self {
            Self::with_outcome(DeductionOutcome::Success {
                credits_deducted: dec!(1.25),
            })
        }

        fn with_outcome(outcome: DeductionOutcome) -> Self {
            Self {
                outcome,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<DeductionRequest> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CreditLedger for MockLedger {
        async fn deduct(&self, request: &DeductionRequest) -> AppResult<DeductionOutcome> {
            self.calls.lock().unwrap().push(request.clone());
            Ok(self.outcome.clone())
        }
    }

    #[derive(Default)]
    struct MockConfig {
        entries: HashMap<String, String>,
    }

    impl MockConfig {
        fn with_entry(key: &str, value: &str) -> Self {
            let mut entries = HashMap::new();
            entries.insert(key.to_string(), value.to_string());
            Self { entries }
        }
    }

    #[async_trait]
    impl SystemConfigStore for MockConfig {
        async fn get_string(&self, key: &str) -> AppResult<Option<String>> {
            Ok(self.entries.get(key).cloned())
        }

        async fn get_int(&self, key: &str) -> AppResult<Option<i64>> {
            Ok(self.entries.get(key).and_then(|v| v.parse().ok()))
        }
    }

    // ========== FIXTURES ==========

    fn transaction() -> CreditTransaction {
        CreditTransaction {
            id: Uuid::new_v4(),
            user_id: "user-1".to_string(),
            feature_tag: "AI_CHAT".to_string(),
            provider: Some("anthropic".to_string()),
            model_id: Some("claude-3".to_string()),
            input_tokens: None,
            output_tokens: None,
            credits_deducted: None,
            billing_mode: None,
            estimated: false,
            status: TransactionStatus::Pending,
            error_message: None,
            trace_id: Some("t-1".to_string()),
            created_at: Some(Utc::now()),
            updated_at: Utc::now(),
        }
    }

    fn trace_with_usage(input: i32, output: i32) -> LlmTrace {
        LlmTrace {
            trace_id: "t-1".to_string(),
            provider: None,
            model: None,
            request: TraceRequest::default(),
            response: Some(TraceResponse {
                message: None,
                metadata: TraceMetadata {
                    token_usage: Some(TokenUsage {
                        input_token_count: Some(input),
                        output_token_count: Some(output),
                    }),
                    ..Default::default()
                },
            }),
        }
    }

    struct Harness {
        transactions: Arc<MockTransactionStore>,
        ledger: Arc<MockLedger>,
        engine: CompensationEngine,
    }

    fn harness(
        transactions: MockTransactionStore,
        traces: MockTraceStore,
        ledger: MockLedger,
        config: MockConfig,
    ) -> Harness {
        let transactions = Arc::new(transactions);
        let ledger = Arc::new(ledger);
        let engine = CompensationEngine::new(
            transactions.clone(),
            Arc::new(traces),
            ledger.clone(),
            Arc::new(config),
        )
        .with_retry_policy(RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            jitter: 0.0,
        });

        Harness {
            transactions,
            ledger,
            engine,
        }
    }

    // ========== PIPELINE TESTS ==========

    #[tokio::test]
    async fn blank_user_id_is_parked_invalid_without_ledger_call() {
        let mut tx = transaction();
        tx.user_id = "  ".to_string();

        let h = harness(
            MockTransactionStore::default(),
            MockTraceStore::empty(),
            MockLedger::succeeding(),
            MockConfig::default(),
        );

        let outcome = h.engine.process(tx).await.unwrap();
        assert_eq!(outcome, CompensationOutcome::Invalid);
        assert!(h.ledger.calls().is_empty());

        let saved = h.transactions.last_saved();
        assert_eq!(saved.status, TransactionStatus::Invalid);
        assert!(saved.error_message.unwrap().contains("required fields"));
    }

    #[tokio::test]
    async fn unknown_feature_tag_fails_without_ledger_call() {
        let mut tx = transaction();
        tx.feature_tag = "HOLOGRAM_RENDERING".to_string();

        let h = harness(
            MockTransactionStore::default(),
            MockTraceStore::empty(),
            MockLedger::succeeding(),
            MockConfig::default(),
        );

        let outcome = h.engine.process(tx).await.unwrap();
        assert_eq!(outcome, CompensationOutcome::UnknownFeature);
        assert!(h.ledger.calls().is_empty());
        assert_eq!(h.transactions.last_saved().status, TransactionStatus::Failed);
    }

    #[tokio::test]
    async fn stored_tokens_are_used_verbatim() {
        let mut tx = transaction();
        tx.input_tokens = Some(100);
        tx.output_tokens = Some(50);

        // Trace with wildly different usage must be ignored
        let h = harness(
            MockTransactionStore::default(),
            MockTraceStore::with_trace(trace_with_usage(9000, 9000)),
            MockLedger::succeeding(),
            MockConfig::default(),
        );

        let outcome = h.engine.process(tx).await.unwrap();
        assert_eq!(outcome, CompensationOutcome::Compensated);

        let calls = h.ledger.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].input_tokens, 100);
        assert_eq!(calls[0].output_tokens, 50);

        let saved = h.transactions.last_saved();
        assert_eq!(saved.status, TransactionStatus::Compensated);
        assert_eq!(saved.billing_mode, Some(BillingMode::Actual));
        assert!(!saved.estimated);
        assert_eq!(saved.credits_deducted, Some(dec!(1.25)));
    }

    #[tokio::test]
    async fn estimation_fallback_produces_estimated_billing() {
        let tx = transaction(); // zero stored tokens

        let trace = LlmTrace {
            trace_id: "t-1".to_string(),
            provider: None,
            model: None,
            request: TraceRequest {
                messages: vec![
                    TraceMessage {
                        role: Some("system".to_string()),
                        content: Some("a".repeat(100)),
                    },
                    TraceMessage {
                        role: Some("user".to_string()),
                        content: Some("b".repeat(150)),
                    },
                ],
                ..Default::default()
            },
            response: None,
        };

        let h = harness(
            MockTransactionStore::default(),
            MockTraceStore::with_trace(trace),
            MockLedger::succeeding(),
            MockConfig::default(),
        );

        let outcome = h.engine.process(tx).await.unwrap();
        assert_eq!(outcome, CompensationOutcome::Compensated);

        let calls = h.ledger.calls();
        assert_eq!(calls[0].input_tokens, 100);
        // AI_CHAT multiplier 0.8 over the 100-token input estimate
        assert_eq!(calls[0].output_tokens, 80);

        let saved = h.transactions.last_saved();
        assert_eq!(saved.billing_mode, Some(BillingMode::Estimated));
        assert!(saved.estimated);
        assert_eq!(saved.input_tokens, Some(100));
        assert_eq!(saved.output_tokens, Some(80));
    }

    #[tokio::test]
    async fn missing_trace_with_no_tokens_is_usage_unavailable() {
        let mut tx = transaction();
        tx.trace_id = None;

        // No stored tokens, no trace: input floors at 1, so reconstruction
        // still succeeds. Force the hard-failure path with an empty-usage
        // trace instead.
        let h = harness(
            MockTransactionStore::default(),
            MockTraceStore::with_trace(trace_with_usage(0, 0)),
            MockLedger::succeeding(),
            MockConfig::default(),
        );
        tx.trace_id = Some("t-1".to_string());

        let outcome = h.engine.process(tx).await.unwrap();
        assert_eq!(outcome, CompensationOutcome::UsageUnavailable);
        assert!(h.ledger.calls().is_empty());

        let saved = h.transactions.last_saved();
        assert_eq!(saved.status, TransactionStatus::Failed);
        assert!(saved.error_message.unwrap().contains("token usage"));
    }

    #[tokio::test]
    async fn structured_insufficient_funds_parks_as_no_funds() {
        let mut tx = transaction();
        tx.input_tokens = Some(10);
        tx.output_tokens = Some(10);

        let h = harness(
            MockTransactionStore::default(),
            MockTraceStore::empty(),
            MockLedger::with_outcome(DeductionOutcome::InsufficientFunds {
                message: "insufficient credits: required 1, available 0".to_string(),
            }),
            MockConfig::default(),
        );

        let outcome = h.engine.process(tx).await.unwrap();
        assert_eq!(outcome, CompensationOutcome::NoFunds);
        assert_eq!(h.transactions.last_saved().status, TransactionStatus::NoFunds);
    }

    #[tokio::test]
    async fn chinese_insufficient_funds_text_is_classified() {
        let mut tx = transaction();
        tx.input_tokens = Some(10);
        tx.output_tokens = Some(10);

        // Ledger reports a generic failure whose text carries the phrase
        let h = harness(
            MockTransactionStore::default(),
            MockTraceStore::empty(),
            MockLedger::with_outcome(DeductionOutcome::Failed {
                message: "扣费失败：积分余额不足".to_string(),
            }),
            MockConfig::default(),
        );

        let outcome = h.engine.process(tx).await.unwrap();
        assert_eq!(outcome, CompensationOutcome::NoFunds);
        assert_eq!(h.transactions.last_saved().status, TransactionStatus::NoFunds);
    }

    #[tokio::test]
    async fn other_ledger_failures_persist_failed_and_propagate() {
        let mut tx = transaction();
        tx.input_tokens = Some(10);
        tx.output_tokens = Some(10);

        let h = harness(
            MockTransactionStore::default(),
            MockTraceStore::empty(),
            MockLedger::with_outcome(DeductionOutcome::Failed {
                message: "ledger timeout".to_string(),
            }),
            MockConfig::default(),
        );

        let err = h.engine.process(tx).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(h.transactions.last_saved().status, TransactionStatus::Failed);
    }

    #[tokio::test]
    async fn duplicate_trace_id_falls_back_to_first_match() {
        let tx = transaction();

        let mut traces = MockTraceStore::with_trace(trace_with_usage(42, 17));
        traces.duplicate_ids.push("t-1".to_string());

        let h = harness(
            MockTransactionStore::default(),
            traces,
            MockLedger::succeeding(),
            MockConfig::default(),
        );

        let outcome = h.engine.process(tx).await.unwrap();
        assert_eq!(outcome, CompensationOutcome::Compensated);

        // Usage came from the fallback trace record
        let calls = h.ledger.calls();
        assert_eq!(calls[0].input_tokens, 42);
        assert_eq!(calls[0].output_tokens, 17);
    }

    #[tokio::test]
    async fn provider_and_model_are_backfilled_from_trace() {
        let mut tx = transaction();
        tx.provider = None;
        tx.model_id = None;
        tx.input_tokens = Some(10);
        tx.output_tokens = Some(10);

        let mut trace = trace_with_usage(1, 1);
        trace.provider = Some("gemini".to_string());
        trace.model = Some("gemini-pro".to_string());

        let h = harness(
            MockTransactionStore::default(),
            MockTraceStore::with_trace(trace),
            MockLedger::succeeding(),
            MockConfig::default(),
        );

        h.engine.process(tx).await.unwrap();

        let calls = h.ledger.calls();
        assert_eq!(calls[0].provider.as_deref(), Some("gemini"));
        assert_eq!(calls[0].model_id.as_deref(), Some("gemini-pro"));

        let saved = h.transactions.last_saved();
        assert_eq!(saved.provider.as_deref(), Some("gemini"));
        assert_eq!(saved.model_id.as_deref(), Some("gemini-pro"));
    }

    // ========== SWEEP TESTS ==========

    #[test]
    fn report_tally_survives_a_poisoned_lock() {
        let report = Mutex::new(SweepReport::default());

        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = report.lock().unwrap();
            panic!("holder died");
        }));
        assert!(report.is_poisoned());

        // Counters must still be reachable and consistent
        tally(&report).scanned += 1;
        assert_eq!(tally(&report).scanned, 1);
        assert_eq!(
            report.into_inner().unwrap_or_else(PoisonError::into_inner).scanned,
            1
        );
    }

    #[tokio::test]
    async fn terminal_transactions_are_never_re_processed() {
        let mut compensated = transaction();
        compensated.status = TransactionStatus::Compensated;
        let mut invalid = transaction();
        invalid.status = TransactionStatus::Invalid;
        let mut no_funds = transaction();
        no_funds.status = TransactionStatus::NoFunds;

        let h = harness(
            MockTransactionStore::with_transactions(vec![compensated, invalid, no_funds]),
            MockTraceStore::empty(),
            MockLedger::succeeding(),
            MockConfig::default(),
        );

        let report = h.engine.run_sweep().await.unwrap();
        assert_eq!(report.scanned, 0);
        assert!(h.ledger.calls().is_empty());
        assert_eq!(h.transactions.saved_count(), 0);
    }

    #[tokio::test]
    async fn window_excludes_old_candidates_but_keeps_undated_ones() {
        let mut old = transaction();
        old.input_tokens = Some(10);
        old.output_tokens = Some(10);
        old.created_at = Some(Utc::now() - ChronoDuration::hours(48));

        let mut undated = transaction();
        undated.input_tokens = Some(10);
        undated.output_tokens = Some(10);
        undated.created_at = None;

        let mut recent = transaction();
        recent.input_tokens = Some(10);
        recent.output_tokens = Some(10);

        let h = harness(
            MockTransactionStore::with_transactions(vec![old, undated, recent]),
            MockTraceStore::empty(),
            MockLedger::succeeding(),
            MockConfig::with_entry(keys::BILLING_PROCESS_SINCE_HOURS, "24"),
        );

        let report = h.engine.run_sweep().await.unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.compensated, 2);
        assert_eq!(h.ledger.calls().len(), 2);
    }

    #[tokio::test]
    async fn one_failing_candidate_does_not_abort_the_sweep() {
        let mut failing = transaction();
        failing.input_tokens = Some(10);
        failing.output_tokens = Some(10);
        failing.user_id = "broke-user".to_string();

        let mut invalid = transaction();
        invalid.user_id = String::new();

        let h = harness(
            MockTransactionStore::with_transactions(vec![failing, invalid]),
            MockTraceStore::empty(),
            MockLedger::with_outcome(DeductionOutcome::Failed {
                message: "ledger timeout".to_string(),
            }),
            MockConfig::default(),
        );

        let report = h.engine.run_sweep().await.unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.invalid, 1);

        // The transient candidate was retried to exhaustion
        assert_eq!(h.ledger.calls().len(), 3);
    }
}
