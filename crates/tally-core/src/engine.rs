//! The ballot engine: intake, adjudication, review and tallying.
//!
//! Work for one ballot is serialized by a per-ballot async lock, so duplicate
//! submissions or duplicate review decisions racing each other cannot produce
//! two results. Distinct ballots proceed in parallel.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tally_state::fakes::{MemoryCasStore, MemoryRecordLog, MemoryTallyLedger};
use tally_state::{BallotId, CasStore, RecordLog, TallyLedger};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, instrument};

use crate::config::{ConfigError, EngineConfig};
use crate::domain::{
    BallotResult, BallotStatus, BallotTemplate, ReadingRef, Result, ResultStatus, TallyError,
};
use crate::ingest::ingest;
use crate::metrics::METRICS;
use crate::obs::{self, BallotSpan};
use crate::orchestrator::StrategyOrchestrator;
use crate::reconcile::{reconcile, ReconcilePolicy};
use crate::repository::{BallotRepository, IntakeEvent};
use crate::review::{EvidenceBundle, ReviewDecision, ReviewItem, ReviewOutcome, ReviewQueue};
use crate::strategy::StrategyRegistry;
use crate::tally::{project, project_results, TallyAggregator, TallyProjection};

/// Backing stores for an engine.
#[derive(Clone)]
pub struct EngineStores {
    pub cas: Arc<dyn CasStore>,
    pub records: Arc<dyn RecordLog>,
    pub ledger: Arc<dyn TallyLedger>,
}

impl EngineStores {
    pub fn in_memory() -> Self {
        Self {
            cas: Arc::new(MemoryCasStore::new()),
            records: Arc::new(MemoryRecordLog::new()),
            ledger: Arc::new(MemoryTallyLedger::new()),
        }
    }
}

/// A scanned ballot handed to the engine.
#[derive(Debug, Clone)]
pub struct BallotSubmission {
    /// Raw image bytes as produced by the scanner.
    pub image: Vec<u8>,
    pub template_id: String,
    pub precinct: String,
}

impl BallotSubmission {
    pub fn new(
        image: Vec<u8>,
        template_id: impl Into<String>,
        precinct: impl Into<String>,
    ) -> Self {
        Self {
            image,
            template_id: template_id.into(),
            precinct: precinct.into(),
        }
    }

    pub fn ballot_id(&self) -> BallotId {
        BallotId::from_image_bytes(&self.image)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionReceipt {
    pub ballot_id: BallotId,
    pub status: BallotStatus,
    /// The image had been submitted before; nothing was reprocessed.
    pub duplicate: bool,
}

/// Current tally plus what still blocks it from being final.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TallySnapshot {
    pub projection: TallyProjection,
    pub needs_rescan: usize,
    pub flagged_pending: usize,
    pub processing: usize,
    /// No ballot is waiting on a rescan, a reviewer or processing.
    pub complete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetallyReport {
    pub ledger_digest: String,
    pub results_digest: String,
    /// Ledger increments that were missing and have been appended.
    pub repaired: usize,
    pub ballots: usize,
    pub consistent: bool,
}

/// One async lock per ballot id.
#[derive(Default)]
struct BallotLocks {
    inner: Mutex<HashMap<BallotId, Arc<tokio::sync::Mutex<()>>>>,
}

impl BallotLocks {
    async fn lock(&self, ballot_id: &BallotId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(ballot_id.clone()).or_default())
        };
        lock.lock_owned().await
    }

    /// Lock two ballots, always in id order, so crossed pairs cannot deadlock.
    async fn lock_pair(
        &self,
        a: &BallotId,
        b: &BallotId,
    ) -> (OwnedMutexGuard<()>, Option<OwnedMutexGuard<()>>) {
        if a == b {
            return (self.lock(a).await, None);
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        let first = self.lock(first).await;
        let second = self.lock(second).await;
        (first, Some(second))
    }
}

pub struct BallotEngine {
    config: EngineConfig,
    templates: HashMap<String, Arc<BallotTemplate>>,
    orchestrator: StrategyOrchestrator,
    policy: ReconcilePolicy,
    cas: Arc<dyn CasStore>,
    repository: BallotRepository,
    review: ReviewQueue,
    aggregator: TallyAggregator,
    locks: BallotLocks,
}

impl BallotEngine {
    /// Build an engine. Any configuration problem is fatal here.
    pub fn new(
        config: EngineConfig,
        registry: &StrategyRegistry,
        templates: Vec<BallotTemplate>,
        stores: EngineStores,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let active = registry.resolve(&config)?;

        let mut by_id = HashMap::new();
        for template in templates {
            template.validate()?;
            let id = template.id.clone();
            if by_id.insert(id.clone(), Arc::new(template)).is_some() {
                return Err(ConfigError::InvalidTemplate {
                    template: id,
                    reason: "template id registered twice".to_string(),
                });
            }
        }

        let policy = config.policy();
        let repository = BallotRepository::new(stores.records);
        info!(
            strategies = active.len(),
            templates = by_id.len(),
            quorum = config.quorum,
            "ballot engine ready"
        );

        Ok(Self {
            orchestrator: StrategyOrchestrator::new(active, config.quorum),
            review: ReviewQueue::new(repository.clone(), policy.clone()),
            aggregator: TallyAggregator::new(stores.ledger),
            cas: stores.cas,
            repository,
            policy,
            templates: by_id,
            config,
            locks: BallotLocks::default(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn template(&self, template_id: &str) -> Result<Arc<BallotTemplate>> {
        self.templates
            .get(template_id)
            .cloned()
            .ok_or_else(|| TallyError::UnknownTemplate(template_id.to_string()))
    }

    /// Submit a scanned ballot.
    ///
    /// Resubmitting an image already seen returns its current status and
    /// does not reprocess it.
    #[instrument(
        skip_all,
        fields(precinct = %submission.precinct, template = %submission.template_id)
    )]
    pub async fn submit(&self, submission: BallotSubmission) -> Result<SubmissionReceipt> {
        let template = self.template(&submission.template_id)?;
        let ballot_id = submission.ballot_id();
        let _guard = self.locks.lock(&ballot_id).await;
        self.process(&ballot_id, &submission, &template, None).await
    }

    /// Submit a rescan of a ballot whose image was rejected.
    ///
    /// Once the rescan is admitted the original is marked superseded.
    #[instrument(skip_all, fields(original = %original.short()))]
    pub async fn submit_rescan(
        &self,
        original: &BallotId,
        submission: BallotSubmission,
    ) -> Result<SubmissionReceipt> {
        let template = self.template(&submission.template_id)?;
        let ballot_id = submission.ballot_id();
        let _guards = self.locks.lock_pair(original, &ballot_id).await;

        match self.repository.status(original).await? {
            None => return Err(TallyError::BallotNotFound(original.clone())),
            Some(BallotStatus::NeedsRescan { .. }) => {}
            Some(_) => return Err(TallyError::NotAwaitingRescan(original.clone())),
        }

        if &ballot_id == original {
            // The same bytes again: still unreadable.
            return self.duplicate_receipt(&ballot_id).await;
        }

        let receipt = self
            .process(&ballot_id, &submission, &template, Some(original.clone()))
            .await?;

        let admitted =
            !receipt.duplicate && !matches!(receipt.status, BallotStatus::NeedsRescan { .. });
        if admitted {
            self.repository
                .record_intake(original, &IntakeEvent::Superseded { by: ballot_id.clone() })
                .await?;
            info!(by = %ballot_id.short(), "original ballot superseded");
        }
        Ok(receipt)
    }

    async fn duplicate_receipt(&self, ballot_id: &BallotId) -> Result<SubmissionReceipt> {
        let status = self
            .repository
            .status(ballot_id)
            .await?
            .ok_or_else(|| TallyError::BallotNotFound(ballot_id.clone()))?;
        Ok(SubmissionReceipt {
            ballot_id: ballot_id.clone(),
            status,
            duplicate: true,
        })
    }

    /// Intake, orchestration, reconciliation and tallying for one ballot.
    /// The caller holds the ballot lock.
    async fn process(
        &self,
        ballot_id: &BallotId,
        submission: &BallotSubmission,
        template: &Arc<BallotTemplate>,
        rescan_of: Option<BallotId>,
    ) -> Result<SubmissionReceipt> {
        let resuming = match self.repository.status(ballot_id).await? {
            None => false,
            // Intake recorded but no result: an earlier run stopped midway.
            Some(BallotStatus::Processing) => true,
            Some(status) => {
                if let Some(result) = self.repository.latest_result(ballot_id).await? {
                    if result.status.is_countable() {
                        self.aggregator.record(&result).await?;
                    }
                }
                debug!(status = %status, "duplicate submission");
                return Ok(SubmissionReceipt {
                    ballot_id: ballot_id.clone(),
                    status,
                    duplicate: true,
                });
            }
        };

        if !resuming {
            METRICS.inc_submitted();
            obs::emit_ballot_submitted(ballot_id, &submission.precinct, &template.id);
        }

        let image = match ingest(
            &submission.image,
            ballot_id,
            &submission.precinct,
            template,
            &self.config.ingest,
            self.cas.as_ref(),
        )
        .await
        {
            Ok(image) => image,
            Err(TallyError::ImageQuality { source, .. }) => {
                obs::emit_rescan_required(ballot_id, &source);
                METRICS.inc_rescans();
                let status = BallotStatus::NeedsRescan {
                    reason: source.to_string(),
                };
                self.repository
                    .record_intake(
                        ballot_id,
                        &IntakeEvent::RescanRequired {
                            precinct: submission.precinct.clone(),
                            template_id: template.id.clone(),
                            problem: source,
                        },
                    )
                    .await?;
                return Ok(SubmissionReceipt {
                    ballot_id: ballot_id.clone(),
                    status,
                    duplicate: false,
                });
            }
            Err(e) => return Err(e),
        };

        if !resuming {
            self.repository
                .record_intake(
                    ballot_id,
                    &IntakeEvent::Admitted {
                        precinct: submission.precinct.clone(),
                        template_id: template.id.clone(),
                        image_digest: image.image_digest.clone(),
                        rescan_of,
                    },
                )
                .await?;
        }

        let outcome = self
            .orchestrator
            .run(Arc::new(image), Arc::clone(template))
            .await;
        for reading in &outcome.readings {
            self.repository.append_reading(reading).await?;
        }
        for abstention in &outcome.abstentions {
            self.repository.append_abstention(ballot_id, abstention).await?;
        }

        let result = {
            let _span = BallotSpan::enter(ballot_id);
            if outcome.has_quorum() {
                reconcile(
                    ballot_id,
                    &submission.precinct,
                    template,
                    &outcome.readings,
                    &self.policy,
                )?
            } else {
                let refs = outcome
                    .readings
                    .iter()
                    .map(|r| r.reference())
                    .collect::<serde_json::Result<Vec<ReadingRef>>>()?;
                BallotResult::insufficient_data(
                    ballot_id.clone(),
                    submission.precinct.clone(),
                    template,
                    refs,
                    outcome.quorum,
                )
            }
        };

        self.repository.append_result(&result).await?;
        match result.status {
            ResultStatus::Accepted => {
                METRICS.inc_accepted();
                self.aggregator.record(&result).await?;
            }
            ResultStatus::Flagged => METRICS.inc_flagged(),
            ResultStatus::Overridden => {}
        }
        obs::emit_ballot_adjudicated(
            ballot_id,
            result.status,
            result.flag_reason,
            outcome.readings.len(),
        );

        Ok(SubmissionReceipt {
            ballot_id: ballot_id.clone(),
            status: result.ballot_status(),
            duplicate: false,
        })
    }

    pub async fn status(&self, ballot_id: &BallotId) -> Result<BallotStatus> {
        self.repository
            .status(ballot_id)
            .await?
            .ok_or_else(|| TallyError::BallotNotFound(ballot_id.clone()))
    }

    pub async fn evidence(&self, ballot_id: &BallotId) -> Result<EvidenceBundle> {
        self.review.evidence(ballot_id).await
    }

    /// Normalized ballot image, as stored at intake.
    pub async fn image(&self, ballot_id: &BallotId) -> Result<Vec<u8>> {
        match self.repository.admission(ballot_id).await? {
            Some(IntakeEvent::Admitted { image_digest, .. }) => {
                Ok(self.cas.get(&image_digest).await?)
            }
            _ => Err(TallyError::BallotNotFound(ballot_id.clone())),
        }
    }

    pub async fn pending_reviews(&self) -> Result<Vec<ReviewItem>> {
        self.review.pending().await
    }

    /// Apply a reviewer decision to a flagged ballot.
    #[instrument(skip_all, fields(ballot_id = %ballot_id.short(), reviewer = %decision.reviewer))]
    pub async fn submit_review(
        &self,
        ballot_id: &BallotId,
        decision: &ReviewDecision,
    ) -> Result<ReviewOutcome> {
        let _guard = self.locks.lock(ballot_id).await;
        let current = self
            .repository
            .latest_result(ballot_id)
            .await?
            .ok_or_else(|| TallyError::BallotNotFound(ballot_id.clone()))?;
        let template = self.template(&current.template_id)?;

        let outcome = self.review.decide(&template, ballot_id, decision).await?;
        match &outcome {
            ReviewOutcome::Applied(result) => {
                METRICS.inc_overridden();
                obs::emit_ballot_overridden(ballot_id, &decision.reviewer, result.version);
                self.aggregator.record(result).await?;
            }
            ReviewOutcome::AlreadyApplied(result) => {
                self.aggregator.record(result).await?;
            }
        }
        Ok(outcome)
    }

    /// Replay the ledger and summarize what is still outstanding.
    pub async fn tally_snapshot(&self) -> Result<TallySnapshot> {
        let projection = self.aggregator.replay().await?;
        let statuses = self.repository.all_statuses().await?;

        let mut snapshot = TallySnapshot {
            projection,
            needs_rescan: 0,
            flagged_pending: 0,
            processing: 0,
            complete: false,
        };
        for status in statuses.values() {
            match status {
                BallotStatus::NeedsRescan { .. } => snapshot.needs_rescan += 1,
                BallotStatus::Flagged { .. } => snapshot.flagged_pending += 1,
                BallotStatus::Processing => snapshot.processing += 1,
                _ => {}
            }
        }
        snapshot.complete =
            snapshot.needs_rescan == 0 && snapshot.flagged_pending == 0 && snapshot.processing == 0;
        Ok(snapshot)
    }

    /// Rebuild the tally from stored results and check it against the ledger.
    ///
    /// Counted results missing from the ledger are appended. Safe to run any
    /// number of times, including while ballots are still being submitted:
    /// ledger entries for ballots counted after the results were read are
    /// left out of the comparison.
    #[instrument(skip_all)]
    pub async fn retally(&self) -> Result<RetallyReport> {
        let results = self.repository.latest_results().await?;
        let expected = project_results(&results);
        let counted: BTreeSet<&BallotId> = results
            .iter()
            .filter(|r| r.status.is_countable())
            .map(|r| &r.ballot_id)
            .collect();

        let mut repaired = 0;
        for result in results.iter().filter(|r| r.status.is_countable()) {
            repaired += self.aggregator.record(result).await?.appended;
        }

        let mut entries = self.aggregator.entries().await?;
        let unseen: BTreeSet<BallotId> = entries
            .iter()
            .filter(|e| !counted.contains(&e.ballot_id))
            .map(|e| e.ballot_id.clone())
            .collect();
        let mut counted_since = BTreeSet::new();
        for ballot_id in unseen {
            // A ballot the ledger counts without a countable result stays in
            // the comparison and shows up as a mismatch.
            let countable = self
                .repository
                .latest_result(&ballot_id)
                .await?
                .is_some_and(|r| r.status.is_countable());
            if countable {
                counted_since.insert(ballot_id);
            }
        }
        if !counted_since.is_empty() {
            debug!(ballots = counted_since.len(), "ignoring ballots counted during retally");
            entries.retain(|e| !counted_since.contains(&e.ballot_id));
        }

        let replayed = project(&entries);
        let consistent = replayed.digest == expected.digest;

        obs::emit_retallied(results.len(), repaired, consistent);
        Ok(RetallyReport {
            ledger_digest: replayed.digest,
            results_digest: expected.digest,
            repaired,
            ballots: results.len(),
            consistent,
        })
    }
}
