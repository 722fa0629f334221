//! Pipeline orchestration.
//!
//! For every entity the periods with enough text are ordered and paired
//! consecutively. Each pair is either served whole from the cache or run as
//! one unit of work: all sections compared in parallel, then cross
//! validation, then the optional market check. Units run concurrently up to
//! the worker limit. Once every unit has finished the records are
//! deduplicated globally and aggregated per pair.

use chrono::Utc;
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use disclosure_common::logging::generate_run_id;
use disclosure_common::util::char_len;

use crate::aggregator::{NarrativeSynthesizer, SignalAggregator};
use crate::anomaly::{Anomaly, AnomalyDetector};
use crate::cache::{fingerprint, global_dedup, ChangeCache};
use crate::capability::{ExtractionCapability, SearchCapability, Usage};
use crate::comparator::{SectionComparator, SectionSkip};
use crate::facts::FactStore;
use crate::market::{MarketOutcome, MarketValidator};
use crate::ordering::{ChronologicalOrdering, PeriodOrdering};
use crate::regime::{KeywordRegimeClassifier, RegimePolicy};
use crate::report::{validation_score, PairReport, Report, RunStats, SkipEntry};
use crate::settings::PipelineSettings;
use crate::types::{ChangeRecord, Corpus, PairContext, Section};
use crate::validator::CrossValidator;

/// Cooperative cancellation flag shared with running units.
///
/// Units already in flight finish; units not yet started are skipped.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Section texts of one pair, in required-section order.
type PairTexts = Vec<(Section, String, String)>;

/// Result of one unit of work.
struct UnitOutput {
    pair: PairContext,
    records: Vec<ChangeRecord>,
    skips: Vec<SkipEntry>,
    capability_failures: usize,
    market: Option<MarketOutcome>,
    cancelled: bool,
}

impl UnitOutput {
    fn cancelled(pair: PairContext) -> Self {
        Self {
            pair,
            records: Vec::new(),
            skips: Vec::new(),
            capability_failures: 0,
            market: None,
            cancelled: true,
        }
    }
}

/// Everything a unit of work needs, cheaply cloneable into a task.
#[derive(Clone)]
struct UnitRunner {
    comparator: SectionComparator,
    validator: CrossValidator,
    market: Option<MarketValidator>,
}

impl UnitRunner {
    async fn run(&self, pair: PairContext, texts: PairTexts, anomalies: Arc<Vec<Anomaly>>) -> UnitOutput {
        let comparisons = texts.iter().map(|(section, prev, curr)| {
            self.comparator.try_compare(&pair, *section, prev, curr)
        });
        let results = join_all(comparisons).await;

        let mut records = Vec::new();
        let mut skips = Vec::new();
        let mut capability_failures = 0;

        for ((section, _, _), result) in texts.iter().zip(results) {
            match result {
                Ok(section_records) => records.extend(section_records),
                Err(skip) => {
                    if skip.is_capability_failure() {
                        capability_failures += 1;
                    }
                    skips.push(section_skip(&pair, *section, &skip));
                }
            }
        }

        // Validation only starts once every section of the pair is back.
        let (source_prev, source_curr) = joined_sources(&texts);
        let outcome = self
            .validator
            .validate_detailed(records, &source_prev, &source_curr, &anomalies)
            .await;
        if outcome.capability_error.is_some() {
            capability_failures += 1;
        }
        let mut records = outcome.records;

        let market = match &self.market {
            Some(market) => Some(market.validate(&mut records).await),
            None => None,
        };
        if market.as_ref().is_some_and(|m| m.error.is_some()) {
            capability_failures += 1;
        }

        UnitOutput {
            pair,
            records,
            skips,
            capability_failures,
            market,
            cancelled: false,
        }
    }
}

fn section_skip(pair: &PairContext, section: Section, skip: &SectionSkip) -> SkipEntry {
    SkipEntry {
        entity: pair.entity.clone(),
        quarter_prev: Some(pair.quarter_prev.clone()),
        quarter_curr: Some(pair.quarter_curr.clone()),
        section: Some(section),
        reason: skip.to_string(),
    }
}

/// Concatenate section texts into one labelled source per period.
fn joined_sources(texts: &PairTexts) -> (String, String) {
    let mut prev = String::new();
    let mut curr = String::new();
    for (section, p, c) in texts {
        prev.push_str(&format!("[{}]\n{}\n\n", section, p));
        curr.push_str(&format!("[{}]\n{}\n\n", section, c));
    }
    (prev, curr)
}

/// Section texts of one period keyed by section, unknown labels dropped.
fn period_sections(raw: &BTreeMap<String, String>) -> HashMap<Section, &str> {
    raw.iter()
        .filter_map(|(label, text)| label.parse::<Section>().ok().map(|s| (s, text.as_str())))
        .collect()
}

/// Runs the whole pipeline over a corpus.
pub struct PipelineOrchestrator {
    settings: Arc<PipelineSettings>,
    extraction: Arc<dyn ExtractionCapability>,
    policy: Arc<dyn RegimePolicy>,
    ordering: Arc<dyn PeriodOrdering>,
    search: Option<Arc<dyn SearchCapability>>,
    cache: Arc<ChangeCache>,
    facts: Arc<FactStore>,
    cancel: CancelHandle,
}

impl PipelineOrchestrator {
    /// Orchestrator with keyword regime classification and chronological
    /// period ordering.
    pub fn new(
        settings: Arc<PipelineSettings>,
        extraction: Arc<dyn ExtractionCapability>,
        cache: Arc<ChangeCache>,
        facts: Arc<FactStore>,
    ) -> Self {
        Self {
            settings,
            extraction,
            policy: Arc::new(KeywordRegimeClassifier::default()),
            ordering: Arc::new(ChronologicalOrdering),
            search: None,
            cache,
            facts,
            cancel: CancelHandle::default(),
        }
    }

    pub fn with_regime_policy(mut self, policy: Arc<dyn RegimePolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_ordering(mut self, ordering: Arc<dyn PeriodOrdering>) -> Self {
        self.ordering = ordering;
        self
    }

    /// Enable the market check. Only used when the settings allow it.
    pub fn with_search(mut self, search: Arc<dyn SearchCapability>) -> Self {
        self.search = Some(search);
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cache(&self) -> &Arc<ChangeCache> {
        &self.cache
    }

    fn runner(&self) -> UnitRunner {
        let market = match (&self.search, self.settings.market_enabled) {
            (Some(search), true) => Some(MarketValidator::new(search.clone(), self.settings.clone())),
            _ => None,
        };
        UnitRunner {
            comparator: SectionComparator::new(
                self.extraction.clone(),
                self.policy.clone(),
                self.settings.clone(),
            ),
            validator: CrossValidator::new(self.extraction.clone(), self.policy.clone(), self.settings.clone()),
            market,
        }
    }

    /// Ordered periods of an entity with at least one section long enough
    /// to compare.
    fn eligible_periods(
        &self,
        entity: &str,
        periods: &BTreeMap<String, BTreeMap<String, String>>,
        skipped: &mut Vec<SkipEntry>,
    ) -> Vec<String> {
        let min = self.settings.min_section_length;
        let mut eligible = Vec::new();

        for (period, raw) in periods {
            let sections = period_sections(raw);
            let has_content = self.settings.sections.iter().any(|s| {
                sections
                    .get(s)
                    .is_some_and(|text| char_len(text.trim()) >= min)
            });
            if has_content {
                eligible.push(period.clone());
            } else {
                info!(entity, period = %period, "Period excluded: no section meets the minimum length");
                skipped.push(SkipEntry {
                    entity: entity.to_string(),
                    quarter_prev: None,
                    quarter_curr: Some(period.clone()),
                    section: None,
                    reason: format!("no section with at least {} characters", min),
                });
            }
        }

        self.ordering.sort(&mut eligible);
        eligible
    }

    /// Run the pipeline over `corpus` (entity → period → section → text).
    pub async fn run(&self, corpus: &Corpus) -> Report {
        let run_id = generate_run_id();
        let usage_start = self.extraction.usage();
        info!(run_id = %run_id, entities = corpus.len(), "Pipeline run started");

        let mut skipped = Vec::new();
        let mut stats = RunStats::default();

        // Anomalies come first: cross validation checks claims against them.
        let mut anomalies_by_entity: BTreeMap<String, Arc<Vec<Anomaly>>> = BTreeMap::new();
        let detector = AnomalyDetector::new(self.ordering.clone());
        for entity in corpus.keys() {
            let facts = self.facts.facts_for(entity).await;
            let anomalies = detector.detect_structured(&facts);
            if !anomalies.is_empty() {
                info!(entity = %entity, count = anomalies.len(), "Numeric anomalies detected");
            }
            anomalies_by_entity.insert(entity.clone(), Arc::new(anomalies));
        }

        // Plan: consecutive pairs, split into cache hits and units to run.
        let mut plan: Vec<PairContext> = Vec::new();
        let mut cached: HashMap<PairContext, Vec<ChangeRecord>> = HashMap::new();
        let mut pending: Vec<(PairContext, PairTexts)> = Vec::new();

        for (entity, periods) in corpus {
            let eligible = self.eligible_periods(entity, periods, &mut skipped);
            if eligible.len() < 2 {
                info!(entity = %entity, periods = eligible.len(), "Entity skipped: fewer than two comparable periods");
                skipped.push(SkipEntry {
                    entity: entity.clone(),
                    quarter_prev: None,
                    quarter_curr: None,
                    section: None,
                    reason: format!("{} period(s) with sufficient text, need at least 2", eligible.len()),
                });
                continue;
            }

            for window in eligible.windows(2) {
                let pair = PairContext::new(entity, &window[0], &window[1]);
                plan.push(pair.clone());

                if let Some(records) = self.cache.get_pair(&pair) {
                    info!(pair = %pair, records = records.len(), "Cache hit");
                    cached.insert(pair, records);
                    continue;
                }

                let prev = period_sections(&periods[&window[0]]);
                let curr = period_sections(&periods[&window[1]]);
                let texts: PairTexts = self
                    .settings
                    .sections
                    .iter()
                    .map(|s| {
                        (
                            *s,
                            prev.get(s).copied().unwrap_or_default().to_string(),
                            curr.get(s).copied().unwrap_or_default().to_string(),
                        )
                    })
                    .collect();
                pending.push((pair, texts));
            }
        }

        stats.pairs_total = plan.len();
        stats.cache_hits = cached.len();

        // Fan out.
        let runner = self.runner();
        let semaphore = Arc::new(Semaphore::new(self.settings.worker_limit));
        let mut join_set: JoinSet<UnitOutput> = JoinSet::new();

        for (pair, texts) in pending.iter().cloned() {
            let runner = runner.clone();
            let semaphore = Arc::clone(&semaphore);
            let cancel = self.cancel.clone();
            let anomalies = anomalies_by_entity
                .get(&pair.entity)
                .cloned()
                .unwrap_or_default();

            join_set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return UnitOutput::cancelled(pair);
                };
                if cancel.is_cancelled() {
                    return UnitOutput::cancelled(pair);
                }
                debug!(pair = %pair, "Unit started");
                runner.run(pair, texts, anomalies).await
            });
        }

        // Fan in.
        let mut computed: HashMap<PairContext, UnitOutput> = HashMap::new();
        let mut market_usage = Usage::default();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(output) => {
                    if let Some(market) = &output.market {
                        market_usage += market.usage;
                    }
                    computed.insert(output.pair.clone(), output);
                }
                Err(e) => error!(error = %e, "Unit of work aborted"),
            }
        }

        for (pair, _) in &pending {
            match computed.get(pair) {
                None => skipped.push(pair_skip(pair, "unit of work aborted")),
                Some(output) if output.cancelled => {
                    info!(pair = %pair, "Unit skipped: run cancelled");
                    skipped.push(pair_skip(pair, "run cancelled"));
                }
                Some(output) => {
                    stats.units_run += 1;
                    stats.capability_failures += output.capability_failures;
                    skipped.extend(output.skips.iter().cloned());

                    // A pair with failed capability calls is recomputed next run.
                    if output.capability_failures == 0 {
                        self.cache.put_pair(pair, &output.records);
                    }
                }
            }
        }

        // Global dedup across every finished pair, in plan order.
        let mut all_records = Vec::new();
        let mut finished: Vec<(PairContext, bool)> = Vec::new();
        for pair in &plan {
            if let Some(records) = cached.remove(pair) {
                all_records.extend(records);
                finished.push((pair.clone(), true));
            } else if let Some(output) = computed.get_mut(pair).filter(|o| !o.cancelled) {
                all_records.extend(std::mem::take(&mut output.records));
                finished.push((pair.clone(), false));
            }
        }

        stats.records_before_dedup = all_records.len();
        let (deduped, dropped) = global_dedup(all_records);
        stats.records_after_dedup = deduped.len();
        if dropped > 0 {
            debug!(dropped, "Global dedup removed duplicate records");
        }

        let mut by_pair: HashMap<PairContext, Vec<ChangeRecord>> = HashMap::new();
        for record in deduped {
            by_pair.entry(record.pair()).or_default().push(record);
        }

        // Aggregate per pair.
        let aggregator = SignalAggregator::new(self.settings.score_bound);
        let synthesizer = NarrativeSynthesizer::new(self.extraction.clone(), self.settings.call_timeout);
        let mut pairs = Vec::with_capacity(finished.len());

        for (pair, from_cache) in finished {
            let records = by_pair.remove(&pair).unwrap_or_default();
            let mut verdict = aggregator.aggregate(&pair, &records);

            let print = fingerprint(&records);
            verdict.summary = match self.cache.summary_for(&pair, &print) {
                Some(summary) => summary,
                None => {
                    let narrative = synthesizer.synthesize(&verdict, &records).await;
                    // A stand-in summary is retried on the next run.
                    if narrative.complete {
                        self.cache.store_summary(&pair, &print, &narrative.summary);
                    }
                    narrative.summary
                }
            };

            info!(
                pair = %pair,
                signal = %verdict.overall_signal,
                score = verdict.overall_score,
                from_cache,
                "Verdict"
            );

            let market = computed.get_mut(&pair).and_then(|o| o.market.take());
            pairs.push(PairReport {
                entity: pair.entity.clone(),
                quarter_prev: pair.quarter_prev.clone(),
                quarter_curr: pair.quarter_curr.clone(),
                from_cache,
                validation_score: validation_score(&records),
                records,
                verdict,
                market_alignment_pct: market.as_ref().map(|m| m.alignment_pct),
                market_sources: market.map(|m| m.sources).unwrap_or_default(),
            });
        }

        if let Err(e) = self.cache.persist().await {
            error!(error = %e, "Failed to persist change cache");
        }

        stats.usage = self.extraction.usage().since(&usage_start);
        stats.usage += market_usage;

        let anomalies = anomalies_by_entity
            .into_values()
            .flat_map(|a| a.iter().cloned().collect::<Vec<_>>())
            .collect();

        info!(
            run_id = %run_id,
            pairs = stats.pairs_total,
            cache_hits = stats.cache_hits,
            units = stats.units_run,
            failures = stats.capability_failures,
            "Pipeline run finished"
        );

        Report {
            run_id,
            generated_at: Utc::now(),
            pairs,
            anomalies,
            skipped,
            stats,
        }
    }
}

fn pair_skip(pair: &PairContext, reason: &str) -> SkipEntry {
    SkipEntry {
        entity: pair.entity.clone(),
        quarter_prev: Some(pair.quarter_prev.clone()),
        quarter_curr: Some(pair.quarter_curr.clone()),
        section: None,
        reason: reason.to_string(),
    }
}
