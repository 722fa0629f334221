//! Disclosure Delta Library
//!
//! Detects meaningful changes between consecutive periodic filings of a
//! company, checks every claim against its source text and against numeric
//! trends, and folds the survivors into one bounded directional verdict per
//! quarter pair.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                    disclosure-delta (pipeline)                      │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────┐      │
//! │  │  Section        │  │  Cross          │  │  Signal         │      │
//! │  │  Comparator     │─▶│  Validator      │─▶│  Aggregator     │      │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────────┘      │
//! │           │                    │                                    │
//! │  ┌────────▼────────┐  ┌────────▼────────┐  ┌─────────────────┐      │
//! │  │  Regime         │  │  Anomaly        │  │  Change Cache   │      │
//! │  │  Policy         │  │  Detector       │  │  (Blob Store)   │      │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────┘      │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Concepts
//!
//! ## Regimes
//! - Quotes are labelled Accounting, OneTime, Guidance or Operating
//! - Only quotes of the same regime may be compared
//! - A new quote about a one-time event never carries a signal
//!
//! ## Validation
//! - Every record ends Verified, Flagged or Removed
//! - Numbers missing from the source text can never be Verified
//! - A failed audit call leaves records Flagged, not Verified
//!
//! ## Caching
//! - Records are cached per (entity, quarter pair, section)
//! - A pair is reused only when every section is cached

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod aggregator;
pub mod anomaly;
pub mod cache;
pub mod capability;
pub mod comparator;
pub mod facts;
pub mod market;
pub mod orchestrator;
pub mod ordering;
pub mod regime;
pub mod report;
pub mod settings;
pub mod storage;
pub mod types;
pub mod validator;

pub use aggregator::{Narrative, NarrativeSynthesizer, SignalAggregator};
pub use anomaly::{Anomaly, AnomalyDetector, AnomalyKind};
pub use cache::{ChangeCache, CacheStats};
pub use capability::{
    CapabilityError, ExtractionCapability, HttpCapability, SearchCapability, Usage,
};
pub use comparator::{SectionComparator, SectionSkip};
pub use facts::{Fact, FactStore};
pub use market::MarketValidator;
pub use orchestrator::{CancelHandle, PipelineOrchestrator};
pub use ordering::{ChronologicalOrdering, PeriodOrdering};
pub use regime::{KeywordRegimeClassifier, Regime, RegimePolicy};
pub use report::{PairReport, Report, SkipEntry};
pub use settings::PipelineSettings;
pub use storage::{open_store, BlobStore, MemoryStore};
pub use types::{
    AggregateVerdict, ChangeRecord, Corpus, OverallSignal, PairContext, Section,
    SignalClassification, ValidationStatus,
};
pub use validator::CrossValidator;
