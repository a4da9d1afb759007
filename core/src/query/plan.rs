//! Scan plans and eligibility results

use std::fmt;

use crate::query::group::GroupSpec;
use crate::query::pipeline::PipelineStage;
use crate::storage::{IndexDescriptor, KeyDirection, KeyPattern};
use crate::value::Value;

/// User-supplied index hint.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Hint {
    #[default]
    None,
    /// `{$natural: 1}`: force a collection scan.
    Natural,
    ByName(String),
    ByKeyPattern(KeyPattern),
}

impl Hint {
    /// Parse `"name"`, `{$natural: 1}` or a key pattern object.
    pub fn from_json(json: &serde_json::Value) -> crate::Result<Self> {
        match json {
            serde_json::Value::Null => Ok(Hint::None),
            serde_json::Value::String(name) => Ok(Hint::ByName(name.clone())),
            serde_json::Value::Object(obj) if obj.contains_key("$natural") => Ok(Hint::Natural),
            other => Ok(Hint::ByKeyPattern(KeyPattern::from_json(other)?)),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Hint::None)
    }
}

impl fmt::Display for Hint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hint::None => write!(f, "none"),
            Hint::Natural => write!(f, "{{$natural: 1}}"),
            Hint::ByName(name) => write!(f, "{}", name),
            Hint::ByKeyPattern(kp) => write!(f, "{}", kp),
        }
    }
}

/// Bound on one key field.
#[derive(Debug, Clone, PartialEq)]
pub enum Bounds {
    Point(Value),
    /// `[MinKey, MaxKey]`
    Full,
}

impl Bounds {
    pub fn is_point(&self) -> bool {
        matches!(self, Bounds::Point(_))
    }

    /// Interval text in walk order, e.g. `[1, 1]` or `[MaxKey, MinKey]`.
    pub fn interval(&self, walk: KeyDirection) -> String {
        match (self, walk) {
            (Bounds::Point(v), _) => format!("[{}, {}]", v, v),
            (Bounds::Full, KeyDirection::Descending) => "[MaxKey, MinKey]".to_string(),
            (Bounds::Full, _) => "[MinKey, MaxKey]".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanDirection {
    #[default]
    Forward,
    Backward,
}

impl ScanDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanDirection::Forward => "forward",
            ScanDirection::Backward => "backward",
        }
    }
}

/// Which representative document each group keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorMode {
    /// No accumulators: only the group key is produced.
    KeyOnly,
    First,
    Last,
}

/// Where a `$first`/`$last` accumulator reads its value from.
#[derive(Debug, Clone, PartialEq)]
pub enum AccumulatorSource {
    /// Key component at this position of the chosen index.
    Covered(usize),
    /// Evaluated against the fetched document.
    Fetched,
}

/// Analyzer output: everything the distinct scan executor needs.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanPlan {
    pub index: IndexDescriptor,
    /// Catalog epoch the plan was computed against.
    pub catalog_epoch: u64,
    pub group: GroupSpec,
    /// Position of the group-by field in the key pattern.
    pub pivot: usize,
    pub direction: ScanDirection,
    /// One bound per key field `0..=pivot`.
    pub bounds: Vec<Bounds>,
    pub fetch_required: bool,
    pub mode: AccumulatorMode,
    /// Parallel to the group's accumulators.
    pub sources: Vec<AccumulatorSource>,
    pub trailing: Vec<PipelineStage>,
}

impl ScanPlan {
    /// Direction each key field is actually walked in.
    pub fn walked_directions(&self) -> Vec<KeyDirection> {
        self.index
            .key_pattern
            .fields()
            .iter()
            .map(|f| match self.direction {
                ScanDirection::Forward => f.direction,
                ScanDirection::Backward => f.direction.reversed(),
            })
            .collect()
    }

    /// Number of leading key fields fixed to a single value.
    pub fn point_prefix_len(&self) -> usize {
        self.bounds.iter().take_while(|b| b.is_point()).count()
    }

    /// Bounds for every key field, trailing fields unbounded.
    pub fn full_bounds(&self) -> Vec<Bounds> {
        let mut bounds = self.bounds.clone();
        bounds.resize(self.index.key_pattern.len(), Bounds::Full);
        bounds
    }
}

/// Why a specific candidate index cannot serve the scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateRejection {
    HashedGroupField,
    CollationMismatch,
    /// A key field before the group-by field has no point bound.
    PrefixNotBound(String),
    /// The group-by field or a point-bounded prefix field is multikey.
    MultikeyPrefix(String),
    /// A point predicate on a field the scan prefix does not bind.
    UnboundPredicate(String),
    HashedPointUnderCollation(String),
    SortNotProvided,
    /// `$last` with a requested sort through a multikey field.
    MultikeySortForLast(String),
    FetchDisallowed,
    GroupFieldNotIndexed,
}

impl fmt::Display for CandidateRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateRejection::HashedGroupField => write!(f, "group-by field is hashed"),
            CandidateRejection::CollationMismatch => {
                write!(f, "query collation does not match index collation")
            }
            CandidateRejection::PrefixNotBound(field) => {
                write!(f, "prefix field '{}' has no point bound", field)
            }
            CandidateRejection::MultikeyPrefix(field) => write!(f, "field '{}' is multikey", field),
            CandidateRejection::UnboundPredicate(field) => {
                write!(f, "predicate on '{}' is not bound by the index prefix", field)
            }
            CandidateRejection::HashedPointUnderCollation(field) => {
                write!(f, "hashed field '{}' cannot be bound under a collation", field)
            }
            CandidateRejection::SortNotProvided => write!(f, "index cannot provide the requested sort"),
            CandidateRejection::MultikeySortForLast(field) => {
                write!(f, "$last with a sort through multikey field '{}'", field)
            }
            CandidateRejection::FetchDisallowed => write!(f, "plan would need FETCH"),
            CandidateRejection::GroupFieldNotIndexed => write!(f, "group-by field is not indexed"),
        }
    }
}

/// Why no DISTINCT_SCAN was planned. Not an error: the caller falls back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IneligibleReason {
    Disabled,
    NoGroupStage,
    LimitBeforeGroup,
    SkipBeforeGroup,
    ProjectBeforeGroup,
    UnsupportedStage(String),
    CompoundGroupKey,
    NonFieldGroupKey,
    MixedAccumulators,
    UnsupportedAccumulator(String),
    ResidualPredicate(String),
    NaturalHint,
    HintNotFound(String),
    HintedIndexRejected {
        index: String,
        reason: CandidateRejection,
    },
    NoCandidateIndex,
    AllCandidatesRejected(Vec<(String, CandidateRejection)>),
}

impl fmt::Display for IneligibleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IneligibleReason::Disabled => write!(f, "distinct scan disabled by configuration"),
            IneligibleReason::NoGroupStage => write!(f, "pipeline has no $group"),
            IneligibleReason::LimitBeforeGroup => write!(f, "$limit before $group"),
            IneligibleReason::SkipBeforeGroup => write!(f, "$skip before $group"),
            IneligibleReason::ProjectBeforeGroup => write!(f, "$project before $group"),
            IneligibleReason::UnsupportedStage(name) => {
                write!(f, "stage {} not allowed before $group", name)
            }
            IneligibleReason::CompoundGroupKey => write!(f, "compound group key"),
            IneligibleReason::NonFieldGroupKey => write!(f, "group key is not a field path"),
            IneligibleReason::MixedAccumulators => write!(f, "mixed $first and $last accumulators"),
            IneligibleReason::UnsupportedAccumulator(op) => {
                write!(f, "accumulator {} is not $first or $last", op)
            }
            IneligibleReason::ResidualPredicate(field) => {
                write!(f, "non-point predicate on '{}'", field)
            }
            IneligibleReason::NaturalHint => write!(f, "$natural hint"),
            IneligibleReason::HintNotFound(hint) => write!(f, "hinted index {} not found", hint),
            IneligibleReason::HintedIndexRejected { index, reason } => {
                write!(f, "hinted index {} rejected: {}", index, reason)
            }
            IneligibleReason::NoCandidateIndex => write!(f, "no index on the group-by field"),
            IneligibleReason::AllCandidatesRejected(rejections) => {
                let parts: Vec<String> = rejections
                    .iter()
                    .map(|(name, reason)| format!("{}: {}", name, reason))
                    .collect();
                write!(f, "all candidates rejected ({})", parts.join("; "))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Eligibility {
    Eligible(Box<ScanPlan>),
    Ineligible(IneligibleReason),
}

impl Eligibility {
    pub fn plan(&self) -> Option<&ScanPlan> {
        match self {
            Eligibility::Eligible(plan) => Some(plan),
            Eligibility::Ineligible(_) => None,
        }
    }

    pub fn reason(&self) -> Option<&IneligibleReason> {
        match self {
            Eligibility::Eligible(_) => None,
            Eligibility::Ineligible(reason) => Some(reason),
        }
    }

    pub fn is_eligible(&self) -> bool {
        matches!(self, Eligibility::Eligible(_))
    }
}
