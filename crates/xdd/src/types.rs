//! Domain types: identifiers, requirements, acceptance criteria, project
//! metadata, the specification value, and the changelog event kinds.
//!
//! All persisted types serialize to YAML. Events and acceptance criteria are
//! tagged unions: a struct header carrying the shared fields plus a flattened,
//! internally-tagged enum (`event_type` for events, `type` for criteria).

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation failures for domain values.
///
/// These surface both at the deserialization edge (identifier grammar) and
/// when the reducer admits new entities into a specification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} must be {min}-{max} characters, got {got}")]
    LengthOutOfRange {
        field: &'static str,
        min: usize,
        max: usize,
        got: usize,
    },
    #[error("invalid identifier {0:?}")]
    BadIdentifier(String),
    #[error("category {0:?} must be 1-20 uppercase alphanumerics")]
    BadCategory(String),
    #[error("requirement {id} carries category {category:?} but its identifier embeds {embedded:?}")]
    CategoryMismatch {
        id: String,
        category: String,
        embedded: String,
    },
    #[error("requirement {id} must carry 1-10 acceptance criteria, got {got}")]
    CriteriaCountOutOfRange { id: String, got: usize },
}

/// True for a URL-safe random token segment: `[A-Za-z0-9_-]{10,16}`.
fn is_token(s: &str) -> bool {
    (10..=16).contains(&s.len())
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// True for a category segment: `[A-Z0-9]{1,20}`.
pub(crate) fn is_category(s: &str) -> bool {
    (1..=20).contains(&s.len())
        && s.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}

/// Validate a bare category name.
pub fn validate_category(name: &str) -> Result<(), ValidationError> {
    if is_category(name) {
        Ok(())
    } else {
        Err(ValidationError::BadCategory(name.to_string()))
    }
}

fn validate_length(
    field: &'static str,
    value: &str,
    min: usize,
    max: usize,
) -> Result<(), ValidationError> {
    let got = value.chars().count();
    if (min..=max).contains(&got) {
        Ok(())
    } else {
        Err(ValidationError::LengthOutOfRange {
            field,
            min,
            max,
            got,
        })
    }
}

macro_rules! string_id {
    ($name:ident) => {
        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = ValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValidationError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                Self::parse(s)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }
    };
}

/// Requirement identifier: `REQ-<CATEGORY>-<token>`.
///
/// The embedded category segment is load-bearing: invariantly it equals the
/// requirement's `category` field at creation time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RequirementId(String);

impl RequirementId {
    pub fn parse(s: impl Into<String>) -> Result<Self, ValidationError> {
        let s = s.into();
        let rest = s
            .strip_prefix("REQ-")
            .ok_or_else(|| ValidationError::BadIdentifier(s.clone()))?;
        // The category segment cannot contain `-`, so the first dash after the
        // prefix separates it from the token (which may itself contain dashes).
        let (category, token) = rest
            .split_once('-')
            .ok_or_else(|| ValidationError::BadIdentifier(s.clone()))?;
        if !is_category(category) || !is_token(token) {
            return Err(ValidationError::BadIdentifier(s));
        }
        Ok(Self(s))
    }

    /// The `<CATEGORY>` segment embedded in the identifier.
    pub fn category(&self) -> &str {
        let rest = &self.0["REQ-".len()..];
        rest.split_once('-').map(|(c, _)| c).unwrap_or(rest)
    }
}

string_id!(RequirementId);

/// Acceptance-criterion identifier: `AC-<token>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CriterionId(String);

impl CriterionId {
    pub fn parse(s: impl Into<String>) -> Result<Self, ValidationError> {
        let s = s.into();
        match s.strip_prefix("AC-") {
            Some(token) if is_token(token) => Ok(Self(s)),
            _ => Err(ValidationError::BadIdentifier(s)),
        }
    }
}

string_id!(CriterionId);

/// Changelog event identifier: `EVT-<token>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventId(String);

impl EventId {
    pub fn parse(s: impl Into<String>) -> Result<Self, ValidationError> {
        let s = s.into();
        match s.strip_prefix("EVT-") {
            Some(token) if is_token(token) => Ok(Self(s)),
            _ => Err(ValidationError::BadIdentifier(s)),
        }
    }
}

string_id!(EventId);

/// EARS classification of a requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EarsClass {
    /// Always active ("the system shall ...").
    Ubiquitous,
    /// Triggered ("when X, the system shall ...").
    Event,
    /// Condition-scoped ("while X, the system shall ...").
    State,
    /// Conditional ("where X, the system shall ...").
    Optional,
}

impl fmt::Display for EarsClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EarsClass::Ubiquitous => "ubiquitous",
            EarsClass::Event => "event",
            EarsClass::State => "state",
            EarsClass::Optional => "optional",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        };
        f.write_str(s)
    }
}

/// Project-level metadata carried at the top of a specification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectMetadata {
    pub name: String,
    pub description: String,
    pub version: Version,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProjectMetadata {
    /// Placeholder metadata for a project that has not been initialized.
    ///
    /// Timestamps are pinned to the epoch so that replaying an event stream
    /// from the empty state is deterministic.
    pub fn unset() -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            version: Version::new(0, 1, 0),
            created_at: DateTime::<Utc>::UNIX_EPOCH,
            updated_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_length("project name", &self.name, 1, 100)?;
        validate_length("project description", &self.description, 10, 1000)?;
        Ok(())
    }
}

/// One acceptance criterion attached to a requirement. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptanceCriterion {
    pub id: CriterionId,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub body: CriterionBody,
}

/// The criterion payload, discriminated by the `type` field in YAML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CriterionBody {
    /// Given/When/Then triple.
    Behavioral {
        given: String,
        when: String,
        then: String,
    },
    /// A single testable statement.
    Assertion { statement: String },
}

impl AcceptanceCriterion {
    pub fn validate(&self) -> Result<(), ValidationError> {
        match &self.body {
            CriterionBody::Behavioral { given, when, then } => {
                validate_length("criterion given", given, 0, 200)?;
                validate_length("criterion when", when, 0, 200)?;
                validate_length("criterion then", then, 0, 200)?;
            }
            CriterionBody::Assertion { statement } => {
                validate_length("criterion statement", statement, 0, 200)?;
            }
        }
        Ok(())
    }
}

/// A single requirement. Immutable once committed: "editing" a requirement is
/// a delete followed by an add under a fresh identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub id: RequirementId,
    pub ears: EarsClass,
    pub category: String,
    pub description: String,
    pub rationale: String,
    pub acceptance_criteria: Vec<AcceptanceCriterion>,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
}

impl Requirement {
    /// Check the shape constraints a requirement must satisfy at creation
    /// time, including that its category matches the identifier segment.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_category(&self.category)?;
        if self.category != self.id.category() {
            return Err(ValidationError::CategoryMismatch {
                id: self.id.to_string(),
                category: self.category.clone(),
                embedded: self.id.category().to_string(),
            });
        }
        validate_length("requirement description", &self.description, 10, 500)?;
        validate_length("requirement rationale", &self.rationale, 10, 500)?;
        if self.acceptance_criteria.is_empty() || self.acceptance_criteria.len() > 10 {
            return Err(ValidationError::CriteriaCountOutOfRange {
                id: self.id.to_string(),
                got: self.acceptance_criteria.len(),
            });
        }
        for criterion in &self.acceptance_criteria {
            criterion.validate()?;
        }
        Ok(())
    }

    pub fn criterion(&self, id: &CriterionId) -> Option<&AcceptanceCriterion> {
        self.acceptance_criteria.iter().find(|c| &c.id == id)
    }
}

/// The current-state value: metadata, requirements, and the derived category
/// set.
///
/// `categories` is a sorted view recomputed after every mutation: the set of
/// categories referenced by at least one requirement, unioned with the
/// explicitly added ones. `explicit_categories` records names added by an
/// explicit category-add and not yet deleted; it is persisted so snapshots
/// replay identically to the full event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Specification {
    pub metadata: ProjectMetadata,
    pub requirements: Vec<Requirement>,
    pub categories: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub explicit_categories: BTreeSet<String>,
}

impl Specification {
    /// The state a fresh project replays from.
    pub fn empty() -> Self {
        Self {
            metadata: ProjectMetadata::unset(),
            requirements: Vec::new(),
            categories: Vec::new(),
            explicit_categories: BTreeSet::new(),
        }
    }

    pub fn requirement(&self, id: &RequirementId) -> Option<&Requirement> {
        self.requirements.iter().find(|r| &r.id == id)
    }

    /// Categories referenced by at least one requirement.
    pub fn referenced_categories(&self) -> BTreeSet<String> {
        self.requirements
            .iter()
            .map(|r| r.category.clone())
            .collect()
    }

    /// Recompute the derived category view: referenced union explicit, sorted.
    pub fn rebuild_categories(&mut self) {
        let mut set = self.referenced_categories();
        set.extend(self.explicit_categories.iter().cloned());
        self.categories = set.into_iter().collect();
    }

    /// Reconstruct the explicit category set from a bare view file.
    ///
    /// A listed category that no requirement references can only have gotten
    /// there by an explicit add, so the migration loader pins those.
    pub fn rebuild_explicit_from_view(&mut self) {
        if self.explicit_categories.is_empty() {
            let referenced = self.referenced_categories();
            self.explicit_categories = self
                .categories
                .iter()
                .filter(|c| !referenced.contains(*c))
                .cloned()
                .collect();
        }
        self.rebuild_categories();
    }
}

/// The kind of a semantic version bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BumpKind {
    Major,
    Minor,
    Patch,
}

impl fmt::Display for BumpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BumpKind::Major => "major",
            BumpKind::Minor => "minor",
            BumpKind::Patch => "patch",
        };
        f.write_str(s)
    }
}

/// One changelog entry. Written once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangelogEvent {
    pub event_id: EventId,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// The event payload, discriminated by the `event_type` field in YAML.
///
/// Deleted-entity events carry a full snapshot of what was removed so the log
/// stays self-describing without consulting earlier entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum EventKind {
    RequirementAdded {
        requirement: Requirement,
    },
    RequirementDeleted {
        requirement_id: RequirementId,
        requirement: Requirement,
    },
    AcceptanceCriterionAdded {
        requirement_id: RequirementId,
        criterion: AcceptanceCriterion,
    },
    AcceptanceCriterionDeleted {
        requirement_id: RequirementId,
        criterion_id: CriterionId,
        criterion: AcceptanceCriterion,
    },
    CategoryAdded {
        category: String,
    },
    CategoryDeleted {
        category: String,
    },
    CategoryRenamed {
        old_name: String,
        new_name: String,
    },
    ProjectMetadataUpdated {
        old_metadata: ProjectMetadata,
        new_metadata: ProjectMetadata,
    },
    VersionBumped {
        old_version: Version,
        new_version: Version,
        bump: BumpKind,
        rationale: String,
    },
}

impl EventKind {
    /// Short tag, matching the `event_type` discriminator.
    pub fn tag(&self) -> &'static str {
        match self {
            EventKind::RequirementAdded { .. } => "RequirementAdded",
            EventKind::RequirementDeleted { .. } => "RequirementDeleted",
            EventKind::AcceptanceCriterionAdded { .. } => "AcceptanceCriterionAdded",
            EventKind::AcceptanceCriterionDeleted { .. } => "AcceptanceCriterionDeleted",
            EventKind::CategoryAdded { .. } => "CategoryAdded",
            EventKind::CategoryDeleted { .. } => "CategoryDeleted",
            EventKind::CategoryRenamed { .. } => "CategoryRenamed",
            EventKind::ProjectMetadataUpdated { .. } => "ProjectMetadataUpdated",
            EventKind::VersionBumped { .. } => "VersionBumped",
        }
    }
}
