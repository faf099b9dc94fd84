//! Rows of the metadata store.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::AfsError;
use crate::view::ViewKey;

/// Revision record of one source entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceMetadata {
    /// Owning module
    pub module: String,
    /// Module-relative path
    pub path: String,
    /// Opaque revision token (content hash, `intent:<key>`, ...)
    pub source_revision: String,
    /// Last update (ms since epoch)
    pub updated_at: i64,
    /// Drivers likely relevant to this source
    pub drivers_hint: Vec<String>,
    /// Kind of source (`document`, `asset`, ...)
    pub kind: Option<String>,
    /// Free-form attributes
    pub attrs: Map<String, Value>,
    /// Creation time (ms since epoch)
    pub created_at: i64,
}

impl SourceMetadata {
    /// A new record; timestamps are assigned by the store.
    pub fn new(
        module: impl Into<String>,
        path: impl Into<String>,
        revision: impl Into<String>,
    ) -> Self {
        Self {
            module: module.into(),
            path: path.into(),
            source_revision: revision.into(),
            updated_at: 0,
            drivers_hint: Vec::new(),
            kind: None,
            attrs: Map::new(),
            created_at: 0,
        }
    }

    /// Set the driver hint.
    pub fn with_drivers_hint(mut self, hint: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.drivers_hint = hint.into_iter().map(Into::into).collect();
        self
    }

    /// Set the kind.
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Insert an attribute.
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }
}

/// Lifecycle state of a projection.
///
/// ```text
/// generating -> ready | failed
/// ready      -> stale          (source revision advanced)
/// stale      -> generating
/// failed     -> generating     (retry)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewState {
    /// A driver run is in flight
    Generating,
    /// The artifact exists
    Ready,
    /// The source changed since generation
    Stale,
    /// The last driver run failed
    Failed,
}

impl ViewState {
    /// Name as persisted.
    pub fn as_str(&self) -> &'static str {
        match self {
            ViewState::Generating => "generating",
            ViewState::Ready => "ready",
            ViewState::Stale => "stale",
            ViewState::Failed => "failed",
        }
    }

    /// Whether the state machine permits moving to `next`.
    pub fn can_transition_to(self, next: ViewState) -> bool {
        matches!(
            (self, next),
            (ViewState::Generating, ViewState::Ready)
                | (ViewState::Generating, ViewState::Failed)
                | (ViewState::Ready, ViewState::Stale)
                | (ViewState::Stale, ViewState::Generating)
                | (ViewState::Failed, ViewState::Generating)
        )
    }
}

impl fmt::Display for ViewState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ViewState {
    type Err = AfsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generating" => Ok(ViewState::Generating),
            "ready" => Ok(ViewState::Ready),
            "stale" => Ok(ViewState::Stale),
            "failed" => Ok(ViewState::Failed),
            other => Err(AfsError::Validation(format!("unknown view state: {other}"))),
        }
    }
}

/// Projection record of one (module, path, view).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewMetadata {
    /// Owning module
    pub module: String,
    /// Module-relative source path
    pub path: String,
    /// Canonical view key
    pub view: ViewKey,
    /// Lifecycle state
    pub state: ViewState,
    /// Source revision the projection was (or is being) derived from
    pub derived_from: Option<String>,
    /// When the artifact was generated
    pub generated_at: Option<i64>,
    /// Last driver error
    pub error: Option<String>,
    /// Where the artifact is stored
    pub storage_path: Option<String>,
    /// Creation time (ms since epoch)
    pub created_at: i64,
    /// Last update (ms since epoch)
    pub updated_at: i64,
}

impl ViewMetadata {
    /// Whether the projection can be served for `current_revision`.
    ///
    /// A ready row derived from an older revision is stale even if nobody
    /// marked it so.
    pub fn is_fresh(&self, current_revision: &str) -> bool {
        self.state == ViewState::Ready && self.derived_from.as_deref() == Some(current_revision)
    }

    /// Check the per-state field invariants.
    pub fn validate(&self) -> Result<(), AfsError> {
        match self.state {
            ViewState::Ready if self.storage_path.is_none() || self.generated_at.is_none() => {
                Err(AfsError::Validation(format!(
                    "ready view {}:{} [{}] needs storage_path and generated_at",
                    self.module, self.path, self.view
                )))
            }
            ViewState::Failed if self.error.is_none() => Err(AfsError::Validation(format!(
                "failed view {}:{} [{}] needs an error",
                self.module, self.path, self.view
            ))),
            _ => Ok(()),
        }
    }
}

/// Records that an output consumed an input at a given revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyEdge {
    /// Output path
    pub out_path: String,
    /// Output view
    pub out_view_key: ViewKey,
    /// Input path
    pub in_path: String,
    /// Input revision at the time of use
    pub in_revision: String,
    /// Free-form role (`source`, `context`, `reference`)
    pub role: String,
    /// Last update (ms since epoch)
    pub updated_at: i64,
}

impl DependencyEdge {
    /// A new edge; the timestamp is assigned by the store.
    pub fn new(
        out_path: impl Into<String>,
        out_view_key: ViewKey,
        in_path: impl Into<String>,
        in_revision: impl Into<String>,
        role: impl Into<String>,
    ) -> Self {
        Self {
            out_path: out_path.into(),
            out_view_key,
            in_path: in_path.into(),
            in_revision: in_revision.into(),
            role: role.into(),
            updated_at: 0,
        }
    }
}

/// An asset reference declared inside a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slot {
    /// Document declaring the slot
    pub owner_path: String,
    /// Slot id, unique within the owner
    pub slot_id: String,
    /// Owner revision at scan time
    pub owner_revision: String,
    /// Asset type (`image`)
    pub slot_type: String,
    /// Human description of the asset
    pub desc: String,
    /// Content address of the generation intent
    pub intent_key: String,
    /// Where the generated asset lives
    pub asset_path: String,
    /// Human-readable slug of the description
    pub slug: String,
    /// Last update (ms since epoch)
    pub updated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_row(derived_from: &str) -> ViewMetadata {
        ViewMetadata {
            module: "docs".to_string(),
            path: "/a.md".to_string(),
            view: ViewKey::from_stored("language=en"),
            state: ViewState::Ready,
            derived_from: Some(derived_from.to_string()),
            generated_at: Some(1),
            error: None,
            storage_path: Some("/.i18n/en/a.md".to_string()),
            created_at: 1,
            updated_at: 1,
        }
    }

    #[test]
    fn test_transitions() {
        use ViewState::*;
        assert!(Generating.can_transition_to(Ready));
        assert!(Generating.can_transition_to(Failed));
        assert!(Ready.can_transition_to(Stale));
        assert!(Stale.can_transition_to(Generating));
        assert!(Failed.can_transition_to(Generating));
        assert!(!Ready.can_transition_to(Generating));
        assert!(!Stale.can_transition_to(Ready));
        assert!(!Generating.can_transition_to(Stale));
    }

    #[test]
    fn test_freshness_requires_matching_revision() {
        let row = ready_row("rev-1");
        assert!(row.is_fresh("rev-1"));
        assert!(!row.is_fresh("rev-2"));
        let stale = ViewMetadata {
            state: ViewState::Stale,
            ..row
        };
        assert!(!stale.is_fresh("rev-1"));
    }

    #[test]
    fn test_validate_invariants() {
        assert!(ready_row("r").validate().is_ok());
        let missing_path = ViewMetadata {
            storage_path: None,
            ..ready_row("r")
        };
        assert!(missing_path.validate().is_err());
        let failed = ViewMetadata {
            state: ViewState::Failed,
            error: None,
            ..ready_row("r")
        };
        assert!(failed.validate().is_err());
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            ViewState::Generating,
            ViewState::Ready,
            ViewState::Stale,
            ViewState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<ViewState>().ok(), Some(state));
        }
    }
}
