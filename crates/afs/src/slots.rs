//! Declarative asset slots and content addressing.
//!
//! Documents declare assets inline with an HTML comment:
//!
//! ```text
//! <!-- afs:image id="hero" desc="A red fox jumping over a fence" -->
//! <!-- afs:image id="logo" key="brand-logo-v2" desc="Company logo" -->
//! ```
//!
//! Each slot resolves to an intent key: the explicit `key` when present,
//! otherwise a hash of the normalized description. Slots sharing an intent
//! key share one asset path, so the asset is generated once.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex_lite::Regex;
use sha2::{Digest, Sha256};

use crate::driver::IMAGE_DRIVER_NAME;
use crate::error::{AfsError, Result};
use crate::metadata::{MetadataStore, Slot, SourceMetadata};

/// Default namespace for generated asset paths.
pub const DEFAULT_NAMESPACE: &str = "afs";

/// Slot type of image annotations.
pub const IMAGE_SLOT: &str = "image";

/// Maximum slug length.
const SLUG_MAX_LEN: usize = 50;

/// Hex characters kept from the description hash (128 bits).
const INTENT_KEY_LEN: usize = 32;

#[allow(clippy::expect_used)]
static ANNOTATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<!--\s*afs:image\b(.*?)-->").expect("annotation pattern is valid")
});

/// One `name="value"` pair at the start of the remaining attribute text.
#[allow(clippy::expect_used)]
static ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s+([\w-]+)\s*=\s*"([^"]*)""#).expect("attribute pattern is valid")
});

/// One parsed `afs:image` annotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotAnnotation {
    /// Slot id, unique within the document
    pub id: String,
    /// Explicit intent key
    pub key: Option<String>,
    /// Asset description
    pub desc: String,
}

/// Trim, lowercase and collapse internal whitespace to single spaces.
pub fn normalize_description(desc: &str) -> String {
    desc.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Intent key of a slot: `key` verbatim, else the hash of the normalized
/// description.
pub fn intent_key_for(desc: &str, key: Option<&str>) -> String {
    if let Some(key) = key {
        return key.to_string();
    }
    let mut hasher = Sha256::new();
    hasher.update(normalize_description(desc).as_bytes());
    let mut hex = format!("{:x}", hasher.finalize());
    hex.truncate(INTENT_KEY_LEN);
    hex
}

/// Path of the asset generated for `intent_key`.
pub fn asset_path(namespace: &str, intent_key: &str) -> String {
    format!("{}{intent_key}", asset_prefix(namespace))
}

/// Directory holding all intent-addressed assets of `namespace`.
pub fn asset_prefix(namespace: &str) -> String {
    format!("/.{namespace}/images/by-intent/")
}

/// Human-readable slug of a description.
pub fn slugify(desc: &str) -> String {
    let kept: String = desc
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-' || c.is_whitespace())
        .collect();
    let mut slug = String::with_capacity(kept.len());
    for c in kept.chars() {
        let c = if c.is_whitespace() { '-' } else { c };
        if c == '-' && slug.ends_with('-') {
            continue;
        }
        slug.push(c);
    }
    let slug = slug.trim_matches('-');
    let mut capped: String = slug.chars().take(SLUG_MAX_LEN).collect();
    while capped.ends_with('-') {
        capped.pop();
    }
    capped
}

/// Parse every annotation in `content`.
///
/// Attributes must be double-quoted `name="value"` pairs. Anything else
/// inside an `afs:image` comment, a missing `id` or `desc`, an empty
/// explicit `key`, a key containing `/` or an `id` repeated within the
/// document is a validation error.
pub fn parse_annotations(content: &str) -> Result<Vec<SlotAnnotation>> {
    let mut seen = HashSet::new();
    let mut annotations = Vec::new();
    for found in ANNOTATION.captures_iter(content) {
        let annotation = found.get(0).map_or("", |m| m.as_str());
        let mut rest = found.get(1).map_or("", |m| m.as_str());
        let mut id = None;
        let mut key = None;
        let mut desc = None;
        while let Some(attr) = ATTRIBUTE.captures(rest) {
            let value = attr.get(2).map_or("", |m| m.as_str()).to_string();
            match attr.get(1).map_or("", |m| m.as_str()) {
                "id" => id = Some(value),
                "key" => key = Some(value),
                "desc" => desc = Some(value),
                _ => {}
            }
            rest = &rest[attr.get(0).map_or(0, |m| m.end())..];
        }
        if !rest.trim().is_empty() {
            return Err(AfsError::Validation(format!(
                "malformed slot annotation near {:?}: {annotation}",
                rest.trim()
            )));
        }

        let id = id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| AfsError::Validation(format!("slot without id: {annotation}")))?;
        let desc = desc
            .filter(|desc| !desc.trim().is_empty())
            .ok_or_else(|| AfsError::Validation(format!("slot {id} has no desc")))?;
        if let Some(key) = &key
            && (key.trim().is_empty() || key.contains('/'))
        {
            return Err(AfsError::Validation(format!(
                "slot {id} has an invalid key: {key:?}"
            )));
        }
        if !seen.insert(id.clone()) {
            return Err(AfsError::Validation(format!("duplicate slot id: {id}")));
        }
        annotations.push(SlotAnnotation { id, key, desc });
    }
    Ok(annotations)
}

/// Discovers slots in documents and registers their assets.
#[derive(Debug, Clone)]
pub struct SlotScanner {
    store: MetadataStore,
    namespace: String,
}

impl SlotScanner {
    /// A scanner writing to `store`, addressing assets under `namespace`.
    pub fn new(store: MetadataStore, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    /// Asset namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Whether `path` is an intent-addressed asset path of this scanner.
    pub fn is_asset_path(&self, path: &str) -> bool {
        path.strip_prefix(&asset_prefix(&self.namespace))
            .is_some_and(|key| !key.is_empty() && !key.contains('/'))
    }

    /// Resolve the slots of `content` without touching the store.
    pub fn plan(&self, owner_path: &str, content: &str, owner_revision: &str) -> Result<Vec<Slot>> {
        let slots = parse_annotations(content)?
            .into_iter()
            .map(|annotation| {
                let intent_key = intent_key_for(&annotation.desc, annotation.key.as_deref());
                Slot {
                    owner_path: owner_path.to_string(),
                    slot_id: annotation.id,
                    owner_revision: owner_revision.to_string(),
                    slot_type: IMAGE_SLOT.to_string(),
                    asset_path: asset_path(&self.namespace, &intent_key),
                    slug: slugify(&annotation.desc),
                    intent_key,
                    desc: annotation.desc,
                    updated_at: 0,
                }
            })
            .collect();
        Ok(slots)
    }

    /// Scan `content`, sync the owner's slot rows and make sure a source
    /// record exists for every referenced asset.
    ///
    /// Validation happens before any write, so a rejected document leaves
    /// the store untouched. Existing asset records are never overwritten.
    pub async fn scan(
        &self,
        module: &str,
        owner_path: &str,
        content: &str,
        owner_revision: &str,
    ) -> Result<Vec<Slot>> {
        let slots = self.plan(owner_path, content, owner_revision)?;
        let changed = self.store.sync_slots(owner_path, slots.clone()).await?;

        let mut registered = HashSet::new();
        for slot in &slots {
            if !registered.insert(slot.asset_path.as_str()) {
                continue;
            }
            let created = self
                .store
                .ensure_source(
                    SourceMetadata::new(
                        module,
                        &slot.asset_path,
                        format!("intent:{}", slot.intent_key),
                    )
                    .with_drivers_hint([IMAGE_DRIVER_NAME])
                    .with_kind("asset")
                    .with_attr("desc", slot.desc.clone()),
                )
                .await?;
            if created {
                tracing::debug!(
                    module = %module,
                    asset = %slot.asset_path,
                    intent = %slot.intent_key,
                    "registered slot asset"
                );
            }
        }
        tracing::debug!(
            module = %module,
            owner = %owner_path,
            slots = slots.len(),
            changed,
            "scanned slots"
        );
        Ok(slots)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn scanner() -> SlotScanner {
        SlotScanner::new(MetadataStore::open_in_memory().unwrap(), DEFAULT_NAMESPACE)
    }

    #[test]
    fn test_normalization_drives_intent_key() {
        let a = intent_key_for("  A Red   Fox\n", None);
        let b = intent_key_for("a red fox", None);
        let c = intent_key_for("a red fox!", None);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
        assert_eq!(intent_key_for("ignored", Some("brand-logo")), "brand-logo");
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("  A Red Fox -- jumping!  "), "a-red-fox-jumping");
        assert_eq!(slugify("snake_case stays"), "snake_case-stays");
        let long = "word ".repeat(30);
        let slug = slugify(&long);
        assert!(slug.len() <= 50);
        assert!(!slug.ends_with('-'));
    }

    #[test]
    fn test_parse_annotations() {
        let doc = r#"
# Title
<!-- afs:image id="hero" desc="A red fox" -->
text
<!--afs:image id="logo" key="brand" desc="Logo"-->
<!-- not an annotation -->
"#;
        let parsed = parse_annotations(doc).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].id, "hero");
        assert_eq!(parsed[0].key, None);
        assert_eq!(parsed[1].key.as_deref(), Some("brand"));
    }

    #[test]
    fn test_parse_rejects_bad_annotations() {
        let dup = r#"<!-- afs:image id="a" desc="x" --> <!-- afs:image id="a" desc="y" -->"#;
        assert!(matches!(parse_annotations(dup), Err(AfsError::Validation(_))));
        let no_id = r#"<!-- afs:image desc="x" -->"#;
        assert!(parse_annotations(no_id).is_err());
        let no_desc = r#"<!-- afs:image id="a" -->"#;
        assert!(parse_annotations(no_desc).is_err());
        let bad_key = r#"<!-- afs:image id="a" key="x/y" desc="x" -->"#;
        assert!(parse_annotations(bad_key).is_err());
    }

    #[test]
    fn test_parse_rejects_malformed_attributes() {
        for doc in [
            "<!-- afs:image id='hero' desc='A fox' -->",
            r#"<!-- afs:image desc="no id" id -->"#,
            r#"<!-- afs:image id="a"desc="glued" -->"#,
            r#"<!-- afs:image id="a" desc="unterminated -->"#,
            r#"<!-- afs:image-x id="a" desc="x" -->"#,
        ] {
            assert!(
                matches!(parse_annotations(doc), Err(AfsError::Validation(_))),
                "{doc} accepted"
            );
        }
        let multiline = "<!-- afs:image\n  id=\"a\"\n  desc=\"x\"\n-->";
        assert_eq!(parse_annotations(multiline).unwrap()[0].id, "a");
        assert!(parse_annotations("<!-- afs:imagery is prose -->").unwrap().is_empty());
    }

    #[test]
    fn test_asset_paths() {
        let scanner = scanner();
        let path = asset_path("afs", "k1");
        assert_eq!(path, "/.afs/images/by-intent/k1");
        assert!(scanner.is_asset_path(&path));
        assert!(!scanner.is_asset_path("/.afs/images/by-intent/"));
        assert!(!scanner.is_asset_path("/docs/a.md"));
    }

    #[tokio::test]
    async fn test_scan_dedupes_identical_intents() {
        let scanner = scanner();
        let doc = r#"<!-- afs:image id="one" desc="A red fox" -->
<!-- afs:image id="two" desc="a  RED fox " -->"#;
        let slots = scanner.scan("docs", "/a.md", doc, "r1").await.unwrap();
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0].intent_key, slots[1].intent_key);
        assert_eq!(slots[0].asset_path, slots[1].asset_path);

        let asset = scanner
            .store
            .get_source("docs", &slots[0].asset_path)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(asset.source_revision, format!("intent:{}", slots[0].intent_key));
        assert_eq!(asset.drivers_hint, vec![IMAGE_DRIVER_NAME.to_string()]);
    }

    #[tokio::test]
    async fn test_duplicate_id_writes_nothing() {
        let scanner = scanner();
        let doc = r#"<!-- afs:image id="a" desc="x" --> <!-- afs:image id="a" desc="y" -->"#;
        assert!(scanner.scan("docs", "/a.md", doc, "r1").await.is_err());
        assert!(scanner.store.slots_for_owner("/a.md").await.unwrap().is_empty());
        assert!(scanner.store.asset_paths().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rescan_keeps_existing_asset_revision() {
        let scanner = scanner();
        let doc = r#"<!-- afs:image id="a" desc="fox" -->"#;
        let slots = scanner.scan("docs", "/a.md", doc, "r1").await.unwrap();
        let before = scanner
            .store
            .get_source("docs", &slots[0].asset_path)
            .await
            .unwrap()
            .unwrap();

        scanner.scan("docs", "/b.md", doc, "r9").await.unwrap();
        let after = scanner
            .store
            .get_source("docs", &slots[0].asset_path)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(before, after);
    }
}
