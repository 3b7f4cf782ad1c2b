//! The model catalog: every (provider, model) pair the engine knows about.
//!
//! Entries come from two places: models declared in the engine config file, and models
//! reported by a provider's discovery call. Entries are never removed while the process runs,
//! even when the model is unloaded.
use bon::Builder;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tokio::time::Instant;
use tracing::debug;

/// Tag that marks a model as general purpose for requests without required tags.
pub const GENERAL_TAG: &str = "general";

/// Identity of a model: the provider that serves it and the provider's model id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelKey {
    pub provider: String,
    pub model_id: String,
}

impl ModelKey {
    pub fn new(provider: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model_id: model_id.into(),
        }
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model_id)
    }
}

/// Everything the engine knows about one model.
///
/// The static half (footprint, tags, roles, pinned) comes from config or discovery. The dynamic
/// half (resident, last used, responsive) is only ever written by the capacity ledger.
#[derive(Debug, Clone, Builder)]
pub struct ModelDescriptor {
    #[builder(into)]
    pub provider: String,
    #[builder(into)]
    pub model_id: String,
    /// Estimated bytes of VRAM the model occupies while resident
    #[builder(default)]
    pub estimated_footprint: u64,
    #[builder(default)]
    pub capability_tags: BTreeSet<String>,
    /// Roles this model serves. Empty means every role.
    #[builder(default)]
    pub roles: BTreeSet<String>,
    /// Pinned models are never evicted or purged
    #[builder(default)]
    pub pinned: bool,
    #[builder(skip)]
    resident: bool,
    #[builder(skip)]
    last_used: Option<Instant>,
    #[builder(skip = true)]
    responsive: bool,
    #[builder(skip)]
    evicting: bool,
}

impl ModelDescriptor {
    pub fn key(&self) -> ModelKey {
        ModelKey::new(self.provider.clone(), self.model_id.clone())
    }

    pub fn is_resident(&self) -> bool {
        self.resident
    }

    pub fn last_used(&self) -> Option<Instant> {
        self.last_used
    }

    pub fn is_responsive(&self) -> bool {
        self.responsive
    }

    /// Whether an unload of this model is currently in flight
    pub fn is_evicting(&self) -> bool {
        self.evicting
    }

    /// A model is general purpose when it carries no tags or the `general` tag.
    pub fn is_general_purpose(&self) -> bool {
        self.capability_tags.is_empty() || self.capability_tags.contains(GENERAL_TAG)
    }

    pub fn serves_role(&self, role: &str) -> bool {
        self.roles.is_empty() || self.roles.contains(role)
    }

    pub(crate) fn set_resident(&mut self, resident: bool) {
        self.resident = resident;
        if !resident {
            self.evicting = false;
        }
    }

    pub(crate) fn set_last_used(&mut self, at: Instant) {
        self.last_used = Some(at);
    }

    pub(crate) fn set_responsive(&mut self, responsive: bool) {
        self.responsive = responsive;
    }

    pub(crate) fn set_evicting(&mut self, evicting: bool) {
        self.evicting = evicting;
    }
}

/// Where a descriptor being merged into the catalog came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeSource {
    /// Declared in configuration: static fields are authoritative and overwrite.
    Declared,
    /// Reported by provider discovery: only fills in what is missing.
    Discovered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Added,
    Updated,
    Unchanged,
}

/// Ordered map of all known models.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    models: BTreeMap<ModelKey, ModelDescriptor>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_descriptors(descriptors: impl IntoIterator<Item = ModelDescriptor>) -> Self {
        let mut catalog = Self::new();
        for descriptor in descriptors {
            catalog.merge(descriptor, MergeSource::Declared, false);
        }
        catalog
    }

    pub fn get(&self, key: &ModelKey) -> Option<&ModelDescriptor> {
        self.models.get(key)
    }

    pub(crate) fn get_mut(&mut self, key: &ModelKey) -> Option<&mut ModelDescriptor> {
        self.models.get_mut(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelDescriptor> {
        self.models.values()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn resident(&self) -> impl Iterator<Item = &ModelDescriptor> {
        self.models.values().filter(|m| m.resident)
    }

    /// Merge a descriptor into the catalog.
    ///
    /// Dynamic state of an existing entry is always preserved. When `freeze_footprint` is set
    /// (the model is resident or has a load in flight) the footprint is left alone so the
    /// derived ledger usage cannot drift; it applies on the next load instead.
    pub(crate) fn merge(
        &mut self,
        incoming: ModelDescriptor,
        source: MergeSource,
        freeze_footprint: bool,
    ) -> MergeOutcome {
        let key = incoming.key();
        let Some(existing) = self.models.get_mut(&key) else {
            debug!(model = %key, ?source, "Adding model to catalog");
            self.models.insert(key, incoming);
            return MergeOutcome::Added;
        };

        let footprint_locked = freeze_footprint || existing.resident;
        let mut changed = false;
        match source {
            MergeSource::Declared => {
                if !footprint_locked && existing.estimated_footprint != incoming.estimated_footprint
                {
                    existing.estimated_footprint = incoming.estimated_footprint;
                    changed = true;
                }
                if existing.capability_tags != incoming.capability_tags {
                    existing.capability_tags = incoming.capability_tags;
                    changed = true;
                }
                if existing.roles != incoming.roles {
                    existing.roles = incoming.roles;
                    changed = true;
                }
                if existing.pinned != incoming.pinned {
                    existing.pinned = incoming.pinned;
                    changed = true;
                }
            }
            MergeSource::Discovered => {
                if !footprint_locked
                    && existing.estimated_footprint == 0
                    && incoming.estimated_footprint > 0
                {
                    existing.estimated_footprint = incoming.estimated_footprint;
                    changed = true;
                }
                if existing.capability_tags.is_empty() && !incoming.capability_tags.is_empty() {
                    existing.capability_tags = incoming.capability_tags;
                    changed = true;
                }
            }
        }

        if changed {
            MergeOutcome::Updated
        } else {
            MergeOutcome::Unchanged
        }
    }
}

/// Build a tag set from string slices.
pub fn tags<I, S>(items: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}
