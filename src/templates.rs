//! Template Registry - registered design frames and their placeholder layers
//!
//! Records live in client storage under `{type}_template_{variant}` (or the
//! single `sticker_template` key) and point at document nodes by id. A record
//! can outlive its node; staleness surfaces when the record is resolved.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{FrameSpec, Settings};
use crate::scene::{lock_document, NodeId, SceneError, SharedDocument};
use crate::storage::{ClientStorage, StorageError};
use crate::validation::{FrameSizeRule, PlaceholderRule, ValidationViolation};

pub const POSTER_KEY_PREFIX: &str = "poster_template_";
pub const FLYER_KEY_PREFIX: &str = "flyer_template_";
pub const STICKER_KEY: &str = "sticker_template";
pub const STICKER_DESIGN_NAME: &str = "Default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateKind {
    Poster,
    Flyer,
    Sticker,
}

impl TemplateKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Poster => "Poster",
            Self::Flyer => "Flyer",
            Self::Sticker => "Sticker",
        }
    }

    /// Substitutable text token; stickers carry none.
    pub fn placeholder_token(self) -> Option<&'static str> {
        match self {
            Self::Poster => Some("{poster_copy}"),
            Self::Flyer => Some("{flyer_copy}"),
            Self::Sticker => None,
        }
    }

    pub fn storage_key(self, variant: &str) -> String {
        match self {
            Self::Poster => format!("{}{}", POSTER_KEY_PREFIX, variant),
            Self::Flyer => format!("{}{}", FLYER_KEY_PREFIX, variant),
            Self::Sticker => STICKER_KEY.to_string(),
        }
    }

    pub fn frame_spec(self, settings: &Settings) -> &FrameSpec {
        match self {
            Self::Poster => &settings.frames.poster,
            Self::Flyer => &settings.frames.flyer,
            Self::Sticker => &settings.frames.sticker,
        }
    }

    /// Which registry family a storage key belongs to, if any.
    pub fn from_key(key: &str) -> Option<Self> {
        if key.starts_with(POSTER_KEY_PREFIX) {
            Some(Self::Poster)
        } else if key.starts_with(FLYER_KEY_PREFIX) {
            Some(Self::Flyer)
        } else if key == STICKER_KEY {
            Some(Self::Sticker)
        } else {
            None
        }
    }
}

impl fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextLayers {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poster_copy: Option<Vec<NodeId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flyer_copy: Option<Vec<NodeId>>,
}

impl TextLayers {
    fn for_kind(kind: TemplateKind, layers: Vec<NodeId>) -> Self {
        match kind {
            TemplateKind::Poster => Self {
                poster_copy: Some(layers),
                ..Self::default()
            },
            TemplateKind::Flyer => Self {
                flyer_copy: Some(layers),
                ..Self::default()
            },
            TemplateKind::Sticker => Self::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredTemplate {
    pub id: NodeId,
    pub name: String,
    pub design_name: String,
    #[serde(default)]
    pub text_layers: TextLayers,
}

/// A stored record together with the key it lives under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateEntry {
    #[serde(flatten)]
    pub template: StoredTemplate,
    pub key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateListing {
    pub posters: Vec<TemplateEntry>,
    pub flyers: Vec<TemplateEntry>,
    pub sticker: Option<TemplateEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateValidationFailure {
    pub key: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateValidation {
    pub valid: usize,
    pub invalid: usize,
    pub total: usize,
    pub failures: Vec<TemplateValidationFailure>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Please select exactly one frame to use as a template")]
    NotSingleFrame,

    #[error("{0}")]
    SizeMismatch(ValidationViolation),

    #[error("{0}")]
    MissingPlaceholder(ValidationViolation),

    #[error(transparent)]
    Scene(#[from] SceneError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("{kind} template \"{variant}\" not found. Please add this template first.")]
    TemplateNotFound { kind: TemplateKind, variant: String },

    #[error("Sticker template not found. Please add sticker template first.")]
    StickerTemplateNotFound,

    #[error("Template frame \"{name}\" ({id}) no longer exists. Please re-add this template.")]
    TemplateNodeGone { name: String, id: NodeId },

    #[error("Sticker template \"{name}\" no longer exists. Please re-add this template.")]
    StickerTemplateNodeGone { name: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub struct TemplateRegistry {
    storage: Arc<dyn ClientStorage>,
    document: SharedDocument,
    settings: Arc<Settings>,
}

impl TemplateRegistry {
    pub fn new(
        storage: Arc<dyn ClientStorage>,
        document: SharedDocument,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            storage,
            document,
            settings,
        }
    }

    /// Register the single selected frame as a template of `kind`.
    pub async fn add(
        &self,
        kind: TemplateKind,
        design_name: &str,
        selection: &[NodeId],
    ) -> Result<StoredTemplate, RegistryError> {
        let template = self.inspect_candidate(kind, design_name, selection)?;
        let key = kind.storage_key(design_name);
        let value = serde_json::to_value(&template).map_err(StorageError::from)?;
        self.storage.set(&key, value).await?;
        info!(key = %key, frame = %template.id, "template registered");
        Ok(template)
    }

    fn inspect_candidate(
        &self,
        kind: TemplateKind,
        design_name: &str,
        selection: &[NodeId],
    ) -> Result<StoredTemplate, RegistryError> {
        let document = lock_document(&self.document);
        let frame = match selection {
            [only] => document.node(only).filter(|node| node.is_frame()),
            _ => None,
        }
        .ok_or(RegistryError::NotSingleFrame)?;

        let size_rule = FrameSizeRule {
            spec: kind.frame_spec(&self.settings),
            tolerance: self.settings.size_tolerance,
        };
        if let Some(violation) = size_rule.check(frame) {
            return Err(RegistryError::SizeMismatch(violation));
        }

        let Some(token) = kind.placeholder_token() else {
            return Ok(StoredTemplate {
                id: frame.id.clone(),
                name: frame.name.clone(),
                design_name: STICKER_DESIGN_NAME.to_string(),
                text_layers: TextLayers::default(),
            });
        };

        let placeholder_rule = PlaceholderRule {
            token,
            label: kind.label(),
        };
        let layers = placeholder_rule
            .check(&document, &frame.id)
            .map_err(RegistryError::MissingPlaceholder)?;
        debug!(count = layers.len(), token, "placeholder layers found");

        Ok(StoredTemplate {
            id: frame.id.clone(),
            name: frame.name.clone(),
            design_name: design_name.to_string(),
            text_layers: TextLayers::for_kind(kind, layers),
        })
    }

    async fn load(&self, key: &str) -> Result<Option<StoredTemplate>, StorageError> {
        match self.storage.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Check every poster/flyer record against the live document. Never
    /// deletes anything.
    pub async fn validate_all(&self) -> Result<TemplateValidation, RegistryError> {
        let keys: Vec<String> = self
            .storage
            .keys()
            .await?
            .into_iter()
            .filter(|k| {
                matches!(
                    TemplateKind::from_key(k),
                    Some(TemplateKind::Poster | TemplateKind::Flyer)
                )
            })
            .collect();

        let mut report = TemplateValidation {
            total: keys.len(),
            ..Default::default()
        };
        for key in keys {
            let alive = match self.load(&key).await? {
                Some(template) => lock_document(&self.document).contains(&template.id),
                None => false,
            };
            if alive {
                report.valid += 1;
            } else {
                warn!(key = %key, "template frame no longer exists");
                report.invalid += 1;
                report.failures.push(TemplateValidationFailure {
                    key,
                    error: "Frame no longer exists".to_string(),
                });
            }
        }
        Ok(report)
    }

    pub async fn list(&self) -> Result<TemplateListing, RegistryError> {
        let mut keys = self.storage.keys().await?;
        keys.sort();

        let mut listing = TemplateListing::default();
        for key in keys {
            let Some(kind) = TemplateKind::from_key(&key) else {
                continue;
            };
            let Some(template) = self.load(&key).await? else {
                continue;
            };
            let entry = TemplateEntry { template, key };
            match kind {
                TemplateKind::Poster => listing.posters.push(entry),
                TemplateKind::Flyer => listing.flyers.push(entry),
                TemplateKind::Sticker => listing.sticker = Some(entry),
            }
        }
        Ok(listing)
    }

    pub async fn delete(&self, key: &str) -> Result<(), RegistryError> {
        self.storage.delete(key).await?;
        info!(key, "template deleted");
        Ok(())
    }

    /// Remove every record of the three template families; returns how many.
    pub async fn clear_all(&self) -> Result<usize, RegistryError> {
        let keys: Vec<String> = self
            .storage
            .keys()
            .await?
            .into_iter()
            .filter(|k| TemplateKind::from_key(k).is_some())
            .collect();
        for key in &keys {
            self.storage.delete(key).await?;
        }
        info!(count = keys.len(), "templates cleared");
        Ok(keys.len())
    }

    /// Find the record for `kind`/`variant` and confirm its frame still exists.
    pub async fn resolve(
        &self,
        kind: TemplateKind,
        variant: &str,
    ) -> Result<StoredTemplate, ResolveError> {
        let template = self
            .load(&kind.storage_key(variant))
            .await?
            .ok_or_else(|| match kind {
                TemplateKind::Sticker => ResolveError::StickerTemplateNotFound,
                _ => ResolveError::TemplateNotFound {
                    kind,
                    variant: variant.to_string(),
                },
            })?;

        if !lock_document(&self.document).contains(&template.id) {
            return Err(match kind {
                TemplateKind::Sticker => ResolveError::StickerTemplateNodeGone {
                    name: template.name,
                },
                _ => ResolveError::TemplateNodeGone {
                    name: template.name,
                    id: template.id,
                },
            });
        }
        Ok(template)
    }
}
