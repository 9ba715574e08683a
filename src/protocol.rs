//! Message Protocol - typed commands in, events out
//!
//! Wire form is `{"type": "<kebab-case>", "data": {...}}` in both directions.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::generator::GenerationOptions;
use crate::hashing::base64_bytes;
use crate::rows::RowRecord;
use crate::scene::NodeId;
use crate::templates::{StoredTemplate, TemplateKind, TemplateListing};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum Command {
    #[serde(rename_all = "camelCase")]
    AddTemplate {
        #[serde(rename = "type")]
        kind: TemplateKind,
        #[serde(default)]
        design_name: String,
    },
    ValidateTemplates,
    #[serde(rename_all = "camelCase")]
    GenerateMaterials {
        csv_data: Vec<RowRecord>,
        #[serde(default)]
        options: GenerationOptions,
    },
    #[serde(rename = "export-as-png", rename_all = "camelCase")]
    ExportAsPng { node_ids: Vec<NodeId> },
    GetStoredTemplates,
    ClearAllTemplates,
    DeleteTemplate { key: String },
    #[serde(rename_all = "camelCase")]
    QrCodeGenerated {
        frame_id: NodeId,
        #[serde(with = "base64_bytes")]
        qr_code_bytes: Vec<u8>,
    },
    #[serde(rename_all = "camelCase")]
    QrCodeError { frame_id: NodeId, error: String },
    Cancel,
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AddTemplate { .. } => "add-template",
            Self::ValidateTemplates => "validate-templates",
            Self::GenerateMaterials { .. } => "generate-materials",
            Self::ExportAsPng { .. } => "export-as-png",
            Self::GetStoredTemplates => "get-stored-templates",
            Self::ClearAllTemplates => "clear-all-templates",
            Self::DeleteTemplate { .. } => "delete-template",
            Self::QrCodeGenerated { .. } => "qr-code-generated",
            Self::QrCodeError { .. } => "qr-code-error",
            Self::Cancel => "cancel",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub current: usize,
    pub total: usize,
    pub percentage: u32,
}

impl Progress {
    /// A zero total reports 0 %.
    pub fn new(current: usize, total: usize) -> Self {
        let percentage = if total == 0 {
            0
        } else {
            ((current as f64 / total as f64) * 100.0).round() as u32
        };
        Self {
            current,
            total,
            percentage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum Event {
    Error { message: String },
    #[serde(rename_all = "camelCase")]
    TemplateAdded {
        #[serde(flatten)]
        template: StoredTemplate,
        template_type: TemplateKind,
    },
    TemplateValidationError { key: String, error: String },
    ValidationComplete {
        valid: usize,
        invalid: usize,
        total: usize,
    },
    ProgressUpdate(Progress),
    #[serde(rename_all = "camelCase")]
    GenerationComplete {
        total: usize,
        errors: Option<Vec<String>>,
        node_ids: Vec<NodeId>,
    },
    StoredTemplates(TemplateListing),
    TemplatesCleared,
    ExportStarted { total: usize },
    ExportProgress(Progress),
    ExportImage {
        name: String,
        #[serde(with = "base64_bytes")]
        bytes: Vec<u8>,
        index: usize,
        total: usize,
    },
    ExportComplete { total: usize },
    #[serde(rename_all = "camelCase")]
    GenerateQrCode {
        frame_id: NodeId,
        url: String,
        color: String,
    },
    /// Transient toast shown by the host.
    Notify { message: String, error: bool },
}

/// Outbound half of the channel to the UI.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Event>,
}

impl Outbox {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Fire and forget; a UI that went away is not an error for the core.
    pub fn send(&self, event: Event) {
        if let Err(e) = self.tx.send(event) {
            debug!(event = ?e.0, "outbox closed, event dropped");
        }
    }

    pub fn notify(&self, message: impl Into<String>) {
        self.send(Event::Notify {
            message: message.into(),
            error: false,
        });
    }

    pub fn notify_error(&self, message: impl Into<String>) {
        self.send(Event::Notify {
            message: message.into(),
            error: true,
        });
    }
}
