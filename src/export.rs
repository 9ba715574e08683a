//! Export Pipeline - sequential PNG export
//!
//! One node at a time: resolve, rasterize at a fixed scale, hand the bytes to
//! the UI, then pause briefly so the host can repaint between renders.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ExportSettings;
use crate::host::{HostError, Rasterizer};
use crate::protocol::{Event, Outbox, Progress};
use crate::scene::{lock_document, NodeId, NodeType, SharedDocument};

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("{name}: {source}")]
    Raster {
        name: String,
        #[source]
        source: HostError,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportSummary {
    pub batch_id: String,
    pub started_at: DateTime<Utc>,
    pub requested: usize,
    pub exported: usize,
    pub skipped: Vec<NodeId>,
}

/// Frames and components are the only exportable node types.
fn is_exportable(node_type: NodeType) -> bool {
    matches!(node_type, NodeType::Frame | NodeType::Component)
}

pub struct ExportPipeline {
    document: SharedDocument,
    rasterizer: Arc<dyn Rasterizer>,
    outbox: Outbox,
    settings: ExportSettings,
}

impl ExportPipeline {
    pub fn new(
        document: SharedDocument,
        rasterizer: Arc<dyn Rasterizer>,
        outbox: Outbox,
        settings: ExportSettings,
    ) -> Self {
        Self {
            document,
            rasterizer,
            outbox,
            settings,
        }
    }

    /// Export every exportable node in `node_ids`, in order.
    ///
    /// `index` and `total` on each image event refer to positions in the
    /// requested list, skipped ids included. A rasterization failure stops
    /// the batch; images already sent stay sent.
    pub async fn export_all(&self, node_ids: &[NodeId]) -> Result<ExportSummary, ExportError> {
        let total = node_ids.len();
        let mut summary = ExportSummary {
            batch_id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            requested: total,
            exported: 0,
            skipped: vec![],
        };
        info!(batch = %summary.batch_id, total, "export started");
        self.outbox.notify("Exporting frames as PNG...");
        self.outbox.send(Event::ExportStarted { total });

        for (i, node_id) in node_ids.iter().enumerate() {
            let name = {
                let document = lock_document(&self.document);
                match document.node(node_id) {
                    Some(node) if is_exportable(node.node_type()) => Some(node.name.clone()),
                    Some(node) => {
                        warn!(
                            node = %node_id,
                            node_type = ?node.node_type(),
                            "not exportable, skipping"
                        );
                        None
                    }
                    None => {
                        warn!(node = %node_id, "node not found, skipping");
                        None
                    }
                }
            };
            let Some(name) = name else {
                summary.skipped.push(node_id.clone());
                continue;
            };

            self.outbox.send(Event::ExportProgress(Progress::new(i + 1, total)));
            let bytes = self
                .rasterizer
                .export_png(&self.document, node_id, self.settings.scale)
                .await
                .map_err(|source| ExportError::Raster {
                    name: name.clone(),
                    source,
                })?;

            debug!(node = %node_id, size = bytes.len(), "exported");
            self.outbox.send(Event::ExportImage {
                name,
                bytes,
                index: i,
                total,
            });
            summary.exported += 1;

            tokio::time::sleep(self.settings.delay()).await;
        }

        info!(
            batch = %summary.batch_id,
            exported = summary.exported,
            skipped = summary.skipped.len(),
            "export finished"
        );
        self.outbox.send(Event::ExportComplete { total });
        self.outbox.notify(format!("✓ Successfully exported {} PNG files!", total));
        Ok(summary)
    }
}
