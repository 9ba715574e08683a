//! Generation Orchestrator - store rows to document artifacts
//!
//! Every row and every material within a row is guarded on its own: a
//! failure becomes one line in the report and the run moves on.

use chrono::{Datelike, Local};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{ContainerSpacing, Settings};
use crate::host::FontLoader;
use crate::protocol::{Event, Outbox, Progress};
use crate::qr::QrCoordinator;
use crate::rows::{self, InvalidDesignOption, RowRecord, StoreFields};
use crate::scene::{
    lock_document, AutoLayout, FontName, LayoutMode, NodeId, SceneError, SharedDocument, Sizing,
};
use crate::templates::{ResolveError, TemplateKind, TemplateRegistry};

pub const WEBSITE_URL_KEY: &str = "websiteUrl";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GenerationOptions {
    pub generate_posters: bool,
    pub generate_flyers: bool,
    pub generate_stickers: bool,
    pub group_by_brand: bool,
}

impl GenerationOptions {
    pub fn enabled(&self, kind: TemplateKind) -> bool {
        match kind {
            TemplateKind::Poster => self.generate_posters,
            TemplateKind::Flyer => self.generate_flyers,
            TemplateKind::Sticker => self.generate_stickers,
        }
    }

    pub fn enabled_count(&self) -> usize {
        [TemplateKind::Poster, TemplateKind::Flyer, TemplateKind::Sticker]
            .into_iter()
            .filter(|kind| self.enabled(*kind))
            .count()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationReport {
    pub processed: usize,
    pub errors: Vec<String>,
    pub node_ids: Vec<NodeId>,
    pub container_id: NodeId,
}

#[derive(Debug, Error)]
pub enum ItemError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    InvalidFormat(#[from] InvalidDesignOption),

    #[error(transparent)]
    Scene(#[from] SceneError),
}

/// One material to produce for one row.
struct Material<'a> {
    kind: TemplateKind,
    design: &'a str,
    copy: &'a str,
}

pub struct Generator {
    registry: Arc<TemplateRegistry>,
    document: SharedDocument,
    fonts: Arc<dyn FontLoader>,
    qr: Arc<QrCoordinator>,
    outbox: Outbox,
    settings: Arc<Settings>,
}

fn run_container_name() -> String {
    let today = Local::now();
    format!(
        "Otter Order Materials - {}. {}. {}.",
        today.year(),
        today.month(),
        today.day()
    )
}

fn hug_layout(mode: LayoutMode, spacing: ContainerSpacing) -> AutoLayout {
    AutoLayout {
        mode,
        sizing: Sizing::Hug,
        item_spacing: spacing.item_spacing,
        padding: spacing.padding,
    }
}

impl Generator {
    pub fn new(
        registry: Arc<TemplateRegistry>,
        document: SharedDocument,
        fonts: Arc<dyn FontLoader>,
        qr: Arc<QrCoordinator>,
        outbox: Outbox,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            registry,
            document,
            fonts,
            qr,
            outbox,
            settings,
        }
    }

    /// Produce every enabled material for every row, then select and focus
    /// the run container and report.
    ///
    /// The progress denominator is `rows × enabled kinds`, fixed up front;
    /// skipped rows and failed items leave the final percentage short of 100.
    pub async fn generate(
        &self,
        rows: &[RowRecord],
        options: &GenerationOptions,
    ) -> Result<GenerationReport, SceneError> {
        let total = rows.len() * options.enabled_count();
        let container = self.create_container(
            &run_container_name(),
            LayoutMode::Vertical,
            self.settings.layout.run,
            None,
        )?;
        info!(rows = rows.len(), total, container = %container, "generation started");

        let mut report = GenerationReport {
            container_id: container.clone(),
            ..Default::default()
        };

        for (index, row) in rows.iter().enumerate() {
            let fields = match rows::extract_fields(row) {
                Ok(fields) => fields,
                Err(skip) => {
                    let note = format!("Row {}: {}", index + 1, skip);
                    warn!("{}", note);
                    report.errors.push(note);
                    continue;
                }
            };

            let parent = if options.group_by_brand {
                let name = format!("{} - Materials", fields.store_name);
                match self.create_container(
                    &name,
                    LayoutMode::Horizontal,
                    self.settings.layout.brand,
                    Some(container.as_str()),
                ) {
                    Ok(brand) => brand,
                    Err(e) => {
                        let note = format!("Row {}: {}", index + 1, e);
                        error!("{}", note);
                        report.errors.push(note);
                        continue;
                    }
                }
            } else {
                container.clone()
            };

            self.generate_row(&fields, options, &parent, total, &mut report)
                .await;
        }

        {
            let mut document = lock_document(&self.document);
            document.set_selection(vec![container.clone()]);
            document.scroll_and_zoom_into_view(vec![container.clone()]);
        }

        info!(
            processed = report.processed,
            errors = report.errors.len(),
            "generation finished"
        );
        self.outbox.send(Event::GenerationComplete {
            total: report.processed,
            errors: (!report.errors.is_empty()).then(|| report.errors.clone()),
            node_ids: report.node_ids.clone(),
        });
        if report.errors.is_empty() {
            self.outbox.notify(format!(
                "✓ Successfully generated {} materials!",
                report.processed
            ));
        } else {
            self.outbox.notify_error(format!(
                "⚠️ Generated {} items with {} error(s). Check console for details.",
                report.processed,
                report.errors.len()
            ));
        }
        Ok(report)
    }

    async fn generate_row(
        &self,
        fields: &StoreFields,
        options: &GenerationOptions,
        parent: &str,
        total: usize,
        report: &mut GenerationReport,
    ) {
        let poster_copy = rows::substitute(
            &fields.poster_copy,
            &fields.store_name,
            &fields.discount_amount,
        );
        let flyer_copy = rows::substitute(
            &fields.flyer_copy,
            &fields.store_name,
            &fields.discount_amount,
        );

        let materials = [
            Material {
                kind: TemplateKind::Poster,
                design: &fields.poster_design,
                copy: &poster_copy,
            },
            Material {
                kind: TemplateKind::Flyer,
                design: &fields.flyer_design,
                copy: &flyer_copy,
            },
            Material {
                kind: TemplateKind::Sticker,
                design: "",
                copy: "",
            },
        ];

        for material in materials {
            if !options.enabled(material.kind) {
                continue;
            }
            // Posters and flyers only for rows that picked a design.
            if material.kind != TemplateKind::Sticker && material.design.is_empty() {
                continue;
            }

            match self.generate_material(&material, fields, parent).await {
                Ok(node_id) => {
                    if let Err(e) = self.qr.embed(&node_id, &fields.website_url).await {
                        error!(frame = %node_id, error = %e, "QR code not embedded");
                    }
                    report.node_ids.push(node_id);
                    report.processed += 1;
                    self.outbox.send(Event::ProgressUpdate(Progress::new(
                        report.processed,
                        total,
                    )));
                }
                Err(e) => {
                    let note = format!("{} for {}: {}", material.kind, fields.store_name, e);
                    error!("{}", note);
                    report.errors.push(note);
                }
            }
        }
    }

    async fn generate_material(
        &self,
        material: &Material<'_>,
        fields: &StoreFields,
        parent: &str,
    ) -> Result<NodeId, ItemError> {
        let node_id = match material.kind {
            TemplateKind::Sticker => self.generate_sticker(&fields.store_name, parent).await?,
            kind => {
                let variant = rows::map_design_option(material.design)?;
                self.generate_copy_material(
                    kind,
                    &fields.store_name,
                    &variant,
                    material.copy,
                    parent,
                )
                .await?
            }
        };
        lock_document(&self.document).set_plugin_data(
            &node_id,
            WEBSITE_URL_KEY,
            &fields.website_url,
        )?;
        Ok(node_id)
    }

    pub async fn generate_poster(
        &self,
        store_name: &str,
        variant: &str,
        copy: &str,
        parent: &str,
    ) -> Result<NodeId, ItemError> {
        self.generate_copy_material(TemplateKind::Poster, store_name, variant, copy, parent)
            .await
    }

    pub async fn generate_flyer(
        &self,
        store_name: &str,
        variant: &str,
        copy: &str,
        parent: &str,
    ) -> Result<NodeId, ItemError> {
        self.generate_copy_material(TemplateKind::Flyer, store_name, variant, copy, parent)
            .await
    }

    /// Stickers are static apart from the QR code, which is embedded separately.
    pub async fn generate_sticker(
        &self,
        store_name: &str,
        parent: &str,
    ) -> Result<NodeId, ItemError> {
        let template = self.registry.resolve(TemplateKind::Sticker, "").await?;
        let name = format!("{} - Sticker (40mm)", store_name);
        Ok(self.clone_into(&template.id, &name, parent)?)
    }

    async fn generate_copy_material(
        &self,
        kind: TemplateKind,
        store_name: &str,
        variant: &str,
        copy: &str,
        parent: &str,
    ) -> Result<NodeId, ItemError> {
        let template = self.registry.resolve(kind, variant).await?;
        let name = format!("{} - {} ({})", store_name, kind, variant);
        let clone = self.clone_into(&template.id, &name, parent)?;
        if let Some(token) = kind.placeholder_token() {
            self.replace_text(&clone, token, copy).await?;
        }
        debug!(kind = %kind, clone = %clone, "material generated");
        Ok(clone)
    }

    fn clone_into(
        &self,
        template_id: &str,
        name: &str,
        parent: &str,
    ) -> Result<NodeId, SceneError> {
        let mut document = lock_document(&self.document);
        let clone = document.clone_subtree(template_id)?;
        document.set_name(&clone, name)?;
        if let Err(e) = document.append_child(parent, &clone) {
            document.remove(&clone)?;
            return Err(e);
        }
        Ok(clone)
    }

    /// Replace `token` with `copy` in every text node under `root`. Fonts in
    /// each affected node are loaded first; a font that fails to load is
    /// logged and the text is replaced anyway.
    pub async fn replace_text(
        &self,
        root: &str,
        token: &str,
        copy: &str,
    ) -> Result<usize, SceneError> {
        let targets: Vec<(NodeId, Vec<FontName>)> = {
            let document = lock_document(&self.document);
            let mut found = vec![];
            document.walk(root, &mut |node| {
                if node.characters().is_some_and(|text| text.contains(token)) {
                    found.push((node.id.clone(), node.fonts()));
                }
            });
            found
        };

        for (node_id, fonts) in &targets {
            for font in fonts {
                if let Err(e) = self.fonts.load_font(font).await {
                    warn!(
                        family = %font.family,
                        style = %font.style,
                        error = %e,
                        "could not load font"
                    );
                }
            }

            let mut document = lock_document(&self.document);
            let replaced = match document.get(node_id)?.characters() {
                Some(text) => text.replace(token, copy),
                None => continue,
            };
            document.set_characters(node_id, &replaced)?;
        }
        Ok(targets.len())
    }

    fn create_container(
        &self,
        name: &str,
        mode: LayoutMode,
        spacing: ContainerSpacing,
        parent: Option<&str>,
    ) -> Result<NodeId, SceneError> {
        let mut document = lock_document(&self.document);
        let id = document.create_frame(name, 0.0, 0.0);
        document.set_layout(&id, hug_layout(mode, spacing))?;
        match parent {
            Some(parent) => document.append_child(parent, &id)?,
            None => document.append_to_page(&id)?,
        }
        Ok(id)
    }
}
