//! Host Services - font loading and rasterization
//!
//! Both are suspension points on the host's single loop and neither has a
//! timeout: a host that hangs here hangs the run.

use async_trait::async_trait;
use image::{imageops, ImageFormat, Rgba, RgbaImage};
use std::collections::BTreeSet;
use std::io::Cursor;
use thiserror::Error;

use crate::scene::{
    lock_document, Document, FontName, Node, NodeId, NodeKind, SharedDocument,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HostError {
    #[error("Font {family} {style} is not available")]
    FontUnavailable { family: String, style: String },

    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Rasterization failed: {0}")]
    Raster(String),
}

#[async_trait]
pub trait FontLoader: Send + Sync {
    async fn load_font(&self, font: &FontName) -> Result<(), HostError>;
}

#[async_trait]
pub trait Rasterizer: Send + Sync {
    /// Render `node_id` to PNG bytes at `scale` × its size.
    async fn export_png(
        &self,
        document: &SharedDocument,
        node_id: &str,
        scale: f64,
    ) -> Result<Vec<u8>, HostError>;
}

/// Font loader backed by a fixed set of installed fonts. `None` accepts any font.
#[derive(Debug, Clone, Default)]
pub struct InstalledFonts {
    fonts: Option<BTreeSet<FontName>>,
}

impl InstalledFonts {
    pub fn any() -> Self {
        Self { fonts: None }
    }

    pub fn only(fonts: impl IntoIterator<Item = FontName>) -> Self {
        Self {
            fonts: Some(fonts.into_iter().collect()),
        }
    }
}

#[async_trait]
impl FontLoader for InstalledFonts {
    async fn load_font(&self, font: &FontName) -> Result<(), HostError> {
        match &self.fonts {
            Some(installed) if !installed.contains(font) => Err(HostError::FontUnavailable {
                family: font.family.clone(),
                style: font.style.clone(),
            }),
            _ => Ok(()),
        }
    }
}

/// Flat preview renderer: solid fills and placed images, no glyphs.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreviewRasterizer;

const BACKGROUND: Rgba<u8> = Rgba([255, 255, 255, 255]);

fn parse_hex_color(hex: &str) -> Option<Rgba<u8>> {
    let hex = hex.strip_prefix('#').unwrap_or(hex);
    if hex.len() != 6 {
        return None;
    }
    let channel = |i: usize| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok();
    Some(Rgba([channel(0)?, channel(2)?, channel(4)?, 255]))
}

fn scaled(value: f64, scale: f64) -> u32 {
    (value * scale).round().max(1.0) as u32
}

impl PreviewRasterizer {
    pub fn render(
        &self,
        document: &Document,
        node_id: &str,
        scale: f64,
    ) -> Result<Vec<u8>, HostError> {
        let root = document
            .node(node_id)
            .ok_or_else(|| HostError::NodeNotFound(node_id.to_string()))?;
        let mut canvas = RgbaImage::from_pixel(
            scaled(root.width, scale),
            scaled(root.height, scale),
            root.fill.as_deref().and_then(parse_hex_color).unwrap_or(BACKGROUND),
        );
        for child in root.children() {
            self.paint(document, child, (0.0, 0.0), scale, &mut canvas)?;
        }

        let mut bytes = Vec::new();
        canvas
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .map_err(|e| HostError::Raster(e.to_string()))?;
        Ok(bytes)
    }

    fn paint(
        &self,
        document: &Document,
        node_id: &str,
        origin: (f64, f64),
        scale: f64,
        canvas: &mut RgbaImage,
    ) -> Result<(), HostError> {
        let Some(node) = document.node(node_id) else {
            return Ok(());
        };
        let at = (origin.0 + node.x, origin.1 + node.y);
        let (x, y) = ((at.0 * scale).round() as i64, (at.1 * scale).round() as i64);

        if let Some(color) = node.fill.as_deref().and_then(parse_hex_color) {
            let block = RgbaImage::from_pixel(
                scaled(node.width, scale),
                scaled(node.height, scale),
                color,
            );
            imageops::overlay(canvas, &block, x, y);
        }
        if let NodeKind::Image { image_hash, .. } = &node.kind {
            self.paint_image(document, node, image_hash, (x, y), scale, canvas)?;
        }
        for child in node.children() {
            self.paint(document, child, at, scale, canvas)?;
        }
        Ok(())
    }

    /// Fit the stored image inside the node bounds, centred.
    fn paint_image(
        &self,
        document: &Document,
        node: &Node,
        image_hash: &str,
        (x, y): (i64, i64),
        scale: f64,
        canvas: &mut RgbaImage,
    ) -> Result<(), HostError> {
        let Some(bytes) = document.image(image_hash) else {
            return Ok(());
        };
        let decoded = image::load_from_memory(bytes)
            .map_err(|e| HostError::Raster(format!("image {}: {}", image_hash, e)))?
            .to_rgba8();

        let (box_w, box_h) = (scaled(node.width, scale), scaled(node.height, scale));
        let ratio = f64::min(
            f64::from(box_w) / f64::from(decoded.width().max(1)),
            f64::from(box_h) / f64::from(decoded.height().max(1)),
        );
        let fit_w = scaled(f64::from(decoded.width()), ratio);
        let fit_h = scaled(f64::from(decoded.height()), ratio);
        let fitted = imageops::resize(&decoded, fit_w, fit_h, imageops::FilterType::Nearest);
        let offset_x = x + i64::from(box_w.saturating_sub(fit_w) / 2);
        let offset_y = y + i64::from(box_h.saturating_sub(fit_h) / 2);
        imageops::overlay(canvas, &fitted, offset_x, offset_y);
        Ok(())
    }
}

#[async_trait]
impl Rasterizer for PreviewRasterizer {
    async fn export_png(
        &self,
        document: &SharedDocument,
        node_id: &str,
        scale: f64,
    ) -> Result<Vec<u8>, HostError> {
        let document = lock_document(document);
        self.render(&document, node_id, scale)
    }
}
