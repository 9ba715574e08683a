//! QR Code Coordinator - round trips QR renders with the external renderer
//!
//! The core never draws QR pixels. It asks the renderer through the outbox,
//! parks the artifact on a ticket keyed by frame id, and installs whatever
//! bytes come back. A ticket ends exactly once: delivered, failed, or timed out.

use regex::Regex;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::config::QrSettings;
use crate::protocol::{Event, Outbox};
use crate::scene::{lock_document, Document, NodeId, ScaleMode, SceneError, SharedDocument};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QrError {
    #[error("{0}")]
    Renderer(String),

    #[error("Frame not found")]
    FrameNotFound,

    #[error("QR code install failed: {0}")]
    Install(#[from] SceneError),
}

/// Where the QR image goes and what colour the renderer should draw it in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrPlaceholder {
    pub node_id: NodeId,
    pub color: String,
}

/// First frame under `root` (root included, depth-first) whose name contains
/// `marker`, ignoring case.
pub fn find_qr_placeholder(
    document: &Document,
    root: &str,
    settings: &QrSettings,
) -> Option<QrPlaceholder> {
    let marker = settings.marker.to_lowercase();
    document
        .find_first(root, &|node| {
            node.is_frame() && node.name.to_lowercase().contains(&marker)
        })
        .map(|node| QrPlaceholder {
            node_id: node.id.clone(),
            color: extract_color(&node.name, settings),
        })
}

fn color_suffix_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^_#?([0-9a-f]{6})").expect("colour suffix pattern is valid")
    })
}

/// `qrcode_here_#ff0000` or `qrcode_here_FF0000` → `#FF0000`; anything else
/// falls back to the default colour.
pub fn extract_color(name: &str, settings: &QrSettings) -> String {
    let lowered = name.to_lowercase();
    let marker = settings.marker.to_lowercase();
    let hex = lowered
        .match_indices(marker.as_str())
        .filter(|_| !marker.is_empty())
        .find_map(|(at, _)| color_suffix_pattern().captures(&lowered[at + marker.len()..]))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_uppercase());

    match hex {
        Some(hex) => format!("#{}", hex),
        None => {
            debug!(
                frame = name,
                color = %settings.default_color,
                "no colour in placeholder name"
            );
            settings.default_color.clone()
        }
    }
}

struct Ticket {
    seq: u64,
    done: oneshot::Sender<Result<(), QrError>>,
}

#[derive(Default)]
struct Tickets {
    next_seq: u64,
    pending: HashMap<NodeId, Ticket>,
}

pub struct QrCoordinator {
    document: SharedDocument,
    outbox: Outbox,
    settings: QrSettings,
    tickets: Mutex<Tickets>,
}

impl QrCoordinator {
    pub fn new(document: SharedDocument, outbox: Outbox, settings: QrSettings) -> Self {
        Self {
            document,
            outbox,
            settings,
            tickets: Mutex::new(Tickets::default()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.settings.timeout()
    }

    fn tickets(&self) -> MutexGuard<'_, Tickets> {
        self.tickets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pending_count(&self) -> usize {
        self.tickets().pending.len()
    }

    pub fn is_pending(&self, frame_id: &str) -> bool {
        self.tickets().pending.contains_key(frame_id)
    }

    /// Ask the renderer for a QR code for `url` and wait until it is installed
    /// in `frame_id`'s placeholder, the renderer reports an error, or the
    /// timeout passes. Timing out is not an error.
    pub async fn embed(&self, frame_id: &str, url: &str) -> Result<(), QrError> {
        if url.trim().is_empty() {
            debug!(frame = frame_id, "no website URL, skipping QR code");
            return Ok(());
        }

        let placeholder = {
            let document = lock_document(&self.document);
            if !document.contains(frame_id) {
                error!(frame = frame_id, "frame not found for QR code");
                return Ok(());
            }
            find_qr_placeholder(&document, frame_id, &self.settings)
        };
        let Some(placeholder) = placeholder else {
            debug!(frame = frame_id, "no QR placeholder, skipping QR code");
            return Ok(());
        };

        let (seq, done) = self.register(frame_id);
        info!(frame = frame_id, url, color = %placeholder.color, "requesting QR code");
        self.outbox.send(Event::GenerateQrCode {
            frame_id: frame_id.to_string(),
            url: url.to_string(),
            color: placeholder.color,
        });

        match tokio::time::timeout(self.timeout(), done).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                debug!(frame = frame_id, "QR ticket superseded");
                Ok(())
            }
            Err(_) => {
                self.expire(frame_id, seq);
                warn!(
                    frame = frame_id,
                    timeout = ?self.timeout(),
                    "QR code generation timed out"
                );
                Ok(())
            }
        }
    }

    /// One ticket per frame: a newer request replaces an older one, whose
    /// waiter then returns as if it had timed out.
    fn register(&self, frame_id: &str) -> (u64, oneshot::Receiver<Result<(), QrError>>) {
        let (tx, rx) = oneshot::channel();
        let mut tickets = self.tickets();
        tickets.next_seq += 1;
        let seq = tickets.next_seq;
        let replaced = tickets
            .pending
            .insert(frame_id.to_string(), Ticket { seq, done: tx });
        if replaced.is_some() {
            warn!(frame = frame_id, "replacing outstanding QR ticket");
        }
        (seq, rx)
    }

    fn expire(&self, frame_id: &str, seq: u64) {
        let mut tickets = self.tickets();
        if tickets.pending.get(frame_id).is_some_and(|t| t.seq == seq) {
            tickets.pending.remove(frame_id);
        }
    }

    fn settle(&self, frame_id: &str, outcome: Result<(), QrError>) {
        let ticket = self.tickets().pending.remove(frame_id);
        match ticket {
            Some(ticket) => {
                // The waiter may already be gone; nothing left to tell.
                let _ = ticket.done.send(outcome);
            }
            None => debug!(frame = frame_id, "no pending QR ticket"),
        }
    }

    /// Renderer success: install the image, then settle the ticket.
    pub fn deliver_image(&self, frame_id: &str, bytes: &[u8]) {
        info!(frame = frame_id, size = bytes.len(), "received QR code");
        let outcome = self.install(frame_id, bytes);
        if let Err(e) = &outcome {
            error!(frame = frame_id, error = %e, "QR code not inserted");
        }
        self.settle(frame_id, outcome);
    }

    /// Renderer failure: settle the ticket with the carried message.
    pub fn deliver_error(&self, frame_id: &str, message: &str) {
        error!(frame = frame_id, error = message, "QR code generation error");
        self.settle(frame_id, Err(QrError::Renderer(message.to_string())));
    }

    fn install(&self, frame_id: &str, bytes: &[u8]) -> Result<(), QrError> {
        let mut document = lock_document(&self.document);
        if !document.contains(frame_id) {
            return Err(QrError::FrameNotFound);
        }
        let Some(placeholder) = find_qr_placeholder(&document, frame_id, &self.settings)
        else {
            warn!(frame = frame_id, "no QR placeholder to fill");
            return Ok(());
        };

        let (width, height) = {
            let node = document.get(&placeholder.node_id)?;
            (node.width, node.height)
        };
        document.remove_children(&placeholder.node_id)?;
        let hash = document.add_image(bytes);
        let image = document.create_image("QR Code", width, height, &hash, ScaleMode::Fit);
        document.append_child(&placeholder.node_id, &image)?;
        debug!(
            frame = frame_id,
            placeholder = %placeholder.node_id,
            "QR code inserted"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{self, NodeKind};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn artifact(placeholder_name: &str) -> (SharedDocument, NodeId, NodeId) {
        let mut doc = Document::new();
        let frame = doc.create_frame("Cafe A - Poster (Design 1)", 100.0, 100.0);
        doc.append_to_page(&frame).unwrap();
        let slot = doc.create_frame(placeholder_name, 30.0, 40.0);
        doc.append_child(&frame, &slot).unwrap();
        let old = doc.create_rectangle("placeholder art", 30.0, 40.0);
        doc.append_child(&slot, &old).unwrap();
        (scene::shared(doc), frame, slot)
    }

    fn coordinator(
        document: SharedDocument,
    ) -> (Arc<QrCoordinator>, mpsc::UnboundedReceiver<Event>) {
        let (outbox, rx) = Outbox::channel();
        let qr = QrCoordinator::new(document, outbox, QrSettings::default());
        (Arc::new(qr), rx)
    }

    #[test]
    fn test_color_from_placeholder_name() {
        let settings = QrSettings::default();
        assert_eq!(extract_color("qrcode_here_#ff00aa", &settings), "#FF00AA");
        assert_eq!(extract_color("QRCODE_HERE_00ff00", &settings), "#00FF00");
        assert_eq!(extract_color("qrcode_here", &settings), "#000000");
        assert_eq!(extract_color("qrcode_here_#12345", &settings), "#000000");
        assert_eq!(
            extract_color("Slot qrcode_here qrcode_here_#0a0B0c", &settings),
            "#0A0B0C"
        );
    }

    #[test]
    fn test_placeholder_search_is_case_insensitive() {
        let (document, frame, slot) = artifact("Big QRCode_Here_#123ABC slot");
        let doc = lock_document(&document);
        let found = find_qr_placeholder(&doc, &frame, &QrSettings::default()).unwrap();
        assert_eq!(
            found,
            QrPlaceholder {
                node_id: slot,
                color: "#123ABC".into()
            }
        );
    }

    #[tokio::test]
    async fn test_blank_url_or_missing_placeholder_is_noop() {
        let (document, frame, _) = artifact("logo");
        let (qr, mut events) = coordinator(document);

        qr.embed(&frame, "  ").await.unwrap();
        qr.embed(&frame, "https://a.example").await.unwrap();
        qr.embed("missing", "https://a.example").await.unwrap();
        assert!(events.try_recv().is_err());
        assert_eq!(qr.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_delivered_image_replaces_placeholder_contents() {
        let (document, frame, slot) = artifact("qrcode_here_#FF0000");
        let (qr, mut events) = coordinator(document.clone());

        let renderer = {
            let qr = qr.clone();
            tokio::spawn(async move {
                match events.recv().await {
                    Some(Event::GenerateQrCode {
                        frame_id,
                        url,
                        color,
                    }) => {
                        assert_eq!(url, "https://a.example");
                        assert_eq!(color, "#FF0000");
                        qr.deliver_image(&frame_id, b"png-bytes");
                    }
                    other => panic!("unexpected event {:?}", other),
                }
            })
        };

        qr.embed(&frame, "https://a.example").await.unwrap();
        renderer.await.unwrap();

        let doc = lock_document(&document);
        let children = doc.get(&slot).unwrap().children().to_vec();
        assert_eq!(children.len(), 1);
        let image = doc.get(&children[0]).unwrap();
        assert_eq!((image.width, image.height), (30.0, 40.0));
        let NodeKind::Image {
            image_hash,
            scale_mode,
        } = &image.kind
        else {
            panic!("expected image node");
        };
        assert_eq!(*scale_mode, ScaleMode::Fit);
        assert_eq!(doc.image(image_hash), Some(&b"png-bytes"[..]));
        assert_eq!(qr.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_renderer_error_rejects_with_message() {
        let (document, frame, _) = artifact("qrcode_here");
        let (qr, mut events) = coordinator(document);

        let renderer = {
            let qr = qr.clone();
            tokio::spawn(async move {
                if let Some(Event::GenerateQrCode { frame_id, .. }) = events.recv().await {
                    qr.deliver_error(&frame_id, "canvas unavailable");
                }
            })
        };

        let err = qr.embed(&frame, "https://a.example").await.unwrap_err();
        renderer.await.unwrap();
        assert_eq!(err, QrError::Renderer("canvas unavailable".into()));
        assert!(!qr.is_pending(&frame));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_renderer_times_out_and_clears_ticket() {
        let (document, frame, _) = artifact("qrcode_here");
        let (qr, _events) = coordinator(document);

        let started = tokio::time::Instant::now();
        qr.embed(&frame, "https://a.example").await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(started.elapsed() < Duration::from_secs(11));
        assert_eq!(qr.pending_count(), 0);

        // A late answer finds no ticket and changes nothing about the run.
        qr.deliver_error(&frame, "too late");
        assert_eq!(qr.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_delivery_for_vanished_frame_fails_ticket() {
        let (document, frame, _) = artifact("qrcode_here");
        let (qr, mut events) = coordinator(document.clone());

        let renderer = {
            let qr = qr.clone();
            let document = document.clone();
            tokio::spawn(async move {
                if let Some(Event::GenerateQrCode { frame_id, .. }) = events.recv().await {
                    lock_document(&document).remove(&frame_id).unwrap();
                    qr.deliver_image(&frame_id, b"png");
                }
            })
        };

        assert_eq!(
            qr.embed(&frame, "https://a.example").await,
            Err(QrError::FrameNotFound)
        );
        renderer.await.unwrap();
    }
}
