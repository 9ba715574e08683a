//! Session - command dispatch for one UI connection
//!
//! The host runs a single cooperative loop. Long commands (generation,
//! export, registry edits) run one at a time in arrival order; QR renderer
//! replies and `cancel` are acted on immediately, even while a job is
//! suspended waiting for one of those replies.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::config::Settings;
use crate::export::{ExportError, ExportPipeline};
use crate::generator::Generator;
use crate::host::{FontLoader, Rasterizer};
use crate::protocol::{Command, Event, Outbox};
use crate::qr::QrCoordinator;
use crate::scene::{lock_document, SceneError, SharedDocument};
use crate::storage::ClientStorage;
use crate::templates::{RegistryError, TemplateKind, TemplateRegistry};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Generation(#[from] SceneError),

    #[error("Export failed: {0}")]
    Export(#[from] ExportError),
}

/// Whether the session keeps going after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

type Job = Pin<Box<dyn Future<Output = Flow> + Send>>;

/// Commands that must not wait behind a running job.
fn is_immediate(command: &Command) -> bool {
    matches!(
        command,
        Command::QrCodeGenerated { .. } | Command::QrCodeError { .. } | Command::Cancel
    )
}

fn added_message(kind: TemplateKind, design_name: &str, settings: &Settings) -> String {
    let spec = kind.frame_spec(settings);
    match kind {
        TemplateKind::Sticker => format!(
            "✓ Sticker template added successfully ({}×{}px = 44×44mm at 300 DPI)",
            spec.width, spec.height
        ),
        TemplateKind::Poster => format!(
            "✓ Poster template \"{}\" added successfully ({}×{}px = A2 at 300 DPI)",
            design_name, spec.width, spec.height
        ),
        TemplateKind::Flyer => format!(
            "✓ Flyer template \"{}\" added successfully ({}×{}px = A5 at 300 DPI)",
            design_name, spec.width, spec.height
        ),
    }
}

#[derive(Clone)]
pub struct Session {
    document: SharedDocument,
    registry: Arc<TemplateRegistry>,
    generator: Arc<Generator>,
    exporter: Arc<ExportPipeline>,
    qr: Arc<QrCoordinator>,
    outbox: Outbox,
    settings: Arc<Settings>,
}

impl Session {
    pub fn new(
        document: SharedDocument,
        storage: Arc<dyn ClientStorage>,
        fonts: Arc<dyn FontLoader>,
        rasterizer: Arc<dyn Rasterizer>,
        outbox: Outbox,
        settings: Arc<Settings>,
    ) -> Self {
        let registry = Arc::new(TemplateRegistry::new(
            storage,
            document.clone(),
            settings.clone(),
        ));
        let qr = Arc::new(QrCoordinator::new(
            document.clone(),
            outbox.clone(),
            settings.qr.clone(),
        ));
        let generator = Arc::new(Generator::new(
            registry.clone(),
            document.clone(),
            fonts,
            qr.clone(),
            outbox.clone(),
            settings.clone(),
        ));
        let exporter = Arc::new(ExportPipeline::new(
            document.clone(),
            rasterizer,
            outbox.clone(),
            settings.export.clone(),
        ));
        Self {
            document,
            registry,
            generator,
            exporter,
            qr,
            outbox,
            settings,
        }
    }

    pub fn qr(&self) -> &QrCoordinator {
        &self.qr
    }

    pub fn registry(&self) -> &TemplateRegistry {
        &self.registry
    }

    /// Run one command to completion. Failures are reported on the outbox as
    /// `error` events, never returned.
    pub async fn handle(&self, command: Command) -> Flow {
        debug!(command = command.kind(), "handling command");
        match self.dispatch(command).await {
            Ok(flow) => flow,
            Err(e) => {
                error!(error = %e, "command failed");
                self.outbox.send(Event::Error { message: e.to_string() });
                Flow::Continue
            }
        }
    }

    async fn dispatch(&self, command: Command) -> Result<Flow, SessionError> {
        match command {
            Command::AddTemplate { kind, design_name } => {
                self.add_template(kind, &design_name).await?
            }
            Command::ValidateTemplates => self.validate_templates().await?,
            Command::GenerateMaterials { csv_data, options } => {
                self.generator.generate(&csv_data, &options).await?;
            }
            Command::ExportAsPng { node_ids } => {
                if let Err(e) = self.exporter.export_all(&node_ids).await {
                    self.outbox.notify_error("Export failed");
                    return Err(e.into());
                }
            }
            Command::GetStoredTemplates => self.send_stored_templates().await?,
            Command::ClearAllTemplates => {
                self.registry.clear_all().await?;
                self.outbox.send(Event::TemplatesCleared);
                self.outbox.notify("All templates cleared");
            }
            Command::DeleteTemplate { key } => {
                if let Err(e) = self.registry.delete(&key).await {
                    self.outbox.notify_error("⚠️ Error deleting template");
                    return Err(e.into());
                }
                self.send_stored_templates().await?;
                self.outbox.notify("✓ Template deleted successfully");
            }
            Command::QrCodeGenerated {
                frame_id,
                qr_code_bytes,
            } => self.qr.deliver_image(&frame_id, &qr_code_bytes),
            Command::QrCodeError { frame_id, error } => self.qr.deliver_error(&frame_id, &error),
            Command::Cancel => {
                info!("cancel received, closing session");
                return Ok(Flow::Close);
            }
        }
        Ok(Flow::Continue)
    }

    async fn add_template(
        &self,
        kind: TemplateKind,
        design_name: &str,
    ) -> Result<(), RegistryError> {
        let selection = lock_document(&self.document).selection().to_vec();
        match self.registry.add(kind, design_name, &selection).await {
            Ok(template) => {
                let message = added_message(kind, &template.design_name, &self.settings);
                self.outbox.send(Event::TemplateAdded {
                    template,
                    template_type: kind,
                });
                self.outbox.notify(message);
                Ok(())
            }
            Err(e @ RegistryError::SizeMismatch(_)) => {
                self.outbox.send(Event::Error { message: e.to_string() });
                self.outbox.notify_error("⚠️ Frame size is incorrect");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn validate_templates(&self) -> Result<(), RegistryError> {
        let report = self.registry.validate_all().await?;
        for failure in report.failures {
            self.outbox.send(Event::TemplateValidationError {
                key: failure.key,
                error: failure.error,
            });
        }
        self.outbox.send(Event::ValidationComplete {
            valid: report.valid,
            invalid: report.invalid,
            total: report.total,
        });
        if report.invalid > 0 {
            self.outbox.notify_error(format!(
                "⚠️ {} template(s) invalid. Please re-add them.",
                report.invalid
            ));
        } else {
            self.outbox.notify(format!("✓ All {} template(s) are valid", report.valid));
        }
        Ok(())
    }

    async fn send_stored_templates(&self) -> Result<(), RegistryError> {
        let listing = self.registry.list().await?;
        self.outbox.send(Event::StoredTemplates(listing));
        Ok(())
    }

    fn start(&self, command: Command) -> Job {
        let session = self.clone();
        Box::pin(async move { session.handle(command).await })
    }

    /// Serve commands until `cancel`, or until the inbound channel closes
    /// and every accepted command has finished.
    pub async fn run(self, mut inbound: mpsc::UnboundedReceiver<Command>) {
        let mut queue: VecDeque<Command> = VecDeque::new();
        let mut job: Option<Job> = None;
        let mut open = true;

        loop {
            if job.is_none() {
                match queue.pop_front() {
                    Some(next) => job = Some(self.start(next)),
                    None if !open => break,
                    None => {}
                }
            }

            tokio::select! {
                received = inbound.recv(), if open => match received {
                    Some(command) if is_immediate(&command) => {
                        if self.handle(command).await == Flow::Close {
                            break;
                        }
                    }
                    Some(command) => {
                        debug!(
                            command = command.kind(),
                            queued = queue.len(),
                            "command queued"
                        );
                        queue.push_back(command);
                    }
                    None => {
                        debug!("inbound channel closed");
                        open = false;
                    }
                },
                flow = poll_job(&mut job), if job.is_some() => {
                    job = None;
                    if flow == Flow::Close {
                        break;
                    }
                }
            }
        }
        info!(dropped = queue.len(), "session ended");
    }
}

async fn poll_job(job: &mut Option<Job>) -> Flow {
    match job {
        Some(running) => running.await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::GenerationOptions;
    use crate::host::{InstalledFonts, PreviewRasterizer};
    use crate::rows::{
        RowRecord, POSTER_DESIGN_LABEL, STORE_NAME_LABEL, WEBSITE_URL_LABEL,
    };
    use crate::scene::{self, Document, FontName, NodeKind};
    use crate::storage::MemoryStorage;

    fn session_with(
        document: Document,
    ) -> (Session, SharedDocument, mpsc::UnboundedReceiver<Event>) {
        let document = scene::shared(document);
        let (outbox, events) = Outbox::channel();
        let session = Session::new(
            document.clone(),
            Arc::new(MemoryStorage::new()),
            Arc::new(InstalledFonts::any()),
            Arc::new(PreviewRasterizer),
            outbox,
            Arc::new(Settings::default()),
        );
        (session, document, events)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
        let mut out = vec![];
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn add_poster(design_name: &str) -> Command {
        Command::AddTemplate {
            kind: TemplateKind::Poster,
            design_name: design_name.into(),
        }
    }

    /// A poster template frame with a copy layer and a QR placeholder, selected.
    fn poster_document() -> Document {
        let mut doc = Document::new();
        let frame = doc.create_frame("Poster", 1654.0, 2339.0);
        doc.append_to_page(&frame).unwrap();
        let copy = doc.create_text("Copy", "{poster_copy}", FontName::default());
        doc.append_child(&frame, &copy).unwrap();
        let slot = doc.create_frame("qrcode_here_#FF0000", 100.0, 100.0);
        doc.append_child(&frame, &slot).unwrap();
        doc.set_selection(vec![frame]);
        doc
    }

    #[tokio::test]
    async fn test_add_template_emits_record_and_notice() {
        let (session, _, mut events) = session_with(poster_document());
        let flow = session.handle(add_poster("Design 1")).await;
        assert_eq!(flow, Flow::Continue);

        let events = drain(&mut events);
        assert!(matches!(
            &events[0],
            Event::TemplateAdded {
                template,
                template_type: TemplateKind::Poster,
            } if template.design_name == "Design 1"
        ));
        assert_eq!(
            events[1],
            Event::Notify {
                message: "✓ Poster template \"Design 1\" added successfully \
                          (1654×2339px = A2 at 300 DPI)"
                    .into(),
                error: false,
            }
        );
    }

    #[tokio::test]
    async fn test_size_mismatch_reports_error_and_toast() {
        let mut doc = Document::new();
        let frame = doc.create_frame("Too small", 500.0, 500.0);
        doc.append_to_page(&frame).unwrap();
        doc.set_selection(vec![frame]);
        let (session, _, mut events) = session_with(doc);

        session
            .handle(Command::AddTemplate {
                kind: TemplateKind::Flyer,
                design_name: "Design 1".into(),
            })
            .await;
        let events = drain(&mut events);
        let Event::Error { message } = &events[0] else {
            panic!("expected error event, got {:?}", events[0]);
        };
        assert!(message.starts_with("Frame size mismatch!"));
        assert!(message.contains("591×835px"));
        assert_eq!(
            events[1],
            Event::Notify {
                message: "⚠️ Frame size is incorrect".into(),
                error: true,
            }
        );
    }

    #[tokio::test]
    async fn test_bad_selection_is_an_error_event() {
        let (session, _, mut events) = session_with(Document::new());
        session
            .handle(Command::AddTemplate {
                kind: TemplateKind::Sticker,
                design_name: String::new(),
            })
            .await;
        assert_eq!(
            drain(&mut events),
            vec![Event::Error {
                message: "Please select exactly one frame to use as a template".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_delete_relists_templates() {
        let (session, _, mut events) = session_with(poster_document());
        session.handle(add_poster("Design 1")).await;
        drain(&mut events);

        session
            .handle(Command::DeleteTemplate {
                key: "poster_template_Design 1".into(),
            })
            .await;
        let events = drain(&mut events);
        assert_eq!(events[0], Event::StoredTemplates(Default::default()));
        assert_eq!(
            events[1],
            Event::Notify {
                message: "✓ Template deleted successfully".into(),
                error: false,
            }
        );
    }

    #[tokio::test]
    async fn test_export_of_missing_nodes_still_completes() {
        let (session, _, mut events) = session_with(Document::new());
        session
            .handle(Command::ExportAsPng { node_ids: vec![] })
            .await;
        assert!(drain(&mut events).contains(&Event::ExportComplete { total: 0 }));
    }

    #[tokio::test]
    async fn test_run_answers_qr_requests_while_generating() {
        let (session, document, mut events) = session_with(poster_document());
        let (inbound, rx) = mpsc::unbounded_channel();
        let runner = tokio::spawn(session.run(rx));

        let row: RowRecord = [
            (STORE_NAME_LABEL, "Cafe A"),
            (POSTER_DESIGN_LABEL, "옵션 1"),
            (WEBSITE_URL_LABEL, "https://cafe-a.example"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        inbound.send(add_poster("Design 1")).unwrap();
        inbound
            .send(Command::GenerateMaterials {
                csv_data: vec![row],
                options: GenerationOptions {
                    generate_posters: true,
                    ..Default::default()
                },
            })
            .unwrap();

        let mut png = Vec::new();
        image::RgbaImage::new(1, 1)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();

        let node_ids = loop {
            match events.recv().await.unwrap() {
                Event::GenerateQrCode { frame_id, url, color } => {
                    assert_eq!(url, "https://cafe-a.example");
                    assert_eq!(color, "#FF0000");
                    inbound
                        .send(Command::QrCodeGenerated {
                            frame_id,
                            qr_code_bytes: png.clone(),
                        })
                        .unwrap();
                }
                Event::GenerationComplete {
                    total,
                    errors,
                    node_ids,
                } => {
                    assert_eq!(total, 1);
                    assert_eq!(errors, None);
                    break node_ids;
                }
                _ => {}
            }
        };

        drop(inbound);
        runner.await.unwrap();

        let doc = lock_document(&document);
        let installed = doc
            .find_first(&node_ids[0], &|n| matches!(n.kind, NodeKind::Image { .. }))
            .map(|n| n.name.clone());
        assert_eq!(installed.as_deref(), Some("QR Code"));
    }

    #[tokio::test]
    async fn test_cancel_closes_session_immediately() {
        let (session, _, mut events) = session_with(Document::new());
        let (inbound, rx) = mpsc::unbounded_channel();
        inbound.send(Command::Cancel).unwrap();
        inbound.send(Command::ValidateTemplates).unwrap();
        session.run(rx).await;

        assert!(inbound.is_closed());
        assert!(!drain(&mut events)
            .iter()
            .any(|e| matches!(e, Event::ValidationComplete { .. })));
    }

    #[tokio::test]
    async fn test_closed_channel_drains_queue_before_exit() {
        let (session, _, mut events) = session_with(Document::new());
        let (inbound, rx) = mpsc::unbounded_channel();
        inbound.send(Command::ValidateTemplates).unwrap();
        inbound.send(Command::ClearAllTemplates).unwrap();
        drop(inbound);
        session.run(rx).await;

        let events = drain(&mut events);
        assert!(events.contains(&Event::ValidationComplete {
            valid: 0,
            invalid: 0,
            total: 0
        }));
        assert!(events.contains(&Event::TemplatesCleared));
    }
}
