//! StorePrint Core - Store Materials Generator
//!
//! Turns store survey rows and registered template frames into posters,
//! flyers and stickers inside a host document, then exports them as PNG.
//!
//! # Ground Rules
//! 1. Templates are validated when registered, resolved again on every use
//! 2. One bad row or item never stops the run
//! 3. QR rendering is external and never blocks longer than its timeout
//! 4. Export is strictly sequential

pub mod config;
pub mod export;
pub mod generator;
pub mod hashing;
pub mod host;
pub mod protocol;
pub mod qr;
pub mod rows;
pub mod scene;
pub mod session;
pub mod storage;
pub mod templates;
pub mod validation;

pub use config::Settings;
pub use export::{ExportError, ExportPipeline, ExportSummary};
pub use generator::{GenerationOptions, GenerationReport, Generator, ItemError};
pub use host::{FontLoader, HostError, InstalledFonts, PreviewRasterizer, Rasterizer};
pub use protocol::{Command, Event, Outbox, Progress};
pub use qr::{QrCoordinator, QrError};
pub use rows::{RowRecord, StoreFields};
pub use scene::{Document, NodeId, SharedDocument};
pub use session::{Flow, Session, SessionError};
pub use storage::{ClientStorage, JsonFileStorage, MemoryStorage, StorageError};
pub use templates::{RegistryError, ResolveError, StoredTemplate, TemplateKind, TemplateRegistry};
pub use validation::ValidationViolation;

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
