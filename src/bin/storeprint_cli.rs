//! StorePrint CLI - Bridge interface over a document file
//!
//! Commands: templates, add-template, validate, delete, clear, generate, export
//! Outputs the emitted events as JSON to stdout
//! Returns non-zero when any command reports an error

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use storeprint_core::scene::{self, lock_document};
use storeprint_core::{
    Command, Document, Event, GenerationOptions, InstalledFonts, JsonFileStorage, Outbox,
    PreviewRasterizer, RowRecord, Session, Settings, TemplateKind, ENGINE_VERSION,
};

const NO_RENDERER: &str = "No QR renderer attached";

#[derive(Parser)]
#[command(name = "storeprint-cli")]
#[command(about = "StorePrint CLI - Store Materials Generator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the document JSON file
    #[arg(short, long, default_value = "document.json")]
    document: PathBuf,

    /// Path to the template store JSON file
    #[arg(short, long, default_value = "templates.json")]
    store: PathBuf,

    /// Optional settings file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List stored templates
    Templates,

    /// Register a frame as a template
    AddTemplate {
        /// poster, flyer or sticker
        #[arg(short, long)]
        kind: String,

        /// Design variant, e.g. "Design 1" (ignored for stickers)
        #[arg(short = 'n', long, default_value = "")]
        design_name: String,

        /// Frame node id
        #[arg(short, long)]
        frame: String,
    },

    /// Check that every stored template frame still exists
    Validate,

    /// Delete one stored template by key
    Delete {
        #[arg(short, long)]
        key: String,
    },

    /// Delete all stored templates
    Clear,

    /// Generate materials from a JSON array of rows
    Generate {
        /// Rows file (JSON array of objects keyed by column label)
        #[arg(short, long)]
        rows: PathBuf,

        #[arg(long)]
        posters: bool,

        #[arg(long)]
        flyers: bool,

        #[arg(long)]
        stickers: bool,

        #[arg(long)]
        group_by_brand: bool,
    },

    /// Export frames as PNG files
    Export {
        /// Output directory
        #[arg(short, long, default_value = "export")]
        out: PathBuf,

        /// Node ids to export
        node_ids: Vec<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            let output = json!({ "success": false, "error": format!("{:#}", e) });
            println!("{}", output);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "storeprint_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let settings =
        Arc::new(Settings::load(cli.config.as_deref()).context("Failed to load settings")?);
    let mut document = load_document(&cli.document)?;
    let mut export_dir = None;
    let mut mutates_document = false;

    let command = match cli.command {
        Commands::Templates => Command::GetStoredTemplates,
        Commands::AddTemplate {
            kind,
            design_name,
            frame,
        } => {
            let kind: TemplateKind = serde_json::from_value(Value::String(kind.to_lowercase()))
                .with_context(|| format!("Unknown template kind: {}", kind))?;
            document.set_selection(vec![frame]);
            Command::AddTemplate { kind, design_name }
        }
        Commands::Validate => Command::ValidateTemplates,
        Commands::Delete { key } => Command::DeleteTemplate { key },
        Commands::Clear => Command::ClearAllTemplates,
        Commands::Generate {
            rows,
            posters,
            flyers,
            stickers,
            group_by_brand,
        } => {
            let text = std::fs::read_to_string(&rows)
                .with_context(|| format!("Failed to read {}", rows.display()))?;
            let csv_data: Vec<RowRecord> =
                serde_json::from_str(&text).context("Invalid rows file")?;
            mutates_document = true;
            Command::GenerateMaterials {
                csv_data,
                options: GenerationOptions {
                    generate_posters: posters,
                    generate_flyers: flyers,
                    generate_stickers: stickers,
                    group_by_brand,
                },
            }
        }
        Commands::Export { out, node_ids } => {
            std::fs::create_dir_all(&out)
                .with_context(|| format!("Failed to create {}", out.display()))?;
            export_dir = Some(out);
            Command::ExportAsPng { node_ids }
        }
    };

    let shared = scene::shared(document);
    let (outbox, events) = Outbox::channel();
    let session = Session::new(
        shared.clone(),
        Arc::new(JsonFileStorage::new(&cli.store)),
        Arc::new(InstalledFonts::any()),
        Arc::new(PreviewRasterizer),
        outbox,
        settings,
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .context("Failed to start runtime")?;
    let events = runtime.block_on(drive(&session, events, command));

    if mutates_document {
        let bytes = serde_json::to_vec_pretty(&*lock_document(&shared))?;
        std::fs::write(&cli.document, bytes)
            .with_context(|| format!("Failed to write {}", cli.document.display()))?;
    }

    let mut failed = false;
    let mut incomplete = false;
    let mut output = Vec::with_capacity(events.len());
    for event in events {
        match &event {
            Event::Error { .. } => failed = true,
            Event::ValidationComplete { invalid, .. } if *invalid > 0 => incomplete = true,
            Event::GenerationComplete { errors: Some(_), .. } => incomplete = true,
            _ => {}
        }
        output.push(match (event, &export_dir) {
            (
                Event::ExportImage {
                    name,
                    bytes,
                    index,
                    total,
                },
                Some(dir),
            ) => {
                let path = write_png(dir, &name, index, &bytes)?;
                json!({
                    "type": "export-image",
                    "data": { "name": name, "path": path, "index": index, "total": total },
                })
            }
            (event, _) => serde_json::to_value(&event)?,
        });
    }

    let result = json!({
        "success": !failed && !incomplete,
        "engine": ENGINE_VERSION,
        "events": output,
    });
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(if failed {
        ExitCode::FAILURE
    } else if incomplete {
        ExitCode::from(2) // Partial failure
    } else {
        ExitCode::SUCCESS
    })
}

/// Run one command, answering QR requests on the spot since no renderer is
/// attached. Returns every event the command emitted.
async fn drive(
    session: &Session,
    mut events: mpsc::UnboundedReceiver<Event>,
    command: Command,
) -> Vec<Event> {
    let mut collected = vec![];
    let job = session.handle(command);
    tokio::pin!(job);

    loop {
        tokio::select! {
            _ = &mut job => break,
            Some(event) = events.recv() => collected.push(answer(session, event)),
        }
    }
    while let Ok(event) = events.try_recv() {
        collected.push(answer(session, event));
    }
    collected
}

fn answer(session: &Session, event: Event) -> Event {
    if let Event::GenerateQrCode { frame_id, .. } = &event {
        session.qr().deliver_error(frame_id, NO_RENDERER);
    }
    event
}

fn load_document(path: &Path) -> anyhow::Result<Document> {
    if !path.exists() {
        return Ok(Document::new());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let document: Document = serde_json::from_str(&text)
        .with_context(|| format!("Invalid document file {}", path.display()))?;
    document
        .check_structure()
        .with_context(|| format!("Inconsistent document file {}", path.display()))?;
    Ok(document)
}

fn write_png(dir: &Path, name: &str, index: usize, bytes: &[u8]) -> anyhow::Result<String> {
    let safe: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect();
    let path = dir.join(format!("{:03} {}.png", index + 1, safe));
    std::fs::write(&path, bytes).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path.display().to_string())
}
