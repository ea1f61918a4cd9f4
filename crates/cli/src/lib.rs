use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use doc_model::Coordinates;
use extract_core::{
    health_payload, AppConfig, DataSyncService, DocumentSession, ExportData, ExportFormat,
    ExtractionForm, ExtractionTracker, JobRegistry, SearchSession, SelectionOutcome, TextSelection,
};
use pdf_engine::{default_engine, LopdfEngine, PdfEngine};
use serde::Serialize;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use storage::{FileStore, KeyValueStore};
use viewer_core::StateStore;

#[derive(Debug, Parser)]
#[command(name = "clinical-extract")]
#[command(about = "Clinical study PDF extraction")]
pub struct Cli {
    /// Directory for persisted extractions and jobs.
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Configuration file (defaults to the platform config directory).
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print machine-readable PDF metadata.
    Info {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Print the extracted text of a page.
    Text {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        #[arg(long, default_value_t = 1)]
        page: u32,
    },
    /// Search every page and print one match per page.
    Search {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        query: String,
    },
    /// Extract a run of text spans on a page into a form field.
    Extract {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        #[arg(long)]
        field: String,
        #[arg(long, default_value_t = 1)]
        page: u32,
        /// Index of the first text span.
        #[arg(long)]
        from: usize,
        /// Index of the last text span (defaults to --from).
        #[arg(long)]
        to: Option<usize>,
        #[arg(long, default_value_t = 1.0)]
        scale: f32,
    },
    /// Print the extraction ledger as JSON.
    List,
    /// Delete every extraction.
    Clear,
    /// Write the extraction ledger to a file.
    Export {
        #[arg(long, value_enum, default_value_t = ExportKind::Json)]
        format: ExportKind,
        #[arg(long)]
        output: Option<PathBuf>,
        /// PDF the extractions came from, for document name and page count.
        #[arg(long, value_name = "FILE")]
        pdf: Option<PathBuf>,
    },
    /// Send the current session to the remote store.
    Sync {
        #[arg(long, value_name = "FILE")]
        pdf: Option<PathBuf>,
    },
    /// Print a saved submission and its coordinates from the remote store.
    Submission { submission_id: String },
    /// Print the latest job for a session.
    JobStatus { session_id: String },
    /// Print the service health payload.
    Health,
    /// Render a page PNG with extraction markers.
    Render {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 1.0)]
        scale: f32,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print CLI version.
    Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ExportKind {
    Json,
    Csv,
    Audit,
}

impl From<ExportKind> for ExportFormat {
    fn from(kind: ExportKind) -> Self {
        match kind {
            ExportKind::Json => Self::Json,
            ExportKind::Csv => Self::Csv,
            ExportKind::Audit => Self::Audit,
        }
    }
}

#[derive(Debug, Serialize)]
struct InfoOutput {
    path: String,
    name: String,
    page_count: u32,
    first_page_size_pt: Option<PageSizeOutput>,
}

#[derive(Debug, Serialize)]
struct PageSizeOutput {
    width: f32,
    height: f32,
}

#[derive(Debug, Serialize)]
struct SearchHit {
    page: u32,
    context: String,
}

#[derive(Debug, Serialize)]
struct ExtractOutput {
    id: String,
    field: String,
    text: String,
    value: String,
    page: u32,
    coordinates: Coordinates,
    next_field: Option<String>,
}

/// Shared state, persisted ledger, and form for one invocation.
struct Workspace {
    config: AppConfig,
    store: Arc<dyn KeyValueStore>,
    state: Arc<StateStore>,
}

impl Workspace {
    fn open(cli: &Cli) -> Result<Self> {
        let config = AppConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

        let store = match cli.data_dir.clone().or_else(|| config.data_dir.clone()) {
            Some(dir) => FileStore::with_root(dir),
            None => FileStore::from_default_project().context("failed to resolve data directory")?,
        };
        tracing::debug!(root = %store.root().display(), "using data directory");

        let state = Arc::new(StateStore::with_cache_capacity(config.cache_pages));
        Ok(Self { config, store: Arc::new(store), state })
    }

    fn tracker(&self) -> ExtractionTracker {
        ExtractionTracker::new(self.store.clone(), self.state.clone())
    }

    fn document(&self, file: &Path) -> Result<DocumentSession<LopdfEngine>> {
        ensure_pdf_exists(file)?;

        let mut session = DocumentSession::new(default_engine(), self.state.clone());
        session.load(file, &display_name(file)).context("failed to open PDF")?;
        Ok(session)
    }

    /// Form values restored from the ledger, and a document name when none is open.
    fn session_values(&self, tracker: &ExtractionTracker) -> BTreeMap<String, String> {
        let mut form = ExtractionForm::clinical_default(self.state.clone());
        form.restore(&tracker.field_values());

        if self.state.snapshot().document_name.is_empty() {
            if let Some(name) = tracker.extractions().first().map(|e| e.document_name.clone()) {
                self.state.update(move |snapshot| snapshot.document_name = name);
            }
        }

        form.collect_values()
    }
}

pub fn run<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);

    match &cli.command {
        Commands::Info { file } => run_info(file),
        Commands::Health => print_json(&health_payload(Utc::now())),
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        command => {
            let workspace = Workspace::open(&cli)?;
            run_with_workspace(&workspace, command)
        }
    }
}

fn run_with_workspace(workspace: &Workspace, command: &Commands) -> Result<()> {
    match command {
        Commands::Text { file, page } => run_text(workspace, file, *page),
        Commands::Search { file, query } => run_search(workspace, file, query),
        Commands::Extract { file, field, page, from, to, scale } => {
            run_extract(workspace, file, field, *page, *from, to.unwrap_or(*from), *scale)
        }
        Commands::List => print_json(&workspace.tracker().extractions()),
        Commands::Clear => {
            let mut tracker = workspace.tracker();
            let removed = tracker.len();
            tracker.clear_all();
            if let Some(err) = tracker.last_persist_error() {
                anyhow::bail!("failed to clear persisted extractions: {err}");
            }
            println!("cleared {removed} extractions");
            Ok(())
        }
        Commands::Export { format, output, pdf } => {
            run_export(workspace, (*format).into(), output.as_deref(), pdf.as_deref())
        }
        Commands::Sync { pdf } => run_sync(workspace, pdf.as_deref()),
        Commands::Submission { submission_id } => {
            let service =
                DataSyncService::from_config(workspace.state.clone(), &workspace.config.supabase);
            print_json(&service.fetch_submission(submission_id)?)
        }
        Commands::JobStatus { session_id } => {
            let registry = JobRegistry::new(workspace.store.clone());
            let response = registry
                .status_response(session_id, Utc::now())
                .context("failed to look up job status")?;
            print_json(&response)
        }
        Commands::Render { file, page, scale, output } => {
            run_render(workspace, file, *page, *scale, output.as_deref())
        }
        Commands::Info { .. } | Commands::Health | Commands::Version => Ok(()),
    }
}

fn run_info(file: &Path) -> Result<()> {
    ensure_pdf_exists(file)?;

    let mut engine = default_engine();
    let handle = engine.open(file.into()).context("failed to open PDF")?;

    let page_count = engine.page_count(handle)?;
    let first_page_size_pt = if page_count > 0 {
        let size = engine.page_size(handle, 0)?;
        Some(PageSizeOutput { width: size.width_pt, height: size.height_pt })
    } else {
        None
    };

    let payload = InfoOutput {
        path: file.display().to_string(),
        name: display_name(file),
        page_count,
        first_page_size_pt,
    };
    print_json(&payload)?;

    engine.close(handle)?;

    Ok(())
}

fn run_text(workspace: &Workspace, file: &Path, page: u32) -> Result<()> {
    let session = workspace.document(file)?;
    let rendered = session.go_to_page(page).context("failed to read page text")?;

    for item in &rendered.items {
        println!("{}\t{}", item.index, item.text);
    }

    Ok(())
}

fn run_search(workspace: &Workspace, file: &Path, query: &str) -> Result<()> {
    let session = workspace.document(file)?;
    let mut search = SearchSession::new();
    search.search(&workspace.state, &session, query);

    let hits: Vec<SearchHit> = search
        .results()
        .iter()
        .map(|result| SearchHit { page: result.page, context: result.context.clone() })
        .collect();
    print_json(&hits)
}

fn run_extract(
    workspace: &Workspace,
    file: &Path,
    field: &str,
    page: u32,
    from: usize,
    to: usize,
    scale: f32,
) -> Result<()> {
    let mut tracker = workspace.tracker();
    let session = workspace.document(file)?;
    session.set_scale(scale);

    let mut form = ExtractionForm::clinical_default(workspace.state.clone());
    form.restore(&tracker.field_values());
    if let Some(step) = form.steps().iter().position(|s| s.fields.iter().any(|f| f.name == field)) {
        workspace.state.update(|snapshot| snapshot.current_step = step);
    }
    form.activate(field).context("cannot extract into this field")?;

    let rendered = session.go_to_page(page).context("failed to render page")?;
    let span_count = rendered.items.len();
    if to >= span_count {
        anyhow::bail!("span {to} is out of range (page {page} has {span_count} text spans)");
    }

    let mut selection = TextSelection::new(workspace.state.clone());
    selection.enable(page, rendered.items);
    selection.press(from).context("failed to start selection")?;
    selection.drag_to(to);

    match selection.release(&mut tracker, &mut form) {
        SelectionOutcome::Extracted { extraction, value, next_field, .. } => {
            if let Some(err) = tracker.last_persist_error() {
                tracing::warn!(error = %err, "extraction was not persisted");
            }
            print_json(&ExtractOutput {
                id: extraction.id,
                field: extraction.field_name,
                text: extraction.text,
                value,
                page: extraction.page,
                coordinates: extraction.coordinates,
                next_field,
            })
        }
        SelectionOutcome::Empty => anyhow::bail!("selected text is empty"),
        SelectionOutcome::Rejected => anyhow::bail!("extraction was rejected by validation"),
        SelectionOutcome::NotSelecting => anyhow::bail!("no selection in progress"),
    }
}

fn run_export(
    workspace: &Workspace,
    format: ExportFormat,
    output: Option<&Path>,
    pdf: Option<&Path>,
) -> Result<()> {
    let _session = pdf.map(|file| workspace.document(file)).transpose()?;
    let tracker = workspace.tracker();
    let form_data = workspace.session_values(&tracker);

    let now = Utc::now();
    let output =
        output.map(ToOwned::to_owned).unwrap_or_else(|| PathBuf::from(format.default_file_name(now)));
    if let Some(parent) = output.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let snapshot = workspace.state.snapshot();
    let export = ExportData::from_snapshot(&snapshot, &form_data, now);
    let file = File::create(&output)
        .with_context(|| format!("failed to create {}", output.display()))?;
    let mut writer = BufWriter::new(file);
    format
        .write(&mut writer, &export)
        .with_context(|| format!("failed to write export to {}", output.display()))?;
    writer.flush()?;

    println!("{}", output.display());
    Ok(())
}

fn run_sync(workspace: &Workspace, pdf: Option<&Path>) -> Result<()> {
    let _session = pdf.map(|file| workspace.document(file)).transpose()?;
    let tracker = workspace.tracker();
    let form_data = workspace.session_values(&tracker);

    let service = DataSyncService::from_config(workspace.state.clone(), &workspace.config.supabase);
    let submission_id = service.persist_current_session(&form_data)?;

    println!("{submission_id}");
    Ok(())
}

fn run_render(
    workspace: &Workspace,
    file: &Path,
    page: u32,
    scale: f32,
    output: Option<&Path>,
) -> Result<()> {
    let _tracker = workspace.tracker();
    let session = workspace.document(file)?;
    session.set_scale(scale);

    let image = session.render_image(page).context("failed to render page")?;

    let output =
        output.map(ToOwned::to_owned).unwrap_or_else(|| default_render_output(file, page));
    if let Some(parent) = output.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    image
        .save(&output)
        .with_context(|| format!("failed to write image to {}", output.display()))?;

    println!("{}", output.display());
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{json}");
    Ok(())
}

fn ensure_pdf_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("file does not exist: {}", path.display());
    }

    if !path.is_file() {
        anyhow::bail!("path is not a file: {}", path.display());
    }

    Ok(())
}

fn display_name(file: &Path) -> String {
    file.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.display().to_string())
}

fn default_render_output(file: &Path, page: u32) -> PathBuf {
    let stem = file.file_stem().and_then(|name| name.to_str()).unwrap_or("page");

    file.with_file_name(format!("{stem}-page-{page}.png"))
}
