use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use caseview_core::{
    BackendKind, DocumentView, DraftAssistant, DraftRequest, QueryOutcome, TemplateDraftWriter,
    ViewerSession, Viewport,
};
use caseview_render::{
    default_engine_service, EnginePreferences, EngineSources, RenderingPipeline,
    REMOTE_ENGINE_PREF_KEY,
};
use caseview_store::{HttpCaseStore, UploadFile};
use clap::Parser;
use crossterm::style::Stylize;
use directories::ProjectDirs;
use parking_lot::Mutex;
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};
use url::Url;

#[derive(Debug, Parser)]
#[command(
    name = "caseview",
    version,
    about = "terminal client for the case-document store: search, highlights, match navigation"
)]
struct Args {
    /// Base URL of the document store
    #[arg(long, default_value = "http://127.0.0.1:8000/")]
    server: Url,

    /// Local vendor path of the page-rendering engine library
    #[arg(long = "engine-path")]
    engine_path: Option<PathBuf>,

    /// Remote engine sources, tried in order after the vendor path
    #[arg(long = "engine-source")]
    engine_sources: Vec<Url>,

    /// Allow downloading the engine from remote sources
    #[arg(long = "remote-engine")]
    remote_engine: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("net", "caseview", "caseview")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;

    let prefs_path = project_dirs.config_dir().join("preferences.toml");
    let prefs = EnginePreferences::load(&prefs_path)
        .unwrap_or_else(|err| {
            warn!(?err, "preferences unreadable; using defaults");
            EnginePreferences::default()
        });

    let sources = EngineSources {
        vendor_path: args.engine_path.clone(),
        remote: args.engine_sources.clone(),
        allow_remote: args.remote_engine,
    }
    .with_preferences(&prefs);

    let engine = default_engine_service(sources, project_dirs.cache_dir().join("engine"));
    let store = HttpCaseStore::new(args.server.clone());
    let renderer = RenderingPipeline::new(engine, Arc::new(store.clone()));
    let viewport = TerminalViewport::new();
    let drafts = TemplateDraftWriter::new();

    let mut session = ViewerSession::new();
    if let Err(err) = session.refresh_documents(&store).await {
        viewport.notify(&format!("store unreachable at {}: {err:#}", args.server));
    }

    println!(
        "{} connected to {} ({} documents). Type 'help' for commands.",
        "caseview".bold(),
        args.server,
        session.registry().documents().len()
    );

    let ctx = ReplContext {
        session,
        store,
        renderer,
        viewport,
        drafts,
        prefs,
        prefs_path,
    };
    run_repl(ctx).await
}

struct ReplContext {
    session: ViewerSession,
    store: HttpCaseStore,
    renderer: RenderingPipeline,
    viewport: TerminalViewport,
    drafts: TemplateDraftWriter,
    prefs: EnginePreferences,
    prefs_path: PathBuf,
}

async fn run_repl(mut ctx: ReplContext) -> Result<()> {
    loop {
        print!("> ");
        io::stdout().flush()?;
        let Some(line) = read_line().await? else {
            break;
        };
        let Some((command, rest)) = parse_command(&line) else {
            continue;
        };
        match dispatch(&mut ctx, command, rest).await {
            Ok(ReplAction::Continue) => {}
            Ok(ReplAction::Quit) => break,
            Err(err) => ctx.viewport.notify(&format!("{err:#}")),
        }
    }
    Ok(())
}

// Stdin reads block, so they run off the runtime thread; `None` is EOF.
async fn read_line() -> Result<Option<String>> {
    tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        let n = io::stdin()
            .read_line(&mut line)
            .context("failed to read command")?;
        Ok(if n == 0 { None } else { Some(line) })
    })
    .await
    .context("stdin task failed")?
}

fn parse_command(input: &str) -> Option<(&str, &str)> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    Some(match input.split_once(' ') {
        Some((head, tail)) => (head, tail.trim()),
        None => (input, ""),
    })
}

enum ReplAction {
    Continue,
    Quit,
}

async fn dispatch(ctx: &mut ReplContext, command: &str, rest: &str) -> Result<ReplAction> {
    match command {
        "ask" => {
            let outcome = ctx
                .session
                .submit_query(rest, &ctx.store, &ctx.renderer, &ctx.viewport)
                .await?;
            match outcome {
                QueryOutcome::Ignored => ctx.viewport.notify("nothing to ask"),
                QueryOutcome::NoMatches => {}
                QueryOutcome::Matches(n) => println!("{n} match(es)"),
            }
        }
        "next" | "n" => {
            ctx.session
                .next_match(&ctx.renderer, &ctx.viewport)
                .await?
        }
        "prev" | "p" => {
            ctx.session
                .previous_match(&ctx.renderer, &ctx.viewport)
                .await?
        }
        "goto" => {
            let index: usize = rest
                .parse()
                .map_err(|_| anyhow!("usage: goto <match-number>"))?;
            let index = index
                .checked_sub(1)
                .ok_or_else(|| anyhow!("match numbers start at 1"))?;
            ctx.session
                .select_match(index, &ctx.renderer, &ctx.viewport)
                .await?
        }
        "docs" => print_documents(&ctx.session),
        "filter" => {
            ctx.session.registry_mut().set_filter(rest);
            print_documents(&ctx.session);
        }
        "open" => {
            if rest.is_empty() {
                return Err(anyhow!("usage: open <doc-id>"));
            }
            ctx.session
                .open_document(rest, &ctx.renderer, &ctx.viewport)
                .await?
        }
        "delete" => {
            if rest.is_empty() {
                return Err(anyhow!("usage: delete <doc-id>"));
            }
            if ctx
                .session
                .delete_document(rest, &ctx.store, &ctx.viewport)
                .await?
            {
                println!("deleted {rest}");
            }
        }
        "upload" => upload(ctx, rest).await?,
        "clear" => ctx.session.clear_query(&ctx.viewport),
        "draft" => {
            if rest.is_empty() {
                return Err(anyhow!("usage: draft <question>"));
            }
            let findings = current_findings(&ctx.session);
            let draft = ctx
                .drafts
                .generate_draft(DraftRequest {
                    question: rest.to_string(),
                    findings,
                })
                .await;
            println!("{}", draft.subject.clone().bold());
            println!("{}", draft.body);
        }
        "remote" => toggle_remote(ctx, rest)?,
        "status" => {
            println!("{}", ctx.viewport.status());
            println!("drafts: {}", ctx.drafts.status());
        }
        "health" => match ctx.store.health().await {
            Ok(health) => println!("store: {}", health.status),
            Err(err) => ctx.viewport.notify(&format!("store unhealthy: {err:#}")),
        },
        "refresh" => {
            ctx.session.refresh_documents(&ctx.store).await?;
            print_documents(&ctx.session);
        }
        "help" => print_help(),
        "quit" | "q" | "exit" => return Ok(ReplAction::Quit),
        other => ctx
            .viewport
            .notify(&format!("unknown command '{other}'; try 'help'")),
    }
    Ok(ReplAction::Continue)
}

async fn upload(ctx: &mut ReplContext, rest: &str) -> Result<()> {
    if rest.is_empty() {
        return Err(anyhow!("usage: upload <file.pdf> [more.pdf ...]"));
    }
    let mut files = Vec::new();
    for path in rest.split_whitespace() {
        let path = PathBuf::from(path);
        let bytes =
            fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("document.pdf")
            .to_string();
        files.push(UploadFile { name, bytes });
    }
    let outcome = ctx.store.upload(files).await?;
    for doc in &outcome.uploaded {
        println!("uploaded {} as {} ({} pages)", doc.name, doc.doc_id, doc.pages);
    }
    ctx.session.refresh_documents(&ctx.store).await?;
    Ok(())
}

fn toggle_remote(ctx: &mut ReplContext, rest: &str) -> Result<()> {
    let value = match rest {
        "on" => true,
        "off" => false,
        _ => return Err(anyhow!("usage: remote on|off")),
    };
    ctx.prefs.set(REMOTE_ENGINE_PREF_KEY, value);
    ctx.prefs.save(&ctx.prefs_path)?;
    // The engine choice is cached per session, so this applies on restart.
    println!(
        "remote engine sources {} (takes effect next session)",
        if value { "allowed" } else { "blocked" }
    );
    Ok(())
}

fn print_documents(session: &ViewerSession) {
    let visible = session.visible_documents();
    if visible.is_empty() {
        println!("{}", "no documents".dim());
        return;
    }
    for (doc, hits) in visible {
        let hits_note = if hits > 0 {
            format!("  {hits} hit(s)").green().to_string()
        } else {
            String::new()
        };
        println!(
            "  {}  {} ({} pages){}",
            doc.doc_id.clone().bold(),
            doc.name,
            doc.pages,
            hits_note
        );
    }
}

fn current_findings(session: &ViewerSession) -> Vec<String> {
    session
        .results()
        .iter()
        .flat_map(|result| {
            result.highlights.iter().filter_map(|h| {
                h.label.as_ref().map(|label| {
                    format!(
                        "{}: {} (p.{})",
                        result.doc_name.as_deref().unwrap_or(&result.doc_id),
                        label,
                        h.page + 1
                    )
                })
            })
        })
        .collect()
}

fn print_help() {
    println!("  ask <question>      search across documents and jump to the first match");
    println!("  next / prev         step through matches in reading order");
    println!("  goto <k>            jump to match number k");
    println!("  docs                list documents (with hit counts after a query)");
    println!("  filter [text]       filter the document list by name");
    println!("  open <doc-id>       open a document without a query");
    println!("  upload <pdf ...>    upload PDFs to the store");
    println!("  delete <doc-id>     delete a document from the store");
    println!("  clear               clear the query and all highlights");
    println!("  draft <question>    draft a summary email from current findings");
    println!("  remote on|off       persist the remote-engine opt-in");
    println!("  status / health     show viewer status / store health");
    println!("  refresh             re-fetch the document list");
    println!("  quit                exit");
}

#[derive(Default)]
struct ViewportState {
    status: String,
    previous_enabled: bool,
    next_enabled: bool,
}

/// Line-oriented `Viewport`: mounts are announced, the status line is
/// reprinted on change, notices are styled as toasts.
struct TerminalViewport {
    state: Mutex<ViewportState>,
}

impl TerminalViewport {
    fn new() -> Self {
        Self {
            state: Mutex::new(ViewportState::default()),
        }
    }

    fn status(&self) -> String {
        let state = self.state.lock();
        let arrows = format!(
            "{}{}",
            if state.previous_enabled { "◀" } else { " " },
            if state.next_enabled { "▶" } else { " " }
        );
        format!("{} {}", state.status, arrows.dim())
    }
}

impl Viewport for TerminalViewport {
    fn mount(&self, view: &DocumentView) {
        let backend = match view.backend() {
            BackendKind::Vector => "vector",
            BackendKind::Raster => "raster",
        };
        println!(
            "{} {} ({} pages, {backend})",
            "opened".green(),
            view.doc_name().bold(),
            view.page_count()
        );
    }

    fn scroll_to_page(&self, page_index: usize) {
        println!("  at page {}", page_index + 1);
    }

    fn show_placeholder(&self) {
        println!("{}", "select a document to view it".dim());
    }

    fn show_empty_results(&self) {
        println!("{}", "no documents matched your question".dim());
    }

    fn set_status(&self, text: &str) {
        self.state.lock().status = text.to_string();
        println!("{}", text.bold());
    }

    fn set_navigation(&self, previous_enabled: bool, next_enabled: bool) {
        let mut state = self.state.lock();
        state.previous_enabled = previous_enabled;
        state.next_enabled = next_enabled;
    }

    fn notify(&self, message: &str) {
        println!("{}", message.yellow());
    }
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "caseview.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // File only: console output belongs to the command loop.
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::parse_command;

    #[test]
    fn command_lines_split_into_verb_and_argument() {
        assert_eq!(parse_command("ask net pay\n"), Some(("ask", "net pay")));
        assert_eq!(parse_command("next"), Some(("next", "")));
        assert_eq!(parse_command("  goto  3 "), Some(("goto", "3")));
    }

    #[test]
    fn blank_lines_are_skipped() {
        assert_eq!(parse_command(""), None);
        assert_eq!(parse_command("   \n"), None);
    }
}
