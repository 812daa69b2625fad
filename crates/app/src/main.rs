use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser};
use coordinator::AnalysisRequest;
use percepta::args::{Cli, Command};
use percepta::printer::StreamPrinter;
use percepta::{config, follow_turn, media, Pipeline, TurnOutcome};
use providers::ollama::OllamaModel;
use providers::{Availability, LanguageModel};
use services::{list_archived, search, ConversationStore, JsonDirConversationStore};
use shared::ids::ConversationKey;
use shared::protocol::CaptureKind;
use shared::settings::AppSettings;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// The terminal hosts a single conversation
const TERMINAL_KEY: i64 = 1;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let command = Cli::parse().into_command();
    let (settings, from_disk) = config::load_settings_or_default();
    if !from_disk {
        info!("no settings file, using defaults");
    }

    match command {
        Command::Help => {
            Cli::command().print_help()?;
            Ok(())
        }
        Command::InitConfig => {
            config::save_settings(&settings)?;
            if let Some(path) = config::config_path() {
                println!("{}", path.display());
            }
            Ok(())
        }
        Command::History => {
            let store = open_store().await?;
            for record in list_archived(&store).await? {
                println!(
                    "{}  {}  {}",
                    record.id,
                    record.updated_at.format("%Y-%m-%d %H:%M"),
                    record.title.as_deref().unwrap_or("(untitled)")
                );
            }
            Ok(())
        }
        Command::Search { query } => {
            let store = open_store().await?;
            for hit in search(&store, &query).await? {
                println!(
                    "{}  {}\n    {}",
                    hit.record_id,
                    hit.title.as_deref().unwrap_or("(untitled)"),
                    hit.snippet
                );
            }
            Ok(())
        }
        Command::Describe { page, image } => {
            let page = match page {
                Some(path) => Some(media::load_page_signals(&path).await?),
                None => None,
            };
            let image = match image {
                Some(path) => Some(media::load_image(&path).await?),
                None => None,
            };
            let kind = if page.is_some() {
                CaptureKind::Screenshot
            } else {
                CaptureKind::Image
            };
            let pipeline = start_pipeline(settings).await?;
            let key = ConversationKey::new(TERMINAL_KEY);
            let request = AnalysisRequest {
                key,
                kind,
                media: image,
                page,
            };
            let mut ui = pipeline.coordinator.ui().subscribe();
            pipeline.coordinator.start_analysis(request).await?;
            let outcome = print_turn(&mut ui, key, true).await?;
            converse(&pipeline, key, ui, outcome.actions).await
        }
        Command::Resume { record_id } => {
            let pipeline = start_pipeline(settings).await?;
            let record = pipeline
                .store
                .get(&record_id)
                .await?
                .with_context(|| format!("no conversation {}", record_id))?;
            println!("# {}", record.title.as_deref().unwrap_or("(untitled)"));
            for message in &record.messages {
                println!("[{:?}] {}", message.role, message.text);
            }

            let key = ConversationKey::new(TERMINAL_KEY);
            let mut ui = pipeline.coordinator.ui().subscribe();
            let mut stdin = BufReader::new(tokio::io::stdin()).lines();
            let Some(question) = prompt_line(&mut stdin, &record.actions).await? else {
                return Ok(());
            };
            pipeline
                .coordinator
                .resume_conversation(key, &record.id, question)
                .await?;
            print_turn(&mut ui, key, false).await?;
            converse_with(&pipeline, key, ui, record.actions, stdin).await
        }
    }
}

async fn open_store() -> Result<JsonDirConversationStore> {
    JsonDirConversationStore::open(config::conversations_dir()).await
}

async fn start_pipeline(settings: AppSettings) -> Result<Pipeline> {
    let model = OllamaModel::new(&settings.model);
    match model.availability().await {
        Availability::Available => {}
        Availability::Downloadable => {
            warn!(model = %settings.model.model, "model is not pulled yet, run `ollama pull` first")
        }
        Availability::Unavailable => bail!(
            "no Ollama server reachable at {}",
            settings.model.ollama_base_url
        ),
    }
    let store = open_store().await?;
    Ok(Pipeline::start(settings, Arc::new(model), Arc::new(store)))
}

async fn print_turn(
    ui: &mut tokio::sync::broadcast::Receiver<coordinator::UiEvent>,
    key: ConversationKey,
    expect_meta: bool,
) -> Result<TurnOutcome> {
    let mut printer = StreamPrinter::new();
    let outcome = follow_turn(ui, key, expect_meta, |text| {
        print!("{}", printer.delta(text));
        let _ = std::io::stdout().flush();
    })
    .await?;
    println!();
    if let Some(title) = &outcome.title {
        println!("\n# {}", title);
    }
    Ok(outcome)
}

async fn prompt_line(
    stdin: &mut Lines<BufReader<Stdin>>,
    actions: &[String],
) -> Result<Option<String>> {
    for (i, action) in actions.iter().enumerate() {
        println!("  {}) {}", i + 1, action);
    }
    print!("> ");
    std::io::stdout().flush()?;

    let Some(line) = stdin.next_line().await? else {
        return Ok(None);
    };
    let line = line.trim();
    if line.is_empty() || line == "quit" {
        return Ok(None);
    }
    // A number picks a suggested question
    let question = line
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_sub(1))
        .and_then(|i| actions.get(i).cloned())
        .unwrap_or_else(|| line.to_string());
    Ok(Some(question))
}

async fn converse(
    pipeline: &Pipeline,
    key: ConversationKey,
    ui: tokio::sync::broadcast::Receiver<coordinator::UiEvent>,
    actions: Vec<String>,
) -> Result<()> {
    let stdin = BufReader::new(tokio::io::stdin()).lines();
    converse_with(pipeline, key, ui, actions, stdin).await
}

async fn converse_with(
    pipeline: &Pipeline,
    key: ConversationKey,
    mut ui: tokio::sync::broadcast::Receiver<coordinator::UiEvent>,
    actions: Vec<String>,
    mut stdin: Lines<BufReader<Stdin>>,
) -> Result<()> {
    while let Some(question) = prompt_line(&mut stdin, &actions).await? {
        if let Err(e) = pipeline.coordinator.ask_followup(key, question, None).await {
            warn!("{}", e);
            continue;
        }
        print_turn(&mut ui, key, false).await?;
    }
    pipeline.coordinator.close_conversation(key).await;
    Ok(())
}
