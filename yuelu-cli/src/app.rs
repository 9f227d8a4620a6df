//! Subcommand implementations.

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use futures::StreamExt;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing::info;
use yuelu_rag::openai::API_KEY_ENV;
use yuelu_rag::{
    ChatTurn, OpenAICompatibleModel, OpenAIEmbeddingProvider, RagConfig, RagService, SearchResult,
    TurnStatus,
};

use crate::cli::{Cli, Command, Settings};

/// Run the parsed command line.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.settings.rag_config()?;
    let service = build_service(&cli.settings, config)?;

    match cli.command {
        Command::Index { rebuild } => index(&service, rebuild).await,
        Command::Ask { question, show_sources } => {
            let mut stdout = std::io::stdout();
            answer(&service, &question.join(" "), show_sources, &mut stdout).await
        }
        Command::Chat => chat(&service).await,
    }
}

/// Assemble a service talking to the configured embedding and completion endpoints.
pub fn build_service(settings: &Settings, config: RagConfig) -> anyhow::Result<RagService> {
    let api_key = settings
        .api_key
        .clone()
        .filter(|key| !key.is_empty())
        .ok_or_else(|| anyhow!("no embedding API key: pass --api-key or set {API_KEY_ENV}"))?;

    let embedder = OpenAIEmbeddingProvider::new(api_key)?
        .with_base_url(&settings.embedding_base_url)
        .with_model(&config.embedding.model)
        .with_dimensions(config.embedding.dimensions);

    let mut model = OpenAICompatibleModel::new(&settings.model_url, &settings.model);
    if let Some(key) = &settings.model_api_key {
        model = model.with_api_key(key);
    }

    let service = RagService::builder()
        .config(config)
        .embedding_provider(Arc::new(embedder))
        .language_model(Arc::new(model))
        .build()?;
    Ok(service)
}

async fn index(service: &RagService, rebuild: bool) -> anyhow::Result<()> {
    if rebuild {
        let build_id = service.rebuild().await.context("index rebuild failed")?;
        info!(%build_id, "index rebuilt");
    } else {
        service.ensure_ready().await.context("index build failed")?;
    }

    let index = service.index().await;
    println!(
        "index {} holds {} chunks ({} dimensions) in {}",
        index.build_id(),
        index.len(),
        index.dimension(),
        service.store().dir().display()
    );
    Ok(())
}

/// Stream the answer to `question` into `out`.
pub async fn answer(
    service: &RagService,
    question: &str,
    show_sources: bool,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    let mut stream = service.generate(question).await?;
    let sources = stream.sources().to_vec();

    while let Some(fragment) = stream.next().await {
        let fragment = fragment.context("answer was cut short")?;
        out.write_all(fragment.as_bytes())?;
        out.flush()?;
    }
    writeln!(out)?;

    if show_sources {
        write_sources(&sources, out)?;
    }
    Ok(())
}

fn write_sources(sources: &[SearchResult], out: &mut impl Write) -> std::io::Result<()> {
    for (rank, result) in sources.iter().enumerate() {
        writeln!(
            out,
            "[{}] {:.3} {}#{}",
            rank + 1,
            result.score,
            result.chunk.source.display(),
            result.chunk.chunk_index
        )?;
    }
    Ok(())
}

const PROMPT: &str = "you> ";

async fn chat(service: &RagService) -> anyhow::Result<()> {
    service.ensure_ready().await?;
    let mut editor = DefaultEditor::new()?;
    let mut history: Vec<ChatTurn> = Vec::new();
    println!("Ask anything about YueLu Academy. /clear resets the conversation, /rebuild re-indexes, /exit quits.");

    loop {
        let line = match tokio::task::block_in_place(|| editor.readline(PROMPT)) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        };
        let message = line.trim();
        if message.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(message);

        match message {
            "/exit" | "/quit" => break,
            "/clear" => {
                history.clear();
                continue;
            }
            "/rebuild" => {
                match service.rebuild().await {
                    Ok(build_id) => println!("rebuilt index {build_id}"),
                    Err(e) => eprintln!("rebuild failed: {e}"),
                }
                continue;
            }
            _ => {}
        }

        history = converse(service, message, history, &mut std::io::stdout()).await?;
    }
    Ok(())
}

/// Run one chat turn, echoing the answer as it grows, and return the new history.
pub async fn converse(
    service: &RagService,
    message: &str,
    history: Vec<ChatTurn>,
    out: &mut impl Write,
) -> anyhow::Result<Vec<ChatTurn>> {
    let turn_at = history.len();
    let mut latest = history.clone();
    let mut printed = 0;
    let mut snapshots = Box::pin(service.ask(message, history));

    while let Some(snapshot) = snapshots.next().await {
        if let Some(turn) = snapshot.get(turn_at) {
            if turn.assistant.len() > printed {
                out.write_all(turn.assistant[printed..].as_bytes())?;
                out.flush()?;
                printed = turn.assistant.len();
            }
            match &turn.status {
                TurnStatus::Complete => writeln!(out)?,
                TurnStatus::Failed(reason) => writeln!(out, "\n[answer interrupted: {reason}]")?,
                TurnStatus::Streaming => {}
            }
        }
        latest = snapshot;
    }
    Ok(latest)
}
