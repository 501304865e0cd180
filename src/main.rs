//! Companion CLI
//!
//! Line-oriented chat with a configured companion persona, plus helpers to
//! inspect companions and stored transcripts and to try the voice and image
//! adapters on their own.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use companion::config;
use companion::modality::voice::{AudioChunk, AzureSpeechClient};
use companion::modality::{ImageAnalyzer, SpeechRecognizer, SpeechSynthesizer};
use companion::notify::{dispatch, LogNotifier, Notification};
use companion::persona::TomlCompanionDirectory;
use companion::store::{JsonlConversationStore, MemoryConversationStore};
use companion::{
    CompanionConfig, CompanionDirectory, ConversationOrchestrator, ConversationStore, ModelGateway,
    TurnInput, TurnRequest,
};
use futures::StreamExt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Companion - talk to a configurable AI persona
#[derive(Parser, Debug)]
#[command(name = "companion")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Data directory (config.toml, companions.toml, conversations/)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Verbose output: debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Chat from stdin. `/image PATH` sends an image, `/voice WAV...` sends
    /// speech, `/quit` exits.
    Chat {
        #[arg(long)]
        user: String,

        #[arg(long)]
        companion: String,

        /// Synthesize every reply into a WAV file in this directory
        #[arg(long)]
        speak_to: Option<PathBuf>,

        /// Keep the conversation in memory only
        #[arg(long)]
        ephemeral: bool,
    },

    /// List configured companions
    Companions,

    /// Print the stored transcript for a user and companion
    History {
        #[arg(long)]
        user: String,

        #[arg(long)]
        companion: String,
    },

    /// Synthesize text to a WAV file
    Speak {
        text: String,

        #[arg(short, long, default_value = "reply.wav")]
        out: PathBuf,
    },

    /// Describe an image without starting a turn
    Describe { path: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => config::default_data_dir()?,
    };
    let config = config::load(&data_dir)
        .await
        .with_context(|| format!("loading configuration from {}", data_dir.display()))?;
    info!("Data directory: {:?}", config.data_dir);

    match cli.command {
        Command::Chat {
            user,
            companion,
            speak_to,
            ephemeral,
        } => run_chat(&config, user, companion, speak_to, ephemeral).await,
        Command::Companions => list_companions(&config).await,
        Command::History { user, companion } => show_history(&config, &user, &companion).await,
        Command::Speak { text, out } => speak(&config, &text, &out).await,
        Command::Describe { path } => {
            let analyzer = ImageAnalyzer::from_settings(&config.model, &config.vision)?;
            println!("{}", analyzer.analyze_path(&path).await?);
            Ok(())
        }
    }
}

async fn open_store(config: &CompanionConfig, ephemeral: bool) -> anyhow::Result<Arc<dyn ConversationStore>> {
    if ephemeral {
        return Ok(Arc::new(MemoryConversationStore::new()));
    }
    Ok(Arc::new(
        JsonlConversationStore::open(config.conversations_dir()).await?,
    ))
}

async fn run_chat(
    config: &CompanionConfig,
    user: String,
    companion_id: String,
    speak_to: Option<PathBuf>,
    ephemeral: bool,
) -> anyhow::Result<()> {
    let directory: Arc<dyn CompanionDirectory> =
        Arc::new(TomlCompanionDirectory::new(config.companions_file()));
    let companion = directory.get_companion(&companion_id).await?;

    let store = open_store(config, ephemeral).await?;
    let gateway = ModelGateway::from_settings(&config.model)?;
    let orchestrator = Arc::new(ConversationOrchestrator::new(
        store, directory, gateway, config,
    ));

    // Adapters are optional; chat works without them
    let speech = match AzureSpeechClient::from_settings(&config.speech) {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            if speak_to.is_some() {
                warn!("Speech output disabled: {}", e);
            }
            None
        }
    };
    let analyzer = ImageAnalyzer::from_settings(&config.model, &config.vision)
        .map_err(|e| warn!("Image input disabled: {}", e))
        .ok();
    if let Some(dir) = &speak_to {
        tokio::fs::create_dir_all(dir).await?;
    }

    dispatch(
        Arc::new(LogNotifier),
        Notification::SessionStarted {
            user_id: user.clone(),
            companion_id: companion_id.clone(),
        },
    );

    println!("Chatting with {}. /image PATH, /voice WAV..., /quit", companion.name);
    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    let mut replies = 0usize;

    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next().await else {
            break;
        };
        let line = line?;
        let line = line.trim();

        let input = if line == "/quit" {
            break;
        } else if let Some(path) = line.strip_prefix("/image ") {
            let Some(analyzer) = &analyzer else {
                eprintln!("Image input is not available");
                continue;
            };
            match analyzer.analyze_path(Path::new(path.trim())).await {
                Ok(description) => TurnInput::ImageDescription(description),
                Err(e) => {
                    eprintln!("Image analysis failed: {e}");
                    continue;
                }
            }
        } else if let Some(paths) = line.strip_prefix("/voice ") {
            let Some(speech) = &speech else {
                eprintln!("Speech input is not available");
                continue;
            };
            match transcribe(speech.clone(), paths.split_whitespace()).await {
                Ok(fragments) => TurnInput::voice_from_fragments(&fragments),
                Err(e) => {
                    eprintln!("Could not read audio: {e}");
                    continue;
                }
            }
        } else {
            TurnInput::Text(line.to_string())
        };

        let request = TurnRequest::new(user.clone(), companion_id.clone(), input);
        match orchestrator.submit(request).await {
            Ok(response) => {
                println!("{}: {}", companion.name, response.assistant_message.content);
                replies += 1;
                if let (Some(dir), Some(speech)) = (&speak_to, &speech) {
                    let path = dir.join(format!("reply-{replies:03}.wav"));
                    speak_reply(speech.as_ref(), &response.assistant_message.content, &path).await;
                }
            }
            Err(e) if e.reason() == "empty_input" => continue,
            Err(e) => {
                eprintln!("[{}] {}", e.reason(), e);
                if e.is_retryable() {
                    eprintln!("(you can send the same message again)");
                }
            }
        }
    }

    Ok(())
}

/// Run the recognizer over WAV files, one chunk per file.
async fn transcribe<'a>(
    speech: Arc<AzureSpeechClient>,
    paths: impl Iterator<Item = &'a str>,
) -> anyhow::Result<Vec<String>> {
    let mut chunks = Vec::new();
    for path in paths {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {path}"))?;
        chunks.push(AudioChunk(bytes));
    }
    let recognizer = SpeechRecognizer::new(speech);
    let session = recognizer.start(futures::stream::iter(chunks));
    let fragments = session.collect_transcript().await;
    recognizer.stop();
    Ok(fragments)
}

/// Failure here never affects the chat
async fn speak_reply(speech: &dyn SpeechSynthesizer, text: &str, path: &Path) {
    match speech.synthesize(text).await {
        Ok(audio) => {
            if let Err(e) = tokio::fs::write(path, audio).await {
                error!("Could not write {}: {}", path.display(), e);
            }
        }
        Err(e) => warn!("Speech synthesis failed: {}", e),
    }
}

async fn speak(config: &CompanionConfig, text: &str, out: &Path) -> anyhow::Result<()> {
    let client = AzureSpeechClient::from_settings(&config.speech)?;
    let audio = client.synthesize(text).await?;
    tokio::fs::write(out, &audio).await?;
    println!("Wrote {} bytes to {}", audio.len(), out.display());
    Ok(())
}

async fn list_companions(config: &CompanionConfig) -> anyhow::Result<()> {
    let directory = TomlCompanionDirectory::new(config.companions_file());
    let companions = directory.list_companions().await?;
    if companions.is_empty() {
        println!("No companions in {}", config.companions_file().display());
    }
    for companion in companions {
        println!("{:<16} {}", companion.id, companion.name);
    }
    Ok(())
}

async fn show_history(config: &CompanionConfig, user: &str, companion: &str) -> anyhow::Result<()> {
    let store = open_store(config, false).await?;
    let Some(conversation) = store.find_conversation(user, companion).await? else {
        println!("No conversation yet");
        return Ok(());
    };
    for message in store.list_messages(&conversation.id).await? {
        println!(
            "[{}] {}: {}",
            message.created_at.format("%Y-%m-%d %H:%M:%S"),
            message.role.as_str(),
            message.content
        );
    }
    Ok(())
}
