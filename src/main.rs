//! livecall - talk to Gemini from the terminal
//!
//! Subcommands:
//! - `livecall live` - Two-way voice session with the default microphone and speakers
//! - `livecall ask <text>` - One text reply, optionally grounded with web search
//! - `livecall say <text>` - Synthesize speech and play it
//! - `livecall config` - Show (or initialize) the settings file

use std::error::Error;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use app_lib::audio::{CpalSpeaker, LevelTap, PlaybackScheduler, Speaker};
use app_lib::effects::SessionRuntime;
use app_lib::services::{SpeechSynthesisClient, TextGenerationClient, TextRequest};
use app_lib::settings::{self, AppSettings};
use app_lib::state_machine::ConnectionState;
use app_lib::{LiveSessionHandle, SessionController};

type CliResult<T = ()> = Result<T, Box<dyn Error>>;

#[derive(Parser)]
#[command(name = "livecall")]
#[command(about = "Live voice sessions with Gemini")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a live voice session (Ctrl-C to hang up)
    Live {
        /// System instruction for the model
        #[arg(short, long)]
        instruction: Option<String>,
    },

    /// Ask for a text reply
    Ask {
        text: String,

        /// System instruction for the model
        #[arg(short, long)]
        instruction: Option<String>,

        /// Disable web search grounding
        #[arg(long)]
        no_search: bool,
    },

    /// Speak text aloud
    Say {
        text: String,

        /// Prebuilt voice name
        #[arg(short, long)]
        voice: Option<String>,
    },

    /// Show the settings file
    Config {
        /// Write the current settings (defaults filled in) back to disk
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() {
    // Load .env file if present (for development convenience)
    let _ = dotenvy::dotenv();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        log::debug!("TLS crypto provider already installed");
    }

    let cli = Cli::parse();
    let settings = settings::load_settings();

    let result = match cli.command {
        Commands::Live { instruction } => run_live(settings, instruction).await,
        Commands::Ask {
            text,
            instruction,
            no_search,
        } => run_ask(settings, text, instruction, no_search).await,
        Commands::Say { text, voice } => run_say(settings, text, voice).await,
        Commands::Config { init } => run_config(settings, init),
    };

    if let Err(e) = result {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run_live(settings: AppSettings, instruction: Option<String>) -> CliResult {
    if !settings::is_api_key_configured() {
        log::warn!("No API key found; the session will fail to connect");
    }

    let runtime = SessionRuntime::with_defaults(settings, settings::get_api_key());
    let (controller, handle) = SessionController::new(runtime);

    // The controller owns the audio devices, so it runs on this task
    let body = async {
        let result = follow_session(&handle, instruction).await;
        if handle.shutdown().await.is_err() {
            log::debug!("Session loop already stopped");
        }
        result
    };

    let ((), result) = tokio::join!(controller.run(), body);
    result
}

/// Connect and log state changes until hang-up, remote close or failure.
async fn follow_session(handle: &LiveSessionHandle, instruction: Option<String>) -> CliResult {
    handle.connect(instruction).await?;

    let mut updates = handle.subscribe();
    let mut last_state: Option<ConnectionState> = None;
    let mut was_active = false;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Hanging up");
                return Ok(());
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let snapshot = updates.borrow_and_update().clone();

                if last_state != Some(snapshot.connection_state) {
                    log::info!("Session {}", snapshot.connection_state);
                    last_state = Some(snapshot.connection_state);
                }
                log::trace!("Volume {:.0}", snapshot.volume);

                match (snapshot.connection_state, snapshot.error) {
                    (ConnectionState::Connecting | ConnectionState::Connected, _) => {
                        was_active = true
                    }
                    (ConnectionState::Error | ConnectionState::Disconnected, Some(message)) => {
                        return Err(message.into());
                    }
                    (ConnectionState::Error, None) => return Err("Session failed".into()),
                    (ConnectionState::Disconnected, None) if was_active => {
                        log::info!("Remote end closed the session");
                        return Ok(());
                    }
                    (ConnectionState::Disconnected, None) => {}
                }
            }
        }
    }
}

async fn run_ask(
    settings: AppSettings,
    text: String,
    instruction: Option<String>,
    no_search: bool,
) -> CliResult {
    let client = TextGenerationClient::new(&settings, settings::get_api_key())?;

    let request = TextRequest {
        system_instruction: instruction.or_else(|| Some(settings.default_instruction.clone())),
        search_enabled: settings.search_enabled && !no_search,
        ..TextRequest::new(text)
    };
    let reply = client.generate(&request).await?;

    println!("{}", reply.text);
    if !reply.citations.is_empty() {
        println!();
        println!("Sources:");
        for citation in &reply.citations {
            println!("  {} <{}>", citation.title, citation.uri);
        }
    }
    Ok(())
}

async fn run_say(settings: AppSettings, text: String, voice: Option<String>) -> CliResult {
    let client = SpeechSynthesisClient::new(&settings, settings::get_api_key())?;
    let chunk = match voice {
        Some(voice) => client.synthesize_with_voice(&text, &voice).await?,
        None => client.synthesize(&text).await?,
    };

    let (ended_tx, mut ended_rx) = mpsc::unbounded_channel();
    let mut speaker = CpalSpeaker::new();
    let output = speaker.open_output(settings.output_sample_rate, LevelTap::default(), ended_tx)?;
    let mut scheduler = PlaybackScheduler::new(output, settings.output_sample_rate);

    let source = scheduler.enqueue(&chunk)?;
    let remaining = (source.start_at - scheduler.current_time() + source.duration).max(0.0);
    let wait = Duration::from_secs_f64(remaining) + Duration::from_secs(1);

    match tokio::time::timeout(wait, ended_rx.recv()).await {
        Ok(Some(id)) => {
            scheduler.source_ended(id);
        }
        Ok(None) => log::warn!("Audio output closed early"),
        Err(_) => log::warn!("Playback did not report completion"),
    }
    Ok(())
}

fn run_config(settings: AppSettings, init: bool) -> CliResult {
    let path = settings::settings_path()?;

    if init {
        settings::save_settings_to(&path, &settings)?;
        log::info!("Wrote {}", path.display());
    }

    println!("# {}", path.display());
    println!("{}", serde_json::to_string_pretty(&settings)?);
    println!(
        "# API key: {}",
        if settings::is_api_key_configured() {
            "configured"
        } else {
            "missing"
        }
    );
    Ok(())
}
