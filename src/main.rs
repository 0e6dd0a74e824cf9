use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use voxbridge::config::Config;
use voxbridge::gateway;
use voxbridge::voice::codec;
use voxbridge::voice::{
    ConversationEngine, Direction, EngineEvent, PcmFileCapture, TransportConfig, TurnState,
    WavFileSink, WsConnector,
};

/// Realtime English <-> Thai speech-to-speech interpreter.
#[derive(Parser, Debug)]
#[command(name = "voxbridge", version, about)]
struct Cli {
    /// Config file (default: platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the relay gateway
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },

    /// Interpret one utterance from a file and write the reply to a WAV file
    Talk {
        /// PCM16 24kHz mono input, raw or WAV
        #[arg(long)]
        input: PathBuf,
        /// Translated audio output (WAV)
        #[arg(long)]
        output: PathBuf,
        /// en-th or th-en
        #[arg(long, default_value = "en-th", value_parser = parse_direction)]
        direction: Direction,
        /// Output voice for this direction
        #[arg(long)]
        voice: Option<String>,
        /// Connect to the model directly instead of through the relay
        #[arg(long)]
        direct: bool,
        /// Give up if the reply has not finished by then
        #[arg(long, default_value_t = 120)]
        timeout_secs: u64,
    },

    /// Print the effective configuration
    Config {
        /// Print the JSON schema instead
        #[arg(long)]
        schema: bool,
    },
}

fn parse_direction(value: &str) -> Result<Direction, String> {
    Direction::from_str_code(value).ok_or_else(|| format!("unknown direction {value:?} (expected en-th or th-en)"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("voxbridge=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Config { schema: true } => {
            println!("{}", Config::schema_json()?);
            Ok(())
        }
        Commands::Config { schema: false } => {
            let config = Config::load(cli.config.as_deref())?;
            print!("{}", config.redacted().to_toml()?);
            Ok(())
        }
        Commands::Serve { host, port } => {
            let mut config = Config::load(cli.config.as_deref())?;
            if let Some(host) = host {
                config.relay.host = host;
            }
            if let Some(port) = port {
                config.relay.port = port;
            }
            config.validate()?;
            gateway::run_gateway(config).await
        }
        Commands::Talk {
            input,
            output,
            direction,
            voice,
            direct,
            timeout_secs,
        } => {
            let config = Config::load(cli.config.as_deref())?;
            let options = TalkOptions {
                input,
                output,
                direction,
                voice,
                direct,
                timeout: Duration::from_secs(timeout_secs),
            };
            run_talk(&config, options).await
        }
    }
}

struct TalkOptions {
    input: PathBuf,
    output: PathBuf,
    direction: Direction,
    voice: Option<String>,
    direct: bool,
    timeout: Duration,
}

/// Raw PCM16 as-is, or the payload of a 24kHz mono WAV file.
async fn read_input(path: &Path) -> Result<codec::DecodedAudio> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let audio = codec::decode_input(bytes).with_context(|| format!("Failed to decode {}", path.display()))?;
    if audio.sample_rate != codec::SAMPLE_RATE || audio.channels != codec::CHANNELS {
        bail!(
            "{} is {} Hz / {} ch; expected {} Hz mono",
            path.display(),
            audio.sample_rate,
            audio.channels,
            codec::SAMPLE_RATE
        );
    }
    Ok(audio)
}

async fn run_talk(config: &Config, options: TalkOptions) -> Result<()> {
    let audio = read_input(&options.input).await?;
    tracing::info!(
        input = %options.input.display(),
        duration_ms = audio.duration_ms(),
        direction = %options.direction,
        "Loaded input audio"
    );

    let transport = if options.direct {
        config.upstream_transport()?
    } else {
        TransportConfig::via_relay(&config.client.relay_url)
    };
    let sink = WavFileSink::shared(&options.output);
    let capture = PcmFileCapture::realtime(audio.pcm, config.client.chunk_ms);

    let (engine, handle, mut events) = ConversationEngine::new(
        Arc::new(WsConnector::new(transport)),
        Arc::new(config.direction_table()),
        Box::new(capture),
        Box::new(sink.clone()),
        config.engine_config(options.direction),
    );
    let engine = tokio::spawn(engine.run());

    if let Some(voice) = options.voice {
        handle.set_voice(options.direction, voice).await?;
    }
    handle.start_capture(options.direction).await?;

    let outcome = tokio::time::timeout(options.timeout, async {
        let mut replied = false;
        while let Some(event) = events.recv().await {
            match event {
                EngineEvent::StateChanged(TurnState::Processing) => replied = true,
                EngineEvent::StateChanged(TurnState::Idle) if replied => return Ok(()),
                EngineEvent::StateChanged(TurnState::Error) => {}
                EngineEvent::Error(message) => return Err(anyhow::anyhow!(message)),
                EngineEvent::CaptureError(message) => bail!("capture failed: {message}"),
                EngineEvent::OutputTranscriptDelta(_) | EngineEvent::Played { .. } => {}
                other => tracing::debug!(?other, "Engine event"),
            }
        }
        bail!("engine stopped before the reply finished")
    })
    .await;

    // The engine may already have exited on its own.
    let _ = handle.shutdown().await;
    let session = engine.await.context("Conversation engine panicked")?;

    let written = {
        let sink = sink.lock().await;
        sink.finish().await?;
        sink.bytes()
    };

    println!("you:    {}", session.input_transcript());
    println!("reply:  {}", session.output_transcript());
    println!(
        "audio:  {} ({} ms)",
        options.output.display(),
        codec::duration_ms(written, codec::SAMPLE_RATE, codec::CHANNELS)
    );

    match outcome {
        Ok(result) => result,
        Err(_) => bail!("no complete reply within {:?}", options.timeout),
    }
}
