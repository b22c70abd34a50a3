use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use clap::{Parser, Subcommand};
use hound::{SampleFormat, WavSpec, WavWriter};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use waav_tts_murf::core::tts::murf::MurfAudioFormat;
use waav_tts_murf::{EndOfTurnReason, MurfSettings, MurfTts, TtsEvent};

/// WaaV Murf TTS - streaming text-to-speech over Murf's WebSocket API
#[derive(Parser, Debug)]
#[command(name = "waav-tts-murf")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Synthesize text into a WAV file
    Speak {
        /// Text to synthesize
        #[arg(short = 't', long = "text")]
        text: String,

        /// Voice ID override (e.g. en-US-natalie)
        #[arg(long = "voice")]
        voice: Option<String>,

        /// Voice style override
        #[arg(long = "style")]
        style: Option<String>,

        /// Output WAV file
        #[arg(short = 'o', long = "output", default_value = "out.wav")]
        output: PathBuf,

        /// Give up if synthesis has not finished after this many seconds
        #[arg(long = "timeout", default_value_t = 60)]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Must be installed before any TLS connection is attempted
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            MurfSettings::from_file(path)?
        }
        None => MurfSettings::from_env()?,
    };

    match cli.command {
        Commands::Speak {
            text,
            voice,
            style,
            output,
            timeout_secs,
        } => {
            let mut config = settings.to_tts_config()?;
            if let Some(voice) = voice {
                config.voice_id = voice;
            }
            if style.is_some() {
                config.style = style;
            }
            let sample_bytes = match config.format.bytes_per_sample() {
                Some(bytes) if config.format == MurfAudioFormat::Pcm => bytes,
                _ => bail!(
                    "speak writes WAV from raw PCM; configured format is {}",
                    config.format
                ),
            };

            let samples = tokio::time::timeout(
                Duration::from_secs(timeout_secs),
                synthesize(MurfTts::new(config.clone()), &text),
            )
            .await
            .map_err(|_| anyhow!("Synthesis did not finish within {timeout_secs}s"))??;

            let spec = WavSpec {
                channels: config.channel_type.num_channels(),
                sample_rate: config.sample_rate,
                bits_per_sample: (sample_bytes * 8) as u16,
                sample_format: SampleFormat::Int,
            };
            let mut writer = WavWriter::create(&output, spec)
                .with_context(|| format!("Failed to create {}", output.display()))?;
            for sample in &samples {
                writer.write_sample(*sample)?;
            }
            writer.finalize()?;

            info!(
                "Wrote {} samples ({:.2}s) to {}",
                samples.len(),
                samples.len() as f64
                    / (f64::from(spec.sample_rate) * f64::from(spec.channels)),
                output.display()
            );
        }
    }

    Ok(())
}

/// Runs a single context to completion and returns its 16-bit samples.
async fn synthesize(mut tts: MurfTts, text: &str) -> anyhow::Result<Vec<i16>> {
    tts.connect().await?;
    let mut events = tts.receive()?;

    let context_id = tts.begin_context();
    tts.submit_text(text, &context_id, true).await?;
    tts.flush_audio(&context_id).await?;

    let mut pcm = Vec::new();
    let mut reason = None;
    while let Some(event) = events.recv().await {
        match event {
            TtsEvent::Audio(frame) if frame.context_id == context_id => {
                pcm.extend_from_slice(&frame.data);
            }
            TtsEvent::EndOfTurn {
                context_id: ended,
                reason: why,
            } if ended == context_id => {
                reason = Some(why);
                break;
            }
            TtsEvent::Metrics(metrics) if metrics.context_id == context_id => {
                if let Some(ttfb) = metrics.ttfb {
                    info!("Time to first audio: {ttfb:?}");
                }
            }
            TtsEvent::Error { error, fatal, .. } => {
                if fatal {
                    bail!("Murf session failed: {error}");
                }
                warn!("Murf reported an error: {error}");
            }
            _ => {}
        }
    }
    tts.close().await?;

    match reason {
        Some(EndOfTurnReason::Completed) => {}
        Some(other) => bail!("Synthesis ended early: {other:?}"),
        None => bail!("Event stream closed before synthesis finished"),
    }

    if pcm.len() % 2 != 0 {
        warn!("Dropping trailing odd byte from PCM stream");
        pcm.pop();
    }
    Ok(pcm
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}
