// Demo client: talk to the relay from the command line
//
// Streams a 16-bit mono WAV file through the capture bufferer to a running relay,
// then records the assistant's spoken reply through the playback sequencer into
// another WAV file.
//
// 1. Read the input WAV and open the capture pipeline (size/time flush policy)
// 2. Feed the file in microphone-sized chunks at real-time pace
// 3. Send each flushed blob as an `input_audio_buffer.append` event
// 4. Decode `response.audio.delta` events and queue them for playback
// 5. Write everything that was played to the output WAV
//
// Usage: cargo run --bin relay-client -- --input question.wav --topic coffee

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn, Level};
use voice_relay_backend::audio::pcm::{decode_pcm16_le, f32_to_pcm16, pcm16_to_f32};
use voice_relay_backend::audio::{
    AudioChunk, AudioSegment, CaptureBufferer, CaptureDevice, CaptureHandle, FlushPolicy,
    FlushedBlob, PlaybackCompletion, PlaybackDevice, PlaybackSequencer,
};
use voice_relay_backend::{AppConfig, AppError, AppResult};

#[derive(Parser)]
#[command(name = "relay-client")]
#[command(about = "Send a WAV question through the voice relay and record the reply")]
struct Args {
    /// Relay WebSocket endpoint
    #[arg(short, long, default_value = "ws://127.0.0.1:3000/ws")]
    url: String,

    /// Conversation topic passed to the relay
    #[arg(short, long)]
    topic: Option<String>,

    /// 16-bit mono PCM WAV file to send
    #[arg(short, long)]
    input: PathBuf,

    /// Where to write the assistant's reply
    #[arg(short, long, default_value = "reply.wav")]
    output: PathBuf,

    /// Microphone chunk length in milliseconds
    #[arg(long, default_value = "100")]
    chunk_ms: u64,

    /// Stop after this many completed responses
    #[arg(long, default_value = "1")]
    responses: usize,

    /// Give up waiting for replies after this many seconds
    #[arg(long, default_value = "60")]
    listen_secs: u64,
}

/// The subset of realtime server events the client reacts to.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ServerEvent {
    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },
    #[serde(rename = "response.audio_transcript.done")]
    TranscriptDone { transcript: String },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscribed { transcript: String },
    #[serde(rename = "response.done")]
    ResponseDone,
    #[serde(rename = "error")]
    Error { error: serde_json::Value },
    #[serde(other)]
    Other,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let args = Args::parse();
    let config = AppConfig::load()?;
    let policy = FlushPolicy::from(&config.capture);
    let sample_rate = config.capture.sample_rate;

    let (header, samples) = read_wav(&args.input)?;
    info!(
        "Loaded {} ({} samples, {} Hz)",
        args.input.display(),
        samples.len(),
        header.sampling_rate
    );

    let url = relay_url(&args.url, args.topic.as_deref());
    info!("Connecting to {}", url);
    let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .with_context(|| format!("Failed to connect to relay at {}", url))?;
    let (mut ws_write, ws_read) = socket.split();

    // Capture side: bufferer → blob channel → websocket writer task.
    let (blob_tx, mut blob_rx) = mpsc::unbounded_channel::<FlushedBlob>();
    let microphone = WavMicrophone::new(&args.input, header.sampling_rate, sample_rate);
    let bufferer = CaptureBufferer::new(
        microphone,
        move |blob: FlushedBlob| {
            let _ = blob_tx.send(blob);
        },
        policy,
    );
    let capture = CaptureHandle::spawn(bufferer)?;

    let writer = tokio::spawn(async move {
        while let Some(blob) = blob_rx.recv().await {
            let event = json!({
                "type": "input_audio_buffer.append",
                "audio": STANDARD.encode(blob.as_bytes()),
            });
            debug!("Sending {} bytes of audio", blob.len());
            if let Err(e) = ws_write.send(Message::Text(event.to_string())).await {
                warn!("Relay write failed: {}", e);
                break;
            }
        }
        ws_write
    });

    // Playback side: decoded deltas → sequencer → WAV recorder.
    let recorder = WavRecorder::new(true);
    let recorded = recorder.samples();
    let (segment_tx, segment_rx) = mpsc::unbounded_channel();
    let player = tokio::spawn(PlaybackSequencer::new(recorder).run(segment_rx));

    let mut reader = tokio::spawn(read_events(ws_read, segment_tx, sample_rate, args.responses));

    let chunk_samples = (sample_rate as u64 * args.chunk_ms / 1000).max(1) as usize;
    feed_microphone(&capture, &samples, chunk_samples, Duration::from_millis(args.chunk_ms)).await;

    // Let the timer flush the tail; stop() discards whatever is still buffered.
    tokio::time::sleep(policy.interval + Duration::from_millis(50)).await;
    capture.stop().await?;

    let mut ws_write = writer.await?;

    match tokio::time::timeout(Duration::from_secs(args.listen_secs), &mut reader).await {
        Ok(joined) => joined??,
        Err(_) => {
            warn!("No complete reply after {} seconds", args.listen_secs);
            // Dropping the reader closes the segment channel so playback can drain.
            reader.abort();
        }
    }
    let _ = ws_write.close().await;

    player.await?;
    let reply = recorded.lock().unwrap_or_else(PoisonError::into_inner).clone();
    write_wav(&args.output, &reply, sample_rate)?;
    info!(
        "Wrote {:.1}s of reply audio to {}",
        reply.len() as f32 / sample_rate as f32,
        args.output.display()
    );

    Ok(())
}

/// Feed samples into the capture pipeline one chunk per period.
async fn feed_microphone(
    capture: &CaptureHandle,
    samples: &[i16],
    chunk_samples: usize,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    for chunk in samples.chunks(chunk_samples) {
        ticker.tick().await;
        if !capture.ingest(AudioChunk::new(chunk.to_vec())) {
            warn!("Capture stopped early");
            break;
        }
    }
}

/// Handle relay events until enough responses completed or the relay closed.
async fn read_events<S>(
    mut ws_read: S,
    segments: mpsc::UnboundedSender<AudioSegment>,
    sample_rate: u32,
    wanted_responses: usize,
) -> Result<()>
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let mut completed = 0;

    while let Some(message) = ws_read.next().await {
        let text = match message? {
            Message::Text(text) => text,
            Message::Close(frame) => {
                info!("Relay closed the connection: {:?}", frame);
                break;
            }
            _ => continue,
        };

        match serde_json::from_str::<ServerEvent>(&text) {
            Ok(ServerEvent::AudioDelta { delta }) => {
                let segment = decode_delta(&delta, sample_rate)?;
                let _ = segments.send(segment);
            }
            Ok(ServerEvent::InputTranscribed { transcript }) => {
                info!("You said: {}", transcript.trim())
            }
            Ok(ServerEvent::TranscriptDone { transcript }) => {
                info!("Assistant: {}", transcript.trim())
            }
            Ok(ServerEvent::ResponseDone) => {
                completed += 1;
                if completed >= wanted_responses {
                    break;
                }
            }
            Ok(ServerEvent::Error { error }) => warn!("Upstream error event: {}", error),
            Ok(ServerEvent::Other) => {}
            Err(e) => debug!("Ignoring unparseable event: {}", e),
        }
    }

    Ok(())
}

fn decode_delta(delta: &str, sample_rate: u32) -> AppResult<AudioSegment> {
    let bytes = STANDARD
        .decode(delta)
        .map_err(|e| AppError::BadRequest(format!("Invalid base64 audio delta: {}", e)))?;
    let samples = decode_pcm16_le(&bytes)?;
    Ok(AudioSegment::new(pcm16_to_f32(&samples), sample_rate))
}

/// Append `?topic=` to the relay URL, percent-encoding the value.
fn relay_url(base: &str, topic: Option<&str>) -> String {
    match topic {
        Some(topic) if !topic.is_empty() => {
            format!("{}?topic={}", base, urlencoding::encode(topic))
        }
        _ => base.to_string(),
    }
}

fn read_wav(path: &Path) -> Result<(wav::Header, Vec<i16>)> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let (header, data) =
        wav::read(&mut file).with_context(|| format!("Failed to read {}", path.display()))?;

    if header.channel_count != 1 {
        return Err(anyhow!("Expected mono audio, got {} channels", header.channel_count));
    }
    let samples = data.try_into_sixteen().map_err(|_| {
        anyhow!(
            "Expected 16-bit PCM, got {} bits per sample",
            header.bits_per_sample
        )
    })?;
    Ok((header, samples))
}

fn write_wav(path: &Path, samples: &[f32], sample_rate: u32) -> Result<()> {
    let header = wav::Header::new(wav::WAV_FORMAT_PCM, 1, sample_rate, 16);
    let data = wav::BitDepth::Sixteen(f32_to_pcm16(samples));
    let mut file =
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    wav::write(header, &data, &mut file)?;
    Ok(())
}

/// A WAV file standing in for the microphone.
///
/// Connecting fails if the file's sample rate doesn't match what the relay expects.
struct WavMicrophone {
    name: String,
    file_rate: u32,
    expected_rate: u32,
    connected: bool,
}

impl WavMicrophone {
    fn new(path: &Path, file_rate: u32, expected_rate: u32) -> Self {
        Self {
            name: path.display().to_string(),
            file_rate,
            expected_rate,
            connected: false,
        }
    }
}

impl CaptureDevice for WavMicrophone {
    fn connect(&mut self) -> AppResult<()> {
        if self.file_rate != self.expected_rate {
            return Err(AppError::CaptureDevice(format!(
                "{} is {} Hz, the relay expects {} Hz",
                self.name, self.file_rate, self.expected_rate
            )));
        }
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.connected {
            debug!("Microphone {} disconnected", self.name);
        }
        self.connected = false;
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Playback device that records into memory, taking as long as real playback would.
struct WavRecorder {
    samples: Arc<Mutex<Vec<f32>>>,
    realtime: bool,
}

impl WavRecorder {
    fn new(realtime: bool) -> Self {
        Self {
            samples: Arc::new(Mutex::new(Vec::new())),
            realtime,
        }
    }

    fn samples(&self) -> Arc<Mutex<Vec<f32>>> {
        self.samples.clone()
    }
}

impl PlaybackDevice for WavRecorder {
    fn is_available(&self) -> bool {
        true
    }

    fn play(&mut self, segment: AudioSegment, completion: PlaybackCompletion) -> AppResult<()> {
        let duration = segment.duration();
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(&segment.samples);

        let realtime = self.realtime;
        tokio::spawn(async move {
            if realtime {
                tokio::time::sleep(duration).await;
            }
            completion.finish();
        });
        Ok(())
    }
}
