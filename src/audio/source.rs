use std::collections::VecDeque;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use super::{AudioError, AudioFormat};

/// Pull-based audio collaborator.
///
/// `read` must return promptly. Zero bytes from a source that is not closed
/// means no data is ready yet; zero bytes once `is_closed` is true is the end
/// of the audio.
pub trait AudioSource: Send {
    fn format(&self) -> AudioFormat;

    fn read(&mut self, buffer: &mut [u8]) -> Result<usize, AudioError>;

    fn is_closed(&self) -> bool;

    fn close(&mut self);
}

#[derive(Default)]
struct PushState {
    buffer: VecDeque<u8>,
    closed: bool,
}

/// Caller-fed audio source
pub struct PushAudioStream {
    format: AudioFormat,
    state: Arc<Mutex<PushState>>,
}

/// Writing half of a [`PushAudioStream`]
#[derive(Clone)]
pub struct PushAudioWriter {
    state: Arc<Mutex<PushState>>,
}

impl PushAudioStream {
    pub fn new(format: AudioFormat) -> (PushAudioWriter, PushAudioStream) {
        let state = Arc::new(Mutex::new(PushState::default()));
        (
            PushAudioWriter {
                state: state.clone(),
            },
            PushAudioStream { format, state },
        )
    }
}

impl PushAudioWriter {
    /// Append audio. Ignored once the stream is closed.
    pub fn write(&self, data: &[u8]) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            log::debug!("🔇 Write of {} bytes after close ignored", data.len());
            return;
        }
        state.buffer.extend(data);
    }

    pub fn close(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed = true;
    }
}

impl AudioSource for PushAudioStream {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn read(&mut self, buffer: &mut [u8]) -> Result<usize, AudioError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let count = buffer.len().min(state.buffer.len());
        for (slot, byte) in buffer.iter_mut().zip(state.buffer.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }

    fn is_closed(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.closed && state.buffer.is_empty()
    }

    fn close(&mut self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed = true;
    }
}

/// 16-bit PCM WAV file replayed as fast as it is read
pub struct WavFileSource {
    reader: hound::WavReader<BufReader<File>>,
    format: AudioFormat,
    closed: bool,
}

impl WavFileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AudioError> {
        let reader = hound::WavReader::open(path.as_ref())?;
        let spec = reader.spec();

        if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
            return Err(AudioError::UnsupportedFormat(format!(
                "{:?} {}-bit, expected 16-bit integer PCM",
                spec.sample_format, spec.bits_per_sample
            )));
        }

        log::info!(
            "📂 Opened {} ({} Hz, {} ch, {} samples)",
            path.as_ref().display(),
            spec.sample_rate,
            spec.channels,
            reader.len()
        );

        Ok(Self {
            format: AudioFormat {
                sample_rate: spec.sample_rate,
                bits_per_sample: spec.bits_per_sample,
                channels: spec.channels,
            },
            reader,
            closed: false,
        })
    }
}

impl AudioSource for WavFileSource {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn read(&mut self, buffer: &mut [u8]) -> Result<usize, AudioError> {
        if self.closed {
            return Ok(0);
        }

        let mut written = 0;
        let mut samples = self.reader.samples::<i16>();
        while written + 2 <= buffer.len() {
            match samples.next() {
                Some(sample) => {
                    buffer[written..written + 2].copy_from_slice(&sample?.to_le_bytes());
                    written += 2;
                }
                None => {
                    self.closed = true;
                    break;
                }
            }
        }
        Ok(written)
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// All-zero audio, unbounded unless a length is given
pub struct SilenceSource {
    format: AudioFormat,
    remaining: Option<usize>,
    closed: bool,
}

impl SilenceSource {
    pub fn new(format: AudioFormat) -> Self {
        Self {
            format,
            remaining: None,
            closed: false,
        }
    }

    pub fn with_length(format: AudioFormat, bytes: usize) -> Self {
        Self {
            format,
            remaining: Some(bytes),
            closed: false,
        }
    }
}

impl AudioSource for SilenceSource {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn read(&mut self, buffer: &mut [u8]) -> Result<usize, AudioError> {
        if self.closed {
            return Ok(0);
        }
        let count = match self.remaining.as_mut() {
            Some(remaining) => {
                let count = buffer.len().min(*remaining);
                *remaining -= count;
                if *remaining == 0 {
                    self.closed = true;
                }
                count
            }
            None => buffer.len(),
        };
        buffer[..count].fill(0);
        Ok(count)
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
