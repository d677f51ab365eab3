pub mod chunker;
pub mod source;

pub use chunker::{AudioChunker, AudioData, AudioMessage, ChunkBuffer, Throttle, ThrottleClock};
pub use source::{AudioSource, PushAudioStream, PushAudioWriter, SilenceSource, WavFileSource};

use speech_protocol::messages::TICKS_PER_SECOND;
use std::time::Duration;
use thiserror::Error;

/// Size of the RIFF header that opens every turn's audio
pub const WAV_HEADER_LEN: usize = 44;

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),
}

/// PCM layout of an audio stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub channels: u16,
}

impl Default for AudioFormat {
    /// 16 kHz, 16-bit, mono
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            bits_per_sample: 16,
            channels: 1,
        }
    }
}

impl AudioFormat {
    pub fn block_align(&self) -> u16 {
        self.channels * self.bits_per_sample / 8
    }

    pub fn bytes_per_second(&self) -> u32 {
        self.sample_rate * self.block_align() as u32
    }

    /// Whole-frame byte count covering `duration`
    pub fn bytes_for(&self, duration: Duration) -> usize {
        let bytes = self.bytes_per_second() as u128 * duration.as_millis() / 1000;
        let align = self.block_align().max(1) as u128;
        ((bytes / align) * align).max(align) as usize
    }

    /// 100ns ticks represented by `bytes` of audio
    pub fn ticks_for_bytes(&self, bytes: u64) -> u64 {
        match self.bytes_per_second() {
            0 => 0,
            bps => (bytes as u128 * TICKS_PER_SECOND as u128 / bps as u128) as u64,
        }
    }

    /// Streaming RIFF/WAVE header with zero data length
    pub fn wav_header(&self) -> Vec<u8> {
        let mut header = Vec::with_capacity(WAV_HEADER_LEN);
        header.extend_from_slice(b"RIFF");
        header.extend_from_slice(&0u32.to_le_bytes());
        header.extend_from_slice(b"WAVE");
        header.extend_from_slice(b"fmt ");
        header.extend_from_slice(&16u32.to_le_bytes());
        header.extend_from_slice(&1u16.to_le_bytes()); // PCM
        header.extend_from_slice(&self.channels.to_le_bytes());
        header.extend_from_slice(&self.sample_rate.to_le_bytes());
        header.extend_from_slice(&self.bytes_per_second().to_le_bytes());
        header.extend_from_slice(&self.block_align().to_le_bytes());
        header.extend_from_slice(&self.bits_per_sample.to_le_bytes());
        header.extend_from_slice(b"data");
        header.extend_from_slice(&0u32.to_le_bytes());
        header
    }
}
