//! PCM16 <-> WAV container conversion for realtime audio.
//!
//! The realtime model speaks raw PCM16 little-endian (24kHz mono). Playback
//! sinks and the `talk` CLI want a self-contained container, so every drained
//! batch of audio deltas is wrapped in a canonical 44-byte RIFF/WAVE header.

use base64::Engine;
use std::io::Cursor;

/// Realtime audio: PCM16, 24kHz, mono (both directions).
pub const SAMPLE_RATE: u32 = 24_000;

/// Mono.
pub const CHANNELS: u16 = 1;

/// Bytes per PCM16 sample.
pub const BYTES_PER_SAMPLE: u16 = 2;

/// Size of the canonical RIFF/WAVE header written by [`encode_container`].
pub const HEADER_LEN: usize = 44;

/// WAVE format tag for uncompressed integer PCM.
const FORMAT_PCM: u16 = 1;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("container too short: {0} bytes")]
    Truncated(usize),
    #[error("missing RIFF/WAVE signature")]
    NotRiffWave,
    #[error("unsupported format tag {0} (only PCM is supported)")]
    UnsupportedFormat(u16),
    #[error("unsupported bit depth {0} (only 16-bit is supported)")]
    UnsupportedBitDepth(u16),
    #[error("missing `{0}` chunk")]
    MissingChunk(&'static str),
    #[error("invalid base64 audio: {0}")]
    Base64(String),
    #[error("invalid WAV file: {0}")]
    Wav(String),
}

/// Audio extracted from a container by [`decode_container`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedAudio {
    pub sample_rate: u32,
    pub channels: u16,
    pub pcm: Vec<u8>,
}

impl DecodedAudio {
    /// Playback length of the decoded payload.
    pub fn duration_ms(&self) -> u64 {
        duration_ms(self.pcm.len(), self.sample_rate, self.channels)
    }
}

/// Wrap raw PCM16 bytes in a 44-byte RIFF/WAVE header.
///
/// Pure and deterministic. An empty payload still yields a valid header.
pub fn encode_container(pcm: &[u8], sample_rate: u32, channels: u16) -> Vec<u8> {
    let data_len = u32::try_from(pcm.len()).unwrap_or(u32::MAX - 36);
    let block_align = channels * BYTES_PER_SAMPLE;
    let byte_rate = sample_rate * u32::from(block_align);

    let mut out = Vec::with_capacity(HEADER_LEN + pcm.len());
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");

    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&FORMAT_PCM.to_le_bytes());
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&(BYTES_PER_SAMPLE * 8).to_le_bytes());

    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    out.extend_from_slice(pcm);
    out
}

/// Parse a RIFF/WAVE container back into its PCM16 payload.
///
/// Unknown chunks (`LIST`, `fact`, ...) between `fmt ` and `data` are skipped.
pub fn decode_container(bytes: &[u8]) -> Result<DecodedAudio, CodecError> {
    if bytes.len() < 12 {
        return Err(CodecError::Truncated(bytes.len()));
    }
    if &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return Err(CodecError::NotRiffWave);
    }

    let mut format: Option<(u32, u16)> = None;
    let mut offset = 12;

    while offset + 8 <= bytes.len() {
        let id = &bytes[offset..offset + 4];
        let size = read_u32(bytes, offset + 4) as usize;
        let body_start = offset + 8;
        let body_end = body_start.saturating_add(size).min(bytes.len());

        match id {
            b"fmt " => {
                if body_end - body_start < 16 {
                    return Err(CodecError::Truncated(bytes.len()));
                }
                let tag = read_u16(bytes, body_start);
                if tag != FORMAT_PCM {
                    return Err(CodecError::UnsupportedFormat(tag));
                }
                let channels = read_u16(bytes, body_start + 2);
                let sample_rate = read_u32(bytes, body_start + 4);
                let bits = read_u16(bytes, body_start + 14);
                if bits != BYTES_PER_SAMPLE * 8 {
                    return Err(CodecError::UnsupportedBitDepth(bits));
                }
                format = Some((sample_rate, channels));
            }
            b"data" => {
                let (sample_rate, channels) = format.ok_or(CodecError::MissingChunk("fmt "))?;
                return Ok(DecodedAudio {
                    sample_rate,
                    channels,
                    pcm: bytes[body_start..body_end].to_vec(),
                });
            }
            _ => {}
        }

        // Chunks are word aligned.
        offset = body_start + size + (size & 1);
    }

    Err(CodecError::MissingChunk("data"))
}

/// Read a WAV file's PCM16 payload with `hound`.
///
/// Unlike [`decode_container`] this accepts any layout a recorder may
/// produce, including `WAVE_FORMAT_EXTENSIBLE` headers.
pub fn read_wav(bytes: &[u8]) -> Result<DecodedAudio, CodecError> {
    let reader = hound::WavReader::new(Cursor::new(bytes)).map_err(|e| CodecError::Wav(e.to_string()))?;
    let spec = reader.spec();
    if spec.sample_format != hound::SampleFormat::Int {
        return Err(CodecError::UnsupportedFormat(3));
    }
    if spec.bits_per_sample != BYTES_PER_SAMPLE * 8 {
        return Err(CodecError::UnsupportedBitDepth(spec.bits_per_sample));
    }

    let mut pcm = Vec::with_capacity(reader.len() as usize * usize::from(BYTES_PER_SAMPLE));
    for sample in reader.into_samples::<i16>() {
        let sample = sample.map_err(|e| CodecError::Wav(e.to_string()))?;
        pcm.extend_from_slice(&sample.to_le_bytes());
    }

    Ok(DecodedAudio {
        sample_rate: spec.sample_rate,
        channels: spec.channels,
        pcm,
    })
}

/// Microphone input from a file: a WAV file, or raw PCM16 at the realtime
/// rate when there is no RIFF signature.
pub fn decode_input(bytes: Vec<u8>) -> Result<DecodedAudio, CodecError> {
    if bytes.starts_with(b"RIFF") {
        return read_wav(&bytes);
    }
    Ok(DecodedAudio {
        sample_rate: SAMPLE_RATE,
        channels: CHANNELS,
        pcm: bytes,
    })
}

/// Estimated playback length of a PCM16 payload.
///
/// Only used to schedule the next queue drain, never to gate correctness.
pub fn duration_ms(pcm_len: usize, sample_rate: u32, channels: u16) -> u64 {
    let bytes_per_ms =
        u64::from(sample_rate) * u64::from(channels) * u64::from(BYTES_PER_SAMPLE) / 1000;
    if bytes_per_ms == 0 {
        return 0;
    }
    pcm_len as u64 / bytes_per_ms
}

/// Base64-encode PCM for an `input_audio_buffer.append` event.
pub fn encode_base64(pcm: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(pcm)
}

/// Decode the base64 `delta` of a `response.audio.delta` event.
pub fn decode_base64(data: &str) -> Result<Vec<u8>, CodecError> {
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| CodecError::Base64(e.to_string()))
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm_ramp(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn header_fields_match_payload() {
        let pcm = pcm_ramp(7200);
        let wav = encode_container(&pcm, SAMPLE_RATE, CHANNELS);

        assert_eq!(wav.len(), HEADER_LEN + 7200);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(read_u32(&wav, 4), 36 + 7200);
        assert_eq!(&wav[8..16], b"WAVEfmt ");
        assert_eq!(read_u16(&wav, 20), 1);
        assert_eq!(read_u16(&wav, 22), 1);
        assert_eq!(read_u32(&wav, 24), 24_000);
        assert_eq!(read_u32(&wav, 28), 48_000);
        assert_eq!(read_u16(&wav, 32), 2);
        assert_eq!(read_u16(&wav, 34), 16);
        assert_eq!(&wav[36..40], b"data");
        assert_eq!(read_u32(&wav, 40), 7200);
    }

    #[test]
    fn stereo_byte_rate_and_block_align() {
        let wav = encode_container(&[0u8; 8], 48_000, 2);
        assert_eq!(read_u32(&wav, 28), 48_000 * 2 * 2);
        assert_eq!(read_u16(&wav, 32), 4);
    }

    #[test]
    fn empty_payload_is_valid_container() {
        let wav = encode_container(&[], SAMPLE_RATE, CHANNELS);
        assert_eq!(wav.len(), HEADER_LEN);
        assert_eq!(read_u32(&wav, 4), 36);
        assert_eq!(read_u32(&wav, 40), 0);

        let decoded = decode_container(&wav).unwrap();
        assert!(decoded.pcm.is_empty());
    }

    #[test]
    fn decode_inverts_encode() {
        for len in [0usize, 2, 3200, 4801] {
            let pcm = pcm_ramp(len);
            let decoded = decode_container(&encode_container(&pcm, 16_000, 1)).unwrap();
            assert_eq!(decoded.pcm, pcm, "payload of {len} bytes");
            assert_eq!(decoded.sample_rate, 16_000);
            assert_eq!(decoded.channels, 1);
        }
    }

    #[test]
    fn decode_skips_unknown_chunks() {
        let pcm = pcm_ramp(10);
        let plain = encode_container(&pcm, SAMPLE_RATE, CHANNELS);

        // Splice a 3-byte LIST chunk (padded to 4) between fmt and data.
        let mut wav = plain[..36].to_vec();
        wav.extend_from_slice(b"LIST");
        wav.extend_from_slice(&3u32.to_le_bytes());
        wav.extend_from_slice(&[1, 2, 3, 0]);
        wav.extend_from_slice(&plain[36..]);

        assert_eq!(decode_container(&wav).unwrap().pcm, pcm);
    }

    #[test]
    fn decode_rejects_non_pcm_inputs() {
        assert_eq!(decode_container(b"RIFF"), Err(CodecError::Truncated(4)));
        assert_eq!(
            decode_container(b"RIFX\0\0\0\0WAVEjunk"),
            Err(CodecError::NotRiffWave)
        );

        let mut float_wav = encode_container(&[0u8; 4], SAMPLE_RATE, CHANNELS);
        float_wav[20] = 3;
        assert_eq!(
            decode_container(&float_wav),
            Err(CodecError::UnsupportedFormat(3))
        );

        let mut eight_bit = encode_container(&[0u8; 4], SAMPLE_RATE, CHANNELS);
        eight_bit[34] = 8;
        assert_eq!(
            decode_container(&eight_bit),
            Err(CodecError::UnsupportedBitDepth(8))
        );

        let header_only = &encode_container(&[], SAMPLE_RATE, CHANNELS)[..36];
        assert_eq!(
            decode_container(header_only),
            Err(CodecError::MissingChunk("data"))
        );
    }

    fn hound_wav(spec: hound::WavSpec, samples: &[i32]) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for &sample in samples {
            writer.write_sample(sample).unwrap();
        }
        writer.finalize().unwrap();
        cursor.into_inner()
    }

    #[test]
    fn read_wav_accepts_recorder_output_and_our_own_header() {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let audio = read_wav(&hound_wav(spec, &[1, -2, 300])).unwrap();
        assert_eq!(audio.sample_rate, SAMPLE_RATE);
        assert_eq!(audio.channels, 1);
        assert_eq!(audio.pcm, vec![1, 0, 0xfe, 0xff, 0x2c, 0x01]);

        let ours = encode_container(&[5, 0, 6, 0], SAMPLE_RATE, CHANNELS);
        assert_eq!(read_wav(&ours).unwrap().pcm, vec![5, 0, 6, 0]);
    }

    #[test]
    fn read_wav_rejects_other_sample_formats() {
        let deep = hound::WavSpec {
            channels: 1,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 24,
            sample_format: hound::SampleFormat::Int,
        };
        assert_eq!(
            read_wav(&hound_wav(deep, &[1, 2])),
            Err(CodecError::UnsupportedBitDepth(24))
        );
        assert!(matches!(read_wav(b"RIFF\x04\0\0\0WAVE"), Err(CodecError::Wav(_))));
    }

    #[test]
    fn decode_input_takes_raw_pcm_or_wav() {
        let raw = decode_input(vec![9, 0, 9, 0]).unwrap();
        assert_eq!(raw.sample_rate, SAMPLE_RATE);
        assert_eq!(raw.pcm, vec![9, 0, 9, 0]);

        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 16_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let wav = decode_input(hound_wav(spec, &[1, 1, 2, 2])).unwrap();
        assert_eq!((wav.sample_rate, wav.channels), (16_000, 2));
        assert_eq!(wav.duration_ms(), 0);
        assert_eq!(wav.pcm.len(), 8);

        assert!(decode_input(b"RIFF junk".to_vec()).is_err());
    }

    #[test]
    fn duration_estimate_for_24khz_mono() {
        assert_eq!(duration_ms(4800, SAMPLE_RATE, CHANNELS), 100);
        assert_eq!(duration_ms(7200, SAMPLE_RATE, CHANNELS), 150);
        assert_eq!(duration_ms(0, SAMPLE_RATE, CHANNELS), 0);
        assert_eq!(duration_ms(100, 0, 1), 0);
    }

    #[test]
    fn base64_roundtrip_and_error() {
        let pcm = [10u8, 20, 30];
        assert_eq!(decode_base64(&encode_base64(&pcm)).unwrap(), pcm);
        assert!(matches!(decode_base64("!!not-b64"), Err(CodecError::Base64(_))));
    }
}
