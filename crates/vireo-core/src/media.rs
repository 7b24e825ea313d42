//! Container probing and frame decoding
//!
//! Two containers are decoded natively:
//! - RIFF/WAVE with PCM u8, PCM s16le or IEEE float32 samples
//! - YUV4MPEG2 with 4:2:0 planes
//!
//! Other well-known containers are recognised by their magic bytes and
//! rejected as unsupported.

use crate::{
    types::{AudioFrame, SampleFormat, StreamInfo, StreamKind, VideoFrame},
    Error, Result,
};
use bytes::Bytes;

const Y4M_MAGIC: &[u8] = b"YUV4MPEG2 ";
const Y4M_FRAME: &[u8] = b"FRAME\n";
/// Largest accepted YUV4MPEG2 frame, a little above 8K UHD 4:2:0
const MAX_Y4M_FRAME_BYTES: u64 = 64 * 1024 * 1024;

/// Layout of a probed WAV file
#[derive(Debug, Clone)]
pub struct WavLayout {
    pub format: SampleFormat,
    pub channels: u16,
    pub sample_rate: u32,
    pub block_align: u16,
    pub data_offset: u64,
    /// Payload length, unknown for live streams
    pub data_len: Option<u64>,
    fmt_chunk: Bytes,
}

/// Layout of a probed YUV4MPEG2 file
#[derive(Debug, Clone)]
pub struct Y4mLayout {
    pub width: u32,
    pub height: u32,
    pub fps_num: u32,
    pub fps_den: u32,
    pub data_offset: u64,
    pub data_len: Option<u64>,
    header: Bytes,
}

impl Y4mLayout {
    // parse_y4m bounds the frame size, so these products fit
    fn chroma_len(&self) -> usize {
        self.width.div_ceil(2) as usize * self.height.div_ceil(2) as usize
    }

    fn luma_len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Bytes per frame including the FRAME marker
    pub fn frame_len(&self) -> usize {
        Y4M_FRAME.len() + self.luma_len() + 2 * self.chroma_len()
    }

    fn frame_duration_ms(&self) -> f64 {
        1000.0 * self.fps_den as f64 / self.fps_num as f64
    }
}

/// A decoded delivery unit
#[derive(Debug, Clone)]
pub enum Decoded {
    Audio(AudioFrame),
    Video(VideoFrame),
}

/// Probed container layout
#[derive(Debug, Clone)]
pub enum MediaLayout {
    Wav(WavLayout),
    Y4m(Y4mLayout),
}

impl MediaLayout {
    /// Identify the container from its first bytes
    pub fn probe(head: &[u8], total_len: Option<u64>) -> Result<Self> {
        if head.len() >= 12 && &head[0..4] == b"RIFF" && &head[8..12] == b"WAVE" {
            return parse_wav(head, total_len).map(MediaLayout::Wav);
        }
        if head.starts_with(Y4M_MAGIC) {
            return parse_y4m(head, total_len).map(MediaLayout::Y4m);
        }
        Err(Error::UnsupportedFormat(
            sniff_unsupported(head).unwrap_or("unknown").to_string(),
        ))
    }

    /// Stream table of the container
    pub fn streams(&self) -> Vec<StreamInfo> {
        let duration_ms = self.duration_ms();
        match self {
            MediaLayout::Wav(wav) => vec![StreamInfo {
                index: 0,
                kind: StreamKind::Audio,
                codec_name: match wav.format {
                    SampleFormat::U8 => "pcm_u8",
                    SampleFormat::S16 => "pcm_s16le",
                    SampleFormat::F32 => "pcm_f32le",
                }
                .to_string(),
                codec_params: wav.fmt_chunk.clone(),
                language: None,
                duration_ms,
            }],
            MediaLayout::Y4m(y4m) => vec![StreamInfo {
                index: 0,
                kind: StreamKind::Video,
                codec_name: "rawvideo".to_string(),
                codec_params: y4m.header.clone(),
                language: None,
                duration_ms,
            }],
        }
    }

    /// Whether `other` decodes to frames of the same shape
    pub fn is_compatible_with(&self, other: &MediaLayout) -> bool {
        match (self, other) {
            (MediaLayout::Wav(a), MediaLayout::Wav(b)) => {
                a.channels == b.channels && a.sample_rate == b.sample_rate
            }
            (MediaLayout::Y4m(a), MediaLayout::Y4m(b)) => {
                a.width == b.width && a.height == b.height
            }
            _ => false,
        }
    }

    /// Live sources have no known end
    pub fn is_live(&self) -> bool {
        self.data_end().is_none()
    }

    pub fn data_offset(&self) -> u64 {
        match self {
            MediaLayout::Wav(wav) => wav.data_offset,
            MediaLayout::Y4m(y4m) => y4m.data_offset,
        }
    }

    /// First byte past the payload, if bounded
    pub fn data_end(&self) -> Option<u64> {
        match self {
            MediaLayout::Wav(wav) => wav.data_len.map(|len| wav.data_offset + len),
            MediaLayout::Y4m(y4m) => y4m.data_len.map(|len| y4m.data_offset + len),
        }
    }

    /// Total duration; `None` for live (unbounded) sources
    pub fn duration_ms(&self) -> Option<i64> {
        match self {
            MediaLayout::Wav(wav) => wav.data_len.map(|len| {
                let samples = len / wav.block_align as u64;
                (samples.saturating_mul(1000) / wav.sample_rate as u64).min(i64::MAX as u64) as i64
            }),
            MediaLayout::Y4m(y4m) => y4m.data_len.map(|len| {
                let frames = len / y4m.frame_len() as u64;
                (frames as f64 * y4m.frame_duration_ms()) as i64
            }),
        }
    }

    /// Bytes making up one delivery unit
    pub fn unit_len(&self, audio_frame_ms: u32) -> usize {
        match self {
            MediaLayout::Wav(wav) => {
                let samples = (wav.sample_rate as u64 * audio_frame_ms as u64 / 1000).max(1);
                samples as usize * wav.block_align as usize
            }
            MediaLayout::Y4m(y4m) => y4m.frame_len(),
        }
    }

    /// Playback time covered by `len` payload bytes
    pub fn unit_duration_ms(&self, len: usize) -> f64 {
        match self {
            MediaLayout::Wav(wav) => {
                let samples = len / wav.block_align as usize;
                samples as f64 * 1000.0 / wav.sample_rate as f64
            }
            MediaLayout::Y4m(y4m) => {
                (len / y4m.frame_len()) as f64 * y4m.frame_duration_ms()
            }
        }
    }

    /// Byte offset of the unit containing `position_ms`
    pub fn offset_for_position(&self, position_ms: i64) -> u64 {
        let position_ms = position_ms.max(0) as u64;
        let offset = match self {
            MediaLayout::Wav(wav) => {
                let samples = position_ms.saturating_mul(wav.sample_rate as u64) / 1000;
                wav.data_offset
                    .saturating_add(samples.saturating_mul(wav.block_align as u64))
            }
            MediaLayout::Y4m(y4m) => {
                let frame = position_ms.saturating_mul(y4m.fps_num as u64) / (1000 * y4m.fps_den as u64);
                y4m.data_offset
                    .saturating_add(frame.saturating_mul(y4m.frame_len() as u64))
            }
        };
        match self.data_end() {
            Some(end) => offset.min(end),
            None => offset,
        }
    }

    /// Presentation time of the unit starting at `offset`
    pub fn position_for_offset(&self, offset: u64) -> f64 {
        let payload = offset.saturating_sub(self.data_offset());
        self.unit_duration_ms(payload as usize)
    }

    /// Decode one unit; `None` when the bytes are a truncated trailing unit
    pub fn decode(&self, unit: &[u8], pts_ms: i64) -> Result<Option<Decoded>> {
        match self {
            MediaLayout::Wav(wav) => {
                let whole = unit.len() - unit.len() % wav.block_align as usize;
                if whole == 0 {
                    return Ok(None);
                }
                Ok(Some(Decoded::Audio(AudioFrame {
                    pts_ms,
                    sample_rate: wav.sample_rate,
                    channels: wav.channels,
                    samples: decode_pcm(wav.format, &unit[..whole]),
                })))
            }
            MediaLayout::Y4m(y4m) => {
                if unit.len() < y4m.frame_len() {
                    return Ok(None);
                }
                if !unit.starts_with(Y4M_FRAME) {
                    return Err(Error::UnsupportedFormat(
                        "YUV4MPEG2 frame parameters".to_string(),
                    ));
                }
                let data = Bytes::copy_from_slice(&unit[Y4M_FRAME.len()..y4m.frame_len()]);
                let luma = y4m.luma_len();
                let chroma = y4m.chroma_len();
                Ok(Some(Decoded::Video(VideoFrame {
                    pts_ms,
                    width: y4m.width,
                    height: y4m.height,
                    y: data.slice(0..luma),
                    u: data.slice(luma..luma + chroma),
                    v: data.slice(luma + chroma..luma + 2 * chroma),
                })))
            }
        }
    }
}

fn decode_pcm(format: SampleFormat, bytes: &[u8]) -> Vec<f32> {
    match format {
        SampleFormat::U8 => bytes.iter().map(|&b| (b as f32 - 128.0) / 128.0).collect(),
        SampleFormat::S16 => bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / 32768.0)
            .collect(),
        SampleFormat::F32 => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    }
}

fn le_u16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

fn le_u32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn parse_wav(head: &[u8], total_len: Option<u64>) -> Result<WavLayout> {
    let truncated = || Error::UnsupportedFormat("truncated WAV header".to_string());

    let mut fmt: Option<(SampleFormat, u16, u32, u16, Bytes)> = None;
    let mut pos = 12usize;

    while pos + 8 <= head.len() {
        let id = &head[pos..pos + 4];
        let size = le_u32(head, pos + 4);
        let body = pos + 8;

        if id == b"fmt " {
            if body + 16 > head.len() {
                return Err(truncated());
            }
            let mut tag = le_u16(head, body);
            let channels = le_u16(head, body + 2);
            let sample_rate = le_u32(head, body + 4);
            let block_align = le_u16(head, body + 12);
            let bits = le_u16(head, body + 14);
            // WAVE_FORMAT_EXTENSIBLE carries the real tag in its sub-format GUID
            if tag == 0xFFFE && body + 26 <= head.len() {
                tag = le_u16(head, body + 24);
            }
            let format = match (tag, bits) {
                (1, 8) => SampleFormat::U8,
                (1, 16) => SampleFormat::S16,
                (3, 32) => SampleFormat::F32,
                _ => {
                    return Err(Error::UnsupportedFormat(format!(
                        "WAV format tag {} with {} bits",
                        tag, bits
                    )))
                }
            };
            if channels == 0 || sample_rate == 0 {
                return Err(Error::UnsupportedFormat("WAV without channels".to_string()));
            }
            if block_align as usize != channels as usize * format.bytes_per_sample() {
                return Err(Error::UnsupportedFormat("inconsistent WAV block align".to_string()));
            }
            let end = (body + size as usize).min(head.len());
            let chunk = Bytes::copy_from_slice(&head[body..end]);
            fmt = Some((format, channels, sample_rate, block_align, chunk));
        } else if id == b"data" {
            let (format, channels, sample_rate, block_align, fmt_chunk) =
                fmt.ok_or_else(|| Error::UnsupportedFormat("WAV data before fmt".to_string()))?;
            let data_offset = body as u64;
            // 0 and u32::MAX are used by streaming writers for "unknown length"
            let declared = match size {
                0 | u32::MAX => None,
                n => Some(n as u64),
            };
            let available = total_len.map(|t| t.saturating_sub(data_offset));
            let data_len = match (declared, available) {
                (Some(d), Some(a)) => Some(d.min(a)),
                (Some(d), None) => Some(d),
                (None, a) => a,
            };
            return Ok(WavLayout {
                format,
                channels,
                sample_rate,
                block_align,
                data_offset,
                data_len,
                fmt_chunk,
            });
        }

        // Chunks are word aligned
        pos = body + size as usize + (size as usize & 1);
    }

    Err(truncated())
}

fn parse_y4m(head: &[u8], total_len: Option<u64>) -> Result<Y4mLayout> {
    let end = head
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| Error::UnsupportedFormat("truncated YUV4MPEG2 header".to_string()))?;
    let line = std::str::from_utf8(&head[..end])
        .map_err(|_| Error::UnsupportedFormat("YUV4MPEG2 header is not ASCII".to_string()))?;

    let (mut width, mut height) = (0u32, 0u32);
    let (mut fps_num, mut fps_den) = (25u32, 1u32);

    for token in line.split_whitespace().skip(1) {
        let mut chars = token.chars();
        let tag = chars.next();
        let value = chars.as_str();
        match tag {
            Some('W') => width = value.parse().unwrap_or(0),
            Some('H') => height = value.parse().unwrap_or(0),
            Some('F') => {
                if let Some((n, d)) = value.split_once(':') {
                    fps_num = n.parse().unwrap_or(0);
                    fps_den = d.parse().unwrap_or(0);
                }
            }
            Some('C') if !value.starts_with("420") => {
                return Err(Error::UnsupportedFormat(format!("YUV4MPEG2 colour space {}", value)));
            }
            _ => {}
        }
    }

    if width == 0 || height == 0 || fps_num == 0 || fps_den == 0 {
        return Err(Error::UnsupportedFormat("incomplete YUV4MPEG2 header".to_string()));
    }
    let chroma = width.div_ceil(2) as u64 * height.div_ceil(2) as u64;
    let frame_bytes = (width as u64 * height as u64).saturating_add(chroma.saturating_mul(2));
    if frame_bytes > MAX_Y4M_FRAME_BYTES {
        return Err(Error::UnsupportedFormat(format!(
            "YUV4MPEG2 frame of {}x{} is too large",
            width, height
        )));
    }

    let data_offset = end as u64 + 1;
    Ok(Y4mLayout {
        width,
        height,
        fps_num,
        fps_den,
        data_offset,
        data_len: total_len.map(|t| t.saturating_sub(data_offset)),
        header: Bytes::copy_from_slice(&head[..end]),
    })
}

/// Name of a recognised but undecodable container
fn sniff_unsupported(head: &[u8]) -> Option<&'static str> {
    if head.len() >= 8 && &head[4..8] == b"ftyp" {
        Some("mp4")
    } else if head.starts_with(b"ID3") || (head.len() >= 2 && head[0] == 0xFF && head[1] & 0xE0 == 0xE0) {
        Some("mp3")
    } else if head.starts_with(b"OggS") {
        Some("ogg")
    } else if head.starts_with(b"fLaC") {
        Some("flac")
    } else if head.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        Some("matroska")
    } else if head.first() == Some(&0x47) && head.get(188) == Some(&0x47) {
        Some("mpegts")
    } else if head.starts_with(b"#EXTM3U") {
        Some("hls")
    } else {
        None
    }
}

/// Encode interleaved 16-bit PCM as a WAV file
pub fn encode_wav_pcm16(sample_rate: u32, channels: u16, samples: &[i16]) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;
    let block_align = channels * 2;
    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&(sample_rate * block_align as u32).to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}
