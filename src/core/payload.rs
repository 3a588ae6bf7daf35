//! Test input preparation
//!
//! Turns a test case's source file into the raw bytes the device expects:
//! 8-bit grayscale pixels at the model's input geometry, PCM frames, or raw
//! tensor bytes.

use super::upload::DataKind;
use crate::config::TestCase;
use image::imageops::FilterType;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// QQVGA input geometry (width, height)
pub const QQVGA_SIZE: (u32, u32) = (160, 120);

/// Default square input geometry (width, height)
pub const SQUARE_96_SIZE: (u32, u32) = (96, 96);

/// Payload preparation errors
#[derive(Error, Debug)]
pub enum PayloadError {
    /// File could not be read
    #[error("Failed to read <{path}> ({source})")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// Image decoding failed
    #[error("Failed to open image <{path}> ({source})")]
    Image {
        /// File path
        path: PathBuf,
        /// Underlying error
        source: image::ImageError,
    },

    /// WAV container problem
    #[error("Failed to open wave audio <{path}> ({reason})")]
    Wave {
        /// File path
        path: PathBuf,
        /// What was wrong
        reason: String,
    },

    /// Raw tensor size problem
    #[error("Invalid raw data <{path}> ({reason})")]
    Raw {
        /// File path
        path: PathBuf,
        /// What was wrong
        reason: String,
    },
}

/// Resolves a test case to the bytes uploaded to the device
pub trait PayloadResolver: Send + Sync {
    /// Produce the payload for `case`
    fn resolve(&self, case: &TestCase) -> Result<Vec<u8>, PayloadError>;
}

/// Loads payloads from files, relative paths being joined to a base directory
#[derive(Debug, Clone, Default)]
pub struct FilePayloadResolver {
    base_dir: Option<PathBuf>,
}

impl FilePayloadResolver {
    /// Resolve paths relative to the working directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve relative paths against `base_dir`
    #[must_use]
    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(base_dir.into());
        self
    }

    fn full_path(&self, source: &Path) -> PathBuf {
        match &self.base_dir {
            Some(base) if source.is_relative() => base.join(source),
            _ => source.to_path_buf(),
        }
    }
}

impl PayloadResolver for FilePayloadResolver {
    fn resolve(&self, case: &TestCase) -> Result<Vec<u8>, PayloadError> {
        let path = self.full_path(&case.source);
        match case.data_kind {
            DataKind::Image => {
                let size = if case.qqvga { QQVGA_SIZE } else { SQUARE_96_SIZE };
                load_image_grayscale(&path, size)
            }
            DataKind::Audio => load_wave_pcm(&path),
            DataKind::RawInt8 => read_file(&path),
            DataKind::RawFloat => {
                let data = read_file(&path)?;
                if data.len() % 4 != 0 {
                    return Err(PayloadError::Raw {
                        path,
                        reason: format!("{} bytes is not a whole number of float32 values", data.len()),
                    });
                }
                Ok(data)
            }
        }
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, PayloadError> {
    std::fs::read(path).map_err(|source| PayloadError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Decode an image, convert to 8-bit luma and resize to `(width, height)`
pub fn load_image_grayscale(path: &Path, (width, height): (u32, u32)) -> Result<Vec<u8>, PayloadError> {
    let img = image::open(path).map_err(|source| PayloadError::Image {
        path: path.to_path_buf(),
        source,
    })?;

    let mut luma = img.into_luma8();
    if luma.dimensions() != (width, height) {
        tracing::debug!(
            "Resizing {} from {:?} to {}x{}",
            path.display(),
            luma.dimensions(),
            width,
            height
        );
        luma = image::imageops::resize(&luma, width, height, FilterType::CatmullRom);
    }
    Ok(luma.into_raw())
}

const WAVE_FORMAT_PCM: u16 = 1;
const WAVE_FORMAT_EXTENSIBLE: u16 = 0xFFFE;

/// Read a RIFF/WAVE file and return the PCM frames of its `data` chunk
pub fn load_wave_pcm(path: &Path) -> Result<Vec<u8>, PayloadError> {
    let bytes = read_file(path)?;
    parse_wave_pcm(&bytes).map_err(|reason| PayloadError::Wave {
        path: path.to_path_buf(),
        reason,
    })
}

fn parse_wave_pcm(bytes: &[u8]) -> Result<Vec<u8>, String> {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return Err("not a RIFF/WAVE file".to_string());
    }

    let mut offset = 12;
    let mut format = None;
    while offset + 8 <= bytes.len() {
        let id = &bytes[offset..offset + 4];
        let size = u32::from_le_bytes([
            bytes[offset + 4],
            bytes[offset + 5],
            bytes[offset + 6],
            bytes[offset + 7],
        ]) as usize;
        let body_start = offset + 8;
        let body_end = body_start
            .checked_add(size)
            .filter(|&end| end <= bytes.len())
            .ok_or_else(|| format!("chunk {:?} overruns file", String::from_utf8_lossy(id)))?;
        let body = &bytes[body_start..body_end];

        match id {
            b"fmt " => {
                if body.len() < 2 {
                    return Err("fmt chunk too short".to_string());
                }
                format = Some(u16::from_le_bytes([body[0], body[1]]));
            }
            b"data" => {
                return match format {
                    Some(WAVE_FORMAT_PCM | WAVE_FORMAT_EXTENSIBLE) => Ok(body.to_vec()),
                    Some(other) => Err(format!("unsupported format tag {other}")),
                    None => Err("data chunk before fmt chunk".to_string()),
                };
            }
            _ => {}
        }

        // Chunks are word aligned
        offset = body_end + (size & 1);
    }
    Err("no data chunk".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::expr::Expression;
    use image::{GrayImage, Luma};
    use tempfile::tempdir;

    fn wave_bytes(samples: &[i16]) -> Vec<u8> {
        let data: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(4 + 8 + 16 + 8 + 4 + 8 + data.len() as u32).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes()); // PCM
        out.extend_from_slice(&1u16.to_le_bytes()); // mono
        out.extend_from_slice(&16_000u32.to_le_bytes());
        out.extend_from_slice(&32_000u32.to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        // Odd-sized chunk to check padding
        out.extend_from_slice(b"LIST");
        out.extend_from_slice(&3u32.to_le_bytes());
        out.extend_from_slice(b"abc\0");
        out.extend_from_slice(b"data");
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(&data);
        out
    }

    fn case(kind: DataKind, source: &Path, qqvga: bool) -> TestCase {
        TestCase {
            label: "x".to_string(),
            data_kind: kind,
            source: source.to_path_buf(),
            response_pattern: ".*".to_string(),
            expression: Expression::always(),
            qqvga,
        }
    }

    #[test]
    fn test_wave_data_chunk() {
        let pcm = parse_wave_pcm(&wave_bytes(&[1, -1, 300])).unwrap();
        assert_eq!(pcm, vec![1, 0, 0xFF, 0xFF, 0x2C, 0x01]);
    }

    #[test]
    fn test_wave_rejects_garbage() {
        assert!(parse_wave_pcm(b"RIFF\0\0\0\0WAVX").is_err());
        let mut truncated = wave_bytes(&[1, 2, 3]);
        truncated.truncate(truncated.len() - 2);
        assert!(parse_wave_pcm(&truncated).unwrap_err().contains("overruns"));
    }

    #[test]
    fn test_image_resized_to_geometry() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("digit.png");
        GrayImage::from_pixel(32, 32, Luma([200u8])).save(&path).unwrap();

        let resolver = FilePayloadResolver::new();
        let square = resolver.resolve(&case(DataKind::Image, &path, false)).unwrap();
        assert_eq!(square.len(), 96 * 96);
        assert!(square.iter().all(|&p| p == 200));

        let qqvga = resolver.resolve(&case(DataKind::Image, &path, true)).unwrap();
        assert_eq!(qqvga.len(), 160 * 120);
    }

    #[test]
    fn test_relative_paths_and_raw_kinds() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("t.bin"), [1u8, 2, 3, 4, 5, 6]).unwrap();
        let resolver = FilePayloadResolver::new().with_base_dir(dir.path());

        let raw = resolver.resolve(&case(DataKind::RawInt8, Path::new("t.bin"), false)).unwrap();
        assert_eq!(raw, vec![1, 2, 3, 4, 5, 6]);

        let err = resolver
            .resolve(&case(DataKind::RawFloat, Path::new("t.bin"), false))
            .unwrap_err();
        assert!(matches!(err, PayloadError::Raw { .. }));

        let missing = resolver
            .resolve(&case(DataKind::Audio, Path::new("missing.wav"), false))
            .unwrap_err();
        assert!(matches!(missing, PayloadError::Io { .. }));
    }
}
