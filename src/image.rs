//! Pixel-format registry and image codecs.
//!
//! Raw camera payloads carry one of the LCM FourCC-style pixel-format
//! enumerants below. Decoders normalize everything to 8-bit BGR; encoders
//! consume 8-bit BGR. Lookups for formats without a codec fail with an
//! explicit unsupported-format error so callers can log and drop.

use std::fmt;
use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ExtendedColorType, ImageFormat, RgbImage};

use crate::errors::ProxyError;

/// Known pixel-format enumerants, numerically equal to the LCM constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum PixelFormat {
  Uyvy = 1498831189,
  Yuyv = 1448695129,
  Iyu1 = 827677001,
  Iyu2 = 844454217,
  Yuv420 = 842093913,
  Yuv411p = 1345401140,
  I420 = 808596553,
  Nv12 = 842094158,
  Gray = 1497715271,
  Rgb = 859981650,
  Bgr = 861030210,
  Rgba = 876758866,
  Bgra = 877807426,
  BayerBggr = 825770306,
  BayerGbrg = 844650584,
  BayerGrbg = 861427800,
  BayerRggb = 878205016,
  BeBayer16Bggr = 826360386,
  BeBayer16Gbrg = 843137602,
  BeBayer16Grbg = 859914818,
  BeBayer16Rggb = 876692034,
  LeBayer16Bggr = 826360396,
  LeBayer16Gbrg = 843137612,
  LeBayer16Grbg = 859914828,
  LeBayer16Rggb = 876692044,
  Mjpeg = 1196444237,
  BeGray16 = 357,
  LeGray16 = 909199180,
  BeRgb16 = 358,
  LeRgb16 = 1279412050,
  BeSignedGray16 = 359,
  BeSignedRgb16 = 360,
  FloatGray32 = 842221382,
  Invalid = -2,
  Any = -1,
}

impl fmt::Display for PixelFormat {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:?} ({})", self, *self as i32)
  }
}

impl TryFrom<i32> for PixelFormat {
  type Error = ProxyError;

  fn try_from(value: i32) -> Result<Self, Self::Error> {
    use PixelFormat::*;
    let format = match value {
      1498831189 => Uyvy,
      1448695129 => Yuyv,
      827677001 => Iyu1,
      844454217 => Iyu2,
      842093913 => Yuv420,
      1345401140 => Yuv411p,
      808596553 => I420,
      842094158 => Nv12,
      1497715271 => Gray,
      859981650 => Rgb,
      861030210 => Bgr,
      876758866 => Rgba,
      877807426 => Bgra,
      825770306 => BayerBggr,
      844650584 => BayerGbrg,
      861427800 => BayerGrbg,
      878205016 => BayerRggb,
      826360386 => BeBayer16Bggr,
      843137602 => BeBayer16Gbrg,
      859914818 => BeBayer16Grbg,
      876692034 => BeBayer16Rggb,
      826360396 => LeBayer16Bggr,
      843137612 => LeBayer16Gbrg,
      859914828 => LeBayer16Grbg,
      876692044 => LeBayer16Rggb,
      1196444237 => Mjpeg,
      357 => BeGray16,
      909199180 => LeGray16,
      358 => BeRgb16,
      1279412050 => LeRgb16,
      359 => BeSignedGray16,
      360 => BeSignedRgb16,
      842221382 => FloatGray32,
      -2 => Invalid,
      -1 => Any,
      other => return Err(ProxyError::UnknownPixelFormat(other)),
    };
    Ok(format)
  }
}

/// An 8-bit, 3-channel image in BGR order; `data.len() == width * height * 3`.
#[derive(Debug, Clone, PartialEq)]
pub struct BgrImage {
  pub width: u32,
  pub height: u32,
  pub data: Vec<u8>,
}

impl BgrImage {
  pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self, ProxyError> {
    let expected = width as usize * height as usize * 3;
    if data.len() != expected {
      return Err(ProxyError::ImageCodec(format!(
        "BGR buffer of {} bytes does not match {}x{}",
        data.len(),
        width,
        height
      )));
    }
    Ok(Self {
      width,
      height,
      data,
    })
  }
}

/// Decodes a raw pixel buffer into 8-bit BGR.
pub trait ImageDecoder: Send + Sync {
  fn decode(&self, data: &[u8]) -> Result<BgrImage, ProxyError>;
}

/// Encodes 8-bit BGR into a raw or compressed buffer.
pub trait ImageEncoder: Send + Sync {
  fn encode(&self, image: &BgrImage) -> Result<Vec<u8>, ProxyError>;
}

type DecoderCtor = fn(u32, u32) -> Box<dyn ImageDecoder>;
type EncoderCtor = fn(u32, u32) -> Box<dyn ImageEncoder>;

const DECODERS: &[(PixelFormat, DecoderCtor)] = &[
  (PixelFormat::Bgr, |w, h| Box::new(BgrDecoder { width: w, height: h })),
  (PixelFormat::Rgb, |w, h| Box::new(RgbDecoder { width: w, height: h })),
  (PixelFormat::Gray, |w, h| Box::new(GrayDecoder { width: w, height: h })),
  (PixelFormat::BayerBggr, |w, h| Bayer::boxed(w, h, Cfa::Bggr)),
  (PixelFormat::BayerGbrg, |w, h| Bayer::boxed(w, h, Cfa::Gbrg)),
  (PixelFormat::BayerGrbg, |w, h| Bayer::boxed(w, h, Cfa::Grbg)),
  (PixelFormat::BayerRggb, |w, h| Bayer::boxed(w, h, Cfa::Rggb)),
  (PixelFormat::Mjpeg, |w, h| Box::new(MjpegDecoder { width: w, height: h })),
];

const ENCODERS: &[(PixelFormat, EncoderCtor)] = &[
  (PixelFormat::Bgr, |_, _| Box::new(BgrEncoder)),
  (PixelFormat::Rgb, |_, _| Box::new(RgbEncoder)),
  (PixelFormat::Gray, |_, _| Box::new(GrayEncoder)),
  (PixelFormat::Mjpeg, |_, _| {
    Box::new(MjpegEncoder::new(DEFAULT_JPEG_QUALITY))
  }),
];

/// Default JPEG quality for encoder-table lookups.
pub const DEFAULT_JPEG_QUALITY: u8 = 90;

/// Construct a decoder for the given format, sized `width` x `height`.
pub fn decoder_for(
  format: PixelFormat,
  width: u32,
  height: u32,
) -> Result<Box<dyn ImageDecoder>, ProxyError> {
  DECODERS
    .iter()
    .find(|(f, _)| *f == format)
    .map(|(_, ctor)| ctor(width, height))
    .ok_or(ProxyError::UnsupportedPixelFormat(format))
}

/// Construct an encoder for the given format.
pub fn encoder_for(
  format: PixelFormat,
  width: u32,
  height: u32,
) -> Result<Box<dyn ImageEncoder>, ProxyError> {
  ENCODERS
    .iter()
    .find(|(f, _)| *f == format)
    .map(|(_, ctor)| ctor(width, height))
    .ok_or(ProxyError::UnsupportedPixelFormat(format))
}

struct BgrDecoder {
  width: u32,
  height: u32,
}

impl ImageDecoder for BgrDecoder {
  fn decode(&self, data: &[u8]) -> Result<BgrImage, ProxyError> {
    BgrImage::new(self.width, self.height, data.to_vec())
  }
}

struct RgbDecoder {
  width: u32,
  height: u32,
}

impl ImageDecoder for RgbDecoder {
  fn decode(&self, data: &[u8]) -> Result<BgrImage, ProxyError> {
    BgrImage::new(self.width, self.height, swap_rb(data))
  }
}

struct GrayDecoder {
  width: u32,
  height: u32,
}

impl ImageDecoder for GrayDecoder {
  fn decode(&self, data: &[u8]) -> Result<BgrImage, ProxyError> {
    let expected = self.width as usize * self.height as usize;
    if data.len() != expected {
      return Err(ProxyError::ImageCodec(format!(
        "gray buffer of {} bytes does not match {}x{}",
        data.len(),
        self.width,
        self.height
      )));
    }
    let mut out = Vec::with_capacity(expected * 3);
    for &v in data {
      out.extend_from_slice(&[v, v, v]);
    }
    BgrImage::new(self.width, self.height, out)
  }
}

struct MjpegDecoder {
  width: u32,
  height: u32,
}

impl ImageDecoder for MjpegDecoder {
  fn decode(&self, data: &[u8]) -> Result<BgrImage, ProxyError> {
    let decoded = image::load_from_memory_with_format(data, ImageFormat::Jpeg)
      .map_err(|e| ProxyError::ImageCodec(format!("JPEG decode: {}", e)))?
      .to_rgb8();
    if (decoded.width(), decoded.height()) != (self.width, self.height) {
      log::debug!(
        "MJPEG frame is {}x{}, message header said {}x{}",
        decoded.width(),
        decoded.height(),
        self.width,
        self.height
      );
    }
    BgrImage::new(decoded.width(), decoded.height(), swap_rb(decoded.as_raw()))
  }
}

struct BgrEncoder;

impl ImageEncoder for BgrEncoder {
  fn encode(&self, image: &BgrImage) -> Result<Vec<u8>, ProxyError> {
    Ok(image.data.clone())
  }
}

struct RgbEncoder;

impl ImageEncoder for RgbEncoder {
  fn encode(&self, image: &BgrImage) -> Result<Vec<u8>, ProxyError> {
    Ok(swap_rb(&image.data))
  }
}

struct GrayEncoder;

impl ImageEncoder for GrayEncoder {
  fn encode(&self, image: &BgrImage) -> Result<Vec<u8>, ProxyError> {
    // ITU-R BT.601 luma weights.
    Ok(
      image
        .data
        .chunks_exact(3)
        .map(|bgr| {
          let [b, g, r] = [bgr[0] as f32, bgr[1] as f32, bgr[2] as f32];
          (0.114 * b + 0.587 * g + 0.299 * r).round() as u8
        })
        .collect(),
    )
  }
}

/// JPEG encoder with a fixed quality in `[1, 100]`.
#[derive(Debug)]
pub struct MjpegEncoder {
  quality: u8,
}

impl MjpegEncoder {
  pub fn new(quality: u8) -> Self {
    Self {
      quality: quality.clamp(1, 100),
    }
  }
}

impl ImageEncoder for MjpegEncoder {
  fn encode(&self, image: &BgrImage) -> Result<Vec<u8>, ProxyError> {
    let rgb = swap_rb(&image.data);
    let mut out = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut out, self.quality)
      .encode(&rgb, image.width, image.height, ExtendedColorType::Rgb8)
      .map_err(|e| ProxyError::ImageCodec(format!("JPEG encode: {}", e)))?;
    Ok(out.into_inner())
  }
}

/// JPEG encoder that downsamples before encoding.
#[derive(Debug)]
pub struct DownsamplingMjpegEncoder {
  inner: MjpegEncoder,
  scale: f32,
}

impl DownsamplingMjpegEncoder {
  pub fn new(scale: f32, quality: u8) -> Self {
    Self {
      inner: MjpegEncoder::new(quality),
      scale,
    }
  }
}

impl ImageEncoder for DownsamplingMjpegEncoder {
  fn encode(&self, image: &BgrImage) -> Result<Vec<u8>, ProxyError> {
    if (self.scale - 1.0).abs() < f32::EPSILON {
      return self.inner.encode(image);
    }
    self.inner.encode(&downscale(image, self.scale)?)
  }
}

/// Resample by a float factor.
///
/// Resampling is channel-agnostic, so the BGR buffer is resized in place of
/// an RGB one without any swaps.
pub fn downscale(image: &BgrImage, scale: f32) -> Result<BgrImage, ProxyError> {
  if !(scale > 0.0) {
    return Err(ProxyError::ImageCodec(format!("invalid scale factor {}", scale)));
  }
  let new_w = ((image.width as f32 * scale).round() as u32).max(1);
  let new_h = ((image.height as f32 * scale).round() as u32).max(1);
  let buffer = RgbImage::from_raw(image.width, image.height, image.data.clone())
    .ok_or_else(|| ProxyError::ImageCodec("buffer does not match dimensions".to_string()))?;
  let resized = image::imageops::resize(&buffer, new_w, new_h, FilterType::Triangle);
  BgrImage::new(new_w, new_h, resized.into_raw())
}

fn swap_rb(data: &[u8]) -> Vec<u8> {
  let mut out = data.to_vec();
  for px in out.chunks_exact_mut(3) {
    px.swap(0, 2);
  }
  out
}

/// Bayer color-filter-array layouts, named by their top-left 2x2 tile.
#[derive(Debug, Clone, Copy)]
enum Cfa {
  Bggr,
  Gbrg,
  Grbg,
  Rggb,
}

impl Cfa {
  /// Channel (0 = B, 1 = G, 2 = R) sampled at pixel (x, y).
  fn channel_at(self, x: u32, y: u32) -> usize {
    let tile = match self {
      Cfa::Bggr => [[0, 1], [1, 2]],
      Cfa::Gbrg => [[1, 0], [2, 1]],
      Cfa::Grbg => [[1, 2], [0, 1]],
      Cfa::Rggb => [[2, 1], [1, 0]],
    };
    tile[(y & 1) as usize][(x & 1) as usize]
  }
}

struct Bayer {
  width: u32,
  height: u32,
  cfa: Cfa,
}

impl Bayer {
  fn boxed(width: u32, height: u32, cfa: Cfa) -> Box<dyn ImageDecoder> {
    Box::new(Self { width, height, cfa })
  }
}

impl ImageDecoder for Bayer {
  /// Bilinear demosaic: each output channel averages the mosaic sites of
  /// that color within the 3x3 neighborhood.
  fn decode(&self, data: &[u8]) -> Result<BgrImage, ProxyError> {
    let (w, h) = (self.width as usize, self.height as usize);
    if data.len() != w * h {
      return Err(ProxyError::ImageCodec(format!(
        "bayer buffer of {} bytes does not match {}x{}",
        data.len(),
        self.width,
        self.height
      )));
    }
    let mut out = vec![0u8; w * h * 3];
    for y in 0..h {
      for x in 0..w {
        let mut sums = [0u32; 3];
        let mut counts = [0u32; 3];
        for dy in -1i64..=1 {
          for dx in -1i64..=1 {
            let (nx, ny) = (x as i64 + dx, y as i64 + dy);
            if nx < 0 || ny < 0 || nx >= w as i64 || ny >= h as i64 {
              continue;
            }
            let channel = self.cfa.channel_at(nx as u32, ny as u32);
            sums[channel] += u32::from(data[ny as usize * w + nx as usize]);
            counts[channel] += 1;
          }
        }
        let base = (y * w + x) * 3;
        for channel in 0..3 {
          out[base + channel] = if counts[channel] > 0 {
            (sums[channel] / counts[channel]) as u8
          } else {
            0
          };
        }
      }
    }
    BgrImage::new(self.width, self.height, out)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn enumerants_round_trip() {
    assert_eq!(PixelFormat::try_from(861030210).unwrap(), PixelFormat::Bgr);
    assert_eq!(PixelFormat::try_from(-1).unwrap(), PixelFormat::Any);
    assert!(matches!(
      PixelFormat::try_from(12345),
      Err(ProxyError::UnknownPixelFormat(12345))
    ));
  }

  #[test]
  fn unsupported_formats_fail_lookup() {
    assert!(matches!(
      decoder_for(PixelFormat::Nv12, 4, 4),
      Err(ProxyError::UnsupportedPixelFormat(PixelFormat::Nv12))
    ));
    assert!(encoder_for(PixelFormat::BayerBggr, 4, 4).is_err());
  }

  #[test]
  fn rgb_decoder_swaps_into_bgr() {
    let decoder = decoder_for(PixelFormat::Rgb, 2, 1).unwrap();
    let image = decoder.decode(&[10, 20, 30, 40, 50, 60]).unwrap();
    assert_eq!(image.data, vec![30, 20, 10, 60, 50, 40]);
  }

  #[test]
  fn gray_decoder_replicates_channels() {
    let decoder = decoder_for(PixelFormat::Gray, 2, 2).unwrap();
    let image = decoder.decode(&[1, 2, 3, 4]).unwrap();
    assert_eq!(image.data, vec![1, 1, 1, 2, 2, 2, 3, 3, 3, 4, 4, 4]);
    assert!(decoder.decode(&[1, 2, 3]).is_err());
  }

  #[test]
  fn gray_encoder_is_luma() {
    let image = BgrImage::new(1, 1, vec![0, 0, 255]).unwrap(); // pure red
    let encoder = encoder_for(PixelFormat::Gray, 1, 1).unwrap();
    let gray = encoder.encode(&image).unwrap();
    assert_eq!(gray, vec![76]); // 0.299 * 255
  }

  #[test]
  fn bayer_uniform_field_stays_uniform() {
    let decoder = decoder_for(PixelFormat::BayerRggb, 4, 4).unwrap();
    let image = decoder.decode(&[128u8; 16]).unwrap();
    assert!(image.data.iter().all(|&v| v == 128));
  }

  #[test]
  fn bayer_sites_keep_their_measured_value() {
    // RGGB: (0,0) samples red. A bright top-left corner must show up in
    // the red channel of the decoded pixel.
    let mut mosaic = [0u8; 16];
    mosaic[0] = 200;
    let decoder = decoder_for(PixelFormat::BayerRggb, 4, 4).unwrap();
    let image = decoder.decode(&mosaic).unwrap();
    assert_eq!(image.data[2], 200); // R of pixel (0,0)
  }

  #[test]
  fn jpeg_encoder_emits_soi_marker() {
    let image = BgrImage::new(4, 4, vec![200u8; 48]).unwrap();
    let jpeg = MjpegEncoder::new(75).encode(&image).unwrap();
    assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

    let decoder = decoder_for(PixelFormat::Mjpeg, 4, 4).unwrap();
    let back = decoder.decode(&jpeg).unwrap();
    assert_eq!((back.width, back.height), (4, 4));
  }

  #[test]
  fn downscale_halves_dimensions() {
    let image = BgrImage::new(8, 4, vec![50u8; 96]).unwrap();
    let small = downscale(&image, 0.5).unwrap();
    assert_eq!((small.width, small.height), (4, 2));
    assert_eq!(small.data.len(), 24);
  }
}
