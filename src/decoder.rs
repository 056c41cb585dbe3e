// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pluggable pixel decoder backends and decode options.

use crate::boxes::FourCC;
use crate::image::DecodedImage;
use crate::{Error, Result, SubError, TryVec};
use log::{debug, trace};
use std::sync::Arc;

/// Coded payload of one image item, handed to a backend.
#[derive(Debug, Clone, Copy)]
pub struct CodedItem<'a> {
    pub item_id: u32,
    /// Item type, e.g. `hvc1` or `av01`.
    pub format: FourCC,
    /// Payload of the codec configuration property (`hvcC`, `av1C`, ...), without its box header.
    pub configuration: Option<&'a [u8]>,
    pub data: &'a [u8],
}

/// A pixel decoder for one or more coded formats.
///
/// Backends must be usable from several threads at once; per-call state
/// belongs on the stack of [`decode`](Self::decode).
pub trait DecoderPlugin: Send + Sync {
    /// Stable identifier used for explicit selection.
    fn name_id(&self) -> &str;

    /// Priority for `format`, or `None` if the format is not handled. Higher wins.
    fn priority(&self, format: FourCC) -> Option<u32>;

    fn can_decode(&self, format: FourCC) -> bool {
        self.priority(format).is_some()
    }

    /// Decode to the backend's native colorspace and chroma.
    fn decode(&self, item: &CodedItem<'_>, options: &DecodingOptions) -> Result<DecodedImage>;
}

/// Ordered set of registered backends.
#[derive(Default)]
pub struct DecoderRegistry {
    plugins: TryVec<Arc<dyn DecoderPlugin>>,
}

impl std::fmt::Debug for DecoderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.plugins.iter().map(|p| p.name_id())).finish()
    }
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn DecoderPlugin>) -> Result<()> {
        debug!("registering decoder {}", plugin.name_id());
        self.plugins.push(plugin)?;
        Ok(())
    }

    pub fn plugins(&self) -> &[Arc<dyn DecoderPlugin>] {
        &self.plugins
    }

    /// Decode `item` with the backend [`select_decoder`] picks.
    pub fn dispatch(&self, item: &CodedItem<'_>, options: &DecodingOptions) -> Result<DecodedImage> {
        let plugin = select_decoder(&self.plugins, item.format, options.decoder_id.as_deref())
            .ok_or(Error::Unsupported(SubError::UnsupportedCodec, "no decoder registered for this format"))?;
        trace!("decoding item {} ({}) with {}", item.item_id, item.format, plugin.name_id());
        plugin.decode(item, options)
    }
}

/// Pick a backend for `format`.
///
/// An explicitly named backend wins if it can decode the format. Otherwise
/// the highest priority wins, with ties going to the earliest registered.
pub fn select_decoder<'a>(
    plugins: &'a [Arc<dyn DecoderPlugin>],
    format: FourCC,
    decoder_id: Option<&str>,
) -> Option<&'a Arc<dyn DecoderPlugin>> {
    if let Some(id) = decoder_id {
        if let Some(p) = plugins.iter().find(|p| p.name_id() == id && p.can_decode(format)) {
            return Some(p);
        }
        debug!("decoder {id} unavailable for {format}, using priority order");
    }
    let mut best: Option<(&Arc<dyn DecoderPlugin>, u32)> = None;
    for plugin in plugins {
        if let Some(priority) = plugin.priority(format) {
            if best.is_none_or(|(_, b)| priority > b) {
                best = Some((plugin, priority));
            }
        }
    }
    best.map(|(p, _)| p)
}

/// Phases reported to a [`ProgressSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgressStep {
    /// The whole decode of one handle.
    Total,
    /// Tiles of a grid image.
    LoadTile,
}

/// Receives progress callbacks. Every `start` is matched by exactly one `end`.
pub trait ProgressSink {
    fn start(&mut self, step: ProgressStep, max_progress: u32);
    fn progress(&mut self, step: ProgressStep, progress: u32);
    fn end(&mut self, step: ProgressStep);
}

/// Discards progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn start(&mut self, _: ProgressStep, _: u32) {}
    fn progress(&mut self, _: ProgressStep, _: u32) {}
    fn end(&mut self, _: ProgressStep) {}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChromaDownsampling {
    NearestNeighbor,
    #[default]
    Average,
    /// Iterative refinement; only for RGB to YCbCr 4:2:0 and 4:2:2.
    Sharp,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChromaUpsampling {
    NearestNeighbor,
    #[default]
    Bilinear,
}

/// Resampling preferences for chroma layout changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ColorConversionOptions {
    pub preferred_chroma_downsampling: ChromaDownsampling,
    pub preferred_chroma_upsampling: ChromaUpsampling,
    /// Fail instead of falling back to nearest neighbor when the preference cannot be honored.
    pub only_use_preferred_chroma_algorithm: bool,
}

/// Per-decode options.
///
/// ```rust
/// use zenheif::{ChromaDownsampling, DecodingOptions};
///
/// let options = DecodingOptions::default()
///     .with_ignore_transformations(true)
///     .with_chroma_downsampling(ChromaDownsampling::Sharp)
///     .with_decoder("my-hevc");
/// assert!(options.ignore_transformations);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodingOptions {
    /// Skip rotation, mirroring and cropping.
    pub ignore_transformations: bool,
    /// Reduce samples deeper than 8 bits to 8 bits after conversion.
    pub convert_hdr_to_8bit: bool,
    /// Substitute a placeholder for a failed grid tile and skip a failed alpha
    /// image, recording a warning, instead of failing the decode.
    pub lenient_decoding: bool,
    /// Preferred backend by [`DecoderPlugin::name_id`].
    pub decoder_id: Option<std::string::String>,
    pub color_conversion: ColorConversionOptions,
}

impl DecodingOptions {
    pub fn with_ignore_transformations(mut self, ignore: bool) -> Self {
        self.ignore_transformations = ignore;
        self
    }

    pub fn with_convert_hdr_to_8bit(mut self, convert: bool) -> Self {
        self.convert_hdr_to_8bit = convert;
        self
    }

    pub fn with_lenient_decoding(mut self, lenient: bool) -> Self {
        self.lenient_decoding = lenient;
        self
    }

    pub fn with_decoder(mut self, name_id: &str) -> Self {
        self.decoder_id = Some(name_id.into());
        self
    }

    pub fn with_chroma_downsampling(mut self, algorithm: ChromaDownsampling) -> Self {
        self.color_conversion.preferred_chroma_downsampling = algorithm;
        self
    }

    pub fn with_chroma_upsampling(mut self, algorithm: ChromaUpsampling) -> Self {
        self.color_conversion.preferred_chroma_upsampling = algorithm;
        self
    }

    pub fn with_only_preferred_chroma_algorithm(mut self, only: bool) -> Self {
        self.color_conversion.only_use_preferred_chroma_algorithm = only;
        self
    }
}
