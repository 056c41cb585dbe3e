// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use rayon::prelude::*;
use std::sync::Arc;
use zenheif::{
    AuxiliaryFilter, Channel, Chroma, ChromaDownsampling, ChromaUpsampling, CodedItem, ColorConversionOptions,
    ColorProfileType, Colorspace, DecodedImage, DecoderPlugin, DecoderRegistry, DecodingOptions, ErrorCategory,
    FileTypeResult, FourCC, GridCanvas, HeifContext, NclxColorProfile, ProgressSink, ProgressStep, ReadConfig,
    SubError,
};

const ALPHA_URN: &str = "urn:mpeg:mpegB:cicp:systems:auxiliary:alpha";
const DEPTH_URN: &str = "urn:mpeg:hevc:2015:auxid:2";

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ============================================================================
// Container builder
// ============================================================================

fn bx(name: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(payload.len() as u32 + 8).to_be_bytes());
    out.extend_from_slice(name);
    out.extend_from_slice(payload);
    out
}

fn full(name: &[u8; 4], version: u8, flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut body = flags.to_be_bytes().to_vec();
    body[0] = version;
    body.extend_from_slice(payload);
    bx(name, &body)
}

fn ispe(width: u32, height: u32) -> Vec<u8> {
    full(b"ispe", 0, 0, &[width.to_be_bytes(), height.to_be_bytes()].concat())
}

fn irot(quarter_turns: u8) -> Vec<u8> {
    bx(b"irot", &[quarter_turns])
}

fn imir(axis: u8) -> Vec<u8> {
    bx(b"imir", &[axis])
}

fn clap(width: u32, height: u32) -> Vec<u8> {
    let fields = [width, 1, height, 1, 0, 1, 0, 1];
    bx(b"clap", &fields.iter().flat_map(|v| v.to_be_bytes()).collect::<Vec<u8>>())
}

fn nclx(primaries: u16, transfer: u16, matrix: u16, full_range: bool) -> Vec<u8> {
    let mut payload = b"nclx".to_vec();
    for code in [primaries, transfer, matrix] {
        payload.extend_from_slice(&code.to_be_bytes());
    }
    payload.push(if full_range { 0x80 } else { 0 });
    bx(b"colr", &payload)
}

fn icc(profile: &[u8]) -> Vec<u8> {
    bx(b"colr", &[b"prof".as_slice(), profile].concat())
}

fn pixi(bits: &[u8]) -> Vec<u8> {
    full(b"pixi", 0, 0, &[&[bits.len() as u8][..], bits].concat())
}

fn auxc(urn: &str) -> Vec<u8> {
    full(b"auxC", 0, 0, &[urn.as_bytes(), b"\0"].concat())
}

fn grid_payload(rows: u8, columns: u8, width: u16, height: u16) -> Vec<u8> {
    let mut out = vec![0, 0, rows - 1, columns - 1];
    out.extend_from_slice(&width.to_be_bytes());
    out.extend_from_slice(&height.to_be_bytes());
    out
}

struct TestItem {
    id: u32,
    kind: [u8; 4],
    hidden: bool,
    content_type: Option<&'static str>,
    data: Vec<u8>,
}

/// Writes `ftyp`, `meta` and one `mdat` holding every item's payload.
#[derive(Default)]
struct HeifBuilder {
    items: Vec<TestItem>,
    properties: Vec<Vec<u8>>,
    associations: Vec<(u32, Vec<u8>)>,
    references: Vec<([u8; 4], u32, Vec<u32>)>,
    primary: Option<u32>,
    trailing: Vec<u8>,
}

impl HeifBuilder {
    fn item(mut self, id: u32, kind: &[u8; 4], data: Vec<u8>) -> Self {
        self.items.push(TestItem { id, kind: *kind, hidden: false, content_type: None, data });
        self
    }

    fn hidden_item(mut self, id: u32, kind: &[u8; 4], data: Vec<u8>) -> Self {
        self.items.push(TestItem { id, kind: *kind, hidden: true, content_type: None, data });
        self
    }

    fn mime_item(mut self, id: u32, content_type: &'static str, data: Vec<u8>) -> Self {
        self.items.push(TestItem { id, kind: *b"mime", hidden: false, content_type: Some(content_type), data });
        self
    }

    fn primary(mut self, id: u32) -> Self {
        self.primary = Some(id);
        self
    }

    /// Add a property and associate it with `item_id`, after any earlier ones.
    fn property(mut self, item_id: u32, property: Vec<u8>) -> Self {
        self.properties.push(property);
        let index = self.properties.len() as u8;
        match self.associations.iter_mut().find(|(id, _)| *id == item_id) {
            Some((_, list)) => list.push(index),
            None => self.associations.push((item_id, vec![index])),
        }
        self
    }

    fn reference(mut self, kind: &[u8; 4], from: u32, to: &[u32]) -> Self {
        self.references.push((*kind, from, to.to_vec()));
        self
    }

    fn trailing(mut self, bytes: &[u8]) -> Self {
        self.trailing.extend_from_slice(bytes);
        self
    }

    fn meta(&self, data_offset: u32) -> Vec<u8> {
        let mut body = full(b"hdlr", 0, 0, &[&[0u8; 4][..], b"pict", &[0u8; 12], b"\0"].concat());
        if let Some(primary) = self.primary {
            body.extend(full(b"pitm", 0, 0, &(primary as u16).to_be_bytes()));
        }

        let mut iinf = (self.items.len() as u16).to_be_bytes().to_vec();
        for item in &self.items {
            let mut infe = (item.id as u16).to_be_bytes().to_vec();
            infe.extend_from_slice(&[0, 0]);
            infe.extend_from_slice(&item.kind);
            infe.push(0);
            if let Some(content_type) = item.content_type {
                infe.extend_from_slice(content_type.as_bytes());
                infe.push(0);
            }
            iinf.extend(full(b"infe", 2, u32::from(item.hidden), &infe));
        }
        body.extend(full(b"iinf", 0, 0, &iinf));

        if !self.references.is_empty() {
            let mut iref = Vec::new();
            for (kind, from, to) in &self.references {
                let mut r = (*from as u16).to_be_bytes().to_vec();
                r.extend_from_slice(&(to.len() as u16).to_be_bytes());
                for id in to {
                    r.extend_from_slice(&(*id as u16).to_be_bytes());
                }
                iref.extend(bx(kind, &r));
            }
            body.extend(full(b"iref", 0, 0, &iref));
        }

        let ipco = bx(b"ipco", &self.properties.concat());
        let mut ipma = (self.associations.len() as u32).to_be_bytes().to_vec();
        for (id, list) in &self.associations {
            ipma.extend_from_slice(&(*id as u16).to_be_bytes());
            ipma.push(list.len() as u8);
            ipma.extend_from_slice(list);
        }
        body.extend(bx(b"iprp", &[ipco, full(b"ipma", 0, 0, &ipma)].concat()));

        // 32-bit offsets and lengths, no base offset
        let mut iloc = vec![0x44, 0x00];
        iloc.extend_from_slice(&(self.items.len() as u16).to_be_bytes());
        let mut offset = data_offset;
        for item in &self.items {
            iloc.extend_from_slice(&(item.id as u16).to_be_bytes());
            iloc.extend_from_slice(&[0, 0, 0, 1]);
            iloc.extend_from_slice(&offset.to_be_bytes());
            iloc.extend_from_slice(&(item.data.len() as u32).to_be_bytes());
            offset += item.data.len() as u32;
        }
        body.extend(full(b"iloc", 0, 0, &iloc));

        full(b"meta", 0, 0, &body)
    }

    fn build(&self) -> Vec<u8> {
        let mut out = bx(b"ftyp", b"heic\0\0\0\0mif1heic");
        // box sizes do not depend on the offsets written into iloc
        let data_offset = out.len() + self.meta(0).len() + 8;
        out.extend(self.meta(data_offset as u32));
        let data: Vec<u8> = self.items.iter().flat_map(|i| i.data.iter().copied()).collect();
        out.extend(bx(b"mdat", &data));
        out.extend_from_slice(&self.trailing);
        out
    }
}

// ============================================================================
// Test codec: u16 width, u16 height, u8 layout (0 mono, 1 4:2:0, 3 4:4:4), then 8-bit planes
// ============================================================================

fn mono_payload(width: u16, height: u16, pixel: impl Fn(u32, u32) -> u8) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&width.to_be_bytes());
    out.extend_from_slice(&height.to_be_bytes());
    out.push(0);
    for y in 0..u32::from(height) {
        for x in 0..u32::from(width) {
            out.push(pixel(x, y));
        }
    }
    out
}

fn decode_payload(data: &[u8]) -> Option<DecodedImage> {
    let header = data.get(..5)?;
    let width = u32::from(u16::from_be_bytes([header[0], header[1]]));
    let height = u32::from(u16::from_be_bytes([header[2], header[3]]));
    let (colorspace, chroma) = match header[4] {
        0 => (Colorspace::Monochrome, Chroma::Monochrome),
        1 => (Colorspace::YCbCr, Chroma::C420),
        3 => (Colorspace::YCbCr, Chroma::C444),
        _ => return None,
    };
    let channels: &[Channel] = if header[4] == 0 { &[Channel::Y] } else { &[Channel::Y, Channel::Cb, Channel::Cr] };
    let mut image = DecodedImage::new(width, height, colorspace, chroma).ok()?;
    let mut rest = &data[5..];
    for &channel in channels {
        let (pw, ph) = if channel == Channel::Y { (width, height) } else { chroma.chroma_plane_size(width, height) };
        image.add_plane(channel, pw, ph, 8).ok()?;
        let (plane, stride) = image.plane_mut(channel)?;
        for y in 0..ph as usize {
            let row = rest.get(..pw as usize)?;
            plane[y * stride..y * stride + pw as usize].copy_from_slice(row);
            rest = &rest[pw as usize..];
        }
    }
    Some(image)
}

struct TestCodec {
    id: &'static str,
    priority: u32,
    /// Overwrite every luma sample, to tell backends apart.
    mark: Option<u8>,
}

impl DecoderPlugin for TestCodec {
    fn name_id(&self) -> &str {
        self.id
    }

    fn priority(&self, format: FourCC) -> Option<u32> {
        (format == b"hvc1").then_some(self.priority)
    }

    fn decode(&self, item: &CodedItem<'_>, _: &DecodingOptions) -> zenheif::Result<DecodedImage> {
        let mut image =
            decode_payload(item.data).ok_or_else(|| zenheif::Error::decoder(self.id, "malformed test payload"))?;
        if let Some(mark) = self.mark {
            let (plane, _) = image.plane_mut(Channel::Y).expect("luma plane");
            plane.fill(mark);
        }
        Ok(image)
    }
}

fn registry() -> DecoderRegistry {
    let mut registry = DecoderRegistry::new();
    registry.register(Arc::new(TestCodec { id: "test", priority: 1, mark: None })).unwrap();
    registry
}

fn luma(image: &DecodedImage) -> Vec<Vec<u8>> {
    let (data, stride) = image.plane(Channel::Y).unwrap();
    (0..image.height() as usize)
        .map(|y| data[y * stride..y * stride + image.width() as usize].to_vec())
        .collect()
}

fn keep_native() -> (Colorspace, Chroma) {
    (Colorspace::Undefined, Chroma::Undefined)
}

// ============================================================================
// Items and relations
// ============================================================================

#[test]
fn top_level_images_and_primary() {
    init_logger();
    let file = HeifBuilder::default()
        .item(1, b"hvc1", mono_payload(4, 2, |x, _| x as u8))
        .property(1, ispe(4, 2))
        .item(2, b"hvc1", mono_payload(2, 1, |_, _| 0))
        .property(2, ispe(2, 1))
        .reference(b"thmb", 2, &[1])
        .hidden_item(3, b"hvc1", mono_payload(1, 1, |_, _| 0))
        .item(4, b"hvc1", mono_payload(1, 1, |_, _| 0))
        .primary(1)
        .build();

    let ctx = HeifContext::from_bytes(&file).unwrap();
    assert_eq!(ctx.top_level_image_ids(), &[1, 4]);
    assert_eq!(ctx.number_of_top_level_images(), 2);
    assert_eq!(ctx.primary_image_id().unwrap(), 1);

    let handle = ctx.primary_image_handle().unwrap();
    assert!(handle.is_primary());
    assert_eq!((handle.width(), handle.height()), (4, 2));
    assert_eq!(handle.thumbnail_ids(), &[2]);
    let thumb = handle.thumbnail_handle(2).unwrap();
    assert!(!thumb.is_primary());
    assert_eq!((thumb.ispe_width(), thumb.ispe_height()), (2, 1));
    assert!(handle.thumbnail_handle(4).is_err());
    assert!(ctx.warnings().is_empty());
}

#[test]
fn missing_primary_item() {
    let file = HeifBuilder::default().item(1, b"hvc1", mono_payload(1, 1, |_, _| 0)).build();
    let ctx = HeifContext::from_bytes(&file).unwrap();
    assert_eq!(ctx.top_level_image_ids(), &[1]);
    assert_eq!(ctx.primary_image_id().unwrap_err().suberror(), SubError::NoOrInvalidPrimaryItem);
    assert!(ctx.image_handle(1).is_ok());
    assert_eq!(ctx.image_handle(9).unwrap_err().category(), ErrorCategory::Usage);
}

#[test]
fn duplicate_item_id_is_rejected() {
    let file = HeifBuilder::default()
        .item(1, b"hvc1", mono_payload(1, 1, |_, _| 0))
        .item(1, b"hvc1", mono_payload(1, 1, |_, _| 0))
        .primary(1)
        .build();
    let err = HeifContext::from_bytes(&file).unwrap_err();
    assert_eq!(err.suberror(), SubError::DuplicateItemId);
    assert_eq!(err.category(), ErrorCategory::Input);
}

#[test]
fn owned_and_reader_sources() {
    let file = HeifBuilder::default().item(1, b"hvc1", mono_payload(2, 2, |_, _| 5)).primary(1).build();
    let owned = HeifContext::from_owned(file.clone()).unwrap();
    let handle = owned.primary_image_handle().unwrap();
    drop(owned);
    // the handle keeps the parsed container alive
    let image = handle.decode(&registry(), Colorspace::Undefined, Chroma::Undefined, &DecodingOptions::default());
    assert_eq!(luma(&image.unwrap()), vec![vec![5, 5], vec![5, 5]]);

    let from_reader = HeifContext::from_reader(std::io::Cursor::new(file)).unwrap();
    assert_eq!(from_reader.primary_image_id().unwrap(), 1);
}

// ============================================================================
// Transformations
// ============================================================================

#[test]
fn rotation_applies_before_crop() {
    init_logger();
    let file = HeifBuilder::default()
        .item(1, b"hvc1", mono_payload(4, 2, |x, y| (y * 4 + x) as u8))
        .property(1, ispe(4, 2))
        .property(1, irot(1))
        .property(1, clap(2, 3))
        .primary(1)
        .build();
    let ctx = HeifContext::from_bytes(&file).unwrap();
    let handle = ctx.primary_image_handle().unwrap();
    assert_eq!((handle.ispe_width(), handle.ispe_height()), (4, 2));
    assert_eq!((handle.width(), handle.height()), (2, 3));

    let ids = ctx.transformation_properties(1).unwrap();
    assert_eq!(&ids[..], &[2, 3]);
    assert_eq!(ctx.property_type(2).unwrap(), zenheif::PropertyType::TransformRotation);
    assert_eq!(ctx.property_rotation_ccw(2).unwrap(), 90);
    let borders = ctx.property_crop_borders(3, 2, 4).unwrap();
    assert_eq!((borders.top, borders.bottom, borders.left, borders.right), (1, 0, 0, 0));
    assert!(ctx.property_mirror(2).is_err());

    let (cs, chroma) = keep_native();
    let image = handle.decode(&registry(), cs, chroma, &DecodingOptions::default()).unwrap();
    assert_eq!(luma(&image), vec![vec![2, 6], vec![1, 5], vec![0, 4]]);

    let raw = handle
        .decode(&registry(), cs, chroma, &DecodingOptions::default().with_ignore_transformations(true))
        .unwrap();
    assert_eq!(luma(&raw), vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7]]);
}

#[test]
fn mirror_axes_and_orientation() {
    let file = HeifBuilder::default()
        .item(1, b"hvc1", mono_payload(3, 2, |x, y| (y * 3 + x) as u8))
        .property(1, imir(1))
        .item(2, b"hvc1", mono_payload(3, 2, |x, y| (y * 3 + x) as u8))
        .property(2, imir(0))
        .property(2, irot(2))
        .primary(1)
        .build();
    let ctx = HeifContext::from_bytes(&file).unwrap();
    let (cs, chroma) = keep_native();

    let horizontal = ctx.image_handle(1).unwrap();
    assert_eq!(horizontal.orientation(), zenheif::Orientation::FlipHorizontal);
    let image = horizontal.decode(&registry(), cs, chroma, &DecodingOptions::default()).unwrap();
    assert_eq!(luma(&image), vec![vec![2, 1, 0], vec![5, 4, 3]]);

    // a top-bottom flip then a half turn is a left-right flip
    let combined = ctx.image_handle(2).unwrap();
    assert_eq!(combined.orientation(), zenheif::Orientation::FlipHorizontal);
    let image = combined.decode(&registry(), cs, chroma, &DecodingOptions::default()).unwrap();
    assert_eq!(luma(&image), vec![vec![2, 1, 0], vec![5, 4, 3]]);
}

#[test]
fn repeated_transformation_kind_is_rejected() {
    let file = HeifBuilder::default()
        .item(1, b"hvc1", mono_payload(2, 2, |_, _| 0))
        .property(1, irot(1))
        .property(1, irot(2))
        .primary(1)
        .build();
    let ctx = HeifContext::from_bytes(&file).unwrap();
    let err = ctx.primary_image_handle().unwrap_err();
    assert_eq!(err.suberror(), SubError::AmbiguousTransformation);
    assert_eq!(ctx.transformation_properties(1).unwrap_err().suberror(), SubError::AmbiguousTransformation);
}

// ============================================================================
// Grids
// ============================================================================

/// `rows` x `columns` grid (item 1) of mono tiles (items 2..) whose samples are their index + 1.
fn grid_file(rows: u8, columns: u8, tile: (u16, u16), output: (u16, u16)) -> Vec<u8> {
    let mut builder = HeifBuilder::default()
        .item(1, b"grid", grid_payload(rows, columns, output.0, output.1))
        .property(1, ispe(u32::from(output.0), u32::from(output.1)))
        .primary(1);
    let count = u32::from(rows) * u32::from(columns);
    let tiles: Vec<u32> = (2..2 + count).collect();
    for (index, &id) in tiles.iter().enumerate() {
        builder = builder.hidden_item(id, b"hvc1", mono_payload(tile.0, tile.1, |_, _| index as u8 + 1));
    }
    builder.reference(b"dimg", 1, &tiles).build()
}

#[test]
fn grid_with_partial_edge_tiles() {
    init_logger();
    let file = grid_file(3, 3, (3, 2), (7, 5));
    let ctx = HeifContext::from_bytes(&file).unwrap();
    assert_eq!(ctx.top_level_image_ids(), &[1]);
    let handle = ctx.primary_image_handle().unwrap();
    let grid = handle.grid().unwrap().unwrap();
    assert_eq!((grid.rows, grid.columns, grid.output_width, grid.output_height), (3, 3, 7, 5));
    assert_eq!(handle.grid_tile_ids(), &[2, 3, 4, 5, 6, 7, 8, 9, 10]);

    let (cs, chroma) = keep_native();
    let image = handle.decode(&registry(), cs, chroma, &DecodingOptions::default()).unwrap();
    assert_eq!((image.width(), image.height()), (7, 5));
    let rows = luma(&image);
    for (y, row) in rows.iter().enumerate() {
        for (x, &v) in row.iter().enumerate() {
            assert_eq!(v as usize, x / 3 + 3 * (y / 2) + 1, "pixel {x},{y}");
        }
    }
    assert!(image.warnings().is_empty());
}

#[test]
fn parallel_tile_decode_matches_sequential() {
    let file = grid_file(2, 3, (4, 2), (10, 4));
    let ctx = HeifContext::from_bytes(&file).unwrap();
    let handle = ctx.primary_image_handle().unwrap();
    let registry = registry();
    let options = DecodingOptions::default();

    let sequential = handle.decode(&registry, Colorspace::Undefined, Chroma::Undefined, &options).unwrap();

    let grid = handle.grid().unwrap().unwrap();
    let tiles: Vec<DecodedImage> = (0..handle.grid_tile_ids().len())
        .into_par_iter()
        .map(|index| handle.decode_tile(&registry, index, &options).unwrap())
        .collect();
    let mut canvas = GridCanvas::new(&grid).unwrap();
    for (index, tile) in tiles.iter().enumerate().rev() {
        canvas.paste_tile(index, tile).unwrap();
    }
    let parallel = canvas.finish().unwrap();

    assert_eq!(luma(&parallel), luma(&sequential));
    assert!(handle.decode_tile(&registry, 6, &options).is_err());
}

#[test]
fn failed_tile_fails_grid_unless_lenient() {
    let file = HeifBuilder::default()
        .item(1, b"grid", grid_payload(1, 2, 4, 2))
        .primary(1)
        .hidden_item(2, b"hvc1", mono_payload(2, 2, |_, _| 50))
        .hidden_item(3, b"hvc1", vec![9, 9, 9])
        .reference(b"dimg", 1, &[2, 3])
        .build();
    let ctx = HeifContext::from_bytes(&file).unwrap();
    let handle = ctx.primary_image_handle().unwrap();
    assert_eq!((handle.width(), handle.height()), (4, 2));

    let (cs, chroma) = keep_native();
    let err = handle.decode(&registry(), cs, chroma, &DecodingOptions::default()).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Decode);

    let lenient = DecodingOptions::default().with_lenient_decoding(true);
    let image = handle.decode(&registry(), cs, chroma, &lenient).unwrap();
    assert_eq!(luma(&image), vec![vec![50, 50, 0, 0], vec![50, 50, 0, 0]]);
    let warning = image.warnings().iter().find(|w| w.suberror == SubError::TileDecodeFailed).unwrap();
    assert_eq!(warning.item_id, Some(3));
}

#[test]
fn grid_tiles_past_the_output_are_rejected() {
    let file = grid_file(1, 3, (4, 2), (4, 2));
    let ctx = HeifContext::from_bytes(&file).unwrap();
    let handle = ctx.primary_image_handle().unwrap();
    let (cs, chroma) = keep_native();
    let err = handle.decode(&registry(), cs, chroma, &DecodingOptions::default()).unwrap_err();
    assert_eq!(err.suberror(), SubError::InvalidGridData);
}

#[test]
fn grid_tile_limit() {
    let file = grid_file(2, 2, (2, 2), (4, 4));
    let config = ReadConfig::default().with_max_grid_tiles(3);
    let ctx = HeifContext::from_bytes_with_config(&file, &config, &zenheif::Unstoppable).unwrap();
    let handle = ctx.primary_image_handle().unwrap();
    let err = handle.decode(&registry(), Colorspace::Undefined, Chroma::Undefined, &DecodingOptions::default());
    assert_eq!(err.unwrap_err().category(), ErrorCategory::Memory);
}

// ============================================================================
// Auxiliary images and metadata
// ============================================================================

#[test]
fn alpha_and_depth_auxiliaries() {
    let file = HeifBuilder::default()
        .item(1, b"hvc1", mono_payload(4, 2, |_, _| 10))
        .hidden_item(2, b"hvc1", mono_payload(4, 2, |_, _| 200))
        .property(2, auxc(ALPHA_URN))
        .hidden_item(3, b"hvc1", mono_payload(2, 1, |_, _| 1))
        .property(3, auxc(DEPTH_URN))
        .reference(b"auxl", 2, &[1])
        .reference(b"auxl", 3, &[1])
        .reference(b"prem", 1, &[2])
        .primary(1)
        .build();
    let ctx = HeifContext::from_bytes(&file).unwrap();
    assert_eq!(ctx.top_level_image_ids(), &[1]);
    let handle = ctx.primary_image_handle().unwrap();
    assert!(handle.has_alpha_channel());
    assert!(handle.is_premultiplied_alpha());
    assert!(handle.has_depth_image());
    assert_eq!(handle.depth_image_ids().collect::<Vec<_>>(), vec![3]);
    assert_eq!(handle.auxiliary_image_ids(AuxiliaryFilter::default()).collect::<Vec<_>>(), vec![2, 3]);
    let no_alpha = AuxiliaryFilter { omit_alpha: true, ..AuxiliaryFilter::default() };
    assert_eq!(handle.auxiliary_image_ids(no_alpha).collect::<Vec<_>>(), vec![3]);
    assert_eq!(handle.auxiliary_image_handle(2).unwrap().auxiliary_type(), Some(ALPHA_URN));
    assert!(handle.depth_image_handle(2).is_err());

    let image = handle.decode(&registry(), Colorspace::Undefined, Chroma::Undefined, &DecodingOptions::default()).unwrap();
    let (alpha, stride) = image.plane(Channel::Alpha).unwrap();
    assert_eq!(alpha[stride + 3], 200);
    assert_eq!(luma(&image)[1][3], 10);
}

#[test]
fn failed_alpha_fails_decode_unless_lenient() {
    let file = HeifBuilder::default()
        .item(1, b"hvc1", mono_payload(2, 2, |_, _| 10))
        .hidden_item(2, b"hvc1", vec![1, 2])
        .property(2, auxc(ALPHA_URN))
        .reference(b"auxl", 2, &[1])
        .primary(1)
        .build();
    let ctx = HeifContext::from_bytes(&file).unwrap();
    let handle = ctx.primary_image_handle().unwrap();
    let (cs, chroma) = keep_native();
    assert!(handle.decode(&registry(), cs, chroma, &DecodingOptions::default()).is_err());

    let lenient = DecodingOptions::default().with_lenient_decoding(true);
    let image = handle.decode(&registry(), cs, chroma, &lenient).unwrap();
    assert!(!image.has_channel(Channel::Alpha));
    let warning = image.warnings().iter().find(|w| w.suberror == SubError::AlphaDecodeFailed).unwrap();
    assert_eq!(warning.item_id, Some(2));
}

#[test]
fn luma_bits_from_pixi_and_grid_tiles() {
    let file = HeifBuilder::default()
        .item(1, b"hvc1", mono_payload(1, 1, |_, _| 0))
        .property(1, pixi(&[10, 10, 10]))
        .item(2, b"grid", grid_payload(1, 1, 1, 1))
        .hidden_item(3, b"hvc1", mono_payload(1, 1, |_, _| 0))
        .property(3, pixi(&[12]))
        .reference(b"dimg", 2, &[3])
        .item(4, b"hvc1", mono_payload(1, 1, |_, _| 0))
        .primary(1)
        .build();
    let ctx = HeifContext::from_bytes(&file).unwrap();
    assert_eq!(ctx.image_handle(1).unwrap().luma_bits_per_pixel(), Some(10));
    assert_eq!(ctx.image_handle(2).unwrap().luma_bits_per_pixel(), Some(12));
    assert_eq!(ctx.image_handle(4).unwrap().luma_bits_per_pixel(), None);
}

#[test]
fn metadata_size_matches_copied_bytes() {
    let exif = vec![0, 0, 0, 2, 0xff, 0xff, b'M', b'M', 0, 42, 0, 0, 0, 8];
    let xmp = b"<x:xmpmeta xmlns:x='adobe:ns:meta/'/>".to_vec();
    let file = HeifBuilder::default()
        .item(1, b"hvc1", mono_payload(1, 1, |_, _| 0))
        .item(2, b"Exif", exif.clone())
        .mime_item(3, "application/rdf+xml", xmp.clone())
        .reference(b"cdsc", 2, &[1])
        .reference(b"cdsc", 3, &[1])
        .primary(1)
        .build();
    let ctx = HeifContext::from_bytes(&file).unwrap();
    assert_eq!(ctx.top_level_image_ids(), &[1]);
    let handle = ctx.primary_image_handle().unwrap();

    let all: Vec<u32> = handle.metadata_block_ids(None).collect();
    assert_eq!(all, vec![2, 3]);
    for id in all {
        let size = handle.metadata_size(id).unwrap();
        let mut buf = vec![0u8; size + 4];
        assert_eq!(handle.copy_metadata(id, &mut buf).unwrap(), size);
        assert_eq!(&buf[..size], &handle.metadata(id).unwrap()[..]);
        assert!(handle.copy_metadata(id, &mut buf[..size - 1]).is_err());
    }

    assert_eq!(handle.metadata_block_ids(Some("Exif")).collect::<Vec<_>>(), vec![2]);
    assert_eq!(handle.metadata_type(2).unwrap(), FourCC::new(b"Exif"));
    let block = handle.metadata(2).unwrap();
    assert_eq!(&block[..], &exif[..]);
    assert_eq!(zenheif::exif_tiff_payload(&block).unwrap(), &exif[6..]);

    assert_eq!(handle.metadata_content_type(3).unwrap(), "application/rdf+xml");
    assert_eq!(handle.metadata_content_type(2).unwrap(), "");
    assert!(handle.metadata(1).is_err());
}

// ============================================================================
// Color
// ============================================================================

#[test]
fn icc_takes_precedence_over_nclx() {
    let profile = [1u8, 2, 3, 4, 5];
    let file = HeifBuilder::default()
        .item(1, b"hvc1", mono_payload(1, 1, |_, _| 0))
        .property(1, nclx(9, 16, 9, true))
        .property(1, icc(&profile))
        .item(2, b"hvc1", mono_payload(1, 1, |_, _| 0))
        .property(2, nclx(1, 13, 6, false))
        .item(3, b"hvc1", mono_payload(1, 1, |_, _| 0))
        .primary(1)
        .build();
    let ctx = HeifContext::from_bytes(&file).unwrap();

    let both = ctx.image_handle(1).unwrap();
    assert_eq!(both.color_profile_type(), ColorProfileType::Prof);
    assert_eq!(both.raw_color_profile().unwrap(), &profile);
    assert_eq!(both.raw_color_profile_size(), profile.len());
    let record = both.nclx_color_profile().unwrap();
    assert_eq!(record.color_primaries.code(), 9);
    assert_eq!(record.transfer_characteristics.code(), 16);
    assert!(record.full_range);
    assert!(record.chromaticities().is_some());

    let nclx_only = ctx.image_handle(2).unwrap();
    assert_eq!(nclx_only.color_profile_type(), ColorProfileType::Nclx);
    assert_eq!(nclx_only.raw_color_profile_size(), 0);
    assert_eq!(nclx_only.raw_color_profile().unwrap_err().suberror(), SubError::ColorProfileDoesNotExist);

    let none = ctx.image_handle(3).unwrap();
    assert_eq!(none.color_profile_type(), ColorProfileType::NotPresent);
    assert!(none.nclx_color_profile().is_err());
}

fn ycbcr420(width: u32, height: u32) -> DecodedImage {
    let mut image = DecodedImage::new(width, height, Colorspace::YCbCr, Chroma::C420).unwrap();
    for (channel, seed) in [(Channel::Y, 3u32), (Channel::Cb, 7), (Channel::Cr, 11)] {
        let (pw, ph) = if channel == Channel::Y { (width, height) } else { Chroma::C420.chroma_plane_size(width, height) };
        image.add_plane(channel, pw, ph, 8).unwrap();
        let (plane, stride) = image.plane_mut(channel).unwrap();
        for y in 0..ph as usize {
            for x in 0..pw as usize {
                plane[y * stride + x] = ((x as u32 * 31 + y as u32 * 17 + seed) % 256) as u8;
            }
        }
    }
    image
}

fn plane_rows(image: &DecodedImage, channel: Channel) -> Vec<Vec<u8>> {
    let (data, stride) = image.plane(channel).unwrap();
    let (w, h) = image.plane_size(channel).unwrap();
    (0..h as usize).map(|y| data[y * stride..y * stride + w as usize].to_vec()).collect()
}

#[test]
fn nearest_neighbor_chroma_round_trip() {
    let options = ColorConversionOptions {
        preferred_chroma_downsampling: ChromaDownsampling::NearestNeighbor,
        preferred_chroma_upsampling: ChromaUpsampling::NearestNeighbor,
        only_use_preferred_chroma_algorithm: true,
    };
    let nclx = NclxColorProfile::default();
    let source = ycbcr420(6, 4);
    let expected: Vec<_> = [Channel::Y, Channel::Cb, Channel::Cr].iter().map(|&c| plane_rows(&source, c)).collect();

    let full = zenheif::convert_colorspace(source, Colorspace::YCbCr, Chroma::C444, &nclx, &options).unwrap();
    assert_eq!(full.plane_size(Channel::Cb), Some((6, 4)));
    let back = zenheif::convert_colorspace(full, Colorspace::YCbCr, Chroma::C420, &nclx, &options).unwrap();
    let actual: Vec<_> = [Channel::Y, Channel::Cb, Channel::Cr].iter().map(|&c| plane_rows(&back, c)).collect();
    assert_eq!(actual, expected);
}

#[test]
fn monochrome_to_rgb_replicates_luma() {
    let file = HeifBuilder::default().item(1, b"hvc1", mono_payload(2, 1, |x, _| 40 + x as u8)).primary(1).build();
    let ctx = HeifContext::from_bytes(&file).unwrap();
    let handle = ctx.primary_image_handle().unwrap();
    let image = handle
        .decode(&registry(), Colorspace::Rgb, Chroma::InterleavedRgb, &DecodingOptions::default())
        .unwrap();
    let (data, _) = image.plane(Channel::Interleaved).unwrap();
    assert_eq!(&data[..6], &[40, 40, 40, 41, 41, 41]);

    let err = handle.decode(&registry(), Colorspace::Monochrome, Chroma::C420, &DecodingOptions::default());
    assert_eq!(err.unwrap_err().category(), ErrorCategory::Usage);
}

#[test]
fn monochrome_to_rgb_ignores_matrix_and_range() {
    let gray = || mono_payload(2, 1, |x, _| 40 + x as u8);
    let file = HeifBuilder::default()
        .item(1, b"hvc1", gray())
        .property(1, nclx(1, 13, 1, false))
        .item(2, b"hvc1", gray())
        .property(2, nclx(1, 13, 0, true))
        .item(3, b"hvc1", gray())
        .property(3, nclx(1, 13, 8, true))
        .primary(1)
        .build();
    let ctx = HeifContext::from_bytes(&file).unwrap();
    for id in 1..=3 {
        let handle = ctx.image_handle(id).unwrap();
        let image = handle
            .decode(&registry(), Colorspace::Rgb, Chroma::InterleavedRgb, &DecodingOptions::default())
            .unwrap();
        let (data, _) = image.plane(Channel::Interleaved).unwrap();
        assert_eq!(&data[..6], &[40, 40, 40, 41, 41, 41], "item {id}");
    }
}

// ============================================================================
// Decoder dispatch and progress
// ============================================================================

#[test]
fn explicit_decoder_selection() {
    let file = HeifBuilder::default().item(1, b"hvc1", mono_payload(2, 2, |_, _| 0)).primary(1).build();
    let ctx = HeifContext::from_bytes(&file).unwrap();
    let handle = ctx.primary_image_handle().unwrap();
    let mut registry = DecoderRegistry::new();
    registry.register(Arc::new(TestCodec { id: "fast", priority: 10, mark: Some(11) })).unwrap();
    registry.register(Arc::new(TestCodec { id: "exact", priority: 5, mark: Some(22) })).unwrap();
    let (cs, chroma) = keep_native();

    let by_priority = handle.decode(&registry, cs, chroma, &DecodingOptions::default()).unwrap();
    assert_eq!(luma(&by_priority)[0][0], 11);
    let chosen = handle.decode(&registry, cs, chroma, &DecodingOptions::default().with_decoder("exact")).unwrap();
    assert_eq!(luma(&chosen)[0][0], 22);
    let unknown = handle.decode(&registry, cs, chroma, &DecodingOptions::default().with_decoder("absent")).unwrap();
    assert_eq!(luma(&unknown)[0][0], 11);

    let err = handle.decode(&DecoderRegistry::new(), cs, chroma, &DecodingOptions::default()).unwrap_err();
    assert_eq!(err.suberror(), SubError::UnsupportedCodec);
}

#[derive(Default)]
struct Recorder {
    events: Vec<(&'static str, ProgressStep, u32)>,
}

impl ProgressSink for Recorder {
    fn start(&mut self, step: ProgressStep, max_progress: u32) {
        self.events.push(("start", step, max_progress));
    }

    fn progress(&mut self, step: ProgressStep, progress: u32) {
        self.events.push(("progress", step, progress));
    }

    fn end(&mut self, step: ProgressStep) {
        self.events.push(("end", step, 0));
    }
}

impl Recorder {
    fn count(&self, kind: &str, step: ProgressStep) -> usize {
        self.events.iter().filter(|(k, s, _)| *k == kind && *s == step).count()
    }
}

#[test]
fn progress_events_are_balanced() {
    let file = grid_file(2, 2, (2, 2), (4, 4));
    let ctx = HeifContext::from_bytes(&file).unwrap();
    let handle = ctx.primary_image_handle().unwrap();
    let (cs, chroma) = keep_native();

    let mut recorder = Recorder::default();
    handle.decode_with_progress(&registry(), cs, chroma, &DecodingOptions::default(), &mut recorder).unwrap();
    assert_eq!(recorder.events.first(), Some(&("start", ProgressStep::Total, 3)));
    assert_eq!(recorder.events.last(), Some(&("end", ProgressStep::Total, 0)));
    assert_eq!(recorder.count("start", ProgressStep::LoadTile), 1);
    assert_eq!(recorder.count("end", ProgressStep::LoadTile), 1);
    assert_eq!(recorder.count("progress", ProgressStep::LoadTile), 4);

    let mut failed = Recorder::default();
    let result = handle.decode_with_progress(&DecoderRegistry::new(), cs, chroma, &DecodingOptions::default(), &mut failed);
    assert!(result.is_err());
    for step in [ProgressStep::Total, ProgressStep::LoadTile] {
        assert_eq!(failed.count("start", step), failed.count("end", step));
    }
}

// ============================================================================
// Robustness and configuration
// ============================================================================

#[test]
fn truncated_trailing_box_strict_and_lenient() {
    init_logger();
    let mut truncated = bx(b"free", &[0; 24]);
    truncated.truncate(12);
    let file = HeifBuilder::default()
        .item(1, b"hvc1", mono_payload(1, 1, |_, _| 0))
        .primary(1)
        .trailing(&truncated)
        .build();

    let err = HeifContext::from_bytes(&file).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Input);

    let config = ReadConfig::default().lenient(true);
    let ctx = HeifContext::from_bytes_with_config(&file, &config, &zenheif::Unstoppable).unwrap();
    assert_eq!(ctx.primary_image_id().unwrap(), 1);
    assert!(!ctx.warnings().is_empty());
}

#[test]
fn item_limit() {
    let file = HeifBuilder::default()
        .item(1, b"hvc1", mono_payload(1, 1, |_, _| 0))
        .item(2, b"hvc1", mono_payload(1, 1, |_, _| 0))
        .primary(1)
        .build();
    let config = ReadConfig::default().with_max_items(1);
    let err = HeifContext::from_bytes_with_config(&file, &config, &zenheif::Unstoppable).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Memory);
    assert!(HeifContext::from_bytes_with_config(&file, &ReadConfig::unlimited(), &zenheif::Unstoppable).is_ok());
}

#[test]
fn filetype_detection() {
    let file = HeifBuilder::default().item(1, b"hvc1", mono_payload(1, 1, |_, _| 0)).primary(1).build();
    assert_eq!(zenheif::check_filetype(&file), FileTypeResult::YesSupported);
    assert_eq!(zenheif::check_filetype(b"\0\0\0\x10ftypmsf1\0\0\0\0"), FileTypeResult::YesUnsupported);
    assert_eq!(zenheif::check_filetype(b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR"), FileTypeResult::No);
    assert_eq!(zenheif::check_filetype(b"\0\0\0"), FileTypeResult::Maybe);

    let not_heif = [bx(b"ftyp", b"isom\0\0\0\0mp41"), bx(b"mdat", &[0; 4])].concat();
    assert!(matches!(HeifContext::from_bytes(&not_heif), Err(zenheif::Error::UnsupportedFiletype(_))));
}
