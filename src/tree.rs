// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flat, index-linked tree of every box in the file.
//!
//! Parsing walks an explicit worklist rather than recursing, so hostile
//! nesting costs heap entries bounded by [`MAX_BOX_DEPTH`] instead of stack.

use crate::boxes::{read_box_header, BoxType, FourCC};
use crate::{usize_from_u64, Error, ParseOptions, Result, SubError, TryVec, Warning};
use log::{debug, trace};
use std::ops::Range;

/// Boxes nested deeper than this are rejected.
pub(crate) const MAX_BOX_DEPTH: u32 = 32;

#[derive(Debug)]
pub(crate) struct BoxNode {
    pub name: BoxType,
    /// Offset of the box header in the file.
    pub start: usize,
    /// Everything after the header, clamped to the enclosing box.
    pub payload: Range<usize>,
    pub depth: u32,
    pub parent: Option<usize>,
    pub children: TryVec<usize>,
}

impl BoxNode {
    pub fn fourcc(&self) -> FourCC {
        FourCC::from(self.name)
    }
}

#[derive(Debug, Default)]
pub(crate) struct BoxTree {
    nodes: TryVec<BoxNode>,
    roots: TryVec<usize>,
}

struct Space {
    start: usize,
    end: usize,
    depth: u32,
    parent: Option<usize>,
}

/// Bytes that precede the child boxes of a container, or `None` for leaf boxes.
fn container_prefix(name: BoxType, payload: &[u8]) -> Option<usize> {
    match name {
        BoxType::MetadataBox | BoxType::ImageReferenceBox => Some(4),
        // full box header then a 16- or 32-bit entry count
        BoxType::ItemInfoBox => Some(match payload.first() {
            Some(0) => 6,
            _ => 8,
        }),
        BoxType::ImagePropertiesBox
        | BoxType::ItemPropertyContainerBox
        | BoxType::DataInformationBox
        | BoxType::GroupsListBox
        | BoxType::MovieBox
        | BoxType::TrackBox
        | BoxType::MediaBox
        | BoxType::MediaInformationBox
        | BoxType::SampleTableBox => Some(0),
        _ => None,
    }
}

impl BoxTree {
    /// Parse every box in `data`.
    ///
    /// Truncated boxes and trailing garbage fail in strict mode; in lenient
    /// mode they are clamped to what is present and recorded in `warnings`.
    pub fn parse(
        data: &[u8],
        options: &ParseOptions,
        stop: &dyn enough::Stop,
        warnings: &mut TryVec<Warning>,
    ) -> Result<Self> {
        let mut tree = Self::default();
        let mut pending = TryVec::new();
        pending.push(Space { start: 0, end: data.len(), depth: 0, parent: None })?;

        while let Some(space) = pending.pop() {
            let mut pos = space.start;
            while pos < space.end {
                if space.depth == 0 {
                    stop.check()?;
                }
                let remaining = space.end - pos;
                if remaining < 8 {
                    options.recover(warnings, Warning::new(SubError::EndOfData, "trailing bytes too short for a box"))?;
                    break;
                }

                let mut src = &data[pos..space.end];
                let head = match read_box_header(&mut src) {
                    Ok(head) => head,
                    Err(Error::UnexpectedEOF) => {
                        options.recover(warnings, Warning::new(SubError::EndOfData, "truncated box header"))?;
                        break;
                    },
                    Err(e) => return Err(e),
                };
                let size = match head.size {
                    Some(size) => size,
                    None if space.depth == 0 => remaining as u64,
                    None => {
                        return Err(Error::InvalidData(SubError::InvalidBoxSize, "size 0 is only valid for top-level boxes"));
                    },
                };
                if space.depth >= MAX_BOX_DEPTH {
                    return Err(Error::InvalidData(SubError::BoxNestingTooDeep, "boxes nested too deeply"));
                }

                let end = if size > remaining as u64 {
                    options.recover(
                        warnings,
                        Warning::new(SubError::EndOfData, "box extends past the end of its parent"),
                    )?;
                    space.end
                } else {
                    pos + usize_from_u64(size)?
                };
                let payload_start = (pos + usize_from_u64(head.offset)?).min(end);

                let index = tree.nodes.len();
                trace!("box {:?} at {pos}, {} bytes, depth {}", head.name, end - pos, space.depth);
                tree.nodes.push(BoxNode {
                    name: head.name,
                    start: pos,
                    payload: payload_start..end,
                    depth: space.depth,
                    parent: space.parent,
                    children: TryVec::new(),
                })?;
                match space.parent {
                    Some(parent) => tree.nodes[parent].children.push(index)?,
                    None => tree.roots.push(index)?,
                }

                if let Some(prefix) = container_prefix(head.name, &data[payload_start..end]) {
                    let child_start = payload_start + prefix;
                    if child_start <= end {
                        pending.push(Space { start: child_start, end, depth: space.depth + 1, parent: Some(index) })?;
                    } else {
                        options.recover(
                            warnings,
                            Warning::new(SubError::EndOfData, "container box too short for its header"),
                        )?;
                    }
                }

                pos = end;
            }
        }

        debug!("parsed {} boxes ({} top-level)", tree.nodes.len(), tree.roots.len());
        Ok(tree)
    }

    pub fn node(&self, index: usize) -> &BoxNode {
        &self.nodes[index]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn roots(&self) -> impl Iterator<Item = (usize, &BoxNode)> + '_ {
        self.roots.iter().map(move |&i| (i, &self.nodes[i]))
    }

    pub fn children(&self, index: usize) -> impl Iterator<Item = (usize, &BoxNode)> + '_ {
        self.nodes[index].children.iter().map(move |&i| (i, &self.nodes[i]))
    }

    /// Top-level boxes of the given type, in file order.
    pub fn find_roots(&self, name: BoxType) -> impl Iterator<Item = (usize, &BoxNode)> + '_ {
        self.roots().filter(move |(_, n)| n.name == name)
    }

    /// Children of `index` with the given type, in file order.
    pub fn find_children(&self, index: usize, name: BoxType) -> impl Iterator<Item = (usize, &BoxNode)> + '_ {
        self.children(index).filter(move |(_, n)| n.name == name)
    }
}

#[cfg(test)]
fn boxed(name: &[u8; 4], payload: &[u8]) -> std::vec::Vec<u8> {
    let mut out = std::vec::Vec::new();
    out.extend_from_slice(&(payload.len() as u32 + 8).to_be_bytes());
    out.extend_from_slice(name);
    out.extend_from_slice(payload);
    out
}

#[test]
fn nested_containers() {
    let ispe = boxed(b"ispe", &[0; 12]);
    let ipco = boxed(b"ipco", &ispe);
    let iprp = boxed(b"iprp", &ipco);
    let mut meta_payload = vec![0u8; 4];
    meta_payload.extend_from_slice(&iprp);
    let mut file = boxed(b"ftyp", b"heic\0\0\0\0mif1");
    file.extend_from_slice(&boxed(b"meta", &meta_payload));

    let mut warnings = TryVec::new();
    let tree = BoxTree::parse(&file, &ParseOptions::default(), &enough::Unstoppable, &mut warnings).unwrap();
    assert_eq!(tree.len(), 5);
    let (meta, _) = tree.find_roots(BoxType::MetadataBox).next().unwrap();
    let (iprp, _) = tree.find_children(meta, BoxType::ImagePropertiesBox).next().unwrap();
    let (ipco, node) = tree.find_children(iprp, BoxType::ItemPropertyContainerBox).next().unwrap();
    assert_eq!(node.depth, 2);
    let (_, ispe) = tree.children(ipco).next().unwrap();
    assert_eq!(ispe.name, BoxType::ImageSpatialExtentsBox);
    assert_eq!(ispe.payload.len(), 12);
    assert_eq!(ispe.parent, Some(ipco));
    assert!(warnings.is_empty());
}

#[test]
fn truncated_box_strict_and_lenient() {
    let mut file = boxed(b"ftyp", b"heic\0\0\0\0mif1");
    let mut truncated = boxed(b"mdat", &[7; 32]);
    truncated.truncate(20);
    file.extend_from_slice(&truncated);

    let mut warnings = TryVec::new();
    assert!(BoxTree::parse(&file, &ParseOptions::default(), &enough::Unstoppable, &mut warnings).is_err());

    let lenient = ParseOptions { lenient: true };
    let tree = BoxTree::parse(&file, &lenient, &enough::Unstoppable, &mut warnings).unwrap();
    let (_, mdat) = tree.find_roots(BoxType::MediaDataBox).next().unwrap();
    assert_eq!(mdat.payload.end, file.len());
    assert_eq!(warnings.len(), 1);
}

#[test]
fn nesting_limit() {
    let mut inner = boxed(b"free", &[]);
    for _ in 0..40 {
        inner = boxed(b"ipco", &inner);
    }
    let mut warnings = TryVec::new();
    let err = BoxTree::parse(&inner, &ParseOptions { lenient: true }, &enough::Unstoppable, &mut warnings).unwrap_err();
    assert_eq!(err.suberror(), SubError::BoxNestingTooDeep);
}

#[test]
fn size_zero_only_at_top_level() {
    let mut nested = std::vec::Vec::new();
    nested.extend_from_slice(&0u32.to_be_bytes());
    nested.extend_from_slice(b"free");
    let file = boxed(b"ipco", &nested);
    let mut warnings = TryVec::new();
    assert!(BoxTree::parse(&file, &ParseOptions::default(), &enough::Unstoppable, &mut warnings).is_err());

    let mut top = boxed(b"ftyp", b"heic\0\0\0\0");
    top.extend_from_slice(&nested);
    top.extend_from_slice(&[1, 2, 3]);
    let tree = BoxTree::parse(&top, &ParseOptions::default(), &enough::Unstoppable, &mut warnings).unwrap();
    assert_eq!(tree.roots().count(), 2);
}
