// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `colr` property parsing and the NCLX (ITU-T H.273) code points.

use crate::boxes::FourCC;
use crate::{be_u16, be_u32, Error, Result, SubError};
use byteorder::ReadBytesExt;
use log::{debug, warn};
use std::ops::Range;

/// Which kind of color profile an image carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorProfileType {
    NotPresent,
    Nclx,
    /// Restricted ICC profile
    Ricc,
    /// Unrestricted ICC profile
    Prof,
}

impl ColorProfileType {
    pub fn fourcc(self) -> Option<FourCC> {
        match self {
            Self::NotPresent => None,
            Self::Nclx => Some(FourCC::new(b"nclx")),
            Self::Ricc => Some(FourCC::new(b"rICC")),
            Self::Prof => Some(FourCC::new(b"prof")),
        }
    }
}

macro_rules! code_points {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $value:literal),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),*
        }

        impl $name {
            pub fn code(self) -> u16 {
                match self {
                    $(Self::$variant => $value),*
                }
            }

            /// Unknown code points map to `Unspecified`.
            pub fn from_code(code: u16) -> Self {
                match code {
                    $($value => Self::$variant),*,
                    _ => {
                        warn!("unknown {} code point {code}", stringify!($name));
                        Self::Unspecified
                    },
                }
            }
        }
    };
}

code_points!(
    /// Color primaries, H.273 table 2
    ColorPrimaries {
        Bt709 = 1,
        Unspecified = 2,
        Bt470M = 4,
        Bt470Bg = 5,
        Bt601 = 6,
        Smpte240 = 7,
        GenericFilm = 8,
        Bt2020 = 9,
        Xyz = 10,
        Smpte431 = 11,
        Smpte432 = 12,
        Ebu3213 = 22,
    }
);

code_points!(
    /// Transfer characteristics, H.273 table 3
    TransferCharacteristics {
        Bt709 = 1,
        Unspecified = 2,
        Bt470M = 4,
        Bt470Bg = 5,
        Bt601 = 6,
        Smpte240 = 7,
        Linear = 8,
        Log100 = 9,
        Log100Sqrt10 = 10,
        Iec61966 = 11,
        Bt1361 = 12,
        Srgb = 13,
        Bt2020Ten = 14,
        Bt2020Twelve = 15,
        Pq = 16,
        Smpte428 = 17,
        Hlg = 18,
    }
);

code_points!(
    /// Matrix coefficients, H.273 table 4
    MatrixCoefficients {
        Identity = 0,
        Bt709 = 1,
        Unspecified = 2,
        Fcc = 4,
        Bt470Bg = 5,
        Bt601 = 6,
        Smpte240 = 7,
        YCgCo = 8,
        Bt2020Ncl = 9,
        Bt2020Cl = 10,
        Smpte2085 = 11,
        ChromaDerivedNcl = 12,
        ChromaDerivedCl = 13,
        ICtCp = 14,
    }
);

/// CIE 1931 xy coordinates of the primaries and white point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Chromaticities {
    pub red: (f32, f32),
    pub green: (f32, f32),
    pub blue: (f32, f32),
    pub white: (f32, f32),
}

const D65: (f32, f32) = (0.3127, 0.3290);
const ILLUMINANT_C: (f32, f32) = (0.310, 0.316);

/// Code-point based color description from a `colr` box of type `nclx`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NclxColorProfile {
    pub color_primaries: ColorPrimaries,
    pub transfer_characteristics: TransferCharacteristics,
    pub matrix_coefficients: MatrixCoefficients,
    pub full_range: bool,
}

impl Default for NclxColorProfile {
    /// sRGB primaries and transfer, BT.601 matrix, full range.
    fn default() -> Self {
        Self {
            color_primaries: ColorPrimaries::Bt709,
            transfer_characteristics: TransferCharacteristics::Srgb,
            matrix_coefficients: MatrixCoefficients::Bt601,
            full_range: true,
        }
    }
}

impl NclxColorProfile {
    /// `None` when the primaries are unspecified.
    pub fn chromaticities(&self) -> Option<Chromaticities> {
        let (red, green, blue, white) = match self.color_primaries {
            ColorPrimaries::Bt709 => ((0.640, 0.330), (0.300, 0.600), (0.150, 0.060), D65),
            ColorPrimaries::Bt470M => ((0.67, 0.33), (0.21, 0.71), (0.14, 0.08), ILLUMINANT_C),
            ColorPrimaries::Bt470Bg => ((0.64, 0.33), (0.29, 0.60), (0.15, 0.06), D65),
            ColorPrimaries::Bt601 | ColorPrimaries::Smpte240 => {
                ((0.630, 0.340), (0.310, 0.595), (0.155, 0.070), D65)
            },
            ColorPrimaries::GenericFilm => ((0.681, 0.319), (0.243, 0.692), (0.145, 0.049), ILLUMINANT_C),
            ColorPrimaries::Bt2020 => ((0.708, 0.292), (0.170, 0.797), (0.131, 0.046), D65),
            ColorPrimaries::Xyz => ((1.0, 0.0), (0.0, 1.0), (0.0, 0.0), (1.0 / 3.0, 1.0 / 3.0)),
            ColorPrimaries::Smpte431 => ((0.680, 0.320), (0.265, 0.690), (0.150, 0.060), (0.314, 0.351)),
            ColorPrimaries::Smpte432 => ((0.680, 0.320), (0.265, 0.690), (0.150, 0.060), D65),
            ColorPrimaries::Ebu3213 => ((0.630, 0.340), (0.295, 0.605), (0.155, 0.077), D65),
            ColorPrimaries::Unspecified => return None,
        };
        Some(Chromaticities { red, green, blue, white })
    }
}

/// How YCbCr relates to RGB for a given profile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum YCbCrMatrix {
    /// Y=G, Cb=B, Cr=R
    Identity,
    KrKb { kr: f32, kb: f32 },
}

impl YCbCrMatrix {
    pub(crate) fn for_profile(nclx: &NclxColorProfile) -> Result<Self> {
        let (kr, kb) = match nclx.matrix_coefficients {
            MatrixCoefficients::Identity => return Ok(Self::Identity),
            MatrixCoefficients::Bt709 | MatrixCoefficients::Unspecified => (0.2126, 0.0722),
            MatrixCoefficients::Bt470Bg | MatrixCoefficients::Bt601 => (0.299, 0.114),
            MatrixCoefficients::Fcc => (0.30, 0.11),
            MatrixCoefficients::Smpte240 => (0.212, 0.087),
            MatrixCoefficients::Bt2020Ncl | MatrixCoefficients::Bt2020Cl => (0.2627, 0.0593),
            MatrixCoefficients::ChromaDerivedNcl | MatrixCoefficients::ChromaDerivedCl => {
                match nclx.chromaticities() {
                    Some(c) => kr_kb_from_primaries(&c),
                    None => (0.2126, 0.0722),
                }
            },
            MatrixCoefficients::YCgCo | MatrixCoefficients::Smpte2085 | MatrixCoefficients::ICtCp => {
                return Err(Error::Unsupported(
                    SubError::UnsupportedColorConversion,
                    "matrix coefficients not supported for conversion",
                ));
            },
        };
        Ok(Self::KrKb { kr, kb })
    }
}

/// H.273 equations 39 and 40.
fn kr_kb_from_primaries(c: &Chromaticities) -> (f32, f32) {
    let z = |(x, y): (f32, f32)| 1.0 - (x + y);
    let (xr, yr) = c.red;
    let (xg, yg) = c.green;
    let (xb, yb) = c.blue;
    let (xw, yw) = c.white;
    let (zr, zg, zb, zw) = (z(c.red), z(c.green), z(c.blue), z(c.white));

    let denom = yw * (xr * (yg * zb - yb * zg) + xg * (yb * zr - yr * zb) + xb * (yr * zg - yg * zr));
    if denom == 0.0 {
        return (0.2126, 0.0722);
    }
    let kr = yr * (xw * (yg * zb - yb * zg) + yw * (xb * zg - xg * zb) + zw * (xg * yb - xb * yg)) / denom;
    let kb = yb * (xw * (yr * zg - yg * zr) + yw * (xg * zr - xr * zg) + zw * (xr * yg - xg * yr)) / denom;
    (kr, kb)
}

/// Parsed `colr` property. ICC bytes stay in the file and are referenced by range.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ColourInformation {
    Nclx(NclxColorProfile),
    Icc { profile_type: ColorProfileType, data: Range<usize> },
}

/// Parse a Colour Information Box. `base` is the file offset of `src`.
/// See ISO 14496-12:2015 § 12.1.5
pub(crate) fn read_colr(mut src: &[u8], base: usize) -> Result<Option<ColourInformation>> {
    let payload_len = src.len();
    let colour_type = FourCC::from(be_u32(&mut src)?);
    let info = match &colour_type.value {
        b"nclx" => {
            let color_primaries = ColorPrimaries::from_code(be_u16(&mut src)?);
            let transfer_characteristics = TransferCharacteristics::from_code(be_u16(&mut src)?);
            let matrix_coefficients = MatrixCoefficients::from_code(be_u16(&mut src)?);
            let full_range = src.read_u8()? & 0x80 != 0;
            ColourInformation::Nclx(NclxColorProfile {
                color_primaries,
                transfer_characteristics,
                matrix_coefficients,
                full_range,
            })
        },
        b"rICC" | b"prof" => {
            let profile_type = if colour_type == b"rICC" { ColorProfileType::Ricc } else { ColorProfileType::Prof };
            let start = base + (payload_len - src.len());
            ColourInformation::Icc { profile_type, data: start..base + payload_len }
        },
        _ => {
            debug!("ignoring colr of type {colour_type}");
            return Ok(None);
        },
    };
    Ok(Some(info))
}

#[test]
fn chroma_derived_matches_bt709() {
    let nclx = NclxColorProfile {
        matrix_coefficients: MatrixCoefficients::ChromaDerivedNcl,
        ..NclxColorProfile::default()
    };
    match YCbCrMatrix::for_profile(&nclx).unwrap() {
        YCbCrMatrix::KrKb { kr, kb } => {
            assert!((kr - 0.2126).abs() < 0.001, "{kr}");
            assert!((kb - 0.0722).abs() < 0.001, "{kb}");
        },
        YCbCrMatrix::Identity => panic!("identity"),
    }
}

#[test]
fn unsupported_matrices() {
    let ycgco = NclxColorProfile { matrix_coefficients: MatrixCoefficients::YCgCo, ..NclxColorProfile::default() };
    let err = YCbCrMatrix::for_profile(&ycgco).unwrap_err();
    assert_eq!(err.suberror(), SubError::UnsupportedColorConversion);
    assert_eq!(MatrixCoefficients::from_code(3), MatrixCoefficients::Unspecified);
}

#[test]
fn colr_parsing() {
    let nclx = b"nclx\0\x09\0\x10\0\x09\x80";
    let info = read_colr(nclx, 100).unwrap().unwrap();
    assert_eq!(
        info,
        ColourInformation::Nclx(NclxColorProfile {
            color_primaries: ColorPrimaries::Bt2020,
            transfer_characteristics: TransferCharacteristics::Pq,
            matrix_coefficients: MatrixCoefficients::Bt2020Ncl,
            full_range: true,
        })
    );
    let icc = b"prof\x01\x02\x03";
    let info = read_colr(icc, 100).unwrap().unwrap();
    assert_eq!(info, ColourInformation::Icc { profile_type: ColorProfileType::Prof, data: 104..107 });
    assert!(read_colr(b"abcd", 0).unwrap().is_none());
}
