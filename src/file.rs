//! JPEG marker segment parser.
//!
//! Only the segments needed to locate and entropy-decode the coefficients are interpreted (tables,
//! frame and scan headers, restart intervals). Everything else, including `APPn` and `COM`, is
//! skipped by its length and surfaces as a [`Segment`] without a [`SegmentKind`].

#![allow(non_snake_case)]


use std::{fmt, mem};

use bytemuck::{AnyBitPattern, Pod, Zeroable};

use crate::error::{Error, Result};

/// Marker codes (the byte following `0xFF`).
mod marker {
    pub const TEM: u8 = 0x01;
    pub const DHT: u8 = 0xC4;
    pub const RST0: u8 = 0xD0;
    pub const RST7: u8 = 0xD7;
    pub const SOI: u8 = 0xD8;
    pub const EOI: u8 = 0xD9;
    pub const SOS: u8 = 0xDA;
    pub const DQT: u8 = 0xDB;
    pub const DRI: u8 = 0xDD;
}

pub struct JpegParser<'a> {
    reader: Reader<'a>,
}

impl<'a> JpegParser<'a> {
    pub fn new(buf: &'a [u8]) -> Result<Self> {
        let mut reader = Reader { buf, position: 0 };
        if reader.read_u8()? != 0xFF || reader.read_u8()? != marker::SOI {
            return Err(Error::malformed("JPEG image does not start with SOI marker"));
        }
        Ok(Self { reader })
    }

    /// Continues parsing `buf` at `offset`, which must be the [`Segment::offset`] of a segment
    /// previously read from the same buffer.
    pub fn resume(buf: &'a [u8], offset: usize) -> Self {
        Self {
            reader: Reader {
                buf,
                position: offset.min(buf.len()),
            },
        }
    }

    /// Reads the next [`Segment`].
    ///
    /// `SOI`, `EOI`, `TEM` and stray `RSTn` markers carry no segment and are never returned.
    /// Returns `Ok(None)` once the EOI marker has been consumed.
    pub fn next_segment(&mut self) -> Result<Option<Segment<'a>>> {
        loop {
            while self.reader.read_u8()? != 0xFF {}
            let offset = self.reader.position - 1;

            let mut code = self.reader.read_u8()?;
            while code == 0xFF {
                code = self.reader.read_u8()?;
            }

            match code {
                0x00 => return Err(Error::malformed("invalid ff 00 marker")),
                marker::SOI => return Err(Error::malformed("unexpected SOI marker")),
                marker::EOI => {
                    let trailing = self.reader.remaining().len();
                    if trailing != 0 {
                        log::warn!("ignoring {trailing} trailing bytes after EOI");
                    }
                    return Ok(None);
                }
                marker::TEM | marker::RST0..=marker::RST7 => {
                    log::warn!("skipping stray ff {code:02x} marker at offset {offset}");
                }
                _ => return self.read_segment(offset, code).map(Some),
            }
        }
    }

    fn read_segment(&mut self, offset: usize, code: u8) -> Result<Segment<'a>> {
        let length = usize::from(self.reader.read_length()?);
        let start = self.reader.position;
        let end = start + length;
        let mut body = Reader {
            buf: &self.reader.buf[..end],
            position: start,
        };

        let kind = match code {
            marker::DQT => Some(SegmentKind::Dqt(read_dqt(&mut body)?)),
            marker::DHT => Some(SegmentKind::Dht(read_dht(&mut body)?)),
            0xC0..=0xC3 | 0xC5..=0xC7 | 0xC9..=0xCB | 0xCD..=0xCF => {
                Some(SegmentKind::Sof(read_sof(code, &mut body)?))
            }
            marker::SOS => Some(SegmentKind::Sos(self.read_sos(&mut body, end)?)),
            marker::DRI => Some(SegmentKind::Dri(Dri {
                Ri: body.read_u16()?,
            })),
            _ => {
                body.position = end;
                None
            }
        };

        if body.position < end {
            log::warn!(
                "ff {code:02x} segment has {} unused bytes at the end",
                end - body.position
            );
        }
        // SOS has already moved the main reader past its entropy-coded data.
        if code != marker::SOS {
            self.reader.position = end;
        }

        Ok(Segment {
            marker: code,
            raw_bytes: &self.reader.buf[start..end],
            offset,
            kind,
        })
    }

    fn read_sos(&mut self, header: &mut Reader<'a>, header_end: usize) -> Result<Sos<'a>> {
        let num_components = header.read_u8()?;
        let components = header.read_objs(num_components.into())?;
        let Ss = header.read_u8()?;
        let Se = header.read_u8()?;
        let AhAl = header.read_u8()?;

        let data = &self.reader.buf[header_end..];
        let len = entropy_coded_len(data)?;
        self.reader.position = header_end + len;

        Ok(Sos {
            components,
            Ss,
            Se,
            AhAl,
            data: &data[..len],
        })
    }
}

/// Returns the length of the entropy-coded data at the start of `buf`.
///
/// Stuffed `FF 00` bytes and `RSTn` markers belong to the data. It ends at the first `0xFF` of any
/// other marker, including fill bytes in front of it.
fn entropy_coded_len(buf: &[u8]) -> Result<usize> {
    let mut pos = 0;
    loop {
        let Some(ff) = buf[pos..].iter().position(|&b| b == 0xFF) else {
            return Err(unexpected_end());
        };
        let marker_start = pos + ff;
        let Some(fill) = buf[marker_start..].iter().position(|&b| b != 0xFF) else {
            return Err(unexpected_end());
        };
        let code = marker_start + fill;
        match buf[code] {
            0x00 | marker::RST0..=marker::RST7 => pos = code + 1,
            _ => return Ok(marker_start),
        }
    }
}

fn read_dqt(body: &mut Reader<'_>) -> Result<Dqt> {
    let mut tables = Vec::new();
    while !body.remaining().is_empty() {
        let PqTq = body.read_u8()?;
        let mut Qk = [0; 64];
        match PqTq >> 4 {
            0 => {
                for (q, &byte) in Qk.iter_mut().zip(body.read_slice(64)?) {
                    *q = u16::from(byte);
                }
            }
            1 => {
                for q in &mut Qk {
                    *q = body.read_u16()?;
                }
            }
            Pq => {
                return Err(Error::malformed(format!(
                    "invalid quantization table precision Pq={Pq} (only 0 and 1 are allowed)"
                )))
            }
        }
        tables.push(QuantizationTable { PqTq, Qk });
    }
    Ok(Dqt(tables))
}

fn read_dht<'a>(body: &mut Reader<'a>) -> Result<Dht<'a>> {
    let mut tables = Vec::new();
    while !body.remaining().is_empty() {
        let header: &DhtHeader = body.read_obj()?;
        let count = header.Li.iter().map(|&n| usize::from(n)).sum();
        tables.push(HuffmanTable {
            header,
            Vij: body.read_slice(count)?,
        });
    }
    Ok(Dht { tables })
}

fn read_sof<'a>(code: u8, body: &mut Reader<'a>) -> Result<Sof<'a>> {
    let P = body.read_u8()?;
    let Y = body.read_u16()?;
    let X = body.read_u16()?;
    let num_components = body.read_u8()?;
    Ok(Sof {
        sof: SofMarker(code),
        P,
        Y,
        X,
        components: body.read_objs(num_components.into())?,
    })
}

struct Reader<'a> {
    buf: &'a [u8],
    position: usize,
}

fn unexpected_end() -> Error {
    Error::malformed("reached end of data while decoding JPEG stream")
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> &'a [u8] {
        &self.buf[self.position..]
    }

    fn read_u8(&mut self) -> Result<u8> {
        let byte = *self.buf.get(self.position).ok_or_else(unexpected_end)?;
        self.position += 1;
        Ok(byte)
    }

    fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes([self.read_u8()?, self.read_u8()?]))
    }

    fn read_slice(&mut self, count: usize) -> Result<&'a [u8]> {
        let slice = self.remaining().get(..count).ok_or_else(unexpected_end)?;
        self.position += count;
        Ok(slice)
    }

    fn read_obj<T: AnyBitPattern>(&mut self) -> Result<&'a T> {
        assert_eq!(mem::align_of::<T>(), 1);
        Ok(bytemuck::from_bytes(self.read_slice(mem::size_of::<T>())?))
    }

    fn read_objs<T: AnyBitPattern>(&mut self, count: usize) -> Result<&'a [T]> {
        assert_eq!(mem::align_of::<T>(), 1);
        Ok(bytemuck::cast_slice(
            self.read_slice(count * mem::size_of::<T>())?,
        ))
    }

    /// Reads a segment length and returns the number of bytes that follow it.
    fn read_length(&mut self) -> Result<u16> {
        // The length counts itself, but not the marker.
        let len = self.read_u16()?;
        if len < 2 {
            return Err(Error::malformed(format!("invalid segment length {len}")));
        }
        if self.remaining().len() < usize::from(len - 2) {
            return Err(unexpected_end());
        }
        Ok(len - 2)
    }
}

/// A marker segment: the `0xFF 0xXX` marker, its length, and its parameters.
#[derive(Debug)]
pub struct Segment<'a> {
    marker: u8,
    raw_bytes: &'a [u8],
    offset: usize,
    kind: Option<SegmentKind<'a>>,
}

impl<'a> Segment<'a> {
    /// Offset of the segment's `0xFF` byte in the input.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn marker(&self) -> u8 {
        self.marker
    }

    /// The segment parameters, without marker and length. Excludes the entropy-coded data of a
    /// scan.
    #[inline]
    pub fn raw_bytes(&self) -> &'a [u8] {
        self.raw_bytes
    }

    /// The interpreted segment, or `None` for segments that are skipped.
    #[inline]
    pub fn into_segment_kind(self) -> Option<SegmentKind<'a>> {
        self.kind
    }
}

#[derive(Debug)]
pub enum SegmentKind<'a> {
    Dqt(Dqt),
    Dht(Dht<'a>),
    Dri(Dri),
    Sof(Sof<'a>),
    Sos(Sos<'a>),
}

/// A quantization table as stored in the stream (zigzag order, 8- or 16-bit precision).
#[derive(Clone, Copy)]
pub struct QuantizationTable {
    PqTq: u8,
    Qk: [u16; 64],
}

impl QuantizationTable {
    /// Element precision: 0 for 8-bit, 1 for 16-bit values.
    #[inline]
    pub fn Pq(&self) -> u8 {
        self.PqTq >> 4
    }

    /// Destination slot (0-3 are valid).
    #[inline]
    pub fn Tq(&self) -> u8 {
        self.PqTq & 0xf
    }

    /// Table elements in zigzag order, widened to 16 bits.
    #[inline]
    pub fn Qk(&self) -> &[u16; 64] {
        &self.Qk
    }
}

impl fmt::Debug for QuantizationTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuantizationTable")
            .field("Pq", &self.Pq())
            .field("Tq", &self.Tq())
            .field("Qk", &self.Qk)
            .finish()
    }
}

/// `DQT`: one or more quantization tables.
#[derive(Debug)]
pub struct Dqt(Vec<QuantizationTable>);

impl Dqt {
    #[inline]
    pub fn tables(&self) -> impl Iterator<Item = &QuantizationTable> {
        self.0.iter()
    }
}

#[derive(Clone, Copy, AnyBitPattern)]
#[repr(C)]
struct DhtHeader {
    TcTh: u8,
    Li: [u8; 16],
}

pub struct HuffmanTable<'a> {
    header: &'a DhtHeader,
    Vij: &'a [u8],
}

impl<'a> HuffmanTable<'a> {
    /// Table class: 0 for DC, 1 for AC.
    #[inline]
    pub fn Tc(&self) -> u8 {
        self.header.TcTh >> 4
    }

    /// Destination slot (0-3 are valid).
    #[inline]
    pub fn Th(&self) -> u8 {
        self.header.TcTh & 0xf
    }

    /// Number of codes of each length from 1 to 16 bits.
    #[inline]
    pub fn Li(&self) -> &[u8; 16] {
        &self.header.Li
    }

    /// Symbol values, in order of increasing code length.
    #[inline]
    pub fn Vij(&self) -> &[u8] {
        self.Vij
    }
}

impl<'a> fmt::Debug for HuffmanTable<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HuffmanTable")
            .field("Tc", &self.Tc())
            .field("Th", &self.Th())
            .field("Li", &self.Li())
            .field("Vij", &self.Vij)
            .finish()
    }
}

/// `DHT`: one or more Huffman tables.
#[derive(Debug)]
pub struct Dht<'a> {
    tables: Vec<HuffmanTable<'a>>,
}

impl<'a> Dht<'a> {
    pub fn tables(&self) -> impl Iterator<Item = &HuffmanTable<'a>> {
        self.tables.iter()
    }
}

/// `DRI`: sets the restart interval for the following scans.
#[derive(Debug, Clone, Copy)]
pub struct Dri {
    Ri: u16,
}

impl Dri {
    /// MCUs per restart interval; 0 disables restart markers.
    #[inline]
    pub fn Ri(&self) -> u16 {
        self.Ri
    }
}

/// `SOFn`: the frame header.
#[derive(Debug)]
pub struct Sof<'a> {
    sof: SofMarker,
    P: u8,
    Y: u16,
    X: u16,
    components: &'a [FrameComponent],
}

impl<'a> Sof<'a> {
    /// The marker, which selects the coding process.
    #[inline]
    pub fn sof(&self) -> SofMarker {
        self.sof
    }

    /// Sample precision in bits.
    #[inline]
    pub fn P(&self) -> u8 {
        self.P
    }

    /// Image height in lines.
    #[inline]
    pub fn Y(&self) -> u16 {
        self.Y
    }

    /// Image width in samples.
    #[inline]
    pub fn X(&self) -> u16 {
        self.X
    }

    #[inline]
    pub fn components(&self) -> &'a [FrameComponent] {
        self.components
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SofMarker(u8);

impl SofMarker {
    /// Baseline DCT.
    pub const SOF0: Self = Self(0xC0);
    /// Extended sequential DCT, Huffman coding.
    pub const SOF1: Self = Self(0xC1);
    /// Progressive DCT, Huffman coding.
    pub const SOF2: Self = Self(0xC2);

    fn name(self) -> Option<&'static str> {
        const NAMES: [Option<&str>; 16] = [
            Some("SOF0"),
            Some("SOF1"),
            Some("SOF2"),
            Some("SOF3"),
            None, // DHT
            Some("SOF5"),
            Some("SOF6"),
            Some("SOF7"),
            None, // JPG
            Some("SOF9"),
            Some("SOF10"),
            Some("SOF11"),
            None, // DAC
            Some("SOF13"),
            Some("SOF14"),
            Some("SOF15"),
        ];
        NAMES.get(usize::from(self.0.wrapping_sub(0xC0))).copied().flatten()
    }
}

impl fmt::Debug for SofMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "SofMarker({:02x})", self.0),
        }
    }
}

#[derive(Clone, Copy, Zeroable, Pod)]
#[repr(C)]
pub struct FrameComponent {
    Ci: u8,
    HiVi: u8,
    Tqi: u8,
}

impl FrameComponent {
    /// Component identifier, referenced by scan headers.
    #[inline]
    pub fn Ci(&self) -> u8 {
        self.Ci
    }

    /// Horizontal sampling factor.
    #[inline]
    pub fn Hi(&self) -> u8 {
        self.HiVi >> 4
    }

    /// Vertical sampling factor.
    #[inline]
    pub fn Vi(&self) -> u8 {
        self.HiVi & 0xf
    }

    /// Quantization table slot.
    #[inline]
    pub fn Tqi(&self) -> u8 {
        self.Tqi
    }
}

impl fmt::Debug for FrameComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameComponent")
            .field("Ci", &self.Ci)
            .field("Hi", &self.Hi())
            .field("Vi", &self.Vi())
            .field("Tqi", &self.Tqi)
            .finish()
    }
}

/// `SOS`: a scan header together with the entropy-coded data that follows it.
pub struct Sos<'a> {
    components: &'a [ScanComponent],
    Ss: u8,
    Se: u8,
    AhAl: u8,
    data: &'a [u8],
}

impl<'a> Sos<'a> {
    #[inline]
    pub fn components(&self) -> &'a [ScanComponent] {
        self.components
    }

    /// First coefficient of the spectral band, in zigzag order.
    #[inline]
    pub fn Ss(&self) -> u8 {
        self.Ss
    }

    /// Last coefficient of the spectral band.
    #[inline]
    pub fn Se(&self) -> u8 {
        self.Se
    }

    /// Successive approximation bit position of the previous scan, 0 on the first one.
    #[inline]
    pub fn Ah(&self) -> u8 {
        self.AhAl >> 4
    }

    /// Point transform.
    #[inline]
    pub fn Al(&self) -> u8 {
        self.AhAl & 0xf
    }

    /// Entropy-coded data, still byte-stuffed and including any `RSTn` markers.
    #[inline]
    pub fn data(&self) -> &'a [u8] {
        self.data
    }
}

impl<'a> fmt::Debug for Sos<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sos")
            .field("components", &self.components)
            .field("Ss", &self.Ss)
            .field("Se", &self.Se)
            .field("Ah", &self.Ah())
            .field("Al", &self.Al())
            .field("data", &self.data)
            .finish()
    }
}

#[derive(Clone, Copy, AnyBitPattern)]
#[repr(C)]
pub struct ScanComponent {
    Csj: u8,
    TdjTaj: u8,
}

impl ScanComponent {
    /// Frame component identifier ([`FrameComponent::Ci`]).
    #[inline]
    pub fn Csj(&self) -> u8 {
        self.Csj
    }

    /// DC Huffman table slot.
    #[inline]
    pub fn Tdj(&self) -> u8 {
        self.TdjTaj >> 4
    }

    /// AC Huffman table slot.
    #[inline]
    pub fn Taj(&self) -> u8 {
        self.TdjTaj & 0xf
    }
}

impl fmt::Debug for ScanComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanComponent")
            .field("Csj", &self.Csj)
            .field("Tdj", &self.Tdj())
            .field("Taj", &self.Taj())
            .finish()
    }
}
