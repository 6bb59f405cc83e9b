//! The decoder context.
//!
//! [`Decompressor`] parses a JPEG stream and entropy-decodes every scan into per-component block
//! arrays of quantized DCT coefficients. It stops there: no dequantization, IDCT, upsampling or
//! color conversion happens.
//!
//! The context follows a strict state machine: `Start` → `HeaderRead` → `CoefficientsRead` →
//! `Start` (via [`Decompressor::finish`]). A context that hits an error aborts itself back to
//! `Start` before returning it. [`Decompressor::abort`] on a context that is already idle is a
//! lifecycle fault, and so is any use after [`Decompressor::destroy`].

use crate::{
    bits::BitReader,
    error::{Error, Result},
    file::{JpegParser, Sof, SofMarker, Sos, SegmentKind},
    huffman::{standard, HuffmanDecoder, TableData},
    metadata::{CodingProcess, ComponentMetadata, BLOCK_AREA, MAX_COMPONENTS, NUM_QUANT_TABLES},
    scan::ScanBuffer,
};

/// One 8x8 block of quantized coefficients in natural (row-major) order.
pub type Block = [i16; BLOCK_AREA];

/// Maps zigzag scan position to natural order index.
#[rustfmt::skip]
pub(crate) const ZIGZAG: [u8; BLOCK_AREA] = [
     0,  1,  8, 16,  9,  2,  3, 10,
    17, 24, 32, 25, 18, 11,  4,  5,
    12, 19, 26, 33, 40, 48, 41, 34,
    27, 20, 13,  6,  7, 14, 21, 28,
    35, 42, 49, 56, 57, 50, 43, 36,
    29, 22, 15, 23, 30, 37, 44, 51,
    58, 59, 52, 45, 38, 31, 39, 46,
    53, 60, 61, 54, 47, 55, 62, 63,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalState {
    /// Idle: nothing has been read, or the previous image was finished or aborted.
    Start,
    HeaderRead,
    CoefficientsRead,
}

pub struct Decompressor<S> {
    src: S,
    /// Released by [`Decompressor::destroy`].
    mem: Option<Box<Pool>>,
}

#[derive(Default)]
struct Pool {
    state: Option<ImageState>,
    /// Quantization tables in natural order. Tables survive `finish`/`abort`, like Huffman tables.
    qtables: [Option<[u16; BLOCK_AREA]>; NUM_QUANT_TABLES],
    dc_tables: [Option<HuffmanDecoder>; 4],
    ac_tables: [Option<HuffmanDecoder>; 4],
}

/// State of the image currently being decoded. `None` in [`Pool::state`] means `Start`.
struct ImageState {
    stage: GlobalState,
    metadata: ComponentMetadata,
    restart_interval: u16,
    /// Offset of the first SOS marker, where `read_coefficients` resumes parsing.
    first_scan: usize,
    coefficients: Vec<BlockArray>,
}

/// The coefficient blocks of one component, padded to whole MCUs.
struct BlockArray {
    blocks_wide: usize,
    blocks_tall: usize,
    blocks: Vec<Block>,
}

impl BlockArray {
    /// Allocates a zeroed array. The size comes straight from the frame header, so allocation
    /// failure is reported instead of aborting.
    fn new(blocks_wide: usize, blocks_tall: usize) -> Result<Self> {
        let count = blocks_wide
            .checked_mul(blocks_tall)
            .ok_or_else(|| Error::codec("coefficient array size overflows"))?;
        let mut blocks = Vec::new();
        blocks.try_reserve_exact(count).map_err(|e| {
            Error::codec(format!("cannot allocate {count} coefficient blocks: {e}"))
        })?;
        blocks.resize(count, [0; BLOCK_AREA]);
        Ok(Self {
            blocks_wide,
            blocks_tall,
            blocks,
        })
    }

    fn block_mut(&mut self, x: usize, y: usize) -> &mut Block {
        &mut self.blocks[y * self.blocks_wide + x]
    }
}

/// Borrowed view of a range of block rows of one component.
///
/// Only the blocks inside the component's block grid are visible; MCU padding is hidden.
#[derive(Debug)]
pub struct BlockRows<'a> {
    blocks: &'a [Block],
    stride: usize,
    width: usize,
    rows: usize,
}

impl<'a> BlockRows<'a> {
    pub fn num_rows(&self) -> usize {
        self.rows
    }

    pub fn row(&self, index: usize) -> &'a [Block] {
        &self.blocks[index * self.stride..][..self.width]
    }
}

impl<S: AsRef<[u8]>> Decompressor<S> {
    pub fn new(src: S) -> Self {
        Self {
            src,
            mem: Some(Box::default()),
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.mem.is_none()
    }

    /// Returns the internal state, or `None` if the context has been destroyed.
    pub fn global_state(&self) -> Option<GlobalState> {
        let pool = self.mem.as_ref()?;
        Some(match &pool.state {
            Some(image) => image.stage,
            None => GlobalState::Start,
        })
    }

    fn pool_mut(&mut self) -> Result<&mut Pool> {
        match self.mem.as_deref_mut() {
            Some(pool) => Ok(pool),
            None => Err(Error::lifecycle("decoder context used after destroy")),
        }
    }

    fn expect_state(&self, expected: GlobalState, op: &str) -> Result<()> {
        match self.global_state() {
            Some(state) if state == expected => Ok(()),
            Some(state) => Err(Error::lifecycle(format!(
                "{op} called in state {state:?} (expected {expected:?})"
            ))),
            None => Err(Error::lifecycle("decoder context used after destroy")),
        }
    }

    /// Reads markers up to the first scan header and returns what they say about the image.
    pub fn read_header(&mut self) -> Result<ComponentMetadata> {
        self.expect_state(GlobalState::Start, "read_header")?;
        let result = self.read_header_impl();
        self.abort_on_error(result)
    }

    /// Decodes all remaining scans into the coefficient arrays.
    pub fn read_coefficients(&mut self) -> Result<()> {
        self.expect_state(GlobalState::HeaderRead, "read_coefficients")?;
        let result = self.read_coefficients_impl();
        self.abort_on_error(result)
    }

    /// Returns `num_rows` block rows of `component`, starting at block row `start_row`.
    ///
    /// The returned view borrows the context; it cannot outlive the next mutating call.
    pub fn access_block_rows(
        &self,
        component: usize,
        start_row: usize,
        num_rows: usize,
    ) -> Result<BlockRows<'_>> {
        self.expect_state(GlobalState::CoefficientsRead, "access_block_rows")?;
        let Some(image) = self.mem.as_ref().and_then(|pool| pool.state.as_ref()) else {
            return Err(Error::lifecycle("no image state"));
        };
        let (Some(array), Some(info)) = (
            image.coefficients.get(component),
            image.metadata.components.get(component),
        ) else {
            return Err(Error::codec(format!("component index {component} out of range")));
        };
        let height = info.height_in_blocks as usize;
        if start_row.checked_add(num_rows).map_or(true, |end| end > height) {
            return Err(Error::codec(format!(
                "block rows {start_row}..{} out of range (component has {height})",
                start_row.saturating_add(num_rows)
            )));
        }
        debug_assert!(height <= array.blocks_tall);

        let start = start_row * array.blocks_wide;
        Ok(BlockRows {
            blocks: &array.blocks[start..start + num_rows * array.blocks_wide],
            stride: array.blocks_wide,
            width: info.width_in_blocks as usize,
            rows: num_rows,
        })
    }

    /// Returns quantization table `slot` in natural order, if the stream defined it.
    pub fn quant_table(&self, slot: usize) -> Option<&[u16; BLOCK_AREA]> {
        self.mem.as_ref()?.qtables.get(slot)?.as_ref()
    }

    /// Completes decoding and returns the context to its idle state.
    pub fn finish(&mut self) -> Result<()> {
        self.expect_state(GlobalState::CoefficientsRead, "finish")?;
        self.pool_mut()?.state = None;
        Ok(())
    }

    /// Abandons the current image and returns to the idle state.
    ///
    /// Must not be called on an idle context.
    pub fn abort(&mut self) -> Result<()> {
        let pool = self.pool_mut()?;
        if pool.state.take().is_none() {
            return Err(Error::lifecycle("abort called on an idle decoder context"));
        }
        Ok(())
    }

    /// Releases all memory held by the context. Must be called exactly once.
    pub fn destroy(&mut self) -> Result<()> {
        match self.mem.take() {
            Some(_) => Ok(()),
            None => Err(Error::lifecycle("decoder context destroyed twice")),
        }
    }

    fn abort_on_error<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            if let Some(pool) = self.mem.as_deref_mut() {
                if pool.state.take().is_some() {
                    log::debug!("decoder context aborted after error");
                }
            }
        }
        result
    }

    fn read_header_impl(&mut self) -> Result<ComponentMetadata> {
        let src: &[u8] = self.src.as_ref();
        let Some(pool) = self.mem.as_deref_mut() else {
            return Err(Error::lifecycle("decoder context used after destroy"));
        };

        let mut parser = JpegParser::new(src)?;
        let mut metadata = None;
        let mut restart_interval = 0;
        loop {
            let Some(segment) = parser.next_segment()? else {
                return Err(Error::malformed("no image data before EOI marker"));
            };
            let offset = segment.offset();
            let (code, len) = (segment.marker(), segment.raw_bytes().len());
            match segment.into_segment_kind() {
                Some(SegmentKind::Sof(sof)) => {
                    if metadata.is_some() {
                        return Err(Error::malformed("encountered multiple SOF markers"));
                    }
                    metadata = Some(frame_metadata(&sof)?);
                }
                Some(SegmentKind::Sos(sos)) => {
                    let Some(metadata) = metadata else {
                        return Err(Error::malformed("SOS not preceded by SOF header"));
                    };
                    scan_components(&metadata, &sos)?;
                    // Walk the remaining segments so that a truncated or garbled stream is rejected
                    // here, before anything is allocated for it.
                    while parser.next_segment()?.is_some() {}

                    let coefficients = metadata
                        .components
                        .iter()
                        .map(|c| {
                            let blocks_wide = (metadata.mcus_x() * u32::from(c.h_samp)) as usize;
                            let blocks_tall = (metadata.mcus_y() * u32::from(c.v_samp)) as usize;
                            BlockArray {
                                blocks_wide,
                                blocks_tall,
                                blocks: Vec::new(),
                            }
                        })
                        .collect();

                    log::trace!("header: {:?}", metadata);
                    pool.state = Some(ImageState {
                        stage: GlobalState::HeaderRead,
                        metadata: metadata.clone(),
                        restart_interval,
                        first_scan: offset,
                        coefficients,
                    });
                    return Ok(metadata);
                }
                Some(SegmentKind::Dri(dri)) => restart_interval = dri.Ri(),
                Some(kind) => pool.apply_tables(&kind)?,
                None => log::trace!("skipping ff {code:02x} segment ({len} bytes)"),
            }
        }
    }

    fn read_coefficients_impl(&mut self) -> Result<()> {
        let src: &[u8] = self.src.as_ref();
        let Some(pool) = self.mem.as_deref_mut() else {
            return Err(Error::lifecycle("decoder context used after destroy"));
        };
        let Pool {
            state,
            qtables,
            dc_tables,
            ac_tables,
        } = pool;
        let Some(image) = state.as_mut() else {
            return Err(Error::lifecycle("no image state"));
        };

        for array in &mut image.coefficients {
            *array = BlockArray::new(array.blocks_wide, array.blocks_tall)?;
        }

        let mut tables = TableSet {
            qtables,
            dc_tables,
            ac_tables,
        };
        let mut scan_buffer = ScanBuffer::new();
        let mut parser = JpegParser::resume(src, image.first_scan);
        let mut scans = 0;
        loop {
            let Some(segment) = parser.next_segment().map_err(Error::into_codec)? else {
                break;
            };
            match segment.into_segment_kind() {
                Some(SegmentKind::Sos(sos)) => {
                    decode_scan(image, &tables, &mut scan_buffer, &sos)?;
                    scans += 1;
                }
                Some(SegmentKind::Dri(dri)) => image.restart_interval = dri.Ri(),
                Some(SegmentKind::Sof(_)) => {
                    return Err(Error::codec("encountered multiple SOF markers"));
                }
                Some(kind) => tables.apply(&kind).map_err(Error::into_codec)?,
                None => {}
            }
        }

        // A component's quantization table may be defined anywhere before EOI.
        for info in &image.metadata.components {
            if tables.qtables[usize::from(info.quant_table)].is_none() {
                return Err(Error::codec(format!(
                    "quantization table {} used by component {} is not defined",
                    info.quant_table, info.id
                )));
            }
        }

        log::debug!("decoded {scans} scans");
        image.stage = GlobalState::CoefficientsRead;
        Ok(())
    }
}

impl Pool {
    fn apply_tables(&mut self, kind: &SegmentKind<'_>) -> Result<()> {
        TableSet {
            qtables: &mut self.qtables,
            dc_tables: &mut self.dc_tables,
            ac_tables: &mut self.ac_tables,
        }
        .apply(kind)
    }
}

/// Mutable access to the table slots, split from the image state so both can be borrowed at once.
struct TableSet<'a> {
    qtables: &'a mut [Option<[u16; BLOCK_AREA]>; NUM_QUANT_TABLES],
    dc_tables: &'a mut [Option<HuffmanDecoder>; 4],
    ac_tables: &'a mut [Option<HuffmanDecoder>; 4],
}

impl TableSet<'_> {
    fn apply(&mut self, kind: &SegmentKind<'_>) -> Result<()> {
        match kind {
            SegmentKind::Dqt(dqt) => {
                for table in dqt.tables() {
                    let Some(slot) = self.qtables.get_mut(usize::from(table.Tq())) else {
                        return Err(Error::malformed(format!(
                            "invalid quantization table destination Tq={} (0-3 are allowed)",
                            table.Tq()
                        )));
                    };
                    let mut natural = [0; BLOCK_AREA];
                    for (k, &q) in table.Qk().iter().enumerate() {
                        natural[usize::from(ZIGZAG[k])] = q;
                    }
                    *slot = Some(natural);
                }
            }
            SegmentKind::Dht(dht) => {
                for table in dht.tables() {
                    let slots = match table.Tc() {
                        0 => &mut *self.dc_tables,
                        1 => &mut *self.ac_tables,
                        class => {
                            return Err(Error::malformed(format!(
                                "invalid table class Tc={class} (only 0 and 1 are valid)"
                            )))
                        }
                    };
                    let Some(slot) = slots.get_mut(usize::from(table.Th())) else {
                        return Err(Error::malformed(format!(
                            "invalid huffman table destination Th={} (0-3 are allowed)",
                            table.Th()
                        )));
                    };
                    let data = TableData::build(table.Li(), table.Vij())?;
                    *slot = Some(HuffmanDecoder::new(&data));
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn dc(&self, index: u8) -> Result<HuffmanRef<'_>> {
        huffman_ref(&self.dc_tables[..], index, 0)
    }

    fn ac(&self, index: u8) -> Result<HuffmanRef<'_>> {
        huffman_ref(&self.ac_tables[..], index, 1)
    }
}

/// A Huffman table selected by a scan: either one defined by the stream, or a standard table.
enum HuffmanRef<'a> {
    Defined(&'a HuffmanDecoder),
    Standard(Box<HuffmanDecoder>),
}

impl HuffmanRef<'_> {
    fn get(&self) -> &HuffmanDecoder {
        match self {
            HuffmanRef::Defined(table) => table,
            HuffmanRef::Standard(table) => table,
        }
    }
}

fn huffman_ref(tables: &[Option<HuffmanDecoder>], index: u8, class: u8) -> Result<HuffmanRef<'_>> {
    if let Some(Some(table)) = tables.get(usize::from(index)) {
        return Ok(HuffmanRef::Defined(table));
    }

    let (bits, values): (&[u8; 16], &[u8]) = match (class, index) {
        (0, 0) => (&standard::DC_LUMINANCE_BITS, &standard::DC_LUMINANCE_VALUES),
        (0, 1) => (&standard::DC_CHROMINANCE_BITS, &standard::DC_CHROMINANCE_VALUES),
        (1, 0) => (&standard::AC_LUMINANCE_BITS, &standard::AC_LUMINANCE_VALUES),
        (1, 1) => (&standard::AC_CHROMINANCE_BITS, &standard::AC_CHROMINANCE_VALUES),
        _ => {
            return Err(Error::codec(format!(
                "scan uses undefined huffman table {index} (class {class})"
            )))
        }
    };
    log::debug!("using standard huffman table {index} (class {class})");
    Ok(HuffmanRef::Standard(Box::new(HuffmanDecoder::new(
        &TableData::build(bits, values)?,
    ))))
}

fn frame_metadata(sof: &Sof<'_>) -> Result<ComponentMetadata> {
    let process = match sof.sof() {
        SofMarker::SOF0 => CodingProcess::Baseline,
        SofMarker::SOF1 => CodingProcess::ExtendedSequential,
        SofMarker::SOF2 => CodingProcess::Progressive,
        other => {
            return Err(Error::malformed(format!(
                "unsupported coding process {other:?}"
            )))
        }
    };

    if sof.P() != 8 {
        return Err(Error::malformed(format!(
            "sample precision of {} bits is not supported",
            sof.P()
        )));
    }
    if sof.X() == 0 || sof.Y() == 0 {
        return Err(Error::malformed(format!(
            "invalid image dimensions {}x{}",
            sof.X(),
            sof.Y()
        )));
    }

    let components = sof.components();
    if components.is_empty() || components.len() > MAX_COMPONENTS {
        return Err(Error::malformed(format!(
            "frame with {} components not supported (1 to {MAX_COMPONENTS} are)",
            components.len()
        )));
    }
    for (i, c) in components.iter().enumerate() {
        log::trace!("{:?}", c);
        if !(1..=4).contains(&c.Hi()) || !(1..=4).contains(&c.Vi()) {
            return Err(Error::malformed(format!(
                "invalid sampling factors {}x{} for component {}",
                c.Hi(),
                c.Vi(),
                c.Ci()
            )));
        }
        if usize::from(c.Tqi()) >= NUM_QUANT_TABLES {
            return Err(Error::malformed(format!(
                "invalid quantization table selection {} (only tables 0-3 are valid)",
                c.Tqi()
            )));
        }
        if components[..i].iter().any(|prev| prev.Ci() == c.Ci()) {
            return Err(Error::malformed(format!("duplicate component id {}", c.Ci())));
        }
    }

    Ok(ComponentMetadata::new(
        sof.X().into(),
        sof.Y().into(),
        process,
        components.iter().map(|c| (c.Ci(), c.Hi(), c.Vi(), c.Tqi())),
    ))
}

/// Resolves the scan's component selectors to frame component indices.
fn scan_components(metadata: &ComponentMetadata, sos: &Sos<'_>) -> Result<Vec<usize>> {
    let scan = sos.components();
    if scan.is_empty() || scan.len() > MAX_COMPONENTS {
        return Err(Error::malformed(format!(
            "scan with {} components",
            scan.len()
        )));
    }
    let mut indices = Vec::with_capacity(scan.len());
    for sc in scan {
        let Some(index) = metadata.components.iter().position(|c| c.id == sc.Csj()) else {
            return Err(Error::malformed(format!(
                "scan references unknown component {}",
                sc.Csj()
            )));
        };
        if indices.contains(&index) {
            return Err(Error::malformed(format!(
                "scan references component {} twice",
                sc.Csj()
            )));
        }
        indices.push(index);
    }
    Ok(indices)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanKind {
    Sequential,
    DcFirst,
    DcRefine,
    AcFirst,
    AcRefine,
}

struct ScanComponentState<'t> {
    index: usize,
    dc: Option<HuffmanRef<'t>>,
    ac: Option<HuffmanRef<'t>>,
    pred: i32,
}

fn decode_scan(
    image: &mut ImageState,
    tables: &TableSet<'_>,
    scan_buffer: &mut ScanBuffer,
    sos: &Sos<'_>,
) -> Result<()> {
    let indices = scan_components(&image.metadata, sos).map_err(Error::into_codec)?;
    let (ss, se, ah, al) = (sos.Ss(), sos.Se(), sos.Ah(), sos.Al());

    let kind = match image.metadata.process {
        CodingProcess::Baseline | CodingProcess::ExtendedSequential => {
            if ss != 0 || se != 63 || ah != 0 || al != 0 {
                log::warn!("ignoring invalid sequential scan parameters Ss={ss} Se={se} Ah={ah} Al={al}");
            }
            ScanKind::Sequential
        }
        CodingProcess::Progressive => {
            let valid = if ss == 0 {
                se == 0
            } else {
                indices.len() == 1 && ss <= se && se <= 63
            };
            if !valid || al > 13 || (ah != 0 && ah != al + 1) {
                return Err(Error::codec(format!(
                    "invalid progressive scan parameters Ss={ss} Se={se} Ah={ah} Al={al}"
                )));
            }
            match (ss == 0, ah == 0) {
                (true, true) => ScanKind::DcFirst,
                (true, false) => ScanKind::DcRefine,
                (false, true) => ScanKind::AcFirst,
                (false, false) => ScanKind::AcRefine,
            }
        }
    };
    log::trace!("scan {kind:?} over components {indices:?}, {} bytes", sos.data().len());

    let mut components = Vec::with_capacity(indices.len());
    for (&index, sc) in indices.iter().zip(sos.components()) {
        let needs_dc = matches!(kind, ScanKind::Sequential | ScanKind::DcFirst);
        let needs_ac = matches!(
            kind,
            ScanKind::Sequential | ScanKind::AcFirst | ScanKind::AcRefine
        );
        components.push(ScanComponentState {
            index,
            dc: if needs_dc { Some(tables.dc(sc.Tdj())?) } else { None },
            ac: if needs_ac { Some(tables.ac(sc.Taj())?) } else { None },
            pred: 0,
        });
    }

    scan_buffer.process(sos.data())?;

    // A scan with a single component is non-interleaved: each MCU is exactly one block, and only
    // the blocks inside the component's grid are coded.
    let (mcus_x, mcus_y) = if let [single] = &components[..] {
        let info = &image.metadata.components[single.index];
        (info.width_in_blocks as usize, info.height_in_blocks as usize)
    } else {
        (
            image.metadata.mcus_x() as usize,
            image.metadata.mcus_y() as usize,
        )
    };
    let interleaved = components.len() > 1;
    let total_mcus = mcus_x * mcus_y;
    let restart_interval = match image.restart_interval {
        0 => total_mcus.max(1),
        ri => usize::from(ri),
    };
    let expected_intervals = total_mcus.div_ceil(restart_interval);
    if scan_buffer.interval_count() != expected_intervals {
        log::warn!(
            "restart interval count mismatch: counted {}, expected {}",
            scan_buffer.interval_count(),
            expected_intervals
        );
    }

    for interval in 0..expected_intervals {
        let mut reader = BitReader::new(scan_buffer.interval(interval));
        for c in &mut components {
            c.pred = 0;
        }
        let mut eobrun = 0u32;

        let first = interval * restart_interval;
        let last = (first + restart_interval).min(total_mcus);
        for mcu in first..last {
            let (mx, my) = (mcu % mcus_x, mcu / mcus_x);
            for c in &mut components {
                let info = &image.metadata.components[c.index];
                let array = &mut image.coefficients[c.index];
                let (h, v) = if interleaved {
                    (usize::from(info.h_samp), usize::from(info.v_samp))
                } else {
                    (1, 1)
                };
                for by in 0..v {
                    for bx in 0..h {
                        let block = array.block_mut(mx * h + bx, my * v + by);
                        match kind {
                            ScanKind::Sequential => decode_block_sequential(
                                &mut reader,
                                c.dc.as_ref().map(HuffmanRef::get),
                                c.ac.as_ref().map(HuffmanRef::get),
                                &mut c.pred,
                                block,
                            )?,
                            ScanKind::DcFirst => decode_dc_first(
                                &mut reader,
                                c.dc.as_ref().map(HuffmanRef::get),
                                &mut c.pred,
                                al,
                                block,
                            )?,
                            ScanKind::DcRefine => decode_dc_refine(&mut reader, al, block),
                            ScanKind::AcFirst => decode_ac_first(
                                &mut reader,
                                c.ac.as_ref().map(HuffmanRef::get),
                                (ss, se, al),
                                &mut eobrun,
                                block,
                            )?,
                            ScanKind::AcRefine => decode_ac_refine(
                                &mut reader,
                                c.ac.as_ref().map(HuffmanRef::get),
                                (ss, se, al),
                                &mut eobrun,
                                block,
                            )?,
                        }
                    }
                }
            }
        }

        if reader.overrun() {
            log::warn!("premature end of data in restart interval {interval}; filled with zeros");
        }
    }

    Ok(())
}

fn missing_table() -> Error {
    Error::codec("scan is missing a huffman table")
}

fn decode_dc_diff(reader: &mut BitReader<'_>, dc: &HuffmanDecoder) -> Result<i32> {
    let s = dc.decode(reader)?;
    if s > 15 {
        return Err(Error::codec(format!("invalid DC magnitude category {s}")));
    }
    Ok(reader.receive_extend(s))
}

fn natural_index(k: usize) -> Result<usize> {
    match ZIGZAG.get(k) {
        Some(&index) => Ok(usize::from(index)),
        None => Err(Error::codec("corrupt entropy-coded data: coefficient index out of range")),
    }
}

fn decode_block_sequential(
    reader: &mut BitReader<'_>,
    dc: Option<&HuffmanDecoder>,
    ac: Option<&HuffmanDecoder>,
    pred: &mut i32,
    block: &mut Block,
) -> Result<()> {
    let (Some(dc), Some(ac)) = (dc, ac) else {
        return Err(missing_table());
    };

    *pred = pred.wrapping_add(decode_dc_diff(reader, dc)?);
    block[0] = *pred as i16;

    let mut k = 1;
    while k < BLOCK_AREA {
        let rs = ac.decode(reader)?;
        let (r, s) = (usize::from(rs >> 4), rs & 15);
        if s != 0 {
            k += r;
            block[natural_index(k)?] = reader.receive_extend(s) as i16;
        } else if r == 15 {
            k += 15;
        } else {
            break;
        }
        k += 1;
    }
    Ok(())
}

fn decode_dc_first(
    reader: &mut BitReader<'_>,
    dc: Option<&HuffmanDecoder>,
    pred: &mut i32,
    al: u8,
    block: &mut Block,
) -> Result<()> {
    let Some(dc) = dc else {
        return Err(missing_table());
    };
    *pred = pred.wrapping_add(decode_dc_diff(reader, dc)?);
    block[0] = pred.wrapping_shl(al.into()) as i16;
    Ok(())
}

fn decode_dc_refine(reader: &mut BitReader<'_>, al: u8, block: &mut Block) {
    if reader.read_bit() {
        block[0] |= 1 << al;
    }
}

fn decode_ac_first(
    reader: &mut BitReader<'_>,
    ac: Option<&HuffmanDecoder>,
    (ss, se, al): (u8, u8, u8),
    eobrun: &mut u32,
    block: &mut Block,
) -> Result<()> {
    let Some(ac) = ac else {
        return Err(missing_table());
    };
    if *eobrun > 0 {
        *eobrun -= 1;
        return Ok(());
    }

    let mut k = usize::from(ss);
    while k <= usize::from(se) {
        let rs = ac.decode(reader)?;
        let (r, s) = (rs >> 4, rs & 15);
        if s != 0 {
            k += usize::from(r);
            block[natural_index(k)?] = (reader.receive_extend(s) << al) as i16;
        } else if r == 15 {
            k += 15;
        } else {
            // EOBr: this block and the next 2^r + n - 1 blocks end here.
            *eobrun = (1 << r) + reader.read_bits(r.into()) - 1;
            break;
        }
        k += 1;
    }
    Ok(())
}

/// Refines the nonzero coefficient at `block[z]` with one correction bit.
fn refine_nonzero(reader: &mut BitReader<'_>, coef: &mut i16, p1: i16, m1: i16) {
    if reader.read_bit() && (*coef & p1) == 0 {
        if *coef >= 0 {
            *coef = coef.wrapping_add(p1);
        } else {
            *coef = coef.wrapping_add(m1);
        }
    }
}

fn decode_ac_refine(
    reader: &mut BitReader<'_>,
    ac: Option<&HuffmanDecoder>,
    (ss, se, al): (u8, u8, u8),
    eobrun: &mut u32,
    block: &mut Block,
) -> Result<()> {
    let Some(ac) = ac else {
        return Err(missing_table());
    };
    let p1: i16 = 1 << al;
    let m1: i16 = -1 << al;
    let se = usize::from(se);
    let mut k = usize::from(ss);

    if *eobrun == 0 {
        while k <= se {
            let rs = ac.decode(reader)?;
            let (mut r, s) = (i32::from(rs >> 4), rs & 15);
            let mut value = 0;
            if s != 0 {
                if s != 1 {
                    log::warn!("corrupt JPEG data: bad refinement magnitude {s}");
                }
                value = if reader.read_bit() { p1 } else { m1 };
            } else if r != 15 {
                *eobrun = (1 << r) + reader.read_bits(r as u32);
                break;
            }

            // Skip `r` zero coefficients, refining the nonzero ones passed on the way, then place
            // the new coefficient.
            while k <= se {
                let z = natural_index(k)?;
                if block[z] != 0 {
                    refine_nonzero(reader, &mut block[z], p1, m1);
                } else {
                    if r == 0 {
                        if value != 0 {
                            block[z] = value;
                        }
                        break;
                    }
                    r -= 1;
                }
                k += 1;
            }
            k += 1;
        }
    }

    if *eobrun > 0 {
        // The rest of the band is in an end-of-band run: only refine the nonzero coefficients.
        while k <= se {
            let z = natural_index(k)?;
            if block[z] != 0 {
                refine_nonzero(reader, &mut block[z], p1, m1);
            }
            k += 1;
        }
        *eobrun -= 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{tests::testdata, ErrorKind};

    #[test]
    fn zigzag_is_a_permutation() {
        let mut seen = [false; BLOCK_AREA];
        for &i in &ZIGZAG {
            assert!(!seen[usize::from(i)]);
            seen[usize::from(i)] = true;
        }
    }

    #[test]
    fn state_machine() {
        let jpeg = testdata::gray_16x16();
        let mut ctx = Decompressor::new(&jpeg[..]);
        assert_eq!(ctx.global_state(), Some(GlobalState::Start));

        let meta = ctx.read_header().unwrap();
        assert_eq!(meta.components.len(), 1);
        assert_eq!(ctx.global_state(), Some(GlobalState::HeaderRead));
        assert!(ctx.access_block_rows(0, 0, 1).is_err());

        ctx.read_coefficients().unwrap();
        assert_eq!(ctx.global_state(), Some(GlobalState::CoefficientsRead));
        assert_eq!(ctx.access_block_rows(0, 0, 2).unwrap().num_rows(), 2);

        ctx.finish().unwrap();
        assert_eq!(ctx.global_state(), Some(GlobalState::Start));
        ctx.destroy().unwrap();
        assert_eq!(ctx.global_state(), None);
        assert!(ctx.is_destroyed());
    }

    #[test]
    fn abort_on_idle_context_is_a_fault() {
        let jpeg = testdata::gray_16x16();
        let mut ctx = Decompressor::new(&jpeg[..]);
        let err = ctx.abort().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HandleLifecycle);

        ctx.read_header().unwrap();
        ctx.abort().unwrap();
        assert_eq!(ctx.abort().unwrap_err().kind(), ErrorKind::HandleLifecycle);
    }

    #[test]
    fn destroy_twice_is_a_fault() {
        let mut ctx = Decompressor::new(&[][..]);
        ctx.destroy().unwrap();
        assert_eq!(ctx.destroy().unwrap_err().kind(), ErrorKind::HandleLifecycle);
        assert_eq!(
            ctx.read_header().unwrap_err().kind(),
            ErrorKind::HandleLifecycle
        );
    }

    #[test]
    fn header_error_leaves_context_idle() {
        let jpeg = testdata::gray_16x16();
        let mut ctx = Decompressor::new(&jpeg[..40]);
        let err = ctx.read_header().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedBitstream);
        assert_eq!(ctx.global_state(), Some(GlobalState::Start));
    }

    #[test]
    fn dc_prediction_and_ac() {
        let jpeg = testdata::gray_16x16();
        let mut ctx = Decompressor::new(&jpeg[..]);
        ctx.read_header().unwrap();
        ctx.read_coefficients().unwrap();

        let rows = ctx.access_block_rows(0, 0, 2).unwrap();
        let dcs: Vec<i16> = (0..2)
            .flat_map(|y| rows.row(y).iter().map(|b| b[0]))
            .collect();
        assert_eq!(dcs, [1, 2, 2, 1]);

        // The second block carries one AC coefficient at zigzag position 1 (natural index 1).
        let second = &rows.row(0)[1];
        assert_eq!(second[1], -1);
        assert_eq!(second[2..].iter().filter(|&&c| c != 0).count(), 0);
    }

    #[test]
    fn quant_tables_are_dezigzagged() {
        let jpeg = testdata::gray_16x16();
        let mut ctx = Decompressor::new(&jpeg[..]);
        ctx.read_header().unwrap();
        let table = ctx.quant_table(0).unwrap();
        // The stream stores 1..=64 in zigzag order.
        assert_eq!(table[0], 1);
        assert_eq!(table[1], 2);
        assert_eq!(table[8], 3);
        assert_eq!(table[63], 64);
        assert!(ctx.quant_table(1).is_none());
    }

    #[test]
    fn unsupported_process() {
        let mut jpeg = testdata::gray_16x16();
        let sof = jpeg.windows(2).position(|w| w == [0xFF, 0xC0]).unwrap();
        jpeg[sof + 1] = 0xC9; // arithmetic coding
        let mut ctx = Decompressor::new(&jpeg[..]);
        let err = ctx.read_header().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedBitstream);
        assert_eq!(
            err.to_string(),
            "malformed JPEG: unsupported coding process SOF9"
        );
    }

    #[test]
    fn progressive_successive_approximation() {
        let jpeg = testdata::progressive_16x8();
        let mut ctx = Decompressor::new(&jpeg[..]);
        let meta = ctx.read_header().unwrap();
        assert_eq!(meta.process, CodingProcess::Progressive);
        assert_eq!(meta.components.len(), 2);
        ctx.read_coefficients().unwrap();

        let block = |component, x: usize| {
            let rows = ctx.access_block_rows(component, 0, 1).unwrap();
            rows.row(0)[x]
        };
        let mut expected = [[0i16; BLOCK_AREA]; 4];
        expected[0][0] = 5;
        expected[0][1] = 7;
        expected[0][8] = 1;
        expected[0][16] = -3;
        expected[1][0] = 2;
        expected[2][0] = 2;
        expected[3][0] = 3;
        assert_eq!(
            [block(0, 0), block(0, 1), block(1, 0), block(1, 1)],
            expected
        );
    }

    #[test]
    fn undefined_quant_table() {
        let mut jpeg = testdata::gray_16x16();
        // Point the only component at slot 2, which no DQT defines.
        let sof = jpeg.windows(2).position(|w| w == [0xFF, 0xC0]).unwrap();
        jpeg[sof + 12] = 2;
        let mut ctx = Decompressor::new(&jpeg[..]);
        ctx.read_header().unwrap();
        let err = ctx.read_coefficients().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CodecExtraction);
        assert_eq!(
            err.to_string(),
            "decoder error: quantization table 2 used by component 1 is not defined"
        );
        assert_eq!(ctx.global_state(), Some(GlobalState::Start));
    }

    #[test]
    fn oversized_block_array() {
        let err = BlockArray::new(usize::MAX, 2).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::CodecExtraction);
        // Fits in `usize`, but not in the address space once multiplied by the block size.
        let err = BlockArray::new(1 << 60, 1).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::CodecExtraction);
        assert_eq!(BlockArray::new(3, 2).unwrap().blocks.len(), 6);
    }

    #[test]
    fn block_rows_bounds() {
        let jpeg = testdata::gray_16x16();
        let mut ctx = Decompressor::new(&jpeg[..]);
        ctx.read_header().unwrap();
        ctx.read_coefficients().unwrap();
        assert_eq!(
            ctx.access_block_rows(0, 1, 2).err().map(|e| e.kind()),
            Some(ErrorKind::CodecExtraction)
        );
        assert_eq!(
            ctx.access_block_rows(1, 0, 1).err().map(|e| e.kind()),
            Some(ErrorKind::CodecExtraction)
        );
    }
}
