//! Copies decoded coefficients and quantization tables into a packed buffer.

use crate::{
    error::{Error, Result},
    handle::DecoderHandle,
    layout::{FinalizedLayout, LayoutPlan, COEFFICIENT_SIZE, QUANT_ELEMENT_SIZE},
    metadata::NUM_QUANT_TABLES,
};

/// Reads all coefficients through `handle` and writes them to `out` as laid out by `plan`.
///
/// `handle` must have read the header that `plan` was computed from. Bytes outside the planned
/// ranges are never written, and neither are the ranges of table slots the stream leaves empty.
/// The handle is torn down on every path.
pub fn extract<S: AsRef<[u8]>>(
    mut handle: DecoderHandle<S>,
    plan: &LayoutPlan,
    out: &mut [u8],
) -> Result<FinalizedLayout> {
    plan.check_capacity(out.len())?;
    handle.read_coefficients()?;

    for desc in plan.components() {
        let mut dst = out[desc.byte_range()].chunks_exact_mut(COEFFICIENT_SIZE);
        for row in 0..desc.height_blocks as usize {
            let blocks = handle.block_row(desc.channel, row)?;
            for &coef in blocks.iter().flatten() {
                let Some(chunk) = dst.next() else {
                    return Err(Error::codec(format!(
                        "component {} has more blocks than its header declared",
                        desc.channel
                    )));
                };
                chunk.copy_from_slice(&coef.to_le_bytes());
            }
        }
        if dst.next().is_some() {
            return Err(Error::codec(format!(
                "component {} has fewer blocks than its header declared",
                desc.channel
            )));
        }
    }

    let mut populated = [false; NUM_QUANT_TABLES];
    for (slot, desc) in plan.quant_tables().iter().enumerate() {
        let Some(table) = handle.quant_table(slot) else {
            continue;
        };
        let dst = &mut out[desc.byte_range()];
        for (chunk, q) in dst.chunks_exact_mut(QUANT_ELEMENT_SIZE).zip(table) {
            chunk.copy_from_slice(&q.to_le_bytes());
        }
        populated[slot] = true;
    }

    handle.finish()?;
    handle.close()?;
    Ok(plan.clone().finalize(populated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{tests::testdata, ErrorKind};

    fn prepare(jpeg: &[u8]) -> (DecoderHandle<&[u8]>, LayoutPlan) {
        let mut handle = DecoderHandle::create(jpeg);
        let metadata = handle.read_header().unwrap();
        let plan = LayoutPlan::plan(&metadata).unwrap();
        (handle, plan)
    }

    #[test]
    fn writes_blocks_row_major() {
        let jpeg = testdata::gray_16x16();
        let (handle, plan) = prepare(&jpeg);
        let mut out = vec![0xAA; plan.total_bytes() + 4];
        let finalized = extract(handle, &plan, &mut out).unwrap();

        // DC of each block, block-row-major.
        let dcs: Vec<i16> = (0..4)
            .map(|b| i16::from_le_bytes([out[b * 128], out[b * 128 + 1]]))
            .collect();
        assert_eq!(dcs, [1, 2, 2, 1]);
        // Natural index 1 of the second block.
        assert_eq!(i16::from_le_bytes([out[128 + 2], out[128 + 3]]), -1);

        let tables = finalized.plan().quant_tables();
        assert_eq!(
            tables.iter().map(|t| t.exists).collect::<Vec<_>>(),
            [true, false, false, false]
        );
        assert_eq!(&out[tables[0].offset..][..4], &[1, 0, 2, 0]);
        // Unpopulated slots and bytes past the layout are left alone.
        assert!(out[tables[1].offset..].iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn short_buffer_is_rejected_before_decoding() {
        let jpeg = testdata::gray_16x16();
        let (handle, plan) = prepare(&jpeg);
        let mut out = vec![0x55; plan.total_bytes() - 1];
        let err = extract(handle, &plan, &mut out).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientBuffer);
        assert!(out.iter().all(|&b| b == 0x55));
    }

    #[test]
    fn decode_failure_tears_down() {
        let mut jpeg = testdata::gray_16x16();
        let eoi = jpeg.len() - 2;
        jpeg[eoi - 3..eoi].copy_from_slice(&[0xFF, 0x00, 0xFE]);
        let (handle, plan) = prepare(&jpeg);
        let mut out = vec![0; plan.total_bytes()];
        let err = extract(handle, &plan, &mut out).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CodecExtraction);
    }
}
