//! Byte layout of the packed output buffer.
//!
//! The buffer holds every component's coefficient blocks, in channel order, followed by all
//! [`NUM_QUANT_TABLES`] quantization table slots, in slot order. Coefficients are little-endian
//! `i16`, table entries little-endian `u16`. Every table slot gets space, whether or not the stream
//! populates it; which ones it does is only known after extraction.

use std::{mem, ops::Range};

use crate::{
    error::{Error, Result},
    metadata::{ComponentMetadata, BLOCK_AREA, NUM_QUANT_TABLES},
};

/// Size of one packed coefficient in bytes.
pub const COEFFICIENT_SIZE: usize = mem::size_of::<i16>();
/// Size of one packed quantization table entry in bytes.
pub const QUANT_ELEMENT_SIZE: usize = mem::size_of::<u16>();

/// Where one component's coefficients live in the packed buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentDescriptor {
    /// Index of the component in the frame header.
    pub channel: usize,
    pub width_blocks: u32,
    pub height_blocks: u32,
    pub quant_table: u8,
    /// Byte offset of the first coefficient.
    pub offset: usize,
    /// Number of coefficients (`width_blocks * height_blocks * 64`).
    pub len: usize,
}

impl ComponentDescriptor {
    pub fn byte_range(&self) -> Range<usize> {
        self.offset..self.offset + self.len * COEFFICIENT_SIZE
    }
}

/// Where one quantization table slot lives in the packed buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantTableDescriptor {
    /// Whether the stream defined this slot. Always `false` before extraction.
    pub exists: bool,
    pub offset: usize,
    pub len: usize,
}

impl QuantTableDescriptor {
    pub fn byte_range(&self) -> Range<usize> {
        self.offset..self.offset + self.len * QUANT_ELEMENT_SIZE
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutPlan {
    components: Vec<ComponentDescriptor>,
    quant_tables: [QuantTableDescriptor; NUM_QUANT_TABLES],
    total_bytes: usize,
}

impl LayoutPlan {
    /// Computes the layout for the components described by `metadata`.
    ///
    /// Fails with [`ErrorKind::LayoutOverflow`][crate::ErrorKind::LayoutOverflow] if the buffer
    /// size is not representable.
    pub fn plan(metadata: &ComponentMetadata) -> Result<Self> {
        let mut cursor = 0usize;
        let mut components = Vec::with_capacity(metadata.components.len());
        for (channel, info) in metadata.components.iter().enumerate() {
            let len = usize::try_from(info.width_in_blocks)
                .ok()
                .zip(usize::try_from(info.height_in_blocks).ok())
                .and_then(|(w, h)| w.checked_mul(h))
                .and_then(|blocks| blocks.checked_mul(BLOCK_AREA))
                .ok_or_else(Error::layout_overflow)?;
            let offset = cursor;
            cursor = len
                .checked_mul(COEFFICIENT_SIZE)
                .and_then(|bytes| cursor.checked_add(bytes))
                .ok_or_else(Error::layout_overflow)?;
            components.push(ComponentDescriptor {
                channel,
                width_blocks: info.width_in_blocks,
                height_blocks: info.height_in_blocks,
                quant_table: info.quant_table,
                offset,
                len,
            });
        }

        let mut quant_tables = [QuantTableDescriptor {
            exists: false,
            offset: 0,
            len: BLOCK_AREA,
        }; NUM_QUANT_TABLES];
        for table in &mut quant_tables {
            table.offset = cursor;
            cursor = cursor
                .checked_add(BLOCK_AREA * QUANT_ELEMENT_SIZE)
                .ok_or_else(Error::layout_overflow)?;
        }

        log::debug!(
            "planned {} components, {} bytes total",
            components.len(),
            cursor
        );
        Ok(Self {
            components,
            quant_tables,
            total_bytes: cursor,
        })
    }

    pub fn components(&self) -> &[ComponentDescriptor] {
        &self.components
    }

    pub fn quant_tables(&self) -> &[QuantTableDescriptor; NUM_QUANT_TABLES] {
        &self.quant_tables
    }

    /// Minimum size of the output buffer.
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Checks that a buffer of `len` bytes can hold this layout.
    pub fn check_capacity(&self, len: usize) -> Result<()> {
        if len < self.total_bytes {
            return Err(Error::insufficient_buffer(self.total_bytes, len));
        }
        Ok(())
    }

    pub(crate) fn finalize(mut self, populated: [bool; NUM_QUANT_TABLES]) -> FinalizedLayout {
        for (table, exists) in self.quant_tables.iter_mut().zip(populated) {
            table.exists = exists;
        }
        FinalizedLayout(self)
    }
}

/// A [`LayoutPlan`] whose quantization table `exists` flags reflect what the stream defined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedLayout(LayoutPlan);

impl FinalizedLayout {
    pub fn plan(&self) -> &LayoutPlan {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        metadata::{CodingProcess, ComponentInfo},
        ErrorKind,
    };

    fn ycbcr_420(width: u32, height: u32) -> ComponentMetadata {
        ComponentMetadata::new(
            width,
            height,
            CodingProcess::Baseline,
            [(1, 2, 2, 0), (2, 1, 1, 1), (3, 1, 1, 1)],
        )
    }

    #[test]
    fn ranges_are_disjoint_and_ordered() {
        let plan = LayoutPlan::plan(&ycbcr_420(70, 70)).unwrap();
        let ranges: Vec<_> = plan
            .components()
            .iter()
            .map(ComponentDescriptor::byte_range)
            .chain(plan.quant_tables().iter().map(QuantTableDescriptor::byte_range))
            .collect();
        assert_eq!(ranges.len(), 3 + NUM_QUANT_TABLES);
        assert_eq!(ranges[0].start, 0);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        assert_eq!(ranges.last().unwrap().end, plan.total_bytes());
    }

    #[test]
    fn sizes() {
        let plan = LayoutPlan::plan(&ycbcr_420(70, 70)).unwrap();
        expect_test::expect![[r#"
            [
                (
                    9,
                    9,
                    0,
                    0,
                    5184,
                ),
                (
                    5,
                    5,
                    1,
                    10368,
                    1600,
                ),
                (
                    5,
                    5,
                    1,
                    13568,
                    1600,
                ),
            ]
        "#]]
        .assert_debug_eq(
            &plan
                .components()
                .iter()
                .map(|c| (c.width_blocks, c.height_blocks, c.quant_table, c.offset, c.len))
                .collect::<Vec<_>>(),
        );
        assert_eq!(plan.total_bytes(), 16768 + 4 * 128);
        assert!(plan.quant_tables().iter().all(|t| !t.exists && t.len == 64));
    }

    #[test]
    fn capacity() {
        let plan = LayoutPlan::plan(&ycbcr_420(16, 16)).unwrap();
        plan.check_capacity(plan.total_bytes()).unwrap();
        plan.check_capacity(plan.total_bytes() + 1).unwrap();
        let err = plan.check_capacity(plan.total_bytes() - 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientBuffer);
    }

    #[test]
    fn overflow() {
        let metadata = ComponentMetadata {
            width: u32::MAX,
            height: u32::MAX,
            process: CodingProcess::Baseline,
            components: vec![ComponentInfo {
                id: 1,
                h_samp: 1,
                v_samp: 1,
                quant_table: 0,
                width_in_blocks: u32::MAX,
                height_in_blocks: u32::MAX,
            }],
        };
        let err = LayoutPlan::plan(&metadata).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LayoutOverflow);
    }

    #[test]
    fn finalize_marks_tables() {
        let plan = LayoutPlan::plan(&ycbcr_420(8, 8)).unwrap();
        let finalized = plan.clone().finalize([true, false, true, false]);
        let exists: Vec<_> = finalized
            .plan()
            .quant_tables()
            .iter()
            .map(|t| t.exists)
            .collect();
        assert_eq!(exists, [true, false, true, false]);
        assert_eq!(finalized.plan().components(), plan.components());
    }
}
