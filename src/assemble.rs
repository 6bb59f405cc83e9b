//! The caller-facing description of a packed buffer.

use std::fmt;

use crate::{
    layout::{FinalizedLayout, COEFFICIENT_SIZE, QUANT_ELEMENT_SIZE},
    metadata::{BLOCK_AREA, NUM_QUANT_TABLES},
};

/// Name of a component, by its position in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentName {
    Y,
    Cb,
    Cr,
    K,
}

impl ComponentName {
    pub fn from_channel(channel: usize) -> Option<Self> {
        Some(match channel {
            0 => Self::Y,
            1 => Self::Cb,
            2 => Self::Cr,
            3 => Self::K,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Y => "Y",
            Self::Cb => "Cb",
            Self::Cr => "Cr",
            Self::K => "K",
        }
    }
}

impl fmt::Display for ComponentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A component present in the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentRecord {
    pub name: ComponentName,
    /// Width in blocks.
    pub width: u32,
    /// Height in blocks.
    pub height: u32,
    /// Quantization table slot the component uses.
    pub quant_table: u8,
    /// Byte offset into the packed buffer.
    pub offset: usize,
    /// Number of `i16` coefficients.
    pub len: usize,
}

/// A quantization table slot the stream defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableRecord {
    pub offset: usize,
    /// Number of `u16` entries (always 64).
    pub len: usize,
}

/// Layout of an extracted packed buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DctLayout {
    pub components: Vec<ComponentRecord>,
    /// One entry per slot; `None` for slots the stream did not define.
    pub quant_tables: [Option<TableRecord>; NUM_QUANT_TABLES],
    pub total_bytes: usize,
}

impl DctLayout {
    pub fn component(&self, name: ComponentName) -> Option<&ComponentRecord> {
        self.components.iter().find(|c| c.name == name)
    }

    /// Decodes the coefficients of component `name` from `buf`.
    ///
    /// Each consecutive run of 64 values is one block in natural order; blocks are stored
    /// row by row.
    pub fn coefficients(&self, buf: &[u8], name: ComponentName) -> Option<Vec<i16>> {
        let record = self.component(name)?;
        let bytes = buf.get(record.offset..record.offset + record.len * COEFFICIENT_SIZE)?;
        Some(
            bytes
                .chunks_exact(COEFFICIENT_SIZE)
                .map(|c| i16::from_le_bytes([c[0], c[1]]))
                .collect(),
        )
    }

    /// Decodes quantization table `slot` from `buf`, in natural order.
    pub fn quant_table(&self, buf: &[u8], slot: usize) -> Option<[u16; BLOCK_AREA]> {
        let record = (*self.quant_tables.get(slot)?)?;
        let bytes = buf.get(record.offset..record.offset + record.len * QUANT_ELEMENT_SIZE)?;
        let mut table = [0; BLOCK_AREA];
        for (dst, c) in table.iter_mut().zip(bytes.chunks_exact(QUANT_ELEMENT_SIZE)) {
            *dst = u16::from_le_bytes([c[0], c[1]]);
        }
        Some(table)
    }
}

/// Describes the components and populated tables of `layout`.
pub fn assemble(layout: &FinalizedLayout) -> DctLayout {
    let plan = layout.plan();
    let components = plan
        .components()
        .iter()
        .filter_map(|desc| {
            Some(ComponentRecord {
                name: ComponentName::from_channel(desc.channel)?,
                width: desc.width_blocks,
                height: desc.height_blocks,
                quant_table: desc.quant_table,
                offset: desc.offset,
                len: desc.len,
            })
        })
        .collect();

    let mut quant_tables = [None; NUM_QUANT_TABLES];
    for (record, desc) in quant_tables.iter_mut().zip(plan.quant_tables()) {
        if desc.exists {
            *record = Some(TableRecord {
                offset: desc.offset,
                len: desc.len,
            });
        }
    }

    DctLayout {
        components,
        quant_tables,
        total_bytes: plan.total_bytes(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        layout::LayoutPlan,
        metadata::{CodingProcess, ComponentMetadata},
    };

    #[test]
    fn cmyk_names_and_missing_tables() {
        let metadata = ComponentMetadata::new(
            8,
            16,
            CodingProcess::Baseline,
            [(1, 1, 1, 0), (2, 1, 1, 1), (3, 1, 1, 1), (4, 1, 1, 0)],
        );
        let finalized = LayoutPlan::plan(&metadata)
            .unwrap()
            .finalize([true, true, false, false]);
        let layout = assemble(&finalized);
        expect_test::expect![[r#"
            DctLayout {
                components: [
                    ComponentRecord {
                        name: Y,
                        width: 1,
                        height: 2,
                        quant_table: 0,
                        offset: 0,
                        len: 128,
                    },
                    ComponentRecord {
                        name: Cb,
                        width: 1,
                        height: 2,
                        quant_table: 1,
                        offset: 256,
                        len: 128,
                    },
                    ComponentRecord {
                        name: Cr,
                        width: 1,
                        height: 2,
                        quant_table: 1,
                        offset: 512,
                        len: 128,
                    },
                    ComponentRecord {
                        name: K,
                        width: 1,
                        height: 2,
                        quant_table: 0,
                        offset: 768,
                        len: 128,
                    },
                ],
                quant_tables: [
                    Some(
                        TableRecord {
                            offset: 1024,
                            len: 64,
                        },
                    ),
                    Some(
                        TableRecord {
                            offset: 1152,
                            len: 64,
                        },
                    ),
                    None,
                    None,
                ],
                total_bytes: 1536,
            }
        "#]]
        .assert_debug_eq(&layout);
    }

    #[test]
    fn decode_ranges() {
        let metadata = ComponentMetadata::new(8, 8, CodingProcess::Baseline, [(1, 1, 1, 0)]);
        let layout = assemble(&LayoutPlan::plan(&metadata).unwrap().finalize([true; 4]));
        let mut buf = vec![0; layout.total_bytes];
        buf[0..2].copy_from_slice(&(-300i16).to_le_bytes());
        buf[128..130].copy_from_slice(&16u16.to_le_bytes());

        let coefs = layout.coefficients(&buf, ComponentName::Y).unwrap();
        assert_eq!(coefs.len(), 64);
        assert_eq!(coefs[0], -300);
        assert_eq!(layout.quant_table(&buf, 0).unwrap()[0], 16);
        assert!(layout.coefficients(&buf, ComponentName::Cb).is_none());
        assert!(layout.coefficients(&buf[..10], ComponentName::Y).is_none());
        assert!(layout.quant_table(&buf, 4).is_none());
    }
}
