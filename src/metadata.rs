/// Number of coefficients in one 8x8 block.
pub const BLOCK_AREA: usize = 64;
/// Maximum number of components (Y, Cb, Cr, K).
pub const MAX_COMPONENTS: usize = 4;
/// Number of quantization table slots.
pub const NUM_QUANT_TABLES: usize = 4;

/// The DCT-based coding process declared by the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodingProcess {
    Baseline,
    ExtendedSequential,
    Progressive,
}

/// Per-component information from the frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentInfo {
    /// Component identifier (`Ci`) used by scan headers.
    pub id: u8,
    pub h_samp: u8,
    pub v_samp: u8,
    /// Quantization table slot (`Tqi`), 0-3.
    pub quant_table: u8,
    /// Width of the component's block grid, excluding MCU padding.
    pub width_in_blocks: u32,
    /// Height of the component's block grid, excluding MCU padding.
    pub height_in_blocks: u32,
}

/// Everything the header tells us about the image's coefficient storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentMetadata {
    pub width: u32,
    pub height: u32,
    pub process: CodingProcess,
    pub components: Vec<ComponentInfo>,
}

impl ComponentMetadata {
    pub(crate) fn new(
        width: u32,
        height: u32,
        process: CodingProcess,
        frame: impl IntoIterator<Item = (u8, u8, u8, u8)>,
    ) -> Self {
        let frame: Vec<_> = frame.into_iter().collect();
        let h_max = frame.iter().map(|c| u32::from(c.1)).max().unwrap_or(1);
        let v_max = frame.iter().map(|c| u32::from(c.2)).max().unwrap_or(1);

        let components = frame
            .into_iter()
            .map(|(id, h_samp, v_samp, quant_table)| ComponentInfo {
                id,
                h_samp,
                v_samp,
                quant_table,
                width_in_blocks: (width * u32::from(h_samp)).div_ceil(h_max).div_ceil(8),
                height_in_blocks: (height * u32::from(v_samp)).div_ceil(v_max).div_ceil(8),
            })
            .collect();

        Self {
            width,
            height,
            process,
            components,
        }
    }

    pub fn max_h_samp(&self) -> u32 {
        self.components
            .iter()
            .map(|c| u32::from(c.h_samp))
            .max()
            .unwrap_or(1)
    }

    pub fn max_v_samp(&self) -> u32 {
        self.components
            .iter()
            .map(|c| u32::from(c.v_samp))
            .max()
            .unwrap_or(1)
    }

    /// Number of MCUs per row in an interleaved scan.
    pub fn mcus_x(&self) -> u32 {
        self.width.div_ceil(8 * self.max_h_samp())
    }

    /// Number of MCU rows in an interleaved scan.
    pub fn mcus_y(&self) -> u32 {
        self.height.div_ceil(8 * self.max_v_samp())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ycbcr_420() {
        let meta = ComponentMetadata::new(
            640,
            480,
            CodingProcess::Baseline,
            [(1, 2, 2, 0), (2, 1, 1, 1), (3, 1, 1, 1)],
        );
        assert_eq!(meta.mcus_x(), 40);
        assert_eq!(meta.mcus_y(), 30);
        assert_eq!(meta.components[0].width_in_blocks, 80);
        assert_eq!(meta.components[0].height_in_blocks, 60);
        assert_eq!(meta.components[1].width_in_blocks, 40);
        assert_eq!(meta.components[1].height_in_blocks, 30);
    }

    #[test]
    fn block_grid_is_not_mcu_padded() {
        // 4:2:0 at 17x17: luma needs 3x3 blocks even though the MCU grid is 2x2 (4x4 luma blocks).
        let meta = ComponentMetadata::new(
            17,
            17,
            CodingProcess::Baseline,
            [(1, 2, 2, 0), (2, 1, 1, 1), (3, 1, 1, 1)],
        );
        assert_eq!(meta.mcus_x(), 2);
        assert_eq!(meta.mcus_y(), 2);
        assert_eq!(meta.components[0].width_in_blocks, 3);
        assert_eq!(meta.components[0].height_in_blocks, 3);
        // ceil(17 / 2) = 9 chroma samples -> 2 blocks.
        assert_eq!(meta.components[1].width_in_blocks, 2);
        assert_eq!(meta.components[2].height_in_blocks, 2);
    }

    #[test]
    fn grayscale() {
        let meta = ComponentMetadata::new(16, 16, CodingProcess::Baseline, [(1, 1, 1, 0)]);
        assert_eq!(meta.components[0].width_in_blocks, 2);
        assert_eq!(meta.components[0].height_in_blocks, 2);
    }
}
