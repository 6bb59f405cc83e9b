//! Exclusive ownership of a decoder context.

use crate::{
    codec::{BlockRows, Decompressor, GlobalState},
    error::{Error, Result},
    metadata::{ComponentMetadata, BLOCK_AREA},
};

/// Lifecycle stage of a [`DecoderHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Created,
    HeaderRead,
    CoefficientsRead,
    Destroyed,
}

/// Owns one decoder context and tears it down exactly once.
///
/// Teardown happens in [`DecoderHandle::close`] or, on every other exit path, in `Drop`. It only
/// aborts the context if the context is not already idle: the context aborts itself when it fails,
/// and aborting an idle context is a fault.
pub struct DecoderHandle<S: AsRef<[u8]>> {
    ctx: Decompressor<S>,
    state: HandleState,
}

impl<S: AsRef<[u8]>> DecoderHandle<S> {
    pub fn create(src: S) -> Self {
        Self {
            ctx: Decompressor::new(src),
            state: HandleState::Created,
        }
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn read_header(&mut self) -> Result<ComponentMetadata> {
        let metadata = self.ctx.read_header()?;
        self.state = HandleState::HeaderRead;
        Ok(metadata)
    }

    /// Decodes all scans. Stream errors from this phase are reported as extraction failures.
    pub fn read_coefficients(&mut self) -> Result<()> {
        self.ctx.read_coefficients().map_err(Error::into_codec)?;
        self.state = HandleState::CoefficientsRead;
        Ok(())
    }

    /// Returns block row `row` of `component`.
    ///
    /// The decoder does not advertise how many rows it can hand out per call, so rows are always
    /// requested one at a time.
    pub fn block_row(&self, component: usize, row: usize) -> Result<&[[i16; BLOCK_AREA]]> {
        let rows: BlockRows<'_> = self.ctx.access_block_rows(component, row, 1)?;
        Ok(rows.row(0))
    }

    pub fn quant_table(&self, slot: usize) -> Option<&[u16; BLOCK_AREA]> {
        self.ctx.quant_table(slot)
    }

    /// Signals that all data has been read. The context returns to its idle state.
    pub fn finish(&mut self) -> Result<()> {
        self.ctx.finish()
    }

    /// Destroys the decoder context, reporting any teardown fault.
    pub fn close(mut self) -> Result<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<()> {
        if self.state == HandleState::Destroyed || self.ctx.is_destroyed() {
            return Ok(());
        }
        self.state = HandleState::Destroyed;

        let aborted = match self.ctx.global_state() {
            Some(GlobalState::Start) | None => Ok(()),
            Some(state) => {
                log::trace!("aborting decoder context in state {state:?}");
                self.ctx.abort()
            }
        };
        let destroyed = self.ctx.destroy();
        aborted.and(destroyed)
    }
}

impl<S: AsRef<[u8]>> Drop for DecoderHandle<S> {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            log::error!("failed to tear down decoder context: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{tests::testdata, ErrorKind};

    #[test]
    fn full_lifecycle() {
        let jpeg = testdata::gray_16x16();
        let mut handle = DecoderHandle::create(&jpeg[..]);
        assert_eq!(handle.state(), HandleState::Created);
        let meta = handle.read_header().unwrap();
        assert_eq!(meta.components[0].width_in_blocks, 2);
        assert_eq!(handle.state(), HandleState::HeaderRead);
        handle.read_coefficients().unwrap();
        assert_eq!(handle.state(), HandleState::CoefficientsRead);
        assert_eq!(handle.block_row(0, 1).unwrap().len(), 2);
        handle.finish().unwrap();
        handle.close().unwrap();
    }

    #[test]
    fn failed_header_skips_abort() {
        // Truncated inside the frame header: the context has already aborted itself, so teardown
        // must go straight to destroy.
        let jpeg = testdata::gray_16x16();
        let sof = jpeg.windows(2).position(|w| w == [0xFF, 0xC0]).unwrap();
        let mut handle = DecoderHandle::create(&jpeg[..sof + 6]);
        let err = handle.read_header().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedBitstream);
        assert_eq!(handle.ctx.global_state(), Some(GlobalState::Start));
        handle.close().unwrap();
    }

    #[test]
    fn close_mid_decode_aborts() {
        let jpeg = testdata::gray_16x16();
        let mut handle = DecoderHandle::create(&jpeg[..]);
        handle.read_header().unwrap();
        handle.close().unwrap();

        let mut handle = DecoderHandle::create(&jpeg[..]);
        handle.read_header().unwrap();
        handle.read_coefficients().unwrap();
        drop(handle);
    }

    #[test]
    fn teardown_is_idempotent() {
        let jpeg = testdata::gray_16x16();
        let mut handle = DecoderHandle::create(&jpeg[..]);
        handle.read_header().unwrap();
        handle.teardown().unwrap();
        assert_eq!(handle.state(), HandleState::Destroyed);
        handle.teardown().unwrap();
        assert!(handle.ctx.is_destroyed());
    }

    #[test]
    fn corrupt_scan_is_codec_error() {
        let mut jpeg = testdata::gray_16x16();
        // Replace the entropy-coded data with the reserved all-ones code.
        let eoi = jpeg.len() - 2;
        jpeg[eoi - 3..eoi].copy_from_slice(&[0xFF, 0x00, 0xFE]);
        let mut handle = DecoderHandle::create(&jpeg[..]);
        handle.read_header().unwrap();
        let err = handle.read_coefficients().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CodecExtraction);
        assert_eq!(handle.state(), HandleState::HeaderRead);
        handle.close().unwrap();
    }
}
