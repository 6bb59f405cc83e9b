//! Extracts the quantized DCT coefficients and quantization tables of a JPEG image into one packed
//! buffer, without decoding any pixels.
//!
//! The buffer holds each component's coefficient blocks (little-endian `i16`, 64 per block in
//! natural order, blocks row by row), followed by four quantization table slots (little-endian
//! `u16`, 64 per table in natural order). The returned [`DctLayout`] says where everything is.
//!
//! ```no_run
//! # fn main() -> dctpack::Result<()> {
//! let jpeg = std::fs::read("image.jpg").unwrap();
//! let result = dctpack::read_dct(&jpeg)?;
//! let bytes = result.buffer.to_vec();
//! let luma = result.layout.coefficients(&bytes, dctpack::ComponentName::Y);
//! # Ok(())
//! # }
//! ```

mod assemble;
mod bits;
mod buffer;
mod codec;
mod error;
mod extract;
mod file;
mod handle;
mod huffman;
mod layout;
mod metadata;
mod scan;
mod worker;


use std::sync::{Arc, OnceLock};

use buffer::BufferPin;

pub use assemble::{assemble, ComponentName, ComponentRecord, DctLayout, TableRecord};
pub use buffer::{BufferGuard, SharedBuffer};
pub use error::{Error, ErrorKind, Result};
pub use extract::extract;
pub use handle::{DecoderHandle, HandleState};
pub use layout::{ComponentDescriptor, FinalizedLayout, LayoutPlan, QuantTableDescriptor};
pub use metadata::{CodingProcess, ComponentInfo, ComponentMetadata};
pub use worker::{Extractor, ExtractorBuilder, PendingExtraction};

/// A packed buffer and the description of its contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionResult {
    pub buffer: SharedBuffer,
    pub layout: DctLayout,
}

/// Extracts `source` into a newly allocated buffer of exactly the planned size.
pub fn read_dct(source: &[u8]) -> Result<ExtractionResult> {
    run(prepare(source, None)?)
}

/// Extracts `source` into `dest`, which must hold at least
/// [`LayoutPlan::total_bytes`] bytes. Bytes past the layout are left untouched.
pub fn read_dct_into(source: &[u8], dest: &mut [u8]) -> Result<DctLayout> {
    let mut handle = DecoderHandle::create(source);
    let metadata = handle.read_header()?;
    let plan = LayoutPlan::plan(&metadata)?;
    plan.check_capacity(dest.len())?;
    let finalized = extract(handle, &plan, dest)?;
    Ok(assemble(&finalized))
}

/// Extracts `source` into the caller-supplied shared buffer.
pub fn read_dct_with(source: &[u8], dest: SharedBuffer) -> Result<ExtractionResult> {
    run(prepare(source, Some(dest))?)
}

/// Extracts `source` on the default [`Extractor`].
///
/// See [`Extractor::read_dct_async`].
pub fn read_dct_async(
    source: impl Into<Arc<[u8]>>,
    dest: Option<SharedBuffer>,
) -> PendingExtraction {
    default_extractor().read_dct_async(source, dest)
}

/// Reads the header of `source` and returns the layout an extraction would use.
pub fn plan_layout(source: &[u8]) -> Result<LayoutPlan> {
    let mut handle = DecoderHandle::create(source);
    let metadata = handle.read_header()?;
    handle.close()?;
    LayoutPlan::plan(&metadata)
}

fn default_extractor() -> &'static Extractor {
    static DEFAULT: OnceLock<Extractor> = OnceLock::new();
    DEFAULT.get_or_init(Extractor::default)
}

/// An extraction whose header has been read and whose output buffer has been checked and pinned.
pub(crate) struct Prepared<S: AsRef<[u8]>> {
    handle: DecoderHandle<S>,
    plan: LayoutPlan,
    buffer: BufferPin,
}

/// Reads the header, plans the layout, and pins a validated or newly allocated output buffer.
pub(crate) fn prepare<S: AsRef<[u8]>>(
    source: S,
    dest: Option<SharedBuffer>,
) -> Result<Prepared<S>> {
    let mut handle = DecoderHandle::create(source);
    let metadata = handle.read_header()?;
    let plan = LayoutPlan::plan(&metadata)?;
    let buffer = match dest {
        Some(buffer) => {
            let pin = buffer.pin();
            let len = pin.lock().len();
            plan.check_capacity(len)?;
            pin
        }
        None => SharedBuffer::try_zeroed(plan.total_bytes())
            .ok_or_else(Error::layout_overflow)?
            .pin(),
    };
    Ok(Prepared {
        handle,
        plan,
        buffer,
    })
}

/// Runs a prepared extraction. The buffer is unpinned when this returns.
pub(crate) fn run<S: AsRef<[u8]>>(prepared: Prepared<S>) -> Result<ExtractionResult> {
    let Prepared {
        handle,
        plan,
        buffer,
    } = prepared;
    let finalized = {
        let mut bytes = buffer.lock();
        extract(handle, &plan, &mut bytes)?
    };
    Ok(ExtractionResult {
        layout: assemble(&finalized),
        buffer: buffer.buffer().clone(),
    })
}
