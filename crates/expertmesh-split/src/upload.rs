//! Shard upload
//!
//! Splits a tensor's full byte blob along the expert axis and pushes each
//! slice to its owning endpoint. The expert axis is the outermost
//! dimension and therefore contiguous in memory, so the slice boundaries
//! are exact byte offsets with no restriding.

use tracing::debug;

use crate::buffer::{Placement, SplitBuffer};
use crate::error::{SplitError, SplitResult};

impl SplitBuffer {
    /// Write a tensor's full data, sharding expert tensors across their
    /// owning endpoints
    ///
    /// `bytes` must be exactly the tensor's full byte size in its natural
    /// layout. Each shard is written at offset 0 of its endpoint's
    /// sub-buffer.
    pub async fn load_tensor(&self, name: &str, bytes: &[u8]) -> SplitResult<()> {
        if self.is_poisoned() {
            return Err(SplitError::Poisoned);
        }
        let shards = self.entry(name)?;
        if bytes.len() as u64 != shards.meta.byte_size() {
            return Err(SplitError::ShapeMismatch(format!(
                "tensor '{}' is {} bytes, got {}",
                name,
                shards.meta.byte_size(),
                bytes.len()
            )));
        }

        match &shards.placement {
            Placement::Single { handle } => {
                let client = &self.buffer_type().clients()[0];
                self.track(client.upload(*handle, 0, bytes).await)?;
            }
            Placement::Split { plan, handles } => {
                let bytes_per_expert = shards.meta.bytes_per_outer() as usize;
                for (i, range) in plan.ranges().iter().enumerate() {
                    if range.is_empty() {
                        continue;
                    }
                    let handle = handles[i].ok_or_else(|| {
                        SplitError::ShapeMismatch(format!(
                            "tensor '{}' has no shard on endpoint {}",
                            name, i
                        ))
                    })?;
                    let slice = &bytes
                        [range.lo as usize * bytes_per_expert..range.hi as usize * bytes_per_expert];
                    let client = &self.buffer_type().clients()[i];
                    self.track(client.upload(handle, 0, slice).await)?;
                    debug!(
                        tensor = name,
                        endpoint = i,
                        experts = range.width(),
                        nbytes = slice.len(),
                        "shard uploaded"
                    );
                }
            }
        }
        Ok(())
    }
}
