//! Gather fallback
//!
//! Degraded path for endpoint groups where at least one owner cannot run
//! MUL_MAT_ID_PARTIAL: pull every shard back over the wire, reconstitute
//! the full weight tensor in endpoint order, and run the routed matmul
//! locally. Correct but pays the full weight transfer, so the dispatcher
//! only comes here when the capability probe says it must.

use std::sync::Arc;
use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use expertmesh_rpc::{Command, RoutingIds, RpcError, TensorMeta};
use expertmesh_split::{SplitBuffer, SplitPlan};
use tracing::debug;

use crate::dispatch::Dispatcher;
use crate::error::{DispatchError, DispatchResult};

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn gather_mul_mat_id(
        &self,
        buffer: &SplitBuffer,
        meta: &TensorMeta,
        plan: &SplitPlan,
        handles: &[Option<u64>],
        activations: &[f32],
        routing: &RoutingIds,
        d_out: usize,
    ) -> DispatchResult<Tensor> {
        let clients = buffer.buffer_type().clients();
        let bytes_per_expert = meta.bytes_per_outer();

        let mut tasks = Vec::new();
        for (i, range) in plan.ranges().iter().enumerate() {
            if range.is_empty() {
                continue;
            }
            if !clients[i].supports(Command::Download) {
                return Err(RpcError::ProtocolMismatch(format!(
                    "endpoint {} supports neither partial matmul nor shard download",
                    clients[i].endpoint()
                ))
                .into());
            }
            let handle = handles[i].ok_or_else(|| {
                DispatchError::Internal(format!("endpoint {} owns experts but has no shard", i))
            })?;
            let nbytes = range.width() as u64 * bytes_per_expert;
            let client = Arc::clone(&clients[i]);
            let profiler = Arc::clone(self.profiler());
            let lo = range.lo;
            tasks.push(tokio::spawn(async move {
                let start = Instant::now();
                let bytes = client.download(handle, 0, nbytes).await?;
                profiler.record(i, start.elapsed());
                Ok::<(u32, Vec<u8>), RpcError>((lo, bytes))
            }));
        }

        let joined = futures::future::try_join_all(tasks)
            .await
            .map_err(|e| DispatchError::Internal(format!("gather task failed: {}", e)))?;

        let mut full = vec![0u8; meta.byte_size() as usize];
        for result in joined {
            let (lo, bytes) = match result {
                Ok(v) => v,
                Err(e) => {
                    if matches!(e, RpcError::Transport(_)) {
                        buffer.poison();
                    }
                    return Err(e.into());
                }
            };
            let start = lo as u64 * bytes_per_expert;
            full[start as usize..start as usize + bytes.len()].copy_from_slice(&bytes);
        }
        debug!(nbytes = full.len(), "full weight tensor gathered");

        let output = local_mul_mat_id(meta, &full, activations, routing, d_out)?;
        self.profiler().record_activations(routing.ids.iter().copied());
        Ok(output)
    }
}

/// Routed matmul on the local CPU device
fn local_mul_mat_id(
    meta: &TensorMeta,
    weight_bytes: &[u8],
    activations: &[f32],
    routing: &RoutingIds,
    d_out: usize,
) -> DispatchResult<Tensor> {
    let d_in = meta.dims[0] as usize;
    let n_expert = meta.dims[2] as usize;
    let n_tokens = routing.n_tokens as usize;

    let weights = meta.dtype.decode_f32(weight_bytes)?;
    let w = Tensor::from_vec(weights, (n_expert, d_out, d_in), &Device::Cpu)?;
    let a = Tensor::from_vec(activations.to_vec(), (n_tokens, d_in), &Device::Cpu)?;

    let mut rows = Vec::with_capacity(n_tokens);
    for t in 0..n_tokens {
        let x = a.narrow(0, t, 1)?;
        let mut y = Tensor::zeros((1, d_out), DType::F32, &Device::Cpu)?;
        for &e in routing.token_ids(t) {
            let w_e = w.narrow(0, e as usize, 1)?.reshape((d_out, d_in))?;
            y = (&y + &x.matmul(&w_e.t()?)?)?;
        }
        rows.push(y);
    }
    Ok(Tensor::cat(&rows, 0)?)
}
