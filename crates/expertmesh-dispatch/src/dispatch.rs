//! Distributed MUL_MAT_ID dispatch
//!
//! One call per MoE layer per inference step. The dispatcher looks up the
//! weight tensor's split plan, fans a partial-compute request out to every
//! endpoint whose expert range the routing touches, and sums the dense
//! partial outputs. Each endpoint receives the full routing tensor plus
//! its own `[lo, hi)` and zeroes the rows it does not own, so accumulation
//! is a plain elementwise add with no token remapping.

use std::sync::Arc;
use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use expertmesh_rpc::{
    protocol::{bytes_to_f32s, f32s_to_bytes},
    ActivationsRef, Command, EndpointClient, MulMatIdPartialRequest, RoutingIds, RpcError,
    TensorMeta,
};
use expertmesh_split::{Placement, SplitBuffer, SplitError, SplitPlan};
use tracing::{debug, warn};

use crate::error::{DispatchError, DispatchResult};
use crate::profiler::Profiler;

/// Orchestrates distributed routed matmuls over a split buffer
pub struct Dispatcher {
    profiler: Arc<Profiler>,
}

impl Dispatcher {
    /// Dispatcher reporting into the process-wide profiler
    pub fn new() -> Self {
        Self { profiler: Profiler::global() }
    }

    /// Dispatcher reporting into a caller-owned profiler
    pub fn with_profiler(profiler: Arc<Profiler>) -> Self {
        Self { profiler }
    }

    pub fn profiler(&self) -> &Arc<Profiler> {
        &self.profiler
    }

    /// Compute `out[t] = sum over selected experts e of W[e] · x[t]`
    ///
    /// `weight` names an expert-split tensor in `buffer` with shape
    /// `[d_in, d_out, n_expert]`. `activations` is `(n_tokens, d_in)` and
    /// the result is `(n_tokens, d_out)`, both f32 on the CPU device.
    ///
    /// Endpoints without MUL_MAT_ID_PARTIAL support force the gather path:
    /// the full weight tensor is reassembled locally and multiplied on the
    /// spot. Slower, same result.
    pub async fn mul_mat_id(
        &self,
        buffer: &SplitBuffer,
        weight: &str,
        activations: &Tensor,
        routing: &RoutingIds,
    ) -> DispatchResult<Tensor> {
        if buffer.is_poisoned() {
            return Err(SplitError::Poisoned.into());
        }

        let shards = buffer.entry(weight)?;
        let (plan, handles) = match &shards.placement {
            Placement::Split { plan, handles } => (plan.clone(), handles.clone()),
            Placement::Single { .. } => {
                return Err(DispatchError::ShapeMismatch(format!(
                    "tensor '{}' is not expert-split",
                    weight
                )))
            }
        };

        let meta = &shards.meta;
        if meta.dims.len() != 3 {
            return Err(DispatchError::ShapeMismatch(format!(
                "weight '{}' must be rank 3, got {:?}",
                weight, meta.dims
            )));
        }
        let d_in = meta.dims[0] as usize;
        let d_out = meta.dims[1] as usize;
        let n_expert = meta.dims[2] as u32;

        let act_dims = activations.dims();
        if act_dims.len() != 2 || act_dims[1] != d_in {
            return Err(DispatchError::ShapeMismatch(format!(
                "activations {:?} do not match weight input dim {}",
                act_dims, d_in
            )));
        }
        let n_tokens = act_dims[0];
        if routing.n_tokens as usize != n_tokens {
            return Err(DispatchError::ShapeMismatch(format!(
                "routing covers {} tokens, activations hold {}",
                routing.n_tokens, n_tokens
            )));
        }
        if let Some(&bad) = routing.ids.iter().find(|&&id| id >= n_expert) {
            return Err(DispatchError::ShapeMismatch(format!(
                "routing selects expert {} of {}",
                bad, n_expert
            )));
        }
        if n_tokens == 0 {
            return Ok(Tensor::zeros((0, d_out), DType::F32, &Device::Cpu)?);
        }

        let act_f32 = activations
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;

        let clients = buffer.buffer_type().clients();
        let owners: Vec<usize> = plan
            .ranges()
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.is_empty())
            .map(|(i, _)| i)
            .collect();

        // A single endpoint stuck on an old protocol degrades the whole
        // dispatch, not just its own shard: partial outputs only sum if
        // every owner computes one.
        let all_partial = owners
            .iter()
            .all(|&i| clients[i].supports(Command::MulMatIdPartial));
        if !all_partial {
            warn!(tensor = weight, "endpoint without partial matmul support, gathering");
            return self
                .gather_mul_mat_id(buffer, meta, &plan, &handles, &act_f32, routing, d_out)
                .await;
        }

        let output = self
            .fan_out(
                buffer, meta, &plan, &handles, clients, &act_f32, routing, d_in, d_out, n_tokens,
            )
            .await?;

        self.profiler.record_activations(routing.ids.iter().copied());
        Ok(Tensor::from_vec(output, (n_tokens, d_out), &Device::Cpu)?)
    }

    #[allow(clippy::too_many_arguments)]
    async fn fan_out(
        &self,
        buffer: &SplitBuffer,
        meta: &TensorMeta,
        plan: &SplitPlan,
        handles: &[Option<u64>],
        clients: &[Arc<EndpointClient>],
        activations: &[f32],
        routing: &RoutingIds,
        d_in: usize,
        d_out: usize,
        n_tokens: usize,
    ) -> DispatchResult<Vec<f32>> {
        let act_bytes = f32s_to_bytes(activations);

        let mut tasks = Vec::new();
        for (i, range) in plan.ranges().iter().enumerate() {
            if range.is_empty() || !routing.intersects(range.lo, range.hi) {
                continue;
            }
            let handle = handles[i].ok_or_else(|| {
                DispatchError::Internal(format!("endpoint {} owns experts but has no shard", i))
            })?;
            let request = MulMatIdPartialRequest {
                weight_handle: handle,
                weight_meta: TensorMeta::new(
                    &[d_in as u64, d_out as u64, range.width() as u64],
                    meta.dtype,
                ),
                activations: ActivationsRef::Inline(act_bytes.clone()),
                routing: routing.clone(),
                expert_lo: range.lo,
                expert_hi: range.hi,
            };
            let client = Arc::clone(&clients[i]);
            let profiler = Arc::clone(&self.profiler);
            tasks.push(tokio::spawn(async move {
                let start = Instant::now();
                let bytes = client.mul_mat_id_partial(&request).await?;
                profiler.record(i, start.elapsed());
                Ok::<(usize, Vec<u8>), RpcError>((i, bytes))
            }));
        }

        debug!(
            tokens = n_tokens,
            top_k = routing.top_k,
            endpoints = tasks.len(),
            "partial matmuls in flight"
        );

        let joined = futures::future::try_join_all(tasks)
            .await
            .map_err(|e| DispatchError::Internal(format!("dispatch task failed: {}", e)))?;

        let mut output = vec![0.0f32; d_out * n_tokens];
        for result in joined {
            let (endpoint, bytes) = match result {
                Ok(v) => v,
                Err(e) => {
                    if matches!(e, RpcError::Transport(_)) {
                        buffer.poison();
                    }
                    return Err(e.into());
                }
            };
            let partial = bytes_to_f32s(&bytes)?;
            if partial.len() != output.len() {
                return Err(DispatchError::ShapeMismatch(format!(
                    "endpoint {} returned {} values, expected {}",
                    endpoint,
                    partial.len(),
                    output.len()
                )));
            }
            for (o, p) in output.iter_mut().zip(&partial) {
                *o += p;
            }
        }
        Ok(output)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
