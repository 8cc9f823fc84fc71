//! Split buffer type and split buffer
//!
//! The buffer type is the immutable description of the endpoint group: the
//! connected clients and their normalized memory weights. A buffer
//! allocated from it holds the remote sub-buffers of every tensor placed
//! into it. Expert tensors are partitioned across all endpoints following
//! the split plan; everything else lives whole on endpoint 0.
//!
//! The first transport failure poisons the buffer: remote state can no
//! longer be trusted to match the local shard map, so every later
//! operation fails fast until the owner tears the buffer down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use expertmesh_rpc::{Endpoint, EndpointClient, RpcError, TensorMeta};
use tracing::{debug, info, warn};

use crate::classify::is_expert_tensor;
use crate::config::SplitConfig;
use crate::error::{SplitError, SplitResult};
use crate::plan::{plan_expert, SplitPlan, MAX_ENDPOINTS};

/// Immutable descriptor of the endpoint group a split buffer allocates on
pub struct SplitBufferType {
    clients: Vec<Arc<EndpointClient>>,
    /// Normalized to sum to 1
    weights: Vec<f32>,
}

impl SplitBufferType {
    /// Connect to every endpoint in the configuration
    ///
    /// Fails on the first endpoint that cannot be reached, naming it.
    pub async fn connect(config: &SplitConfig) -> SplitResult<Arc<Self>> {
        let mut clients = Vec::with_capacity(config.endpoints.len());
        for endpoint in &config.endpoints {
            let client = EndpointClient::connect(endpoint.clone()).await?;
            clients.push(Arc::new(client));
        }
        Self::from_clients(clients, config.weights.clone())
    }

    /// Build a buffer type over already-connected clients
    pub fn from_clients(
        clients: Vec<Arc<EndpointClient>>,
        weights: Vec<f32>,
    ) -> SplitResult<Arc<Self>> {
        if clients.is_empty() {
            return Err(SplitError::Config("endpoint list is empty".to_string()));
        }
        if clients.len() > MAX_ENDPOINTS {
            return Err(SplitError::Config(format!(
                "{} endpoints exceeds the maximum of {}",
                clients.len(),
                MAX_ENDPOINTS
            )));
        }
        if clients.len() != weights.len() {
            return Err(SplitError::Config(format!(
                "{} endpoints but {} weights",
                clients.len(),
                weights.len()
            )));
        }
        let weights = crate::plan::normalize_weights(&weights)?
            .into_iter()
            .map(|w| w as f32)
            .collect();
        info!(endpoints = clients.len(), "split buffer type ready");
        Ok(Arc::new(Self { clients, weights }))
    }

    pub fn endpoint_count(&self) -> usize {
        self.clients.len()
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.clients.iter().map(|c| c.endpoint().clone()).collect()
    }

    pub fn clients(&self) -> &[Arc<EndpointClient>] {
        &self.clients
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    /// Expert split plan for a tensor placed into buffers of this type
    pub fn plan_for(&self, meta: &TensorMeta) -> SplitResult<SplitPlan> {
        plan_expert(meta.outer_dim() as u32, &self.weights)
    }

    /// Allocate a fresh split buffer of this type
    pub fn alloc_buffer(self: &Arc<Self>) -> SplitBuffer {
        SplitBuffer {
            buft: Arc::clone(self),
            tensors: Mutex::new(HashMap::new()),
            poisoned: AtomicBool::new(false),
        }
    }
}

/// Where one tensor's bytes physically live
#[derive(Debug, Clone)]
pub enum Placement {
    /// Whole tensor on endpoint 0
    Single { handle: u64 },
    /// Partitioned along the expert axis; `handles[i]` is `None` where
    /// endpoint `i` owns no experts of this tensor
    Split { plan: SplitPlan, handles: Vec<Option<u64>> },
}

/// Remote storage of one tensor
#[derive(Debug, Clone)]
pub struct TensorShards {
    pub meta: TensorMeta,
    pub placement: Placement,
}

impl TensorShards {
    pub fn is_split(&self) -> bool {
        matches!(self.placement, Placement::Split { .. })
    }
}

/// A logical buffer whose tensors are stored as remote sub-buffers
pub struct SplitBuffer {
    buft: Arc<SplitBufferType>,
    tensors: Mutex<HashMap<String, TensorShards>>,
    poisoned: AtomicBool,
}

impl SplitBuffer {
    pub fn buffer_type(&self) -> &Arc<SplitBufferType> {
        &self.buft
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Mark the buffer unusable after a transport failure
    pub fn poison(&self) {
        if !self.poisoned.swap(true, Ordering::AcqRel) {
            warn!("split buffer poisoned");
        }
    }

    fn ensure_usable(&self) -> SplitResult<()> {
        if self.is_poisoned() {
            Err(SplitError::Poisoned)
        } else {
            Ok(())
        }
    }

    /// Poison on transport failure, pass every error through
    pub(crate) fn track<T>(&self, result: Result<T, RpcError>) -> SplitResult<T> {
        match result {
            Ok(v) => Ok(v),
            Err(e) => {
                if matches!(e, RpcError::Transport(_)) {
                    self.poison();
                }
                Err(e.into())
            }
        }
    }

    /// Snapshot of one tensor's shard layout
    pub fn entry(&self, name: &str) -> SplitResult<TensorShards> {
        let tensors = self.tensors.lock().expect("tensor map lock");
        tensors
            .get(name)
            .cloned()
            .ok_or_else(|| SplitError::UnknownTensor(name.to_string()))
    }

    /// Whether a tensor was placed with the expert split layout
    pub fn is_split_tensor(&self, name: &str) -> SplitResult<bool> {
        Ok(self.entry(name)?.is_split())
    }

    /// Names of all tensors currently allocated in this buffer
    pub fn tensor_names(&self) -> Vec<String> {
        let tensors = self.tensors.lock().expect("tensor map lock");
        let mut names: Vec<String> = tensors.keys().cloned().collect();
        names.sort();
        names
    }

    /// Allocate remote storage for a tensor
    ///
    /// Expert tensors (by name) get one sub-buffer per owning endpoint,
    /// sized to that endpoint's expert share; everything else gets a single
    /// full-size sub-buffer on endpoint 0.
    pub async fn alloc_tensor(&self, name: &str, meta: &TensorMeta) -> SplitResult<()> {
        self.ensure_usable()?;
        {
            let tensors = self.tensors.lock().expect("tensor map lock");
            if tensors.contains_key(name) {
                return Err(SplitError::Config(format!("tensor '{}' already allocated", name)));
            }
        }

        let placement = if is_expert_tensor(name) {
            let plan = self.buft.plan_for(meta)?;
            let bytes_per_expert = meta.bytes_per_outer();
            let mut handles: Vec<Option<u64>> = Vec::with_capacity(plan.len());
            for (i, range) in plan.ranges().iter().enumerate() {
                if range.is_empty() {
                    handles.push(None);
                    continue;
                }
                let size = range.width() as u64 * bytes_per_expert;
                let client = &self.buft.clients()[i];
                match self.track(client.alloc(size).await) {
                    Ok(handle) => handles.push(Some(handle)),
                    Err(e) => {
                        self.release_handles(&handles).await;
                        return Err(e);
                    }
                }
            }
            debug!(
                tensor = name,
                experts = meta.outer_dim(),
                shards = plan.ranges().iter().filter(|r| !r.is_empty()).count(),
                "expert tensor split across endpoints"
            );
            Placement::Split { plan, handles }
        } else {
            let client = &self.buft.clients()[0];
            let handle = self.track(client.alloc(meta.byte_size()).await)?;
            Placement::Single { handle }
        };

        let mut tensors = self.tensors.lock().expect("tensor map lock");
        tensors.insert(name.to_string(), TensorShards { meta: meta.clone(), placement });
        Ok(())
    }

    /// Free one tensor's remote storage
    pub async fn free_tensor(&self, name: &str) -> SplitResult<()> {
        let shards = {
            let mut tensors = self.tensors.lock().expect("tensor map lock");
            tensors
                .remove(name)
                .ok_or_else(|| SplitError::UnknownTensor(name.to_string()))?
        };
        self.free_shards(shards).await
    }

    /// Tear down every remote sub-buffer
    ///
    /// Every shard is attempted even after a failure; the first error is
    /// surfaced once the sweep finishes.
    pub async fn free_all(&self) -> SplitResult<()> {
        let drained: Vec<TensorShards> = {
            let mut tensors = self.tensors.lock().expect("tensor map lock");
            tensors.drain().map(|(_, shards)| shards).collect()
        };
        let mut first_err = None;
        for shards in drained {
            if let Err(e) = self.free_shards(shards).await {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    async fn free_shards(&self, shards: TensorShards) -> SplitResult<()> {
        let mut first_err = None;
        match shards.placement {
            Placement::Single { handle } => {
                if let Err(e) = self.track(self.buft.clients()[0].free(handle).await) {
                    first_err.get_or_insert(e);
                }
            }
            Placement::Split { handles, .. } => {
                for (i, handle) in handles.iter().enumerate() {
                    if let Some(handle) = handle {
                        let client = &self.buft.clients()[i];
                        if let Err(e) = self.track(client.free(*handle).await) {
                            first_err.get_or_insert(e);
                        }
                    }
                }
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Best-effort rollback of a partial allocation
    async fn release_handles(&self, handles: &[Option<u64>]) {
        for (i, handle) in handles.iter().enumerate() {
            if let Some(handle) = handle {
                let _ = self.buft.clients()[i].free(*handle).await;
            }
        }
    }
}
