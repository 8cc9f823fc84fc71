//! End-to-end dispatch tests against in-process reference endpoints

use std::sync::Arc;

use candle_core::{Device, Tensor};
use expertmesh_dispatch::{DispatchError, Dispatcher, Profiler};
use expertmesh_rpc::{
    protocol::full_caps, Command, Dtype, Endpoint, EndpointClient, EndpointServer, RoutingIds,
    RunningServer, TensorMeta,
};
use expertmesh_split::{SplitBuffer, SplitBufferType, SplitError};

const D_IN: usize = 4;
const D_OUT: usize = 4;
const N_EXPERT: usize = 8;

/// Deterministic weight value for expert `e`, output row `j`, input col `i`
fn weight_at(e: usize, j: usize, i: usize) -> f32 {
    ((e * 31 + j * 7 + i * 3) % 13) as f32 * 0.25 - 1.5
}

/// Deterministic activation value for token `t`, input col `i`
fn activation_at(t: usize, i: usize) -> f32 {
    ((t * 5 + i) % 7) as f32 * 0.5 - 1.0
}

fn weight_values() -> Vec<f32> {
    let mut w = Vec::with_capacity(N_EXPERT * D_OUT * D_IN);
    for e in 0..N_EXPERT {
        for j in 0..D_OUT {
            for i in 0..D_IN {
                w.push(weight_at(e, j, i));
            }
        }
    }
    w
}

fn activation_tensor(n_tokens: usize) -> Tensor {
    let mut a = Vec::with_capacity(n_tokens * D_IN);
    for t in 0..n_tokens {
        for i in 0..D_IN {
            a.push(activation_at(t, i));
        }
    }
    Tensor::from_vec(a, (n_tokens, D_IN), &Device::Cpu).unwrap()
}

/// Direct single-device oracle: `out[t] = sum over selections of W[e] · x[t]`
fn direct_mul_mat_id(routing: &RoutingIds) -> Vec<f32> {
    let n_tokens = routing.n_tokens as usize;
    let mut out = vec![0.0f32; n_tokens * D_OUT];
    for t in 0..n_tokens {
        for &e in routing.token_ids(t) {
            for j in 0..D_OUT {
                let mut acc = 0.0f32;
                for i in 0..D_IN {
                    acc += weight_at(e as usize, j, i) * activation_at(t, i);
                }
                out[t * D_OUT + j] += acc;
            }
        }
    }
    out
}

fn assert_close(actual: &[f32], expected: &[f32], rel_tol: f32) {
    assert_eq!(actual.len(), expected.len());
    for (idx, (a, b)) in actual.iter().zip(expected).enumerate() {
        let scale = b.abs().max(1.0);
        assert!(
            (a - b).abs() <= rel_tol * scale,
            "value {} differs: {} vs {}",
            idx,
            a,
            b
        );
    }
}

async fn spawn_cluster(caps: &[u64]) -> (Vec<RunningServer>, Arc<SplitBufferType>) {
    let mut servers = Vec::new();
    let mut clients = Vec::new();
    for &mask in caps {
        let server = EndpointServer::new()
            .with_caps(mask)
            .bind("127.0.0.1:0")
            .await
            .unwrap();
        let client = EndpointClient::connect(Endpoint::new("127.0.0.1", server.port(), 0))
            .await
            .unwrap();
        servers.push(server);
        clients.push(Arc::new(client));
    }
    let weights = vec![1.0f32; caps.len()];
    let buft = SplitBufferType::from_clients(clients, weights).unwrap();
    (servers, buft)
}

async fn load_expert_tensor(buffer: &SplitBuffer, name: &str) -> TensorMeta {
    let meta = TensorMeta::new(&[D_IN as u64, D_OUT as u64, N_EXPERT as u64], Dtype::F32);
    buffer.alloc_tensor(name, &meta).await.unwrap();
    let bytes = expertmesh_rpc::protocol::f32s_to_bytes(&weight_values());
    buffer.load_tensor(name, &bytes).await.unwrap();
    meta
}

fn test_dispatcher() -> (Dispatcher, Arc<Profiler>) {
    let profiler = Arc::new(Profiler::new());
    profiler.set_enabled(true);
    (Dispatcher::with_profiler(Arc::clone(&profiler)), profiler)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_partial_dispatch_matches_direct_compute() {
    let (_servers, buft) = spawn_cluster(&[full_caps(), full_caps()]).await;
    let buffer = buft.alloc_buffer();
    load_expert_tensor(&buffer, "blk.0.ffn_up_exps.weight").await;

    // tokens route to experts [1,5], [2,3], [4,6], [0,7]: both endpoints of
    // the 2x4 split see work for three of the four tokens
    let routing = RoutingIds::new(2, 4, vec![1, 5, 2, 3, 4, 6, 0, 7]).unwrap();
    let activations = activation_tensor(4);

    let (dispatcher, profiler) = test_dispatcher();
    let output = dispatcher
        .mul_mat_id(&buffer, "blk.0.ffn_up_exps.weight", &activations, &routing)
        .await
        .unwrap();

    assert_eq!(output.dims(), &[4, D_OUT]);
    let actual = output.flatten_all().unwrap().to_vec1::<f32>().unwrap();
    assert_close(&actual, &direct_mul_mat_id(&routing), 1e-5);

    let snapshot = profiler.snapshot();
    assert_eq!(snapshot.per_endpoint.len(), 2);
    assert_eq!(snapshot.per_endpoint[0].samples, 1);
    assert_eq!(snapshot.per_endpoint[1].samples, 1);
    // every expert was selected exactly once
    for activation in &snapshot.top_experts {
        assert_eq!(activation.count, 1);
    }
    assert_eq!(snapshot.top_experts.len(), N_EXPERT);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_idle_endpoint_is_skipped() {
    let (_servers, buft) = spawn_cluster(&[full_caps(), full_caps()]).await;
    let buffer = buft.alloc_buffer();
    load_expert_tensor(&buffer, "blk.0.ffn_gate_exps.weight").await;

    // experts 0..4 all live on endpoint 0
    let routing = RoutingIds::new(2, 2, vec![0, 1, 2, 3]).unwrap();
    let activations = activation_tensor(2);

    let (dispatcher, profiler) = test_dispatcher();
    let output = dispatcher
        .mul_mat_id(&buffer, "blk.0.ffn_gate_exps.weight", &activations, &routing)
        .await
        .unwrap();

    let actual = output.flatten_all().unwrap().to_vec1::<f32>().unwrap();
    assert_close(&actual, &direct_mul_mat_id(&routing), 1e-5);

    let snapshot = profiler.snapshot();
    assert_eq!(snapshot.per_endpoint[0].samples, 1);
    assert!(snapshot.per_endpoint.len() < 2 || snapshot.per_endpoint[1].samples == 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_gather_fallback_matches_direct_compute() {
    // endpoint 1 is a legacy server without partial matmul
    let legacy = full_caps() & !Command::MulMatIdPartial.cap_bit();
    let (_servers, buft) = spawn_cluster(&[full_caps(), legacy]).await;
    let buffer = buft.alloc_buffer();
    load_expert_tensor(&buffer, "blk.0.ffn_down_exps.weight").await;

    let routing = RoutingIds::new(2, 4, vec![1, 5, 2, 3, 4, 6, 0, 7]).unwrap();
    let activations = activation_tensor(4);

    let (dispatcher, profiler) = test_dispatcher();
    let output = dispatcher
        .mul_mat_id(&buffer, "blk.0.ffn_down_exps.weight", &activations, &routing)
        .await
        .unwrap();

    let actual = output.flatten_all().unwrap().to_vec1::<f32>().unwrap();
    assert_close(&actual, &direct_mul_mat_id(&routing), 1e-5);

    // activations are profiled on the gather path too
    let snapshot = profiler.snapshot();
    assert_eq!(snapshot.top_experts.len(), N_EXPERT);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_f16_weights_widen_on_the_endpoint() {
    let (_servers, buft) = spawn_cluster(&[full_caps(), full_caps()]).await;
    let buffer = buft.alloc_buffer();

    let meta = TensorMeta::new(&[D_IN as u64, D_OUT as u64, N_EXPERT as u64], Dtype::F16);
    buffer.alloc_tensor("blk.0.ffn_up_exps.weight", &meta).await.unwrap();
    let bytes: Vec<u8> = weight_values()
        .iter()
        .flat_map(|&v| half::f16::from_f32(v).to_le_bytes())
        .collect();
    buffer.load_tensor("blk.0.ffn_up_exps.weight", &bytes).await.unwrap();

    let routing = RoutingIds::new(2, 4, vec![1, 5, 2, 3, 4, 6, 0, 7]).unwrap();
    let activations = activation_tensor(4);

    let (dispatcher, _profiler) = test_dispatcher();
    let output = dispatcher
        .mul_mat_id(&buffer, "blk.0.ffn_up_exps.weight", &activations, &routing)
        .await
        .unwrap();

    let actual = output.flatten_all().unwrap().to_vec1::<f32>().unwrap();
    // the reference values here are exactly representable in f16, so the
    // widened compute still lands within f32 tolerance
    assert_close(&actual, &direct_mul_mat_id(&routing), 1e-3);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dead_endpoint_poisons_buffer() {
    let (servers, buft) = spawn_cluster(&[full_caps(), full_caps()]).await;
    let buffer = buft.alloc_buffer();
    load_expert_tensor(&buffer, "blk.0.ffn_up_exps.weight").await;

    servers[1].shutdown();
    // give the abort a moment to drop the connection
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let routing = RoutingIds::new(2, 4, vec![1, 5, 2, 3, 4, 6, 0, 7]).unwrap();
    let activations = activation_tensor(4);

    let (dispatcher, _profiler) = test_dispatcher();
    let result = dispatcher
        .mul_mat_id(&buffer, "blk.0.ffn_up_exps.weight", &activations, &routing)
        .await;
    assert!(result.is_err());
    assert!(buffer.is_poisoned());

    // later operations fail fast without touching the network
    let result = dispatcher
        .mul_mat_id(&buffer, "blk.0.ffn_up_exps.weight", &activations, &routing)
        .await;
    assert!(matches!(result, Err(DispatchError::Split(SplitError::Poisoned))));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shape_mismatches_rejected() {
    let (_servers, buft) = spawn_cluster(&[full_caps(), full_caps()]).await;
    let buffer = buft.alloc_buffer();
    load_expert_tensor(&buffer, "blk.0.ffn_up_exps.weight").await;
    let (dispatcher, _profiler) = test_dispatcher();

    // routing token count disagrees with activations
    let routing = RoutingIds::new(2, 3, vec![0; 6]).unwrap();
    let activations = activation_tensor(4);
    let result = dispatcher
        .mul_mat_id(&buffer, "blk.0.ffn_up_exps.weight", &activations, &routing)
        .await;
    assert!(matches!(result, Err(DispatchError::ShapeMismatch(_))));

    // routing selects an expert that does not exist
    let routing = RoutingIds::new(2, 4, vec![0, 1, 2, 3, 4, 5, 6, 99]).unwrap();
    let result = dispatcher
        .mul_mat_id(&buffer, "blk.0.ffn_up_exps.weight", &activations, &routing)
        .await;
    assert!(matches!(result, Err(DispatchError::ShapeMismatch(_))));

    // dispatching a tensor that was never split
    let dense = TensorMeta::new(&[D_IN as u64, D_OUT as u64], Dtype::F32);
    buffer.alloc_tensor("output.weight", &dense).await.unwrap();
    let routing = RoutingIds::new(2, 4, vec![0; 8]).unwrap();
    let result = dispatcher
        .mul_mat_id(&buffer, "output.weight", &activations, &routing)
        .await;
    assert!(matches!(result, Err(DispatchError::ShapeMismatch(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_teardown_frees_remote_shards() {
    let (_servers, buft) = spawn_cluster(&[full_caps(), full_caps()]).await;
    let buffer = buft.alloc_buffer();
    load_expert_tensor(&buffer, "blk.0.ffn_up_exps.weight").await;
    load_expert_tensor(&buffer, "blk.1.ffn_up_exps.weight").await;

    assert_eq!(buffer.tensor_names().len(), 2);
    buffer.free_all().await.unwrap();
    assert!(buffer.tensor_names().is_empty());
    assert!(matches!(
        buffer.entry("blk.0.ffn_up_exps.weight"),
        Err(SplitError::UnknownTensor(_))
    ));
}
