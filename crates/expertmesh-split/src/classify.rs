//! Expert tensor classification
//!
//! Tensor names are hierarchical, e.g. `blk.17.ffn_up_exps.weight`, so the
//! expert markers are matched anywhere in the name rather than as a prefix.
//! The `_exps` suffix on the operator root is what separates the banked
//! expert tensors from their dense `ffn_up`/`ffn_gate`/`ffn_down`
//! counterparts.

/// Name markers of the banked expert weight tensors
pub const EXPERT_TENSOR_MARKERS: [&str; 3] =
    ["ffn_gate_exps", "ffn_up_exps", "ffn_down_exps"];

/// Whether a tensor participates in expert-split allocation
pub fn is_expert_tensor(name: &str) -> bool {
    EXPERT_TENSOR_MARKERS.iter().any(|marker| name.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expert_tensors_match() {
        assert!(is_expert_tensor("blk.0.ffn_gate_exps.weight"));
        assert!(is_expert_tensor("blk.17.ffn_up_exps.weight"));
        assert!(is_expert_tensor("blk.93.ffn_down_exps.weight"));
    }

    #[test]
    fn test_dense_ffn_tensors_do_not_match() {
        assert!(!is_expert_tensor("blk.0.ffn_gate.weight"));
        assert!(!is_expert_tensor("blk.0.ffn_up.weight"));
        assert!(!is_expert_tensor("blk.0.ffn_down.weight"));
    }

    #[test]
    fn test_unrelated_tensors_do_not_match() {
        assert!(!is_expert_tensor("token_embd.weight"));
        assert!(!is_expert_tensor("blk.0.attn_q.weight"));
        assert!(!is_expert_tensor("blk.0.ffn_gate_inp.weight"));
        assert!(!is_expert_tensor(""));
    }
}
