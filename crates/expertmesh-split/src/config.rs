//! Endpoint/weight configuration parsing
//!
//! The operator hands the system one string of the form
//! `"host1:port1,host2:port2|w1,w2"`. The part after `|` weights each
//! endpoint's share of the expert bank, typically by free device memory;
//! omitting it means equal shares.

use expertmesh_rpc::Endpoint;
use serde::{Deserialize, Serialize};

use crate::error::{SplitError, SplitResult};
use crate::plan::{normalize_weights, MAX_ENDPOINTS};

/// Parsed and normalized split configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitConfig {
    pub endpoints: Vec<Endpoint>,
    /// Normalized to sum to 1
    pub weights: Vec<f32>,
}

impl SplitConfig {
    /// Parse an `"endpoints|weights"` string
    pub fn parse(raw: &str) -> SplitResult<Self> {
        let raw = raw.trim();
        let (endpoint_part, weight_part) = match raw.split_once('|') {
            Some((e, w)) => (e, Some(w)),
            None => (raw, None),
        };

        let endpoints: Vec<Endpoint> = endpoint_part
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(parse_endpoint)
            .collect::<SplitResult<_>>()?;

        if endpoints.is_empty() {
            return Err(SplitError::Config("endpoint list is empty".to_string()));
        }
        if endpoints.len() > MAX_ENDPOINTS {
            return Err(SplitError::Config(format!(
                "{} endpoints exceeds the maximum of {}",
                endpoints.len(),
                MAX_ENDPOINTS
            )));
        }

        let raw_weights = match weight_part {
            None => vec![1.0f32; endpoints.len()],
            Some(w) => {
                let weights: Vec<f32> = w
                    .split(',')
                    .map(|s| {
                        let s = s.trim();
                        s.parse::<f32>().map_err(|_| {
                            SplitError::Config(format!("weight '{}' is not a number", s))
                        })
                    })
                    .collect::<SplitResult<_>>()?;
                if weights.len() != endpoints.len() {
                    return Err(SplitError::Config(format!(
                        "{} endpoints but {} weights",
                        endpoints.len(),
                        weights.len()
                    )));
                }
                weights
            }
        };

        let weights = normalize_weights(&raw_weights)?
            .into_iter()
            .map(|w| w as f32)
            .collect();

        Ok(Self { endpoints, weights })
    }
}

fn parse_endpoint(s: &str) -> SplitResult<Endpoint> {
    let s = s.trim();
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| SplitError::Config(format!("endpoint '{}' is missing a port", s)))?;
    if host.is_empty() {
        return Err(SplitError::Config(format!("endpoint '{}' is missing a host", s)));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| SplitError::Config(format!("endpoint '{}' has a bad port", s)))?;
    Ok(Endpoint::new(host, port, 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoints_and_weights() {
        let config = SplitConfig::parse("10.0.0.1:50052,10.0.0.2:50052|24,12").unwrap();
        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.endpoints[0], Endpoint::new("10.0.0.1", 50052, 0));
        assert!((config.weights[0] - 2.0 / 3.0).abs() < 1e-6);
        assert!((config.weights.iter().sum::<f32>() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_missing_weights_means_uniform() {
        let config = SplitConfig::parse("a:1,b:2,c:3").unwrap();
        assert_eq!(config.weights, vec![1.0 / 3.0; 3]);
    }

    #[test]
    fn test_float_weights_and_whitespace() {
        let config = SplitConfig::parse("  a:1, b:2 | 0.5, 1.5  ").unwrap();
        assert!((config.weights[0] - 0.25).abs() < 1e-6);
        assert!((config.weights[1] - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(SplitConfig::parse(""), Err(SplitError::Config(_))));
        assert!(matches!(SplitConfig::parse("|1,2"), Err(SplitError::Config(_))));
        assert!(matches!(SplitConfig::parse("a:1,b:2|1"), Err(SplitError::Config(_))));
        assert!(matches!(SplitConfig::parse("a:1|x"), Err(SplitError::Config(_))));
        assert!(matches!(SplitConfig::parse("a:1,b:2|1,-2"), Err(SplitError::Config(_))));
        assert!(matches!(SplitConfig::parse("a:notaport"), Err(SplitError::Config(_))));
        assert!(matches!(SplitConfig::parse("nohost"), Err(SplitError::Config(_))));

        let many: String = (0..17).map(|i| format!("h{}:1,", i)).collect();
        assert!(matches!(
            SplitConfig::parse(many.trim_end_matches(',')),
            Err(SplitError::Config(_))
        ));
    }
}
