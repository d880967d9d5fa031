use crate::error::Result;
use crate::types::ClusterConfig;
use std::fs;
use std::path::Path;

/// Loads a cluster configuration from a JSON file and validates it.
pub fn load_config(path: impl AsRef<Path>) -> Result<ClusterConfig> {
    let data = fs::read_to_string(path)?;
    let config: ClusterConfig = serde_json::from_str(&data)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QuorumError;
    use std::io::Write;

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"nodes":[1,2,3,4,5],"election_timeout_ms":300,"heartbeat_interval_ms":100}}"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.nodes, vec![1, 2, 3, 4, 5]);
        assert_eq!(config.election_timeout_ms, 300);
        assert_eq!(config.rpc_timeout_ms, 100);
    }

    #[test]
    fn test_load_config_rejects_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"nodes":[]}}"#).unwrap();

        assert!(matches!(load_config(file.path()), Err(QuorumError::Config(_))));
    }

    #[test]
    fn test_load_config_missing_file() {
        assert!(matches!(
            load_config("/nonexistent/quorum.json"),
            Err(QuorumError::Io(_))
        ));
    }
}
