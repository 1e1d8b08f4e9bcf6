use std::fs;
use std::path::Path;

use crate::config::Config;
use crate::error::{EngineError, Result};

pub fn load_from_path<P: AsRef<Path>>(p: P) -> Result<Config> {
    let txt = fs::read_to_string(p)
        .map_err(|e| EngineError::Config(format!("failed to read config file: {e}")))?;
    let cfg: Config = toml::from_str(&txt)
        .map_err(|e| EngineError::Config(format!("failed to parse config: {e}")))?;

    super::validator::validate(&cfg).map_err(EngineError::Config)?;

    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn loads_a_well_formed_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [mux]
            ip_hash_size = 4096

            [[tcp_ports]]
            name = "http"
            port_min = 80
            port_max = 80
            "#
        )
        .unwrap();

        let cfg = load_from_path(file.path()).unwrap();
        assert_eq!(cfg.mux.ip_hash_size, 4096);
        assert_eq!(cfg.tcp_ports.len(), 1);
        assert_eq!(cfg.tcp_ports[0].name, "http");
    }

    #[test]
    fn rejects_a_config_that_fails_validation() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[mux]\nip_hash_size = 0\n").unwrap();

        let err = load_from_path(file.path()).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn missing_file_is_an_io_wrapped_config_error() {
        let err = load_from_path("/nonexistent/flowtap.toml").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }
}
