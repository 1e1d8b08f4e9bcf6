use std::path::Path;

use crate::config::Config;

pub fn validate(cfg: &Config) -> Result<(), String> {
    if cfg.mux.ip_hash_size == 0 {
        return Err("mux.ip_hash_size must be > 0".into());
    }
    if cfg.mux.tcp_hash_size == 0 {
        return Err("mux.tcp_hash_size must be > 0".into());
    }
    if cfg.mux.ip_timeout_secs == 0 {
        return Err("mux.ip_timeout_secs must be > 0".into());
    }
    if cfg.mux.tcp_timeout_secs == 0 {
        return Err("mux.tcp_timeout_secs must be > 0".into());
    }

    for wl in [cfg.ip_wait_list.as_ref(), cfg.tcp_wait_list.as_ref()]
        .into_iter()
        .flatten()
    {
        if wl.max_pending_bytes == 0 {
            return Err(format!("wait-list '{}': max_pending_bytes must be > 0", wl.name));
        }
        if wl.max_pending_packets == 0 {
            return Err(format!("wait-list '{}': max_pending_packets must be > 0", wl.name));
        }
    }

    for binding in &cfg.tcp_ports {
        if binding.port_min > binding.port_max {
            return Err(format!(
                "tcp port binding '{}': port_min {} > port_max {}",
                binding.name, binding.port_min, binding.port_max
            ));
        }
    }

    for filter in &cfg.netmatch {
        if !Path::new(&filter.library_path).exists() {
            return Err(format!(
                "netmatch filter '{}': library not found at {}",
                filter.name, filter.library_path
            ));
        }
    }

    Ok(())
}
