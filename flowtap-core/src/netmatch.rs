//! Netmatch filter loading: dynamically loaded shared objects exposing a
//! `match` entry point, each bound to a fixed-size register file it uses
//! for cross-packet scratch state.
//!
//! The loader's error-cleanup-chain mirrors the original dissector's
//! constructor: a library that loads but lacks the expected symbol is
//! rejected and unloaded rather than kept half-initialized.

#![allow(unsafe_code)]

use std::sync::Mutex;

use libloading::{Library, Symbol};

use crate::config::NetmatchFilterConfig;
use crate::error::{EngineError, Result};

/// The ABI a netmatch shared object must expose: a `match` function taking
/// the packet bytes and a mutable register file, returning non-zero on
/// match. Kept `extern "C"` to match a C-compiled filter plugin.
pub type MatchFn = unsafe extern "C" fn(data: *const u8, len: usize, regfile: *mut u64) -> i32;

/// One loaded filter: the library kept alive for as long as `match_fn` may
/// be called, plus its private register file.
pub struct NetmatchFilter {
    name: String,
    _library: Library,
    match_fn: MatchFn,
    regfile: Mutex<Vec<u64>>,
}

impl NetmatchFilter {
    /// Loads `library_path` and resolves its `match` symbol.
    ///
    /// # Safety of the unsafe blocks below
    /// `Library::new` and `get` are unsafe because loading arbitrary code
    /// and trusting its declared signature are both unchecked by the
    /// compiler; the filter's own API design (a sealed registry populated
    /// only from validated config, see [`NetmatchRegistry::load_all`])
    /// bounds this to paths the operator configured, same trust boundary
    /// the original dissector places on `lt_dlopen`.
    fn load(cfg: &NetmatchFilterConfig) -> Result<Self> {
        let library = unsafe { Library::new(&cfg.library_path) }
            .map_err(|e| EngineError::Netmatch(format!("cannot load {}: {e}", cfg.library_path)))?;

        let match_fn = unsafe {
            let sym: Symbol<MatchFn> = library
                .get(b"match\0")
                .map_err(|e| EngineError::Netmatch(format!("no `match` symbol in {}: {e}", cfg.library_path)))?;
            *sym
        };

        Ok(Self {
            name: cfg.name.clone(),
            _library: library,
            match_fn,
            regfile: Mutex::new(vec![0u64; cfg.register_count]),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invokes the filter's `match` function against `data`, passing this
    /// filter's private register file.
    pub fn matches(&self, data: &[u8]) -> bool {
        let mut regs = self.regfile.lock().expect("netmatch regfile mutex poisoned");
        let ret = unsafe { (self.match_fn)(data.as_ptr(), data.len(), regs.as_mut_ptr()) };
        ret != 0
    }
}

/// The set of netmatch filters loaded at startup, looked up by name.
#[derive(Default)]
pub struct NetmatchRegistry {
    filters: Vec<NetmatchFilter>,
}

impl NetmatchRegistry {
    pub fn load_all(configs: &[NetmatchFilterConfig]) -> Result<Self> {
        let mut filters = Vec::with_capacity(configs.len());
        for cfg in configs {
            filters.push(NetmatchFilter::load(cfg)?);
        }
        Ok(Self { filters })
    }

    pub fn get(&self, name: &str) -> Option<&NetmatchFilter> {
        self.filters.iter().find(|f| f.name() == name)
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_library_path_is_a_netmatch_error() {
        let cfg = NetmatchFilterConfig {
            name: "bogus".to_string(),
            library_path: "/nonexistent/path/to/filter.so".to_string(),
            register_count: 0,
        };
        let err = NetmatchFilter::load(&cfg).unwrap_err();
        assert!(matches!(err, EngineError::Netmatch(_)));
    }

    #[test]
    fn empty_registry_has_no_filters() {
        let registry = NetmatchRegistry::load_all(&[]).unwrap();
        assert!(registry.is_empty());
        assert!(registry.get("anything").is_none());
    }
}
