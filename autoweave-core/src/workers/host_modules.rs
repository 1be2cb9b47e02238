//! Host-registered module table.
//!
//! A manifest's `permissions.modules` allowlist is resolved against this
//! table: an import outside the base namespace must be both allowlisted by
//! the plugin and provided here, or the load fails closed. The validator
//! checks the same table, so a manifest naming a module this host does not
//! ship is rejected up front instead of failing at load time.
//!
//! The built-in table carries the `clock` module. Hosts embedding the
//! crate can start from `empty()` and wire up their own build's table.

use std::collections::BTreeMap;

use wasmtime::Linker;

use crate::workers::worker::WorkerCell;

/// Modules compiled into this host build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuiltinModule {
    /// `clock.now_ms() -> i64`: wall-clock milliseconds since the epoch.
    /// Lets plugins timestamp their own records without any ambient
    /// syscall surface.
    Clock,
}

/// The set of importable host modules beyond the base namespace.
#[derive(Debug, Default)]
pub struct HostModuleRegistry {
    modules: BTreeMap<String, BuiltinModule>,
}

impl HostModuleRegistry {
    /// Table with every module this build ships.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry
            .modules
            .insert("clock".to_string(), BuiltinModule::Clock);
        registry
    }

    /// No modules beyond the base namespace.
    pub fn empty() -> Self {
        Self {
            modules: BTreeMap::new(),
        }
    }

    pub fn provides(&self, module: &str) -> bool {
        self.modules.contains_key(module)
    }

    /// Provided module names, for validator wiring and the operational
    /// surface.
    pub fn names(&self) -> Vec<String> {
        self.modules.keys().cloned().collect()
    }

    /// Wires one provided module's functions into a worker linker. A name
    /// missing from the table is a no-op; import checking has already
    /// rejected it by then.
    pub(crate) fn install(
        &self,
        module: &str,
        linker: &mut Linker<WorkerCell>,
    ) -> Result<(), wasmtime::Error> {
        match self.modules.get(module) {
            Some(BuiltinModule::Clock) => install_clock(module, linker),
            None => Ok(()),
        }
    }
}

fn install_clock(
    module: &str,
    linker: &mut Linker<WorkerCell>,
) -> Result<(), wasmtime::Error> {
    linker.func_wrap(module, "now_ms", || -> i64 {
        chrono::Utc::now().timestamp_millis()
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_table_provides_clock() {
        let registry = HostModuleRegistry::builtin();
        assert!(registry.provides("clock"));
        assert!(!registry.provides("wasi_snapshot_preview1"));
        assert_eq!(registry.names(), vec!["clock".to_string()]);
    }

    #[test]
    fn empty_table_provides_nothing() {
        let registry = HostModuleRegistry::empty();
        assert!(!registry.provides("clock"));
        assert!(registry.names().is_empty());
    }
}
