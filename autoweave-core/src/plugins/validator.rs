//! Manifest schema validation with content-hash caching.
//!
//! Validation collects every violation rather than stopping at the first,
//! so an operator fixes a manifest in one pass. Results are cached by the
//! SHA-256 of the manifest bytes; identical bytes skip re-validation.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use autoweave_model::{
    HookKind, ManifestHash, PluginManifest, parse_hex_id,
};
use thiserror::Error;
use tracing::debug;

use crate::perf::lru::SharedTtlLru;
use crate::perf::metrics::{Counter, MetricsRegistry, counters};
use crate::workers::host_modules::HostModuleRegistry;
use crate::workers::sandbox::UrlGlob;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("manifest invalid: {}", violations.join("; "))]
pub struct ValidationError {
    pub violations: Vec<String>,
}

impl ValidationError {
    fn new(violations: Vec<String>) -> Self {
        Self { violations }
    }
}

type CachedResult = Result<PluginManifest, ValidationError>;

pub struct ManifestValidator {
    cache: SharedTtlLru<ManifestHash, CachedResult>,
    max_heap_ceiling_mb: u32,
    /// Module names the host module table provides; `modules` allowlist
    /// entries outside this set are rejected up front.
    host_modules: BTreeSet<String>,
    validations: Counter,
    cache_hits: Counter,
    failures: Counter,
}

impl std::fmt::Debug for ManifestValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestValidator")
            .field("max_heap_ceiling_mb", &self.max_heap_ceiling_mb)
            .field("host_modules", &self.host_modules)
            .finish()
    }
}

impl ManifestValidator {
    pub fn new(max_heap_ceiling_mb: u32, metrics: &MetricsRegistry) -> Self {
        Self {
            cache: SharedTtlLru::new(128, Some(Duration::from_secs(600))),
            max_heap_ceiling_mb,
            host_modules: HostModuleRegistry::builtin()
                .names()
                .into_iter()
                .collect(),
            validations: metrics.counter(counters::VALIDATIONS),
            cache_hits: metrics.counter(counters::VALIDATION_CACHE_HITS),
            failures: metrics.counter(counters::VALIDATION_FAILURES),
        }
    }

    /// Overrides the provided-module set; must match the registry the
    /// worker pool was built with.
    pub fn with_host_modules(
        mut self,
        modules: impl IntoIterator<Item = String>,
    ) -> Self {
        self.host_modules = modules.into_iter().collect();
        self
    }

    /// The validation cache, exposed for memory-pressure registration.
    pub fn cache(&self) -> SharedTtlLru<ManifestHash, CachedResult> {
        self.cache.clone()
    }

    /// Validates manifest bytes for a bundle rooted at `bundle_dir`.
    pub fn validate(
        &self,
        bundle_dir: &Path,
        bytes: &[u8],
    ) -> (ManifestHash, CachedResult) {
        let hash = ManifestHash::of(bytes);
        if let Some(cached) = self.cache.lock().get(&hash) {
            self.cache_hits.incr();
            debug!(%hash, "manifest validation served from cache");
            return (hash, cached.clone());
        }

        self.validations.incr();
        let result = self.validate_uncached(bundle_dir, bytes);
        if result.is_err() {
            self.failures.incr();
        }
        self.cache.lock().insert(hash, result.clone());
        (hash, result)
    }

    fn validate_uncached(
        &self,
        bundle_dir: &Path,
        bytes: &[u8],
    ) -> CachedResult {
        let manifest: PluginManifest = serde_json::from_slice(bytes)
            .map_err(|err| {
                ValidationError::new(vec![format!("not valid JSON: {err}")])
            })?;

        let mut violations = Vec::new();

        if manifest.name.trim().is_empty() {
            violations.push("name must not be empty".to_string());
        } else if manifest
            .name
            .chars()
            .any(|c| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'))
        {
            violations.push(format!(
                "name `{}` may only contain alphanumerics, `-`, and `_`",
                manifest.name
            ));
        }

        if !version_looks_sane(&manifest.version) {
            violations.push(format!(
                "version `{}` is not a dotted version string",
                manifest.version
            ));
        }

        if let Err(reason) = entry_within_bundle(bundle_dir, &manifest.entry) {
            violations.push(reason);
        }

        for grant in &manifest.permissions.filesystem {
            if !grant.path.is_absolute() {
                violations.push(format!(
                    "filesystem path `{}` must be absolute",
                    grant.path.display()
                ));
            }
            if grant
                .path
                .components()
                .any(|c| matches!(c, Component::ParentDir))
            {
                violations.push(format!(
                    "filesystem path `{}` must not contain `..`",
                    grant.path.display()
                ));
            }
        }

        if let Some(network) = &manifest.permissions.network {
            for pattern in &network.outbound {
                if let Err(err) = UrlGlob::compile(pattern) {
                    violations.push(format!(
                        "outbound pattern `{pattern}`: {err}"
                    ));
                }
            }
            if let Some(inbound) = &network.inbound {
                if inbound.port == 0 {
                    violations
                        .push("inbound port must be non-zero".to_string());
                }
            }
        }

        if let Some(usb) = &manifest.permissions.usb {
            for id in usb.vendor_ids.iter().chain(usb.product_ids.iter()) {
                if parse_hex_id(id).is_err() {
                    violations.push(format!(
                        "usb id `{id}` is not a 16-bit hex id"
                    ));
                }
            }
        }

        for module in &manifest.permissions.modules {
            if !self.host_modules.contains(module) {
                violations.push(format!(
                    "module `{module}` is not provided by this host"
                ));
            }
        }

        if let Some(memory) = &manifest.permissions.memory {
            match memory.max_heap_mb {
                Some(0) => violations
                    .push("memory.max_heap_mb must be positive".to_string()),
                Some(mb) if mb > self.max_heap_ceiling_mb => {
                    violations.push(format!(
                        "memory.max_heap_mb {mb} exceeds the host ceiling {}",
                        self.max_heap_ceiling_mb
                    ));
                }
                _ => {}
            }
        }

        for unknown in manifest.hooks.unknown.keys() {
            violations.push(format!("unknown hook `{unknown}`"));
        }
        for kind in [
            HookKind::Load,
            HookKind::Unload,
            HookKind::UsbAttach,
            HookKind::UsbDetach,
        ] {
            if let Some(export) = manifest.hooks.export_for(kind) {
                if export.trim().is_empty() {
                    violations
                        .push(format!("hook {kind} names an empty export"));
                }
            }
        }

        if violations.is_empty() {
            Ok(manifest)
        } else {
            Err(ValidationError::new(violations))
        }
    }
}

fn version_looks_sane(version: &str) -> bool {
    let core = version.split(['-', '+']).next().unwrap_or_default();
    let parts: Vec<&str> = core.split('.').collect();
    !parts.is_empty()
        && parts.len() <= 3
        && parts
            .iter()
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()))
}

/// The entry path must resolve inside the bundle directory; lexical
/// normalization rejects traversal before anything touches the disk.
fn entry_within_bundle(
    bundle_dir: &Path,
    entry: &str,
) -> Result<PathBuf, String> {
    if entry.trim().is_empty() {
        return Err("entry must not be empty".to_string());
    }
    let entry_path = Path::new(entry);
    if entry_path.is_absolute() {
        return Err(format!("entry `{entry}` must be a relative path"));
    }

    let mut resolved = PathBuf::new();
    for component in entry_path.components() {
        match component {
            Component::Normal(segment) => resolved.push(segment),
            Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() {
                    return Err(format!(
                        "entry `{entry}` escapes the bundle directory"
                    ));
                }
            }
            _ => {
                return Err(format!("entry `{entry}` is not a plain path"));
            }
        }
    }
    if resolved.as_os_str().is_empty() {
        return Err(format!("entry `{entry}` resolves to the bundle root"));
    }
    Ok(bundle_dir.join(resolved))
}

/// Resolves a validated manifest's entry to its on-disk path.
pub fn resolve_entry(bundle_dir: &Path, entry: &str) -> Option<PathBuf> {
    entry_within_bundle(bundle_dir, entry).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> (ManifestValidator, std::sync::Arc<MetricsRegistry>) {
        let metrics = MetricsRegistry::new();
        (ManifestValidator::new(1024, &metrics), metrics)
    }

    fn bundle() -> PathBuf {
        PathBuf::from("/var/lib/autoweave/plugins/ex")
    }

    const VALID: &str = r#"{"name":"ex","version":"1.0.0","entry":"index.wasm",
        "permissions":{"filesystem":[{"path":"/var/ex","mode":"readwrite"}],
                       "usb":{"vendor_ids":["0x1234"]},
                       "memory":{"max_heap_mb":128}},
        "hooks":{"onLoad":"init","onUSBAttach":"handle"}}"#;

    #[test]
    fn accepts_valid_manifest() {
        let (validator, _) = validator();
        let (_, result) = validator.validate(&bundle(), VALID.as_bytes());
        let manifest = result.unwrap();
        assert_eq!(manifest.name, "ex");
    }

    #[test]
    fn rejects_empty_manifest() {
        let (validator, _) = validator();
        let (_, result) = validator.validate(&bundle(), b"");
        let err = result.unwrap_err();
        assert!(err.violations[0].contains("not valid JSON"));
    }

    #[test]
    fn manifest_with_no_permissions_is_valid() {
        let (validator, _) = validator();
        let (_, result) = validator.validate(
            &bundle(),
            br#"{"name":"bare","version":"0.1","entry":"main.wasm"}"#,
        );
        assert!(result.is_ok());
    }

    #[test]
    fn rejects_traversal_entry() {
        let (validator, _) = validator();
        let (_, result) = validator.validate(
            &bundle(),
            br#"{"name":"x","version":"1.0.0","entry":"../../etc/passwd"}"#,
        );
        let err = result.unwrap_err();
        assert!(
            err.violations
                .iter()
                .any(|v| v.contains("escapes the bundle"))
        );
    }

    #[test]
    fn entry_with_internal_dotdot_that_stays_inside_is_fine() {
        assert!(
            entry_within_bundle(&bundle(), "lib/../index.wasm").is_ok()
        );
        assert!(entry_within_bundle(&bundle(), "a/../../x.wasm").is_err());
    }

    #[test]
    fn rejects_relative_filesystem_path() {
        let (validator, _) = validator();
        let (_, result) = validator.validate(
            &bundle(),
            br#"{"name":"x","version":"1.0.0","entry":"a.wasm",
                 "permissions":{"filesystem":[{"path":"data","mode":"read"}]}}"#,
        );
        let err = result.unwrap_err();
        assert!(err.violations.iter().any(|v| v.contains("absolute")));
    }

    #[test]
    fn rejects_heap_above_ceiling() {
        let (validator, _) = validator();
        let (_, result) = validator.validate(
            &bundle(),
            br#"{"name":"x","version":"1.0.0","entry":"a.wasm",
                 "permissions":{"memory":{"max_heap_mb":4096}}}"#,
        );
        let err = result.unwrap_err();
        assert!(err.violations.iter().any(|v| v.contains("ceiling")));
    }

    #[test]
    fn rejects_unknown_hook_names() {
        let (validator, _) = validator();
        let (_, result) = validator.validate(
            &bundle(),
            br#"{"name":"x","version":"1.0.0","entry":"a.wasm",
                 "hooks":{"onTeardown":"bye"}}"#,
        );
        let err = result.unwrap_err();
        assert!(
            err.violations
                .iter()
                .any(|v| v.contains("unknown hook `onTeardown`"))
        );
    }

    #[test]
    fn accepts_modules_the_host_provides() {
        let (validator, _) = validator();
        let (_, result) = validator.validate(
            &bundle(),
            br#"{"name":"x","version":"1.0.0","entry":"a.wasm",
                 "permissions":{"modules":["clock"]}}"#,
        );
        assert!(result.is_ok());
    }

    #[test]
    fn rejects_modules_outside_the_host_table() {
        let (validator, _) = validator();
        let (_, result) = validator.validate(
            &bundle(),
            br#"{"name":"x","version":"1.0.0","entry":"a.wasm",
                 "permissions":{"modules":["clock","telepathy"]}}"#,
        );
        let err = result.unwrap_err();
        assert_eq!(err.violations.len(), 1);
        assert!(
            err.violations[0]
                .contains("module `telepathy` is not provided")
        );
    }

    #[test]
    fn host_module_set_is_overridable() {
        let metrics = MetricsRegistry::new();
        let validator = ManifestValidator::new(1024, &metrics)
            .with_host_modules(["telepathy".to_string()]);
        let (_, result) = validator.validate(
            &bundle(),
            br#"{"name":"x","version":"1.0.0","entry":"a.wasm",
                 "permissions":{"modules":["telepathy"]}}"#,
        );
        assert!(result.is_ok());
    }

    #[test]
    fn collects_multiple_violations() {
        let (validator, _) = validator();
        let (_, result) = validator.validate(
            &bundle(),
            br#"{"name":"","version":"banana","entry":"/abs.wasm"}"#,
        );
        let err = result.unwrap_err();
        assert!(err.violations.len() >= 3, "{:?}", err.violations);
    }

    #[test]
    fn identical_bytes_hit_the_cache_exactly_once() {
        let (validator, metrics) = validator();
        let (hash_a, first) = validator.validate(&bundle(), VALID.as_bytes());
        let (hash_b, second) = validator.validate(&bundle(), VALID.as_bytes());
        assert_eq!(hash_a, hash_b);
        assert_eq!(first.unwrap(), second.unwrap());
        assert_eq!(metrics.counter(counters::VALIDATIONS).get(), 1);
        assert_eq!(
            metrics.counter(counters::VALIDATION_CACHE_HITS).get(),
            1
        );
    }

    #[test]
    fn failed_results_are_cached_too() {
        let (validator, metrics) = validator();
        let bad = br#"{"name":"","version":"1.0.0","entry":"a.wasm"}"#;
        let (_, first) = validator.validate(&bundle(), bad);
        let (_, second) = validator.validate(&bundle(), bad);
        assert_eq!(first.unwrap_err(), second.unwrap_err());
        assert_eq!(metrics.counter(counters::VALIDATIONS).get(), 1);
    }
}
