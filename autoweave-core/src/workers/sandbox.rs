//! Capability grants compiled from a validated manifest.
//!
//! Every host-API call crossing the sandbox boundary is checked here before
//! anything is serviced. Checks fail closed: a path or URL not explicitly
//! covered by the plugin's declared permissions is denied.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use autoweave_model::{AccessMode, PluginManifest};
use regex::Regex;
use thiserror::Error;
use url::Url;

/// Base host namespace every plugin may import.
pub const BASE_MODULE: &str = "autoweave";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("denied: {0}")]
pub struct Denied(pub String);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid url glob: {0}")]
pub struct GlobError(String);

/// Compiled URL glob over `scheme://host/path`. `*` matches within one path
/// segment, `**` crosses segments, `?` matches one character.
#[derive(Debug, Clone)]
pub struct UrlGlob {
    pattern: String,
    regex: Regex,
}

impl UrlGlob {
    pub fn compile(pattern: &str) -> Result<Self, GlobError> {
        if pattern.trim().is_empty() {
            return Err(GlobError("empty pattern".to_string()));
        }
        let mut regex = String::from("^");
        let mut chars = pattern.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '*' => {
                    if chars.peek() == Some(&'*') {
                        chars.next();
                        regex.push_str(".*");
                    } else {
                        regex.push_str("[^/]*");
                    }
                }
                '?' => regex.push('.'),
                other => regex.push_str(&regex::escape(&other.to_string())),
            }
        }
        regex.push('$');
        let regex = Regex::new(&regex)
            .map_err(|err| GlobError(err.to_string()))?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, url: &Url) -> bool {
        let mut normalized = format!(
            "{}://{}",
            url.scheme(),
            url.host_str().unwrap_or_default()
        );
        if let Some(port) = url.port() {
            normalized.push_str(&format!(":{port}"));
        }
        normalized.push_str(url.path());
        self.regex.is_match(&normalized)
    }
}

#[derive(Debug, Clone)]
struct FsRule {
    root: PathBuf,
    mode: AccessMode,
}

/// One plugin's capability grant, compiled once at load time.
#[derive(Debug)]
pub struct CapabilityChecker {
    plugin_name: String,
    filesystem: Vec<FsRule>,
    outbound: Vec<UrlGlob>,
    modules: HashSet<String>,
    usb_vendors: Vec<u16>,
    usb_products: Vec<u16>,
}

impl CapabilityChecker {
    /// Compiles the grant. The manifest has already passed validation, so
    /// pattern or id errors here indicate an internal inconsistency.
    pub fn from_manifest(
        manifest: &PluginManifest,
    ) -> Result<Self, GlobError> {
        let filesystem = manifest
            .permissions
            .filesystem
            .iter()
            .map(|grant| FsRule {
                root: normalize_lexically(&grant.path)
                    .unwrap_or_else(|| grant.path.clone()),
                mode: grant.mode,
            })
            .collect();

        let outbound = manifest
            .permissions
            .network
            .as_ref()
            .map(|network| {
                network
                    .outbound
                    .iter()
                    .map(|pattern| UrlGlob::compile(pattern))
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?
            .unwrap_or_default();

        let (usb_vendors, usb_products) = match &manifest.permissions.usb {
            Some(usb) => (
                usb.vendor_id_set()
                    .map_err(|err| GlobError(err.to_string()))?,
                usb.product_id_set()
                    .map_err(|err| GlobError(err.to_string()))?,
            ),
            None => (Vec::new(), Vec::new()),
        };

        Ok(Self {
            plugin_name: manifest.name.clone(),
            filesystem,
            outbound,
            modules: manifest.permissions.modules.iter().cloned().collect(),
            usb_vendors,
            usb_products,
        })
    }

    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    /// Lexically normalized absolute path, checked against the grant in
    /// the requested mode. Callers re-check after real canonicalization.
    pub fn check_path(
        &self,
        path: &Path,
        write: bool,
    ) -> Result<PathBuf, Denied> {
        if !path.is_absolute() {
            return Err(Denied(format!(
                "path `{}` must be absolute",
                path.display()
            )));
        }
        let Some(normalized) = normalize_lexically(path) else {
            return Err(Denied(format!(
                "path `{}` escapes the filesystem root",
                path.display()
            )));
        };
        let allowed = self.filesystem.iter().any(|rule| {
            normalized.starts_with(&rule.root)
                && if write {
                    rule.mode.allows_write()
                } else {
                    rule.mode.allows_read()
                }
        });
        if allowed {
            Ok(normalized)
        } else {
            Err(Denied(format!(
                "{} access to `{}` is not granted",
                if write { "write" } else { "read" },
                normalized.display()
            )))
        }
    }

    pub fn check_fetch(&self, raw_url: &str) -> Result<Url, Denied> {
        let url = Url::parse(raw_url)
            .map_err(|err| Denied(format!("malformed url: {err}")))?;
        if self.outbound.iter().any(|glob| glob.matches(&url)) {
            Ok(url)
        } else {
            Err(Denied(format!(
                "outbound access to `{raw_url}` is not granted"
            )))
        }
    }

    /// The base namespace is always importable; everything else requires a
    /// manifest `modules` entry.
    pub fn module_allowed(&self, module: &str) -> bool {
        module == BASE_MODULE || self.modules.contains(module)
    }

    /// Dispatch selection: a stream event matches if its vendor id is
    /// declared, or its product id is.
    pub fn matches_usb(&self, vendor_id: u16, product_id: u16) -> bool {
        self.usb_vendors.contains(&vendor_id)
            || self.usb_products.contains(&product_id)
    }

    pub fn has_usb_interest(&self) -> bool {
        !self.usb_vendors.is_empty() || !self.usb_products.is_empty()
    }
}

/// Resolves `.` and `..` without touching the filesystem. Returns `None`
/// when `..` would climb above the root.
fn normalize_lexically(path: &Path) -> Option<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir => normalized.push(Component::RootDir),
            Component::Prefix(prefix) => normalized.push(prefix.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() || normalized.as_os_str().is_empty() {
                    return None;
                }
            }
            Component::Normal(segment) => normalized.push(segment),
        }
    }
    Some(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoweave_model::PluginManifest;

    fn manifest(json: &str) -> PluginManifest {
        serde_json::from_str(json).unwrap()
    }

    fn checker(json: &str) -> CapabilityChecker {
        CapabilityChecker::from_manifest(&manifest(json)).unwrap()
    }

    const READWRITE: &str = r#"{"name":"ex","version":"1.0.0","entry":"a.wasm",
        "permissions":{"filesystem":[{"path":"/var/ex","mode":"readwrite"}]}}"#;
    const READ_ONLY: &str = r#"{"name":"ex","version":"1.0.0","entry":"a.wasm",
        "permissions":{"filesystem":[{"path":"/var/ex","mode":"read"}]}}"#;

    #[test]
    fn grants_access_under_allowed_root() {
        let caps = checker(READWRITE);
        assert!(caps.check_path(Path::new("/var/ex/data.txt"), true).is_ok());
        assert!(caps.check_path(Path::new("/var/ex/sub/x"), false).is_ok());
    }

    #[test]
    fn read_only_grant_denies_writes() {
        let caps = checker(READ_ONLY);
        assert!(caps.check_path(Path::new("/var/ex/x"), false).is_ok());
        let err = caps.check_path(Path::new("/var/ex/x"), true).unwrap_err();
        assert!(err.0.contains("write"));
    }

    #[test]
    fn traversal_out_of_root_is_denied() {
        let caps = checker(READWRITE);
        let err = caps
            .check_path(Path::new("/var/ex/../secrets"), false)
            .unwrap_err();
        assert!(err.0.contains("not granted"));
    }

    #[test]
    fn relative_paths_are_denied() {
        let caps = checker(READWRITE);
        assert!(caps.check_path(Path::new("data.txt"), false).is_err());
    }

    #[test]
    fn prefix_sibling_is_not_inside_root() {
        let caps = checker(READWRITE);
        // `/var/example` shares a string prefix with `/var/ex` but is a
        // different directory.
        assert!(
            caps.check_path(Path::new("/var/example/x"), false).is_err()
        );
    }

    #[test]
    fn no_permissions_means_everything_denied() {
        let caps = checker(
            r#"{"name":"bare","version":"1.0.0","entry":"a.wasm"}"#,
        );
        assert!(caps.check_path(Path::new("/tmp/x"), false).is_err());
        assert!(caps.check_fetch("https://example.com/x").is_err());
        assert!(!caps.matches_usb(0x1234, 0x5678));
    }

    #[test]
    fn url_globs_match_scheme_host_path() {
        let glob = UrlGlob::compile("https://api.example.com/v1/**").unwrap();
        assert!(glob.matches(
            &Url::parse("https://api.example.com/v1/items/42").unwrap()
        ));
        assert!(!glob.matches(
            &Url::parse("https://api.example.com/v2/items").unwrap()
        ));
        assert!(!glob.matches(
            &Url::parse("http://api.example.com/v1/items").unwrap()
        ));
    }

    #[test]
    fn single_star_stays_within_segment() {
        let glob = UrlGlob::compile("https://cdn.example.com/img/*").unwrap();
        assert!(glob
            .matches(&Url::parse("https://cdn.example.com/img/a.png").unwrap()));
        assert!(!glob.matches(
            &Url::parse("https://cdn.example.com/img/a/b.png").unwrap()
        ));
    }

    #[test]
    fn fetch_checked_against_outbound_globs() {
        let caps = checker(
            r#"{"name":"net","version":"1.0.0","entry":"a.wasm",
                "permissions":{"network":{"outbound":["https://api.example.com/**"]}}}"#,
        );
        assert!(caps.check_fetch("https://api.example.com/data").is_ok());
        assert!(caps.check_fetch("https://evil.example.com/data").is_err());
        assert!(caps.check_fetch("not a url").is_err());
    }

    #[test]
    fn base_module_always_allowed_extras_gated() {
        let caps = checker(
            r#"{"name":"m","version":"1.0.0","entry":"a.wasm",
                "permissions":{"modules":["extra_math"]}}"#,
        );
        assert!(caps.module_allowed(BASE_MODULE));
        assert!(caps.module_allowed("extra_math"));
        assert!(!caps.module_allowed("wasi_snapshot_preview1"));
    }

    #[test]
    fn usb_matching_by_vendor_or_product() {
        let caps = checker(
            r#"{"name":"u","version":"1.0.0","entry":"a.wasm",
                "permissions":{"usb":{"vendor_ids":["0x1234"],
                                       "product_ids":["0x9999"]}}}"#,
        );
        assert!(caps.matches_usb(0x1234, 0x0000));
        assert!(caps.matches_usb(0x0000, 0x9999));
        assert!(!caps.matches_usb(0x4321, 0x1111));
        assert!(caps.has_usb_interest());
    }
}
