//! Utility functions shared across the build and render pipelines.
//!
//! - Module ID normalization
//! - Specifier classification and query stripping
//! - Base-path joining for emitted assets
//! - Inline-script escaping (injection-safe)

use std::path::Path;

// ---------------------------------------------------------------------------
// Module IDs
// ---------------------------------------------------------------------------

/// Normalize an absolute module path to its root-relative id.
///
/// Ids use forward slashes on every platform and carry no leading slash, so
/// they match manifest keys byte-for-byte across environments.
pub fn normalize_module_id(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let mut id = String::new();
    for component in relative.components() {
        if !id.is_empty() {
            id.push('/');
        }
        id.push_str(&component.as_os_str().to_string_lossy());
    }
    id
}

/// Strip `?query` and `#fragment` suffixes from an import specifier.
pub fn strip_query(specifier: &str) -> &str {
    let end = specifier
        .find(['?', '#'])
        .unwrap_or(specifier.len());
    &specifier[..end]
}

/// Whether a specifier names a vendor package rather than a project file.
pub fn is_bare_specifier(specifier: &str) -> bool {
    !specifier.starts_with('.') && !specifier.starts_with('/') && !specifier.starts_with('\0')
}

/// Package name portion of a bare specifier (`@scope/pkg/deep` → `@scope/pkg`).
pub fn package_name(specifier: &str) -> &str {
    let mut segments = specifier.splitn(3, '/');
    match (segments.next(), segments.next()) {
        (Some(scope), Some(name)) if scope.starts_with('@') => {
            &specifier[..scope.len() + 1 + name.len()]
        }
        (Some(name), _) => name,
        (None, _) => specifier,
    }
}

// ---------------------------------------------------------------------------
// Asset paths
// ---------------------------------------------------------------------------

/// Join a public base path and an emitted file name with exactly one slash.
/// An empty base leaves the file name untouched.
pub fn join_base(base: &str, file: &str) -> String {
    if base.is_empty() {
        return file.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), file.trim_start_matches('/'))
}

// ---------------------------------------------------------------------------
// Inline-script escaping
// ---------------------------------------------------------------------------

/// Escape text for embedding inside an inline `<script>` element.
///
/// `<` becomes `\u003c` so a payload containing `</script` cannot terminate
/// the element early. The payload is JSON-shaped, where the escape is a
/// valid string character.
pub fn escape_inline_script(s: &str) -> String {
    s.replace('<', "\\u003c")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_normalize_module_id() {
        let root = PathBuf::from("/proj");
        assert_eq!(
            normalize_module_id(&root, &PathBuf::from("/proj/src/App.jsx")),
            "src/App.jsx"
        );
    }

    #[test]
    fn test_normalize_module_id_outside_root() {
        let root = PathBuf::from("/proj");
        assert_eq!(
            normalize_module_id(&root, &PathBuf::from("/other/mod.js")),
            "other/mod.js"
        );
    }

    #[test]
    fn test_strip_query() {
        assert_eq!(strip_query("./logo.svg?url"), "./logo.svg");
        assert_eq!(strip_query("./a.js#frag"), "./a.js");
        assert_eq!(strip_query("./plain.js"), "./plain.js");
    }

    #[test]
    fn test_is_bare_specifier() {
        assert!(is_bare_specifier("react"));
        assert!(is_bare_specifier("@scope/pkg"));
        assert!(!is_bare_specifier("./local.js"));
        assert!(!is_bare_specifier("../up.js"));
        assert!(!is_bare_specifier("/abs.js"));
        assert!(!is_bare_specifier("\0meridian:entry"));
    }

    #[test]
    fn test_package_name() {
        assert_eq!(package_name("react"), "react");
        assert_eq!(package_name("react/jsx-runtime"), "react");
        assert_eq!(package_name("@scope/pkg"), "@scope/pkg");
        assert_eq!(package_name("@scope/pkg/deep/mod.js"), "@scope/pkg");
    }

    #[test]
    fn test_join_base() {
        assert_eq!(join_base("/", "assets/app.js"), "/assets/app.js");
        assert_eq!(join_base("/app/", "/main.js"), "/app/main.js");
        assert_eq!(join_base("", "main.js"), "main.js");
    }

    #[test]
    fn test_escape_inline_script() {
        assert_eq!(escape_inline_script("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(
            escape_inline_script("</script><script>"),
            "\\u003c/script>\\u003cscript>"
        );
    }
}
