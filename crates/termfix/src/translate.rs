//! Static import-name to distribution-name translation.
//!
//! Several common Python libraries are imported under a different name than
//! they are installed under (`cv2` ships as `opencv-python`, `PIL` as
//! `Pillow`). The classifier reports the raw import token; this table maps
//! it to something an installer will accept.

/// Import-name prefix to installable package name.
///
/// Prefix matching mirrors how the tokens show up in tracebacks: an import
/// of `sklearn.linear_model` reports `sklearn`, but `cv2.typing` reports
/// `cv2.typing`, so the first dotted segment is what gets matched.
const TRANSLATIONS: &[(&str, &str)] = &[
    ("cv2", "opencv-python"),
    ("PIL", "Pillow"),
    ("sklearn", "scikit-learn"),
    ("skimage", "scikit-image"),
    ("yaml", "pyyaml"),
    ("bs4", "beautifulsoup4"),
    ("Crypto", "pycryptodome"),
    ("dateutil", "python-dateutil"),
];

/// Translate a module/import name to its installable package name.
///
/// Unknown names pass through unchanged - `lxml`, `requests`, `numpy` and
/// most of the ecosystem install under their import name.
#[must_use]
pub fn package_for_module(module: &str) -> &str {
    let root = module.split('.').next().unwrap_or(module);
    TRANSLATIONS
        .iter()
        .find(|(import, _)| *import == root)
        .map_or(module, |(_, package)| package)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_mismatches() {
        assert_eq!(package_for_module("cv2"), "opencv-python");
        assert_eq!(package_for_module("PIL"), "Pillow");
        assert_eq!(package_for_module("sklearn"), "scikit-learn");
        assert_eq!(package_for_module("yaml"), "pyyaml");
        assert_eq!(package_for_module("bs4"), "beautifulsoup4");
    }

    #[test]
    fn test_dotted_imports_match_on_root() {
        assert_eq!(package_for_module("cv2.typing"), "opencv-python");
        assert_eq!(package_for_module("sklearn.linear_model"), "scikit-learn");
        assert_eq!(package_for_module("PIL.Image"), "Pillow");
    }

    #[test]
    fn test_identity_passthrough() {
        assert_eq!(package_for_module("numpy"), "numpy");
        assert_eq!(package_for_module("requests"), "requests");
        assert_eq!(package_for_module("lxml"), "lxml");
        assert_eq!(package_for_module("pandas"), "pandas");
        assert_eq!(package_for_module("matplotlib"), "matplotlib");
    }
}
