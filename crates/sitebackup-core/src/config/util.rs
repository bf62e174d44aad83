use std::path::{Path, PathBuf};

/// Expand a leading `~` or `~/` to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    if let Some(suffix) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(suffix);
        }
    }
    PathBuf::from(path)
}

/// Reduce free text to a lowercase ASCII identifier of alphanumerics
/// separated by single dashes.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut pending_dash = false;
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else if ch.is_whitespace() || ch == '-' || ch == '_' || ch == '.' {
            pending_dash = true;
        }
    }
    slug
}

/// Derive a label from a path by taking the last component (basename).
pub fn label_from_path(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde_home_only() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(expand_tilde("~"), home);
        assert_eq!(expand_tilde("/var/backups"), PathBuf::from("/var/backups"));
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Acme Corp. Blog"), "acme-corp-blog");
        assert_eq!(slugify("  --Hello__World--  "), "hello-world");
        assert_eq!(slugify("Café Müller"), "caf-mller");
        assert_eq!(slugify("!!!"), "");
    }

    #[test]
    fn test_label_from_path() {
        assert_eq!(label_from_path(Path::new("/srv/www/acme")), "acme");
    }
}
