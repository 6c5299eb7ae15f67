use std::path::{Path, PathBuf};

/// Expand a leading `~` or `~/` against an explicit home directory.
///
/// Ambient `$HOME` lookups are confined to the one caller that resolves the
/// home directory at startup; everything else takes the expansion result.
pub fn expand_tilde(raw: &str, home: &Path) -> PathBuf {
    if raw == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = raw.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(raw)
}

/// Resolve the current user's home directory.
pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde() {
        let home = Path::new("/home/dev");
        assert_eq!(expand_tilde("~", home), PathBuf::from("/home/dev"));
        assert_eq!(expand_tilde("~/proj", home), PathBuf::from("/home/dev/proj"));
        assert_eq!(expand_tilde("/abs/path", home), PathBuf::from("/abs/path"));
        assert_eq!(expand_tilde("rel/path", home), PathBuf::from("rel/path"));
        // A tilde not in leading position is untouched
        assert_eq!(expand_tilde("/a/~b", home), PathBuf::from("/a/~b"));
    }
}
