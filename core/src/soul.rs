//! Soul/mission text loading (design §4.2 ambient note).
//!
//! Read from disk once per turn — never cached across turns, so an operator editing
//! an agent's soul file takes effect on the agent's very next turn — falling back to
//! an embedded default when no file is configured or the read fails. Mirrors the
//! teacher's SOUL.md/AGENTS.md loading in spirit, generalized to any agent's path.

use std::path::Path;

const DEFAULT_SOUL: &str = include_str!("default_soul.md");

/// Loads soul text for one turn. Never caches: callers invoke this at the start of
/// every turn, not once at agent spawn.
pub async fn load_soul_text(path: Option<&Path>) -> String {
    match path {
        Some(p) => match tokio::fs::read_to_string(p).await {
            Ok(text) => text,
            Err(_) => DEFAULT_SOUL.to_string(),
        },
        None => DEFAULT_SOUL.to_string(),
    }
}

pub fn default_soul_text() -> &'static str {
    DEFAULT_SOUL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_path_falls_back_to_embedded_default() {
        let text = load_soul_text(None).await;
        assert_eq!(text, DEFAULT_SOUL);
    }

    #[tokio::test]
    async fn nonexistent_file_falls_back_to_embedded_default() {
        let text = load_soul_text(Some(Path::new("/nonexistent/soul.md"))).await;
        assert_eq!(text, DEFAULT_SOUL);
    }

    #[tokio::test]
    async fn existing_file_is_read_fresh_each_call() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("soul.md");
        tokio::fs::write(&path, "first").await.unwrap();
        assert_eq!(load_soul_text(Some(&path)).await, "first");

        tokio::fs::write(&path, "second").await.unwrap();
        assert_eq!(load_soul_text(Some(&path)).await, "second");
    }
}
