//! Static identity loading.
//!
//! The agent's persona lives as four markdown files in
//! `~/.pocketpaw/identity/`, all optional:
//!
//! ```text
//! IDENTITY.md      ← who the agent is
//! SOUL.md          ← values and boundaries
//! STYLE.md         ← voice and formatting preferences
//! USER_PROFILE.md  ← what the agent knows about its owner
//! ```

use std::{fs, path::PathBuf};

// ─── IdentityLoader ───────────────────────────────────────────────────────────

pub struct IdentityLoader {
    dir: PathBuf,
}

const IDENTITY_FILES: &[(&str, &str)] = &[
    ("IDENTITY.md", "Identity"),
    ("SOUL.md", "Soul"),
    ("STYLE.md", "Style"),
    ("USER_PROFILE.md", "User Profile"),
];

const DEFAULT_IDENTITY: &str = "You are PocketPaw, a personal AI agent. You are helpful, \
concise, and act on your owner's behalf across their messaging channels.";

impl IdentityLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Assemble the static identity prompt from whichever of the four files
    /// exist, in order, each under its heading. Falls back to a built-in
    /// one-liner when none exist.
    pub fn load(&self) -> String {
        let mut parts = Vec::new();
        for (file, heading) in IDENTITY_FILES {
            let path = self.dir.join(file);
            if let Ok(content) = fs::read_to_string(&path) {
                let content = content.trim();
                if !content.is_empty() {
                    parts.push(format!("# {heading}\n{content}"));
                }
            }
        }
        if parts.is_empty() {
            return DEFAULT_IDENTITY.to_owned();
        }
        parts.join("\n\n")
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_dir_falls_back_to_default() {
        let loader = IdentityLoader::new("/nonexistent/identity");
        assert_eq!(loader.load(), DEFAULT_IDENTITY);
    }

    #[test]
    fn files_are_assembled_in_order() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("STYLE.md"), "Short sentences.").unwrap();
        fs::write(dir.path().join("IDENTITY.md"), "You are Paw.").unwrap();

        let prompt = IdentityLoader::new(dir.path()).load();
        let identity_pos = prompt.find("You are Paw.").unwrap();
        let style_pos = prompt.find("Short sentences.").unwrap();
        assert!(identity_pos < style_pos, "identity precedes style");
        assert!(prompt.contains("# Identity"));
        assert!(prompt.contains("# Style"));
    }

    #[test]
    fn empty_files_are_skipped() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("SOUL.md"), "   \n").unwrap();
        let prompt = IdentityLoader::new(dir.path()).load();
        assert_eq!(prompt, DEFAULT_IDENTITY);
    }
}
