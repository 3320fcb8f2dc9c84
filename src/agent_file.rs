//! Agent files: markdown with optional YAML frontmatter.
//!
//! The frontmatter becomes a settings layer (scalars stringified); the
//! body becomes the system prompt.

use std::fs;
use std::path::Path;

use crate::config::Settings;
use crate::skills::split_frontmatter;

#[derive(Debug, Default)]
pub struct AgentFile {
    pub settings: Settings,
    pub system_prompt: String,
    /// Raw file content, echoed into the session-log header.
    pub raw: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AgentFileError {
    #[error("agent file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("agent file {path}: invalid frontmatter: {reason}")]
    Frontmatter { path: String, reason: String },
}

pub fn load(path: &Path) -> Result<AgentFile, AgentFileError> {
    let raw = fs::read_to_string(path).map_err(|source| AgentFileError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let parsed = parse(&raw).map_err(|reason| AgentFileError::Frontmatter {
        path: path.display().to_string(),
        reason,
    })?;
    Ok(AgentFile { raw, ..parsed })
}

fn parse(text: &str) -> Result<AgentFile, String> {
    let (frontmatter, body) = split_frontmatter(text);

    let mut settings = Settings::new();
    if let Some(frontmatter) = frontmatter {
        let mapping: serde_yaml::Mapping =
            serde_yaml::from_str(frontmatter).map_err(|e| e.to_string())?;
        for (key, value) in mapping {
            let Some(key) = key.as_str() else {
                return Err("non-string frontmatter key".to_string());
            };
            let value = match value {
                serde_yaml::Value::String(s) => s,
                serde_yaml::Value::Number(n) => n.to_string(),
                serde_yaml::Value::Bool(b) => b.to_string(),
                other => return Err(format!("unsupported value for key `{key}`: {other:?}")),
            };
            settings.insert(key.to_string(), value);
        }
    }

    Ok(AgentFile {
        settings,
        system_prompt: body.trim().to_string(),
        raw: String::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frontmatter_and_body() {
        let agent = parse(
            "---\nmodel: gpt-5\ntemperature: 0.3\n---\nYou are a careful reviewer.\n",
        )
        .unwrap();
        assert_eq!(agent.settings.get("model").map(String::as_str), Some("gpt-5"));
        assert_eq!(
            agent.settings.get("temperature").map(String::as_str),
            Some("0.3")
        );
        assert_eq!(agent.system_prompt, "You are a careful reviewer.");
    }

    #[test]
    fn test_no_frontmatter_is_all_body() {
        let agent = parse("Just a prompt.\n").unwrap();
        assert!(agent.settings.is_empty());
        assert_eq!(agent.system_prompt, "Just a prompt.");
    }

    #[test]
    fn test_invalid_frontmatter_rejected() {
        assert!(parse("---\n- not\n- a\n- map\n---\nbody\n").is_err());
        assert!(parse("---\nnested:\n  a: 1\n---\nbody\n").is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = load(Path::new("/nonexistent/agent.md")).unwrap_err();
        assert!(matches!(err, AgentFileError::Io { .. }));
    }

    #[test]
    fn test_load_keeps_raw() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.md");
        fs::write(&path, "---\nmodel: gpt-4\n---\nBe terse.\n").unwrap();
        let agent = load(&path).unwrap();
        assert!(agent.raw.contains("model: gpt-4"));
        assert_eq!(agent.system_prompt, "Be terse.");
    }
}
