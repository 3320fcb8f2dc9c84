//! Skill discovery and the context block handed to the model.
//!
//! A skill is a directory under `<basedir>/.rai/skills/<name>` holding a
//! `SKILL.md`: optional YAML frontmatter (`name`, `description`) and a
//! markdown body. Skills surface to the model twice: as tool definitions
//! and as an `<available_skills>` document in the system prompt.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::STATE_DIR;

pub const SKILLS_DIR: &str = "skills";
pub const SKILL_FILE: &str = "SKILL.md";

#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub description: String,
    pub location: PathBuf,
    /// Markdown body; in v1 executing the skill returns this verbatim.
    pub body: String,
}

#[derive(Debug, Default, Deserialize)]
struct SkillFrontmatter {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

/// Split optional `---` YAML frontmatter from a markdown document.
/// Returns (frontmatter, body); no frontmatter means the whole text is body.
pub(crate) fn split_frontmatter(text: &str) -> (Option<&str>, &str) {
    let Some(rest) = text.strip_prefix("---\n").or_else(|| text.strip_prefix("---\r\n")) else {
        return (None, text);
    };
    for marker in ["\n---\n", "\n---\r\n"] {
        if let Some(end) = rest.find(marker) {
            return (Some(&rest[..end]), &rest[end + marker.len()..]);
        }
    }
    // Unterminated fence: treat everything as body
    (None, text)
}

/// Discover skills, sorted by name. Unreadable entries are skipped.
pub fn discover(base_dir: &Path) -> Vec<Skill> {
    let dir = base_dir.join(STATE_DIR).join(SKILLS_DIR);
    let Ok(entries) = fs::read_dir(&dir) else {
        return Vec::new();
    };

    let mut skills: Vec<Skill> = entries
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let path = entry.path();
            if !path.is_dir() {
                return None;
            }
            let file = path.join(SKILL_FILE);
            let text = fs::read_to_string(&file).ok()?;
            let (frontmatter, body) = split_frontmatter(&text);
            let meta: SkillFrontmatter = frontmatter
                .and_then(|f| serde_yaml::from_str(f).ok())
                .unwrap_or_default();

            let dir_name = path.file_name()?.to_string_lossy().to_string();
            Some(Skill {
                name: meta.name.filter(|n| !n.is_empty()).unwrap_or(dir_name),
                description: meta.description.unwrap_or_default(),
                location: file,
                body: body.trim().to_string(),
            })
        })
        .collect();

    skills.sort_by(|a, b| a.name.cmp(&b.name));
    skills
}

/// Render the deterministic context document injected into the system
/// prompt. Input order is preserved (discovery already sorts by name).
pub fn skill_context_block(skills: &[Skill]) -> String {
    let mut out = String::from("<available_skills>\n");
    for skill in skills {
        out.push_str("  <skill>\n");
        out.push_str(&format!("    <name>{}</name>\n", skill.name));
        out.push_str(&format!(
            "    <description>{}</description>\n",
            skill.description
        ));
        out.push_str(&format!(
            "    <location>{}</location>\n",
            skill.location.display()
        ));
        out.push_str("  </skill>\n");
    }
    out.push_str("</available_skills>");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_skill(base: &Path, dir_name: &str, content: &str) {
        let dir = base.join(STATE_DIR).join(SKILLS_DIR).join(dir_name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(SKILL_FILE), content).unwrap();
    }

    #[test]
    fn test_split_frontmatter() {
        let (fm, body) = split_frontmatter("---\nname: x\n---\nbody here\n");
        assert_eq!(fm, Some("name: x"));
        assert_eq!(body, "body here\n");

        let (fm, body) = split_frontmatter("no fences\n");
        assert!(fm.is_none());
        assert_eq!(body, "no fences\n");

        let (fm, _) = split_frontmatter("---\nunterminated");
        assert!(fm.is_none());
    }

    #[test]
    fn test_discover_sorted_with_fallback_name() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(
            dir.path(),
            "zeta",
            "---\ndescription: does z things\n---\nZ body\n",
        );
        write_skill(
            dir.path(),
            "alpha",
            "---\nname: alpha\ndescription: does a things\n---\nA body\n",
        );

        let skills = discover(dir.path());
        assert_eq!(skills.len(), 2);
        assert_eq!(skills[0].name, "alpha");
        assert_eq!(skills[1].name, "zeta");
        assert_eq!(skills[1].description, "does z things");
        assert_eq!(skills[0].body, "A body");
    }

    #[test]
    fn test_discover_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(discover(dir.path()).is_empty());
    }

    #[test]
    fn test_discover_skips_files_without_skill_md() {
        let dir = tempfile::tempdir().unwrap();
        let skills_root = dir.path().join(STATE_DIR).join(SKILLS_DIR);
        fs::create_dir_all(skills_root.join("empty-dir")).unwrap();
        fs::write(skills_root.join("stray-file"), "x").unwrap();
        write_skill(dir.path(), "real", "body only\n");

        let skills = discover(dir.path());
        assert_eq!(skills.len(), 1);
        assert_eq!(skills[0].name, "real");
        assert_eq!(skills[0].body, "body only");
    }

    #[test]
    fn test_context_block_shape() {
        let skills = vec![
            Skill {
                name: "deploy".to_string(),
                description: "ship it".to_string(),
                location: PathBuf::from(".rai/skills/deploy/SKILL.md"),
                body: String::new(),
            },
            Skill {
                name: "review".to_string(),
                description: String::new(),
                location: PathBuf::from(".rai/skills/review/SKILL.md"),
                body: String::new(),
            },
        ];
        let block = skill_context_block(&skills);
        assert!(block.starts_with("<available_skills>\n"));
        assert!(block.ends_with("</available_skills>"));
        assert!(block.contains("<name>deploy</name>"));
        assert!(block.contains("<description>ship it</description>"));
        assert!(block.contains("<location>.rai/skills/review/SKILL.md</location>"));
        // Deterministic: rendering twice is identical
        assert_eq!(block, skill_context_block(&skills));
    }

    #[test]
    fn test_context_block_empty() {
        assert_eq!(
            skill_context_block(&[]),
            "<available_skills>\n</available_skills>"
        );
    }
}
