//! Skill resolution and system-prompt injection.
//!
//! Skills are named markdown files under `<root>/skills/<name>.md` in the
//! project and user stores (project wins). Resolved skill content is
//! appended to the system prompt as `<skill name="...">` blocks in input
//! order, deduplicated by name; a missing skill produces a warning on the
//! step result instead of failing the run.

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use tracing::debug;

/// Looks up skill content by name.
pub trait SkillResolver: Send + Sync {
    fn lookup(&self, name: &str) -> Option<String>;
}

/// Filesystem resolver over the user/project skill directories.
#[derive(Debug, Clone, Default)]
pub struct FsSkillResolver {
    /// Searched in order; first hit wins.
    pub roots: Vec<PathBuf>,
}

impl FsSkillResolver {
    /// Project root first so project skills shadow user skills.
    pub fn new(user_root: PathBuf, project_root: Option<PathBuf>) -> Self {
        let mut roots = Vec::new();
        if let Some(project) = project_root {
            roots.push(project);
        }
        roots.push(user_root);
        Self { roots }
    }
}

impl SkillResolver for FsSkillResolver {
    fn lookup(&self, name: &str) -> Option<String> {
        for root in &self.roots {
            let path = root.join("skills").join(format!("{name}.md"));
            if let Ok(content) = fs::read_to_string(&path) {
                debug!(skill = name, path = %path.display(), "resolved skill");
                return Some(content);
            }
        }
        None
    }
}

/// Outcome of injecting skills into a system prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectedSkills {
    pub system_prompt: String,
    /// Names actually injected, input order, first occurrence kept.
    pub resolved: Vec<String>,
    /// One warning per missing skill.
    pub warnings: Vec<String>,
}

/// Append `<skill>` blocks for `names` to `system_prompt`.
pub fn inject_skills(
    system_prompt: &str,
    names: &[String],
    resolver: &dyn SkillResolver,
) -> InjectedSkills {
    let mut seen = HashSet::new();
    let mut resolved = Vec::new();
    let mut warnings = Vec::new();
    let mut prompt = system_prompt.to_string();

    for name in names {
        if !seen.insert(name.as_str()) {
            continue;
        }
        match resolver.lookup(name) {
            Some(content) => {
                if !prompt.is_empty() && !prompt.ends_with('\n') {
                    prompt.push('\n');
                }
                prompt.push_str(&format!(
                    "\n<skill name=\"{name}\">\n{}\n</skill>\n",
                    content.trim_end()
                ));
                resolved.push(name.clone());
            }
            None => warnings.push(format!("skill not found: {name}")),
        }
    }

    InjectedSkills {
        system_prompt: prompt,
        resolved,
        warnings,
    }
}
