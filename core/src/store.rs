//! Agent and chain store: markdown files with YAML frontmatter.
//!
//! Layout:
//! - user scope: `~/.overseer/agents/*.md`, `~/.overseer/chains/*.yaml`
//! - project scope: `<project>/.overseer/agents/*.md`, `…/chains/*.yaml`,
//!   where the project root is found by walking up from the cwd.
//!
//! An agent file is YAML frontmatter between `---` fences followed by the
//! system prompt body. Chains are plain YAML step lists.

use crate::agent::AgentDefinition;
use crate::agent::AgentScope;
use crate::agent::AgentSource;
use crate::error::EngineError;
use crate::error::EngineResult;
use serde::Deserialize;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use tracing::debug;
use tracing::warn;
use walkdir::WalkDir;

/// Write target for management mutations (never `Both`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreScope {
    User,
    Project,
}

/// One step of a stored chain definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainStepDef {
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
}

/// A stored, named chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<ChainStepDef>,
}

/// Contract the engine consumes for agent/chain persistence.
pub trait AgentStore: Send + Sync {
    fn list_agents(&self, scope: AgentScope) -> EngineResult<Vec<AgentDefinition>>;
    fn list_chains(&self, scope: AgentScope) -> EngineResult<Vec<ChainDefinition>>;
    fn load_agent(&self, name: &str, scope: AgentScope) -> EngineResult<Option<AgentDefinition>>;
    fn write_agent(&self, agent: &AgentDefinition, scope: StoreScope) -> EngineResult<PathBuf>;
    fn write_chain(&self, chain: &ChainDefinition, scope: StoreScope) -> EngineResult<PathBuf>;
    fn delete_agent(&self, name: &str, scope: StoreScope) -> EngineResult<()>;
    fn delete_chain(&self, name: &str, scope: StoreScope) -> EngineResult<()>;
}

/// Frontmatter half of an agent file; the body is the system prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AgentFrontmatter {
    #[serde(flatten)]
    agent: AgentDefinition,
}

fn split_frontmatter(text: &str) -> Option<(&str, &str)> {
    let rest = text.strip_prefix("---")?;
    let end = rest.find("\n---")?;
    let yaml = &rest[..end];
    let body = rest[end + 4..].trim_start_matches(['\r', '\n']);
    Some((yaml, body))
}

fn render_agent_file(agent: &AgentDefinition) -> EngineResult<String> {
    // The body carries the prompt; blank it in the frontmatter copy.
    let mut head = agent.clone();
    let body = std::mem::take(&mut head.system_prompt);
    let yaml = serde_yaml::to_string(&AgentFrontmatter { agent: head }).map_err(|e| {
        EngineError::Store {
            path: PathBuf::from(&agent.name),
            message: e.to_string(),
        }
    })?;
    Ok(format!("---\n{yaml}---\n\n{body}"))
}

fn parse_agent_file(path: &Path, source: AgentSource) -> EngineResult<AgentDefinition> {
    let text = fs::read_to_string(path).map_err(|e| EngineError::Store {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let (yaml, body) = split_frontmatter(&text).ok_or_else(|| EngineError::Store {
        path: path.to_path_buf(),
        message: "missing frontmatter fences".to_string(),
    })?;
    let head: AgentFrontmatter = serde_yaml::from_str(yaml).map_err(|e| EngineError::Store {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let mut agent = head.agent;
    agent.system_prompt = body.trim_end().to_string();
    agent.source = source;
    Ok(agent)
}

/// Filesystem-backed store.
#[derive(Debug, Clone)]
pub struct FsAgentStore {
    user_root: PathBuf,
    project_root: Option<PathBuf>,
}

impl FsAgentStore {
    /// Store rooted at the standard locations for `cwd`.
    pub fn discover(cwd: &Path) -> Self {
        let user_root = dirs::home_dir()
            .map(|h| h.join(".overseer"))
            .unwrap_or_else(|| std::env::temp_dir().join("overseer-user"));
        Self {
            user_root,
            project_root: find_project_root(cwd),
        }
    }

    /// Store with explicit roots (tests).
    pub const fn with_roots(user_root: PathBuf, project_root: Option<PathBuf>) -> Self {
        Self {
            user_root,
            project_root,
        }
    }

    fn scope_root(&self, scope: StoreScope) -> EngineResult<&Path> {
        match scope {
            StoreScope::User => Ok(&self.user_root),
            StoreScope::Project => self.project_root.as_deref().ok_or_else(|| {
                EngineError::Management("no project directory found above the cwd".to_string())
            }),
        }
    }

    fn agents_in(&self, root: &Path, source: AgentSource) -> Vec<AgentDefinition> {
        let dir = root.join("agents");
        let mut agents = Vec::new();
        for entry in WalkDir::new(&dir)
            .max_depth(1)
            .into_iter()
            .filter_map(Result::ok)
        {
            let path = entry.path();
            if path.extension().is_none_or(|e| e != "md") {
                continue;
            }
            match parse_agent_file(path, source) {
                Ok(agent) => agents.push(agent),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable agent"),
            }
        }
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        agents
    }

    fn chains_in(&self, root: &Path) -> Vec<ChainDefinition> {
        let dir = root.join("chains");
        let mut chains: Vec<ChainDefinition> = Vec::new();
        for entry in WalkDir::new(&dir)
            .max_depth(1)
            .into_iter()
            .filter_map(Result::ok)
        {
            let path = entry.path();
            if path.extension().is_none_or(|e| e != "yaml" && e != "yml") {
                continue;
            }
            let parsed = fs::read_to_string(path)
                .map_err(|e| e.to_string())
                .and_then(|text| serde_yaml::from_str(&text).map_err(|e| e.to_string()));
            match parsed {
                Ok(chain) => chains.push(chain),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable chain"),
            }
        }
        chains.sort_by(|a, b| a.name.cmp(&b.name));
        chains
    }
}

/// Walk up from `cwd` to the nearest directory containing `.overseer`.
pub fn find_project_root(cwd: &Path) -> Option<PathBuf> {
    let mut current = Some(cwd);
    while let Some(dir) = current {
        let marker = dir.join(".overseer");
        if marker.is_dir() {
            return Some(marker);
        }
        current = dir.parent();
    }
    None
}

impl AgentStore for FsAgentStore {
    fn list_agents(&self, scope: AgentScope) -> EngineResult<Vec<AgentDefinition>> {
        let mut by_name: HashMap<String, AgentDefinition> = HashMap::new();
        if matches!(scope, AgentScope::User | AgentScope::Both) {
            for agent in self.agents_in(&self.user_root, AgentSource::User) {
                by_name.insert(agent.name.clone(), agent);
            }
        }
        if matches!(scope, AgentScope::Project | AgentScope::Both)
            && let Some(project) = &self.project_root
        {
            // Project definitions shadow user definitions on collision.
            for agent in self.agents_in(project, AgentSource::Project) {
                by_name.insert(agent.name.clone(), agent);
            }
        }
        let mut agents: Vec<AgentDefinition> = by_name.into_values().collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(agents)
    }

    fn list_chains(&self, scope: AgentScope) -> EngineResult<Vec<ChainDefinition>> {
        let mut by_name: HashMap<String, ChainDefinition> = HashMap::new();
        if matches!(scope, AgentScope::User | AgentScope::Both) {
            for chain in self.chains_in(&self.user_root) {
                by_name.insert(chain.name.clone(), chain);
            }
        }
        if matches!(scope, AgentScope::Project | AgentScope::Both)
            && let Some(project) = &self.project_root
        {
            for chain in self.chains_in(project) {
                by_name.insert(chain.name.clone(), chain);
            }
        }
        let mut chains: Vec<ChainDefinition> = by_name.into_values().collect();
        chains.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(chains)
    }

    fn load_agent(&self, name: &str, scope: AgentScope) -> EngineResult<Option<AgentDefinition>> {
        Ok(self
            .list_agents(scope)?
            .into_iter()
            .find(|a| a.name == name))
    }

    fn write_agent(&self, agent: &AgentDefinition, scope: StoreScope) -> EngineResult<PathBuf> {
        let dir = self.scope_root(scope)?.join("agents");
        overseer_common::ensure_accessible_dir(&dir)?;
        let path = dir.join(format!("{}.md", agent.name));
        fs::write(&path, render_agent_file(agent)?)?;
        debug!(path = %path.display(), "wrote agent");
        Ok(path)
    }

    fn write_chain(&self, chain: &ChainDefinition, scope: StoreScope) -> EngineResult<PathBuf> {
        let dir = self.scope_root(scope)?.join("chains");
        overseer_common::ensure_accessible_dir(&dir)?;
        let path = dir.join(format!("{}.yaml", chain.name));
        let yaml = serde_yaml::to_string(chain).map_err(|e| EngineError::Store {
            path: path.clone(),
            message: e.to_string(),
        })?;
        fs::write(&path, yaml)?;
        Ok(path)
    }

    fn delete_agent(&self, name: &str, scope: StoreScope) -> EngineResult<()> {
        let path = self.scope_root(scope)?.join("agents").join(format!("{name}.md"));
        fs::remove_file(&path).map_err(|e| EngineError::Store {
            path,
            message: e.to_string(),
        })
    }

    fn delete_chain(&self, name: &str, scope: StoreScope) -> EngineResult<()> {
        let path = self
            .scope_root(scope)?
            .join("chains")
            .join(format!("{name}.yaml"));
        fs::remove_file(&path).map_err(|e| EngineError::Store {
            path,
            message: e.to_string(),
        })
    }
}

/// In-memory store for tests and embedding callers.
#[derive(Debug, Default)]
pub struct MemoryStore {
    agents: std::sync::Mutex<HashMap<String, AgentDefinition>>,
    chains: std::sync::Mutex<HashMap<String, ChainDefinition>>,
}

impl MemoryStore {
    pub fn with_agents(agents: impl IntoIterator<Item = AgentDefinition>) -> Self {
        let store = Self::default();
        {
            let mut map = store.agents.lock().unwrap_or_else(|e| e.into_inner());
            for agent in agents {
                map.insert(agent.name.clone(), agent);
            }
        }
        store
    }
}

impl AgentStore for MemoryStore {
    fn list_agents(&self, _scope: AgentScope) -> EngineResult<Vec<AgentDefinition>> {
        let map = self.agents.lock().unwrap_or_else(|e| e.into_inner());
        let mut agents: Vec<AgentDefinition> = map.values().cloned().collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(agents)
    }

    fn list_chains(&self, _scope: AgentScope) -> EngineResult<Vec<ChainDefinition>> {
        let map = self.chains.lock().unwrap_or_else(|e| e.into_inner());
        let mut chains: Vec<ChainDefinition> = map.values().cloned().collect();
        chains.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(chains)
    }

    fn load_agent(&self, name: &str, _scope: AgentScope) -> EngineResult<Option<AgentDefinition>> {
        let map = self.agents.lock().unwrap_or_else(|e| e.into_inner());
        Ok(map.get(name).cloned())
    }

    fn write_agent(&self, agent: &AgentDefinition, _scope: StoreScope) -> EngineResult<PathBuf> {
        let mut map = self.agents.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(agent.name.clone(), agent.clone());
        Ok(PathBuf::from(format!("memory://agents/{}.md", agent.name)))
    }

    fn write_chain(&self, chain: &ChainDefinition, _scope: StoreScope) -> EngineResult<PathBuf> {
        let mut map = self.chains.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(chain.name.clone(), chain.clone());
        Ok(PathBuf::from(format!("memory://chains/{}.yaml", chain.name)))
    }

    fn delete_agent(&self, name: &str, _scope: StoreScope) -> EngineResult<()> {
        let mut map = self.agents.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(name).map(|_| ()).ok_or_else(|| {
            EngineError::Management(format!("agent not found: {name}"))
        })
    }

    fn delete_chain(&self, name: &str, _scope: StoreScope) -> EngineResult<()> {
        let mut map = self.chains.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(name).map(|_| ()).ok_or_else(|| {
            EngineError::Management(format!("chain not found: {name}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ThinkingLevel;
    use pretty_assertions::assert_eq;

    fn sample_agent(name: &str) -> AgentDefinition {
        let mut agent = AgentDefinition::new(name, "acme/fast-1");
        agent.system_prompt = "You are a scout.\n\nBe quick.".to_string();
        agent.thinking = ThinkingLevel::Low;
        agent.tools = vec!["read".to_string(), "grep".to_string()];
        agent
    }

    #[test]
    fn agent_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsAgentStore::with_roots(dir.path().to_path_buf(), None);
        let agent = sample_agent("scout");
        let path = store.write_agent(&agent, StoreScope::User).unwrap();
        assert!(path.ends_with("agents/scout.md"));

        let loaded = store
            .load_agent("scout", AgentScope::User)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.system_prompt, agent.system_prompt);
        assert_eq!(loaded.model, agent.model);
        assert_eq!(loaded.thinking, ThinkingLevel::Low);
    }

    #[test]
    fn project_shadows_user_on_collision() {
        let user = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        let store = FsAgentStore::with_roots(
            user.path().to_path_buf(),
            Some(project.path().to_path_buf()),
        );

        let mut user_agent = sample_agent("scout");
        user_agent.model = "acme/fast-1".to_string();
        store.write_agent(&user_agent, StoreScope::User).unwrap();

        let mut project_agent = sample_agent("scout");
        project_agent.model = "acme/smart-2".to_string();
        store
            .write_agent(&project_agent, StoreScope::Project)
            .unwrap();

        let both = store.load_agent("scout", AgentScope::Both).unwrap().unwrap();
        assert_eq!(both.model, "acme/smart-2");
        assert_eq!(both.source, AgentSource::Project);

        let user_only = store.load_agent("scout", AgentScope::User).unwrap().unwrap();
        assert_eq!(user_only.model, "acme/fast-1");
    }

    #[test]
    fn find_project_root_walks_up() {
        let root = tempfile::tempdir().unwrap();
        let marker = root.path().join(".overseer");
        fs::create_dir_all(marker.join("agents")).unwrap();
        let nested = root.path().join("src/deep/module");
        fs::create_dir_all(&nested).unwrap();
        assert_eq!(find_project_root(&nested), Some(marker));
        let outside = tempfile::tempdir().unwrap();
        assert_eq!(find_project_root(outside.path()), None);
    }

    #[test]
    fn chain_yaml_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsAgentStore::with_roots(dir.path().to_path_buf(), None);
        let chain = ChainDefinition {
            name: "review".to_string(),
            description: "scan then review".to_string(),
            steps: vec![
                ChainStepDef {
                    agent: "scout".to_string(),
                    task: Some("scan {task}".to_string()),
                },
                ChainStepDef {
                    agent: "reviewer".to_string(),
                    task: None,
                },
            ],
        };
        store.write_chain(&chain, StoreScope::User).unwrap();
        let listed = store.list_chains(AgentScope::User).unwrap();
        assert_eq!(listed, vec![chain]);
    }

    #[test]
    fn missing_frontmatter_is_a_store_error() {
        let dir = tempfile::tempdir().unwrap();
        let agents = dir.path().join("agents");
        fs::create_dir_all(&agents).unwrap();
        fs::write(agents.join("broken.md"), "no fences here").unwrap();
        let store = FsAgentStore::with_roots(dir.path().to_path_buf(), None);
        // Unreadable files are skipped, not fatal.
        assert!(store.list_agents(AgentScope::User).unwrap().is_empty());
    }
}
