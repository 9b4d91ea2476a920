//! Management interface: thin, pure handlers over the agent/chain store.
//!
//! All validation runs to completion before any file is written. Results
//! carry warnings (unknown model, dangling chain references) that never
//! block the mutation itself.

use crate::agent::AgentDefinition;
use crate::agent::AgentScope;
use crate::agent::ThinkingLevel;
use crate::error::EngineError;
use crate::error::EngineResult;
use crate::store::AgentStore;
use crate::store::StoreScope;
use overseer_common::sanitize_name;
use serde::Deserialize;
use serde::Serialize;
use tracing::info;

/// Partial update; unset fields keep their prior values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentPatch {
    /// Rename target (sanitized like any other name).
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub thinking: Option<ThinkingLevel>,
    #[serde(default)]
    pub tools: Option<Vec<String>>,
    #[serde(default)]
    pub skills: Option<Vec<String>>,
    /// `Some("")` clears the default output file.
    #[serde(default)]
    pub output: Option<String>,
}

/// A management request.
#[derive(Debug, Clone)]
pub enum ManageAction {
    List {
        scope: AgentScope,
    },
    Get {
        name: String,
        scope: AgentScope,
    },
    Create {
        agent: AgentDefinition,
        scope: StoreScope,
    },
    Update {
        name: String,
        patch: AgentPatch,
        scope: StoreScope,
    },
    Delete {
        name: String,
        scope: StoreScope,
    },
}

/// Outcome of a management request.
#[derive(Debug, Clone, Default)]
pub struct ManageOutcome {
    pub message: String,
    pub warnings: Vec<String>,
    pub agents: Vec<AgentDefinition>,
}

const fn read_scope(scope: StoreScope) -> AgentScope {
    match scope {
        StoreScope::User => AgentScope::User,
        StoreScope::Project => AgentScope::Project,
    }
}

fn sanitize(raw: &str) -> EngineResult<String> {
    sanitize_name(raw)
        .ok_or_else(|| EngineError::Management(format!("name has no usable characters: {raw:?}")))
}

/// Error if `name` is already taken by an agent or chain in `scope`.
fn check_unique(store: &dyn AgentStore, name: &str, scope: StoreScope) -> EngineResult<()> {
    let read = read_scope(scope);
    if store.list_agents(read)?.iter().any(|a| a.name == name) {
        return Err(EngineError::Management(format!(
            "an agent named {name} already exists in that scope"
        )));
    }
    if store.list_chains(read)?.iter().any(|c| c.name == name) {
        return Err(EngineError::Management(format!(
            "a chain named {name} already exists in that scope"
        )));
    }
    Ok(())
}

/// Chains (any scope) whose steps reference `agent`.
fn referencing_chains(store: &dyn AgentStore, agent: &str) -> EngineResult<Vec<String>> {
    Ok(store
        .list_chains(AgentScope::Both)?
        .into_iter()
        .filter(|c| c.steps.iter().any(|s| s.agent == agent))
        .map(|c| c.name)
        .collect())
}

fn model_warning(model: &str, known_models: &[String]) -> Option<String> {
    (!known_models.is_empty() && !known_models.iter().any(|m| m == model))
        .then(|| format!("model not present in the model registry: {model}"))
}

/// Execute a management action. Pure over the store: no engine state is
/// touched.
pub fn handle(
    store: &dyn AgentStore,
    action: ManageAction,
    known_models: &[String],
) -> EngineResult<ManageOutcome> {
    match action {
        ManageAction::List { scope } => {
            let agents = store.list_agents(scope)?;
            Ok(ManageOutcome {
                message: format!("{} agent(s)", agents.len()),
                warnings: Vec::new(),
                agents,
            })
        }

        ManageAction::Get { name, scope } => {
            let agent = store
                .load_agent(&name, scope)?
                .ok_or_else(|| EngineError::Management(format!("agent not found: {name}")))?;
            Ok(ManageOutcome {
                message: agent.name.clone(),
                warnings: Vec::new(),
                agents: vec![agent],
            })
        }

        ManageAction::Create { mut agent, scope } => {
            agent.name = sanitize(&agent.name)?;
            check_unique(store, &agent.name, scope)?;
            let mut warnings = Vec::new();
            if let Some(w) = model_warning(&agent.model, known_models) {
                warnings.push(w);
            }
            let path = store.write_agent(&agent, scope)?;
            info!(name = %agent.name, path = %path.display(), "created agent");
            Ok(ManageOutcome {
                message: format!("created {}", agent.name),
                warnings,
                agents: vec![agent],
            })
        }

        ManageAction::Update { name, patch, scope } => {
            let mut agent = store
                .load_agent(&name, read_scope(scope))?
                .ok_or_else(|| EngineError::Management(format!("agent not found: {name}")))?;

            // Validate everything (including the rename target) before
            // writing anything.
            let rename = match &patch.name {
                Some(new_raw) => {
                    let new_name = sanitize(new_raw)?;
                    if new_name != name {
                        check_unique(store, &new_name, scope)?;
                        Some(new_name)
                    } else {
                        None
                    }
                }
                None => None,
            };

            if let Some(model) = patch.model {
                agent.model = model;
            }
            if let Some(prompt) = patch.system_prompt {
                agent.system_prompt = prompt;
            }
            if let Some(thinking) = patch.thinking {
                agent.thinking = thinking;
            }
            if let Some(tools) = patch.tools {
                agent.tools = tools;
            }
            if let Some(skills) = patch.skills {
                agent.skills = skills;
            }
            if let Some(output) = patch.output {
                // Explicit empty string clears the field.
                agent.output = (!output.is_empty()).then_some(output);
            }

            let mut warnings = Vec::new();
            if let Some(w) = model_warning(&agent.model, known_models) {
                warnings.push(w);
            }

            if let Some(new_name) = rename {
                let referencing = referencing_chains(store, &name)?;
                agent.name = new_name.clone();
                store.write_agent(&agent, scope)?;
                store.delete_agent(&name, scope)?;
                if !referencing.is_empty() {
                    warnings.push(format!(
                        "chains still reference the old name {name}: {}",
                        referencing.join(", ")
                    ));
                }
                info!(old = %name, new = %new_name, "renamed agent");
            } else {
                store.write_agent(&agent, scope)?;
            }

            Ok(ManageOutcome {
                message: format!("updated {}", agent.name),
                warnings,
                agents: vec![agent],
            })
        }

        ManageAction::Delete { name, scope } => {
            // Existence check first so the reference scan never runs for
            // a bogus name.
            store
                .load_agent(&name, read_scope(scope))?
                .ok_or_else(|| EngineError::Management(format!("agent not found: {name}")))?;
            let referencing = referencing_chains(store, &name)?;
            store.delete_agent(&name, scope)?;
            let mut warnings = Vec::new();
            if !referencing.is_empty() {
                warnings.push(format!(
                    "chains reference the deleted agent {name}: {}",
                    referencing.join(", ")
                ));
            }
            info!(name = %name, "deleted agent");
            Ok(ManageOutcome {
                message: format!("deleted {name}"),
                warnings,
                agents: Vec::new(),
            })
        }
    }
}
