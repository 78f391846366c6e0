//! Profile registry — discovery, validation, dependency ordering,
//! inheritance, atomic reload.
//!
//! Invalid profiles are *quarantined*: logged and excluded without blocking
//! the rest of the registry. A dependency cycle quarantines exactly the
//! profiles in the offending component (plus anything depending on them),
//! with a single diagnostic naming the cycle.
//!
//! Two loads over the same directory produce identical registries,
//! including topological order: the file walk is sorted, and Kahn's
//! algorithm breaks ties lexicographically by id.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{info, warn};

use crate::error::ProfileError;
use crate::expr::Expr;
use crate::profile::model::{
    EffectiveParams, EffectiveValidation, ProfileSkeleton, ResolvedCondition,
    ResolvedConditional, ResolvedPolicy, ResolvedProfile, DEFAULT_ALLOWED_ACTIONS,
};

/// Fallbacks applied after the inheritance merge leaves a field unset.
const DEFAULT_TEMPERATURE: f64 = 0.1;
const DEFAULT_MAX_TOKENS: u32 = 512;
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_REASONS: usize = 5;

/// A unit excluded from the registry, with the reason it was excluded.
#[derive(Debug, Clone)]
pub struct Quarantined {
    /// Profile id, or the file path when parsing never yielded an id.
    pub unit: String,
    pub reason: String,
}

/// An immutable, fully resolved profile registry.
#[derive(Debug, Default)]
pub struct Registry {
    profiles: BTreeMap<String, Arc<ResolvedProfile>>,
    order: Vec<String>,
    quarantined: Vec<Quarantined>,
}

impl Registry {
    /// Load every profile under `dir` (recursively; `.yaml`, `.yml`,
    /// `.json`). Only an unreadable directory is an error — individual
    /// bad profiles are quarantined.
    pub fn load_all(dir: &Path) -> Result<Registry, ProfileError> {
        let mut quarantined = Vec::new();
        let mut skeletons: BTreeMap<String, ProfileSkeleton> = BTreeMap::new();

        let mut files = find_profile_files(dir)?;
        files.sort();

        for file in &files {
            let file_display = file.display().to_string();
            let skeleton = match parse_profile_file(file) {
                Ok(s) => s,
                Err(reason) => {
                    warn!(file = %file_display, %reason, "Quarantined unparseable profile file");
                    quarantined.push(Quarantined { unit: file_display, reason });
                    continue;
                }
            };
            if let Err(e) = skeleton.validate() {
                warn!(file = %file_display, error = %e, "Quarantined invalid profile");
                quarantined.push(Quarantined {
                    unit: skeleton.id.clone(),
                    reason: e.to_string(),
                });
                continue;
            }
            if skeletons.contains_key(&skeleton.id) {
                warn!(file = %file_display, id = %skeleton.id, "Quarantined duplicate profile id");
                quarantined.push(Quarantined {
                    unit: file_display,
                    reason: format!("duplicate profile id {}", skeleton.id),
                });
                continue;
            }
            skeletons.insert(skeleton.id.clone(), skeleton);
        }

        let order = order_profiles(&mut skeletons, &mut quarantined);
        let (profiles, order) = resolve_in_order(skeletons, order, &mut quarantined);

        info!(
            loaded = profiles.len(),
            quarantined = quarantined.len(),
            "Profile registry loaded"
        );

        Ok(Registry {
            profiles,
            order,
            quarantined,
        })
    }

    /// Resolved profile by id.
    pub fn get(&self, id: &str) -> Result<&Arc<ResolvedProfile>, ProfileError> {
        self.profiles
            .get(id)
            .ok_or_else(|| ProfileError::NotFound(id.to_string()))
    }

    /// Execution order: every profile's transitive dependencies precede it.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Loaded profile ids, sorted.
    pub fn ids(&self) -> Vec<&str> {
        self.profiles.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn quarantined(&self) -> &[Quarantined] {
        &self.quarantined
    }
}

/// Shared handle with atomic replacement. Readers hold an `Arc<Registry>`
/// snapshot for the duration of a batch; `reload` builds the new registry
/// to completion before swapping, and leaves the old one live on failure.
pub struct RegistryHandle {
    dir: std::path::PathBuf,
    current: RwLock<Arc<Registry>>,
}

impl RegistryHandle {
    pub fn load(dir: &Path) -> Result<Self, ProfileError> {
        let registry = Registry::load_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            current: RwLock::new(Arc::new(registry)),
        })
    }

    /// Snapshot of the current registry.
    pub fn current(&self) -> Arc<Registry> {
        self.current.read().expect("registry lock poisoned").clone()
    }

    /// Rebuild from disk and swap. The old registry stays live until the
    /// new one is complete; a load error leaves it untouched.
    pub fn reload(&self) -> Result<Arc<Registry>, ProfileError> {
        let fresh = Arc::new(Registry::load_all(&self.dir)?);
        let mut guard = self.current.write().expect("registry lock poisoned");
        *guard = fresh.clone();
        info!(profiles = fresh.len(), "Registry reloaded");
        Ok(fresh)
    }
}

// ── Discovery and parsing ───────────────────────────────────────────

fn find_profile_files(dir: &Path) -> Result<Vec<std::path::PathBuf>, ProfileError> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml") | Some("json")
            ) {
                files.push(path);
            }
        }
    }
    Ok(files)
}

fn parse_profile_file(path: &Path) -> Result<ProfileSkeleton, String> {
    let data = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    if path.extension().and_then(|e| e.to_str()) == Some("json") {
        serde_json::from_str(&data).map_err(|e| e.to_string())
    } else {
        serde_yaml::from_str(&data).map_err(|e| e.to_string())
    }
}

// ── Dependency ordering ─────────────────────────────────────────────

/// Edges of a profile: its parent plus explicit dependencies.
fn dependencies(skeleton: &ProfileSkeleton) -> Vec<&str> {
    skeleton
        .inherits_from
        .iter()
        .map(String::as_str)
        .chain(skeleton.depends_on.iter().map(String::as_str))
        .collect()
}

/// Quarantine profiles whose dependencies are missing or quarantined,
/// run Kahn's algorithm, and carve out cycle components until every
/// surviving profile is ordered.
fn order_profiles(
    skeletons: &mut BTreeMap<String, ProfileSkeleton>,
    quarantined: &mut Vec<Quarantined>,
) -> Vec<String> {
    loop {
        quarantine_missing_deps(skeletons, quarantined);

        let (order, leftover) = kahn(skeletons);
        if leftover.is_empty() {
            return order;
        }

        // Every leftover node sits in or downstream of a cycle. Extract one
        // cycle, quarantine its members, and let the missing-dep fixpoint
        // take care of the downstream profiles on the next pass.
        let cycle = find_cycle(skeletons, &leftover);
        let diagnostic = format!(
            "dependency cycle: {} -> {}",
            cycle.join(" -> "),
            cycle[0]
        );
        warn!(cycle = %diagnostic, "Quarantined profile cycle");
        for id in &cycle {
            skeletons.remove(id);
            quarantined.push(Quarantined {
                unit: id.clone(),
                reason: diagnostic.clone(),
            });
        }
    }
}

fn quarantine_missing_deps(
    skeletons: &mut BTreeMap<String, ProfileSkeleton>,
    quarantined: &mut Vec<Quarantined>,
) {
    loop {
        let mut doomed: Option<(String, String)> = None;
        for (id, skeleton) in skeletons.iter() {
            if let Some(dep) = dependencies(skeleton)
                .iter()
                .find(|d| !skeletons.contains_key(**d))
            {
                doomed = Some((id.clone(), dep.to_string()));
                break;
            }
        }
        match doomed {
            Some((id, dep)) => {
                warn!(profile = %id, dependency = %dep, "Quarantined profile with missing dependency");
                skeletons.remove(&id);
                quarantined.push(Quarantined {
                    unit: id.clone(),
                    reason: ProfileError::MissingDependency { id, dependency: dep }.to_string(),
                });
            }
            None => return,
        }
    }
}

/// Kahn's algorithm with a lexicographic ready set. Returns the order and
/// the set of ids left unordered (cycle participants and their dependents).
fn kahn(skeletons: &BTreeMap<String, ProfileSkeleton>) -> (Vec<String>, BTreeSet<String>) {
    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for (id, skeleton) in skeletons {
        in_degree.entry(id).or_insert(0);
        for dep in dependencies(skeleton) {
            *in_degree.entry(id).or_insert(0) += 1;
            dependents.entry(dep).or_default().push(id);
        }
    }

    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(skeletons.len());

    while let Some(&id) = ready.iter().next() {
        ready.remove(id);
        order.push(id.to_string());
        if let Some(deps) = dependents.get(id) {
            for &dependent in deps {
                let d = in_degree.get_mut(dependent).expect("node registered");
                *d -= 1;
                if *d == 0 {
                    ready.insert(dependent);
                }
            }
        }
    }

    let leftover: BTreeSet<String> = skeletons
        .keys()
        .filter(|id| !order.contains(*id))
        .cloned()
        .collect();
    (order, leftover)
}

/// Walk dependency edges within `leftover` from its smallest member until a
/// node repeats; the repeated segment is a cycle, reported in walk order.
fn find_cycle(
    skeletons: &BTreeMap<String, ProfileSkeleton>,
    leftover: &BTreeSet<String>,
) -> Vec<String> {
    let start = leftover.iter().next().expect("leftover not empty").clone();
    let mut stack: Vec<String> = Vec::new();
    let mut current = start;

    loop {
        if let Some(pos) = stack.iter().position(|id| *id == current) {
            return stack[pos..].to_vec();
        }
        stack.push(current.clone());
        let skeleton = &skeletons[&current];
        let next = dependencies(skeleton)
            .into_iter()
            .find(|d| leftover.contains(*d))
            .expect("leftover node must have an unsatisfied dependency")
            .to_string();
        current = next;
    }
}

// ── Inheritance resolution ──────────────────────────────────────────

/// Merge skeletons into resolved profiles in topological order, so each
/// parent is fully resolved before any child. Resolution failures
/// quarantine the profile (and, transitively, profiles that needed it).
fn resolve_in_order(
    skeletons: BTreeMap<String, ProfileSkeleton>,
    order: Vec<String>,
    quarantined: &mut Vec<Quarantined>,
) -> (BTreeMap<String, Arc<ResolvedProfile>>, Vec<String>) {
    let mut resolved: BTreeMap<String, Arc<ResolvedProfile>> = BTreeMap::new();
    let mut final_order = Vec::with_capacity(order.len());

    'profiles: for id in order {
        let skeleton = &skeletons[&id];

        // A quarantined parent or dependency takes the child with it.
        for dep in dependencies(skeleton) {
            if !resolved.contains_key(dep) {
                warn!(profile = %id, dependency = %dep, "Quarantined profile whose dependency failed to resolve");
                quarantined.push(Quarantined {
                    unit: id.clone(),
                    reason: format!("dependency {dep} was quarantined"),
                });
                continue 'profiles;
            }
        }

        let parent = skeleton
            .inherits_from
            .as_deref()
            .map(|p| resolved[p].clone());

        match resolve_one(skeleton, parent.as_deref()) {
            Ok(profile) => {
                info!(profile = %id, version = %profile.version, "Loaded profile");
                resolved.insert(id.clone(), Arc::new(profile));
                final_order.push(id);
            }
            Err(reason) => {
                warn!(profile = %id, %reason, "Quarantined profile at resolution");
                quarantined.push(Quarantined { unit: id.clone(), reason });
            }
        }
    }

    (resolved, final_order)
}

fn resolve_one(
    skeleton: &ProfileSkeleton,
    parent: Option<&ResolvedProfile>,
) -> Result<ResolvedProfile, String> {
    // System prompt: parent followed by child; a child that declares
    // nothing inherits the parent's verbatim.
    let child_system = skeleton.system.as_deref().unwrap_or("").trim().to_string();
    let system = match parent {
        Some(p) if !child_system.is_empty() => format!("{}\n\n{}", p.system, child_system),
        Some(p) => p.system.clone(),
        None => child_system,
    };
    if system.is_empty() {
        return Err("system prompt is required".to_string());
    }

    let model = skeleton
        .model
        .clone()
        .or_else(|| parent.map(|p| p.model.clone()))
        .ok_or_else(|| "model is required".to_string())?;

    // Model params: field-wise, child wins iff set.
    let mp = &skeleton.model_params;
    let params = EffectiveParams {
        temperature: mp
            .temperature
            .or(parent.map(|p| p.params.temperature))
            .unwrap_or(DEFAULT_TEMPERATURE),
        max_tokens: mp
            .max_tokens
            .or(parent.map(|p| p.params.max_tokens))
            .unwrap_or(DEFAULT_MAX_TOKENS),
        timeout: mp
            .timeout_secs
            .map(Duration::from_secs)
            .or(parent.map(|p| p.params.timeout))
            .unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
        top_p: mp.top_p.or(parent.and_then(|p| p.params.top_p)),
        top_k: mp.top_k.or(parent.and_then(|p| p.params.top_k)),
    };

    // Few-shot: parent list followed by child list.
    let mut fewshot = parent.map(|p| p.fewshot.clone()).unwrap_or_default();
    fewshot.extend(skeleton.fewshot.iter().cloned());

    // Validation: inherit field-wise where the child omitted.
    let validation = EffectiveValidation {
        required_fields: skeleton
            .response
            .required_fields
            .clone()
            .or_else(|| parent.map(|p| p.validation.required_fields.clone()))
            .unwrap_or_else(|| vec!["action".to_string(), "confidence".to_string()]),
        confidence_range: skeleton
            .response
            .confidence_range
            .or(parent.map(|p| p.validation.confidence_range))
            .unwrap_or([0.0, 1.0]),
        allowed_actions: skeleton
            .response
            .allowed_actions
            .clone()
            .or_else(|| parent.map(|p| p.validation.allowed_actions.clone()))
            .unwrap_or_else(|| {
                DEFAULT_ALLOWED_ACTIONS.iter().map(|s| s.to_string()).collect()
            }),
        max_reasons: skeleton
            .response
            .max_reasons
            .or(parent.map(|p| p.validation.max_reasons))
            .unwrap_or(DEFAULT_MAX_REASONS),
    };

    // Policy: parent conditions first, then the child's, expressions parsed.
    let mut conditions = parent.map(|p| p.policy.conditions.clone()).unwrap_or_default();
    for c in &skeleton.policy.conditions {
        let expr = Expr::parse(&c.expression)
            .map_err(|e| format!("policy condition '{}': {e}", c.name))?;
        conditions.push(ResolvedCondition {
            name: c.name.clone(),
            expr,
            actions: c.actions.clone(),
            priority: c.priority,
            confidence_boost: c.confidence_boost,
        });
    }
    let default_action = skeleton
        .policy
        .default_action
        .clone()
        .or_else(|| parent.and_then(|p| p.policy.default_action.clone()));

    let conditional = skeleton
        .conditional_execution
        .as_ref()
        .map(|c| {
            Expr::parse(&c.when)
                .map(|when| ResolvedConditional {
                    when,
                    reason: c.reason.clone(),
                })
                .map_err(|e| format!("conditional_execution: {e}"))
        })
        .transpose()?;

    Ok(ResolvedProfile {
        id: skeleton.id.clone(),
        version: skeleton.version.clone(),
        depends_on: skeleton.depends_on.clone(),
        inherits_from: skeleton.inherits_from.clone(),
        conditional,
        model,
        params,
        system,
        fewshot,
        validation,
        policy: ResolvedPolicy {
            conditions,
            default_action,
        },
    })
}
