//! Flavors: named resource bundles and the graph of which flavor replaces which.
//!
//! A configured flavor may declare that it `replaces` older flavors. The
//! replaces edges form a DAG: a node of flavor `B` that replaces `A`
//! satisfies a request for `A`, because the old hardware generation is
//! eventually migrated onto the new one.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::FlavorConfig;
use crate::resources::NodeResources;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FlavorError {
    #[error("unknown flavor '{0}'")]
    Unknown(String),

    #[error("flavor '{flavor}' replaces unknown flavor '{replaces}'")]
    UnknownReplaces { flavor: String, replaces: String },

    #[error("flavor '{0}' is part of a replaces cycle")]
    Cycle(String),

    #[error("flavor '{0}' is defined more than once")]
    Duplicate(String),
}

/// A flavor: either configured (named hardware) or custom (derived from resources).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flavor {
    pub name: String,
    pub resources: NodeResources,
    /// Relative cost; zero for custom flavors.
    pub cost: u32,
    pub configured: bool,
    /// Flavors this one replaces, resolved transitively through the graph.
    #[serde(default)]
    pub replaces: Vec<Flavor>,
}

impl Flavor {
    /// A custom flavor carrying exactly `resources`.
    pub fn custom(resources: NodeResources) -> Self {
        Self {
            name: format!(
                "custom-{}-{}-{}",
                resources.vcpu, resources.memory_gb, resources.disk_gb
            ),
            resources,
            cost: 0,
            configured: false,
            replaces: Vec::new(),
        }
    }

    /// Whether a node of this flavor can stand in for a node of `other`:
    /// the same flavor, or one that (transitively) replaces it.
    pub fn satisfies(&self, other: &Flavor) -> bool {
        if self.name == other.name {
            return true;
        }
        self.replaces.iter().any(|replaced| replaced.satisfies(other))
    }

    /// This flavor with its resources swapped out, as happens on in-place resize.
    pub fn with_resources(&self, resources: NodeResources) -> Self {
        Flavor::custom(resources)
    }
}

impl fmt::Display for Flavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.configured {
            write!(f, "flavor '{}'", self.name)
        } else {
            write!(f, "resources {}", self.resources)
        }
    }
}

/// All configured flavors of a zone, with `replaces` resolved.
#[derive(Debug, Clone, Default)]
pub struct FlavorGraph {
    flavors: BTreeMap<String, Flavor>,
}

impl FlavorGraph {
    /// Build the graph, rejecting duplicate names, dangling `replaces` and cycles.
    pub fn from_config(configs: &[FlavorConfig]) -> Result<Self, FlavorError> {
        let mut by_name: BTreeMap<&str, &FlavorConfig> = BTreeMap::new();
        for config in configs {
            if by_name.insert(config.name.as_str(), config).is_some() {
                return Err(FlavorError::Duplicate(config.name.clone()));
            }
        }
        for config in configs {
            for replaced in &config.replaces {
                if !by_name.contains_key(replaced.as_str()) {
                    return Err(FlavorError::UnknownReplaces {
                        flavor: config.name.clone(),
                        replaces: replaced.clone(),
                    });
                }
            }
        }

        let mut resolved: BTreeMap<String, Flavor> = BTreeMap::new();
        for config in configs {
            let mut visiting = HashSet::new();
            resolve(config.name.as_str(), &by_name, &mut resolved, &mut visiting)?;
        }
        Ok(Self { flavors: resolved })
    }

    pub fn get(&self, name: &str) -> Option<&Flavor> {
        self.flavors.get(name)
    }

    pub fn flavor(&self, name: &str) -> Result<Flavor, FlavorError> {
        self.get(name)
            .cloned()
            .ok_or_else(|| FlavorError::Unknown(name.to_string()))
    }

    pub fn all(&self) -> impl Iterator<Item = &Flavor> {
        self.flavors.values()
    }

    pub fn is_empty(&self) -> bool {
        self.flavors.is_empty()
    }
}

fn resolve(
    name: &str,
    configs: &BTreeMap<&str, &FlavorConfig>,
    resolved: &mut BTreeMap<String, Flavor>,
    visiting: &mut HashSet<String>,
) -> Result<Flavor, FlavorError> {
    if let Some(done) = resolved.get(name) {
        return Ok(done.clone());
    }
    if !visiting.insert(name.to_string()) {
        return Err(FlavorError::Cycle(name.to_string()));
    }
    let config = configs
        .get(name)
        .ok_or_else(|| FlavorError::Unknown(name.to_string()))?;

    let mut replaces = Vec::with_capacity(config.replaces.len());
    for replaced in &config.replaces {
        replaces.push(resolve(replaced, configs, resolved, visiting)?);
    }
    visiting.remove(name);

    let flavor = Flavor {
        name: config.name.clone(),
        resources: config.resources(),
        cost: config.cost,
        configured: true,
        replaces,
    };
    resolved.insert(flavor.name.clone(), flavor.clone());
    Ok(flavor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(name: &str, replaces: &[&str]) -> FlavorConfig {
        FlavorConfig {
            name: name.to_string(),
            vcpu: 4.0,
            memory_gb: 16.0,
            disk_gb: 100.0,
            bandwidth_gbps: 1.0,
            replaces: replaces.iter().map(|s| s.to_string()).collect(),
            ..FlavorConfig::default()
        }
    }

    #[test]
    fn replaces_is_transitive() {
        let graph = FlavorGraph::from_config(&[
            config("gen1", &[]),
            config("gen2", &["gen1"]),
            config("gen3", &["gen2"]),
        ])
        .unwrap();

        let gen1 = graph.flavor("gen1").unwrap();
        let gen3 = graph.flavor("gen3").unwrap();
        assert!(gen3.satisfies(&gen1));
        assert!(!gen1.satisfies(&gen3));
        assert!(gen1.satisfies(&gen1));
    }

    #[test]
    fn rejects_cycles() {
        let err = FlavorGraph::from_config(&[config("a", &["b"]), config("b", &["a"])]).unwrap_err();
        assert!(matches!(err, FlavorError::Cycle(_)));
    }

    #[test]
    fn rejects_dangling_replaces() {
        let err = FlavorGraph::from_config(&[config("a", &["ghost"])]).unwrap_err();
        assert_eq!(
            err,
            FlavorError::UnknownReplaces {
                flavor: "a".to_string(),
                replaces: "ghost".to_string()
            }
        );
    }

    #[test]
    fn custom_flavor_is_not_configured() {
        let flavor = Flavor::custom(NodeResources::new(2.0, 8.0, 50.0, 1.0));
        assert!(!flavor.configured);
        assert_eq!(flavor.cost, 0);
        assert_eq!(flavor.name, "custom-2-8-50");
    }
}
