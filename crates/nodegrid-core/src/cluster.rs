//! Cluster identities and cluster membership.

use std::fmt;

use semver::Version;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterType {
    Admin,
    Container,
    Content,
    /// A container and a content cluster sharing the same nodes.
    Combined,
}

impl ClusterType {
    pub fn is_content(self) -> bool {
        matches!(self, ClusterType::Content | ClusterType::Combined)
    }

    pub fn is_container(self) -> bool {
        matches!(self, ClusterType::Container | ClusterType::Combined)
    }
}

impl fmt::Display for ClusterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClusterType::Admin => "admin",
            ClusterType::Container => "container",
            ClusterType::Content => "content",
            ClusterType::Combined => "combined",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterId(pub String);

impl ClusterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a cluster's endpoint is exposed by its load balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ZoneEndpoint {
    pub public: bool,
    pub private: bool,
}

impl Default for ZoneEndpoint {
    fn default() -> Self {
        Self {
            public: true,
            private: false,
        }
    }
}

impl ZoneEndpoint {
    pub fn private_only() -> Self {
        Self {
            public: false,
            private: true,
        }
    }

    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

/// A cluster as requested by a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub cluster_type: ClusterType,
    pub id: ClusterId,
    /// Group this node belongs to; `None` in requests, set on allocated nodes.
    pub group: Option<u32>,
    pub exclusive: bool,
    /// Id of the container cluster whose load balancer this cluster shares.
    pub combined_id: Option<ClusterId>,
    pub platform_version: Version,
    #[serde(default)]
    pub zone_endpoint: ZoneEndpoint,
    /// Containers may declare themselves stateful; content clusters always are.
    #[serde(default)]
    pub stateful: bool,
}

impl ClusterSpec {
    pub fn request(cluster_type: ClusterType, id: ClusterId, platform_version: Version) -> Self {
        Self {
            cluster_type,
            id,
            group: None,
            exclusive: false,
            combined_id: None,
            platform_version,
            zone_endpoint: ZoneEndpoint::default(),
            stateful: false,
        }
    }

    pub fn with_group(mut self, group: Option<u32>) -> Self {
        self.group = group;
        self
    }

    pub fn with_exclusivity(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn with_combined_id(mut self, combined_id: Option<ClusterId>) -> Self {
        self.combined_id = combined_id;
        self
    }

    pub fn with_zone_endpoint(mut self, zone_endpoint: ZoneEndpoint) -> Self {
        self.zone_endpoint = zone_endpoint;
        self
    }

    pub fn with_stateful(mut self, stateful: bool) -> Self {
        self.stateful = stateful;
        self
    }

    pub fn is_stateful(&self) -> bool {
        self.stateful || self.cluster_type.is_content()
    }

    /// The id used to identify this cluster's load balancer.
    pub fn effective_id(&self) -> &ClusterId {
        self.combined_id.as_ref().unwrap_or(&self.id)
    }

    /// Whether a node allocated to `self` may serve a request for `other`.
    /// Content-like types are interchangeable with each other only.
    pub fn satisfies(&self, other: &ClusterSpec) -> bool {
        if self.id != other.id {
            return false;
        }
        if self.cluster_type.is_content() || other.cluster_type.is_content() {
            return self.cluster_type.is_content() == other.cluster_type.is_content();
        }
        self.cluster_type == other.cluster_type
    }
}

impl fmt::Display for ClusterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} cluster '{}'", self.cluster_type, self.id)?;
        if let Some(group) = self.group {
            write!(f, " group {group}")?;
        }
        Ok(())
    }
}

/// A node's membership in a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMembership {
    pub cluster: ClusterSpec,
    pub index: u32,
    pub retired: bool,
}

impl ClusterMembership {
    pub fn from(cluster: ClusterSpec, index: u32) -> Self {
        Self {
            cluster,
            index,
            retired: false,
        }
    }

    pub fn retire(&self) -> Self {
        Self {
            retired: true,
            ..self.clone()
        }
    }

    pub fn unretire(&self) -> Self {
        Self {
            retired: false,
            ..self.clone()
        }
    }

    /// Same index and retirement, but for `cluster` (keeping this membership's group).
    pub fn with_cluster(&self, cluster: &ClusterSpec) -> Self {
        Self {
            cluster: cluster.clone().with_group(self.cluster.group),
            ..self.clone()
        }
    }

    pub fn with_group(&self, group: Option<u32>) -> Self {
        Self {
            cluster: self.cluster.clone().with_group(group),
            ..self.clone()
        }
    }

    pub fn group(&self) -> Option<u32> {
        self.cluster.group
    }
}

impl fmt::Display for ClusterMembership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cluster.cluster_type, self.cluster.id)?;
        if let Some(group) = self.cluster.group {
            write!(f, "/{group}")?;
        }
        write!(f, "/{}", self.index)?;
        if self.retired {
            f.write_str("/retired")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(cluster_type: ClusterType, id: &str) -> ClusterSpec {
        ClusterSpec::request(cluster_type, ClusterId::new(id), Version::new(8, 0, 0))
    }

    #[test]
    fn content_and_combined_satisfy_each_other() {
        assert!(spec(ClusterType::Content, "a").satisfies(&spec(ClusterType::Combined, "a")));
        assert!(!spec(ClusterType::Content, "a").satisfies(&spec(ClusterType::Container, "a")));
        assert!(!spec(ClusterType::Container, "a").satisfies(&spec(ClusterType::Container, "b")));
    }

    #[test]
    fn effective_id_prefers_combined_id() {
        let combined = spec(ClusterType::Content, "c").with_combined_id(Some(ClusterId::new("web")));
        assert_eq!(combined.effective_id().as_str(), "web");
        assert_eq!(spec(ClusterType::Content, "c").effective_id().as_str(), "c");
    }

    #[test]
    fn membership_display() {
        let membership = ClusterMembership::from(spec(ClusterType::Content, "music").with_group(Some(1)), 3).retire();
        assert_eq!(membership.to_string(), "content/music/1/3/retired");
    }

    #[test]
    fn with_cluster_keeps_group() {
        let membership = ClusterMembership::from(spec(ClusterType::Container, "web").with_group(Some(2)), 0);
        let updated = membership.with_cluster(&spec(ClusterType::Container, "web").with_exclusivity(true));
        assert_eq!(updated.group(), Some(2));
        assert!(updated.cluster.exclusive);
    }
}
