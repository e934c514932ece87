//! Zones: the environment, system and cloud a node repository serves.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Dev,
    Test,
    Perf,
    Staging,
    #[default]
    Prod,
}

impl Environment {
    pub fn is_production(self) -> bool {
        self == Environment::Prod
    }

    /// Environments used for automated testing of deployments.
    pub fn is_test(self) -> bool {
        matches!(self, Environment::Test | Environment::Staging)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Environment::Dev => "dev",
            Environment::Test => "test",
            Environment::Perf => "perf",
            Environment::Staging => "staging",
            Environment::Prod => "prod",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SystemName {
    #[default]
    Main,
    Cd,
    Public,
}

impl SystemName {
    pub fn is_cd(self) -> bool {
        self == SystemName::Cd
    }
}

/// A cloud account. The empty account means "the zone's default account".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct CloudAccount(pub String);

impl CloudAccount {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn unspecified() -> Self {
        Self(String::new())
    }

    pub fn is_unspecified(&self) -> bool {
        self.0.is_empty()
    }

    /// This account, or `fallback` when unspecified.
    pub fn or(&self, fallback: &CloudAccount) -> CloudAccount {
        if self.is_unspecified() {
            fallback.clone()
        } else {
            self.clone()
        }
    }
}

impl fmt::Display for CloudAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unspecified() {
            f.write_str("unspecified")
        } else {
            f.write_str(&self.0)
        }
    }
}

/// Capabilities of the cloud backing a zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Cloud {
    /// Hosts are created on demand through the host provisioner.
    pub dynamic_provisioning: bool,
    /// Tenant nodes of different applications may share a host.
    pub allow_host_sharing: bool,
    /// Nodes may be placed in tenant-owned cloud accounts.
    pub allow_enclave: bool,
    /// The zone's own cloud account.
    pub account: CloudAccount,
}

impl Default for Cloud {
    fn default() -> Self {
        Self {
            dynamic_provisioning: false,
            allow_host_sharing: true,
            allow_enclave: false,
            account: CloudAccount::unspecified(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Zone {
    pub environment: Environment,
    pub system: SystemName,
    pub region: String,
    pub cloud: Cloud,
}

impl Zone {
    pub fn new(environment: Environment, region: impl Into<String>) -> Self {
        Self {
            environment,
            region: region.into(),
            ..Self::default()
        }
    }

    pub fn with_cloud(mut self, cloud: Cloud) -> Self {
        self.cloud = cloud;
        self
    }

    pub fn with_system(mut self, system: SystemName) -> Self {
        self.system = system;
        self
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.environment, self.region)
    }
}
