//! Application identity.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies one instance of a tenant's application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ApplicationId {
    pub tenant: String,
    pub application: String,
    pub instance: String,
}

impl ApplicationId {
    pub fn new(
        tenant: impl Into<String>,
        application: impl Into<String>,
        instance: impl Into<String>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            application: application.into(),
            instance: instance.into(),
        }
    }

    /// Parse the `tenant:application:instance` form produced by [`Self::serialized_form`].
    pub fn from_serialized(value: &str) -> Option<Self> {
        let mut parts = value.splitn(3, ':');
        let tenant = parts.next().filter(|s| !s.is_empty())?;
        let application = parts.next().filter(|s| !s.is_empty())?;
        let instance = parts.next().filter(|s| !s.is_empty())?;
        Some(Self::new(tenant, application, instance))
    }

    pub fn serialized_form(&self) -> String {
        format!("{}:{}:{}", self.tenant, self.application, self.instance)
    }

    /// Tester instances run deployment tests and never get dedicated resources.
    pub fn is_tester(&self) -> bool {
        self.instance.ends_with("-t")
    }
}

impl fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.tenant, self.application, self.instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialized_form_round_trips() {
        let id = ApplicationId::new("acme", "shop", "default");
        assert_eq!(id.serialized_form(), "acme:shop:default");
        assert_eq!(ApplicationId::from_serialized("acme:shop:default"), Some(id));
        assert_eq!(ApplicationId::from_serialized("acme:shop"), None);
    }

    #[test]
    fn tester_instances() {
        assert!(ApplicationId::new("acme", "shop", "default-t").is_tester());
        assert!(!ApplicationId::new("acme", "shop", "default").is_tester());
    }
}
