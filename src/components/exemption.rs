use crate::config::PolicyConfig;
use crate::model::{Identity, Membership};

/// Which whitelist entry let an identity through
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exemption {
    Identity,
    Role(String),
}

impl Exemption {
    pub fn describe(&self) -> String {
        match self {
            Exemption::Identity => "identity is whitelisted".to_string(),
            Exemption::Role(role) => format!("holds whitelisted role {role}"),
        }
    }
}

/// Whitelist bypass, consulted before any scoring happens.
pub struct ExemptionRegistry;

impl ExemptionRegistry {
    pub fn is_exempt(identity: &Identity, membership: &Membership, config: &PolicyConfig) -> bool {
        Self::exemption(identity, membership, config).is_some()
    }

    pub fn exemption(
        identity: &Identity,
        membership: &Membership,
        config: &PolicyConfig,
    ) -> Option<Exemption> {
        if config.whitelist.identity_ids.contains(&identity.id) {
            return Some(Exemption::Identity);
        }
        membership
            .roles
            .iter()
            .find(|role| config.whitelist.role_ids.contains(*role))
            .map(|role| Exemption::Role(role.clone()))
    }
}
