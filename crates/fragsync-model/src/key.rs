//! External resource identity
//!
//! [`ExternalResourceKey`] names exactly one remote object. At most one
//! aggregation record exists per key.

use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

/// Kind of externally-managed resource
///
/// The merge schema is selected per type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceType {
    /// A tunnel's ingress/routing configuration
    TunnelConfig,
    /// The managed record set of a DNS zone
    DnsRecords,
    /// An access application policy
    AccessPolicy,
    /// A zone-level ruleset
    ZoneRuleset,
    /// Producer-declared kind without a built-in schema
    Other(String),
}

impl ResourceType {
    /// Stable lowercase name, used in storage keys and logs
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::TunnelConfig => "tunnel-config",
            Self::DnsRecords => "dns-records",
            Self::AccessPolicy => "access-policy",
            Self::ZoneRuleset => "zone-ruleset",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = Infallible;

    /// Built-in names map to their variant; anything else is [`ResourceType::Other`]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "tunnel-config" => Self::TunnelConfig,
            "dns-records" => Self::DnsRecords,
            "access-policy" => Self::AccessPolicy,
            "zone-ruleset" => Self::ZoneRuleset,
            other => Self::Other(other.to_string()),
        })
    }
}

/// Identity of one remote object
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExternalResourceKey {
    /// Resource kind
    pub resource_type: ResourceType,
    /// Remote-side identifier (tunnel id, zone name, ...)
    pub external_id: String,
    /// Remote account owning the object
    pub account_id: String,
    /// Zone scope, for zone-level resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone_id: Option<String>,
}

impl ExternalResourceKey {
    /// Create an account-scoped key
    #[inline]
    #[must_use]
    pub fn new(
        resource_type: ResourceType,
        account_id: impl Into<String>,
        external_id: impl Into<String>,
    ) -> Self {
        Self {
            resource_type,
            external_id: external_id.into(),
            account_id: account_id.into(),
            zone_id: None,
        }
    }

    /// Scope the key to a zone
    #[inline]
    #[must_use]
    pub fn with_zone(mut self, zone_id: impl Into<String>) -> Self {
        self.zone_id = Some(zone_id.into());
        self
    }

    /// Flat storage key: `type/account/zone-or-_/external_id`
    #[must_use]
    pub fn storage_key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.resource_type,
            self.account_id,
            self.zone_id.as_deref().unwrap_or("_"),
            self.external_id
        )
    }
}

impl fmt::Display for ExternalResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_key_without_zone() {
        let key = ExternalResourceKey::new(ResourceType::TunnelConfig, "acct", "tun-1");
        assert_eq!(key.storage_key(), "tunnel-config/acct/_/tun-1");
    }

    #[test]
    fn storage_key_with_zone() {
        let key = ExternalResourceKey::new(ResourceType::DnsRecords, "acct", "example.com")
            .with_zone("zone-9");
        assert_eq!(key.to_string(), "dns-records/acct/zone-9/example.com");
    }

    #[test]
    fn resource_type_serde_kebab_case() {
        let json = serde_json::to_string(&ResourceType::ZoneRuleset).unwrap();
        assert_eq!(json, "\"zone-ruleset\"");
        let other: ResourceType = serde_json::from_str(r#"{"other":"waf"}"#).unwrap();
        assert_eq!(other, ResourceType::Other("waf".to_string()));
        assert_eq!(other.as_str(), "waf");
    }

    #[test]
    fn resource_type_parses_display_form() {
        for ty in [
            ResourceType::TunnelConfig,
            ResourceType::DnsRecords,
            ResourceType::AccessPolicy,
            ResourceType::ZoneRuleset,
        ] {
            assert_eq!(ty.to_string().parse::<ResourceType>(), Ok(ty));
        }
        assert_eq!(
            "waf".parse::<ResourceType>(),
            Ok(ResourceType::Other("waf".to_string()))
        );
    }
}
