//! Address routing: maps a recipient address to the tenant owning the mailbox.
//!
//! Recipients look like `<marker>-<tenant>@<any-domain>`. Anything that does
//! not fit that shape lands in the [`DEFAULT_TENANT`] mailbox.

use regex::Regex;

use crate::error::ConfigError;

/// Tenant used when the recipient does not embed one.
pub const DEFAULT_TENANT: &str = "default";

/// Local-part marker used unless configured otherwise.
pub const DEFAULT_MARKER: &str = "mail";

/// Outcome of matching a recipient against the tenant pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantRoute {
    /// The address embeds this tenant token.
    Matched(String),
    /// No tenant token could be extracted.
    Unmatched,
}

impl TenantRoute {
    /// Collapse to a tenant id, substituting [`DEFAULT_TENANT`] for `Unmatched`.
    pub fn into_tenant(self) -> String {
        match self {
            TenantRoute::Matched(tenant) => tenant,
            TenantRoute::Unmatched => DEFAULT_TENANT.to_string(),
        }
    }
}

/// Compiled recipient pattern.
#[derive(Debug, Clone)]
pub struct TenantRouter {
    pattern: Regex,
}

impl TenantRouter {
    /// Build a router for the given local-part marker (matched case-insensitively).
    pub fn new(marker: &str) -> Result<Self, ConfigError> {
        let pattern = Regex::new(&format!(
            r"^(?i:{})-([^@\s]+)@[^@\s]+$",
            regex::escape(marker)
        ))
        .map_err(|e| ConfigError::InvalidValue {
            key: "address_marker".into(),
            message: e.to_string(),
        })?;
        Ok(Self { pattern })
    }

    /// Match a recipient address against the tenant pattern.
    ///
    /// Accepts bare addresses, `<path>` envelope forms and
    /// `Display Name <addr>` header forms.
    pub fn route(&self, recipient: &str) -> TenantRoute {
        let addr = bare_address(recipient);
        match self.pattern.captures(addr).and_then(|caps| caps.get(1)) {
            Some(token) => TenantRoute::Matched(token.as_str().to_string()),
            None => TenantRoute::Unmatched,
        }
    }

    /// Resolve the tenant for a recipient. Never fails.
    pub fn resolve_tenant(&self, recipient: &str) -> String {
        self.route(recipient).into_tenant()
    }
}

impl Default for TenantRouter {
    fn default() -> Self {
        Self {
            pattern: Regex::new(r"^(?i:mail)-([^@\s]+)@[^@\s]+$")
                .expect("static tenant pattern compiles"),
        }
    }
}

/// Strip display names, angle brackets and surrounding whitespace.
fn bare_address(input: &str) -> &str {
    let trimmed = input.trim();
    if let Some(start) = trimmed.rfind('<') {
        let inner = &trimmed[start + 1..];
        let end = inner.find('>').unwrap_or(inner.len());
        return inner[..end].trim();
    }
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matched_address_returns_token() {
        let router = TenantRouter::default();
        assert_eq!(router.resolve_tenant("mail-abc123@anydomain.tld"), "abc123");
        assert_eq!(router.resolve_tenant("mail-acme@x.tld"), "acme");
    }

    #[test]
    fn token_may_contain_dashes_and_dots() {
        let router = TenantRouter::default();
        assert_eq!(
            router.route("mail-acme-corp.eu@x.tld"),
            TenantRoute::Matched("acme-corp.eu".into())
        );
    }

    #[test]
    fn marker_is_case_insensitive_token_is_verbatim() {
        let router = TenantRouter::default();
        assert_eq!(router.resolve_tenant("MAIL-AbC@x.tld"), "AbC");
    }

    #[test]
    fn angle_brackets_and_display_names_are_stripped() {
        let router = TenantRouter::default();
        assert_eq!(router.resolve_tenant("<mail-shop1@x.tld>"), "shop1");
        assert_eq!(
            router.resolve_tenant("\"Shop One\" <mail-shop1@x.tld>"),
            "shop1"
        );
        assert_eq!(router.resolve_tenant("  mail-shop1@x.tld  "), "shop1");
    }

    #[test]
    fn missing_marker_falls_back_to_default() {
        let router = TenantRouter::default();
        assert_eq!(router.resolve_tenant("bad-address-no-marker@x.tld"), DEFAULT_TENANT);
        assert_eq!(router.route("someone@x.tld"), TenantRoute::Unmatched);
    }

    #[test]
    fn marker_must_start_the_local_part() {
        let router = TenantRouter::default();
        assert_eq!(router.resolve_tenant("xmail-abc@x.tld"), DEFAULT_TENANT);
    }

    #[test]
    fn malformed_addresses_fall_back_to_default() {
        let router = TenantRouter::default();
        for addr in [
            "",
            "   ",
            "<>",
            "mail-",
            "mail-abc",
            "mail-abc@",
            "mail-@x.tld",
            "mail-a b@x.tld",
            "mail-abc@x@y",
            "@x.tld",
        ] {
            assert_eq!(router.resolve_tenant(addr), DEFAULT_TENANT, "address {addr:?}");
        }
    }

    #[test]
    fn custom_marker() {
        let router = TenantRouter::new("user").unwrap();
        assert_eq!(router.resolve_tenant("user-42@shop.ir"), "42");
        assert_eq!(router.resolve_tenant("mail-42@shop.ir"), DEFAULT_TENANT);
    }

    #[test]
    fn marker_with_regex_metacharacters_is_literal() {
        let router = TenantRouter::new("in.box").unwrap();
        assert_eq!(router.resolve_tenant("in.box-t1@x.tld"), "t1");
        assert_eq!(router.resolve_tenant("inXbox-t1@x.tld"), DEFAULT_TENANT);
    }

    #[test]
    fn into_tenant_maps_unmatched_to_default() {
        assert_eq!(TenantRoute::Unmatched.into_tenant(), "default");
        assert_eq!(TenantRoute::Matched("t".into()).into_tenant(), "t");
    }
}
