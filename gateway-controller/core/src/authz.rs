//! Path-based authentication gating.
//!
//! Public rules are checked first and short-circuit. Any other path under `/api/` requires
//! authentication; paths outside `/api/` that are not listed (static assets, docs) do not.
//! Admin rules are evaluated independently of the public rules.

/// The API prefix under which unlisted paths require authentication.
const API_PREFIX: &str = "/api/";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthorizationRule {
    pub pattern: String,
    pub kind: RuleMatch,
    pub class: AccessClass,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RuleMatch {
    /// Matches the pattern exactly.
    Exact,

    /// Matches the pattern or any path that starts with it.
    Prefix,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AccessClass {
    Public,
    Protected,
    AdminOnly,
}

#[derive(Clone, Debug)]
pub struct AuthorizationGate {
    public: Vec<AuthorizationRule>,
    admin: Vec<AuthorizationRule>,
}

// === impl AuthorizationRule ===

impl AuthorizationRule {
    pub fn prefix(pattern: impl Into<String>, class: AccessClass) -> Self {
        Self {
            pattern: pattern.into(),
            kind: RuleMatch::Prefix,
            class,
        }
    }

    pub fn exact(pattern: impl Into<String>, class: AccessClass) -> Self {
        Self {
            pattern: pattern.into(),
            kind: RuleMatch::Exact,
            class,
        }
    }

    /// Matches `path` case-insensitively.
    pub fn matches(&self, path: &str) -> bool {
        match self.kind {
            RuleMatch::Exact => path.eq_ignore_ascii_case(&self.pattern),
            RuleMatch::Prefix => starts_with_ignore_case(path, &self.pattern),
        }
    }
}

// === impl AuthorizationGate ===

impl Default for AuthorizationGate {
    fn default() -> Self {
        let public = [
            "/api/v1/auth/login",
            "/api/v1/auth/register",
            "/api/v1/auth/refresh",
            "/api/v1/auth/logout",
            "/api/v1/auth/social-login",
            "/api/v1/auth/alipay/auth-info",
            "/api/v1/auth/sms/send",
            "/api/v1/auth/sms/login",
            "/api/users/login",
            "/api/users/register",
            "/api/users/refresh",
            "/api/test",
            crate::HEALTH_PATH,
            crate::METRICS_PATH,
            "/scalar/v1",
        ];
        let admin = ["/api/users/admin"];

        Self::new(
            public
                .into_iter()
                .map(|p| AuthorizationRule::prefix(p, AccessClass::Public)),
            admin
                .into_iter()
                .map(|p| AuthorizationRule::prefix(p, AccessClass::AdminOnly)),
        )
    }
}

impl AuthorizationGate {
    pub fn new(
        public: impl IntoIterator<Item = AuthorizationRule>,
        admin: impl IntoIterator<Item = AuthorizationRule>,
    ) -> Self {
        Self {
            public: public.into_iter().collect(),
            admin: admin.into_iter().collect(),
        }
    }

    pub fn requires_authentication(&self, path: &str) -> bool {
        if self.public.iter().any(|rule| rule.matches(path)) {
            return false;
        }
        starts_with_ignore_case(path, API_PREFIX)
    }

    pub fn requires_admin(&self, path: &str) -> bool {
        self.admin.iter().any(|rule| rule.matches(path))
    }

    /// Combines both checks into a single classification.
    ///
    /// An admin rule only elevates a path that already requires authentication; a public rule
    /// always wins.
    pub fn classify(&self, path: &str) -> AccessClass {
        if !self.requires_authentication(path) {
            return AccessClass::Public;
        }
        if self.requires_admin(path) {
            return AccessClass::AdminOnly;
        }
        AccessClass::Protected
    }
}

fn starts_with_ignore_case(path: &str, prefix: &str) -> bool {
    path.get(..prefix.len())
        .map(|head| head.eq_ignore_ascii_case(prefix))
        .unwrap_or(false)
}
