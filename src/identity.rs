use std::collections::HashMap;

/// Resolves a connection credential to an owner id.
///
/// Identity is derived once per connection from the handshake and threaded
/// explicitly into every coordinator call. A missing or invalid credential
/// means the caller is anonymous — never an error.
pub trait IdentityProvider: Send + Sync {
    fn verify(&self, credential: Option<&str>) -> Option<String>;
}

/// Token-table identity provider backed by configuration.
pub struct StaticTokenIdentity {
    tokens: HashMap<String, String>,
}

impl StaticTokenIdentity {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }

    /// Provider that treats every caller as anonymous.
    pub fn empty() -> Self {
        Self::new(HashMap::new())
    }
}

impl IdentityProvider for StaticTokenIdentity {
    fn verify(&self, credential: Option<&str>) -> Option<String> {
        credential.and_then(|token| self.tokens.get(token).cloned())
    }
}
