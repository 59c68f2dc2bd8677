//! Authentication verification chain.
//!
//! Each transport hands the dispatcher one opaque credential per inbound
//! call; an ordered chain of verifiers turns it into a principal, declines
//! it, or rejects it outright. The chain runs sequentially so that verifier
//! priority is preserved and no verification work is wasted, and it
//! short-circuits on the first resolution or the first hard failure.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Opaque bearer credential carried by a call, or nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credential(Option<String>);

impl Credential {
    pub fn bearer(token: impl Into<String>) -> Self {
        Credential(Some(token.into()))
    }

    pub fn none() -> Self {
        Credential(None)
    }

    pub fn is_present(&self) -> bool {
        self.0.is_some()
    }

    pub fn token(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

/// Application-level identity resolved from a credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
    pub attributes: HashMap<String, String>,
}

impl Principal {
    pub fn named(name: impl Into<String>) -> Self {
        Principal {
            name: name.into(),
            attributes: HashMap::new(),
        }
    }
}

/// One verifier's verdict on a credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// This verifier resolved the caller; the chain stops here.
    Granted(Principal),
    /// No opinion; the next verifier gets a look.
    Abstain,
    /// Hard failure; the chain aborts and the call is refused.
    Denied(String),
}

#[async_trait]
pub trait AuthVerifier: Send + Sync {
    async fn verify(&self, credential: &Credential) -> Verification;

    /// Challenge advertised to unauthenticated callers, e.g. in a
    /// `WWW-Authenticate` response header.
    fn challenge(&self) -> &str {
        "Bearer"
    }
}

/// Ordered verifier chain. An empty chain resolves nothing and never
/// denies, which leaves every call anonymous.
#[derive(Clone, Default)]
pub struct VerifierChain {
    verifiers: Vec<Arc<dyn AuthVerifier>>,
}

impl VerifierChain {
    pub fn new(verifiers: Vec<Arc<dyn AuthVerifier>>) -> Self {
        VerifierChain { verifiers }
    }

    pub fn is_empty(&self) -> bool {
        self.verifiers.is_empty()
    }

    pub fn challenge(&self) -> &str {
        self.verifiers
            .first()
            .map(|v| v.challenge())
            .unwrap_or("Bearer")
    }

    /// Run the chain. `Ok(Some)` on the first resolution, `Err(reason)` on
    /// the first hard failure, `Ok(None)` when every verifier abstained.
    pub async fn resolve(&self, credential: &Credential) -> Result<Option<Principal>, String> {
        for verifier in &self.verifiers {
            match verifier.verify(credential).await {
                Verification::Granted(principal) => return Ok(Some(principal)),
                Verification::Abstain => continue,
                Verification::Denied(reason) => return Err(reason),
            }
        }
        Ok(None)
    }
}

impl std::fmt::Debug for VerifierChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerifierChain")
            .field("len", &self.verifiers.len())
            .finish()
    }
}

/// Per-call context threaded explicitly into handlers. One per inbound
/// call, dropped when the call completes.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub principal: Option<Principal>,
}

impl CallContext {
    pub fn anonymous() -> Self {
        CallContext { principal: None }
    }

    pub fn authenticated(principal: Principal) -> Self {
        CallContext {
            principal: Some(principal),
        }
    }

    pub fn principal_name(&self) -> Option<&str> {
        self.principal.as_ref().map(|p| p.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Verification);

    #[async_trait]
    impl AuthVerifier for Fixed {
        async fn verify(&self, _credential: &Credential) -> Verification {
            self.0.clone()
        }
    }

    fn chain(verdicts: Vec<Verification>) -> VerifierChain {
        VerifierChain::new(
            verdicts
                .into_iter()
                .map(|v| Arc::new(Fixed(v)) as Arc<dyn AuthVerifier>)
                .collect(),
        )
    }

    #[tokio::test]
    async fn first_resolution_wins() {
        let c = chain(vec![
            Verification::Abstain,
            Verification::Granted(Principal::named("alice")),
            Verification::Granted(Principal::named("bob")),
        ]);
        let principal = c.resolve(&Credential::bearer("t")).await.unwrap().unwrap();
        assert_eq!(principal.name, "alice");
    }

    #[tokio::test]
    async fn denial_short_circuits() {
        let c = chain(vec![
            Verification::Denied("bad token".to_string()),
            Verification::Granted(Principal::named("late")),
        ]);
        assert_eq!(
            c.resolve(&Credential::bearer("t")).await,
            Err("bad token".to_string())
        );
    }

    #[tokio::test]
    async fn exhausted_chain_is_anonymous() {
        let c = chain(vec![Verification::Abstain, Verification::Abstain]);
        assert_eq!(c.resolve(&Credential::none()).await, Ok(None));
    }

    #[tokio::test]
    async fn empty_chain_is_anonymous() {
        let c = VerifierChain::default();
        assert_eq!(c.resolve(&Credential::none()).await, Ok(None));
    }
}
