//! Chat gateway — credential resolution and normalized dispatch.
//!
//! The boundary between callers and the adapter layer. The gateway is the
//! only component permitted to read long-lived credentials: it resolves
//! the caller's credential (guest credential first, then the stored one),
//! fills in the provider's default model, and dispatches through the
//! [`AdapterRegistry`].
//!
//! Failure split: credential and unknown-provider errors are terminal and
//! returned synchronously; upstream failures after a stream has started
//! arrive as error events on the delta channel, never thrown mid-stream.

use std::fmt;
use std::sync::Arc;

use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use parley_config::ProviderKind;

use crate::message::{NormalizedRequest, NormalizedResponse};
use crate::provider::{AdapterRegistry, DeltaReceiver, ProviderAdapter, ProviderError};

/// An API credential for one upstream provider.
///
/// Zeroed on drop; `Debug` never prints the secret. Ephemeral guest
/// credentials use the same type and are never written anywhere.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// The raw secret, for building authentication headers.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// External credential-store collaborator.
///
/// Resolves the stored credential for an (identity, provider) pair. Guest
/// credentials bypass this entirely.
pub trait CredentialStore: Send + Sync {
    fn resolve(&self, identity: &str, provider: ProviderKind) -> Option<Credential>;
}

/// Who is calling, and with what (if any) directly-supplied credential.
#[derive(Debug, Clone, Default)]
pub struct CallerContext {
    /// Authenticated identity whose stored credentials may be used.
    pub identity: Option<String>,
    /// Explicit ephemeral credential; takes precedence over storage.
    pub guest_credential: Option<Credential>,
}

impl CallerContext {
    pub fn authenticated(identity: impl Into<String>) -> Self {
        Self {
            identity: Some(identity.into()),
            guest_credential: None,
        }
    }

    pub fn guest(credential: Credential) -> Self {
        Self {
            identity: None,
            guest_credential: Some(credential),
        }
    }
}

/// Errors surfaced synchronously by the gateway.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// No guest credential supplied and no stored credential found.
    #[error("authentication required for provider {0}")]
    AuthenticationRequired(ProviderKind),

    /// The requested provider has no registered adapter.
    #[error("unsupported provider: {0}")]
    UnsupportedProvider(ProviderKind),

    /// Pre-stream or non-streaming upstream failure.
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Either outcome of a gateway dispatch, per the request's stream flag.
pub enum GatewayReply {
    Complete(NormalizedResponse),
    Stream(DeltaReceiver),
}

/// The boundary service dispatching normalized requests to adapters.
pub struct ChatGateway {
    registry: AdapterRegistry,
    credentials: Arc<dyn CredentialStore>,
}

impl ChatGateway {
    pub fn new(registry: AdapterRegistry, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            registry,
            credentials,
        }
    }

    /// Dispatch per the request's stream flag.
    pub async fn dispatch(
        &self,
        ctx: &CallerContext,
        request: NormalizedRequest,
    ) -> Result<GatewayReply, GatewayError> {
        if request.stream {
            self.send_streaming(ctx, request).await.map(GatewayReply::Stream)
        } else {
            self.send(ctx, request).await.map(GatewayReply::Complete)
        }
    }

    /// Complete (non-streaming) chat completion.
    pub async fn send(
        &self,
        ctx: &CallerContext,
        request: NormalizedRequest,
    ) -> Result<NormalizedResponse, GatewayError> {
        let (adapter, request) = self.prepare(ctx, request)?;
        Ok(adapter.send(&request).await?)
    }

    /// Streaming chat completion. Sync errors are returned here; failures
    /// after streaming begins arrive on the receiver.
    pub async fn send_streaming(
        &self,
        ctx: &CallerContext,
        request: NormalizedRequest,
    ) -> Result<DeltaReceiver, GatewayError> {
        let (adapter, request) = self.prepare(ctx, request)?;
        Ok(adapter.send_streaming(&request).await?)
    }

    /// Default model for a provider, as the registry knows it.
    pub fn default_model(&self, provider: ProviderKind) -> Option<&str> {
        self.registry.default_model(provider)
    }

    fn prepare(
        &self,
        ctx: &CallerContext,
        mut request: NormalizedRequest,
    ) -> Result<(Arc<dyn ProviderAdapter>, NormalizedRequest), GatewayError> {
        let adapter = self
            .registry
            .adapter(request.provider)
            .ok_or(GatewayError::UnsupportedProvider(request.provider))?;

        if request.model.is_none() {
            request.model = self
                .registry
                .default_model(request.provider)
                .map(str::to_string);
        }
        if request.credential.is_none() {
            request.credential = Some(self.resolve_credential(ctx, request.provider)?);
        }
        debug!(
            provider = %request.provider,
            model = request.model.as_deref().unwrap_or("<default>"),
            stream = request.stream,
            "dispatching chat request"
        );
        Ok((adapter, request))
    }

    /// Resolution order: guest credential, then stored credential, then
    /// authentication-required.
    fn resolve_credential(
        &self,
        ctx: &CallerContext,
        provider: ProviderKind,
    ) -> Result<Credential, GatewayError> {
        if let Some(ref guest) = ctx.guest_credential {
            return Ok(guest.clone());
        }
        if let Some(ref identity) = ctx.identity
            && let Some(stored) = self.credentials.resolve(identity, provider)
        {
            return Ok(stored);
        }
        Err(GatewayError::AuthenticationRequired(provider))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::BoxFuture;
    use crate::message::{ChatMessage, DeltaEvent, TokenUsage};

    /// Store with a fixed credential table.
    struct TableStore(HashMap<(String, ProviderKind), Credential>);

    impl CredentialStore for TableStore {
        fn resolve(&self, identity: &str, provider: ProviderKind) -> Option<Credential> {
            self.0.get(&(identity.to_string(), provider)).cloned()
        }
    }

    /// Adapter that echoes the credential it was handed.
    struct EchoAdapter;

    impl ProviderAdapter for EchoAdapter {
        fn kind(&self) -> ProviderKind {
            ProviderKind::OpenAi
        }

        fn name(&self) -> &str {
            "Echo"
        }

        fn send(
            &self,
            request: &NormalizedRequest,
        ) -> BoxFuture<'_, Result<NormalizedResponse, ProviderError>> {
            let credential = request
                .credential
                .as_ref()
                .map(|c| c.expose().to_string())
                .unwrap_or_default();
            let model = request.model.clone().unwrap_or_default();
            Box::pin(async move {
                Ok(NormalizedResponse {
                    content: credential,
                    usage: TokenUsage::default(),
                    model,
                    provider: ProviderKind::OpenAi,
                })
            })
        }

        fn send_streaming(
            &self,
            _request: &NormalizedRequest,
        ) -> BoxFuture<'_, Result<DeltaReceiver, ProviderError>> {
            Box::pin(async move {
                let (tx, rx) = tokio::sync::mpsc::channel(4);
                tx.send(Ok(DeltaEvent::Done { usage: None })).await.ok();
                Ok(rx)
            })
        }
    }

    fn gateway_with_echo(store: TableStore) -> ChatGateway {
        let mut registry = AdapterRegistry::new();
        registry.register(ProviderKind::OpenAi, Arc::new(EchoAdapter), "echo-1");
        ChatGateway::new(registry, Arc::new(store))
    }

    fn request() -> NormalizedRequest {
        NormalizedRequest::new(ProviderKind::OpenAi, vec![ChatMessage::user("hi")])
    }

    #[tokio::test]
    async fn test_guest_credential_takes_precedence() {
        let mut table = HashMap::new();
        table.insert(
            ("alice".to_string(), ProviderKind::OpenAi),
            Credential::new("stored-key"),
        );
        let gateway = gateway_with_echo(TableStore(table));

        let ctx = CallerContext {
            identity: Some("alice".to_string()),
            guest_credential: Some(Credential::new("guest-key")),
        };
        let resp = gateway.send(&ctx, request()).await.unwrap();
        assert_eq!(resp.content, "guest-key");
    }

    #[tokio::test]
    async fn test_stored_credential_resolved_by_identity() {
        let mut table = HashMap::new();
        table.insert(
            ("alice".to_string(), ProviderKind::OpenAi),
            Credential::new("stored-key"),
        );
        let gateway = gateway_with_echo(TableStore(table));

        let ctx = CallerContext::authenticated("alice");
        let resp = gateway.send(&ctx, request()).await.unwrap();
        assert_eq!(resp.content, "stored-key");
    }

    #[tokio::test]
    async fn test_no_credential_is_authentication_required() {
        let gateway = gateway_with_echo(TableStore(HashMap::new()));

        let ctx = CallerContext::authenticated("bob");
        let err = gateway.send(&ctx, request()).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::AuthenticationRequired(ProviderKind::OpenAi)
        ));

        let err = gateway.send(&CallerContext::default(), request()).await.unwrap_err();
        assert!(matches!(err, GatewayError::AuthenticationRequired(_)));
    }

    #[tokio::test]
    async fn test_unregistered_provider_rejected() {
        let gateway = gateway_with_echo(TableStore(HashMap::new()));
        let ctx = CallerContext::guest(Credential::new("k"));
        let req = NormalizedRequest::new(ProviderKind::Anthropic, vec![ChatMessage::user("hi")]);
        let err = gateway.send(&ctx, req).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::UnsupportedProvider(ProviderKind::Anthropic)
        ));
    }

    #[tokio::test]
    async fn test_default_model_filled_in() {
        let gateway = gateway_with_echo(TableStore(HashMap::new()));
        let ctx = CallerContext::guest(Credential::new("k"));
        let resp = gateway.send(&ctx, request()).await.unwrap();
        assert_eq!(resp.model, "echo-1");
    }

    #[tokio::test]
    async fn test_dispatch_honors_stream_flag() {
        let gateway = gateway_with_echo(TableStore(HashMap::new()));
        let ctx = CallerContext::guest(Credential::new("k"));

        match gateway.dispatch(&ctx, request()).await.unwrap() {
            GatewayReply::Complete(_) => {}
            GatewayReply::Stream(_) => panic!("expected complete reply"),
        }
        match gateway.dispatch(&ctx, request().streaming()).await.unwrap() {
            GatewayReply::Stream(_) => {}
            GatewayReply::Complete(_) => panic!("expected stream reply"),
        }
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let credential = Credential::new("sk-very-secret");
        let debug = format!("{credential:?}");
        assert!(!debug.contains("sk-very-secret"));
        assert!(debug.contains("redacted"));
    }
}
