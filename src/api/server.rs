//! Application state and server assembly.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::http::{HeaderName, HeaderValue, Method};
use axum::middleware::from_fn_with_state;
use axum::routing::{delete, get, patch, post};
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::info;

use crate::api::auth::access_policy_middleware;
use crate::api::idempotency::idempotency_middleware;
use crate::api::middleware::{request_logging_middleware, timeout_middleware};
use crate::api::rate_limit::{build_rate_limiter, rate_limit_middleware};
use crate::api::routes;
use crate::config::Config;
use crate::delegation::service::DelegationOrchestrator;
use crate::delegation::storage::DelegationStore;
use crate::idempotency::IdempotencyStore;
use crate::identity::credentials::CredentialService;
use crate::identity::federation::FederationService;
use crate::identity::jit::JitCredentialService;
use crate::identity::revocation::RevocationOrchestrator;
use crate::identity::store::IdentityStore;
use crate::identity::tokens::DelegationTokenService;
use crate::lease::LeaseService;
use crate::runtime::ip_rules::IpRuleRegistry;
use crate::runtime::narrowing::ScopeNarrowingRegistry;
use crate::runtime::quotas::QuotaRegistry;
use crate::secrets::SigningSecrets;
use crate::{Error, Result};

/// Shared application state threaded through every handler and middleware.
#[derive(Clone)]
pub struct AppState {
    /// Resolved configuration.
    pub config: Arc<Config>,
    /// Process signing secrets.
    pub secrets: Arc<SigningSecrets>,
    /// Identity-scope store.
    pub identity_store: Arc<IdentityStore>,
    /// Credential service.
    pub credentials: Arc<CredentialService>,
    /// Delegation token service.
    pub tokens: Arc<DelegationTokenService>,
    /// Federation trust service.
    pub federation: Arc<FederationService>,
    /// Revocation orchestrator (kill switch).
    pub revocation: Arc<RevocationOrchestrator>,
    /// JIT credential service.
    pub jit: Arc<JitCredentialService>,
    /// Delegation-scope store.
    pub delegation_store: Arc<DelegationStore>,
    /// Delegation orchestrator.
    pub delegation: Arc<DelegationOrchestrator>,
    /// Durable API idempotency store.
    pub idempotency: Arc<IdempotencyStore>,
    /// Lease and install registry.
    pub leases: Arc<LeaseService>,
    /// Capability quota registry.
    pub quotas: Arc<QuotaRegistry>,
    /// IP rule registry.
    pub ip_rules: Arc<IpRuleRegistry>,
    /// Scope narrowing registry.
    pub narrowing: Arc<ScopeNarrowingRegistry>,
}

impl AppState {
    /// Wire the full state from opened stores.
    fn assemble(
        config: Config,
        secrets: SigningSecrets,
        identity_store: IdentityStore,
        delegation_store: DelegationStore,
        idempotency: IdempotencyStore,
    ) -> Self {
        let config = Arc::new(config);
        let secrets = Arc::new(secrets);
        let identity_store = Arc::new(identity_store);
        let delegation_store = Arc::new(delegation_store);
        let leases = Arc::new(LeaseService::new());

        let credentials = Arc::new(CredentialService::new(
            Arc::clone(&identity_store),
            Arc::clone(&secrets),
        ));
        let tokens = Arc::new(DelegationTokenService::new(
            Arc::clone(&identity_store),
            Arc::clone(&secrets),
        ));
        let federation = Arc::new(FederationService::new(
            Arc::clone(&identity_store),
            Arc::clone(&secrets),
        ));
        let jit = Arc::new(JitCredentialService::new(Arc::clone(&identity_store)));
        let lease_revoker: Arc<dyn crate::identity::revocation::LeaseRevoker> =
            Arc::clone(&leases) as Arc<dyn crate::identity::revocation::LeaseRevoker>;
        let revocation = Arc::new(
            RevocationOrchestrator::new(Arc::clone(&identity_store))
                .with_lease_revoker(lease_revoker),
        );
        let delegation = Arc::new(DelegationOrchestrator::new(
            Arc::clone(&delegation_store),
            Arc::clone(&identity_store),
            Arc::clone(&tokens),
            Arc::clone(&jit),
        ));

        Self {
            config,
            secrets,
            identity_store,
            credentials,
            tokens,
            federation,
            revocation,
            jit,
            delegation_store,
            delegation,
            idempotency: Arc::new(idempotency),
            leases,
            quotas: Arc::new(QuotaRegistry::new()),
            ip_rules: Arc::new(IpRuleRegistry::new()),
            narrowing: Arc::new(ScopeNarrowingRegistry::new()),
        }
    }

    /// Open all stores at their configured paths.
    pub fn from_config(config: Config, secrets: SigningSecrets) -> Result<Self> {
        let identity_store = IdentityStore::open(&config.identity_db_path)?;
        let delegation_store = DelegationStore::open(&config.delegation_db_path)?;
        let idempotency = IdempotencyStore::open(&config.idempotency_db_path)?;
        Ok(Self::assemble(
            config,
            secrets,
            identity_store,
            delegation_store,
            idempotency,
        ))
    }

    /// Fully in-memory state for tests.
    pub fn in_memory(config: Config, secrets: SigningSecrets) -> Result<Self> {
        Ok(Self::assemble(
            config,
            secrets,
            IdentityStore::open_in_memory()?,
            DelegationStore::open_in_memory()?,
            IdempotencyStore::open_in_memory()?,
        ))
    }
}

fn cors_layer(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            HeaderName::from_static("x-api-key"),
            HeaderName::from_static("authorization"),
            HeaderName::from_static("content-type"),
            HeaderName::from_static("idempotency-key"),
            HeaderName::from_static("x-delegation-token"),
            HeaderName::from_static("x-tenant-id"),
        ])
        .expose_headers([
            HeaderName::from_static("x-request-id"),
            HeaderName::from_static("x-agenthub-idempotent-replay"),
        ])
}

/// Assemble the full router with the fixed middleware chain.
///
/// Layer ordering (outermost first): CORS → rate limiter → request-id →
/// timeout → access policy → idempotency → handler.
#[must_use]
pub fn build_router(state: AppState) -> Router {
    let limiter = build_rate_limiter(state.config.rate_limit_per_minute);

    Router::new()
        .route("/healthz", get(routes::system::healthz))
        .route("/v1/system/startup-diagnostics", get(routes::system::startup_diagnostics))
        .route("/v1/system/route-policy", get(routes::system::route_policy))
        .route("/v1/auth/tokens", post(routes::auth::mint_token))
        .route(
            "/v1/identity/agents",
            post(routes::identity::register_agent).get(routes::identity::list_agents),
        )
        .route(
            "/v1/identity/agents/{agent_id}",
            get(routes::identity::get_agent).patch(routes::identity::update_agent_status),
        )
        .route(
            "/v1/identity/agents/{agent_id}/credentials",
            post(routes::identity::issue_credential),
        )
        .route(
            "/v1/identity/agents/{agent_id}/revoke",
            post(routes::identity::revoke_agent),
        )
        .route(
            "/v1/identity/credentials/verify",
            post(routes::identity::verify_credential),
        )
        .route(
            "/v1/identity/credentials/{credential_id}/rotate",
            post(routes::identity::rotate_credential),
        )
        .route(
            "/v1/identity/credentials/{credential_id}",
            delete(routes::identity::revoke_credential),
        )
        .route(
            "/v1/identity/delegation-tokens",
            post(routes::identity::issue_delegation_token),
        )
        .route(
            "/v1/identity/delegation-tokens/verify",
            post(routes::identity::verify_delegation_token),
        )
        .route(
            "/v1/identity/delegation-tokens/{token_id}/chain",
            get(routes::identity::delegation_token_chain),
        )
        .route(
            "/v1/identity/delegation-tokens/{token_id}",
            delete(routes::identity::revoke_delegation_token),
        )
        .route(
            "/v1/identity/revocations/bulk",
            post(routes::identity::bulk_revoke),
        )
        .route(
            "/v1/identity/revocations",
            get(routes::identity::list_revocation_events),
        )
        .route(
            "/v1/identity/domains",
            post(routes::identity::register_domain).get(routes::identity::list_domains),
        )
        .route(
            "/v1/identity/domains/{domain_id}",
            patch(routes::identity::update_domain),
        )
        .route(
            "/v1/identity/attestations",
            post(routes::identity::create_attestation),
        )
        .route(
            "/v1/identity/attestations/{attestation_id}/verify",
            post(routes::identity::verify_attestation),
        )
        .route("/v1/delegations", post(routes::delegation::create_delegation))
        .route(
            "/v1/delegations/contract",
            get(routes::delegation::delegation_contract),
        )
        .route(
            "/v1/delegations/metering",
            get(routes::delegation::metering_events),
        )
        .route(
            "/v1/delegations/{delegation_id}/status",
            get(routes::delegation::delegation_status),
        )
        .route("/v1/reliability/slo", get(routes::reliability::slo_dashboard))
        .route("/v1/leases", post(routes::lease::create_lease))
        .route("/v1/leases/{lease_id}", get(routes::lease::get_lease))
        .route(
            "/v1/leases/{lease_id}/promote",
            post(routes::lease::promote_lease),
        )
        .route("/v1/installs/{install_id}", get(routes::lease::get_install))
        .route(
            "/v1/installs/{install_id}/rollback",
            post(routes::lease::rollback_install),
        )
        .route(
            "/v1/runtime/quotas",
            post(routes::runtime::create_quota).get(routes::runtime::list_quotas),
        )
        .route("/v1/runtime/quotas/check", post(routes::runtime::check_quota))
        .route("/v1/runtime/quotas/usage", get(routes::runtime::quota_usage))
        .route(
            "/v1/runtime/quotas/violations",
            get(routes::runtime::quota_violations),
        )
        .route("/v1/runtime/quotas/stats", get(routes::runtime::quota_stats))
        .route(
            "/v1/runtime/quotas/{quota_id}",
            patch(routes::runtime::update_quota),
        )
        .route(
            "/v1/runtime/ip-rules",
            post(routes::runtime::create_ip_rule).get(routes::runtime::list_ip_rules),
        )
        .route("/v1/runtime/ip-rules/check", post(routes::runtime::check_ip))
        .route("/v1/runtime/ip-rules/log", get(routes::runtime::ip_access_log))
        .route("/v1/runtime/ip-rules/stats", get(routes::runtime::ip_stats))
        .route(
            "/v1/runtime/ip-rules/{rule_id}/disable",
            post(routes::runtime::disable_ip_rule),
        )
        .route(
            "/v1/runtime/scope-narrowing",
            post(routes::runtime::narrow_scope).get(routes::runtime::list_narrowed_tokens),
        )
        .route(
            "/v1/runtime/scope-narrowing/validate",
            post(routes::runtime::validate_narrowed_token),
        )
        .route(
            "/v1/runtime/scope-narrowing/log",
            get(routes::runtime::narrowing_log),
        )
        .route(
            "/v1/runtime/scope-narrowing/stats",
            get(routes::runtime::narrowing_stats),
        )
        .route(
            "/v1/runtime/scope-narrowing/{token_id}",
            delete(routes::runtime::revoke_narrowed_token),
        )
        .route(
            "/v1/runtime/jit-credentials",
            post(routes::runtime::issue_jit_credential),
        )
        .route(
            "/v1/runtime/jit-credentials/{credential_id}/revoke",
            post(routes::runtime::revoke_jit_credential),
        )
        .route(
            "/v1/runtime/sandboxes/{sandbox_id}/sweep",
            post(routes::runtime::sweep_sandbox),
        )
        .layer(from_fn_with_state(state.clone(), idempotency_middleware))
        .layer(from_fn_with_state(state.clone(), access_policy_middleware))
        .layer(from_fn_with_state(state.clone(), timeout_middleware))
        .layer(axum::middleware::from_fn(request_logging_middleware))
        .layer(from_fn_with_state(limiter, rate_limit_middleware))
        .layer(cors_layer(&state.config))
        .with_state(state)
}

/// Bind and serve until interrupted.
pub async fn serve(state: AppState, host: &str, port: u16) -> Result<()> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .map_err(|e| Error::Config(format!("invalid bind address: {e}")))?;
    let router = build_router(state);
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Control plane listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received");
    })
    .await?;
    Ok(())
}
