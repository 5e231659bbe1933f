//! Shared application state

use std::sync::Arc;

use retouch_billing::{
    referral_codes_available, BillingEmailService, BillingEventProcessor, CheckoutService, CreditLedger,
    CustomerService, IdentityProvider, PgReferralCodeStore, PgSubscriptionStore, PlanCatalog, PortalService,
    PriceIds, QuotaReconciler, ReferralCodeBackend, ReferralService, StripeClient, StripeConfig,
    StripeCustomerDirectory, SupabaseAdminClient, UpgradeService, WebhookHandler,
};
use sqlx::PgPool;

use crate::auth::{AuthState, SupabaseJwtVerifier};
use crate::config::Config;
use crate::generation::{ImageGenerator, PgProjectStore, ProjectStore, ReplicateClient};

/// Services that call the Stripe API
#[derive(Clone)]
pub struct BillingServices {
    pub checkout: CheckoutService,
    pub portal: PortalService,
    pub upgrades: UpgradeService,
}

/// Application state shared by all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// `None` when running against in-memory collaborators
    pub pool: Option<PgPool>,
    pub auth: AuthState,
    pub identity: Arc<dyn IdentityProvider>,
    pub reconciler: QuotaReconciler,
    pub ledger: CreditLedger,
    pub referrals: ReferralService,
    pub projects: Arc<dyn ProjectStore>,
    /// `None` when no generation backend is configured
    pub generator: Option<Arc<dyn ImageGenerator>>,
    /// `None` when billing is disabled or Stripe is not configured
    pub webhooks: Option<WebhookHandler>,
    pub billing: Option<BillingServices>,
}

impl AppState {
    pub fn auth_state(&self) -> AuthState {
        self.auth.clone()
    }

    /// Build the production state: Postgres, Supabase, Stripe, Resend, Replicate
    pub async fn connect(config: Config) -> anyhow::Result<Self> {
        let pool = retouch_shared::create_pool(&config.database_url, config.database_max_connections).await?;
        retouch_shared::run_migrations(&pool).await?;
        tracing::info!("Database migrations applied");

        let identity: Arc<dyn IdentityProvider> = Arc::new(SupabaseAdminClient::new(
            &config.supabase_url,
            &config.supabase_service_role_key,
        ));

        let stripe_config = if config.enable_billing {
            match StripeConfig::from_env() {
                Ok(stripe_config) => Some(stripe_config),
                Err(e) => {
                    tracing::warn!(error = %e, "Stripe is not configured, billing routes disabled");
                    None
                }
            }
        } else {
            tracing::info!("Billing disabled by configuration");
            None
        };

        let price_ids = stripe_config
            .as_ref()
            .map(|c| c.price_ids.clone())
            .unwrap_or_else(PriceIds::from_env);
        let reconciler = QuotaReconciler::new(
            Arc::new(PgSubscriptionStore::new(pool.clone())),
            PlanCatalog::from_price_ids(price_ids),
        );
        let ledger = CreditLedger::new(identity.clone());

        let backend = match referral_codes_available(&pool).await {
            Ok(true) => ReferralCodeBackend::Table(Arc::new(PgReferralCodeStore::new(pool.clone()))),
            Ok(false) => {
                tracing::warn!("referral_codes table missing, storing referral codes in user metadata");
                ReferralCodeBackend::MetadataOnly
            }
            Err(e) => {
                tracing::warn!(error = %e, "Referral code storage probe failed, using user metadata");
                ReferralCodeBackend::MetadataOnly
            }
        };
        let referrals = ReferralService::new(
            backend,
            identity.clone(),
            ledger.clone(),
            reconciler.clone(),
            stripe_config.as_ref().and_then(|c| c.referral_coupon_id.clone()),
        );

        let generator: Option<Arc<dyn ImageGenerator>> = match &config.replicate_api_token {
            Some(token) => Some(Arc::new(ReplicateClient::new(token.clone(), config.replicate_model.clone()))),
            None => {
                tracing::warn!("REPLICATE_API_TOKEN not set, generation disabled");
                None
            }
        };

        let (webhooks, billing) = match stripe_config {
            Some(stripe_config) => {
                let webhook_secret = stripe_config.webhook_secret.clone();
                let stripe = StripeClient::new(stripe_config);
                let processor = BillingEventProcessor::new(
                    reconciler.clone(),
                    Arc::new(StripeCustomerDirectory::new(stripe.clone())),
                    identity.clone(),
                    Arc::new(BillingEmailService::from_env()),
                );
                let customers = CustomerService::new(stripe.clone(), reconciler.clone());
                let billing = BillingServices {
                    checkout: CheckoutService::new(stripe.clone(), customers, identity.clone(), processor.clone()),
                    portal: PortalService::new(stripe.clone(), reconciler.clone()),
                    upgrades: UpgradeService::new(stripe, reconciler.clone()),
                };
                (Some(WebhookHandler::new(webhook_secret, processor)), Some(billing))
            }
            None => (None, None),
        };

        Ok(Self {
            auth: AuthState {
                verifier: Arc::new(SupabaseJwtVerifier::new(&config.supabase_jwt_secret)),
            },
            config: Arc::new(config),
            projects: Arc::new(PgProjectStore::new(pool.clone())),
            pool: Some(pool),
            identity,
            reconciler,
            ledger,
            referrals,
            generator,
            webhooks,
            billing,
        })
    }
}
