#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Retouch background worker
//!
//! Runs the reconciliation sweep on a cron schedule so subscription rows
//! converge with Stripe even when webhooks are lost.

mod config;
mod retry;

use std::sync::Arc;

use retouch_billing::{
    BillingEmailService, BillingEventProcessor, PlanCatalog, PgSubscriptionStore, QuotaReconciler,
    ReconciliationSweep, StripeClient, StripeCustomerDirectory, StripeSubscriptionSource, SupabaseAdminClient,
};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::WorkerConfig;
use crate::retry::RetryingSubscriptionSource;

async fn run_sweep(sweep: &ReconciliationSweep) {
    match sweep.run().await {
        Ok(report) => info!(
            checked = report.checked,
            applied = report.applied,
            skipped = report.skipped,
            missing = report.missing,
            failed = report.failed,
            "Reconciliation sweep finished"
        ),
        Err(e) => error!(error = %e, "Reconciliation sweep aborted"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("retouch_worker=info,retouch_billing=info"))?)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = WorkerConfig::from_env()?;
    info!(schedule = %config.reconcile_cron, "Starting Retouch worker");

    let pool = retouch_shared::create_pool(&config.database_url, config.database_max_connections).await?;
    let stripe = StripeClient::from_env()?;

    let reconciler = QuotaReconciler::new(
        Arc::new(PgSubscriptionStore::new(pool)),
        PlanCatalog::from_price_ids(stripe.config().price_ids.clone()),
    );
    let processor = BillingEventProcessor::new(
        reconciler,
        Arc::new(StripeCustomerDirectory::new(stripe.clone())),
        Arc::new(SupabaseAdminClient::new(
            &config.supabase_url,
            &config.supabase_service_role_key,
        )),
        Arc::new(BillingEmailService::from_env()),
    );
    let source = RetryingSubscriptionSource::new(Arc::new(StripeSubscriptionSource::new(stripe)));
    let sweep = ReconciliationSweep::new(Arc::new(source), processor);

    if config.reconcile_on_start {
        run_sweep(&sweep).await;
    }

    let scheduler = JobScheduler::new().await?;
    let job_sweep = sweep.clone();
    scheduler
        .add(Job::new_async(config.reconcile_cron.as_str(), move |_uuid, _lock| {
            let sweep = job_sweep.clone();
            Box::pin(async move {
                run_sweep(&sweep).await;
            })
        })?)
        .await?;
    scheduler.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    Ok(())
}
