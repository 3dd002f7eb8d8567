//! Storefront demo.
//!
//! Signs a user in, loads an order twice concurrently (one backend round
//! trip), lists orders through the view-model, then expires the session.
//!
//! Run with:
//! ```bash
//! RUST_LOG=info,storefront=debug cargo run -p storefront
//! ```

use command_flow_core::environment::SystemClock;
use command_flow_core::error::EffectError;
use command_flow_core::event_bus::Principal;
use command_flow_runtime::metrics::MetricsRecorder;
use std::sync::Arc;
use std::time::Duration;
use storefront::Storefront;
use storefront::config::StorefrontConfig;
use storefront::orders::OrderLine;
use storefront::session::InMemoryNavigator;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,command_flow_runtime=debug,storefront=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Storefront demo");

    let mut recorder = MetricsRecorder::new();
    recorder.install()?;

    let config = StorefrontConfig::from_env()?;
    let navigator = InMemoryNavigator::at("orders/o-1001");
    let app = Storefront::new(config, Arc::new(SystemClock), Arc::new(navigator.clone()))?;

    // Seed the backend
    let api = app.order_api();
    api.place_order(
        "o-1001",
        "Ada Lovelace",
        vec![
            OrderLine {
                sku: "BOOK-001".into(),
                quantity: 2,
                unit_price_cents: 2_499,
            },
            OrderLine {
                sku: "PEN-010".into(),
                quantity: 5,
                unit_price_cents: 199,
            },
        ],
    );
    api.place_order(
        "o-1002",
        "Grace Hopper",
        vec![OrderLine {
            sku: "LAMP-200".into(),
            quantity: 1,
            unit_price_cents: 4_900,
        }],
    );
    app.permission_api().grant("ada", ["orders.read", "orders.write"]);

    // Sign in; permissions load in the background
    app.sign_in(Principal::authenticated("u-1", "ada").with_roles(["customer"]));

    // The second load is dropped while the first is in flight, and the first
    // survives one transient backend failure
    api.fail_next(EffectError::http(503, "Service Unavailable"));
    let first = app.load_order("o-1001")?;
    let second = app.load_order("o-1001")?;
    tracing::info!(
        first_started = first.iter().any(|h| h.is_started()),
        second_started = second.iter().any(|h| h.is_started()),
        "Dispatched order loads"
    );

    let settle = app.config().api_latency * 4 + app.config().order_retry.initial_delay;
    tokio::time::sleep(settle).await;

    if let Some(order) = app.orders().order("o-1001") {
        tracing::info!(
            number = %order.header.number,
            lines = order.lines.len(),
            total_cents = order.total_cents(),
            "Order loaded"
        );
    }
    tracing::info!(
        backend_calls = api.calls(),
        can_write = app.permissions().has("orders.write"),
        "Backend state"
    );

    // Order list screen
    let screen = app.orders_view_model();
    let _render = screen.base().on_state_changed(|| tracing::debug!("Order list re-render"));
    screen.load_orders()?;
    tokio::time::sleep(app.config().api_latency * 2).await;
    for entry in screen.orders().data().value() {
        tracing::info!(
            number = %entry.number,
            customer = %entry.customer_name,
            amount_cents = entry.amount_cents,
            "Order"
        );
    }
    screen.dispose();

    // The same list, reloaded into the order store through a bus trigger
    app.refresh_orders();
    tokio::time::sleep(app.config().api_latency * 2).await;
    tracing::info!(
        listed = app.orders().state().data().with(|s| s.overview.len()),
        "Order store refreshed"
    );

    // Session expiry sends the user to the login page
    app.expire_session();
    for navigation in navigator.navigations() {
        tracing::info!(path = %navigation.path, replace = navigation.replace, "Navigated");
    }

    app.sign_out();
    tokio::time::sleep(Duration::from_millis(10)).await;
    app.shutdown();

    if let Some(text) = recorder.render() {
        tracing::info!("Metrics:\n{text}");
    }
    tracing::info!("Storefront demo finished");

    Ok(())
}
