use actix_web::{web, App, HttpServer};
use clap::Parser;

use lxd_gateway::config::GatewayConfig;
use lxd_gateway::server::{config_routes, AppState};
use lxd_gateway::util::{cors_config_from_env, cors_default_headers, init_tracing};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Env files must be loaded before clap reads its env fallbacks.
    init_tracing();
    let cfg = GatewayConfig::parse();

    let state = web::Data::new(AppState::from_config(&cfg)?);
    tracing::info!(
        bind = %cfg.bind_addr,
        upstream = %cfg.upstream_url,
        model = %cfg.model,
        "starting lxd-gateway"
    );

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(cors_config_from_env())
            .wrap(cors_default_headers())
            .configure(config_routes)
    })
    .bind(&cfg.bind_addr)?
    .run()
    .await?;

    Ok(())
}
