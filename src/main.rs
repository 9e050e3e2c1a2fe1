use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use messaging_gateway::auth::{JwtVerifier, PgProfileLookup, ProfileLookup, TokenVerifier};
use messaging_gateway::services::notification_service::NotificationService;
use messaging_gateway::storage::postgres::{PgMessageStore, PgNotificationStore};
use messaging_gateway::storage::{MessageStore, NotificationStore};
use messaging_gateway::websocket::GroupRegistry;
use messaging_gateway::{config, db, error, logging, migrations, routes, state::AppState};
use std::sync::Arc;

#[actix_web::main]
async fn main() -> Result<(), error::AppError> {
    logging::init_tracing();
    let cfg = Arc::new(config::Config::from_env()?);

    let db = db::init_pool(&cfg.database_url)
        .await
        .map_err(|e| error::AppError::StartServer(format!("db: {e}")))?;

    // Embedded migrations are idempotent; a schema drift is fatal at startup
    migrations::run_all(&db)
        .await
        .map_err(|e| error::AppError::StartServer(format!("database migrations failed: {e}")))?;

    let registry = GroupRegistry::new();
    let messages: Arc<dyn MessageStore> = Arc::new(PgMessageStore::new(db.clone()));
    let notification_store: Arc<dyn NotificationStore> =
        Arc::new(PgNotificationStore::new(db.clone()));
    let notifications = Arc::new(NotificationService::new(
        notification_store,
        registry.clone(),
    ));
    let verifier: Arc<dyn TokenVerifier> = Arc::new(JwtVerifier::new(&cfg.jwt_secret));
    let profiles: Arc<dyn ProfileLookup> = Arc::new(PgProfileLookup::new(db.clone()));

    let state = AppState {
        config: cfg.clone(),
        messages,
        notifications,
        registry,
        verifier,
        profiles,
    };

    let bind_addr = format!("0.0.0.0:{}", cfg.port);
    tracing::info!(%bind_addr, "starting messaging-gateway");

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(Cors::permissive())
            .configure(routes::configure_routes)
    })
    .bind(&bind_addr)
    .map_err(|e| error::AppError::StartServer(e.to_string()))?
    .run()
    .await
    .map_err(|e| error::AppError::StartServer(e.to_string()))?;

    Ok(())
}
