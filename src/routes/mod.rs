use actix_web::{get, web, HttpResponse, Responder};

pub mod wsroute;

#[get("/health")]
async fn health() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(health).service(wsroute::ws_handler);
}
