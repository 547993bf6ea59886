// TuBondi widget backend server
// Keeps home-screen transit widgets fed with upcoming bus arrivals: session
// client against the legacy TuBondi backend, per-widget refresh scheduling,
// render-state persistence for the widget surface and near-arrival alerts.

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpResponse, HttpServer};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;

use tubondi_widget::arrival_notifier::{ArrivalNotifier, ConsoleNotificationSink};
use tubondi_widget::refresh_pipeline::RefreshPipeline;
use tubondi_widget::tubondi_api_models::TuBondiClient;
use tubondi_widget::widget_store::{now_millis, WidgetConfiguration, WidgetStore};

const SCHEDULER_TICK_SECS: u64 = 60;
const INITIAL_BACKOFF_SECS: u64 = 30;
const MAX_BACKOFF_SECS: u64 = 900;

#[derive(Clone)]
struct AppState {
    client: Arc<TuBondiClient>,
    store: WidgetStore,
    notifier: Arc<ArrivalNotifier>,
    pipeline: Arc<RefreshPipeline>,
}

#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
    timestamp: i64,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Self {
        ApiResponse {
            success: true,
            data: Some(data),
            error: None,
            timestamp: now_millis(),
        }
    }

    fn error(message: String) -> Self {
        ApiResponse {
            success: false,
            data: None,
            error: Some(message),
            timestamp: now_millis(),
        }
    }
}

#[derive(Deserialize)]
struct ConfQuery {
    conf: Option<String>,
}

#[derive(Deserialize)]
struct VehiclesQuery {
    conf: Option<String>,
    parada: Option<String>,
}

// ============================================================================
// Catalog & Diagnostic Endpoints (proxied to the TuBondi backend)
// ============================================================================

async fn get_lines(state: web::Data<AppState>, query: web::Query<ConfQuery>) -> HttpResponse {
    let client = state.client.clone();
    let conf = query.conf.clone();
    match tokio::task::spawn_blocking(move || client.get_lines_and_routes(conf.as_deref())).await {
        Ok(Ok(payload)) => {
            println!("🚌 Lines catalog requested: {} lines", payload.lineas.len());
            HttpResponse::Ok().json(ApiResponse::success(payload))
        }
        Ok(Err(e)) => {
            eprintln!("❌ Failed to fetch lines catalog: {}", e);
            HttpResponse::InternalServerError().json(ApiResponse::<String>::error(e.to_string()))
        }
        Err(e) => {
            eprintln!("❌ Lines catalog task panicked: {}", e);
            HttpResponse::InternalServerError()
                .json(ApiResponse::<String>::error("Catalog task panicked".to_string()))
        }
    }
}

async fn get_route_stops(
    state: web::Data<AppState>,
    path: web::Path<(i32, i32)>,
    query: web::Query<ConfQuery>,
) -> HttpResponse {
    let (ruta_id, cliente_id) = path.into_inner();
    let client = state.client.clone();
    let conf = query.conf.clone();
    match tokio::task::spawn_blocking(move || {
        client.fetch_stops_for_route(ruta_id, cliente_id, conf.as_deref())
    })
    .await
    {
        Ok(Ok(stops)) => {
            println!("📍 Stops requested for route {}: {} stops", ruta_id, stops.len());
            HttpResponse::Ok().json(ApiResponse::success(stops))
        }
        Ok(Err(e)) => {
            eprintln!("❌ Failed to fetch stops for route {}: {}", ruta_id, e);
            HttpResponse::InternalServerError().json(ApiResponse::<String>::error(e.to_string()))
        }
        Err(e) => {
            eprintln!("❌ Route stops task panicked: {}", e);
            HttpResponse::InternalServerError()
                .json(ApiResponse::<String>::error("Route stops task panicked".to_string()))
        }
    }
}

async fn get_vehicles_by_route(
    state: web::Data<AppState>,
    path: web::Path<(i32, i32)>,
    query: web::Query<VehiclesQuery>,
) -> HttpResponse {
    let (ruta_id, cliente_id) = path.into_inner();
    let client = state.client.clone();
    let conf = query.conf.clone();
    let parada = query.parada.clone();
    match tokio::task::spawn_blocking(move || {
        client.query_vehicles_by_route(ruta_id, cliente_id, parada.as_deref(), conf.as_deref())
    })
    .await
    {
        Ok(Ok(body)) => HttpResponse::Ok()
            .content_type("text/plain; charset=utf-8")
            .body(body),
        Ok(Err(e)) => {
            eprintln!("❌ Vehicle query failed for route {}: {}", ruta_id, e);
            HttpResponse::InternalServerError().json(ApiResponse::<String>::error(e.to_string()))
        }
        Err(e) => {
            eprintln!("❌ Vehicle query task panicked: {}", e);
            HttpResponse::InternalServerError()
                .json(ApiResponse::<String>::error("Vehicle query task panicked".to_string()))
        }
    }
}

async fn get_view_bounds(state: web::Data<AppState>, query: web::Query<ConfQuery>) -> HttpResponse {
    let client = state.client.clone();
    let conf = query.conf.clone();
    match tokio::task::spawn_blocking(move || client.get_view_bounds(conf.as_deref())).await {
        Ok(Ok(body)) => HttpResponse::Ok()
            .content_type("text/plain; charset=utf-8")
            .body(body),
        Ok(Err(e)) => {
            eprintln!("❌ View bounds query failed: {}", e);
            HttpResponse::InternalServerError().json(ApiResponse::<String>::error(e.to_string()))
        }
        Err(e) => {
            eprintln!("❌ View bounds task panicked: {}", e);
            HttpResponse::InternalServerError()
                .json(ApiResponse::<String>::error("View bounds task panicked".to_string()))
        }
    }
}

// ============================================================================
// Widget Configuration Endpoints
// ============================================================================

async fn list_configs(state: web::Data<AppState>) -> HttpResponse {
    let store = state.store.clone();
    match tokio::task::spawn_blocking(move || store.all_configurations()).await {
        Ok(Ok(configs)) => {
            println!("📋 Configurations requested: {} total", configs.len());
            HttpResponse::Ok().json(ApiResponse::success(configs))
        }
        Ok(Err(e)) => {
            eprintln!("❌ Failed to enumerate configurations: {}", e);
            HttpResponse::InternalServerError().json(ApiResponse::<String>::error(e.to_string()))
        }
        Err(e) => {
            eprintln!("❌ Configuration listing task panicked: {}", e);
            HttpResponse::InternalServerError()
                .json(ApiResponse::<String>::error("Listing task panicked".to_string()))
        }
    }
}

async fn get_config(state: web::Data<AppState>, path: web::Path<i32>) -> HttpResponse {
    let app_widget_id = path.into_inner();
    let store = state.store.clone();
    match tokio::task::spawn_blocking(move || store.read_configuration(app_widget_id)).await {
        Ok(Ok(Some(config))) => HttpResponse::Ok().json(ApiResponse::success(config)),
        Ok(Ok(None)) => HttpResponse::NotFound().json(ApiResponse::<String>::error(format!(
            "No configuration for widget {}",
            app_widget_id
        ))),
        Ok(Err(e)) => {
            eprintln!("❌ Failed to read configuration {}: {}", app_widget_id, e);
            HttpResponse::InternalServerError().json(ApiResponse::<String>::error(e.to_string()))
        }
        Err(e) => {
            eprintln!("❌ Configuration read task panicked: {}", e);
            HttpResponse::InternalServerError()
                .json(ApiResponse::<String>::error("Read task panicked".to_string()))
        }
    }
}

async fn save_config(
    state: web::Data<AppState>,
    path: web::Path<i32>,
    body: web::Json<WidgetConfiguration>,
) -> HttpResponse {
    let app_widget_id = path.into_inner();
    let mut config = body.into_inner();
    config.app_widget_id = app_widget_id;

    if config.selections.is_empty() {
        return HttpResponse::BadRequest().json(ApiResponse::<String>::error(
            "Configuration needs at least one stop selection".to_string(),
        ));
    }

    let store = state.store.clone();
    let saved = config.clone();
    match tokio::task::spawn_blocking(move || store.save_configuration(&saved)).await {
        Ok(Ok(())) => {
            println!("💾 Configuration saved for widget {}", app_widget_id);
            // Immediate refresh for the saved widget, off the request path
            let pipeline = state.pipeline.clone();
            tokio::spawn(async move {
                if let Err(e) =
                    tokio::task::spawn_blocking(move || pipeline.refresh_widget(app_widget_id)).await
                {
                    eprintln!("❌ Post-save refresh task panicked: {}", e);
                }
            });
            HttpResponse::Ok().json(ApiResponse::success(config))
        }
        Ok(Err(e)) => {
            eprintln!("❌ Failed to save configuration {}: {}", app_widget_id, e);
            HttpResponse::InternalServerError().json(ApiResponse::<String>::error(e.to_string()))
        }
        Err(e) => {
            eprintln!("❌ Configuration save task panicked: {}", e);
            HttpResponse::InternalServerError()
                .json(ApiResponse::<String>::error("Save task panicked".to_string()))
        }
    }
}

async fn delete_config(state: web::Data<AppState>, path: web::Path<i32>) -> HttpResponse {
    let app_widget_id = path.into_inner();
    let store = state.store.clone();
    match tokio::task::spawn_blocking(move || store.remove_configuration(app_widget_id)).await {
        Ok(Ok(())) => {
            println!("🗑️  Configuration removed for widget {}", app_widget_id);
            HttpResponse::Ok().json(ApiResponse::success(format!(
                "Widget {} configuration removed",
                app_widget_id
            )))
        }
        Ok(Err(e)) => {
            eprintln!("❌ Failed to remove configuration {}: {}", app_widget_id, e);
            HttpResponse::InternalServerError().json(ApiResponse::<String>::error(e.to_string()))
        }
        Err(e) => {
            eprintln!("❌ Configuration removal task panicked: {}", e);
            HttpResponse::InternalServerError()
                .json(ApiResponse::<String>::error("Removal task panicked".to_string()))
        }
    }
}

// ============================================================================
// Render State, Refresh & Notification Endpoints
// ============================================================================

async fn get_widget_state(state: web::Data<AppState>, path: web::Path<i32>) -> HttpResponse {
    let app_widget_id = path.into_inner();
    let store = state.store.clone();
    match tokio::task::spawn_blocking(move || store.read_state(app_widget_id)).await {
        Ok(render_state) => HttpResponse::Ok().json(ApiResponse::success(render_state)),
        Err(e) => {
            eprintln!("❌ Render state task panicked: {}", e);
            HttpResponse::InternalServerError()
                .json(ApiResponse::<String>::error("State task panicked".to_string()))
        }
    }
}

async fn refresh_all(state: web::Data<AppState>) -> HttpResponse {
    println!("🔄 Manual refresh requested for all widgets...");
    let pipeline = state.pipeline.clone();
    match tokio::task::spawn_blocking(move || pipeline.refresh_all()).await {
        Ok(Ok(count)) => {
            println!("✓ Manual refresh completed: {} widget(s)", count);
            HttpResponse::Ok().json(ApiResponse::success(format!("{} widget(s) refreshed", count)))
        }
        Ok(Err(e)) => {
            eprintln!("⚠️  Manual refresh failed: {}", e);
            HttpResponse::InternalServerError().json(ApiResponse::<String>::error(e.to_string()))
        }
        Err(e) => {
            eprintln!("❌ Manual refresh task panicked: {}", e);
            HttpResponse::InternalServerError()
                .json(ApiResponse::<String>::error("Refresh task panicked".to_string()))
        }
    }
}

async fn refresh_one(state: web::Data<AppState>, path: web::Path<i32>) -> HttpResponse {
    let app_widget_id = path.into_inner();
    println!("🔄 Manual refresh requested for widget {}...", app_widget_id);
    let pipeline = state.pipeline.clone();
    match tokio::task::spawn_blocking(move || pipeline.refresh_widget(app_widget_id)).await {
        Ok(Ok(())) => HttpResponse::Ok().json(ApiResponse::success(format!(
            "Widget {} refreshed",
            app_widget_id
        ))),
        Ok(Err(e)) => {
            eprintln!("⚠️  Manual refresh failed for widget {}: {}", app_widget_id, e);
            HttpResponse::InternalServerError().json(ApiResponse::<String>::error(e.to_string()))
        }
        Err(e) => {
            eprintln!("❌ Manual refresh task panicked: {}", e);
            HttpResponse::InternalServerError()
                .json(ApiResponse::<String>::error("Refresh task panicked".to_string()))
        }
    }
}

async fn silence_notifications(state: web::Data<AppState>) -> HttpResponse {
    let notifier = state.notifier.clone();
    match tokio::task::spawn_blocking(move || notifier.silence_one_hour()).await {
        Ok(Ok(())) => HttpResponse::Ok().json(ApiResponse::success(
            "Notifications silenced for one hour".to_string(),
        )),
        Ok(Err(e)) => {
            eprintln!("❌ Failed to silence notifications: {}", e);
            HttpResponse::InternalServerError().json(ApiResponse::<String>::error(e.to_string()))
        }
        Err(e) => {
            eprintln!("❌ Silence task panicked: {}", e);
            HttpResponse::InternalServerError()
                .json(ApiResponse::<String>::error("Silence task panicked".to_string()))
        }
    }
}

async fn get_stats(state: web::Data<AppState>) -> HttpResponse {
    let store = state.store.clone();
    match tokio::task::spawn_blocking(move || store.stats_summary()).await {
        Ok(stats) => {
            println!("📊 Stats requested");
            HttpResponse::Ok().json(ApiResponse::success(stats))
        }
        Err(e) => {
            eprintln!("❌ Stats task panicked: {}", e);
            HttpResponse::InternalServerError()
                .json(ApiResponse::<String>::error("Stats task panicked".to_string()))
        }
    }
}

async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "TuBondi Widget Backend",
        "version": "0.1.0",
        "timestamp": now_millis()
    }))
}

// ============================================================================
// Background Scheduler
// ============================================================================

async fn widget_refresh_task(pipeline: Arc<RefreshPipeline>) {
    let mut interval = time::interval(Duration::from_secs(SCHEDULER_TICK_SECS));
    let mut backoff_secs = INITIAL_BACKOFF_SECS;

    loop {
        interval.tick().await;

        let pipeline_clone = pipeline.clone();
        match tokio::task::spawn_blocking(move || pipeline_clone.refresh_due()).await {
            Ok(Ok(refreshed)) => {
                backoff_secs = INITIAL_BACKOFF_SECS;
                if refreshed > 0 {
                    println!("🔄 Scheduled refresh completed: {} widget(s)", refreshed);
                }
            }
            Ok(Err(e)) => {
                // Task-level failure (store unreadable); data errors never land here
                eprintln!(
                    "⚠️  Scheduled refresh failed ({}), backing off {}s",
                    e, backoff_secs
                );
                time::sleep(Duration::from_secs(backoff_secs)).await;
                backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
            }
            Err(e) => {
                eprintln!("❌ Scheduled refresh task panicked: {}", e);
                time::sleep(Duration::from_secs(backoff_secs)).await;
                backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
            }
        }
    }
}

// ============================================================================
// Server Setup
// ============================================================================

async fn run_server(state: AppState, port: u16) -> std::io::Result<()> {
    // Scheduler loop plus one immediate pass so freshly restarted widgets
    // do not sit on stale render state
    let scheduler_pipeline = state.pipeline.clone();
    tokio::spawn(async move {
        widget_refresh_task(scheduler_pipeline).await;
    });

    let startup_pipeline = state.pipeline.clone();
    tokio::spawn(async move {
        match tokio::task::spawn_blocking(move || startup_pipeline.refresh_all()).await {
            Ok(Ok(count)) => println!("✓ Startup refresh completed: {} widget(s)", count),
            Ok(Err(e)) => eprintln!("⚠️  Startup refresh failed: {}", e),
            Err(e) => eprintln!("❌ Startup refresh task panicked: {}", e),
        }
    });

    println!("\n🌐 Server running on: http://0.0.0.0:{}", port);
    println!(
        "🔄 Scheduler tick: every {}s (per-widget intervals, 15 min floor)\n",
        SCHEDULER_TICK_SECS
    );

    println!("📍 Available Routes:");
    println!("┌─────────────────────────────────────────────────────────────────┐");
    println!("│ Catalog & Diagnostics:                                          │");
    println!("│   GET  /api/tubondi/lines                  - Lines & routes     │");
    println!("│   GET  /api/tubondi/route/:r/:c/stops      - Stops of a route   │");
    println!("│   GET  /api/tubondi/vehicles/:r/:c         - Vehicle query      │");
    println!("│   GET  /api/tubondi/vista                  - View bounds        │");
    println!("├─────────────────────────────────────────────────────────────────┤");
    println!("│ Widgets:                                                        │");
    println!("│   GET  /api/widget/configs                 - All configurations │");
    println!("│   GET  /api/widget/config/:id              - One configuration  │");
    println!("│   PUT  /api/widget/config/:id              - Save configuration │");
    println!("│   DEL  /api/widget/config/:id              - Remove it          │");
    println!("│   GET  /api/widget/state/:id               - Render state       │");
    println!("│   GET  /api/widget/stats                   - Store statistics   │");
    println!("│   POST /api/widget/refresh                 - Refresh all        │");
    println!("│   POST /api/widget/refresh/:id             - Refresh one        │");
    println!("├─────────────────────────────────────────────────────────────────┤");
    println!("│ Notifications:                                                  │");
    println!("│   POST /api/notifications/silence          - Mute for one hour  │");
    println!("│   GET  /health                             - Health check       │");
    println!("└─────────────────────────────────────────────────────────────────┘\n");

    HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            .route("/health", web::get().to(health_check))
            .service(
                web::scope("/api/tubondi")
                    .route("/lines", web::get().to(get_lines))
                    .route("/route/{ruta}/{cliente}/stops", web::get().to(get_route_stops))
                    .route("/vehicles/{ruta}/{cliente}", web::get().to(get_vehicles_by_route))
                    .route("/vista", web::get().to(get_view_bounds)),
            )
            .service(
                web::scope("/api/widget")
                    .route("/configs", web::get().to(list_configs))
                    .route("/config/{id}", web::get().to(get_config))
                    .route("/config/{id}", web::put().to(save_config))
                    .route("/config/{id}", web::delete().to(delete_config))
                    .route("/state/{id}", web::get().to(get_widget_state))
                    .route("/stats", web::get().to(get_stats))
                    .route("/refresh", web::post().to(refresh_all))
                    .route("/refresh/{id}", web::post().to(refresh_one)),
            )
            .route("/api/notifications/silence", web::post().to(silence_notifications))
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> std::io::Result<()> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║    🚌 TuBondi Widget Backend                               ║");
    println!("║    Session client + refresh pipeline + arrival alerts      ║");
    println!("╚════════════════════════════════════════════════════════════╝\n");

    let base_url = std::env::var("TUBONDI_BASE_URL")
        .unwrap_or_else(|_| TuBondiClient::DEFAULT_BASE_URL.to_string());
    let conf = std::env::var("TUBONDI_CONF")
        .unwrap_or_else(|_| TuBondiClient::DEFAULT_CONF.to_string());
    let port = std::env::var("TUBONDI_PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(8080);

    println!("📡 Backend: {} (conf: {})", base_url, conf);

    let client = match TuBondiClient::with_base_url(&base_url, &conf) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("❌ Failed to create TuBondi client: {}", e);
            std::process::exit(1);
        }
    };

    let store = match std::env::var("TUBONDI_DATA_DIR") {
        Ok(dir) => WidgetStore::new(PathBuf::from(dir)),
        Err(_) => WidgetStore::open_default(),
    };
    let store = match store {
        Ok(store) => store,
        Err(e) => {
            eprintln!("❌ Failed to open widget store: {}", e);
            std::process::exit(1);
        }
    };
    println!("💾 Widget store: {:?}", store.dir());

    let notifier = Arc::new(ArrivalNotifier::new(
        store.dir().join("arrivals_notifier.json"),
        Box::new(ConsoleNotificationSink),
    ));

    let pipeline = Arc::new(RefreshPipeline::new(
        client.clone(),
        store.clone(),
        notifier.clone(),
    ));

    let state = AppState {
        client,
        store,
        notifier,
        pipeline,
    };

    actix_web::rt::System::new().block_on(run_server(state, port))
}
