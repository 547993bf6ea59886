// End-to-end refresh cycles against a scripted backend: per-widget
// isolation, render-state contents, and notification dedup across cycles.

use actix_web::{web, App, HttpResponse, HttpServer};
use std::collections::VecDeque;
use std::sync::{mpsc, Arc, Mutex};

use tubondi_widget::arrival_notifier::{ArrivalNotifier, NotificationSink};
use tubondi_widget::refresh_pipeline::RefreshPipeline;
use tubondi_widget::tubondi_api_models::{Stop, StopSelection, TuBondiClient};
use tubondi_widget::widget_store::{WidgetConfiguration, WidgetStore};

#[derive(Clone)]
struct CannedResponse {
    status: u16,
    body: String,
    session_cookie: Option<String>,
}

#[derive(Clone)]
struct ScriptedBackend {
    responses: Arc<Mutex<VecDeque<CannedResponse>>>,
}

async fn serve_next(script: web::Data<ScriptedBackend>) -> HttpResponse {
    let canned = script.responses.lock().unwrap().pop_front().unwrap_or(CannedResponse {
        status: 500,
        body: String::new(),
        session_cookie: None,
    });

    let status = actix_web::http::StatusCode::from_u16(canned.status).unwrap();
    let mut builder = HttpResponse::build(status);
    if let Some(session_id) = &canned.session_cookie {
        builder.insert_header(("Set-Cookie", format!("PHPSESSID={}; path=/", session_id)));
    }
    builder
        .content_type("application/json; charset=utf-8")
        .body(canned.body)
}

fn start_backend(responses: Vec<CannedResponse>) -> String {
    let script = ScriptedBackend {
        responses: Arc::new(Mutex::new(responses.into())),
    };

    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        actix_web::rt::System::new().block_on(async move {
            let data = web::Data::new(script);
            let server = HttpServer::new(move || {
                App::new()
                    .app_data(data.clone())
                    .default_service(web::to(serve_next))
            })
            .workers(1)
            .bind(("127.0.0.1", 0))
            .expect("failed to bind scripted backend");
            let port = server.addrs()[0].port();
            tx.send(port).unwrap();
            server.run().await.unwrap();
        });
    });

    let port = rx.recv().expect("scripted backend never started");
    format!("http://127.0.0.1:{}", port)
}

fn cookie(session_id: &str) -> CannedResponse {
    CannedResponse {
        status: 200,
        body: String::new(),
        session_cookie: Some(session_id.to_string()),
    }
}

fn body(json: &str) -> CannedResponse {
    CannedResponse {
        status: 200,
        body: json.to_string(),
        session_cookie: None,
    }
}

fn failure(status: u16) -> CannedResponse {
    CannedResponse {
        status,
        body: String::new(),
        session_cookie: None,
    }
}

#[derive(Clone, Default)]
struct RecordingSink {
    events: Arc<Mutex<Vec<String>>>,
}

impl NotificationSink for RecordingSink {
    fn notify(&self, key: &str, _title: &str, _body: &str) {
        self.events.lock().unwrap().push(key.to_string());
    }
}

fn widget_config(id: i32, stop_code: &str) -> WidgetConfiguration {
    WidgetConfiguration {
        app_widget_id: id,
        selections: vec![StopSelection {
            stop: Stop {
                code: stop_code.to_string(),
                name: format!("Parada {}", stop_code),
                latitude: None,
                longitude: None,
                lines: Vec::new(),
            },
            selected_lines: Vec::new(),
        }],
        refresh_interval_minutes: 15,
        notifications_enabled: true,
        near_threshold_minutes: 5,
        high_contrast: false,
        conf: "cbaciudad".to_string(),
    }
}

fn pipeline_for(
    base_url: &str,
    store_dir: &std::path::Path,
) -> (RefreshPipeline, WidgetStore, RecordingSink) {
    let client = Arc::new(TuBondiClient::with_base_url(base_url, "cbaciudad").unwrap());
    let store = WidgetStore::new(store_dir.to_path_buf()).unwrap();
    let sink = RecordingSink::default();
    let notifier = Arc::new(ArrivalNotifier::new(
        store_dir.join("arrivals_notifier.json"),
        Box::new(sink.clone()),
    ));
    let pipeline = RefreshPipeline::new(client, store.clone(), notifier);
    (pipeline, store, sink)
}

const NEAR_ARRIVAL_BODY: &str = r#"{
    "arribos": [
        {"linea_nombre": "62", "codigo_parada": "0002", "minutos_arribo": 3},
        {"linea_nombre": "71", "codigo_parada": "0002", "minutos_arribo": 40}
    ],
    "parada": {"codigo": "0002", "descripcion": "Plaza San Martín"}
}"#;

#[test]
fn one_failing_widget_does_not_block_the_batch() {
    // Widget 1 exhausts both transport attempts and drops its session;
    // widget 2 bootstraps anew and succeeds
    let base_url = start_backend(vec![
        cookie("s1"),
        failure(500),
        cookie("s2"),
        failure(500),
        cookie("s3"),
        body(NEAR_ARRIVAL_BODY),
    ]);
    let dir = tempfile::tempdir().unwrap();
    let (pipeline, store, _sink) = pipeline_for(&base_url, dir.path());

    store.save_configuration(&widget_config(1, "0001")).unwrap();
    store.save_configuration(&widget_config(2, "0002")).unwrap();

    let refreshed = pipeline.refresh_all().unwrap();
    assert_eq!(refreshed, 2);

    let failed = store.read_state(1);
    assert!(failed.arrivals.is_empty());
    assert!(failed.error_message.is_some());
    assert!(failed.last_updated_epoch_millis > 0);

    let succeeded = store.read_state(2);
    assert!(succeeded.error_message.is_none());
    assert_eq!(succeeded.arrivals.len(), 1);
    assert_eq!(succeeded.arrivals[0].arrivals.len(), 2);
    assert!(succeeded.last_updated_epoch_millis > 0);
}

#[test]
fn failed_cycles_do_not_notify() {
    let base_url = start_backend(vec![
        cookie("s1"),
        failure(500),
        cookie("s2"),
        failure(500),
    ]);
    let dir = tempfile::tempdir().unwrap();
    let (pipeline, store, sink) = pipeline_for(&base_url, dir.path());

    store.save_configuration(&widget_config(1, "0001")).unwrap();
    pipeline.refresh_all().unwrap();

    assert!(sink.events.lock().unwrap().is_empty());
}

#[test]
fn near_arrivals_notify_once_across_cycles() {
    let base_url = start_backend(vec![
        cookie("s1"),
        body(NEAR_ARRIVAL_BODY),
        body(NEAR_ARRIVAL_BODY),
    ]);
    let dir = tempfile::tempdir().unwrap();
    let (pipeline, store, sink) = pipeline_for(&base_url, dir.path());

    store.save_configuration(&widget_config(2, "0002")).unwrap();

    // Two refreshes inside the dedup window: line 62 (3 min) fires once,
    // line 71 (40 min) never crosses the threshold
    pipeline.refresh_all().unwrap();
    pipeline.refresh_all().unwrap();

    let events = sink.events.lock().unwrap();
    assert_eq!(events.as_slice(), ["2-0002-62"]);
}

#[test]
fn refreshing_an_unconfigured_widget_is_a_noop() {
    let base_url = start_backend(Vec::new());
    let dir = tempfile::tempdir().unwrap();
    let (pipeline, store, _sink) = pipeline_for(&base_url, dir.path());

    pipeline.refresh_widget(99).unwrap();
    assert_eq!(store.read_state(99).last_updated_epoch_millis, 0);
}

#[test]
fn due_widgets_refresh_and_fresh_ones_wait() {
    let base_url = start_backend(vec![cookie("s1"), body(NEAR_ARRIVAL_BODY)]);
    let dir = tempfile::tempdir().unwrap();
    let (pipeline, store, _sink) = pipeline_for(&base_url, dir.path());

    store.save_configuration(&widget_config(2, "0002")).unwrap();

    // Never refreshed: due immediately
    assert_eq!(pipeline.refresh_due().unwrap(), 1);
    // Freshly refreshed: nothing left to do this tick
    assert_eq!(pipeline.refresh_due().unwrap(), 0);
}
