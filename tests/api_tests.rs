use std::sync::Arc;

use actix_web::{App, test, web};
use riomgr::backend::MockBackend;
use riomgr::config::AppConfig;
use riomgr::dialect::Dialect;
use riomgr::line::LineManager;
use riomgr::routes::AppState;
use serde_json::Value;

fn sample_config() -> AppConfig {
    serde_json::from_str(
        r#"
        {
            "http": {
                "host": "localhost:8080",
                "path": "/api/v1",
                "timeout": 30
            },
            "chip": "gpiochip0",
            "lines": {
                "standard": [17, 27],
                "pwm": [18]
            },
            "event_history_capacity": 32
        }
        "#,
    )
    .expect("valid sample config")
}

fn sample_state() -> (Arc<MockBackend>, AppState<MockBackend>, String) {
    let cfg = Arc::new(sample_config());
    let backend = Arc::new(MockBackend::default());
    backend.set_line_config(18, "pwm0_chan2");
    let manager = Arc::new(LineManager::new(cfg.clone(), backend.clone(), Dialect::V2));
    (backend, AppState { manager }, cfg.http.path.clone())
}

#[actix_rt::test]
async fn allocate_then_list() {
    let (_, state, scope_path) = sample_state();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/v1/line/17")
        .set_payload(r#"{"mode":"output","value":1}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);

    let req = test::TestRequest::get().uri("/api/v1/lines").to_request();
    let lines: Vec<Value> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["line"], 17);
    assert_eq!(lines[0]["mode"], "output");
    assert_eq!(lines[0]["value"], 1);
    assert_eq!(lines[0]["status"], "allocated");
}

#[actix_rt::test]
async fn double_allocation_returns_409() {
    let (_, state, scope_path) = sample_state();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    for expected in [201, 409] {
        let req = test::TestRequest::post()
            .uri("/api/v1/line/27")
            .set_payload(r#"{"mode":"input"}"#)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), expected);
    }
}

#[actix_rt::test]
async fn unknown_line_returns_404() {
    let (_, state, scope_path) = sample_state();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let req = test::TestRequest::get().uri("/api/v1/line/999").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);

    let req = test::TestRequest::post()
        .uri("/api/v1/line/17")
        .set_payload(r#"{"mode":"pwm"}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
    let body: Value = test::read_body_json(resp).await;
    assert!(body["error"].as_str().unwrap().contains("pwm"));
}

#[actix_rt::test]
async fn wrong_method_returns_405() {
    let (_, state, scope_path) = sample_state();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let req = test::TestRequest::put().uri("/api/v1/line/17").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 405);

    let req = test::TestRequest::get()
        .uri("/api/v1/line/17/duty")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 405);
}

#[actix_rt::test]
async fn write_and_read_values() {
    let (backend, state, scope_path) = sample_state();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    for (line, mode) in [(17, "output"), (27, "input")] {
        let req = test::TestRequest::post()
            .uri(&format!("/api/v1/line/{line}"))
            .set_payload(format!(r#"{{"mode":"{mode}"}}"#))
            .to_request();
        assert!(test::call_service(&app, req).await.status().is_success());
    }

    let req = test::TestRequest::post()
        .uri("/api/v1/line/17/value")
        .set_payload("1")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    assert_eq!(backend.level(17), Some(1));

    backend.set_level(27, 1);
    let req = test::TestRequest::get()
        .uri("/api/v1/line/27/value")
        .to_request();
    let body = test::call_and_read_body(&app, req).await;
    assert_eq!(body, "1");

    // inputs cannot be written
    let req = test::TestRequest::post()
        .uri("/api/v1/line/27/value")
        .set_payload("1")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
}

#[actix_rt::test]
async fn value_on_free_line_is_gone() {
    let (_, state, scope_path) = sample_state();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let req = test::TestRequest::get()
        .uri("/api/v1/line/17/value")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 410);
}

#[actix_rt::test]
async fn pwm_duty_by_percent_and_nanos() {
    let (_, state, scope_path) = sample_state();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/v1/line/18")
        .set_payload(
            r#"{"mode":"pwm","pwm":{"period":20000,"duty_min":500,"duty_max":2500,"export_settle_ms":0}}"#,
        )
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);

    let req = test::TestRequest::post()
        .uri("/api/v1/line/18/duty")
        .set_payload(r#"{"percent":50}"#)
        .to_request();
    let resp: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(resp["duty_ns"], 1_500_000);

    let req = test::TestRequest::post()
        .uri("/api/v1/line/18/duty")
        .set_payload(r#"{"nanos":99999999}"#)
        .to_request();
    let resp: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(resp["duty_ns"], 2_500_000);

    let req = test::TestRequest::post()
        .uri("/api/v1/line/18/duty")
        .set_payload(r#"{"percent":150}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    let req = test::TestRequest::get().uri("/api/v1/line/18").to_request();
    let desc: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(desc["pwm"]["duty_ns"], 2_500_000);
}

#[actix_rt::test]
async fn monitored_events_reach_history() {
    let (backend, state, scope_path) = sample_state();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/v1/line/27")
        .set_payload(r#"{"mode":"input","bias":"pull-up"}"#)
        .to_request();
    assert!(test::call_service(&app, req).await.status().is_success());

    let req = test::TestRequest::post()
        .uri("/api/v1/line/27/monitor")
        .set_payload(r#"{"edge":"falling"}"#)
        .to_request();
    let desc: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(desc["monitor"]["edge"], "falling");

    // empty until something arrives
    let req = test::TestRequest::get()
        .uri("/api/v1/line/27/event")
        .to_request();
    let body = test::call_and_read_body(&app, req).await;
    assert!(body.is_empty());

    assert!(backend.emit("1.5 falling \"GPIO27\"\n"));

    let req = test::TestRequest::get()
        .uri("/api/v1/line/27/event")
        .to_request();
    let event: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(event["line"], 27);
    assert_eq!(event["edge"], "falling");

    let req = test::TestRequest::get()
        .uri("/api/v1/line/27/events?limit=5")
        .to_request();
    let events: Vec<Value> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(events.len(), 1);

    let req = test::TestRequest::post()
        .uri("/api/v1/line/27/monitor")
        .set_payload(r#"{"edge":"upwards"}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
}

#[actix_rt::test]
async fn close_frees_the_line() {
    let (_, state, scope_path) = sample_state();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/v1/line/17")
        .set_payload(r#"{"mode":"output"}"#)
        .to_request();
    assert!(test::call_service(&app, req).await.status().is_success());

    let req = test::TestRequest::delete()
        .uri("/api/v1/line/17")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 204);

    let req = test::TestRequest::get().uri("/api/v1/line/17").to_request();
    let desc: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(desc["status"], "free");

    let req = test::TestRequest::delete()
        .uri("/api/v1/line/17")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 410);
}

#[actix_rt::test]
async fn system_and_line_config() {
    let (_, state, scope_path) = sample_state();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let req = test::TestRequest::get().uri("/api/v1/system").to_request();
    let report: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(report["dialect"], "v2");
    assert_eq!(report["tested"], true);

    let req = test::TestRequest::get()
        .uri("/api/v1/line/18/config")
        .to_request();
    let config: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(config["config"], "pwm0_chan2");
}
