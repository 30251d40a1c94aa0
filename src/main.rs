use log::{info, warn};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{App, HttpServer, web};

use riomgr::{AppConfig, AppError, AppState, Dialect, LineManager, SystemReport};

#[cfg(feature = "mock-gpio")]
use riomgr::MockBackend;
#[cfg(not(feature = "mock-gpio"))]
use riomgr::SystemBackend;

fn load_config() -> io::Result<AppConfig> {
    let explicit = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("RIOMGR_CONFIG").ok());

    let result = match explicit {
        Some(path) => AppConfig::load_from_file(&path),
        None if Path::new("config.json").exists() => AppConfig::load_from_file("config.json"),
        None => {
            info!("No config file given, using defaults");
            Ok(AppConfig::default())
        }
    };

    result.map_err(io::Error::other)
}

fn resolve_dialect(config: &AppConfig, report: &SystemReport) -> io::Result<Dialect> {
    if let Some(forced) = config.dialect {
        info!("Using configured {forced:?} tool dialect");
        return Ok(forced);
    }
    report.dialect.ok_or_else(|| {
        io::Error::other(AppError::UnsupportedSystem(format!(
            "cannot resolve gpiod tool dialect from version {:?}",
            report.tool_version
        )))
    })
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let config = Arc::new(load_config()?);

    let backend = {
        #[cfg(feature = "mock-gpio")]
        {
            Arc::new(MockBackend::default())
        }
        #[cfg(not(feature = "mock-gpio"))]
        {
            Arc::new(SystemBackend::new())
        }
    };

    let report = SystemReport::probe(backend.as_ref());
    info!(
        "System: model {:?}, OS {:?}, gpiod tools {:?}",
        report.model, report.os, report.tool_version
    );
    for note in &report.notes {
        warn!("{note}");
    }

    let dialect = resolve_dialect(&config, &report)?;
    let manager = Arc::new(LineManager::new(config.clone(), backend, dialect));
    let app_state = AppState {
        manager: manager.clone(),
    };

    let http_cfg = config.http.clone();
    let server = HttpServer::new(move || {
        let scope_path = http_cfg.path.clone();
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .service(app_state.api_scope(&scope_path))
    })
    .client_request_timeout(Duration::from_secs(config.http.timeout));

    let bind_addrs: String;
    let http_cfg = config.http.clone();
    let server = match (&http_cfg.unix_socket, &http_cfg.host) {
        (Some(socket_path), Some(host)) => {
            if Path::new(socket_path).exists() {
                fs::remove_file(socket_path)?;
            }
            bind_addrs = format!("{} and {}", socket_path, host);

            server.bind_uds(socket_path)?.bind_auto_h2c(host)?
        }
        (Some(socket_path), None) => {
            if Path::new(socket_path).exists() {
                fs::remove_file(socket_path)?;
            }
            bind_addrs = socket_path.clone();

            server.bind_uds(socket_path)?
        }
        (None, Some(host)) => {
            bind_addrs = host.clone();

            server.bind_auto_h2c(host)?
        }
        (None, None) => {
            return Err(io::Error::other(
                "Config error: either 'unix_socket' or 'host' must be specified",
            ));
        }
    };

    info!("Starting server on {}...", bind_addrs);

    let served = server.run().await;

    let closed = manager.close_all().await;
    info!("Shut down, released {closed} line(s)");

    served
}
