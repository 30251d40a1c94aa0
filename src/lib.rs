pub mod backend;
pub mod config;
pub mod dialect;
pub mod error;
pub mod events;
pub mod line;
pub mod monitor;
pub mod pwm;
pub mod routes;

pub use backend::{LineBackend, MockBackend, SystemBackend, SystemReport};
pub use config::{AppConfig, Bias, EdgeDetect, HttpConfig, LineMode};
pub use dialect::Dialect;
pub use error::AppError;
pub use events::{EventHandler, EventHub};
pub use line::{LineDescriptor, LineHandle, LineManager, LineOptions, LineStatus, READ_FAILED};
pub use monitor::{Edge, EdgeCallback, EdgeEvent, MonitorOptions};
pub use pwm::{PwmOptions, TimeUnit};
pub use routes::AppState;
