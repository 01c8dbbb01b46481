pub mod error;
pub mod executor;
pub mod gateway;
pub mod registry;
pub mod remote;
pub mod service;
pub mod template;

pub use error::LidarError;
pub use executor::TaskExecutor;
pub use gateway::EventDrain;
pub use registry::{EventSink, TaskRegistry, TaskState};
pub use remote::{RemoteConfig, RemoteConnector, RemoteError, Transport};
pub use service::{Submission, TaskService, validate_filename};
pub use template::{CommandTemplate, TemplateSet};
