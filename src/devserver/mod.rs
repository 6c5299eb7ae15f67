mod detect;
mod ports;
mod supervisor;

pub use detect::{detect_docker_services, detect_npm_scripts, detect_servers, DetectedServer};
pub use ports::PortAllocator;
pub use supervisor::{DevServerError, DevServerSupervisor, StartServerOptions};
