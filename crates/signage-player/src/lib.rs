pub mod backend;
pub mod core;
pub mod diagnostics;
pub mod heartbeat;
pub mod http;
pub mod logging;
pub mod mpv;
pub mod pairing;
pub mod scheduler;
pub mod session;
pub mod status;
pub mod surface;
pub mod sync;
pub mod timer;
