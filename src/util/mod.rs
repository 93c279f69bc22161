pub mod logging;
pub mod pidfile;
