pub mod attendance;
pub mod auth;
pub mod backup;
pub mod children;
pub mod core;
pub mod duties;
pub mod organizations;
pub mod users;
