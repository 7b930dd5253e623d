pub mod handlers;
pub mod models;
pub mod router;
pub mod services;
pub mod testing;

pub use router::appointment_routes;
pub use services::scheduling::{SchedulingService, SchedulingState};
