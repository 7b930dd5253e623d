pub mod models;
pub mod services;
pub mod error;
pub mod handlers;
pub mod router;

pub use error::QueueError;
pub use services::queue::ReschedulingQueueService;
pub use router::rescheduling_queue_routes;
