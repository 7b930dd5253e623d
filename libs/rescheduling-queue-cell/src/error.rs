use thiserror::Error;

use appointment_cell::models::AppointmentError;
use shared_models::error::AppError;

#[derive(Error, Debug, PartialEq)]
pub enum QueueError {
    #[error(transparent)]
    Appointment(#[from] AppointmentError),

    #[error("Invalid pagination: {0}")]
    InvalidPagination(String),
}

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Appointment(inner) => inner.into(),
            QueueError::InvalidPagination(_) => AppError::BadRequest(err.to_string()),
        }
    }
}
