pub mod clock;
pub mod conflict;
pub mod lifecycle;
pub mod scheduling;
pub mod store;
pub mod supabase_store;
pub mod timezone;
