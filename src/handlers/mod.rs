pub mod health_handlers;
pub mod kvs_handlers;
pub mod object_handlers;
