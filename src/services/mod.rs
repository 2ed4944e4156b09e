//! Cross-cutting data-quality services (C8–C10): each persists its own
//! metadata inside a designated management connection and operates
//! through the same [`crate::registry::ConnectionRegistry`] every other
//! caller uses (spec §4.9–§4.11).

pub mod field_mapper;
pub mod history;
pub mod validation;
