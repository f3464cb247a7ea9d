//! Stateless repositories, one per table group. Every method takes a
//! `&Connection` so callers decide the transaction boundaries.

pub mod backup;
pub mod blob;
pub mod collaborator;
pub mod conversation;
pub mod event;
pub mod invite;
