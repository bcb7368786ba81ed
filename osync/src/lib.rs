//! `osync` synchronizes objects between two storages, optionally spreading the transfers over
//! workers on other hosts.

pub mod cluster;
pub mod uri;
