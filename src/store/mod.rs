pub mod db;
pub mod models;

pub use db::{DbHandle, LecternDb, segment_id_for};
