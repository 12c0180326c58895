//! Command implementations for the tablekit CLI

pub mod entity;
pub mod table;

use anyhow::Result;
use serde::Serialize;

pub use entity::{run_create, run_delete, run_get, run_list, run_update};
pub use table::run_table;

/// Pretty JSON on stdout
pub(crate) fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
