//! Procedural macros for Keel ORM.
//!
//! `#[derive(Model)]` turns a struct with named fields into a
//! `keel_orm::Model`: it builds (once) and registers the model's
//! `ModelSchema`, and converts between the struct and a `Record`.
//!
//! ```rust,ignore
//! #[derive(Debug, Model)]
//! #[orm(table = "users")]
//! #[orm(has_many(name = "courses", model = "Course", foreign_key = "user_id"))]
//! #[orm(many_to_many(name = "tags", model = "Tag", through = "user_tags"))]
//! struct User {
//!     #[orm(primary_key, auto_increment)]
//!     id: Option<i32>,
//!     #[orm(size = 50, unique, index)]
//!     username: String,
//!     #[orm(default = true)]
//!     is_active: bool,
//!     #[orm(default_now)]
//!     created_at: Option<NaiveDateTime>,
//! }
//! ```
//!
//! Model-level attributes:
//!
//! | Attribute | Meaning |
//! |---|---|
//! | `table = "…"` | table name (default: snake_case struct name + `s`) |
//! | `has_many(…)` | one-to-many; `foreign_key` defaults to `<struct>_id` |
//! | `has_one(…)` | one-to-one; `foreign_key` defaults to `<struct>_id` |
//! | `belongs_to(…)` | many-to-one; `foreign_key` defaults to `<model>_id` |
//! | `many_to_many(…)` | many-to-many; `through` is required |
//!
//! Relationship keys: `name`, `model`, `foreign_key`, `through`,
//! `related_name`, `source_column`, `target_column`.
//!
//! Field attributes: `primary_key`, `auto_increment`, `unique`, `index`,
//! `size = N`, `default = <literal>`, `default_now`, `kind = "<type>"`,
//! `description = "…"`.

use proc_macro::TokenStream;
use syn::{parse_macro_input, DeriveInput};

mod derive_model;
mod types;

#[proc_macro_derive(Model, attributes(orm))]
pub fn model_derive(input: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(input as DeriveInput);
    derive_model::expand(ast).unwrap_or_else(syn::Error::into_compile_error).into()
}
